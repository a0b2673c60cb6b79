use std::time::SystemTime;

/// Returns the wall clock as fractional seconds since the unix epoch. Only
/// differences of two readings are meaningful.
#[inline]
pub fn wall_time() -> f64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("System clock predates the epoch")
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wall_time_nonzero() {
        assert!(wall_time() > 0.0);
    }

    #[test]
    fn test_wall_time_monotone_enough() {
        let a = wall_time();
        let b = wall_time();
        assert!(b >= a);
    }
}
