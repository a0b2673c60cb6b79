pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::{Config, LoggerConfig};

// Logger configuration template. The level placeholder is substituted from
// the DSM_LOG environment variable when present.
const CONFIG_TEMPLATE: &str = r#"
type = "terminal"
level = "%LEVEL%"
destination = "stderr"
"#;

const DEFAULT_LEVEL: &str = "info";

/// Builds the root logger for a process. The log level can be overridden
/// through the `DSM_LOG` environment variable (trace, debug, info, warning,
/// error, critical). An unparseable override falls back to the default.
pub fn init(process: &str) -> Logger {
    let level = std::env::var("DSM_LOG").unwrap_or_else(|_| DEFAULT_LEVEL.to_string());

    let root = build(&level)
        .or_else(|| build(DEFAULT_LEVEL))
        .expect("Broken embedded logger config");

    root.new(o!("process" => process.to_string()))
}

/// Logger that discards everything. Used by tests and embedded components
/// that were not handed a parent logger.
pub fn null() -> Logger {
    Logger::root(Discard, o!())
}

fn build(level: &str) -> Option<Logger> {
    let toml = CONFIG_TEMPLATE.replace("%LEVEL%", level);
    let config: LoggerConfig = serdeconv::from_toml_str(&toml).ok()?;
    config.build_logger().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_default_level() {
        assert!(build(DEFAULT_LEVEL).is_some());
    }

    #[test]
    fn test_build_bad_level_fails() {
        assert!(build("shouting").is_none());
    }

    #[test]
    fn test_null_logger_swallows() {
        let log = null();
        info!(log, "into the void"; "key" => 1);
    }
}
