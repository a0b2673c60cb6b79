// Fatal runtime errors follow the fail-stop design: report and die.
// Unwinding is not an option; these fire inside signal handlers too.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        eprintln!("[{}] fatal: {}", std::process::id(), format_args!($($arg)*));
        std::process::exit(1);
    }};
}
