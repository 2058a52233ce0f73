pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Builds the terminal root logger used by the daemons. The level string
/// follows the configuration file ("trace", "debug", "info", "warning",
/// "error", "critical"); unknown values fall back to "info".
pub fn term_logger(level: &str) -> Logger {
    let severity = match level {
        "trace" => Severity::Trace,
        "debug" => Severity::Debug,
        "warning" => Severity::Warning,
        "error" => Severity::Error,
        "critical" => Severity::Critical,
        _ => Severity::Info,
    };

    let mut builder = TerminalLoggerBuilder::new();
    builder.level(severity);
    builder.destination(Destination::Stderr);

    builder.build().expect("Error building terminal logger")
}

/// Root logger that swallows everything. Components constructed without a
/// parent logger (mostly in tests) end up with this.
pub fn discard_logger() -> Logger {
    Logger::root(Discard, o!())
}
