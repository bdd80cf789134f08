//! Logging plumbing. The rest of the workspace consumes this module instead
//! of depending on slog directly, so the backend can be swapped in one place.

pub use slog::{debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::types::Severity;
use sloggers::{Build, Config, LoggerConfig};

/// Build a terminal logger writing to stderr. This is the default for
/// daemons started with `--no-daemon` and for one-shot tools.
pub fn terminal(level: Severity) -> Logger {
    sloggers::terminal::TerminalLoggerBuilder::new()
        .level(level)
        .destination(sloggers::terminal::Destination::Stderr)
        .build()
        .expect("terminal logger construction cannot fail")
}

/// Build a logger from a `[logging]` config section.
pub fn from_config(config: &LoggerConfig) -> Result<Logger, sloggers::Error> {
    config.build_logger()
}

/// A logger that throws everything away. Used by tests and as a placeholder
/// for components constructed without a logging context.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_toml_config() {
        let config: LoggerConfig = serdeconv::from_toml_str(
            r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
        )
        .unwrap();

        let log = from_config(&config).unwrap();
        info!(log, "logger built from config");
    }

    #[test]
    fn test_discard_is_usable() {
        let log = discard();
        debug!(log, "goes nowhere"; "key" => 1);
    }
}
