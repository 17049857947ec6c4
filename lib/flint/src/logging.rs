pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds the root logger from a sloggers configuration section.
pub fn init(config: &LoggerConfig) -> Result<Logger, sloggers::Error> {
    config.build_logger()
}

/// Terminal logger used when the config file carries no logging section.
pub fn default_config() -> LoggerConfig {
    serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("Default logger configuration must parse")
}

/// Logger that drops everything. Used by tests and optional-logger call sites.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_builds() {
        let logger = init(&default_config()).unwrap();
        info!(logger, "logger built"; "context" => "test");
    }
}
