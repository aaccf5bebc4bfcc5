pub use slog::{debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "info"
destination = "stderr"
"#;

#[derive(Debug)]
pub enum LogSetupError {
    Config(serdeconv::Error),
    Build(sloggers::Error),
}

impl From<serdeconv::Error> for LogSetupError {
    fn from(error: serdeconv::Error) -> Self {
        LogSetupError::Config(error)
    }
}

impl From<sloggers::Error> for LogSetupError {
    fn from(error: sloggers::Error) -> Self {
        LogSetupError::Build(error)
    }
}

/// Builds a root logger from a TOML logger description, e.g.
///
/// ```toml
/// type = "terminal"
/// level = "debug"
/// destination = "stderr"
/// ```
pub fn from_toml(config: &str) -> Result<Logger, LogSetupError> {
    let config: LoggerConfig = serdeconv::from_toml_str(config)?;
    let logger = config.build_logger()?;
    Ok(logger)
}

/// Builds the default terminal root logger.
pub fn init() -> Logger {
    from_toml(DEFAULT_CONFIG).expect("Default logging config must be valid")
}
