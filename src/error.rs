//! Errors surfaced while loading the engine configuration.
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    /// The settings file could not be read
    #[error("impossible to read settings file '{path}'")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// The settings file is not valid JSON for [crate::DetourSettings]
    #[error("impossible to parse settings")]
    Parse(#[from] serde_json::Error),
    /// A value is outside of its allowed range
    #[error("invalid setting `{field}` for {scope}: {reason}")]
    Invalid {
        scope: String,
        field: &'static str,
        reason: String,
    },
}
