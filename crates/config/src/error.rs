//! Configuration error types.

use std::path::PathBuf;

/// Result type for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur while loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A configuration file could not be read
    #[error("failed to read {path}: {source}")]
    FileRead {
        /// Path that failed
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// TOML parsing failed
    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON parsing failed
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A setting is outside its valid range
    #[error("invalid setting {setting}: {reason}")]
    InvalidSetting {
        /// The offending setting
        setting: &'static str,
        /// Why it was rejected
        reason: String,
    },

    /// The genesis description is unusable
    #[error("invalid genesis: {0}")]
    InvalidGenesis(String),
}
