//! Error types for loopweave-core.
//!
//! Only loading (scenario documents, configuration, WAV probing) can fail.
//! The playback engine itself never returns errors; anomalies degrade to
//! unsynchronized playback or a logged no-op.

use thiserror::Error;

/// Result type alias for loopweave-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading LoopWeave inputs.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration file error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Scenario document is structurally invalid
    #[error("Scenario error: {0}")]
    Scenario(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// WAV header could not be read
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    /// Scenario JSON parsing error
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}
