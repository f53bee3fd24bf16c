//! Error types for the stepping driver

use std::path::PathBuf;

use loadstep_gen::LoadGenError;
use thiserror::Error;

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors that stop a drive
#[derive(Error, Debug)]
pub enum DriverError {
    // === Configuration ===
    /// Starting concurrency is zero
    #[error("Start concurrency must be at least 1")]
    ZeroStart,

    /// Step increment is zero
    #[error("Step increment must be at least 1")]
    ZeroStep,

    /// Step duration is zero
    #[error("Time interval between steps must be greater than 0")]
    ZeroStepDuration,

    /// Ceiling does not leave room for a single step
    #[error("Client ceiling {ceiling} must be greater than start concurrency {start}")]
    CeilingBelowStart { start: usize, ceiling: usize },

    /// A latency SLA of zero can never be met
    #[error("SLA must be greater than 0 ms")]
    ZeroSla,

    /// The TOML configuration file could not be read
    #[error("Failed to read config file '{path}': {source}")]
    ConfigFile {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The TOML configuration file is malformed
    #[error("Invalid config file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // === Generator ===
    /// The generator rejected its configuration or failed to start
    #[error("Generator error: {0}")]
    Generator(#[from] LoadGenError),

    // === Measurement ===
    /// An external command used for CPU sampling failed
    #[error("Command '{command}' failed: {message}")]
    Command { command: String, message: String },

    /// CPU sampler output could not be parsed
    #[error("Unexpected CPU sampler output: {0}")]
    CpuParse(String),

    // === Reporting ===
    /// Report files could not be written
    #[error("Failed to write report '{path}': {source}")]
    Report {
        path: PathBuf,
        source: std::io::Error,
    },

    /// JSON encoding of the history failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DriverError {
    /// Check if the error is caused by the drive configuration
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::ZeroStart
                | Self::ZeroStep
                | Self::ZeroStepDuration
                | Self::CeilingBelowStart { .. }
                | Self::ZeroSla
                | Self::ConfigFile { .. }
                | Self::ConfigParse(_)
        ) || matches!(self, Self::Generator(e) if e.is_usage())
    }
}
