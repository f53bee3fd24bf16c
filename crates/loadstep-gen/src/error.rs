//! Error types for the traffic generator
//!
//! Only configuration problems surface as errors. Transport, protocol and
//! content failures during a run are absorbed into the run counters.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for generator operations
pub type Result<T> = std::result::Result<T, LoadGenError>;

/// Errors that abort the generator before any request is issued
#[derive(Error, Debug)]
pub enum LoadGenError {
    /// Neither a literal URL nor a URL file was given
    #[error("URL or URL file must be provided")]
    NoTarget,

    /// Both a request bound and a duration were given
    #[error("Only one should be provided: [requests|duration]")]
    ConflictingTermination,

    /// Neither a request bound nor a duration was given
    #[error("Requests or duration must be provided")]
    MissingTermination,

    /// Concurrency must be at least one client
    #[error("Concurrency must be at least 1")]
    ZeroConcurrency,

    /// The URL file could not be opened or read
    #[error("Failed to read URL file '{path}': {source}")]
    UrlFile {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The POST data file could not be read
    #[error("Failed to read POST data file '{path}': {source}")]
    PostData {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The URL sources produced no request at all
    #[error("No request specification found (check WEIGHT lines in the URL file)")]
    EmptyUrlList,

    /// A `WEIGHT:<n>` line carries something other than a non-negative integer
    #[error("Invalid weight '{value}' on line {line}")]
    InvalidWeight { line: usize, value: String },

    /// A threshold is not in `lower:upper` form or `lower >= upper`
    #[error("Invalid time threshold '{0}': expected <satisfied>:<tolerated> with satisfied < tolerated")]
    InvalidThreshold(String),

    /// A target is not an absolute http(s) URL
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The cookie is not in `name=value` form
    #[error("Invalid cookie '{0}': expected name=value")]
    InvalidCookie(String),

    /// A static header value contains characters HTTP does not allow
    #[error("Invalid value for header {0}")]
    InvalidHeader(String),

    /// A run summary text could not be parsed
    #[error("Invalid run summary at line {line}: {message}")]
    InvalidSummary { line: usize, message: String },

    /// The HTTP client could not be built
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

impl LoadGenError {
    /// Check if the error was caused by user input rather than the environment
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            Self::NoTarget
                | Self::ConflictingTermination
                | Self::MissingTermination
                | Self::ZeroConcurrency
                | Self::InvalidCookie(_)
                | Self::InvalidThreshold(_)
        )
    }
}
