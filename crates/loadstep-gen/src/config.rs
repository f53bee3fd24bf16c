//! Generator configuration types

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LoadGenError, Result};

/// How a run ends. Exactly one mode is required.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Termination {
    /// Each worker stops after this many requests
    Requests(u64),
    /// All workers stop once this many seconds have passed
    Duration(u64),
}

impl Termination {
    /// Build the termination mode from the two optional CLI values
    pub fn from_options(requests: Option<u64>, duration_secs: Option<u64>) -> Result<Self> {
        match (requests, duration_secs) {
            (Some(_), Some(_)) => Err(LoadGenError::ConflictingTermination),
            (None, None) => Err(LoadGenError::MissingTermination),
            (Some(n), None) => Ok(Self::Requests(n)),
            (None, Some(secs)) => Ok(Self::Duration(secs)),
        }
    }

    /// Per-worker request bound, if any
    pub fn max_requests(&self) -> Option<u64> {
        match self {
            Self::Requests(n) => Some(*n),
            Self::Duration(_) => None,
        }
    }

    /// Run duration, if any
    pub fn duration(&self) -> Option<Duration> {
        match self {
            Self::Requests(_) => None,
            Self::Duration(secs) => Some(Duration::from_secs(*secs)),
        }
    }
}

/// Permutation applied to the expanded URL list
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ShuffleMode {
    /// `swap(i, random(n))` for every index. Not uniform, but it reproduces
    /// the request mix of earlier benchmark runs.
    #[default]
    Compatible,
    /// Fisher-Yates
    Uniform,
}

impl FromStr for ShuffleMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "compatible" | "biased" => Ok(Self::Compatible),
            "uniform" => Ok(Self::Uniform),
            _ => Err(format!(
                "Invalid shuffle mode '{}'. Use 'compatible' or 'uniform'.",
                s
            )),
        }
    }
}

/// Apdex latency thresholds in milliseconds
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApdexThreshold {
    /// Requests at or below this latency are satisfied
    pub satisfied_ms: u64,
    /// Requests at or below this latency (and above `satisfied_ms`) are tolerated
    pub tolerated_ms: u64,
}

impl FromStr for ApdexThreshold {
    type Err = LoadGenError;

    /// Parse `lower:upper`
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || LoadGenError::InvalidThreshold(s.to_string());
        let (lower, upper) = s.trim().split_once(':').ok_or_else(invalid)?;
        let satisfied_ms: u64 = lower.trim().parse().map_err(|_| invalid())?;
        let tolerated_ms: u64 = upper.trim().parse().map_err(|_| invalid())?;
        if satisfied_ms >= tolerated_ms {
            return Err(invalid());
        }
        Ok(Self {
            satisfied_ms,
            tolerated_ms,
        })
    }
}

/// HTTP client settings shared by all workers
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Send `Connection: keep-alive` instead of `Connection: close`
    #[serde(default = "default_true")]
    pub keep_alive: bool,

    /// Connect/write timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Response read timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Static Authorization header value
    #[serde(default)]
    pub auth_header: Option<String>,

    /// Static cookie in `name=value` form
    #[serde(default)]
    pub cookie: Option<String>,

    /// Verify server certificates
    #[serde(default)]
    pub verify_tls: bool,

    /// Idle connections kept per host
    #[serde(default = "default_concurrency")]
    pub pool_size: usize,
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_concurrency() -> usize {
    100
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            keep_alive: true,
            write_timeout_ms: default_timeout_ms(),
            read_timeout_ms: default_timeout_ms(),
            auth_header: None,
            cookie: None,
            verify_tls: false,
            pool_size: default_concurrency(),
        }
    }
}

impl TransportConfig {
    /// Split the cookie into name and value
    pub fn cookie_pair(&self) -> Result<Option<(String, String)>> {
        match &self.cookie {
            None => Ok(None),
            Some(raw) => {
                let (name, value) = raw
                    .split_once('=')
                    .filter(|(name, _)| !name.trim().is_empty())
                    .ok_or_else(|| LoadGenError::InvalidCookie(raw.clone()))?;
                Ok(Some((name.trim().to_string(), value.trim().to_string())))
            }
        }
    }
}

/// Complete generator configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Literal target URL
    #[serde(default)]
    pub url: Option<String>,

    /// Line-delimited URL file
    #[serde(default)]
    pub url_file: Option<PathBuf>,

    /// Number of concurrent clients
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Per-client request bound
    #[serde(default)]
    pub requests: Option<u64>,

    /// Run duration in seconds
    #[serde(default)]
    pub duration_secs: Option<u64>,

    /// File whose content is POSTed for entries without an explicit method
    #[serde(default)]
    pub post_data_file: Option<PathBuf>,

    /// Body substring required for success, unless the entry has its own
    #[serde(default)]
    pub expect: Option<String>,

    /// Apdex thresholds for entries without their own
    #[serde(default)]
    pub apdex: Option<ApdexThreshold>,

    /// Permutation of the expanded URL list
    #[serde(default)]
    pub shuffle: ShuffleMode,

    /// HTTP client settings
    #[serde(default)]
    pub transport: TransportConfig,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            url: None,
            url_file: None,
            concurrency: default_concurrency(),
            requests: None,
            duration_secs: None,
            post_data_file: None,
            expect: None,
            apdex: None,
            shuffle: ShuffleMode::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl GeneratorConfig {
    /// Check the invocation before any request is issued
    pub fn validate(&self) -> Result<Termination> {
        let has_url = self.url.as_deref().is_some_and(|u| !u.trim().is_empty());
        if !has_url && self.url_file.is_none() {
            return Err(LoadGenError::NoTarget);
        }
        if self.concurrency == 0 {
            return Err(LoadGenError::ZeroConcurrency);
        }
        self.transport.cookie_pair()?;
        Termination::from_options(self.requests, self.duration_secs)
    }

    /// Copy of this configuration with another concurrency and a fixed duration
    pub fn for_step(&self, concurrency: usize, duration_secs: u64) -> Self {
        let mut config = self.clone();
        config.concurrency = concurrency;
        config.requests = None;
        config.duration_secs = Some(duration_secs);
        config.transport.pool_size = concurrency;
        config
    }
}
