//! # Loadstep Traffic Generator
//!
//! Drives many concurrent HTTP(S) clients against a weighted list of URLs and
//! reports request outcomes, throughput, per-URL latency percentiles and
//! Apdex scores.
//!
//! ## Features
//!
//! - **Weighted URL files**: `WEIGHT:<n>` replication with `[POST]`,
//!   `[EXPECT]` and `[THOLD]` tags
//! - **Worker pool**: exactly C clients sharing one pooled transport
//! - **Outcome classification**: network failures, non-200 responses and
//!   pattern mismatches counted separately
//! - **Latency statistics**: fixed percentile breakpoints and Apdex per URL
//! - **Stable text summary**: printed at the end of a run and parseable back
//!
//! ## Usage
//!
//! ```bash
//! # 200 clients for 60 seconds against one URL
//! loadstep-gen -u http://10.0.0.5:8070/ocr -c 200 -t 60
//!
//! # 50 requests per client from a weighted URL file
//! loadstep-gen -f urls.txt -c 10 -r 50 -e '"status":"ok"'
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod runner;
pub mod source;
pub mod stats;
pub mod summary;
pub mod transport;
pub mod worker;

pub use config::{ApdexThreshold, GeneratorConfig, ShuffleMode, Termination, TransportConfig};
pub use error::{LoadGenError, Result};
pub use runner::Generator;
pub use source::{HttpMethod, UrlSource, UrlSpec};
pub use stats::{ApdexScore, RunResult, RunSummary, UrlLatencyReport};
pub use summary::parse_summary;
