//! # Loadstep Stepping Driver
//!
//! Finds the saturation point of an HTTP service. The driver runs the
//! traffic generator in-process at a starting concurrency, then keeps adding
//! clients until one of the stop rules holds:
//!
//! - the 95th percentile latency of the primary URL exceeds the SLA
//! - more than 10% of the requests of a step failed
//! - five steps in a row brought no more successful requests
//! - the next step would pass the client ceiling
//!
//! Completed steps are written as an aligned table, a CSV file and
//! optionally JSON. CPU utilization of the system under test can be sampled
//! through `kubectl top nodes` or from the local `/proc/stat`.

pub mod config;
pub mod cpu;
pub mod driver;
pub mod error;
pub mod report;

pub use config::{CpuMode, DriverConfig};
pub use cpu::{CpuSampler, CpuSource, KubectlTop, NoCpu, ProcStat};
pub use driver::{
    Decision, GeneratorRunner, StepHistory, StepPolicy, StepResult, StepRunner, SteppingDriver,
    StopReason, UrlStepStat,
};
pub use error::{DriverError, Result};
pub use report::{render_csv, render_table, run_title, service_name, ReportWriter};
