//! Stepping driver: run the generator at growing concurrency until a stop
//! condition holds

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use rand::Rng;
use loadstep_gen::stats::P95_INDEX;
use loadstep_gen::{Generator, GeneratorConfig, RunResult, RunSummary, UrlSource};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::DriverConfig;
use crate::error::Result;
use crate::report::service_name;

/// Consecutive non-improving steps tolerated before the search stops
pub const MAX_RETRY: u32 = 5;

/// Failure ratio above which a step is unstable
pub const INSTABILITY_RATIO: f64 = 0.10;

// ============================================================================
// STEP RESULTS
// ============================================================================

/// Latency figures of one URL in one step
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UrlStepStat {
    /// Short label derived from the URL
    pub service: String,
    pub url: String,
    pub total: u64,
    /// Milliseconds at each of [`loadstep_gen::stats::PERCENTILES`]
    pub percentiles: [u64; 7],
    pub apdex: Option<f64>,
}

impl UrlStepStat {
    pub fn p95(&self) -> u64 {
        self.percentiles[P95_INDEX]
    }
}

/// Outcome of one step
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub concurrency: usize,
    pub counters: RunResult,
    /// Successful requests per second
    pub rate: f64,
    pub read_throughput: u64,
    pub write_throughput: u64,
    /// Latest CPU sample when the step ended
    pub cpu_percent: Option<u32>,
    pub elapsed_secs: u64,
    /// Sorted by URL; the first entry is the primary URL
    pub urls: Vec<UrlStepStat>,
}

impl StepResult {
    pub fn from_summary(concurrency: usize, summary: &RunSummary, cpu_percent: Option<u32>) -> Self {
        Self {
            concurrency,
            counters: summary.counters,
            rate: summary.rate,
            read_throughput: summary.read_throughput,
            write_throughput: summary.write_throughput,
            cpu_percent,
            elapsed_secs: summary.elapsed_secs,
            urls: summary
                .urls
                .iter()
                .map(|u| UrlStepStat {
                    service: service_name(&u.url),
                    url: u.url.clone(),
                    total: u.total,
                    percentiles: u.percentiles,
                    apdex: u.apdex.map(|a| a.score),
                })
                .collect(),
        }
    }

    /// The URL checked against the SLA
    pub fn primary(&self) -> Option<&UrlStepStat> {
        self.urls.first()
    }
}

/// Why a drive ended
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    /// Primary URL p95 went over the SLA
    SlaBreached { p95_ms: u64, sla_ms: u64 },
    /// Too many failed requests in a step
    Instability { failure_ratio: f64 },
    /// No throughput improvement for [`MAX_RETRY`] steps
    Plateau,
    /// The next step would exceed the ceiling
    CeilingReached { ceiling: usize },
    /// Process interrupt
    Interrupted,
    /// A step could not be run at all
    StepFailed { concurrency: usize, message: String },
    /// Every available step was replayed without a stop rule firing
    Completed,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SlaBreached { p95_ms, sla_ms } => {
                write!(f, "SLA breached (95th percentile {} ms > {} ms)", p95_ms, sla_ms)
            }
            Self::Instability { failure_ratio } => write!(
                f,
                "Instability ({:.1}% of requests failed)",
                failure_ratio * 100.0
            ),
            Self::Plateau => write!(f, "Plateau (no improvement in {} steps)", MAX_RETRY),
            Self::CeilingReached { ceiling } => {
                write!(f, "Ceiling reached ({} clients)", ceiling)
            }
            Self::Interrupted => write!(f, "Interrupted"),
            Self::StepFailed {
                concurrency,
                message,
            } => write!(f, "Step at {} clients failed: {}", concurrency, message),
            Self::Completed => write!(f, "All steps completed"),
        }
    }
}

/// Every completed step of a drive
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepHistory {
    pub steps: Vec<StepResult>,
    pub stop_reason: StopReason,
    pub started_at: DateTime<Local>,
    pub total_secs: u64,
}

impl StepHistory {
    /// Step with the most successful requests; the earliest wins a tie
    pub fn best_step(&self) -> Option<&StepResult> {
        self.steps.iter().fold(None, |best: Option<&StepResult>, step| match best {
            Some(b) if b.counters.successes >= step.counters.successes => Some(b),
            _ => Some(step),
        })
    }

    /// Distinct URLs over all steps, in first-seen order
    pub fn services(&self) -> Vec<(String, String)> {
        let mut seen: Vec<(String, String)> = Vec::new();
        for stat in self.steps.iter().flat_map(|s| &s.urls) {
            if !seen.iter().any(|(url, _)| url == &stat.url) {
                seen.push((stat.url.clone(), stat.service.clone()));
            }
        }
        seen
    }
}

// ============================================================================
// POLICY
// ============================================================================

/// What to do after a step
#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    StepUp(usize),
    Stop(StopReason),
}

/// Stop rules applied to each completed step
#[derive(Clone, Debug)]
pub struct StepPolicy {
    sla_ms: Option<u64>,
    ceiling: Option<usize>,
    step: usize,
    max_success: u64,
    retry: u32,
}

impl StepPolicy {
    pub fn new(sla_ms: Option<u64>, ceiling: Option<usize>, step: usize) -> Self {
        Self {
            sla_ms,
            ceiling,
            step,
            max_success: 0,
            retry: 0,
        }
    }

    pub fn from_config(config: &DriverConfig) -> Self {
        Self::new(config.sla_ms, config.ceiling, config.step)
    }

    /// Highest success count seen so far
    pub fn max_success(&self) -> u64 {
        self.max_success
    }

    /// Steps since the last improvement
    pub fn retry(&self) -> u32 {
        self.retry
    }

    /// Record `result` and decide the next move
    pub fn observe(&mut self, result: &StepResult) -> Decision {
        if result.counters.successes > self.max_success {
            self.max_success = result.counters.successes;
            self.retry = 0;
        } else {
            self.retry += 1;
        }

        if let (Some(sla_ms), Some(primary)) = (self.sla_ms, result.primary()) {
            if primary.p95() > sla_ms {
                return Decision::Stop(StopReason::SlaBreached {
                    p95_ms: primary.p95(),
                    sla_ms,
                });
            }
        }

        let failure_ratio = result.counters.failure_ratio();
        if failure_ratio > INSTABILITY_RATIO {
            return Decision::Stop(StopReason::Instability { failure_ratio });
        }

        if self.retry >= MAX_RETRY {
            return Decision::Stop(StopReason::Plateau);
        }

        let next = result.concurrency + self.step;
        match self.ceiling {
            Some(ceiling) if next > ceiling => Decision::Stop(StopReason::CeilingReached { ceiling }),
            _ => Decision::StepUp(next),
        }
    }
}

// ============================================================================
// STEP RUNNERS
// ============================================================================

/// Runs one step at a given concurrency
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run_step(&self, concurrency: usize, cancel: &CancellationToken) -> Result<RunSummary>;
}

/// In-process generator run for a fixed duration
pub struct GeneratorRunner {
    base: GeneratorConfig,
    source: UrlSource,
    step_secs: u64,
}

impl GeneratorRunner {
    /// Load and expand the URL list once; each step replays a fresh shuffle of it
    pub fn new(base: GeneratorConfig, step_secs: u64) -> Result<Self> {
        base.for_step(base.concurrency, step_secs).validate()?;
        let source = UrlSource::from_config(&base)?;
        Ok(Self {
            base,
            source,
            step_secs,
        })
    }

    pub fn source(&self) -> &UrlSource {
        &self.source
    }

    /// Request sequence for the next step
    pub fn step_source<R: Rng + ?Sized>(&self, rng: &mut R) -> Arc<UrlSource> {
        let mut source = self.source.clone();
        source.shuffle(self.base.shuffle, rng);
        Arc::new(source)
    }
}

#[async_trait]
impl StepRunner for GeneratorRunner {
    async fn run_step(&self, concurrency: usize, cancel: &CancellationToken) -> Result<RunSummary> {
        let config = self.base.for_step(concurrency, self.step_secs);
        let source = self.step_source(&mut rand::thread_rng());
        let generator = Generator::with_source(config, source)?;
        Ok(generator.run(cancel).await?)
    }
}

// ============================================================================
// DRIVER
// ============================================================================

/// Owns the step loop
pub struct SteppingDriver<R> {
    runner: R,
    policy: StepPolicy,
    start: usize,
    cpu: Option<watch::Receiver<Option<u32>>>,
}

impl<R: StepRunner> SteppingDriver<R> {
    pub fn new(runner: R, config: &DriverConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            runner,
            policy: StepPolicy::from_config(config),
            start: config.start,
            cpu: None,
        })
    }

    /// Attach the CPU sampler output to each step
    pub fn with_cpu(mut self, cpu: watch::Receiver<Option<u32>>) -> Self {
        self.cpu = Some(cpu);
        self
    }

    fn latest_cpu(&self) -> Option<u32> {
        self.cpu.as_ref().and_then(|rx| *rx.borrow())
    }

    /// Step until the policy or `cancel` stops the search. A step that fails
    /// to run ends the search; the steps before it are kept.
    pub async fn run(mut self, cancel: &CancellationToken) -> Result<StepHistory> {
        let started_at = Local::now();
        let clock = Instant::now();
        let mut steps = Vec::new();
        let mut concurrency = self.start;

        info!("Start stepping at {} clients", concurrency);
        let stop_reason = loop {
            if cancel.is_cancelled() {
                break StopReason::Interrupted;
            }

            info!("Running step with {} clients", concurrency);
            let summary = match self.runner.run_step(concurrency, cancel).await {
                Ok(summary) => summary,
                Err(e) => {
                    error!("Step at {} clients failed: {}", concurrency, e);
                    break StopReason::StepFailed {
                        concurrency,
                        message: e.to_string(),
                    };
                }
            };
            if cancel.is_cancelled() {
                warn!(
                    requests = summary.counters.requests,
                    "Discarding partial step at {} clients", concurrency
                );
                break StopReason::Interrupted;
            }

            let result = StepResult::from_summary(concurrency, &summary, self.latest_cpu());
            info!(
                concurrency,
                successes = result.counters.successes,
                failures = result.counters.failures(),
                rate = result.rate,
                p95 = result.primary().map(UrlStepStat::p95),
                "Step complete"
            );
            let decision = self.policy.observe(&result);
            steps.push(result);

            match decision {
                Decision::StepUp(next) => concurrency = next,
                Decision::Stop(reason) => break reason,
            }
        };

        info!("Stepping stopped: {}", stop_reason);
        Ok(StepHistory {
            steps,
            stop_reason,
            started_at,
            total_secs: clock.elapsed().as_secs(),
        })
    }
}
