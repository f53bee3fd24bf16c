//! One generator run: spawn the pool, stop it, aggregate

use std::sync::Arc;
use std::time::Instant;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{GeneratorConfig, Termination};
use crate::error::Result;
use crate::source::UrlSource;
use crate::stats::{aggregate, LatencyTable, RunSummary, ThroughputCounters};
use crate::transport::Transport;
use crate::worker::{run_workers, RunContext};

/// Traffic generator bound to a validated configuration
pub struct Generator {
    config: GeneratorConfig,
    termination: Termination,
    source: Arc<UrlSource>,
}

impl Generator {
    /// Validate `config` and load its URL source
    pub fn new(config: GeneratorConfig) -> Result<Self> {
        let termination = config.validate()?;
        let source = Arc::new(UrlSource::from_config(&config)?);
        Ok(Self {
            config,
            termination,
            source,
        })
    }

    /// Reuse an already loaded URL source
    pub fn with_source(config: GeneratorConfig, source: Arc<UrlSource>) -> Result<Self> {
        let termination = config.validate()?;
        Ok(Self {
            config,
            termination,
            source,
        })
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn source(&self) -> &Arc<UrlSource> {
        &self.source
    }

    /// Run until the request bound is reached, the duration passes, or
    /// `cancel` fires. Results gathered before cancellation are kept.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunSummary> {
        let throughput = Arc::new(ThroughputCounters::new());
        let transport = Transport::new(&self.config.transport, throughput.clone())?;
        let latencies = Arc::new(LatencyTable::new(self.source.targets()));
        let run_cancel = cancel.child_token();

        if let Some(duration) = self.termination.duration() {
            let timer = run_cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = sleep(duration) => timer.cancel(),
                    _ = timer.cancelled() => {}
                }
            });
        }

        let ctx = Arc::new(RunContext {
            source: self.source.clone(),
            transport,
            latencies: latencies.clone(),
            cancel: run_cancel.clone(),
            max_requests: self.termination.max_requests(),
        });

        let start = Instant::now();
        info!("Dispatching {} clients", self.config.concurrency);
        let results = run_workers(ctx, self.config.concurrency).await;
        let elapsed = start.elapsed();
        // Stops the duration timer when the request bound ended the run first.
        run_cancel.cancel();

        let summary = aggregate(
            &results,
            latencies.drain(),
            &throughput,
            elapsed,
            &self.source.thresholds(),
        );
        info!(
            requests = summary.counters.requests,
            successes = summary.counters.successes,
            rate = summary.rate,
            "Run complete in {}s",
            summary.elapsed_secs
        );
        if let Some(overview) = &summary.overview {
            info!(
                "Latency min {}ms, mean {:.2}ms, p99 {}ms, max {}ms",
                overview.min_ms, overview.mean_ms, overview.p99_ms, overview.max_ms
            );
        }
        Ok(summary)
    }
}
