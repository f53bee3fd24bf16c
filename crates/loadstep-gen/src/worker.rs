//! Worker pool: C clients replaying the URL source until told to stop

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::source::UrlSource;
use crate::stats::{LatencyTable, RunResult};
use crate::transport::{classify, Classification, Outcome, Transport};

/// Everything the workers of one run share.
///
/// All fields are shared by every worker. `source` and `max_requests` are
/// read-only, `transport` and `cancel` synchronize internally, and
/// `latencies` takes one lock per URL. Request counters are not in here:
/// each worker keeps its own [`RunResult`] and hands it back when it exits.
#[derive(Debug)]
pub struct RunContext {
    pub source: Arc<UrlSource>,
    pub transport: Transport,
    pub latencies: Arc<LatencyTable>,
    /// Checked at the top of every iteration; never interrupts a request
    pub cancel: CancellationToken,
    /// Per-worker request bound
    pub max_requests: Option<u64>,
}

impl RunContext {
    fn should_stop(&self, result: &RunResult) -> bool {
        self.cancel.is_cancelled()
            || self
                .max_requests
                .is_some_and(|max| result.requests >= max)
    }
}

/// One client: round-robin over the shuffled specs until the context says stop
pub async fn worker_loop(worker_id: usize, ctx: Arc<RunContext>) -> RunResult {
    let specs = ctx.source.specs();
    let mut result = RunResult::default();
    let mut seen_errors: HashSet<String> = HashSet::new();
    let mut next = 0usize;

    while !ctx.should_stop(&result) {
        let spec = &specs[next];
        next = (next + 1) % specs.len();

        let exchange = ctx.transport.execute(spec).await;
        ctx.latencies.record(&spec.target, exchange.elapsed_ms);
        result.requests += 1;

        match classify(&exchange.outcome, spec.expect.as_deref()) {
            Classification::Success => result.successes += 1,
            Classification::Mismatched => {
                debug!(worker_id, url = %spec.target, "Response does not contain expected pattern");
                result.mismatched += 1;
            }
            Classification::BadFailed => {
                if let Outcome::Response { status, .. } = &exchange.outcome {
                    debug!(worker_id, url = %spec.target, status, "Non-200 response");
                }
                result.bad_failed += 1;
            }
            Classification::NetworkFailed => {
                if let Outcome::Network(message) = exchange.outcome {
                    if !seen_errors.contains(&message) {
                        warn!(worker_id, "{}", message);
                        seen_errors.insert(message);
                    }
                }
                result.network_failed += 1;
            }
        }
    }

    debug!(worker_id, requests = result.requests, "Worker finished");
    result
}

/// Spawn exactly `concurrency` workers and collect their results
pub async fn run_workers(ctx: Arc<RunContext>, concurrency: usize) -> Vec<RunResult> {
    let mut tasks: FuturesUnordered<_> = (0..concurrency)
        .map(|id| tokio::spawn(worker_loop(id, ctx.clone())))
        .collect();

    let mut results = Vec::with_capacity(concurrency);
    while let Some(joined) = tasks.next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => error!("Worker task failed: {}", e),
        }
    }
    results
}
