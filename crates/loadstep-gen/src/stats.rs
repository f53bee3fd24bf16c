//! Run counters, latency samples and the end-of-run aggregation

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::ApdexThreshold;

/// Percentile breakpoints reported for every URL
pub const PERCENTILES: [u32; 7] = [50, 60, 70, 80, 90, 95, 100];

/// Position of the 95th percentile in [`PERCENTILES`]
pub const P95_INDEX: usize = 5;

/// Request outcome counters of one worker, or of a merged run
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunResult {
    pub requests: u64,
    pub successes: u64,
    pub network_failed: u64,
    pub bad_failed: u64,
    pub mismatched: u64,
}

impl RunResult {
    /// Pairwise sum
    pub fn merge(&mut self, other: &RunResult) {
        self.requests += other.requests;
        self.successes += other.successes;
        self.network_failed += other.network_failed;
        self.bad_failed += other.bad_failed;
        self.mismatched += other.mismatched;
    }

    /// Requests that did not count as successes
    pub fn failures(&self) -> u64 {
        self.network_failed + self.bad_failed + self.mismatched
    }

    /// Fraction of requests that failed in any way; 1.0 for an empty run
    pub fn failure_ratio(&self) -> f64 {
        if self.requests == 0 {
            return 1.0;
        }
        self.failures() as f64 / self.requests as f64
    }
}

/// Bytes moved over the wire during a run. Never reset.
#[derive(Debug, Default)]
pub struct ThroughputCounters {
    read: AtomicU64,
    written: AtomicU64,
}

impl ThroughputCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_read(&self, bytes: u64) {
        self.read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_written(&self, bytes: u64) {
        self.written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

/// Per-URL elapsed times in milliseconds.
///
/// One lock per URL. The shard map is fixed when the table is built, so
/// finding a shard takes no lock and workers hitting different URLs never
/// contend.
#[derive(Debug, Default)]
pub struct LatencyTable {
    shards: HashMap<String, Mutex<Vec<u64>>>,
}

impl LatencyTable {
    pub fn new<'a>(targets: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            shards: targets
                .into_iter()
                .map(|t| (t.to_string(), Mutex::new(Vec::new())))
                .collect(),
        }
    }

    /// Append one sample; unknown targets are ignored
    pub fn record(&self, target: &str, elapsed_ms: u64) {
        match self.shards.get(target) {
            Some(shard) => shard.lock().push(elapsed_ms),
            None => warn!("No latency shard for {}", target),
        }
    }

    /// Number of samples recorded for `target`
    pub fn count(&self, target: &str) -> usize {
        self.shards.get(target).map(|s| s.lock().len()).unwrap_or(0)
    }

    /// Take every non-empty sample set, sorted by URL, leaving the shards empty
    pub fn drain(&self) -> BTreeMap<String, Vec<u64>> {
        self.shards
            .iter()
            .map(|(k, v)| (k.clone(), std::mem::take(&mut *v.lock())))
            .filter(|(_, v)| !v.is_empty())
            .collect()
    }
}

/// Latency at each of the [`PERCENTILES`] breakpoints.
///
/// Sorts `samples`. Breakpoint `p` is the element at `size * p / 100`, the
/// 100th is the last element.
pub fn percentiles(samples: &mut [u64]) -> Option<[u64; 7]> {
    if samples.is_empty() {
        return None;
    }
    samples.sort_unstable();
    let size = samples.len();
    let mut out = [0u64; 7];
    for (slot, p) in out.iter_mut().zip(PERCENTILES) {
        let idx = if p >= 100 {
            size - 1
        } else {
            (size * p as usize / 100).min(size - 1)
        };
        *slot = samples[idx];
    }
    Some(out)
}

/// Apdex buckets and score for one URL
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct ApdexScore {
    pub threshold: ApdexThreshold,
    pub satisfied: u64,
    pub tolerated: u64,
    pub frustrated: u64,
    pub score: f64,
}

/// Score `samples` against `threshold`. `None` for an empty sample set.
pub fn apdex(samples: &[u64], threshold: ApdexThreshold) -> Option<ApdexScore> {
    if samples.is_empty() {
        return None;
    }
    let (mut satisfied, mut tolerated, mut frustrated) = (0u64, 0u64, 0u64);
    for &v in samples {
        if v <= threshold.satisfied_ms {
            satisfied += 1;
        } else if v <= threshold.tolerated_ms {
            tolerated += 1;
        } else {
            frustrated += 1;
        }
    }
    let score = (satisfied as f64 + tolerated as f64 / 2.0) / samples.len() as f64;
    Some(ApdexScore {
        threshold,
        satisfied,
        tolerated,
        frustrated,
        score,
    })
}

/// Latency distribution of one URL
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UrlLatencyReport {
    pub url: String,
    pub total: u64,
    pub percentiles: [u64; 7],
    pub apdex: Option<ApdexScore>,
}

impl UrlLatencyReport {
    pub fn p95(&self) -> u64 {
        self.percentiles[P95_INDEX]
    }
}

/// Latency over every sample of a run
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct LatencyOverview {
    pub min_ms: u64,
    pub mean_ms: f64,
    pub p99_ms: u64,
    pub max_ms: u64,
}

impl LatencyOverview {
    pub fn from_samples<'a>(sets: impl IntoIterator<Item = &'a [u64]>) -> Option<Self> {
        // 1ms to 1h
        let mut hist = Histogram::<u64>::new_with_bounds(1, 3_600_000, 3).ok()?;
        for set in sets {
            for &v in set {
                if let Err(e) = hist.record(v.max(1)) {
                    warn!("Failed to record latency: {}", e);
                }
            }
        }
        if hist.len() == 0 {
            return None;
        }
        Some(Self {
            min_ms: hist.min(),
            mean_ms: hist.mean(),
            p99_ms: hist.value_at_quantile(0.99),
            max_ms: hist.max(),
        })
    }
}

/// Aggregated outcome of one generator run
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub counters: RunResult,
    /// Whole seconds, at least 1
    pub elapsed_secs: u64,
    /// Successful requests per second
    pub rate: f64,
    /// Bytes read per second
    pub read_throughput: u64,
    /// Bytes written per second
    pub write_throughput: u64,
    /// One entry per URL with samples, sorted by URL
    pub urls: Vec<UrlLatencyReport>,
    /// Not part of the text format
    #[serde(default)]
    pub overview: Option<LatencyOverview>,
}

impl RunSummary {
    /// The URL the stepping driver checks against its SLA
    pub fn primary_url(&self) -> Option<&UrlLatencyReport> {
        self.urls.first()
    }
}

/// Merge worker results and compute the per-URL statistics
pub fn aggregate(
    results: &[RunResult],
    samples: BTreeMap<String, Vec<u64>>,
    throughput: &ThroughputCounters,
    elapsed: Duration,
    thresholds: &BTreeMap<String, ApdexThreshold>,
) -> RunSummary {
    let mut counters = RunResult::default();
    for r in results {
        counters.merge(r);
    }

    let elapsed_secs = elapsed.as_secs().max(1);
    let overview = LatencyOverview::from_samples(samples.values().map(|v| v.as_slice()));

    let urls = samples
        .into_iter()
        .filter_map(|(url, mut values)| {
            let percentiles = percentiles(&mut values)?;
            let apdex = thresholds.get(&url).and_then(|t| apdex(&values, *t));
            Some(UrlLatencyReport {
                total: values.len() as u64,
                url,
                percentiles,
                apdex,
            })
        })
        .collect();

    RunSummary {
        counters,
        elapsed_secs,
        rate: counters.successes as f64 / elapsed_secs as f64,
        read_throughput: throughput.read() / elapsed_secs,
        write_throughput: throughput.written() / elapsed_secs,
        urls,
        overview,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const T: ApdexThreshold = ApdexThreshold {
        satisfied_ms: 100,
        tolerated_ms: 400,
    };

    #[test]
    fn test_merge() {
        let mut a = RunResult {
            requests: 10,
            successes: 7,
            network_failed: 1,
            bad_failed: 1,
            mismatched: 1,
        };
        let b = a;
        a.merge(&b);
        assert_eq!(a.requests, 20);
        assert_eq!(a.failures(), 6);
        assert!((a.failure_ratio() - 0.3).abs() < 1e-9);
        assert_eq!(RunResult::default().failure_ratio(), 1.0);
    }

    #[test]
    fn test_percentile_indexing() {
        let mut samples: Vec<u64> = (1..=10).rev().collect();
        let p = percentiles(&mut samples).unwrap();
        // size 10: indexes 5,6,7,8,9,9 and last
        assert_eq!(p, [6, 7, 8, 9, 10, 10, 10]);

        let mut single = vec![42];
        assert_eq!(percentiles(&mut single).unwrap(), [42; 7]);
        assert!(percentiles(&mut []).is_none());
    }

    #[test]
    fn test_apdex_buckets() {
        let score = apdex(&[50, 100, 150, 400, 500], T).unwrap();
        assert_eq!(score.satisfied, 2);
        assert_eq!(score.tolerated, 2);
        assert_eq!(score.frustrated, 1);
        assert!((score.score - 0.6).abs() < 1e-9);
        assert!(apdex(&[], T).is_none());
    }

    #[test]
    fn test_latency_table_sharding() {
        let table = LatencyTable::new(["http://x/a", "http://x/b"]);
        table.record("http://x/a", 5);
        table.record("http://x/a", 3);
        table.record("http://x/unknown", 1);
        assert_eq!(table.count("http://x/a"), 2);
        assert_eq!(table.count("http://x/b"), 0);

        let samples = table.drain();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples["http://x/a"], vec![5, 3]);
        assert_eq!(table.count("http://x/a"), 0);
    }

    #[test]
    fn test_aggregate() {
        let throughput = ThroughputCounters::new();
        throughput.add_read(10_000);
        throughput.add_written(2_000);

        let results = [
            RunResult {
                requests: 5,
                successes: 5,
                ..Default::default()
            },
            RunResult {
                requests: 5,
                successes: 3,
                bad_failed: 2,
                ..Default::default()
            },
        ];
        let mut samples = BTreeMap::new();
        samples.insert("http://x/b".to_string(), vec![10, 20, 30, 40]);
        samples.insert("http://x/a".to_string(), vec![1, 2, 3, 4, 5, 6]);
        let mut thresholds = BTreeMap::new();
        thresholds.insert("http://x/a".to_string(), T);

        let summary = aggregate(
            &results,
            samples,
            &throughput,
            Duration::from_millis(2_500),
            &thresholds,
        );
        assert_eq!(summary.counters.requests, 10);
        assert_eq!(summary.counters.successes, 8);
        assert_eq!(summary.elapsed_secs, 2);
        assert!((summary.rate - 4.0).abs() < 1e-9);
        assert_eq!(summary.read_throughput, 5_000);
        assert_eq!(summary.write_throughput, 1_000);
        assert_eq!(summary.urls[0].url, "http://x/a");
        assert_eq!(summary.urls[0].apdex.unwrap().score, 1.0);
        assert!(summary.urls[1].apdex.is_none());
        assert_eq!(summary.overview.as_ref().unwrap().max_ms, 40);
    }

    #[test]
    fn test_elapsed_floor_is_one_second() {
        let summary = aggregate(
            &[RunResult {
                requests: 3,
                successes: 3,
                ..Default::default()
            }],
            BTreeMap::new(),
            &ThroughputCounters::new(),
            Duration::from_millis(200),
            &BTreeMap::new(),
        );
        assert_eq!(summary.elapsed_secs, 1);
        assert_eq!(summary.rate, 3.0);
        assert!(summary.overview.is_none());
    }

    proptest! {
        #[test]
        fn prop_percentiles_are_monotonic(samples in prop::collection::vec(0u64..100_000, 1..500)) {
            let mut sorted = samples.clone();
            let p = percentiles(&mut sorted).unwrap();
            for w in p.windows(2) {
                prop_assert!(w[0] <= w[1]);
            }
            prop_assert_eq!(p[6], *samples.iter().max().unwrap());
        }

        #[test]
        fn prop_apdex_bounds(samples in prop::collection::vec(0u64..1_000, 1..300)) {
            let score = apdex(&samples, T).unwrap();
            prop_assert!((0.0..=1.0).contains(&score.score));
            prop_assert_eq!(score.satisfied + score.tolerated + score.frustrated, samples.len() as u64);
            let all_satisfied = samples.iter().all(|&v| v <= T.satisfied_ms);
            prop_assert_eq!(score.score == 1.0, all_satisfied);
        }
    }
}
