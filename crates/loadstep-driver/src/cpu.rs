//! CPU sampling and the progress heartbeat
//!
//! Both run as background tasks next to the step loop. The sampler publishes
//! its latest value on a `watch` channel; the driver reads it when a step
//! ends. A failed sample is logged and skipped, the previous value stays.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::error::{DriverError, Result};

/// Cluster sampling interval
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

/// Local `/proc/stat` sampling interval
pub const LOCAL_INTERVAL: Duration = Duration::from_secs(10);

/// Delay before the first sample
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(5);

/// Heartbeat interval
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Upper bound on one `kubectl` invocation
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(20);

/// A CPU utilization reading, in whole percent
#[async_trait]
pub trait CpuSource: Send {
    /// `Ok(None)` when no value is available yet
    async fn sample(&mut self) -> Result<Option<u32>>;
}

// ============================================================================
// PARSERS
// ============================================================================

/// `(name, cpu%)` pairs from `kubectl top nodes`
pub fn parse_top_nodes(output: &str) -> Vec<(String, u32)> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("NAME"))
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let percent = tokens.get(2)?.strip_suffix('%')?.parse().ok()?;
            Some((tokens[0].to_string(), percent))
        })
        .collect()
}

/// `(name, roles)` pairs from `kubectl get nodes`
pub fn parse_node_roles(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("NAME"))
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let name = tokens.next()?;
            let _status = tokens.next()?;
            let roles = tokens.next()?;
            Some((name.to_string(), roles.to_string()))
        })
        .collect()
}

/// Node CPU capacity in millicores from `kubectl describe node`: the first
/// positive `cpu:` value
pub fn parse_cpu_capacity(output: &str) -> Option<u64> {
    output
        .lines()
        .map(str::trim)
        .filter_map(|line| line.strip_prefix("cpu:"))
        .filter_map(|value| {
            let value = value.trim();
            match value.strip_suffix('m') {
                Some(milli) => milli.parse::<u64>().ok(),
                None => value.parse::<u64>().ok().map(|cores| cores * 1000),
            }
        })
        .find(|&millis| millis > 0)
}

/// Is this `ROLES` column a control-plane node
pub fn is_master_role(roles: &str) -> bool {
    roles
        .split(',')
        .any(|role| role == "master" || role == "control-plane")
}

/// Capacity-weighted mean of the per-node percentages.
/// Nodes without a known capacity are ignored.
pub fn weighted_average(
    usage: &[(String, u32)],
    capacities: &HashMap<String, u64>,
    excluded: &HashSet<String>,
) -> Option<u32> {
    let (mut total, mut weight) = (0u64, 0u64);
    for (node, percent) in usage {
        if excluded.contains(node) {
            continue;
        }
        if let Some(&capacity) = capacities.get(node) {
            total += *percent as u64 * capacity;
            weight += capacity;
        }
    }
    (weight > 0).then(|| (total / weight) as u32)
}

/// Aggregate jiffies of the `cpu` line of `/proc/stat`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuTimes {
    /// idle + iowait
    pub idle: u64,
    /// user + nice + system + irq + softirq + steal
    pub busy: u64,
}

impl CpuTimes {
    pub fn total(&self) -> u64 {
        self.idle + self.busy
    }

    /// Busy percentage between `prev` and `self`
    pub fn usage_since(&self, prev: &CpuTimes) -> Option<u32> {
        let total = self.total().checked_sub(prev.total())?;
        let idle = self.idle.checked_sub(prev.idle)?;
        if total == 0 {
            return None;
        }
        Some(((total - idle.min(total)) * 100 / total) as u32)
    }
}

pub fn parse_proc_stat(content: &str) -> Option<CpuTimes> {
    let line = content
        .lines()
        .find(|line| line.split_whitespace().next() == Some("cpu"))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|f| f.parse().ok())
        .collect::<Option<_>>()?;
    let field = |i: usize| fields.get(i).copied().unwrap_or(0);
    // user nice system idle iowait irq softirq steal
    if fields.len() < 4 {
        return None;
    }
    Some(CpuTimes {
        idle: field(3) + field(4),
        busy: field(0) + field(1) + field(2) + field(5) + field(6) + field(7),
    })
}

// ============================================================================
// SOURCES
// ============================================================================

async fn run_command(program: &str, args: &[&str]) -> Result<String> {
    run_command_within(program, args, COMMAND_TIMEOUT).await
}

/// Run `program` to completion; the child is killed when `limit` passes first
async fn run_command_within(program: &str, args: &[&str], limit: Duration) -> Result<String> {
    let command = format!("{} {}", program, args.join(" "));
    let child = Command::new(program).args(args).kill_on_drop(true).output();
    let output = match timeout(limit, child).await {
        Ok(output) => output.map_err(|e| DriverError::Command {
            command: command.clone(),
            message: e.to_string(),
        })?,
        Err(_) => {
            return Err(DriverError::Command {
                command,
                message: format!("timed out after {}s", limit.as_secs_f64()),
            })
        }
    };
    if !output.status.success() {
        return Err(DriverError::Command {
            command,
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Cluster CPU through `kubectl`
#[derive(Debug, Default)]
pub struct KubectlTop {
    capacities: HashMap<String, u64>,
    excluded: HashSet<String>,
}

impl KubectlTop {
    pub fn new(capacities: HashMap<String, u64>, excluded: HashSet<String>) -> Self {
        Self {
            capacities,
            excluded,
        }
    }

    /// Look up node roles and capacities once
    pub async fn discover(exclude_masters: bool) -> Result<Self> {
        let nodes = run_command("kubectl", &["get", "nodes"]).await?;
        let mut source = Self::default();
        for (name, roles) in parse_node_roles(&nodes) {
            if exclude_masters && is_master_role(&roles) {
                source.excluded.insert(name.clone());
            }
            let described = run_command("kubectl", &["describe", "node", &name]).await?;
            let capacity = parse_cpu_capacity(&described)
                .ok_or_else(|| DriverError::CpuParse(format!("no CPU capacity for node {}", name)))?;
            debug!(node = %name, capacity, "Node CPU capacity");
            source.capacities.insert(name, capacity);
        }
        info!(
            "Sampling CPU of {} nodes ({} excluded)",
            source.capacities.len(),
            source.excluded.len()
        );
        Ok(source)
    }
}

#[async_trait]
impl CpuSource for KubectlTop {
    async fn sample(&mut self) -> Result<Option<u32>> {
        let top = run_command("kubectl", &["top", "nodes"]).await?;
        Ok(weighted_average(
            &parse_top_nodes(&top),
            &self.capacities,
            &self.excluded,
        ))
    }
}

/// Local CPU from `/proc/stat` deltas
#[derive(Debug, Default)]
pub struct ProcStat {
    prev: Option<CpuTimes>,
}

impl ProcStat {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CpuSource for ProcStat {
    async fn sample(&mut self) -> Result<Option<u32>> {
        let content = tokio::fs::read_to_string("/proc/stat")
            .await
            .map_err(|e| DriverError::CpuParse(e.to_string()))?;
        let times = parse_proc_stat(&content)
            .ok_or_else(|| DriverError::CpuParse("no cpu line in /proc/stat".to_string()))?;
        let usage = self.prev.and_then(|prev| times.usage_since(&prev));
        self.prev = Some(times);
        Ok(usage)
    }
}

/// Never produces a value
#[derive(Debug, Default)]
pub struct NoCpu;

#[async_trait]
impl CpuSource for NoCpu {
    async fn sample(&mut self) -> Result<Option<u32>> {
        Ok(None)
    }
}

// ============================================================================
// BACKGROUND TASKS
// ============================================================================

/// Handle on a running sampler
pub struct CpuSampler {
    rx: watch::Receiver<Option<u32>>,
}

impl CpuSampler {
    /// Start sampling on `tracker` until `cancel` fires
    pub fn spawn(
        tracker: &TaskTracker,
        mut source: Box<dyn CpuSource>,
        every: Duration,
        initial_delay: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = watch::channel(None);
        tracker.spawn(async move {
            tokio::select! {
                _ = sleep(initial_delay) => {}
                _ = cancel.cancelled() => return,
            }
            let mut tick = interval(every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = cancel.cancelled() => break,
                }
                let sampled = tokio::select! {
                    sampled = source.sample() => sampled,
                    _ = cancel.cancelled() => break,
                };
                match sampled {
                    Ok(Some(value)) => {
                        debug!(cpu = value, "CPU sample");
                        tx.send_replace(Some(value));
                    }
                    Ok(None) => {}
                    Err(e) => debug!("CPU sample skipped: {}", e),
                }
            }
        });
        Self { rx }
    }

    pub fn receiver(&self) -> watch::Receiver<Option<u32>> {
        self.rx.clone()
    }

    pub fn latest(&self) -> Option<u32> {
        *self.rx.borrow()
    }
}

/// Log the elapsed time every `every` until `cancel` fires
pub fn spawn_heartbeat(tracker: &TaskTracker, every: Duration, cancel: CancellationToken) {
    tracker.spawn(async move {
        let started = Instant::now();
        let mut tick = interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => info!(
                    "Time passed: {} seconds...",
                    started.elapsed().as_secs()
                ),
                _ = cancel.cancelled() => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOP: &str = "\
NAME       CPU(cores)   CPU%   MEMORY(bytes)   MEMORY%
master-0   250m         12%    1800Mi          23%
worker-1   3100m        80%    6000Mi          40%
worker-2   <unknown>    <unknown>  <unknown>   <unknown>
worker-3   1000m        20%    2000Mi          10%
";

    #[test]
    fn test_parse_top_nodes() {
        let nodes = parse_top_nodes(TOP);
        assert_eq!(
            nodes,
            vec![
                ("master-0".to_string(), 12),
                ("worker-1".to_string(), 80),
                ("worker-3".to_string(), 20),
            ]
        );
    }

    #[test]
    fn test_parse_node_roles() {
        let out = "\
NAME       STATUS   ROLES                  AGE   VERSION
master-0   Ready    control-plane,master   10d   v1.27.3
worker-1   Ready    <none>                 10d   v1.27.3
";
        let roles = parse_node_roles(out);
        assert_eq!(roles.len(), 2);
        assert!(is_master_role(&roles[0].1));
        assert!(!is_master_role(&roles[1].1));
    }

    #[test]
    fn test_parse_cpu_capacity() {
        let out = "  cpu:                8\n  cpu:                7910m\n";
        assert_eq!(parse_cpu_capacity(out), Some(8000));
        assert_eq!(parse_cpu_capacity("  cpu:  0\n  cpu:  3800m\n"), Some(3800));
        assert_eq!(parse_cpu_capacity("memory: 16Gi\n"), None);
    }

    #[test]
    fn test_weighted_average() {
        let usage = parse_top_nodes(TOP);
        let capacities: HashMap<String, u64> = [
            ("master-0".to_string(), 2000),
            ("worker-1".to_string(), 4000),
            ("worker-3".to_string(), 4000),
        ]
        .into_iter()
        .collect();

        // (12*2 + 80*4 + 20*4) / 10
        assert_eq!(weighted_average(&usage, &capacities, &HashSet::new()), Some(42));

        let masters: HashSet<String> = ["master-0".to_string()].into_iter().collect();
        assert_eq!(weighted_average(&usage, &capacities, &masters), Some(50));
        assert_eq!(weighted_average(&usage, &HashMap::new(), &masters), None);
    }

    #[test]
    fn test_proc_stat_delta() {
        let first = parse_proc_stat("cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 1 2 3 4\n").unwrap();
        assert_eq!(first.idle, 800);
        assert_eq!(first.busy, 200);

        let second = parse_proc_stat("cpu  250 0 150 800 100 0 0 0 0 0\n").unwrap();
        // 300 jiffies elapsed, 100 idle
        assert_eq!(second.usage_since(&first), Some(66));
        assert_eq!(first.usage_since(&first), None);
        assert!(parse_proc_stat("intr 1 2 3\n").is_none());
    }

    struct Scripted(Vec<Result<Option<u32>>>);

    #[async_trait]
    impl CpuSource for Scripted {
        async fn sample(&mut self) -> Result<Option<u32>> {
            if self.0.is_empty() {
                return Ok(None);
            }
            self.0.remove(0)
        }
    }

    #[tokio::test]
    async fn test_sampler_keeps_last_good_value() {
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let source = Scripted(vec![
            Ok(Some(40)),
            Err(DriverError::CpuParse("boom".into())),
            Ok(None),
        ]);
        let sampler = CpuSampler::spawn(
            &tracker,
            Box::new(source),
            Duration::from_millis(10),
            Duration::from_millis(1),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sampler.latest(), Some(40));

        cancel.cancel();
        tracker.close();
        tracker.wait().await;
    }

    /// A sample that never completes, like a wedged `kubectl top`
    struct Stuck;

    #[async_trait]
    impl CpuSource for Stuck {
        async fn sample(&mut self) -> Result<Option<u32>> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_cancel_interrupts_a_stuck_sample() {
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let sampler = CpuSampler::spawn(
            &tracker,
            Box::new(Stuck),
            Duration::from_millis(5),
            Duration::from_millis(1),
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        tracker.close();
        let stopped = timeout(Duration::from_secs(2), tracker.wait()).await;
        assert!(stopped.is_ok(), "sampler kept running after cancel");
        assert_eq!(sampler.latest(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_slow_command_times_out() {
        let started = Instant::now();
        let result = run_command_within("sleep", &["10"], Duration::from_millis(100)).await;
        assert!(matches!(result, Err(DriverError::Command { .. })));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_output() {
        let out = run_command_within("echo", &["cpu"], COMMAND_TIMEOUT).await.unwrap();
        assert_eq!(out.trim(), "cpu");
        assert!(run_command_within("false", &[], COMMAND_TIMEOUT).await.is_err());
    }

    #[tokio::test]
    async fn test_heartbeat_stops_on_cancel() {
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        spawn_heartbeat(&tracker, Duration::from_millis(5), cancel.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tracker.close();
        tracker.wait().await;
    }
}
