//! # Loadstep CLI
//!
//! ```bash
//! # Step from 100 clients by 100 until p95 of the primary URL passes 500ms
//! loadstep run -f urls.txt -c 100 --step 100 --sla 500 --cpu kubectl
//!
//! # Rebuild a step table from saved generator summaries
//! loadstep parse out/c100.txt out/c200.txt
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use loadstep_driver::cpu::{
    spawn_heartbeat, DEFAULT_INITIAL_DELAY, DEFAULT_INTERVAL, HEARTBEAT_INTERVAL, LOCAL_INTERVAL,
};
use loadstep_driver::report::render_summary;
use loadstep_driver::{
    render_table, run_title, CpuMode, CpuSampler, CpuSource, Decision, DriverConfig,
    GeneratorRunner, KubectlTop, NoCpu, ProcStat, ReportWriter, StepHistory, StepPolicy,
    StepResult, SteppingDriver, StopReason,
};
use loadstep_gen::logging::{init_tracing, LogFormat};
use loadstep_gen::parse_summary;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// How long the sampler and heartbeat get to stop once the reports are out
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "loadstep")]
#[command(version)]
#[command(about = "Adaptive HTTP load tester: steps concurrency up to the saturation point", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format: text or json
    #[arg(long, global = true, default_value = "text")]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Step the generator until a stop condition holds
    Run(RunArgs),

    /// Build a step table from saved generator summaries
    Parse {
        /// Summary files, one per step in concurrency order
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Concurrency of the first file
        #[arg(short = 'c', long, default_value = "100")]
        start: usize,

        /// Concurrency increment between files
        #[arg(long, default_value = "100")]
        step: usize,

        /// SLA in milliseconds to replay the stop rules with
        #[arg(long)]
        sla: Option<u64>,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// TOML configuration file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Target URL
    #[arg(short, long)]
    url: Option<String>,

    /// URL file path
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Start concurrency
    #[arg(short = 'c', long)]
    start: Option<usize>,

    /// Concurrency increment
    #[arg(long)]
    step: Option<usize>,

    /// Last concurrency to run
    #[arg(long)]
    ceiling: Option<usize>,

    /// 95th percentile latency limit of the primary URL, in milliseconds
    #[arg(long)]
    sla: Option<u64>,

    /// Seconds per step
    #[arg(long)]
    step_secs: Option<u64>,

    /// Expected string pattern in the response body
    #[arg(short, long)]
    expect: Option<String>,

    /// CPU source: kubectl, local or none
    #[arg(long)]
    cpu: Option<CpuMode>,

    /// Leave control-plane nodes out of the cluster CPU average
    #[arg(long)]
    exclude_masters: bool,

    /// Report directory
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Also write the step history as JSON
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    fn into_config(self) -> anyhow::Result<DriverConfig> {
        let mut config = match &self.config {
            Some(path) => DriverConfig::load(path)?,
            None => DriverConfig::default(),
        };
        if self.url.is_some() {
            config.generator.url = self.url;
        }
        if self.file.is_some() {
            config.generator.url_file = self.file;
        }
        if self.expect.is_some() {
            config.generator.expect = self.expect;
        }
        if let Some(start) = self.start {
            config.start = start;
        }
        if let Some(step) = self.step {
            config.step = step;
        }
        if self.ceiling.is_some() {
            config.ceiling = self.ceiling;
        }
        if self.sla.is_some() {
            config.sla_ms = self.sla;
        }
        if let Some(secs) = self.step_secs {
            config.step_secs = secs;
        }
        if let Some(cpu) = self.cpu {
            config.cpu = cpu;
        }
        if let Some(dir) = self.output_dir {
            config.output_dir = dir;
        }
        config.exclude_masters |= self.exclude_masters;
        config.json |= self.json;
        Ok(config)
    }
}

/// Resolve on Ctrl+C or SIGTERM
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn cpu_source(config: &DriverConfig) -> Box<dyn CpuSource> {
    match config.cpu {
        CpuMode::Kubectl => match KubectlTop::discover(config.exclude_masters).await {
            Ok(source) => Box::new(source),
            Err(e) => {
                warn!("Cluster CPU sampling disabled: {}", e);
                Box::new(NoCpu)
            }
        },
        CpuMode::Local => Box::new(ProcStat::new()),
        CpuMode::None => Box::new(NoCpu),
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = args.into_config()?;
    config.validate()?;
    let title = run_title(
        config.generator.url.as_deref(),
        config.generator.url_file.as_deref(),
    );

    let runner = GeneratorRunner::new(config.first_step(), config.step_secs)?;
    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    let every = match config.cpu {
        CpuMode::Local => LOCAL_INTERVAL,
        _ => DEFAULT_INTERVAL,
    };
    let sampler = CpuSampler::spawn(
        &tracker,
        cpu_source(&config).await,
        every,
        DEFAULT_INITIAL_DELAY,
        cancel.clone(),
    );
    spawn_heartbeat(&tracker, HEARTBEAT_INTERVAL, cancel.clone());

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown().await;
        warn!("Tests are interrupted in the middle");
        interrupt.cancel();
    });

    info!("Start stepping load test");
    let driver = SteppingDriver::new(runner, &config)?.with_cpu(sampler.receiver());
    let history = driver.run(&cancel).await;

    cancel.cancel();
    tracker.close();

    let flushed = history.map_err(anyhow::Error::from).and_then(|history| {
        print_history(&history);
        let writer = ReportWriter::new(&config.output_dir, &title);
        writer.write(&history, config.json)?;
        Ok(())
    });

    if tokio::time::timeout(SHUTDOWN_GRACE, tracker.wait()).await.is_err() {
        warn!("Background tasks still running after {:?}", SHUTDOWN_GRACE);
    }
    flushed
}

fn print_history(history: &StepHistory) {
    println!("{}", render_summary(history));
    println!("{}", render_table(history));
}

fn parse(files: Vec<PathBuf>, start: usize, step: usize, sla: Option<u64>) -> anyhow::Result<()> {
    let mut policy = StepPolicy::new(sla, None, step);
    let mut steps = Vec::with_capacity(files.len());
    let mut stop_reason = StopReason::Completed;
    let mut total_secs = 0;

    for (i, path) in files.iter().enumerate() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let summary =
            parse_summary(&text).with_context(|| format!("Failed to parse {}", path.display()))?;
        total_secs += summary.elapsed_secs;

        let result = StepResult::from_summary(start + i * step, &summary, None);
        let decision = policy.observe(&result);
        steps.push(result);
        if let Decision::Stop(reason) = decision {
            if i + 1 < files.len() {
                warn!("Stop rule fired at {}, ignoring later files", path.display());
            }
            stop_reason = reason;
            break;
        }
    }

    let history = StepHistory {
        steps,
        stop_reason,
        started_at: chrono::Local::now(),
        total_secs,
    };
    println!("{}", render_table(&history));
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Parse {
            files,
            start,
            step,
            sla,
        } => parse(files, start, step, sla),
    }
}
