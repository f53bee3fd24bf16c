//! # Loadstep Generator CLI
//!
//! Runs one load test and prints the run summary.
//!
//! ## Usage
//!
//! ```bash
//! loadstep-gen -u http://10.0.0.5:8070/ocr -c 100 -t 120
//! loadstep-gen -f urls.txt -c 20 -r 1000 --cookie usrId=6 --auth "Bearer abc"
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use loadstep_gen::logging::{init_tracing, LogFormat};
use loadstep_gen::{ApdexThreshold, Generator, GeneratorConfig, ShuffleMode, TransportConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "loadstep-gen")]
#[command(version)]
#[command(about = "Concurrent HTTP load generator", long_about = None)]
struct Cli {
    /// Target URL
    #[arg(short, long)]
    url: Option<String>,

    /// URL file path (line separated, with WEIGHT lines)
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Number of concurrent clients
    #[arg(short, long, default_value = "100")]
    concurrency: usize,

    /// Number of requests per client
    #[arg(short, long, conflicts_with = "duration")]
    requests: Option<u64>,

    /// Period of time in seconds
    #[arg(short = 't', long)]
    duration: Option<u64>,

    /// Do HTTP keep-alive
    #[arg(short, long, default_value = "true", action = clap::ArgAction::Set)]
    keep_alive: bool,

    /// HTTP POST data file path
    #[arg(short = 'd', long)]
    post_data: Option<PathBuf>,

    /// Write timeout in milliseconds
    #[arg(long, default_value = "5000")]
    write_timeout: u64,

    /// Read timeout in milliseconds
    #[arg(long, default_value = "5000")]
    read_timeout: u64,

    /// Authorization header
    #[arg(long)]
    auth: Option<String>,

    /// Cookie in name=value form
    #[arg(long)]
    cookie: Option<String>,

    /// Expected string pattern in the response body
    #[arg(short, long)]
    expect: Option<String>,

    /// Apdex thresholds in milliseconds, satisfied:tolerated
    #[arg(long)]
    apdex: Option<ApdexThreshold>,

    /// URL list permutation: compatible or uniform
    #[arg(long, default_value = "compatible")]
    shuffle: ShuffleMode,

    /// Verify TLS certificates
    #[arg(long)]
    verify_tls: bool,

    /// Write the summary as JSON to this file
    #[arg(long)]
    json: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: LogFormat,
}

impl Cli {
    fn into_config(self) -> GeneratorConfig {
        GeneratorConfig {
            url: self.url,
            url_file: self.file,
            concurrency: self.concurrency,
            requests: self.requests,
            duration_secs: self.duration,
            post_data_file: self.post_data,
            expect: self.expect,
            apdex: self.apdex,
            shuffle: self.shuffle,
            transport: TransportConfig {
                keep_alive: self.keep_alive,
                write_timeout_ms: self.write_timeout,
                read_timeout_ms: self.read_timeout,
                auth_header: self.auth,
                cookie: self.cookie,
                verify_tls: self.verify_tls,
                pool_size: self.concurrency,
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let json_path = cli.json.clone();
    let generator = Generator::new(cli.into_config())?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, waiting for in-flight requests");
            interrupt.cancel();
        }
    });

    info!("Waiting for results...");
    let summary = generator.run(&cancel).await?;
    println!("{}", summary);

    if let Some(path) = json_path {
        let json = serde_json::to_string_pretty(&summary)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Results saved to {}", path.display());
    }

    Ok(())
}
