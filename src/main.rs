use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use correlator::config::Config;
use correlator::emit::result::{BlockHeader, HEADER_SIZE};
use correlator::pipeline::Pipeline;

/// Real-time streaming correlator.
#[derive(Parser)]
#[command(name = "correlator", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,

    /// Print the block headers of a correlator output file.
    Inspect {
        /// Output file written by a `file:` output.
        path: PathBuf,
    },
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Command::Version) => {
            println!("correlator {}", version::full());
            return Ok(());
        }
        Some(Command::Inspect { path }) => return inspect(path),
        None => {}
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting correlator",
    );

    // The runtime only waits for signals; the pipeline runs on its own threads.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    let pipeline = Arc::new(Pipeline::from_config(&cfg)?);

    let waiter = Arc::clone(&pipeline);
    let mut finished = tokio::task::spawn_blocking(move || waiter.wait());

    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("registering SIGTERM handler")?;

    let result = tokio::select! {
        result = &mut finished => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
            pipeline.stop();
            finished.await
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
            pipeline.stop();
            finished.await
        }
    };

    result.context("joining pipeline")??;

    tracing::info!("correlator stopped");

    Ok(())
}

/// Decode every block of an output file and print one line per block.
fn inspect(path: &Path) -> Result<()> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut header = vec![0u8; HEADER_SIZE];
    let mut payload = Vec::new();
    let mut blocks = 0usize;

    loop {
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e).context("reading block header"),
        }

        let decoded = BlockHeader::decode(&header)
            .with_context(|| format!("decoding block {blocks}"))?;

        payload.resize(decoded.payload_size(), 0);
        reader
            .read_exact(&mut payload)
            .with_context(|| format!("reading payload of block {blocks}"))?;

        let total_weight: u64 = decoded.weights.iter().map(|&w| u64::from(w)).sum();
        println!(
            "block {blocks}: subband {} receivers {} [{:.6}, {:.6}) integration {} weight {} center {} Hz",
            decoded.subband,
            decoded.nr_receivers,
            decoded.start_seconds,
            decoded.end_seconds,
            decoded.integration_factor,
            total_weight,
            decoded.center_frequency,
        );

        blocks += 1;
    }

    println!("{blocks} blocks");
    Ok(())
}
