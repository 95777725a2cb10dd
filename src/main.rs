use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::BufReader;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use logship::reporter::{ApiReporter, NoopReporter, StepLineReporter};
use logship::uploader::{LocalUploader, StoreUploader, Uploader};
use logship::{Config, Dispatcher, Error};

/// Logship - ships a build's step logs to the log store as the build runs
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the emitter pipe the executor writes log records to
    #[arg(long, default_value = "/var/run/logship/emitter")]
    emitter: PathBuf,

    /// Build whose logs are being shipped
    #[arg(long, env = "LOGSHIP_BUILD_ID")]
    build_id: String,

    /// Base URL of the log store
    #[arg(long, env = "LOGSHIP_STORE_URL", required_unless_present = "local")]
    store_url: Option<String>,

    /// Base URL of the build metadata API
    #[arg(long, env = "LOGSHIP_API_URL", required_unless_present = "local")]
    api_url: Option<String>,

    /// Bearer token for the store and API
    #[arg(long, env = "LOGSHIP_TOKEN", hide_env_values = true, required_unless_present = "local")]
    token: Option<String>,

    /// Records per chunk before rotation
    #[arg(long, default_value_t = 100)]
    lines_per_chunk: usize,

    /// Append to a local file instead of uploading to the store
    #[arg(long)]
    local: bool,

    /// Destination file for local mode
    #[arg(long, default_value = "/workspace/artifacts/build.log")]
    local_log: PathBuf,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "log shipping failed");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::from_env();
    config.lines_per_chunk = args.lines_per_chunk;

    let (uploader, reporter): (Arc<dyn Uploader>, Arc<dyn StepLineReporter>) = if args.local {
        (
            Arc::new(LocalUploader::new(&args.local_log)),
            Arc::new(NoopReporter),
        )
    } else {
        // clap enforces these unless --local was given.
        let store_url = args.store_url.context("--store-url is required")?;
        let api_url = args.api_url.context("--api-url is required")?;
        let token = args.token.context("--token is required")?;

        (
            Arc::new(StoreUploader::new(
                &args.build_id,
                &store_url,
                &token,
                &config,
            )?),
            Arc::new(ApiReporter::new(&args.build_id, &api_url, &token, &config)?),
        )
    };

    info!(build_id = %args.build_id, emitter = %args.emitter.display(), "processing build logs");

    let emitter = open_emitter(&args.emitter, config.startup_timeout).await?;
    Dispatcher::new(uploader, reporter, config)
        .run(BufReader::new(emitter))
        .await?;

    info!("all step logs shipped");
    Ok(())
}

/// Open the emitter, bounded by the startup timeout.
///
/// The emitter is a FIFO: opening blocks until the executor opens the
/// write side. If that never happens, the executor exited without
/// producing logs and there is nothing to ship.
async fn open_emitter(path: &Path, timeout: Duration) -> Result<tokio::fs::File, Error> {
    match tokio::time::timeout(timeout, tokio::fs::File::open(path)).await {
        Ok(Ok(file)) => Ok(file),
        Ok(Err(e)) => Err(Error::io(path, e)),
        Err(_) => Err(Error::StartupTimeout {
            path: path.to_path_buf(),
            seconds: timeout.as_secs(),
        }),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
