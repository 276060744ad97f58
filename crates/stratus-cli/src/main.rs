use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use stratus_core::domain::TaskStatus;
use stratus_core::impls::{LocalMirrorUploader, SqliteTaskStore};
use stratus_core::ports::TaskStore;
use stratus_core::{AppBuilder, AppConfig, StatusReport};

#[derive(Parser, Debug)]
#[command(name = "stratus", about = "Uploads recorded folders and cleans up after them")]
struct Cli {
    /// TOML config file. Defaults apply when omitted
    #[arg(short, long, value_name = "FILE", env = "STRATUS_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the scheduler until Ctrl-C
    Run {
        /// Mirror root for the local uploader
        #[arg(long, value_name = "DIR")]
        mirror: PathBuf,
    },
    /// Queue a recorded folder for upload
    Enqueue {
        folder: PathBuf,
        /// Account to share the upload with (repeatable)
        #[arg(long = "share", value_name = "ID")]
        share: Vec<String>,
    },
    /// Show counts by status and every failed task
    Status,
    /// Move a failed task back to processed
    Retry { folder: PathBuf },
    /// Run a single dispatch cycle and exit
    Once {
        #[arg(long, value_name = "DIR")]
        mirror: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(AppConfig::default()),
    }
}

async fn open_store(config: &AppConfig) -> anyhow::Result<SqliteTaskStore> {
    SqliteTaskStore::open(&config.database_path, config.max_connections)
        .await
        .with_context(|| format!("opening task store {}", config.database_path.display()))
}

async fn run(config: AppConfig, mirror: PathBuf) -> anyhow::Result<()> {
    let mut app = AppBuilder::new(config).build().await?;
    let job = app.register_uploader(LocalMirrorUploader::new(mirror)).await?;
    app.start()?;
    info!(job = %job, "running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("shutdown requested");
    app.shutdown().await;
    Ok(())
}

async fn once(config: AppConfig, mirror: PathBuf) -> anyhow::Result<()> {
    let mut app = AppBuilder::new(config).build().await?;
    app.register_uploader(LocalMirrorUploader::new(mirror)).await?;
    let reports = app.run_dispatch_now().await;
    app.shutdown().await;

    for report in &reports {
        println!("{}", serde_json::to_string(report)?);
    }
    if reports.iter().any(|r| r.skipped) {
        bail!("task store was unavailable");
    }
    Ok(())
}

async fn enqueue(config: &AppConfig, folder: &Path, share: &[String]) -> anyhow::Result<()> {
    let folder = std::fs::canonicalize(folder)
        .with_context(|| format!("resolving {}", folder.display()))?;
    if !folder.is_dir() {
        bail!("{} is not a directory", folder.display());
    }

    let store = open_store(config).await?;
    let result = store
        .insert_task(&folder, share, TaskStatus::Processed)
        .await;
    store.close().await;
    result?;

    println!("queued {}", folder.display());
    Ok(())
}

async fn status(config: &AppConfig) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let report = StatusReport::collect(&store).await;
    store.close().await;
    let report = report?;

    if report.is_idle() {
        println!("no tasks");
        return Ok(());
    }
    let counts = &report.counts;
    println!(
        "processed={} uploading={} failed={}",
        counts.processed, counts.uploading, counts.failed
    );
    for task in &report.failed {
        println!(
            "failed {} attempts={} error={}",
            task.path().display(),
            task.attempts,
            task.last_error.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn retry(config: &AppConfig, folder: &Path) -> anyhow::Result<()> {
    // 既に消えている folder の行も扱えるよう canonicalize できなければそのまま使う
    let folder = std::fs::canonicalize(folder).unwrap_or_else(|_| folder.to_path_buf());

    let store = open_store(config).await?;
    let result = store.retry_failed(&folder).await;
    store.close().await;

    if !result? {
        bail!("no failed task for {}", folder.display());
    }
    println!("requeued {}", folder.display());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run { mirror } => run(config, mirror).await,
        Commands::Once { mirror } => once(config, mirror).await,
        Commands::Enqueue { folder, share } => enqueue(&config, &folder, &share).await,
        Commands::Status => status(&config).await,
        Commands::Retry { folder } => retry(&config, &folder).await,
    }
}
