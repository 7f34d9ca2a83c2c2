pub mod log_line;
pub mod log_tailer;
pub mod replay;
pub mod settings;
pub mod storage;
pub mod telemetry;
pub mod tracker;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use log_tailer::LogTailer;
use replay::BackfillOptions;
use settings::Settings;
use storage::{Database, LogStream};
use telemetry::terrain::AnvilTerrain;
use tracker::{ChatTracker, TelemetryReconstructor};

const DEFAULT_LOG_FILTER: &str = "info,zero_dash_lib=debug";
const WORKER_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "zero-dash", about = "Attempt tracker for zero-cycle practice runs", version)]
struct Cli {
    /// JSON settings file; `ZERO_DASH_*` variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Tail the configured logs and record attempts until Ctrl+C (default).
    Watch,

    /// Rebuild chat attempts from the stored chat lines.
    Rebuild,

    /// Re-import chat history from a client logs directory.
    Backfill {
        /// Defaults to the folder of the configured chat log.
        #[arg(long)]
        logs_dir: Option<PathBuf>,
        #[arg(long, default_value_t = 3)]
        days: u32,
        /// Import from the first line instead of the first context marker.
        #[arg(long)]
        from_start: bool,
        /// End the import at the first context marker.
        #[arg(long)]
        stop_on_zdash: bool,
        /// Only start attempts that have a fresh context marker.
        #[arg(long)]
        require_context: bool,
    },

    /// Print a decoded telemetry snapshot as JSON.
    InspectSnapshot {
        file: PathBuf,
        /// World folder whose End terrain is probed for tower heights.
        #[arg(long)]
        world: Option<PathBuf>,
        #[arg(long)]
        window_ticks: Option<i64>,
    },
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn open_database(settings: &Settings) -> anyhow::Result<Arc<Database>> {
    let database = Database::open(&settings.database_path).with_context(|| {
        format!(
            "Failed to open database '{}'",
            settings.database_path.display()
        )
    })?;
    Ok(Arc::new(database))
}

fn spawn_workers(
    settings: &Settings,
    database: &Arc<Database>,
    stop: &Arc<AtomicBool>,
) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let mut workers = Vec::new();

    if let Some(chat_log_path) = &settings.chat_log_path {
        let tracker = ChatTracker::new(Arc::clone(database), settings.chat_tracker_config())?;
        let tailer = LogTailer::new(
            Arc::clone(database),
            LogStream::Chat,
            chat_log_path.clone(),
            Box::new(tracker),
            settings.poll_interval,
        );
        workers.push(tailer.spawn(Arc::clone(stop)).map_err(anyhow::Error::msg)?);
    }

    if let Some(telemetry_log_path) = &settings.telemetry_log_path {
        let saves_dir = settings
            .resolved_saves_dir()
            .context("No saves directory for telemetry; set ZERO_DASH_SAVES_DIR")?;
        let reconstructor = TelemetryReconstructor::new(
            Arc::clone(database),
            settings.telemetry_config(saves_dir),
            Box::new(AnvilTerrain),
        )?;
        let tailer = LogTailer::new(
            Arc::clone(database),
            LogStream::Telemetry,
            telemetry_log_path.clone(),
            Box::new(reconstructor),
            settings.poll_interval,
        );
        workers.push(tailer.spawn(Arc::clone(stop)).map_err(anyhow::Error::msg)?);
    }

    Ok(workers)
}

fn watch(settings: &Settings) -> anyhow::Result<()> {
    let database = open_database(settings)?;
    let stop = Arc::new(AtomicBool::new(false));
    let workers = spawn_workers(settings, &database, &stop)?;
    if workers.is_empty() {
        anyhow::bail!("No log configured; set ZERO_DASH_LOG_PATH or ZERO_DASH_TELEMETRY_LOG_PATH");
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build signal runtime")?;
    runtime.block_on(async {
        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(error) = result {
                        tracing::warn!(error = %error, "Failed to listen for Ctrl+C");
                    }
                    tracing::info!("Stopping log tailers");
                    break;
                }
                _ = tokio::time::sleep(WORKER_CHECK_INTERVAL) => {
                    if workers.iter().all(|worker| worker.is_finished()) {
                        tracing::warn!("All log tailers exited");
                        break;
                    }
                }
            }
        }
    });

    stop.store(true, Ordering::Relaxed);
    for worker in workers {
        if worker.join().is_err() {
            tracing::error!("Log tailer thread panicked");
        }
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn run() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())
        .map_err(anyhow::Error::msg)
        .context("Failed to load settings")?;

    match cli.command.unwrap_or(Commands::Watch) {
        Commands::Watch => watch(&settings),
        Commands::Rebuild => {
            let database = open_database(&settings)?;
            let report = replay::rebuild_chat_attempts(&database, settings.chat_tracker_config())?;
            print_json(&report)
        }
        Commands::Backfill {
            logs_dir,
            days,
            from_start,
            stop_on_zdash,
            require_context,
        } => {
            let logs_dir = logs_dir
                .or_else(|| {
                    settings
                        .chat_log_path
                        .as_deref()
                        .and_then(|path| path.parent())
                        .map(PathBuf::from)
                })
                .context("No logs directory; pass --logs-dir or set ZERO_DASH_LOG_PATH")?;
            let options = BackfillOptions {
                days,
                start_on_context: !from_start,
                stop_on_context: stop_on_zdash,
                tracker: tracker::ChatTrackerConfig {
                    require_fresh_context: require_context,
                    ..settings.chat_tracker_config()
                },
            };

            let database = open_database(&settings)?;
            let report = replay::backfill_from_logs(&database, &logs_dir, &options)
                .map_err(anyhow::Error::msg)?;
            print_json(&report)
        }
        Commands::InspectSnapshot {
            file,
            world,
            window_ticks,
        } => {
            let report = telemetry::inspect_snapshot(
                &file,
                world.as_deref(),
                &AnvilTerrain,
                window_ticks.unwrap_or(settings.telemetry.window_ticks),
                settings.telemetry.terrain_radius,
            )
            .map_err(anyhow::Error::msg)?;
            print_json(&report)
        }
    }
}
