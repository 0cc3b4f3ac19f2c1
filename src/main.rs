use anyhow::{anyhow, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use credits_detector::backup::{create_backup, read_backup, restore_backup, write_backup};
use credits_detector::{
    Config, FfmpegToolkit, FileItemStore, ItemStore, ProcessPriority, ProcessingQueueController,
    TesseractClient,
};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

fn cli() -> Command {
    let library = Arg::new("library")
        .short('l')
        .long("library")
        .value_name("DIR")
        .help("Library root laid out as Series/Season N/episode files")
        .required(true);

    Command::new("Credits Detector")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Detects where end credits start and stores them as chapter markers")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file (TOML)")
                .global(true),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(
            Command::new("process")
                .about("Detect credits for a library, a series or one episode")
                .arg(library.clone())
                .arg(Arg::new("series").long("series").value_name("ID").help("Only this series"))
                .arg(
                    Arg::new("episode")
                        .long("episode")
                        .value_name("ID")
                        .help("Only this episode")
                        .conflicts_with("series"),
                )
                .arg(
                    Arg::new("dry-run")
                        .long("dry-run")
                        .help("Detect without saving markers")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("manual")
                        .long("manual")
                        .help("Process the episode even if it already has credits")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("debug-log")
                        .long("debug-log")
                        .value_name("FILE")
                        .help("Write a detailed detection log to this file"),
                ),
        )
        .subcommand(
            Command::new("backup")
                .about("Export credits markers to a JSON backup")
                .arg(library.clone())
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .value_name("FILE")
                        .required(true),
                ),
        )
        .subcommand(
            Command::new("restore")
                .about("Import credits markers from a JSON backup")
                .arg(library.clone())
                .arg(Arg::new("input").short('i').long("input").value_name("FILE").required(true))
                .arg(
                    Arg::new("overwrite")
                        .long("overwrite")
                        .help("Replace credits markers that already exist")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("serve")
                .about("Serve the processing API over HTTP")
                .arg(library)
                .arg(
                    Arg::new("port")
                        .short('p')
                        .long("port")
                        .value_name("PORT")
                        .default_value("8080")
                        .value_parser(clap::value_parser!(u16)),
                ),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let default_filter = if matches.get_flag("verbose") {
        "credits_detector=debug,info"
    } else {
        "credits_detector=info,warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_config(matches.get_one::<String>("config").map(Path::new))?;

    match matches.subcommand() {
        Some(("process", args)) => run_process(config, args).await,
        Some(("backup", args)) => run_backup(args).await,
        Some(("restore", args)) => run_restore(args).await,
        Some(("serve", args)) => run_serve(config, args).await,
        _ => Err(anyhow!("No command given")),
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path)?,
        None => Config::load().unwrap_or_else(|e| {
            warn!("Failed to load config, using defaults: {}", e);
            Config::default()
        }),
    };
    config.validate()?;
    info!("🔧 {}", config.summary());
    Ok(config)
}

fn open_library(args: &ArgMatches) -> Result<Arc<FileItemStore>> {
    let root = args
        .get_one::<String>("library")
        .ok_or_else(|| anyhow!("--library is required"))?;
    Ok(Arc::new(FileItemStore::open(root)?))
}

fn build_controller(
    config: &Config,
    store: Arc<FileItemStore>,
) -> Result<ProcessingQueueController> {
    let priority = Arc::new(ProcessPriority::new());
    let media = Arc::new(FfmpegToolkit::new(config.media.clone(), Arc::clone(&priority)));
    let ocr = Arc::new(TesseractClient::new(&config.ocr)?);
    Ok(ProcessingQueueController::with_services(
        config.clone(),
        store,
        media,
        ocr,
        priority,
    ))
}

async fn run_process(config: Config, args: &ArgMatches) -> Result<()> {
    let store = open_library(args)?;
    let controller = build_controller(&config, Arc::clone(&store))?;
    let dry_run = args.get_flag("dry-run");
    let debug_log = args.get_one::<String>("debug-log").map(PathBuf::from);

    if debug_log.is_some() {
        controller.start_debug_capture();
    }

    info!("🚀 Credits detection starting{}", if dry_run { " (dry run)" } else { "" });
    let start_time = Instant::now();

    if let Some(id) = args.get_one::<String>("episode") {
        let episode = store
            .get_by_id(id)
            .await?
            .ok_or_else(|| anyhow!("Episode not found: {}", id))?;
        let result = controller.enqueue(episode, args.get_flag("manual"), dry_run).await;
        info!("📥 Episode {:?}", result);
    } else if let Some(series) = args.get_one::<String>("series") {
        controller.enqueue_series(series, dry_run).await?;
    } else {
        controller.enqueue_library(dry_run).await?;
    }

    wait_for_completion(&controller).await;

    let progress = controller.get_progress();
    info!("🎉 {} in {:.1}s", progress.status, start_time.elapsed().as_secs_f64());
    for (label, timestamp) in &progress.success_details {
        info!("✅ {}: {}", label, timestamp);
    }
    for (label, reason) in &progress.failure_reasons {
        warn!("❌ {}: {}", label, reason);
    }
    info!(
        "📊 {} succeeded, {} failed ({:.1}% success rate)",
        progress.successful_items,
        progress.failed_items,
        progress.success_rate()
    );

    if let Some(path) = debug_log {
        match controller.retrieve_debug_log() {
            Some(log) => {
                tokio::fs::write(&path, log).await?;
                info!("🐞 Debug log written to {}", path.display());
            }
            None => warn!("No debug log was captured"),
        }
    }

    Ok(())
}

/// Poll progress until the worker is done; Ctrl-C cancels the run
async fn wait_for_completion(controller: &ProcessingQueueController) {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl-C: {}", e);
                }
                warn!("🛑 Interrupted, cancelling");
                controller.cancel();
                while controller.is_worker_active() {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                return;
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {
                let progress = controller.get_progress();
                if !progress.is_running && !controller.is_worker_active() {
                    return;
                }
                info!(
                    "⏳ {} {}/{} {}",
                    progress.status,
                    progress.processed_items,
                    progress.total_items,
                    progress.current_item.as_deref().unwrap_or("")
                );
            }
        }
    }
}

async fn run_backup(args: &ArgMatches) -> Result<()> {
    let store = open_library(args)?;
    let output = args
        .get_one::<String>("output")
        .ok_or_else(|| anyhow!("--output is required"))?;

    let backup = create_backup(store.as_ref()).await?;
    write_backup(&backup, Path::new(output)).await?;
    info!(
        "💾 Saved {} credits markers ({} episodes scanned) to {}",
        backup.episodes_with_credits, backup.total_episodes, output
    );
    Ok(())
}

async fn run_restore(args: &ArgMatches) -> Result<()> {
    let store = open_library(args)?;
    let input = args
        .get_one::<String>("input")
        .ok_or_else(|| anyhow!("--input is required"))?;

    let backup = read_backup(Path::new(input)).await?;
    let summary = restore_backup(store.as_ref(), &backup, args.get_flag("overwrite")).await?;
    info!(
        "♻️ Restored {} markers, kept {}, {} entries had no matching episode",
        summary.restored, summary.skipped_existing, summary.not_found
    );
    Ok(())
}

#[cfg(feature = "api")]
async fn run_serve(config: Config, args: &ArgMatches) -> Result<()> {
    let store = open_library(args)?;
    let port = args.get_one::<u16>("port").copied().unwrap_or(8080);
    let controller = build_controller(&config, Arc::clone(&store))?;
    credits_detector::api::ApiServer::new(controller, store, port).start().await
}

#[cfg(not(feature = "api"))]
async fn run_serve(_config: Config, _args: &ArgMatches) -> Result<()> {
    Err(anyhow!("This build has no HTTP API; rebuild with `--features api`"))
}
