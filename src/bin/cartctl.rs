//! cartctl – operator CLI over the lecture cart.
//!
//! Startup order:
//! 1. Parse arguments and load configuration (file, then environment, then flags).
//! 2. Initialise tracing.
//! 3. Restore the cart from SQLite and spawn the runtime.
//! 4. Run the subcommand and flush state on exit.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use walkdir::WalkDir;

use lecturecart::{
    analyzer::{FileDescriptor, UploadOptions, worker::AnalyzerWorker},
    api::{BatchApi, http::HttpGateway},
    config::CartConfig,
    core::store::StoreChange,
    engine::cart::{CartEngine, RunOptions, RunOutcome},
    item::ItemDraft,
    persist::{restore_store, sqlite::SqliteStateSink},
    runtime::{events::CartEvent, handle::spawn_cart},
    types::{ItemId, OnCompletion, Parallelism, PresetId},
};

#[derive(Debug, Parser)]
#[command(name = "cartctl", version, about = "Manage and run the lecture task cart")]
struct Cli {
    /// TOML config file; environment variables still apply on top.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database holding the cart.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Batch gateway base URL; omit to simulate runs locally.
    #[arg(long, global = true)]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Classify a directory of lecture files into an upload plan.
    Analyze {
        dir: PathBuf,
        /// Print the full plan as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Add an item to the cart.
    Add {
        title: String,
        #[arg(long, default_value = "transcribe")]
        action: String,
        #[arg(long)]
        lecture: Option<String>,
        #[arg(long, default_value_t = 0)]
        est_ms: u64,
    },
    /// List cart items.
    List,
    /// Remove an item by id.
    Remove { id: ItemId },
    /// Empty the cart.
    Clear,
    /// Set run configuration.
    Set {
        /// `auto`, `1`, `2` or `4`.
        #[arg(long)]
        parallelism: Option<String>,
        /// `notify`, `shutdown` or `nothing`.
        #[arg(long)]
        on_completion: Option<String>,
    },
    /// Submit the cart and follow the batch until it completes.
    Run {
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        preset_name: Option<String>,
    },
    /// Manage saved presets.
    Presets {
        #[command(subcommand)]
        action: PresetCommand,
    },
}

#[derive(Debug, Subcommand)]
enum PresetCommand {
    List,
    Save { name: String },
    Load { id: PresetId },
    Delete { id: PresetId },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => CartConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?
            .with_env(),
        None => CartConfig::from_env(),
    };
    if let Some(db) = cli.db.clone() {
        cfg.db_path = db;
    }
    if let Some(url) = cli.api_url.clone() {
        cfg.api_url = Some(url);
    }

    init_tracing(&cfg);
    info!(version = env!("CARGO_PKG_VERSION"), "cartctl starting");

    if let Command::Analyze { dir, json } = &cli.command {
        return analyze_dir(dir, *json).await;
    }

    let sink = SqliteStateSink::open(&cfg.db_path)
        .with_context(|| format!("opening {}", cfg.db_path.display()))?;
    let store = restore_store(&sink);
    let handle = spawn_cart(store, Some(Box::new(sink)), cfg.runtime_config());

    let api: Option<Arc<dyn BatchApi>> = match &cfg.api_url {
        Some(url) => Some(Arc::new(HttpGateway::new(url.clone(), cfg.request_timeout())?)),
        None => None,
    };
    let engine = CartEngine::new(handle.clone(), api, cfg.engine_config());

    let outcome = dispatch(&engine, cli.command).await;
    engine.dispose().await;
    handle.shutdown().await?;
    outcome
}

fn init_tracing(cfg: &CartConfig) {
    let env_filter = match tracing_subscriber::EnvFilter::try_from_env("LECTURECART_LOG") {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: log level '{}' is not a valid tracing filter ({}); falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

async fn dispatch(engine: &CartEngine, command: Command) -> anyhow::Result<()> {
    let handle = engine.handle();
    match command {
        Command::Analyze { dir, json } => analyze_dir(&dir, json).await?,
        Command::Add {
            title,
            action,
            lecture,
            est_ms,
        } => {
            let mut draft = ItemDraft::new(title, action).with_est_ms(est_ms);
            if let Some(lecture) = lecture {
                draft = draft.with_lecture(lecture);
            }
            let id = handle.add_item(draft).await?;
            println!("{id}");
        }
        Command::List => {
            let snapshot = engine.snapshot().await?;
            for item in &snapshot.items {
                println!(
                    "{}  {:<8} {:<16} {}",
                    item.id,
                    item.state.as_str(),
                    item.action,
                    item.title
                );
            }
            if let Some(batch) = &snapshot.active_batch_id {
                println!("active batch: {batch}");
            }
        }
        Command::Remove { id } => {
            if !engine.remove_item(id).await? {
                bail!("no item {id}");
            }
        }
        Command::Clear => handle.clear().await?,
        Command::Set {
            parallelism,
            on_completion,
        } => {
            if let Some(p) = parallelism {
                let p: Parallelism = serde_json::from_value(parse_scalar(&p))
                    .with_context(|| format!("invalid parallelism '{p}'"))?;
                engine.set_parallelism(p).await?;
            }
            if let Some(c) = on_completion {
                let c: OnCompletion = serde_json::from_value(serde_json::Value::String(c.clone()))
                    .with_context(|| format!("invalid completion behavior '{c}'"))?;
                engine.set_on_completion(c).await?;
            }
        }
        Command::Run {
            dry_run,
            preset_name,
        } => run(engine, RunOptions { dry_run, preset_name }).await?,
        Command::Presets { action } => match action {
            PresetCommand::List => {
                for preset in engine.snapshot().await?.presets {
                    println!("{}  {} ({} items)", preset.id, preset.name, preset.items.len());
                }
            }
            PresetCommand::Save { name } => {
                let preset = engine.save_preset(&name).await?;
                println!("{}", preset.id);
            }
            PresetCommand::Load { id } => engine.load_preset(id).await?,
            PresetCommand::Delete { id } => {
                if !engine.delete_preset(id).await? {
                    bail!("no preset {id}");
                }
            }
        },
    }
    Ok(())
}

async fn run(engine: &CartEngine, options: RunOptions) -> anyhow::Result<()> {
    let mut events = engine.subscribe();
    let batch_id = match engine.run(options).await? {
        RunOutcome::Validated { count } => {
            println!("validated {count} tasks");
            return Ok(());
        }
        RunOutcome::Started { batch_id } | RunOutcome::Simulated { batch_id } => batch_id,
    };
    println!("batch {batch_id} started");

    loop {
        match events.recv().await {
            Ok(CartEvent::Store(StoreChange::ItemStateChanged { id, state })) => {
                println!("{id}  {}", state.as_str());
            }
            Ok(CartEvent::Notice(notice)) => println!("{}: {}", notice.title, notice.description),
            Ok(CartEvent::BatchCompleted { batch_id: done }) if done == batch_id => break,
            Ok(CartEvent::Store(StoreChange::ActiveBatchChanged { batch_id: active }))
                if active.as_ref() != Some(&batch_id) =>
            {
                break;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "event stream lagged"),
            Err(RecvError::Closed) => break,
        }
    }
    Ok(())
}

fn parse_scalar(raw: &str) -> serde_json::Value {
    raw.parse::<u64>()
        .map(serde_json::Value::from)
        .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

async fn analyze_dir(dir: &Path, json: bool) -> anyhow::Result<()> {
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .into_owned();
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        let name = entry.file_name().to_string_lossy().into_owned();
        files.push(FileDescriptor::new(name, relative, size));
    }

    let mut worker = AnalyzerWorker::spawn();
    let ticket = worker.submit(files, UploadOptions::default()).await?;
    let plan = ticket
        .wait_with(|fraction| tracing::debug!(fraction, "analysis progress"))
        .await
        .context("analysis was abandoned")?;
    worker.shutdown().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        for item in &plan.items {
            println!(
                "{:<10} {} / {} / {}  ({})",
                format!("{:?}", item.asset_type).to_lowercase(),
                item.hierarchy.class,
                item.hierarchy.module,
                item.hierarchy.lecture,
                item.file.relative_path
            );
        }
        println!(
            "{} files, {} bytes, {} classes, {} modules, {} lectures",
            plan.items.len(),
            plan.total_bytes,
            plan.counts.classes,
            plan.counts.modules,
            plan.counts.lectures
        );
    }
    Ok(())
}
