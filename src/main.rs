#![allow(clippy::multiple_crate_versions)]

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use preset_fetch::config::Config;
use preset_fetch::download::disk::format_bytes;
use preset_fetch::download::installed::ledger_path;
use preset_fetch::download::{InstallLedger, Scheduler, SchedulerOptions, TaskState};
use preset_fetch::integrity::repair_scan;
use preset_fetch::progress::{ProgressEvent, RunId, StateStore};
use preset_fetch::registry::{self, HubRevisionProbe, LoadedRegistry, RegistryLoader};
use preset_fetch::resolver::{self, Resolution};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::EnvFilter;

/// Some tasks failed, were cancelled, or presets could not be resolved
const EXIT_PARTIAL: i32 = 1;
/// Registry, manifest or config error before any download
const EXIT_FATAL: i32 = 2;

#[derive(Parser)]
#[command(name = "preset-fetch")]
#[command(about = "Resolve model presets and download their files", long_about = None)]
struct Cli {
    /// Config file (default: ~/.config/preset-fetch/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download presets; ids default to the selection variable
    Download {
        presets: Vec<String>,
        /// Target root directory
        #[arg(long)]
        target: Option<PathBuf>,
        #[arg(long)]
        concurrency: Option<usize>,
        /// Re-download files that are already present
        #[arg(long)]
        force: bool,
        /// Hash existing files before skipping them
        #[arg(long)]
        verify_existing: bool,
        /// Print the terminal report as JSON
        #[arg(long)]
        json: bool,
        /// No progress bars
        #[arg(long, short)]
        quiet: bool,
    },
    /// Refresh the registry cache and report upstream drift
    Sync {
        #[arg(long)]
        json: bool,
    },
    /// Check installed files of presets without downloading
    Verify {
        presets: Vec<String>,
        #[arg(long)]
        target: Option<PathBuf>,
    },
    /// List presets in the registry
    List {
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        target: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            EXIT_FATAL
        }
    };
    std::process::exit(code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = match &cli.config {
        Some(path) => {
            let mut config = Config::load_from(path)?;
            config.apply_env_overrides();
            config
        }
        None => Config::load()?,
    };

    match cli.command {
        Commands::Download {
            presets,
            target,
            concurrency,
            force,
            verify_existing,
            json,
            quiet,
        } => {
            let mut options = SchedulerOptions::from_config(&config.download);
            options.force = force;
            options.verify_existing |= verify_existing;
            if let Some(concurrency) = concurrency {
                options.concurrency = concurrency.max(1);
            }
            let target = target.unwrap_or_else(|| config.download.target_root.clone());
            download(&config, presets, target, options, json, quiet).await
        }
        Commands::Sync { json } => sync(&config, json).await,
        Commands::Verify { presets, target } => {
            let target = target.unwrap_or_else(|| config.download.target_root.clone());
            verify(&config, presets, target).await
        }
        Commands::List { category, target } => {
            let target = target.unwrap_or_else(|| config.download.target_root.clone());
            list(&config, category.as_deref(), target).await
        }
    }
}

async fn load_registry(config: &Config) -> anyhow::Result<LoadedRegistry> {
    let loader = RegistryLoader::from_config(&config.registry)?;
    let loaded = loader.load().await.context("Failed to load registry")?;

    if let Some(reason) = &loaded.degraded_reason {
        tracing::warn!("Using cached registry, refresh failed: {reason}");
    }
    for alert in &loaded.registry.alerts {
        tracing::warn!("Registry {}: {}", alert.level, alert.message);
    }
    Ok(loaded)
}

fn selected(config: &Config, presets: Vec<String>) -> anyhow::Result<Vec<String>> {
    let ids = if presets.is_empty() {
        config.selection()
    } else {
        presets
    };
    if ids.is_empty() {
        anyhow::bail!(
            "No presets selected. Pass preset ids or set {}",
            config.selection.env
        );
    }
    Ok(ids)
}

fn resolve_selected(ids: &[String], loaded: &LoadedRegistry) -> anyhow::Result<Resolution> {
    // Unknown ids and cycles are logged by the resolver and end up in the report
    resolver::resolve(ids, &loaded.registry).context("Failed to resolve presets")
}

async fn download(
    config: &Config,
    presets: Vec<String>,
    target: PathBuf,
    options: SchedulerOptions,
    json: bool,
    quiet: bool,
) -> anyhow::Result<i32> {
    let ids = selected(config, presets)?;
    let loaded = load_registry(config).await?;
    let resolution = resolve_selected(&ids, &loaded)?;

    tokio::fs::create_dir_all(&target)
        .await
        .with_context(|| format!("Failed to create {}", target.display()))?;

    let store = StateStore::new();
    let scheduler = Scheduler::http(options, store.clone())?;
    let run_id = RunId::new();

    let renderer = (!quiet).then(|| tokio::spawn(render_progress(store.subscribe(), run_id)));
    let interrupt = {
        let store = store.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, cancelling run {run_id}");
                store.cancel_run(run_id);
            }
        })
    };

    let report = scheduler
        .run_with_id(run_id, &resolution.manifest, &target)
        .await
        .with_resolution(&resolution);

    interrupt.abort();
    if let Some(renderer) = renderer {
        let _ = renderer.await;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{report}");
    }

    Ok(if report.is_success() { 0 } else { EXIT_PARTIAL })
}

fn make_progress_bar(size: u64, name: &str) -> ProgressBar {
    let bar = ProgressBar::new(size);
    let style = ProgressStyle::with_template(
        "{spinner:.cyan} [{bar:40.cyan/blue}] {bytes}/{total_bytes} @ {bytes_per_sec} - {msg}",
    )
    .map_or_else(|_| ProgressStyle::default_bar(), |s| s.progress_chars("━━╌"));
    bar.set_style(style);
    bar.set_message(name.to_string());
    bar
}

/// Draw one bar per active transfer until the run finishes
async fn render_progress(mut events: broadcast::Receiver<ProgressEvent>, run_id: RunId) {
    let multi = MultiProgress::new();
    let mut bars: HashMap<usize, ProgressBar> = HashMap::new();

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        };
        if event.run_id() != run_id {
            continue;
        }

        match event {
            ProgressEvent::Started {
                task_id,
                path,
                attempt,
                bytes_total,
                ..
            } => {
                let bar = bars
                    .entry(task_id)
                    .or_insert_with(|| multi.add(make_progress_bar(bytes_total, &path)));
                bar.reset();
                bar.set_length(bytes_total);
                if attempt > 1 {
                    bar.set_message(format!("{path} (attempt {attempt})"));
                }
            }
            ProgressEvent::Progress {
                task_id, bytes_done, ..
            } => {
                if let Some(bar) = bars.get(&task_id) {
                    bar.set_position(bytes_done);
                }
            }
            ProgressEvent::Complete {
                task_id,
                path,
                state,
                ..
            } => match bars.remove(&task_id) {
                Some(bar) => bar.finish_with_message(format!("{path} {state}")),
                None if state == TaskState::Skipped => {
                    let _ = multi.println(format!("{path} already present"));
                }
                None => {}
            },
            ProgressEvent::Error {
                task_id,
                path,
                kind,
                message,
                ..
            } => {
                if let Some(bar) = bars.get(&task_id) {
                    bar.set_message(format!("{path} [{kind}] {message}"));
                }
            }
            ProgressEvent::StateChanged { task_id, state, .. } => {
                if state.is_terminal() {
                    if let Some(bar) = bars.remove(&task_id) {
                        bar.abandon_with_message(state.to_string());
                    }
                }
            }
            ProgressEvent::RunFinished { .. } => break,
        }
    }
}

async fn sync(config: &Config, json: bool) -> anyhow::Result<i32> {
    let loader = RegistryLoader::from_config(&config.registry)?;
    let probe = HubRevisionProbe::new(&config.registry.hub_endpoint)
        .with_timeout(Duration::from_secs(config.registry.timeout_secs));
    let report = registry::sync(&loader, &probe)
        .await
        .context("Registry sync failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(0);
    }

    println!(
        "Registry {} ({} presets, generated {}){}",
        report.version,
        report.preset_count,
        report.generated_at,
        if report.refreshed { "" } else { " [cached]" }
    );
    for id in &report.updates_available {
        println!("  update available: {id}");
    }
    for drift in &report.drift {
        println!(
            "  drift: {}/{} pinned {} upstream {}",
            drift.preset_id, drift.path, drift.pinned, drift.upstream
        );
    }
    for unchecked in &report.unchecked {
        tracing::debug!("Unchecked {}/{}: {}", unchecked.preset_id, unchecked.path, unchecked.reason);
    }
    for alert in &report.alerts {
        println!("  {}: {}", alert.level, alert.message);
    }
    Ok(0)
}

async fn verify(config: &Config, presets: Vec<String>, target: PathBuf) -> anyhow::Result<i32> {
    let loaded = load_registry(config).await?;
    let ids = if presets.is_empty() {
        let selection = config.selection();
        if selection.is_empty() {
            loaded
                .registry
                .all_ids()
                .into_iter()
                .map(str::to_string)
                .collect()
        } else {
            selection
        }
    } else {
        presets
    };
    let resolution = resolve_selected(&ids, &loaded)?;

    let report = repair_scan(&resolution.manifest, &target, config.download.concurrency).await;
    println!(
        "{} healthy, {} missing, {} corrupt",
        report.healthy.len(),
        report.missing.len(),
        report.corrupt.len()
    );
    for corrupt in &report.corrupt {
        println!("  CORRUPT {} ({}): {}", corrupt.path, corrupt.preset_id, corrupt.error);
    }
    if !report.corrupt.is_empty() {
        println!("Re-fetch with `preset-fetch download --force` or delete the files above");
    }

    Ok(if report.corrupt.is_empty() { 0 } else { EXIT_PARTIAL })
}

async fn list(config: &Config, category: Option<&str>, target: PathBuf) -> anyhow::Result<i32> {
    let loaded = load_registry(config).await?;
    let ledger = InstallLedger::load(&ledger_path(&target)).unwrap_or_else(|e| {
        tracing::warn!("Ignoring unreadable install ledger: {e}");
        InstallLedger::default()
    });

    let presets = match category {
        Some(category) => loaded.registry.by_category(category),
        None => loaded.registry.presets.values().collect(),
    };

    for preset in presets {
        let mut flags = Vec::new();
        if ledger.is_installed(preset) {
            flags.push("installed");
        }
        if preset.has_update() {
            flags.push("update");
        }
        println!(
            "{:<28} {:<12} {:>10} {:>10}  {}",
            preset.id,
            preset.category,
            preset.size,
            format_bytes(preset.declared_bytes()),
            flags.join(",")
        );
    }
    Ok(0)
}
