//! Command-line interface for voxpipe.
//!
//! Provides commands for watching a recordings directory, one-shot
//! processing, inspecting per-recording state and forcing re-processing.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::Settings;
use crate::core::{Registry, RegistryError};
use crate::domain::{ProcessingRecord, RecordingId, Stage};

pub mod daemon;

/// voxpipe - watch, transcribe, extract insights, persist
#[derive(Parser, Debug)]
#[command(name = "voxpipe")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (default: .voxpipe/config.yaml upwards, then ~/.config/voxpipe)
    #[arg(short, long, global = true, env = "VOXPIPE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scan the watch directory, then process new recordings until Ctrl+C
    Watch,

    /// Scan once, process everything pending, then exit
    Run,

    /// Show pipeline status, or one recording's state and history
    Status {
        /// Recording path or identity
        target: Option<String>,
    },

    /// List recordings
    List {
        /// Only recordings at this stage (e.g. failed, completed)
        #[arg(short, long)]
        stage: Option<Stage>,

        /// Maximum number of recordings to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Re-drive failed recordings
    Redrive {
        /// Recording path or identity
        #[arg(required_unless_present = "all_failed", conflicts_with = "all_failed")]
        target: Option<String>,

        /// Re-drive every failed recording
        #[arg(long)]
        all_failed: bool,
    },

    /// Forget a recording (its registry row, artifacts index and history)
    Purge {
        /// Recording path or identity
        target: String,
    },

    /// Show resolved configuration
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<ExitCode> {
        let settings = Settings::load(self.config.as_deref())?;

        match self.command {
            Commands::Watch => daemon::execute_watch(&settings).await,
            Commands::Run => daemon::execute_run(&settings).await,
            Commands::Status { target } => show_status(&settings, target.as_deref()),
            Commands::List { stage, limit } => list_records(&settings, stage, limit),
            Commands::Redrive { target, all_failed } => {
                redrive(&settings, target.as_deref(), all_failed)
            }
            Commands::Purge { target } => purge(&settings, &target),
            Commands::Config => show_config(&settings),
        }
    }
}

/// Open the registry, creating the home directory on first use
pub(crate) fn open_registry(settings: &Settings) -> Result<Registry> {
    std::fs::create_dir_all(&settings.home)
        .with_context(|| format!("Failed to create {}", settings.home.display()))?;
    let path = settings.registry_path();
    Registry::open(&path, settings.policies.clone())
        .with_context(|| format!("Failed to open registry at {}", path.display()))
}

/// Look a recording up by identity, then by path
fn resolve_target(registry: &Registry, target: &str) -> Result<ProcessingRecord> {
    if let Some(record) = registry.find(&RecordingId::new(target))? {
        return Ok(record);
    }

    let path = Path::new(target);
    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if let Some(record) = registry.find(&RecordingId::from_path(&path))? {
        return Ok(record);
    }
    registry
        .find_by_path(&path)?
        .with_context(|| format!("No recording matches '{}'", target))
}

fn show_status(settings: &Settings, target: Option<&str>) -> Result<ExitCode> {
    let registry = open_registry(settings)?;

    let Some(target) = target else {
        let summary = registry.summary()?;

        println!();
        println!("Voxpipe Status");
        println!("══════════════════════════════════════════════════════════════");
        println!();
        println!("Watch path:  {}", settings.watch.root.display());
        println!("Library:     {}", settings.library.display());
        println!("Registry:    {}", registry.path().display());
        println!();
        for stage in Stage::SEQUENCE.iter().chain(std::iter::once(&Stage::Failed)) {
            println!("  {:<20} {}", stage.as_str(), summary.get(*stage));
        }
        println!("  {:<20} {}", "total", summary.total());
        println!();

        let failed = summary.get(Stage::Failed);
        if failed > 0 {
            println!("{} failed; see `voxpipe list --stage failed`", failed);
            return Ok(ExitCode::from(1));
        }
        return Ok(ExitCode::SUCCESS);
    };

    let record = resolve_target(&registry, target)?;

    println!("Identity:     {}", record.identity);
    println!("Source:       {}", record.source_path.display());
    println!("Stage:        {}", record.stage);
    println!("Attempts:     {}", record.attempts);
    println!("Generation:   {}", record.generation);
    println!("Fingerprint:  {}", record.fingerprint);
    if let Some(stage) = record.failed_stage {
        println!("Failed at:    {}", stage);
    }
    if let Some(error) = &record.last_error {
        println!("Last error:   {}", error);
    }
    println!("Discovered:   {}", record.discovered_at.format("%Y-%m-%d %H:%M:%S"));
    println!("Updated:      {}", record.updated_at.format("%Y-%m-%d %H:%M:%S"));

    if !record.artifacts.is_empty() {
        println!("\nArtifacts:");
        let mut artifacts: Vec<_> = record.artifacts.values().collect();
        artifacts.sort_by_key(|a| a.created_at);
        for artifact in artifacts {
            println!("  {:<18} {}", artifact.step.as_str(), artifact.location.display());
        }
    }

    let events = registry.events(&record.identity)?;
    if !events.is_empty() {
        println!("\nHistory:");
        for event in events {
            let from = event.from_stage.map(|s| s.as_str()).unwrap_or("-");
            print!(
                "  {}  {:<17} {} → {}",
                event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                event.event_type.as_str(),
                from,
                event.to_stage
            );
            match &event.error {
                Some(error) => println!("  ({})", error),
                None => println!(),
            }
        }
    }

    Ok(if record.is_failed() {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    })
}

fn list_records(settings: &Settings, stage: Option<Stage>, limit: usize) -> Result<ExitCode> {
    let registry = open_registry(settings)?;
    let records = registry.list(stage)?;

    if records.is_empty() {
        println!("No recordings found");
        return Ok(ExitCode::SUCCESS);
    }

    println!("{:<14} {:<20} {:<9} {}", "IDENTITY", "STAGE", "ATTEMPTS", "SOURCE");
    println!("{}", "-".repeat(80));

    for record in records.iter().take(limit) {
        let name = record
            .source_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| record.source_path.display().to_string());
        println!(
            "{:<14} {:<20} {:<9} {}",
            record.identity.as_str(),
            record.stage.as_str(),
            record.attempts,
            name
        );
    }

    if records.len() > limit {
        println!("... and {} more", records.len() - limit);
    }

    Ok(ExitCode::SUCCESS)
}

fn redrive(settings: &Settings, target: Option<&str>, all_failed: bool) -> Result<ExitCode> {
    let registry = open_registry(settings)?;

    let identities: Vec<RecordingId> = if all_failed {
        registry
            .list(Some(Stage::Failed))?
            .into_iter()
            .map(|r| r.identity)
            .collect()
    } else {
        let target = target.context("Specify a recording or --all-failed")?;
        vec![resolve_target(&registry, target)?.identity]
    };

    if identities.is_empty() {
        println!("No failed recordings");
        return Ok(ExitCode::SUCCESS);
    }

    for identity in &identities {
        match registry.redrive(identity) {
            Ok(record) => println!("↻ {} → {}", identity, record.stage),
            Err(RegistryError::InvalidTransition { from, .. }) => {
                println!("  {} is {}, not failed; skipped", identity, from)
            }
            Err(e) => return Err(e.into()),
        }
    }
    println!(
        "\nA running `voxpipe watch` picks them up within {}s; otherwise run `voxpipe run`.",
        daemon::SWEEP_INTERVAL.as_secs()
    );

    Ok(ExitCode::SUCCESS)
}

fn purge(settings: &Settings, target: &str) -> Result<ExitCode> {
    let registry = open_registry(settings)?;
    let record = resolve_target(&registry, target)?;

    if registry.purge(&record.identity)? {
        println!("Purged {} ({})", record.identity, record.source_path.display());
    }
    Ok(ExitCode::SUCCESS)
}

fn show_config(settings: &Settings) -> Result<ExitCode> {
    println!("Voxpipe Configuration");
    println!("=====================\n");

    match &settings.config_file {
        Some(path) => println!("Config file:     {}", path.display()),
        None => println!("Config file:     (none, using defaults)"),
    }
    println!("Home:            {}", settings.home.display());
    println!("Registry:        {}", settings.registry_path().display());
    println!("Artifacts:       {}", settings.artifacts_dir().display());
    println!("Library:         {}", settings.library.display());

    println!("\nWatch:");
    println!("  Root:          {}", settings.watch.root.display());
    println!("  Extensions:    {}", settings.watch.extensions.join(", "));
    println!("  Ignore:        {}", settings.watch.ignore.join(", "));
    println!("  Settle window: {} ms", settings.watch.settle_window.as_millis());
    println!("  Startup scan:  {}", settings.watch.scan_on_startup);

    println!("\nPipeline:");
    println!("  Workers:       {}", settings.workers);
    println!("  Queue:         {}", settings.queue_capacity);
    for step in crate::domain::Step::ALL {
        let policy = settings.policies.get(step);
        println!(
            "  {:<17} attempts={} backoff={}..{} ms timeout={} s",
            step.as_str(),
            policy.max_attempts,
            policy.backoff_base_ms,
            policy.backoff_max_ms,
            policy.timeout_seconds
        );
    }

    println!("\nProviders:");
    println!("  Transcription: {:?}", settings.transcription.provider);
    println!("  Insights:      {:?}", settings.insights.provider);

    Ok(ExitCode::SUCCESS)
}
