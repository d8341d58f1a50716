//! Radwatch CLI - radiology worklist backlog monitor.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use radwatch::artifacts::{color_map_yaml, ColorSamples};
use radwatch::classify::{self, ColorMap};
use radwatch::config::MonitorConfig;
use radwatch::dispatch::Dispatcher;
use radwatch::pipeline::{Monitor, RunOptions, EXIT_OK, EXIT_STARTUP};
use radwatch::state::RunStateStore;
use radwatch::window::WindowPolicy;
use radwatch::worklist::WorklistParser;

/// Radwatch - page staff when the CT/MR worklist backs up.
#[derive(Parser)]
#[command(name = "radwatch")]
#[command(about = "Radiology worklist backlog monitor")]
#[command(version)]
pub struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = "radwatch.yml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a single monitoring cycle (for the hourly scheduler)
    Run {
        /// Replay a saved page instead of fetching
        #[arg(long)]
        html: Option<PathBuf>,

        /// Alert regardless of window, threshold and dedup
        #[arg(long, env = "FORCE_ALERT")]
        force_alert: bool,

        /// Evaluate and write status, but send nothing and keep run state
        #[arg(long)]
        dry_run: bool,
    },

    /// Show whether the alerting window is active
    Window {
        /// Instant to check (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Parse a saved page and print each record's classification
    Parse {
        /// Saved worklist HTML
        file: PathBuf,
    },

    /// Suggest a color_map from accumulated color samples
    Colors {
        /// color_samples.json path; defaults to the artifacts directory
        #[arg(long)]
        samples: Option<PathBuf>,
    },

    /// Send a test message through the notification chain
    TestNotify,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    match run(cli).await {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            tracing::error!(error = ?e, "radwatch failed");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose {
        "radwatch=debug,notify=debug,info"
    } else {
        "radwatch=info,notify=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<i32> {
    let config = MonitorConfig::load(&cli.config)?;

    match cli.command {
        Commands::Run {
            html,
            force_alert,
            dry_run,
        } => run_cycle(config, html, RunOptions { force_alert, dry_run }).await,
        Commands::Window { at } => show_window(&config, at.unwrap_or_else(Utc::now)),
        Commands::Parse { file } => parse_page(&config, &file),
        Commands::Colors { samples } => {
            let path = samples.unwrap_or_else(|| config.paths.color_samples());
            suggest_colors(&config, &path)
        }
        Commands::TestNotify => test_notify(&config).await,
    }
}

async fn run_cycle(config: MonitorConfig, html: Option<PathBuf>, options: RunOptions) -> Result<i32> {
    let monitor = Monitor::from_config(config, html).context("failed to start monitor")?;
    let report = monitor.run_cycle(Utc::now(), options).await;
    let status = &report.status;

    println!("\nRadwatch Cycle Summary");
    println!("   Local time: {} ({})", status.last_run_local, status.timezone);
    println!("   Active window: {}", status.active_window);
    if report.decision.is_some() {
        let c = &status.counts;
        println!(
            "   Counts: ≤60={} ≤90={} ≤120={} other={}",
            c.within_60, c.within_90, c.within_120, c.other
        );
        println!(
            "   Qualifying total: {} (threshold {})",
            status.qualifying_total, status.threshold
        );
        println!("   Alert triggered: {}", status.alert_triggered);
    }
    if let Some(dispatch) = &status.dispatch {
        println!("   Dispatch: {}", serde_json::to_string(dispatch)?);
    }
    if !status.errors.is_empty() {
        println!("   Errors: {}", status.errors.len());
        for err in &status.errors {
            eprintln!("     - {err}");
        }
    }

    Ok(report.exit_code())
}

fn show_window(config: &MonitorConfig, at: DateTime<Utc>) -> Result<i32> {
    let tz = config.tz()?;
    let policy = WindowPolicy::new(&config.active_windows, tz)?;
    let local = at.with_timezone(&tz);
    println!("{} ({})", local.format("%a %Y-%m-%d %H:%M:%S %Z"), tz.name());
    println!("Windows: {}", policy.describe());
    println!("Active: {}", policy.is_active(&at));
    Ok(EXIT_OK)
}

fn parse_page(config: &MonitorConfig, file: &Path) -> Result<i32> {
    let html = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let parser = WorklistParser::new(config.selectors.clone(), config.tz()?)?;
    let parsed = parser.parse(&html)?;

    // Learned hints are read-only here; the state file is not locked.
    let hints = RunStateStore::new(config.paths.state.clone())
        .load()
        .map(|s| s.color_hints)
        .unwrap_or_default();
    let mut color_map = ColorMap::new(&config.color_map);
    if config.use_learned_colors {
        color_map = color_map.with_hints(&hints);
    }

    let tally = classify::tally(&parsed.records, Utc::now(), &color_map);
    for study in &tally.studies {
        let c = &study.classification;
        println!(
            "{:<6} {:<6} {:>6} {:<10} {:<9} {} | {}",
            c.bucket.to_string(),
            study.record.modality.as_str(),
            c.age_minutes.map_or_else(|| "-".to_string(), |m| format!("{m}m")),
            study.record.color.as_deref().unwrap_or("-"),
            format!("{:?}", c.basis).to_lowercase(),
            study.record.identifier,
            study.record.study,
        );
    }

    let counts = &tally.counts;
    println!(
        "\nRows: {} seen, {} skipped; records: {}; timestamp errors: {}",
        parsed.rows_seen,
        parsed.rows_skipped,
        parsed.records.len(),
        parsed.timestamp_errors.len()
    );
    println!(
        "Counts: ≤60={} ≤90={} ≤120={} other={} (qualifying {})",
        counts.within_60,
        counts.within_90,
        counts.within_120,
        counts.other,
        counts.qualifying_total()
    );
    println!(
        "Ambiguous: {}, color mismatches: {}",
        tally.ambiguous(),
        tally.mismatches()
    );
    Ok(EXIT_OK)
}

fn suggest_colors(config: &MonitorConfig, path: &Path) -> Result<i32> {
    let samples = ColorSamples::load(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    if samples.samples.is_empty() {
        println!("No color samples in {}", path.display());
        return Ok(EXIT_OK);
    }

    let suggested = samples.suggest_color_map();
    print!("{}", color_map_yaml(&suggested)?);

    let configured_map = ColorMap::new(&config.color_map);
    for (color, bucket) in &suggested {
        if let Some(configured) = configured_map.get(color) {
            if configured != *bucket {
                eprintln!("note: {color} is configured as {configured} but observed mostly as {bucket}");
            }
        }
    }
    let unmapped = samples.unmapped();
    if !unmapped.is_empty() {
        eprintln!("Colors seen only without timestamps: {}", unmapped.join(", "));
    }
    Ok(EXIT_OK)
}

async fn test_notify(config: &MonitorConfig) -> Result<i32> {
    let dispatcher = Dispatcher::from_config(config, config.tz()?)?;
    let channels = dispatcher.channel_names();
    if channels.is_empty() {
        anyhow::bail!("no notification channels configured");
    }
    println!("Channels: {}", channels.join(" -> "));

    let outcome = dispatcher.send_test(Utc::now()).await;
    for attempt in &outcome.attempts {
        println!(
            "   {}: {}",
            attempt.channel,
            if attempt.delivered { "delivered" } else { "failed" }
        );
    }
    match outcome.delivered_by {
        Some(channel) => {
            println!("Delivered via {channel}");
            Ok(EXIT_OK)
        }
        None => {
            for err in outcome.errors() {
                eprintln!("   - {err}");
            }
            Ok(EXIT_STARTUP)
        }
    }
}
