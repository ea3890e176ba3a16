//! Halcyon Ingest - API collection service

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use halcyon_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use halcyon_ingest::health::HealthReport;
use halcyon_ingest::{App, CollectionRun, HalcyonClient, ObjectTypeRegistry, Settings};
use std::path::PathBuf;
use std::process;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "halcyon-ingest")]
#[command(author, version, about = "Collects Halcyon API objects into an event stream")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML settings file (HALCYON__* variables override it)
    #[arg(short, long, global = true, env = "HALCYON_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Collect every enabled object type on its interval until interrupted
    Run,

    /// Run one collection pass and exit
    Once {
        /// Run types that are not due yet
        #[arg(short, long)]
        force: bool,

        /// Restrict to these object types (repeatable)
        #[arg(short, long = "only", value_name = "OBJECT_TYPE")]
        only: Vec<String>,
    },

    /// Check settings and credentials against the API
    Validate,

    /// Show the last persisted health snapshot
    Status,

    /// List object types with their effective settings
    List,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(level)
        .output(LogOutput::Console)
        .log_file_prefix("halcyon-ingest")
        .filter_directives("reqwest=warn,hyper=warn")
        .build();

    // LOG_* variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);
    let guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {e:#}");
            None
        },
    };

    let code = match execute(&cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {e:#}");
            1
        },
    };

    // flush buffered file logs before exiting
    drop(guard);
    process::exit(code);
}

/// Run the selected command, returning the process exit code.
async fn execute(cli: &Cli) -> Result<i32> {
    let config = cli.config.as_deref();

    match &cli.command {
        Command::Run => {
            let settings = Settings::load(config).context("Failed to load settings")?;
            run(settings).await
        },
        Command::Once { force, only } => {
            let settings = Settings::load(config).context("Failed to load settings")?;
            once(settings, *force, only).await
        },
        Command::Validate => {
            let settings = Settings::load(config).context("Failed to load settings")?;
            validate(settings).await
        },
        Command::Status => {
            let settings = Settings::load_unchecked(config).context("Failed to load settings")?;
            status(&settings)
        },
        Command::List => {
            let settings = Settings::load_unchecked(config).context("Failed to load settings")?;
            list(&settings)
        },
    }
}

async fn run(settings: Settings) -> Result<i32> {
    let App { mut scheduler, .. } = App::from_settings(settings)?;
    scheduler.start().await.context("Failed to start scheduler")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    scheduler.shutdown().await;
    Ok(0)
}

async fn once(settings: Settings, force: bool, only: &[String]) -> Result<i32> {
    let app = App::from_settings(settings)?;
    let runs = app.scheduler.run_once_all(force, only).await?;

    for run in &runs {
        print_run(run);
    }
    if runs.is_empty() {
        println!("Nothing due; pass --force to collect anyway");
    }

    let failed = runs.iter().filter(|r| !r.succeeded()).count();
    Ok(if failed > 0 { 1 } else { 0 })
}

fn print_run(run: &CollectionRun) {
    let outcome = match run.error {
        None => "ok".to_string(),
        Some(ref e) => format!("FAILED ({}: {})", e.kind, e.message),
    };
    println!(
        "{:<28} fetched={:<6} emitted={:<6} skipped={:<5} pages={:<4}{} {}",
        run.object_type,
        run.records_fetched,
        run.records_emitted,
        run.records_skipped,
        run.pages,
        if run.truncated { " truncated" } else { "" },
        outcome,
    );
}

async fn validate(settings: Settings) -> Result<i32> {
    let registry = ObjectTypeRegistry::from_settings(&settings)?;
    let client = HalcyonClient::new(&settings.api, &settings.collection)?;
    let user = client
        .current_user()
        .await
        .context("Credential check against the API failed")?;

    println!("Settings OK");
    println!("  API:          {}", settings.api.base_url);
    println!(
        "  User:         {}",
        user.email.or(user.id).unwrap_or_else(|| "(unknown)".into())
    );
    if let Some(role) = user.role {
        println!("  Role:         {role}");
    }
    println!(
        "  Object types: {} enabled of {}",
        registry.enabled().count(),
        registry.len()
    );
    println!("  State dir:    {}", settings.collection.state_dir.display());
    Ok(0)
}

fn status(settings: &Settings) -> Result<i32> {
    let path = settings.collection.health_snapshot_path();
    let Some(report) = HealthReport::load(&path)? else {
        println!("No health snapshot at {}", path.display());
        return Ok(1);
    };

    println!(
        "Generated {} ({})",
        report.generated_at.to_rfc3339(),
        if report.healthy { "healthy" } else { "UNHEALTHY" }
    );
    println!();
    println!(
        "{:<28} {:<8} {:>8} {:>8} {:>10}  LAST RUN",
        "OBJECT TYPE", "OUTCOME", "OK", "FAILED", "RECORDS"
    );
    for (name, health) in &report.object_types {
        if !health.enabled {
            continue;
        }
        let outcome = match health.last_outcome {
            Some(o) => format!("{o:?}").to_lowercase(),
            None => "-".into(),
        };
        println!(
            "{:<28} {:<8} {:>8} {:>8} {:>10}  {}",
            name,
            outcome,
            health.runs_succeeded,
            health.runs_failed,
            health.records_ingested,
            health
                .last_run_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".into()),
        );
    }

    for (name, health) in report.failing() {
        if let Some(ref e) = health.last_error {
            println!();
            println!("{name}: {} ({})", e.message, e.kind);
        }
    }

    Ok(if report.healthy { 0 } else { 1 })
}

fn list(settings: &Settings) -> Result<i32> {
    let registry = ObjectTypeRegistry::from_settings(settings)?;
    println!(
        "{:<28} {:<32} {:>8} {:<10} {}",
        "OBJECT TYPE", "SOURCETYPE", "INTERVAL", "CURSOR", "PATH"
    );
    for spec in registry.all() {
        println!(
            "{:<28} {:<32} {:>7}s {:<10} {}{}",
            spec.name,
            spec.sourcetype,
            spec.interval.as_secs(),
            format!("{:?}", spec.cursor.kind).to_lowercase(),
            spec.path,
            if spec.enabled { "" } else { "  (disabled)" },
        );
    }
    Ok(0)
}
