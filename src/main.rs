use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Local, NaiveDate, Utc};
use clap::{Parser, Subcommand};

use simdispatch::config::{LogFormat, LoggingConfig, SimConfig};
use simdispatch::kind::SimulationKind;
use simdispatch::report::{self, StateExport};
use simdispatch::storage::{self, history, TargetRegistry};

#[derive(Parser)]
#[command(
    name = "simdispatch",
    about = "Deliver test records to student endpoints over a time window",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run or resume a simulation until its window closes
    Run {
        /// Simulation kind: observation or true-outcome
        #[arg(long, short)]
        simulator: SimulationKind,

        /// Window end, as DD-MM-YYYY (local midnight) or RFC 3339.
        /// Required on the first run of a simulation.
        #[arg(long, short, value_parser = parse_end)]
        end: Option<DateTime<Utc>>,
    },

    /// Manage the target registry
    Targets {
        #[command(subcommand)]
        action: TargetAction,
    },

    /// Attempt counts per target by outcome and HTTP status
    Status {
        #[arg(long, short)]
        simulator: SimulationKind,
    },

    /// Failed deliveries per target, lowest record id first
    Failures {
        #[arg(long, short)]
        simulator: SimulationKind,

        /// Pairs to show per target
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// Write the stored outcomes as JSON for scoring
    Export {
        #[arg(long, short)]
        simulator: SimulationKind,

        /// Output file path
        #[arg(long, short, default_value = "state.json")]
        output: PathBuf,
    },
}

#[derive(Subcommand)]
enum TargetAction {
    /// List registered targets
    List,

    /// Register one target
    Add {
        /// Target name (substituted into the endpoint template)
        #[arg(long)]
        name: String,

        /// Contact address
        #[arg(long)]
        email: Option<String>,
    },

    /// Register targets from a file of `name[,email]` lines
    Import {
        file: PathBuf,
    },
}

/// A bare date means midnight in the operator's local time zone.
fn parse_end(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%d-%m-%Y") {
        return date
            .and_hms_opt(0, 0, 0)
            .and_then(|dt| dt.and_local_timezone(Local).earliest())
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| format!("Not a valid date: '{raw}'."));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| format!("Not a valid date: '{raw}'. Use DD-MM-YYYY or RFC 3339."))
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SimConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Run { simulator, end } => {
            tracing::info!(%simulator, ?end, "Starting simulation");
            let report = simdispatch::run_simulation(&config, simulator, end).await?;
            println!(
                "{simulator}: {} ticks, {} dispatched, {} succeeded, {} failed",
                report.ticks, report.dispatched, report.succeeded, report.failed
            );
        }
        Commands::Targets { action } => {
            let pool = storage::open_pool(&config.storage.db_path)?;
            let registry = TargetRegistry::new(pool);

            match action {
                TargetAction::List => {
                    let list = registry.list()?;
                    if list.is_empty() {
                        println!("No targets registered.");
                    } else {
                        println!("{:<30} | Email", "Name");
                        println!("{:-<30}-|-{:-<30}", "", "");
                        for t in list {
                            println!("{:<30} | {}", t.name, t.email.unwrap_or_default());
                        }
                    }
                }
                TargetAction::Add { name, email } => {
                    if registry.add(&name, email.as_deref())? {
                        println!("Target '{}' added.", name);
                    } else {
                        println!("Target '{}' already registered.", name);
                    }
                }
                TargetAction::Import { file } => {
                    let added = registry.import(&file)?;
                    println!("{} new target(s) imported from {}.", added, file.display());
                }
            }
        }
        Commands::Status { simulator } => {
            let pool = storage::open_pool(&config.storage.db_path)?;
            let counts = history::status_counts(&pool, simulator.as_str())?;
            if counts.is_empty() {
                println!("No attempts recorded for {}.", simulator);
            }
            let mut current: Option<String> = None;
            for row in counts {
                if current.as_deref() != Some(row.target.as_str()) {
                    println!("# {}", row.target);
                    current = Some(row.target.clone());
                }
                let status = row.status.map(|s| s.to_string()).unwrap_or_else(|| "-".into());
                println!("    [{:<18} {:>3}] {}", row.outcome, status, row.count);
            }
        }
        Commands::Failures { simulator, limit } => {
            let pool = storage::open_pool(&config.storage.db_path)?;
            let failed = history::failed_pairs(&pool, simulator.as_str(), limit)?;
            if failed.is_empty() {
                println!("No failed deliveries for {}.", simulator);
            }
            let mut current: Option<String> = None;
            for pair in failed {
                if current.as_deref() != Some(pair.target.as_str()) {
                    println!("==================================================");
                    println!("{}", pair.target);
                    current = Some(pair.target.clone());
                }
                println!(
                    "  record {:<8} {:<18} {}",
                    pair.record_id,
                    pair.outcome,
                    pair.detail.unwrap_or_default()
                );
            }
        }
        Commands::Export { simulator, output } => {
            let pool = storage::open_pool(&config.storage.db_path)?;
            let state = report::load_existing(&pool, simulator)?;
            report::write_export(&StateExport::from_state(&state), &output)?;
            println!("Exported {} to {}.", simulator, output.display());
        }
    }

    Ok(())
}
