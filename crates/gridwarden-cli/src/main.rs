use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod files;

/// Gridwarden - guarded, plan-driven spreadsheet agent
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML); defaults apply when omitted
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a request against a workbook file
    Run {
        /// Workbook JSON file
        #[arg(short, long, value_name = "FILE")]
        workbook: PathBuf,

        /// What to do, in plain words
        request: String,

        /// Execute this plan JSON instead of asking the planner
        #[arg(long, value_name = "FILE", conflicts_with = "script")]
        plan: Option<PathBuf>,

        /// JSON array of canned planner responses, replayed in order
        #[arg(long, value_name = "FILE")]
        script: Option<PathBuf>,

        /// Confirm risky steps without asking
        #[arg(short, long)]
        yes: bool,

        /// Write the updated workbook back (to FILE, or in place)
        #[arg(long, value_name = "FILE", num_args = 0..=1, default_missing_value = "")]
        save: Option<PathBuf>,

        /// Write the operation ledger as JSON
        #[arg(long, value_name = "FILE")]
        ledger_out: Option<PathBuf>,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check a plan without running it
    Validate {
        /// Plan JSON file (planner output is accepted as-is)
        plan: PathBuf,

        /// Workbook JSON file, to check sheet references
        #[arg(short, long, value_name = "FILE")]
        workbook: Option<PathBuf>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// List the built-in validation rules
    Rules {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show a persisted ledger
    Ledger {
        /// Task id
        task_id: uuid::Uuid,

        /// Ledger directory (overrides `ledger.dir`)
        #[arg(short, long, value_name = "DIR")]
        dir: Option<PathBuf>,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cli.verbose)
        .with_writer(std::io::stderr)
        .init();

    let config = gridwarden_core::WardenConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            workbook,
            request,
            plan,
            script,
            yes,
            save,
            ledger_out,
            json,
        } => {
            let save = save.map(|path| {
                if path.as_os_str().is_empty() {
                    workbook.clone()
                } else {
                    path
                }
            });
            commands::run(
                config,
                commands::RunArgs {
                    workbook,
                    request,
                    plan,
                    script,
                    yes,
                    save,
                    ledger_out,
                    json,
                },
            )
            .await?;
        }
        Commands::Validate {
            plan,
            workbook,
            json,
        } => {
            let healthy = commands::validate(&plan, workbook.as_deref(), json).await?;
            if !healthy {
                std::process::exit(1);
            }
        }
        Commands::Rules { json } => commands::rules(&config, json)?,
        Commands::Ledger { task_id, dir } => commands::ledger(&config, task_id, dir).await?,
        Commands::Config => println!("{}", commands::render_config(&config)?),
    }

    Ok(())
}
