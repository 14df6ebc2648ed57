use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use swarmbots_app::{RunOptions, RunReport, run_headless};

#[derive(Parser, Debug)]
#[command(
    name = "swarmbots",
    version,
    about = "Run a headless SwarmBots task-collection simulation"
)]
struct Cli {
    /// JSON configuration file; fields left out fall back to defaults.
    #[arg(long, env = "SWARMBOTS_CONFIG")]
    config: Option<PathBuf>,

    /// Number of robots to place on the grid.
    #[arg(long, env = "SWARMBOTS_ROBOTS")]
    robots: Option<usize>,

    /// Grid width in cells.
    #[arg(long, env = "SWARMBOTS_WIDTH")]
    width: Option<u32>,

    /// Grid height in cells.
    #[arg(long, env = "SWARMBOTS_HEIGHT")]
    height: Option<u32>,

    /// Task locations seeded at start-up.
    #[arg(long, env = "SWARMBOTS_TASKS")]
    tasks: Option<usize>,

    /// RNG seed for a reproducible run.
    #[arg(long, env = "SWARMBOTS_SEED")]
    seed: Option<u64>,

    /// Ticks to simulate.
    #[arg(long, env = "SWARMBOTS_STEPS", default_value_t = 100)]
    steps: u64,

    /// Record tick history into this DuckDB file.
    #[arg(long, env = "SWARMBOTS_DB")]
    db: Option<PathBuf>,

    /// Output format for the final report.
    #[arg(long, env = "SWARMBOTS_FORMAT", value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

impl From<&Cli> for RunOptions {
    fn from(cli: &Cli) -> Self {
        Self {
            config_path: cli.config.clone(),
            robots: cli.robots,
            width: cli.width,
            height: cli.height,
            tasks: cli.tasks,
            seed: cli.seed,
            steps: cli.steps,
            db_path: cli.db.clone(),
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let report = run_headless(&RunOptions::from(&cli))?;
    print_report(&report, cli.format)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}

fn print_report(report: &RunReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            println!("Simulation completed!");
            println!("Total tasks completed: {}", report.total_tasks_completed);
            for performer in &report.top_performers {
                println!(
                    "  robot-{}: {} tasks, {} idle steps",
                    performer.agent_id, performer.completed_tasks, performer.steps_taken
                );
            }
        }
        OutputFormat::Json => {
            let json =
                serde_json::to_string_pretty(report).context("failed to serialize run report")?;
            println!("{json}");
        }
    }
    Ok(())
}
