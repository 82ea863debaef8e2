//! Cadence CI CLI entrypoint.

use cadence_trace::{LogFormat, TracingConfig, init_tracer, shutdown_tracer};
use clap::Parser;
use std::time::Duration;

mod commands;
mod config;
mod handlers;
mod simulation;

use commands::Commands;
use simulation::SimulationOptions;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(author, version, about = "Cadence CI build orchestration tools", long_about = None)]
struct Cli {
    /// Log filter, e.g. "debug" or "cadence_scheduler=trace"
    #[arg(long, global = true, default_value = "warn")]
    log: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    init_tracer(&TracingConfig::default().with_filter(&cli.log).with_format(format))?;

    let result = match cli.command {
        Commands::Validate { path } => handlers::validate(&path),
        Commands::Plan {
            project,
            file,
            mode,
            json,
        } => handlers::plan(&file, &project, mode, json),
        Commands::States => handlers::states(),
        Commands::Simulate {
            triggers,
            file,
            failing,
            personal,
            rebuild,
            settle_ms,
        } => {
            let options = SimulationOptions {
                triggers,
                failing: failing.into_iter().collect(),
                personal,
                rebuild,
                settle: Duration::from_millis(settle_ms),
            };
            handlers::simulate(&file, options).await
        }
    };

    shutdown_tracer();
    result
}
