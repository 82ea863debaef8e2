//! CLI command definitions.

use cadence_scheduler::ExpansionMode;
use clap::{Subcommand, ValueEnum};

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a workspace file
    Validate {
        /// Path to workspace file
        #[arg(default_value = "cadence.yaml")]
        path: String,
    },

    /// Show the builds one trigger expands into
    Plan {
        /// Project to trigger
        project: String,

        /// Path to workspace file
        #[arg(short, long, default_value = "cadence.yaml")]
        file: String,

        /// How far the trigger expands
        #[arg(short, long, value_enum, default_value_t = PlanMode::Forward)]
        mode: PlanMode,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the project state machine
    States,

    /// Run triggers through a local scheduler with simulated agents
    Simulate {
        /// Projects to trigger, in order
        #[arg(required = true)]
        triggers: Vec<String>,

        /// Path to workspace file
        #[arg(short, long, default_value = "cadence.yaml")]
        file: String,

        /// Projects whose builds fail
        #[arg(long = "fail", value_name = "PROJECT")]
        failing: Vec<String>,

        /// Submit the triggers as personal builds
        #[arg(long)]
        personal: bool,

        /// Submit the triggers as rebuilds of everything upstream
        #[arg(long)]
        rebuild: bool,

        /// Milliseconds without activity before the simulation ends
        #[arg(long, default_value_t = 250)]
        settle_ms: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PlanMode {
    /// Only the triggered project
    Single,
    /// The project and its downstream dependents
    Forward,
    /// The project's upstream dependencies, then the project
    Rebuild,
}

impl From<PlanMode> for ExpansionMode {
    fn from(mode: PlanMode) -> Self {
        match mode {
            PlanMode::Single => ExpansionMode::Single,
            PlanMode::Forward => ExpansionMode::Forward,
            PlanMode::Rebuild => ExpansionMode::Rebuild,
        }
    }
}
