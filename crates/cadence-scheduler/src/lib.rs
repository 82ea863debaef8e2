//! Build orchestration for Cadence CI.
//!
//! Expands build triggers across the project dependency graph, gates the
//! resulting requests on their dependencies, and matches the recipes of
//! started builds to capable agents.

pub mod agents;
pub mod build_queue;
pub mod bus;
pub mod config;
pub mod expander;
pub mod graph;
pub mod memory;
pub mod orchestrator;
pub mod predicates;
pub mod project_manager;
pub mod recipe_queue;

pub use agents::{AgentSorter, DirectoryOrderSorter, HashAgentSorter};
pub use build_queue::{BuildRequestQueue, EnqueueOutcome, QueueState};
pub use bus::LocalEventBus;
pub use config::{ConfigError, DownstreamMode, SchedulerConfig, UnsatisfiablePolicy};
pub use expander::{BuildRequestExpander, ExpansionMode};
pub use graph::{GraphBuilder, GraphError, ProjectGraph, ProjectNode};
pub use orchestrator::{Orchestrator, OrchestratorHandle, OrchestratorPorts};
pub use predicates::{QueuedRequest, QueuedRequestPredicate};
pub use project_manager::ProjectManager;
pub use recipe_queue::{RecipeQueue, RecipeQueuePorts};
