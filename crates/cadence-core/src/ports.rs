//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the scheduler and its
//! collaborators: source control, agent management, persistence and the
//! build machinery that runs released builds.

use crate::agent::Agent;
use crate::build::ActivatedBuild;
use crate::events::Event;
use crate::ids::*;
use crate::project::Project;
use crate::recipe::{BuildContext, RecipeRequest};
use crate::revision::{BuildFile, Revision};
use crate::Result;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

/// Stream of events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event>> + Send>>;

/// Event bus for publishing and subscribing to events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event.
    async fn publish(&self, event: Event) -> Result<()>;

    /// Subscribe to events matching a pattern.
    /// Pattern supports wildcards: `recipe.*.error`, `agent.>`
    async fn subscribe(&self, pattern: &str) -> Result<EventStream>;
}

/// Source-control access needed to resolve build revisions.
#[async_trait]
pub trait RevisionSource: Send + Sync {
    /// Latest revision of the given source.
    async fn latest_revision(&self, scm: &ScmRef) -> Result<Revision>;

    /// The build file as it exists at `revision`.
    async fn resolve_build_file(&self, scm: &ScmRef, revision: &Revision) -> Result<BuildFile>;
}

/// Read-only view of the agent pool.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    /// Agents currently connected, busy or not.
    async fn online_agents(&self) -> Result<Vec<Agent>>;

    /// Online agents free to take new work.
    async fn available_agents(&self) -> Result<Vec<Agent>>;
}

/// Repository for projects.
#[async_trait]
pub trait ProjectRepository: Send + Sync {
    /// Get a project by ID.
    async fn get(&self, id: ProjectId) -> Result<Option<Project>>;

    /// Insert or replace a project.
    async fn save(&self, project: &Project) -> Result<()>;

    /// List all projects.
    async fn list(&self) -> Result<Vec<Project>>;
}

/// Hands a recipe to the agent that will run it. May block on the network.
#[async_trait]
pub trait AgentBuildService: Send + Sync {
    async fn build(
        &self,
        agent: &Agent,
        recipe: &RecipeRequest,
        context: &BuildContext,
    ) -> Result<()>;
}

/// Starts builds released from the build request queue.
#[async_trait]
pub trait BuildStarter: Send + Sync {
    async fn start(&self, build: &ActivatedBuild) -> Result<()>;
}
