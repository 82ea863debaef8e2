//! Events published and consumed by the scheduler.

use crate::build::{BuildOutcome, BuildReason};
use crate::ids::*;
use crate::project::{ProjectState, Transition};
use crate::revision::Revision;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// All events in the Cadence CI system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Build requests
    BuildRequestQueued(BuildRequestQueuedPayload),
    BuildRequestActivated(BuildRequestActivatedPayload),
    BuildRequestAssimilated(BuildRequestAssimilatedPayload),
    BuildRequestCancelled(BuildRequestCancelledPayload),
    BuildRequestRejected(BuildRequestRejectedPayload),
    BuildRequestBlocked(BuildRequestBlockedPayload),

    // Builds
    BuildCompleted(BuildCompletedPayload),
    BuildTerminationRequested(BuildTerminationRequestedPayload),

    // Projects
    ProjectStateChanged(ProjectStateChangedPayload),

    // Recipes
    RecipeStatus(RecipeStatusPayload),
    RecipeDispatched(RecipeDispatchedPayload),
    RecipeError(RecipeErrorPayload),

    // Agents
    AgentOnline(AgentPayload),
    AgentOffline(AgentPayload),
    AgentAvailable(AgentPayload),
    AgentResourcesDiscovered(AgentPayload),

    // Source control
    ScmChanged(ScmChangedPayload),
}

impl Event {
    /// Returns the bus subject for this event.
    pub fn subject(&self) -> String {
        match self {
            Event::BuildRequestQueued(p) => format!("request.queued.{}", p.project_id),
            Event::BuildRequestActivated(p) => format!("request.activated.{}", p.project_id),
            Event::BuildRequestAssimilated(p) => {
                format!("request.assimilated.{}", p.project_id)
            }
            Event::BuildRequestCancelled(p) => format!("request.cancelled.{}", p.project_id),
            Event::BuildRequestRejected(p) => format!("request.rejected.{}", p.project_id),
            Event::BuildRequestBlocked(p) => format!("request.blocked.{}", p.project_id),
            Event::BuildCompleted(p) => format!("build.completed.{}.{}", p.project_id, p.build_id),
            Event::BuildTerminationRequested(p) => match p.build_id {
                Some(id) => format!("build.terminate.{id}"),
                None => "build.terminate.all".to_string(),
            },
            Event::ProjectStateChanged(p) => format!("project.{}.state", p.project_id),
            Event::RecipeStatus(p) => format!("recipe.{}.status", p.recipe_id),
            Event::RecipeDispatched(p) => format!("recipe.{}.dispatched", p.recipe_id),
            Event::RecipeError(p) => format!("recipe.{}.error", p.recipe_id),
            Event::AgentOnline(p) => format!("agent.{}.online", p.agent_id),
            Event::AgentOffline(p) => format!("agent.{}.offline", p.agent_id),
            Event::AgentAvailable(p) => format!("agent.{}.available", p.agent_id),
            Event::AgentResourcesDiscovered(p) => format!("agent.{}.resources", p.agent_id),
            Event::ScmChanged(p) => format!("scm.{}.changed", p.scm),
        }
    }
}

// === Build request payloads ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequestQueuedPayload {
    pub request_id: BuildRequestId,
    pub meta_build_id: Option<MetaBuildId>,
    pub project_id: ProjectId,
    pub project_name: String,
    pub reason: BuildReason,
    pub priority: i32,
    pub personal: bool,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequestActivatedPayload {
    pub request_id: BuildRequestId,
    pub project_id: ProjectId,
    pub build_id: BuildId,
    pub build_number: u64,
    pub activated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequestAssimilatedPayload {
    pub request_id: BuildRequestId,
    pub into_request_id: BuildRequestId,
    pub project_id: ProjectId,
    pub revision: Option<Revision>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequestCancelledPayload {
    pub request_id: BuildRequestId,
    pub project_id: ProjectId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequestRejectedPayload {
    pub request_id: BuildRequestId,
    pub project_id: ProjectId,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequestBlockedPayload {
    pub request_id: BuildRequestId,
    pub project_id: ProjectId,
    pub project_name: String,
    /// The dependency request that failed.
    pub blocked_by: BuildRequestId,
}

// === Build payloads ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildCompletedPayload {
    pub build_id: BuildId,
    pub request_id: BuildRequestId,
    pub project_id: ProjectId,
    pub outcome: BuildOutcome,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildTerminationRequestedPayload {
    /// `None` addresses every running build.
    pub build_id: Option<BuildId>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectStateChangedPayload {
    pub project_id: ProjectId,
    pub transition: Transition,
    pub from: ProjectState,
    pub to: ProjectState,
}

// === Recipe payloads ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeStatusPayload {
    pub recipe_id: RecipeId,
    pub build_id: BuildId,
    pub project_id: ProjectId,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeDispatchedPayload {
    pub recipe_id: RecipeId,
    pub build_id: BuildId,
    pub project_id: ProjectId,
    pub stage: String,
    pub agent_id: AgentId,
    pub agent_name: String,
    pub revision: Option<Revision>,
    pub dispatched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeErrorPayload {
    pub recipe_id: RecipeId,
    pub build_id: BuildId,
    pub project_id: ProjectId,
    pub kind: RecipeErrorKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipeErrorKind {
    /// No online agent can run the recipe.
    Unsatisfiable,
    /// No capable agent appeared before the deadline.
    Timeout,
    RevisionResolution,
    DispatchTransport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Environment,
    Infrastructure,
}

impl RecipeErrorKind {
    pub fn class(&self) -> FailureClass {
        match self {
            RecipeErrorKind::Unsatisfiable | RecipeErrorKind::Timeout => FailureClass::Environment,
            RecipeErrorKind::RevisionResolution | RecipeErrorKind::DispatchTransport => {
                FailureClass::Infrastructure
            }
        }
    }

    /// Outcome of the owning build.
    pub fn build_outcome(&self) -> BuildOutcome {
        match self.class() {
            FailureClass::Environment => BuildOutcome::Failure,
            FailureClass::Infrastructure => BuildOutcome::Error,
        }
    }
}

// === Inbound payloads ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPayload {
    pub agent_id: AgentId,
    pub agent_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScmChangedPayload {
    pub scm: ScmRef,
    pub revision: Revision,
}
