//! Build requests and build results.

use crate::ids::{BuildId, BuildRequestId, MetaBuildId, ProjectId};
use crate::revision::BuildRevision;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildReason {
    Trigger,
    Remote,
    Manual,
    Dependency,
    Rebuild,
}

impl fmt::Display for BuildReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildReason::Trigger => "trigger",
            BuildReason::Remote => "remote",
            BuildReason::Manual => "manual",
            BuildReason::Dependency => "dependency",
            BuildReason::Rebuild => "rebuild",
        };
        write!(f, "{s}")
    }
}

/// A request to build one project.
///
/// Clones share the same [`BuildRevision`]; use [`BuildRequestEvent::snapshot`]
/// for a detached copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequestEvent {
    pub id: BuildRequestId,
    /// Shared by every request expanded from the same trigger.
    pub meta_build_id: Option<MetaBuildId>,
    pub project_id: ProjectId,
    pub project_name: String,
    pub revision: Arc<BuildRevision>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub personal: bool,
    pub reason: BuildReason,
    /// Where the request came from, e.g. the trigger name.
    #[serde(default)]
    pub source: Option<String>,
    /// May be superseded by a later request from the same source.
    #[serde(default)]
    pub replaceable: bool,
    /// Build upstream dependencies first.
    #[serde(default)]
    pub rebuild: bool,
    pub queued_at: DateTime<Utc>,
}

impl BuildRequestEvent {
    pub fn new(project_id: ProjectId, project_name: impl Into<String>, reason: BuildReason) -> Self {
        Self {
            id: BuildRequestId::new(),
            meta_build_id: None,
            project_id,
            project_name: project_name.into(),
            revision: BuildRevision::unresolved(),
            priority: 0,
            personal: false,
            reason,
            source: None,
            replaceable: false,
            rebuild: false,
            queued_at: Utc::now(),
        }
    }

    pub fn with_revision(mut self, revision: Arc<BuildRevision>) -> Self {
        self.revision = revision;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_personal(mut self, personal: bool) -> Self {
        self.personal = personal;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>, replaceable: bool) -> Self {
        self.source = Some(source.into());
        self.replaceable = replaceable;
        self
    }

    pub fn with_rebuild(mut self, rebuild: bool) -> Self {
        self.rebuild = rebuild;
        self
    }

    /// Whether `other` may be folded into this queued request.
    pub fn can_assimilate(&self, other: &BuildRequestEvent) -> bool {
        self.replaceable
            && other.replaceable
            && self.project_id == other.project_id
            && self.source.is_some()
            && self.source == other.source
            && !self.revision.is_fixed()
    }

    pub fn snapshot(&self) -> Self {
        Self {
            revision: self.revision.snapshot(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildOutcome {
    Success,
    Failure,
    Error,
    Cancelled,
    Terminated,
}

impl BuildOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, BuildOutcome::Success)
    }
}

/// A build released from the queue and handed to the build starter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivatedBuild {
    pub build_id: BuildId,
    pub build_number: u64,
    pub request: BuildRequestEvent,
}

/// Reported when a started build finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildCompletion {
    pub build_id: BuildId,
    pub request_id: BuildRequestId,
    pub project_id: ProjectId,
    pub outcome: BuildOutcome,
    pub completed_at: DateTime<Utc>,
}

impl BuildCompletion {
    pub fn new(build: &ActivatedBuild, outcome: BuildOutcome) -> Self {
        Self {
            build_id: build.build_id,
            request_id: build.request.id,
            project_id: build.request.project_id,
            outcome,
            completed_at: Utc::now(),
        }
    }
}
