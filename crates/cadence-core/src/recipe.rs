//! Recipe requests and their dispatch state.

use crate::agent::{Agent, ResourceRequirement};
use crate::build::BuildReason;
use crate::ids::{AgentId, BuildId, ProjectId, RecipeId, ScmRef};
use crate::revision::BuildRevision;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One stage of one build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeRequest {
    pub id: RecipeId,
    pub build_id: BuildId,
    pub build_number: u64,
    pub project_id: ProjectId,
    pub project_name: String,
    pub stage: String,
    #[serde(default)]
    pub priority: i32,
    pub reason: BuildReason,
    #[serde(default)]
    pub resource_requirements: Vec<ResourceRequirement>,
}

impl RecipeRequest {
    pub fn new(
        build_id: BuildId,
        project_id: ProjectId,
        project_name: impl Into<String>,
        stage: impl Into<String>,
    ) -> Self {
        Self {
            id: RecipeId::new(),
            build_id,
            build_number: 0,
            project_id,
            project_name: project_name.into(),
            stage: stage.into(),
            priority: 0,
            reason: BuildReason::Manual,
            resource_requirements: Vec::new(),
        }
    }

    pub fn with_build_number(mut self, number: u64) -> Self {
        self.build_number = number;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_reason(mut self, reason: BuildReason) -> Self {
        self.reason = reason;
        self
    }

    pub fn with_requirement(mut self, requirement: ResourceRequirement) -> Self {
        self.resource_requirements.push(requirement);
        self
    }
}

/// Which agents may host a recipe, before resources are considered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostRequirements {
    AnyCapable,
    SpecificAgent(AgentId),
}

impl HostRequirements {
    pub fn admits(&self, agent: &Agent) -> bool {
        match self {
            HostRequirements::AnyCapable => true,
            HostRequirements::SpecificAgent(id) => agent.id == *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchStatus {
    Queued,
    Dispatching { agent_id: AgentId },
    Dispatched { agent_id: AgentId },
    Rejected { reason: String },
}

/// A recipe waiting for an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeDispatchRequest {
    pub request: RecipeRequest,
    pub revision: Arc<BuildRevision>,
    pub scm: ScmRef,
    pub host_requirements: HostRequirements,
    /// Set while no online agent can run the recipe.
    pub timeout_at: Option<DateTime<Utc>>,
    pub queued_at: DateTime<Utc>,
    pub status: DispatchStatus,
}

impl RecipeDispatchRequest {
    pub fn new(request: RecipeRequest, revision: Arc<BuildRevision>, scm: ScmRef) -> Self {
        Self {
            request,
            revision,
            scm,
            host_requirements: HostRequirements::AnyCapable,
            timeout_at: None,
            queued_at: Utc::now(),
            status: DispatchStatus::Queued,
        }
    }

    pub fn with_host_requirements(mut self, host: HostRequirements) -> Self {
        self.host_requirements = host;
        self
    }

    pub fn id(&self) -> RecipeId {
        self.request.id
    }

    pub fn has_timed_out(&self, now: DateTime<Utc>) -> bool {
        self.timeout_at.is_some_and(|at| at <= now)
    }

    /// Declared requirements plus those the build file lists for the stage.
    pub fn requirements(&self) -> Vec<ResourceRequirement> {
        let mut requirements = self.request.resource_requirements.clone();
        if let Some(file) = self.revision.build_file() {
            requirements.extend(file.requirements_for(&self.request.stage).iter().cloned());
        }
        requirements
    }

    pub fn is_fulfilled_by(&self, agent: &Agent) -> bool {
        self.host_requirements.admits(agent) && agent.satisfies_all(&self.requirements())
    }

    pub fn snapshot(&self) -> Self {
        Self {
            revision: self.revision.snapshot(),
            ..self.clone()
        }
    }
}

/// Everything an agent needs to run a dispatched recipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildContext {
    pub build_number: u64,
    pub project_name: String,
    pub stage: String,
    pub clean_build: bool,
    pub properties: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::{BuildFile, Revision, StageDefinition};

    fn recipe(stage: &str) -> RecipeRequest {
        RecipeRequest::new(BuildId::new(), ProjectId::new(), "lib", stage)
    }

    #[test]
    fn test_requirements_include_build_file() {
        let file = BuildFile {
            stages: vec![StageDefinition {
                name: "default".into(),
                priority: None,
                requirements: vec![ResourceRequirement::new("jdk")],
            }],
        };
        let request = RecipeDispatchRequest::new(
            recipe("default").with_requirement(ResourceRequirement::new("ant")),
            BuildRevision::resolved(Revision::new("r1"), file),
            ScmRef::new("git"),
        );

        let only_ant = Agent::new("a1").with_resource("ant", "1.10");
        let both = only_ant.clone().with_resource("jdk", "21");
        assert_eq!(request.requirements().len(), 2);
        assert!(!request.is_fulfilled_by(&only_ant));
        assert!(request.is_fulfilled_by(&both));
    }

    #[test]
    fn test_specific_agent_host_requirement() {
        let wanted = Agent::new("a1");
        let other = Agent::new("a2");
        let request = RecipeDispatchRequest::new(
            recipe("default"),
            BuildRevision::unresolved(),
            ScmRef::new("git"),
        )
        .with_host_requirements(HostRequirements::SpecificAgent(wanted.id));

        assert!(request.is_fulfilled_by(&wanted));
        assert!(!request.is_fulfilled_by(&other));
    }

    #[test]
    fn test_timeout() {
        let mut request = RecipeDispatchRequest::new(
            recipe("default"),
            BuildRevision::unresolved(),
            ScmRef::new("git"),
        );
        let now = Utc::now();
        assert!(!request.has_timed_out(now));
        request.timeout_at = Some(now);
        assert!(request.has_timed_out(now));
    }
}
