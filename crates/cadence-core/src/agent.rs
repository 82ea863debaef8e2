//! Agent types.

use crate::ids::AgentId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A remote worker as seen by the scheduler. Owned by the agent directory;
/// the dispatch queue only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub status: AgentStatus,
    /// Resource name to the versions installed on the agent.
    #[serde(default)]
    pub resources: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    Draining,
    Offline,
}

impl AgentStatus {
    pub fn is_online(&self) -> bool {
        !matches!(self, AgentStatus::Offline)
    }

    pub fn is_available(&self) -> bool {
        matches!(self, AgentStatus::Idle)
    }
}

impl Agent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: AgentId::new(),
            name: name.into(),
            status: AgentStatus::Idle,
            resources: BTreeMap::new(),
        }
    }

    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_resource(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.resources
            .entry(name.into())
            .or_default()
            .push(version.into());
        self
    }

    pub fn is_online(&self) -> bool {
        self.status.is_online()
    }

    pub fn is_available(&self) -> bool {
        self.status.is_available()
    }

    pub fn satisfies(&self, requirement: &ResourceRequirement) -> bool {
        if requirement.optional {
            return true;
        }
        match self.resources.get(&requirement.resource) {
            None => false,
            Some(versions) => match &requirement.version {
                None => true,
                Some(v) => versions.iter().any(|have| have == v),
            },
        }
    }

    pub fn satisfies_all<'a>(
        &self,
        requirements: impl IntoIterator<Item = &'a ResourceRequirement>,
    ) -> bool {
        requirements.into_iter().all(|r| self.satisfies(r))
    }
}

/// A named, optionally versioned resource a recipe needs on its agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRequirement {
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub optional: bool,
}

impl ResourceRequirement {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            version: None,
            optional: false,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

impl std::fmt::Display for ResourceRequirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}:{}", self.resource, v),
            None => write!(f, "{}", self.resource),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_satisfies_resource_without_version() {
        let agent = Agent::new("a1").with_resource("ant", "1.7");
        assert!(agent.satisfies(&ResourceRequirement::new("ant")));
        assert!(!agent.satisfies(&ResourceRequirement::new("maven")));
    }

    #[test]
    fn test_satisfies_versioned_resource() {
        let agent = Agent::new("a1")
            .with_resource("jdk", "17")
            .with_resource("jdk", "21");
        assert!(agent.satisfies(&ResourceRequirement::new("jdk").with_version("21")));
        assert!(!agent.satisfies(&ResourceRequirement::new("jdk").with_version("8")));
    }

    #[test]
    fn test_optional_requirement_never_disqualifies() {
        let agent = Agent::new("a1");
        assert!(agent.satisfies(&ResourceRequirement::new("gcc").optional()));
    }

    #[test]
    fn test_status_predicates() {
        assert!(AgentStatus::Busy.is_online());
        assert!(!AgentStatus::Busy.is_available());
        assert!(!AgentStatus::Offline.is_online());
        assert!(AgentStatus::Idle.is_available());
    }
}
