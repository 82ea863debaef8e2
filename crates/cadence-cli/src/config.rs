//! Workspace description files.
//!
//! A workspace file lists the projects the scheduler knows about, how they
//! depend on each other and what their stages need, plus the agents
//! available to run them.

use cadence_core::agent::{Agent, AgentStatus};
use cadence_core::ids::ScmRef;
use cadence_core::project::{Project, ProjectState};
use cadence_core::revision::{BuildFile, Revision, StageDefinition};
use cadence_scheduler::{GraphError, ProjectGraph, SchedulerConfig};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Failed to read workspace file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid workspace file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid dependency graph: {0}")]
    Graph(#[from] GraphError),
    #[error("Duplicate agent: {0}")]
    DuplicateAgent(String),
}

/// On-disk workspace description.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceFile {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub projects: Vec<ProjectEntry>,
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectEntry {
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub dependencies: Vec<DependencyEntry>,
    /// Stages declared by the project's build file at its head revision.
    #[serde(default)]
    pub stages: Vec<StageDefinition>,
    #[serde(default = "default_state")]
    pub state: ProjectState,
    /// Source-control location; defaults to the project name.
    pub scm: Option<String>,
    #[serde(default = "default_revision")]
    pub revision: String,
}

/// Either a bare project name or `{ project, propagate_revision }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencyEntry {
    Name(String),
    Detailed {
        project: String,
        #[serde(default)]
        propagate_revision: bool,
    },
}

impl DependencyEntry {
    pub fn project(&self) -> &str {
        match self {
            DependencyEntry::Name(name) => name,
            DependencyEntry::Detailed { project, .. } => project,
        }
    }

    pub fn propagates_revision(&self) -> bool {
        match self {
            DependencyEntry::Name(_) => false,
            DependencyEntry::Detailed {
                propagate_revision, ..
            } => *propagate_revision,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEntry {
    pub name: String,
    #[serde(default = "default_agent_status")]
    pub status: AgentStatus,
    /// Resource name to installed versions.
    #[serde(default)]
    pub resources: BTreeMap<String, Vec<String>>,
}

fn default_state() -> ProjectState {
    ProjectState::Idle
}

fn default_revision() -> String {
    "head".to_string()
}

fn default_agent_status() -> AgentStatus {
    AgentStatus::Idle
}

/// Stage used for projects that declare none.
pub const DEFAULT_STAGE: &str = "build";

/// A project ready to hand to the scheduler.
#[derive(Debug, Clone)]
pub struct ProjectSetup {
    pub project: Project,
    pub scm: ScmRef,
    pub revision: Revision,
    pub build_file: BuildFile,
}

/// A validated workspace.
#[derive(Debug)]
pub struct Workspace {
    pub scheduler: SchedulerConfig,
    pub graph: Arc<ProjectGraph>,
    pub projects: Vec<ProjectSetup>,
    pub agents: Vec<Agent>,
}

impl Workspace {
    pub fn project(&self, name: &str) -> Option<&ProjectSetup> {
        self.projects.iter().find(|p| p.project.name == name)
    }
}

impl WorkspaceFile {
    pub fn load(path: &Path) -> Result<Self, WorkspaceError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, WorkspaceError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Assigns identities and checks the dependency graph.
    pub fn resolve(&self) -> Result<Workspace, WorkspaceError> {
        let projects: Vec<ProjectSetup> = self.projects.iter().map(ProjectEntry::setup).collect();

        let mut builder = ProjectGraph::builder();
        for (entry, setup) in self.projects.iter().zip(&projects) {
            builder = builder.project_with_priority(setup.project.id, &entry.name, entry.priority);
        }
        for entry in &self.projects {
            for dependency in &entry.dependencies {
                builder = builder.dependency(
                    &entry.name,
                    dependency.project(),
                    dependency.propagates_revision(),
                );
            }
        }
        let graph = builder.build()?;

        let mut seen = HashSet::new();
        let mut agents = Vec::with_capacity(self.agents.len());
        for entry in &self.agents {
            if !seen.insert(entry.name.as_str()) {
                return Err(WorkspaceError::DuplicateAgent(entry.name.clone()));
            }
            let mut agent = Agent::new(&entry.name).with_status(entry.status);
            agent.resources = entry.resources.clone();
            agents.push(agent);
        }

        Ok(Workspace {
            scheduler: self.scheduler.clone(),
            graph: Arc::new(graph),
            projects,
            agents,
        })
    }
}

impl ProjectEntry {
    fn setup(&self) -> ProjectSetup {
        let stages = if self.stages.is_empty() {
            vec![StageDefinition {
                name: DEFAULT_STAGE.to_string(),
                priority: None,
                requirements: Vec::new(),
            }]
        } else {
            self.stages.clone()
        };
        ProjectSetup {
            project: Project::new(&self.name).with_state(self.state),
            scm: ScmRef::new(self.scm.as_deref().unwrap_or(&self.name)),
            revision: Revision::new(&self.revision),
            build_file: BuildFile { stages },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"
scheduler:
  unsatisfiable_timeout_secs: 30
projects:
  - name: core
    revision: r42
  - name: server
    priority: 5
    dependencies:
      - core
      - project: proto
        propagate_revision: true
    stages:
      - name: compile
        requirements:
          - resource: rustc
            version: "1.85"
      - name: package
        priority: 9
  - name: proto
    scm: shared-repo
agents:
  - name: linux-1
    resources:
      rustc: ["1.85"]
  - name: linux-2
    status: offline
"#;

    #[test]
    fn test_parse_sample() {
        let file = WorkspaceFile::from_yaml(SAMPLE).unwrap();
        assert_eq!(file.scheduler.unsatisfiable_timeout_secs, 30);
        assert_eq!(file.projects.len(), 3);
        assert_eq!(file.agents[1].status, AgentStatus::Offline);

        let server = &file.projects[1];
        assert_eq!(server.dependencies[0].project(), "core");
        assert!(!server.dependencies[0].propagates_revision());
        assert_eq!(server.dependencies[1].project(), "proto");
        assert!(server.dependencies[1].propagates_revision());
        assert_eq!(server.stages[1].priority, Some(9));
    }

    #[test]
    fn test_resolve_builds_graph() {
        let workspace = WorkspaceFile::from_yaml(SAMPLE).unwrap().resolve().unwrap();

        let server = workspace.graph.project_by_name("server").unwrap();
        assert_eq!(server.priority, 5);
        let mut dependencies: Vec<_> = workspace
            .graph
            .dependencies(server.id)
            .into_iter()
            .map(|(node, edge)| (node.name.clone(), edge.propagate_revision))
            .collect();
        dependencies.sort();
        assert_eq!(
            dependencies,
            vec![("core".to_string(), false), ("proto".to_string(), true)]
        );
        assert_eq!(workspace.agents.len(), 2);
        assert!(workspace.agents[0].resources.contains_key("rustc"));
    }

    #[test]
    fn test_defaults() {
        let workspace = WorkspaceFile::from_yaml(SAMPLE).unwrap().resolve().unwrap();

        let core = workspace.project("core").unwrap();
        assert_eq!(core.project.state, ProjectState::Idle);
        assert_eq!(core.scm.as_str(), "core");
        assert_eq!(core.revision.as_str(), "r42");
        assert_eq!(core.build_file.stages.len(), 1);
        assert_eq!(core.build_file.stages[0].name, DEFAULT_STAGE);

        let proto = workspace.project("proto").unwrap();
        assert_eq!(proto.scm.as_str(), "shared-repo");
        assert_eq!(proto.revision.as_str(), "head");
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let file = WorkspaceFile::from_yaml(
            r#"
projects:
  - name: app
    dependencies: [missing]
"#,
        )
        .unwrap();

        assert!(matches!(
            file.resolve(),
            Err(WorkspaceError::Graph(GraphError::UnknownDependency(_)))
        ));
    }

    #[test]
    fn test_cycle_rejected() {
        let file = WorkspaceFile::from_yaml(
            r#"
projects:
  - name: a
    dependencies: [b]
  - name: b
    dependencies: [a]
"#,
        )
        .unwrap();

        assert!(matches!(
            file.resolve(),
            Err(WorkspaceError::Graph(GraphError::CycleDetected))
        ));
    }

    #[test]
    fn test_duplicate_agent_rejected() {
        let file = WorkspaceFile::from_yaml(
            r#"
agents:
  - name: box
  - name: box
"#,
        )
        .unwrap();

        assert!(matches!(
            file.resolve(),
            Err(WorkspaceError::DuplicateAgent(name)) if name == "box"
        ));
    }
}
