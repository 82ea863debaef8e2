//! In-memory implementations of the collaborator ports.
//!
//! Used by tests and by the CLI simulation.

use crate::bus::LocalEventBus;
use async_trait::async_trait;
use cadence_core::agent::{Agent, AgentStatus};
use cadence_core::build::ActivatedBuild;
use cadence_core::events::Event;
use cadence_core::ids::{AgentId, ProjectId, ScmRef};
use cadence_core::ports::*;
use cadence_core::project::Project;
use cadence_core::recipe::{BuildContext, RecipeRequest};
use cadence_core::revision::{BuildFile, Revision};
use cadence_core::{Error, Result};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Project repository backed by a map.
#[derive(Default)]
pub struct InMemoryProjectRepository {
    projects: Mutex<HashMap<ProjectId, Project>>,
}

impl InMemoryProjectRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_projects(projects: impl IntoIterator<Item = Project>) -> Self {
        Self {
            projects: Mutex::new(projects.into_iter().map(|p| (p.id, p)).collect()),
        }
    }
}

#[async_trait]
impl ProjectRepository for InMemoryProjectRepository {
    async fn get(&self, id: ProjectId) -> Result<Option<Project>> {
        Ok(lock(&self.projects).get(&id).cloned())
    }

    async fn save(&self, project: &Project) -> Result<()> {
        lock(&self.projects).insert(project.id, project.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Project>> {
        let mut projects: Vec<_> = lock(&self.projects).values().cloned().collect();
        projects.sort_by_key(|p| p.id);
        Ok(projects)
    }
}

/// Agent directory whose agents are managed directly.
#[derive(Default)]
pub struct InMemoryAgentDirectory {
    agents: Mutex<Vec<Agent>>,
}

impl InMemoryAgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agents(agents: impl IntoIterator<Item = Agent>) -> Self {
        Self {
            agents: Mutex::new(agents.into_iter().collect()),
        }
    }

    /// Adds an agent, replacing one with the same id.
    pub fn upsert(&self, agent: Agent) {
        let mut agents = lock(&self.agents);
        match agents.iter_mut().find(|a| a.id == agent.id) {
            Some(existing) => *existing = agent,
            None => agents.push(agent),
        }
    }

    pub fn set_status(&self, id: AgentId, status: AgentStatus) -> bool {
        let mut agents = lock(&self.agents);
        match agents.iter_mut().find(|a| a.id == id) {
            Some(agent) => {
                agent.status = status;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: AgentId) -> Option<Agent> {
        lock(&self.agents).iter().find(|a| a.id == id).cloned()
    }
}

#[async_trait]
impl AgentDirectory for InMemoryAgentDirectory {
    async fn online_agents(&self) -> Result<Vec<Agent>> {
        Ok(lock(&self.agents)
            .iter()
            .filter(|a| a.is_online())
            .cloned()
            .collect())
    }

    async fn available_agents(&self) -> Result<Vec<Agent>> {
        Ok(lock(&self.agents)
            .iter()
            .filter(|a| a.is_available())
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct ScmState {
    latest: Option<Revision>,
    build_files: HashMap<Revision, BuildFile>,
    failure: Option<String>,
}

/// Revision source with scripted revisions and build files.
#[derive(Default)]
pub struct StaticRevisionSource {
    repositories: Mutex<HashMap<ScmRef, ScmState>>,
}

impl StaticRevisionSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `revision` the latest of `scm`, with the given build file.
    pub fn set_latest(&self, scm: &ScmRef, revision: Revision, build_file: BuildFile) {
        let mut repositories = lock(&self.repositories);
        let state = repositories.entry(scm.clone()).or_default();
        state.build_files.insert(revision.clone(), build_file);
        state.latest = Some(revision);
    }

    /// Makes every lookup against `scm` fail.
    pub fn fail(&self, scm: &ScmRef, message: impl Into<String>) {
        lock(&self.repositories)
            .entry(scm.clone())
            .or_default()
            .failure = Some(message.into());
    }
}

#[async_trait]
impl RevisionSource for StaticRevisionSource {
    async fn latest_revision(&self, scm: &ScmRef) -> Result<Revision> {
        let repositories = lock(&self.repositories);
        let state = repositories
            .get(scm)
            .ok_or_else(|| Error::RevisionResolution(format!("unknown scm '{scm}'")))?;
        if let Some(message) = &state.failure {
            return Err(Error::RevisionResolution(message.clone()));
        }
        state
            .latest
            .clone()
            .ok_or_else(|| Error::RevisionResolution(format!("no revisions in '{scm}'")))
    }

    async fn resolve_build_file(&self, scm: &ScmRef, revision: &Revision) -> Result<BuildFile> {
        let repositories = lock(&self.repositories);
        match repositories.get(scm) {
            Some(state) => match &state.failure {
                Some(message) => Err(Error::RevisionResolution(message.clone())),
                None => Ok(state.build_files.get(revision).cloned().unwrap_or_default()),
            },
            None => Err(Error::RevisionResolution(format!("unknown scm '{scm}'"))),
        }
    }
}

/// Event bus that keeps every published event and forwards it to a
/// [`LocalEventBus`] for subscribers.
#[derive(Default)]
pub struct RecordingEventBus {
    events: Mutex<Vec<Event>>,
    inner: LocalEventBus,
}

impl RecordingEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        lock(&self.events).clone()
    }

    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *lock(&self.events))
    }
}

#[async_trait]
impl EventBus for RecordingEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        lock(&self.events).push(event.clone());
        self.inner.publish(event).await
    }

    async fn subscribe(&self, pattern: &str) -> Result<EventStream> {
        self.inner.subscribe(pattern).await
    }
}

/// A recipe handed to an agent.
#[derive(Debug, Clone)]
pub struct DispatchedRecipe {
    pub agent: Agent,
    pub recipe: RecipeRequest,
    pub context: BuildContext,
}

/// Agent build service that records dispatches.
#[derive(Default)]
pub struct RecordingBuildService {
    dispatched: Mutex<Vec<DispatchedRecipe>>,
    failure: Mutex<Option<String>>,
}

impl RecordingBuildService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following dispatch fail.
    pub fn fail_with(&self, message: impl Into<String>) {
        *lock(&self.failure) = Some(message.into());
    }

    pub fn dispatched(&self) -> Vec<DispatchedRecipe> {
        lock(&self.dispatched).clone()
    }
}

#[async_trait]
impl AgentBuildService for RecordingBuildService {
    async fn build(
        &self,
        agent: &Agent,
        recipe: &RecipeRequest,
        context: &BuildContext,
    ) -> Result<()> {
        if let Some(message) = lock(&self.failure).clone() {
            return Err(Error::DispatchTransport(message));
        }
        lock(&self.dispatched).push(DispatchedRecipe {
            agent: agent.clone(),
            recipe: recipe.clone(),
            context: context.clone(),
        });
        Ok(())
    }
}

/// Build starter that records the builds it was asked to start.
#[derive(Default)]
pub struct RecordingBuildStarter {
    started: Mutex<Vec<ActivatedBuild>>,
}

impl RecordingBuildStarter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(&self) -> Vec<ActivatedBuild> {
        lock(&self.started).clone()
    }
}

#[async_trait]
impl BuildStarter for RecordingBuildStarter {
    async fn start(&self, build: &ActivatedBuild) -> Result<()> {
        lock(&self.started).push(build.clone());
        Ok(())
    }
}
