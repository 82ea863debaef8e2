//! Serialized access to project state.

use cadence_core::events::{Event, ProjectStateChangedPayload};
use cadence_core::ids::{AgentId, ProjectId};
use cadence_core::ports::{EventBus, ProjectRepository};
use cadence_core::project::{Project, ProjectState, Transition};
use cadence_core::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{info, warn};

/// Owns project state changes. Every mutation runs under that project's
/// lock, loads the stored project, applies the change and saves it back.
pub struct ProjectManager {
    repository: Arc<dyn ProjectRepository>,
    event_bus: Arc<dyn EventBus>,
    locks: Mutex<HashMap<ProjectId, Arc<AsyncMutex<()>>>>,
}

impl ProjectManager {
    pub fn new(repository: Arc<dyn ProjectRepository>, event_bus: Arc<dyn EventBus>) -> Self {
        Self {
            repository,
            event_bus,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_project(&self, id: ProjectId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(id).or_default())
        };
        lock.lock_owned().await
    }

    /// Runs `f` against the stored project while holding its lock. The
    /// project is saved only when `f` succeeds.
    pub async fn with_project_lock<T, F>(&self, id: ProjectId, f: F) -> Result<T>
    where
        F: FnOnce(&mut Project) -> Result<T> + Send,
        T: Send,
    {
        let _guard = self.lock_project(id).await;
        let mut project = self
            .repository
            .get(id)
            .await?
            .ok_or_else(|| Error::ProjectNotFound(id.to_string()))?;
        let result = f(&mut project)?;
        self.repository.save(&project).await?;
        Ok(result)
    }

    pub async fn get(&self, id: ProjectId) -> Result<Project> {
        self.repository
            .get(id)
            .await?
            .ok_or_else(|| Error::ProjectNotFound(id.to_string()))
    }

    pub async fn accepts_trigger(&self, id: ProjectId, personal: bool) -> Result<bool> {
        Ok(self.get(id).await?.state.accept_trigger(personal))
    }

    /// Applies a transition, failing without change if it is illegal.
    pub async fn make_transition(&self, id: ProjectId, transition: Transition) -> Result<ProjectState> {
        let (from, to) = self
            .with_project_lock(id, |project| {
                let from = project.state;
                let to = project.state_transition(transition)?;
                Ok((from, to))
            })
            .await?;
        self.state_changed(id, transition, from, to).await;
        Ok(to)
    }

    /// Marks a build as started and hands out its build number. An idle
    /// project moves to building.
    pub async fn build_commenced(&self, id: ProjectId) -> Result<u64> {
        let (number, change) = self
            .with_project_lock(id, |project| {
                let from = project.state;
                let change = if from == ProjectState::Idle {
                    Some((from, project.state_transition(Transition::Building)?))
                } else {
                    None
                };
                Ok((project.allocate_build_number(), change))
            })
            .await?;
        if let Some((from, to)) = change {
            self.state_changed(id, Transition::Building, from, to).await;
        }
        Ok(number)
    }

    /// Records a finished build. When no other build of the project is
    /// running, the project goes idle, resolving any deferred transition.
    pub async fn build_completed(
        &self,
        id: ProjectId,
        success: bool,
        still_running: bool,
    ) -> Result<ProjectState> {
        let (state, change) = self
            .with_project_lock(id, |project| {
                project.build_completed(success);
                let from = project.state;
                let change = if !still_running && from.is_building() {
                    Some((from, project.state_transition(Transition::Idle)?))
                } else {
                    None
                };
                Ok((project.state, change))
            })
            .await?;
        if let Some((from, to)) = change {
            self.state_changed(id, Transition::Idle, from, to).await;
        }
        Ok(state)
    }

    /// Applies STARTUP to every project, recovering from an unclean stop.
    pub async fn recover_all(&self) -> Result<usize> {
        let projects = self.repository.list().await?;
        let mut recovered = 0;
        for project in projects {
            match self.make_transition(project.id, Transition::Startup).await {
                Ok(_) => recovered += 1,
                Err(e) => warn!(project = %project.id, error = %e, "Failed to recover project state"),
            }
        }
        info!(recovered, "Recovered project states");
        Ok(recovered)
    }

    pub async fn pause(&self, id: ProjectId) -> Result<ProjectState> {
        self.make_transition(id, Transition::Pause).await
    }

    pub async fn resume(&self, id: ProjectId) -> Result<ProjectState> {
        self.make_transition(id, Transition::Resume).await
    }

    /// Clears a force-clean flag, reporting whether it was set.
    pub async fn take_force_clean(&self, id: ProjectId, agent: AgentId) -> Result<(Project, bool)> {
        self.with_project_lock(id, |project| {
            let clean = project.clear_force_clean_for_agent(agent);
            Ok((project.clone(), clean))
        })
        .await
    }

    async fn state_changed(
        &self,
        id: ProjectId,
        transition: Transition,
        from: ProjectState,
        to: ProjectState,
    ) {
        info!(project = %id, %transition, from = %from, to = %to, "Project state changed");
        let event = Event::ProjectStateChanged(ProjectStateChangedPayload {
            project_id: id,
            transition,
            from,
            to,
        });
        if let Err(e) = self.event_bus.publish(event).await {
            warn!(error = %e, "Failed to publish project state change");
        }
    }
}
