//! Recipe dispatch queue.
//!
//! Recipes wait here until an available agent satisfies their resource and
//! host requirements. A matcher task assigns agents and hands assignments to
//! a dispatcher task over a bounded channel, so a slow agent never stalls
//! matching. Both tasks, plus a listener for agent and source-control
//! events, run until [`RecipeQueue::stop`].

use crate::agents::{AgentSorter, HashAgentSorter};
use crate::config::{SchedulerConfig, UnsatisfiablePolicy};
use crate::project_manager::ProjectManager;
use cadence_core::agent::Agent;
use cadence_core::events::{
    Event, RecipeDispatchedPayload, RecipeErrorKind, RecipeErrorPayload, RecipeStatusPayload,
};
use cadence_core::ids::{AgentId, RecipeId, ScmRef};
use cadence_core::ports::{AgentBuildService, AgentDirectory, EventBus, EventStream, RevisionSource};
use cadence_core::recipe::{BuildContext, DispatchStatus, RecipeDispatchRequest};
use cadence_core::revision::Revision;
use cadence_core::{Error, Result};
use cadence_trace::{CiAttributes, dispatch_span, recipe_span};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

const TIMEOUT_MESSAGE: &str =
    "Recipe request timed out waiting for a capable agent to become available";

/// Collaborators of the recipe queue.
#[derive(Clone)]
pub struct RecipeQueuePorts {
    pub revisions: Arc<dyn RevisionSource>,
    pub agents: Arc<dyn AgentDirectory>,
    pub build_service: Arc<dyn AgentBuildService>,
    pub projects: Arc<ProjectManager>,
    pub event_bus: Arc<dyn EventBus>,
}

/// An agent assignment on its way to the dispatcher.
struct Dispatch {
    request: RecipeDispatchRequest,
    agent: Agent,
}

/// Agents handed a recipe that have not reported back as available.
#[derive(Default)]
struct Assignments(Mutex<HashSet<AgentId>>);

impl Assignments {
    fn lock(&self) -> MutexGuard<'_, HashSet<AgentId>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn claim(&self, agent_id: AgentId) {
        self.lock().insert(agent_id);
    }

    fn release(&self, agent_id: AgentId) -> bool {
        self.lock().remove(&agent_id)
    }

    fn snapshot(&self) -> HashSet<AgentId> {
        self.lock().clone()
    }
}

#[derive(Default)]
struct Runtime {
    receiver: Option<mpsc::Receiver<Dispatch>>,
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

/// Queue of recipes waiting for an agent. Cheap to clone.
#[derive(Clone)]
pub struct RecipeQueue {
    shared: Arc<Shared>,
}

struct Shared {
    pending: AsyncMutex<Vec<RecipeDispatchRequest>>,
    wake: Notify,
    revisions: Arc<dyn RevisionSource>,
    agents: Arc<dyn AgentDirectory>,
    event_bus: Arc<dyn EventBus>,
    sorter: Arc<dyn AgentSorter>,
    policy: UnsatisfiablePolicy,
    interval: Duration,
    hand_off: mpsc::Sender<Dispatch>,
    assignments: Arc<Assignments>,
    dispatcher: Arc<Dispatcher>,
    runtime: Mutex<Runtime>,
}

impl RecipeQueue {
    pub fn new(config: &SchedulerConfig, ports: RecipeQueuePorts) -> Self {
        Self::with_sorter(config, ports, Arc::new(HashAgentSorter::new()))
    }

    pub fn with_sorter(
        config: &SchedulerConfig,
        ports: RecipeQueuePorts,
        sorter: Arc<dyn AgentSorter>,
    ) -> Self {
        let (hand_off, receiver) = mpsc::channel(config.dispatch_channel_capacity.max(1));
        let assignments = Arc::new(Assignments::default());
        let dispatcher = Arc::new(Dispatcher {
            build_service: ports.build_service,
            projects: ports.projects,
            event_bus: Arc::clone(&ports.event_bus),
            assignments: Arc::clone(&assignments),
        });
        Self {
            shared: Arc::new(Shared {
                pending: AsyncMutex::new(Vec::new()),
                wake: Notify::new(),
                revisions: ports.revisions,
                agents: ports.agents,
                event_bus: ports.event_bus,
                sorter,
                policy: config.unsatisfiable_policy(),
                interval: config.matcher_interval(),
                hand_off,
                assignments,
                dispatcher,
                runtime: Mutex::new(Runtime {
                    receiver: Some(receiver),
                    ..Runtime::default()
                }),
            }),
        }
    }

    /// Admits a recipe. The build revision is resolved first if needed, then
    /// the request is checked against the online agents under the
    /// configured unsatisfiable policy.
    pub async fn enqueue(&self, request: RecipeDispatchRequest) -> Result<()> {
        let span = recipe_span(
            &CiAttributes::new()
                .project(
                    request.request.project_id.to_string(),
                    request.request.project_name.clone(),
                )
                .build(request.request.build_id.to_string(), request.request.build_number)
                .recipe(request.id().to_string(), request.request.stage.clone()),
        );
        self.shared.enqueue(request).instrument(span).await
    }

    /// Removes a pending recipe. Returns false when it is not pending.
    pub async fn cancel(&self, id: RecipeId) -> bool {
        let mut pending = self.shared.pending.lock().await;
        match pending.iter().position(|r| r.id() == id) {
            Some(index) => {
                let request = pending.remove(index);
                info!(recipe_id = %id, stage = %request.request.stage, "Recipe request cancelled");
                true
            }
            None => false,
        }
    }

    /// Deep copies of the pending recipes, in arrival order.
    pub async fn snapshot(&self) -> Vec<RecipeDispatchRequest> {
        let pending = self.shared.pending.lock().await;
        pending.iter().map(RecipeDispatchRequest::snapshot).collect()
    }

    pub async fn len(&self) -> usize {
        self.shared.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// One matching pass as of `now`.
    pub async fn process(&self, now: DateTime<Utc>) {
        self.shared.process(now).await;
    }

    /// Reacts to agent and source-control events.
    pub async fn handle_event(&self, event: &Event) {
        self.shared.handle_event(event).await;
    }

    /// Spawns the matcher, dispatcher and event listener tasks.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Err(Error::Internal("recipe queue is already running".into()));
        }
        let agents = self.shared.event_bus.subscribe("agent.>").await?;
        let scm = self.shared.event_bus.subscribe("scm.>").await?;
        let events: EventStream = Box::pin(futures::stream::select(agents, scm));

        let mut runtime = self.shared.runtime();
        let receiver = runtime
            .receiver
            .take()
            .ok_or_else(|| Error::Internal("recipe queue cannot be restarted".into()))?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        runtime.shutdown = Some(shutdown);
        runtime.tasks.push(tokio::spawn(
            Arc::clone(&self.shared).match_loop(shutdown_rx.clone()),
        ));
        runtime.tasks.push(tokio::spawn(
            Arc::clone(&self.shared.dispatcher).run(receiver, shutdown_rx.clone()),
        ));
        runtime
            .tasks
            .push(tokio::spawn(Arc::clone(&self.shared).listen(events, shutdown_rx)));
        info!(
            interval_secs = self.shared.interval.as_secs(),
            "Recipe queue started"
        );
        Ok(())
    }

    /// Signals every task to finish and waits for them.
    pub async fn stop(&self) {
        let (shutdown, tasks) = {
            let mut runtime = self.shared.runtime();
            (runtime.shutdown.take(), std::mem::take(&mut runtime.tasks))
        };
        let Some(shutdown) = shutdown else {
            return;
        };
        let _ = shutdown.send(true);
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Recipe queue task ended abnormally");
            }
        }
        info!("Recipe queue stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.runtime().shutdown.is_some()
    }
}

impl Shared {
    fn runtime(&self) -> MutexGuard<'_, Runtime> {
        self.runtime.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn enqueue(&self, mut request: RecipeDispatchRequest) -> Result<()> {
        let mut pending = self.pending.lock().await;

        if let Err(e) = self.initialise_revision(&request).await {
            self.reject(&mut request, RecipeErrorKind::RevisionResolution, e.to_string())
                .await;
            return Err(e);
        }

        if let Some(online) = self.online_agents().await {
            if !self.apply_policy(&mut request, &online, Utc::now()).await {
                return Err(Error::UnsatisfiableRequest(request.request.stage.clone()));
            }
        }

        info!(
            recipe_id = %request.id(),
            project = %request.request.project_name,
            stage = %request.request.stage,
            priority = request.request.priority,
            deadline = ?request.timeout_at,
            "Recipe request queued"
        );
        pending.push(request);
        drop(pending);
        self.wake.notify_one();
        Ok(())
    }

    async fn initialise_revision(&self, request: &RecipeDispatchRequest) -> Result<()> {
        if request.revision.is_initialised() {
            return Ok(());
        }
        self.status(request, "Initialising build revision...").await;
        let revision = self
            .revisions
            .latest_revision(&request.scm)
            .await
            .map_err(resolution_error)?;
        let build_file = self
            .revisions
            .resolve_build_file(&request.scm, &revision)
            .await
            .map_err(resolution_error)?;
        request.revision.update(revision.clone(), build_file)?;
        self.status(request, format!("Revision initialised to '{revision}'"))
            .await;
        Ok(())
    }

    /// Checks `request` against the online agents. Returns false when the
    /// request was rejected.
    async fn apply_policy(
        &self,
        request: &mut RecipeDispatchRequest,
        online: &[Agent],
        now: DateTime<Utc>,
    ) -> bool {
        if online.iter().any(|agent| request.is_fulfilled_by(agent)) {
            request.timeout_at = None;
            return true;
        }
        match self.policy {
            UnsatisfiablePolicy::RejectImmediately => {
                let message =
                    Error::UnsatisfiableRequest(request.request.stage.clone()).to_string();
                self.reject(request, RecipeErrorKind::Unsatisfiable, message)
                    .await;
                false
            }
            UnsatisfiablePolicy::Timeout(wait) => {
                if request.timeout_at.is_none() {
                    request.timeout_at = Some(now + deadline_offset(wait));
                    debug!(
                        recipe_id = %request.id(),
                        deadline = ?request.timeout_at,
                        "No capable agent online, deadline set"
                    );
                }
                true
            }
            UnsatisfiablePolicy::WaitForever => true,
        }
    }

    async fn process(&self, now: DateTime<Utc>) {
        let mut pending = self.pending.lock().await;
        if pending.is_empty() {
            return;
        }
        let available = match self.agents.available_agents().await {
            Ok(agents) => agents,
            Err(e) => {
                warn!(error = %e, "Unable to list available agents");
                return;
            }
        };

        pending.sort_by_key(|r| Reverse(r.request.priority));
        // Agents stay taken across passes until they report available.
        let mut taken = self.assignments.snapshot();
        let mut kept = Vec::with_capacity(pending.len());

        for mut request in std::mem::take(&mut *pending) {
            if request.has_timed_out(now) {
                self.reject(&mut request, RecipeErrorKind::Timeout, TIMEOUT_MESSAGE.to_string())
                    .await;
                continue;
            }

            let candidates: Vec<Agent> = available
                .iter()
                .filter(|agent| !taken.contains(&agent.id))
                .cloned()
                .collect();
            let chosen = self
                .sorter
                .sort(candidates, &request.request)
                .into_iter()
                .find(|agent| request.is_fulfilled_by(agent));

            match chosen {
                Some(agent) => match self.hand_off(request, agent).await {
                    Ok(agent_id) => {
                        taken.insert(agent_id);
                    }
                    Err(request) => kept.push(request),
                },
                None => kept.push(request),
            }
        }

        *pending = kept;
    }

    /// Passes an assignment to the dispatcher. Gives the request back when
    /// the hand-off channel cannot take it. The recipe counts as dispatched
    /// only once the agent accepts it.
    async fn hand_off(
        &self,
        mut request: RecipeDispatchRequest,
        agent: Agent,
    ) -> std::result::Result<AgentId, RecipeDispatchRequest> {
        let agent_id = agent.id;
        let agent_name = agent.name.clone();
        let recipe_id = request.id();
        let revision = Arc::clone(&request.revision);
        let notice = RecipeStatusPayload {
            recipe_id,
            build_id: request.request.build_id,
            project_id: request.request.project_id,
            message: format!("Assigned to agent '{agent_name}'"),
            timestamp: Utc::now(),
        };
        let stage = request.request.stage.clone();

        // Claimed before the send so a fast dispatch failure can release it.
        self.assignments.claim(agent_id);
        request.status = DispatchStatus::Dispatching { agent_id };
        let returned = match self.hand_off.try_send(Dispatch { request, agent }) {
            Ok(()) => None,
            Err(TrySendError::Full(dispatch)) => {
                debug!(%recipe_id, "Dispatcher busy, recipe stays queued");
                Some(dispatch.request)
            }
            Err(TrySendError::Closed(dispatch)) => {
                warn!(%recipe_id, "Dispatcher is not running, recipe stays queued");
                Some(dispatch.request)
            }
        };
        if let Some(mut request) = returned {
            self.assignments.release(agent_id);
            request.status = DispatchStatus::Queued;
            return Err(request);
        }

        revision.fix();
        info!(
            %recipe_id,
            project_id = %notice.project_id,
            %stage,
            agent = %agent_name,
            "Recipe assigned to agent"
        );
        publish(&*self.event_bus, Event::RecipeStatus(notice)).await;
        Ok(agent_id)
    }

    async fn handle_event(&self, event: &Event) {
        match event {
            Event::AgentOnline(p) => {
                self.assignments.release(p.agent_id);
                self.agent_capable(p.agent_id).await
            }
            Event::AgentResourcesDiscovered(p) => self.agent_capable(p.agent_id).await,
            Event::AgentOffline(p) => {
                debug!(agent = %p.agent_name, "Agent went offline");
                self.assignments.release(p.agent_id);
                self.agent_lost().await
            }
            Event::AgentAvailable(p) => {
                if self.assignments.release(p.agent_id) {
                    debug!(agent = %p.agent_name, "Agent released");
                }
            }
            Event::ScmChanged(p) => self.scm_changed(&p.scm, &p.revision).await,
            _ => return,
        }
        self.wake.notify_one();
    }

    /// Lifts deadlines the agent makes unnecessary.
    async fn agent_capable(&self, agent_id: AgentId) {
        let Some(online) = self.online_agents().await else {
            return;
        };
        let Some(agent) = online.into_iter().find(|a| a.id == agent_id) else {
            return;
        };
        let mut pending = self.pending.lock().await;
        for request in pending.iter_mut() {
            if request.timeout_at.is_some() && request.is_fulfilled_by(&agent) {
                debug!(recipe_id = %request.id(), agent = %agent.name, "Deadline cleared");
                request.timeout_at = None;
            }
        }
    }

    /// Re-checks every pending recipe after the pool shrank.
    async fn agent_lost(&self) {
        let mut pending = self.pending.lock().await;
        let Some(online) = self.online_agents().await else {
            return;
        };
        let now = Utc::now();
        let mut kept = Vec::with_capacity(pending.len());
        for mut request in std::mem::take(&mut *pending) {
            if self.apply_policy(&mut request, &online, now).await {
                kept.push(request);
            }
        }
        *pending = kept;
    }

    async fn scm_changed(&self, scm: &ScmRef, revision: &Revision) {
        let mut pending = self.pending.lock().await;
        let online = self.online_agents().await;
        let now = Utc::now();
        // Recipes of one build share a revision; update it once.
        let mut updated: HashSet<usize> = HashSet::new();
        let mut kept = Vec::with_capacity(pending.len());

        for mut request in std::mem::take(&mut *pending) {
            if request.scm != *scm || request.revision.is_fixed() {
                kept.push(request);
                continue;
            }

            let shared = Arc::as_ptr(&request.revision) as usize;
            if !updated.contains(&shared) {
                if request.revision.revision().as_ref() == Some(revision) {
                    kept.push(request);
                    continue;
                }
                let build_file = match self.revisions.resolve_build_file(scm, revision).await {
                    Ok(file) => file,
                    Err(e) => {
                        // The recipe still has a usable revision.
                        warn!(
                            recipe_id = %request.id(),
                            %scm,
                            %revision,
                            error = %e,
                            "Unable to update queued build revision, keeping the current one"
                        );
                        kept.push(request);
                        continue;
                    }
                };
                if let Err(e) = request.revision.update(revision.clone(), build_file) {
                    debug!(recipe_id = %request.id(), error = %e, "Revision not updated");
                    kept.push(request);
                    continue;
                }
                updated.insert(shared);
            }

            info!(
                recipe_id = %request.id(),
                %scm,
                %revision,
                "Build revision updated while queued"
            );
            self.status(
                &request,
                format!("Change detected while queued, updating build revision to '{revision}'"),
            )
            .await;

            let keep = match &online {
                Some(online) => self.apply_policy(&mut request, online, now).await,
                None => true,
            };
            if keep {
                kept.push(request);
            }
        }

        *pending = kept;
    }

    async fn online_agents(&self) -> Option<Vec<Agent>> {
        match self.agents.online_agents().await {
            Ok(agents) => Some(agents),
            Err(e) => {
                warn!(error = %e, "Unable to list online agents");
                None
            }
        }
    }

    async fn status(&self, request: &RecipeDispatchRequest, message: impl Into<String>) {
        let event = Event::RecipeStatus(RecipeStatusPayload {
            recipe_id: request.id(),
            build_id: request.request.build_id,
            project_id: request.request.project_id,
            message: message.into(),
            timestamp: Utc::now(),
        });
        publish(&*self.event_bus, event).await;
    }

    async fn reject(
        &self,
        request: &mut RecipeDispatchRequest,
        kind: RecipeErrorKind,
        message: String,
    ) {
        warn!(
            recipe_id = %request.id(),
            project = %request.request.project_name,
            stage = %request.request.stage,
            ?kind,
            %message,
            "Recipe request rejected"
        );
        request.status = DispatchStatus::Rejected {
            reason: message.clone(),
        };
        publish(&*self.event_bus, recipe_error(request, kind, message)).await;
    }

    async fn match_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            self.process(Utc::now()).await;
            tokio::select! {
                _ = tokio::time::timeout(self.interval, self.wake.notified()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Recipe matcher shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn listen(self: Arc<Self>, mut events: EventStream, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                next = events.next() => match next {
                    Some(Ok(event)) => self.handle_event(&event).await,
                    Some(Err(e)) => warn!(error = %e, "Recipe queue event stream error"),
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

/// Delivers assignments to agents. Runs on its own task so that a slow
/// agent delays only its own recipe.
struct Dispatcher {
    build_service: Arc<dyn AgentBuildService>,
    projects: Arc<ProjectManager>,
    event_bus: Arc<dyn EventBus>,
    assignments: Arc<Assignments>,
}

impl Dispatcher {
    async fn run(
        self: Arc<Self>,
        mut receiver: mpsc::Receiver<Dispatch>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                dispatch = receiver.recv() => match dispatch {
                    Some(dispatch) => {
                        let span = dispatch_span(
                            &CiAttributes::new()
                                .recipe(dispatch.request.id().to_string(), dispatch.request.request.stage.clone())
                                .agent(dispatch.agent.id.to_string(), dispatch.agent.name.clone())
                                .revision(
                                    dispatch.request.revision.revision().map(|r| r.to_string()).unwrap_or_default(),
                                ),
                        );
                        self.dispatch(dispatch).instrument(span).await;
                    }
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Recipe dispatcher shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn dispatch(&self, dispatch: Dispatch) {
        let Dispatch { mut request, agent } = dispatch;
        let context = self.build_context(&request, &agent).await;
        match self
            .build_service
            .build(&agent, &request.request, &context)
            .await
        {
            Ok(()) => {
                request.status = DispatchStatus::Dispatched { agent_id: agent.id };
                info!(
                    recipe_id = %request.id(),
                    agent = %agent.name,
                    clean_build = context.clean_build,
                    status = ?request.status,
                    "Recipe dispatched"
                );
                let payload = RecipeDispatchedPayload {
                    recipe_id: request.id(),
                    build_id: request.request.build_id,
                    project_id: request.request.project_id,
                    stage: request.request.stage.clone(),
                    agent_id: agent.id,
                    agent_name: agent.name.clone(),
                    revision: request.revision.revision(),
                    dispatched_at: Utc::now(),
                };
                publish(&*self.event_bus, Event::RecipeDispatched(payload)).await;
            }
            Err(e) => {
                self.assignments.release(agent.id);
                let message = match e {
                    Error::DispatchTransport(message) => Error::DispatchTransport(message),
                    other => Error::DispatchTransport(other.to_string()),
                }
                .to_string();
                error!(recipe_id = %request.id(), agent = %agent.name, %message, "Dispatch failed");
                publish(
                    &*self.event_bus,
                    recipe_error(&request, RecipeErrorKind::DispatchTransport, message),
                )
                .await;
            }
        }
    }

    async fn build_context(&self, request: &RecipeDispatchRequest, agent: &Agent) -> BuildContext {
        let recipe = &request.request;
        let (project, clean_build) = match self
            .projects
            .take_force_clean(recipe.project_id, agent.id)
            .await
        {
            Ok((project, clean)) => (Some(project), clean),
            Err(e) => {
                warn!(project = %recipe.project_name, error = %e, "Project unavailable for build context");
                (None, false)
            }
        };

        let mut properties = BTreeMap::new();
        properties.insert("build.number".to_string(), recipe.build_number.to_string());
        properties.insert("build.reason".to_string(), recipe.reason.to_string());
        if let Some(revision) = request.revision.revision() {
            properties.insert("build.revision".to_string(), revision.to_string());
        }
        let timestamp = request.revision.timestamp().unwrap_or(request.queued_at);
        properties.insert("build.timestamp".to_string(), timestamp.to_rfc3339());
        if let Some(project) = &project {
            properties.insert(
                "project.build.count".to_string(),
                project.build_count.to_string(),
            );
            properties.insert(
                "project.success.count".to_string(),
                project.success_count.to_string(),
            );
        }

        BuildContext {
            build_number: recipe.build_number,
            project_name: recipe.project_name.clone(),
            stage: recipe.stage.clone(),
            clean_build,
            properties,
        }
    }
}

fn resolution_error(e: Error) -> Error {
    match e {
        Error::RevisionResolution(message) => Error::RevisionResolution(message),
        other => Error::RevisionResolution(other.to_string()),
    }
}

fn deadline_offset(wait: Duration) -> chrono::Duration {
    chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

fn recipe_error(request: &RecipeDispatchRequest, kind: RecipeErrorKind, message: String) -> Event {
    Event::RecipeError(RecipeErrorPayload {
        recipe_id: request.id(),
        build_id: request.request.build_id,
        project_id: request.request.project_id,
        kind,
        message,
        timestamp: Utc::now(),
    })
}

async fn publish(bus: &dyn EventBus, event: Event) {
    if let Err(e) = bus.publish(event).await {
        warn!(error = %e, "Failed to publish recipe event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::DirectoryOrderSorter;
    use crate::memory::{
        InMemoryAgentDirectory, InMemoryProjectRepository, RecordingBuildService,
        RecordingEventBus, StaticRevisionSource,
    };
    use cadence_core::agent::{AgentStatus, ResourceRequirement};
    use cadence_core::events::{AgentPayload, ScmChangedPayload};
    use cadence_core::ids::{BuildId, ProjectId};
    use cadence_core::project::Project;
    use cadence_core::recipe::RecipeRequest;
    use cadence_core::revision::{BuildFile, BuildRevision};

    struct Harness {
        queue: RecipeQueue,
        agents: Arc<InMemoryAgentDirectory>,
        revisions: Arc<StaticRevisionSource>,
        bus: Arc<RecordingEventBus>,
        builds: Arc<RecordingBuildService>,
        project: Project,
    }

    fn harness(timeout_secs: i64, agents: Vec<Agent>) -> Harness {
        let project = Project::new("server");
        let repository = Arc::new(InMemoryProjectRepository::with_projects([project.clone()]));
        let agents = Arc::new(InMemoryAgentDirectory::with_agents(agents));
        let revisions = Arc::new(StaticRevisionSource::new());
        let bus = Arc::new(RecordingEventBus::new());
        let builds = Arc::new(RecordingBuildService::new());
        let config = SchedulerConfig::default().with_unsatisfiable_timeout_secs(timeout_secs);
        let ports = RecipeQueuePorts {
            revisions: revisions.clone(),
            agents: agents.clone(),
            build_service: builds.clone(),
            projects: Arc::new(ProjectManager::new(repository, bus.clone())),
            event_bus: bus.clone(),
        };
        let queue = RecipeQueue::with_sorter(&config, ports, Arc::new(DirectoryOrderSorter));
        Harness {
            queue,
            agents,
            revisions,
            bus,
            builds,
            project,
        }
    }

    impl Harness {
        fn recipe(&self, stage: &str) -> RecipeDispatchRequest {
            let request = RecipeRequest::new(
                BuildId::new(),
                self.project.id,
                self.project.name.clone(),
                stage,
            )
            .with_build_number(1);
            RecipeDispatchRequest::new(
                request,
                BuildRevision::resolved(Revision::new("r1"), BuildFile::default()),
                ScmRef::new("main"),
            )
        }

        fn errors(&self) -> Vec<RecipeErrorPayload> {
            self.bus
                .events()
                .into_iter()
                .filter_map(|e| match e {
                    Event::RecipeError(p) => Some(p),
                    _ => None,
                })
                .collect()
        }

        fn dispatched(&self) -> Vec<RecipeDispatchedPayload> {
            self.bus
                .events()
                .into_iter()
                .filter_map(|e| match e {
                    Event::RecipeDispatched(p) => Some(p),
                    _ => None,
                })
                .collect()
        }

        /// Recipes handed to an agent, with the assignment notice.
        fn assigned(&self) -> Vec<(RecipeId, String)> {
            self.bus
                .events()
                .into_iter()
                .filter_map(|e| match e {
                    Event::RecipeStatus(p) if p.message.starts_with("Assigned to agent") => {
                        Some((p.recipe_id, p.message))
                    }
                    _ => None,
                })
                .collect()
        }

        fn statuses(&self) -> Vec<String> {
            self.bus
                .events()
                .into_iter()
                .filter_map(|e| match e {
                    Event::RecipeStatus(p) => Some(p.message),
                    _ => None,
                })
                .collect()
        }
    }

    fn needs(stage_request: RecipeDispatchRequest, resource: &str) -> RecipeDispatchRequest {
        let RecipeDispatchRequest { request, .. } = &stage_request;
        let request = request
            .clone()
            .with_requirement(ResourceRequirement::new(resource));
        RecipeDispatchRequest {
            request,
            ..stage_request
        }
    }

    #[tokio::test]
    async fn test_unsatisfiable_rejected_immediately() {
        let h = harness(0, vec![Agent::new("plain")]);
        let request = needs(h.recipe("build"), "gpu");

        let result = h.queue.enqueue(request).await;

        assert!(matches!(result, Err(Error::UnsatisfiableRequest(_))));
        assert_eq!(h.queue.len().await, 0);
        let errors = h.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, RecipeErrorKind::Unsatisfiable);
        assert!(errors[0]
            .message
            .starts_with("No online agent is capable of executing the build stage"));
    }

    #[tokio::test]
    async fn test_timeout_sets_deadline_and_expires() {
        let h = harness(5, vec![Agent::new("plain")]);
        h.queue.enqueue(needs(h.recipe("build"), "gpu")).await.unwrap();

        let snapshot = h.queue.snapshot().await;
        let deadline = snapshot[0].timeout_at.unwrap();
        assert!(deadline > Utc::now());

        h.queue.process(Utc::now()).await;
        assert_eq!(h.queue.len().await, 1);

        h.queue.process(deadline + chrono::Duration::seconds(1)).await;
        assert_eq!(h.queue.len().await, 0);
        let errors = h.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, RecipeErrorKind::Timeout);
        assert_eq!(errors[0].message, TIMEOUT_MESSAGE);
    }

    #[tokio::test]
    async fn test_capable_agent_arrival_clears_deadline() {
        let h = harness(5, vec![Agent::new("plain")]);
        h.queue.enqueue(needs(h.recipe("build"), "gpu")).await.unwrap();

        let gpu = Agent::new("gpu-1").with_resource("gpu", "a100");
        h.agents.upsert(gpu.clone());
        h.queue
            .handle_event(&Event::AgentOnline(AgentPayload {
                agent_id: gpu.id,
                agent_name: gpu.name.clone(),
            }))
            .await;
        assert!(h.queue.snapshot().await[0].timeout_at.is_none());

        h.queue.process(Utc::now() + chrono::Duration::hours(1)).await;
        assert!(h.errors().is_empty());
        let assigned = h.assigned();
        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned[0].1, "Assigned to agent 'gpu-1'");
    }

    #[tokio::test]
    async fn test_priority_order_and_single_assignment_per_agent() {
        let h = harness(-1, vec![Agent::new("only")]);
        let low = h.recipe("low");
        let high = h.recipe("high");
        let high = RecipeDispatchRequest {
            request: high.request.clone().with_priority(10),
            ..high
        };
        let low_id = low.id();
        let high_id = high.id();
        h.queue.enqueue(low).await.unwrap();
        h.queue.enqueue(high).await.unwrap();

        h.queue.process(Utc::now()).await;

        let assigned = h.assigned();
        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned[0].0, high_id);
        let remaining = h.queue.snapshot().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id(), low_id);
    }

    #[tokio::test]
    async fn test_busy_agents_not_matched() {
        let h = harness(-1, vec![Agent::new("busy").with_status(AgentStatus::Busy)]);
        h.queue.enqueue(h.recipe("build")).await.unwrap();
        h.queue.process(Utc::now()).await;
        assert!(h.assigned().is_empty());
        assert_eq!(h.queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_assigned_agent_not_reused_until_available() {
        let agent = Agent::new("only");
        let h = harness(-1, vec![agent.clone()]);

        h.queue.enqueue(h.recipe("first")).await.unwrap();
        h.queue.process(Utc::now()).await;
        h.queue.enqueue(h.recipe("second")).await.unwrap();
        h.queue.process(Utc::now()).await;

        // The directory still reports the agent idle.
        assert_eq!(h.assigned().len(), 1);
        assert_eq!(h.queue.len().await, 1);

        h.queue
            .handle_event(&Event::AgentAvailable(AgentPayload {
                agent_id: agent.id,
                agent_name: agent.name.clone(),
            }))
            .await;
        h.queue.process(Utc::now()).await;

        assert_eq!(h.assigned().len(), 2);
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_revision_resolved_on_enqueue() {
        let h = harness(0, vec![Agent::new("a")]);
        let scm = ScmRef::new("main");
        h.revisions
            .set_latest(&scm, Revision::new("r42"), BuildFile::default());
        let request = RecipeDispatchRequest {
            revision: BuildRevision::unresolved(),
            ..h.recipe("build")
        };
        let revision = Arc::clone(&request.revision);

        h.queue.enqueue(request).await.unwrap();

        assert_eq!(revision.revision(), Some(Revision::new("r42")));
        assert_eq!(
            h.statuses(),
            vec![
                "Initialising build revision...".to_string(),
                "Revision initialised to 'r42'".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_revision_failure_rejects() {
        let h = harness(0, vec![Agent::new("a")]);
        h.revisions.fail(&ScmRef::new("main"), "repository unreachable");
        let request = RecipeDispatchRequest {
            revision: BuildRevision::unresolved(),
            ..h.recipe("build")
        };

        let result = h.queue.enqueue(request).await;

        assert!(matches!(result, Err(Error::RevisionResolution(_))));
        let errors = h.errors();
        assert_eq!(errors[0].kind, RecipeErrorKind::RevisionResolution);
        assert_eq!(
            errors[0].message,
            "Unable to determine revision to build: repository unreachable"
        );
    }

    #[tokio::test]
    async fn test_scm_change_updates_unfixed_revision() {
        let h = harness(-1, vec![Agent::new("busy").with_status(AgentStatus::Busy)]);
        let request = h.recipe("build");
        let revision = Arc::clone(&request.revision);
        h.queue.enqueue(request).await.unwrap();

        h.queue
            .handle_event(&Event::ScmChanged(ScmChangedPayload {
                scm: ScmRef::new("main"),
                revision: Revision::new("r2"),
            }))
            .await;

        assert_eq!(revision.revision(), Some(Revision::new("r2")));
        assert!(h
            .statuses()
            .contains(&"Change detected while queued, updating build revision to 'r2'".to_string()));
    }

    #[tokio::test]
    async fn test_scm_change_keeps_revision_when_resolution_fails() {
        let h = harness(-1, vec![Agent::new("busy").with_status(AgentStatus::Busy)]);
        let request = h.recipe("build");
        let revision = Arc::clone(&request.revision);
        h.queue.enqueue(request).await.unwrap();
        h.revisions.fail(&ScmRef::new("main"), "repository unreachable");

        h.queue
            .handle_event(&Event::ScmChanged(ScmChangedPayload {
                scm: ScmRef::new("main"),
                revision: Revision::new("r2"),
            }))
            .await;

        assert_eq!(h.queue.len().await, 1);
        assert!(h.errors().is_empty());
        assert_eq!(revision.revision(), Some(Revision::new("r1")));
        assert!(!revision.is_fixed());
    }

    #[tokio::test]
    async fn test_scm_change_ignores_other_scm() {
        let h = harness(-1, vec![]);
        let request = h.recipe("build");
        let revision = Arc::clone(&request.revision);
        h.queue.enqueue(request).await.unwrap();

        h.queue
            .handle_event(&Event::ScmChanged(ScmChangedPayload {
                scm: ScmRef::new("other"),
                revision: Revision::new("r9"),
            }))
            .await;

        assert_eq!(revision.revision(), Some(Revision::new("r1")));
    }

    #[tokio::test]
    async fn test_agent_offline_rejects_under_immediate_policy() {
        let gpu = Agent::new("gpu-1")
            .with_resource("gpu", "a100")
            .with_status(AgentStatus::Busy);
        let h = harness(0, vec![gpu.clone()]);
        h.queue.enqueue(needs(h.recipe("build"), "gpu")).await.unwrap();

        h.agents.set_status(gpu.id, AgentStatus::Offline);
        h.queue
            .handle_event(&Event::AgentOffline(AgentPayload {
                agent_id: gpu.id,
                agent_name: gpu.name.clone(),
            }))
            .await;

        assert_eq!(h.queue.len().await, 0);
        assert_eq!(h.errors()[0].kind, RecipeErrorKind::Unsatisfiable);
    }

    #[tokio::test]
    async fn test_cancel_pending() {
        let h = harness(-1, vec![]);
        let request = h.recipe("build");
        let id = request.id();
        h.queue.enqueue(request).await.unwrap();

        assert!(h.queue.cancel(id).await);
        assert!(!h.queue.cancel(id).await);
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_running_queue_dispatches_to_agent() {
        let agent = Agent::new("linux-1");
        let h = harness(0, vec![agent.clone()]);
        h.queue.start().await.unwrap();
        assert!(h.queue.is_running());

        let request = h.recipe("build");
        let recipe_id = request.id();
        h.queue.enqueue(request).await.unwrap();

        for _ in 0..100 {
            if !h.dispatched().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        h.queue.stop().await;
        assert!(!h.queue.is_running());

        let events = h.dispatched();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].recipe_id, recipe_id);
        assert_eq!(events[0].agent_name, "linux-1");
        assert_eq!(events[0].revision, Some(Revision::new("r1")));
        assert_eq!(h.assigned().len(), 1);

        let dispatched = h.builds.dispatched();
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].agent.id, agent.id);
        let context = &dispatched[0].context;
        assert_eq!(context.stage, "build");
        assert_eq!(context.properties["build.revision"], "r1");
        assert_eq!(context.properties["project.build.count"], "0");
        assert!(!context.clean_build);
    }

    #[tokio::test(start_paused = true)]
    async fn test_matcher_interval_picks_up_silent_agent_change() {
        let agent = Agent::new("linux-1").with_status(AgentStatus::Busy);
        let h = harness(-1, vec![agent.clone()]);
        h.queue.start().await.unwrap();
        h.queue.enqueue(h.recipe("build")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.builds.dispatched().is_empty());

        // No event announces the change; only the periodic pass can see it.
        h.agents.set_status(agent.id, AgentStatus::Idle);
        tokio::time::sleep(Duration::from_secs(61)).await;
        for _ in 0..100 {
            if !h.builds.dispatched().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        h.queue.stop().await;

        assert_eq!(h.builds.dispatched().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_failure_reported() {
        let h = harness(0, vec![Agent::new("linux-1")]);
        h.builds.fail_with("connection refused");
        h.queue.start().await.unwrap();
        h.queue.enqueue(h.recipe("build")).await.unwrap();

        for _ in 0..100 {
            if !h.errors().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        h.queue.stop().await;

        let errors = h.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, RecipeErrorKind::DispatchTransport);
        assert_eq!(errors[0].message, "Unable to dispatch recipe: connection refused");
        assert_eq!(h.assigned().len(), 1);
        assert!(h.dispatched().is_empty());
    }

    #[tokio::test]
    async fn test_failed_dispatch_releases_agent() {
        let agent = Agent::new("linux-1");
        let h = harness(-1, vec![agent.clone()]);
        h.builds.fail_with("connection refused");
        h.queue.start().await.unwrap();
        h.queue.enqueue(h.recipe("first")).await.unwrap();
        for _ in 0..100 {
            if !h.errors().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // No availability event arrives; the failure alone frees the agent.
        h.queue.enqueue(h.recipe("second")).await.unwrap();
        for _ in 0..100 {
            if h.errors().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        h.queue.stop().await;

        assert_eq!(h.errors().len(), 2);
        assert_eq!(h.assigned().len(), 2);
        assert!(h.queue.is_empty().await);
    }
}
