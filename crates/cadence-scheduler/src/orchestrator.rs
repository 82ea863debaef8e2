//! The orchestrator event loop.
//!
//! Build requests and completions arrive as commands on one channel and are
//! handled strictly in arrival order by a single task. The task owns the
//! running-build set; the build request queue sits behind a lock only so
//! that handles can snapshot it.

use crate::build_queue::{BuildRequestQueue, EnqueueOutcome};
use crate::config::{DownstreamMode, SchedulerConfig};
use crate::expander::{BuildRequestExpander, ExpansionMode};
use crate::graph::ProjectGraph;
use crate::predicates::QueuedRequest;
use crate::project_manager::ProjectManager;
use crate::recipe_queue::RecipeQueue;
use cadence_core::build::{
    ActivatedBuild, BuildCompletion, BuildOutcome, BuildReason, BuildRequestEvent,
};
use cadence_core::events::{
    BuildCompletedPayload, BuildRequestActivatedPayload, BuildRequestAssimilatedPayload,
    BuildRequestBlockedPayload, BuildRequestCancelledPayload, BuildRequestQueuedPayload,
    BuildRequestRejectedPayload, BuildTerminationRequestedPayload, Event,
};
use cadence_core::ids::{BuildId, BuildRequestId, ProjectId};
use cadence_core::ports::{BuildStarter, EventBus};
use cadence_core::recipe::RecipeDispatchRequest;
use cadence_core::{Error, Result};
use cadence_trace::{CiAttributes, build_span};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

/// Collaborators of the orchestrator.
#[derive(Clone)]
pub struct OrchestratorPorts {
    pub projects: Arc<ProjectManager>,
    pub builds: Arc<dyn BuildStarter>,
    pub recipes: RecipeQueue,
    pub event_bus: Arc<dyn EventBus>,
}

enum Command {
    Submit(BuildRequestEvent),
    Completed(BuildCompletion),
    Cancel {
        id: BuildRequestId,
        reply: oneshot::Sender<bool>,
    },
    SetEnabled(bool),
    Terminate(BuildId),
    Running(oneshot::Sender<Vec<ActivatedBuild>>),
    Stop {
        force: bool,
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

pub struct Orchestrator {
    config: SchedulerConfig,
    expander: BuildRequestExpander,
    queue: Arc<RwLock<BuildRequestQueue>>,
    projects: Arc<ProjectManager>,
    builds: Arc<dyn BuildStarter>,
    recipes: RecipeQueue,
    event_bus: Arc<dyn EventBus>,
    enabled: bool,
    stopping: bool,
    running: HashMap<BuildId, ActivatedBuild>,
    drain_waiters: Vec<oneshot::Sender<()>>,
}

impl Orchestrator {
    pub fn new(config: SchedulerConfig, graph: Arc<ProjectGraph>, ports: OrchestratorPorts) -> Self {
        let queue = BuildRequestQueue::new(config.max_active_builds_per_project);
        Self {
            enabled: config.enabled,
            config,
            expander: BuildRequestExpander::new(graph),
            queue: Arc::new(RwLock::new(queue)),
            projects: ports.projects,
            builds: ports.builds,
            recipes: ports.recipes,
            event_bus: ports.event_bus,
            stopping: false,
            running: HashMap::new(),
            drain_waiters: Vec::new(),
        }
    }

    /// Recovers project states, starts the recipe queue and spawns the
    /// event loop.
    pub async fn start(self) -> Result<(OrchestratorHandle, JoinHandle<()>)> {
        if let Err(e) = self.projects.recover_all().await {
            warn!(error = %e, "Project state recovery failed");
        }
        self.recipes.start().await?;

        let (commands, receiver) = mpsc::channel(self.config.event_channel_capacity.max(1));
        let handle = OrchestratorHandle {
            commands,
            queue: Arc::clone(&self.queue),
            recipes: self.recipes.clone(),
        };
        info!(
            enabled = self.enabled,
            downstream_mode = ?self.config.downstream_mode,
            "Starting orchestrator"
        );
        let task = tokio::spawn(self.run(receiver));
        Ok((handle, task))
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            if self.handle(command).await == Flow::Exit {
                break;
            }
        }
        info!("Orchestrator stopped");
    }

    async fn handle(&mut self, command: Command) -> Flow {
        match command {
            Command::Submit(event) => {
                self.submit(event).await;
                Flow::Continue
            }
            Command::Completed(completion) => self.completed(completion).await,
            Command::Cancel { id, reply } => {
                let _ = reply.send(self.cancel(id).await);
                Flow::Continue
            }
            Command::SetEnabled(enabled) => {
                if enabled != self.enabled {
                    info!(enabled, "Orchestrator admission changed");
                }
                self.enabled = enabled;
                Flow::Continue
            }
            Command::Terminate(build_id) => {
                self.publish(Event::BuildTerminationRequested(
                    BuildTerminationRequestedPayload {
                        build_id: Some(build_id),
                        reason: "Termination requested".to_string(),
                    },
                ))
                .await;
                Flow::Continue
            }
            Command::Running(reply) => {
                let _ = reply.send(self.running.values().cloned().collect());
                Flow::Continue
            }
            Command::Stop { force, reply } => self.stop(force, reply).await,
        }
    }

    async fn submit(&mut self, event: BuildRequestEvent) {
        if !self.enabled {
            debug!(project = %event.project_name, "Orchestrator disabled, dropping build request");
            return;
        }
        if self.stopping {
            self.reject(&event, "Orchestrator is shutting down").await;
            return;
        }

        match self
            .projects
            .accepts_trigger(event.project_id, event.personal)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                info!(
                    project = %event.project_name,
                    personal = event.personal,
                    "Project does not accept triggers in its current state, dropping build request"
                );
                return;
            }
            Err(e) => {
                warn!(project = %event.project_name, error = %e, "Dropping build request");
                return;
            }
        }

        let mode = if event.personal {
            ExpansionMode::Single
        } else if event.rebuild {
            ExpansionMode::Rebuild
        } else if self.config.downstream_mode == DownstreamMode::AtTrigger {
            ExpansionMode::Forward
        } else {
            ExpansionMode::Single
        };
        let wave = self.expander.expand(event, mode);
        info!(size = wave.len(), ?mode, "Build request expanded");

        self.enqueue(wave).await;
        self.poll_and_start().await;
    }

    async fn enqueue(&mut self, wave: Vec<QueuedRequest>) {
        let outcome = self.queue.write().await.enqueue(wave);
        match outcome {
            Ok(outcome) => self.announce(outcome).await,
            Err(e) => warn!(error = %e, "Unable to enqueue build requests"),
        }
    }

    async fn announce(&self, outcome: EnqueueOutcome) {
        for request in outcome.queued {
            self.publish(Event::BuildRequestQueued(BuildRequestQueuedPayload {
                request_id: request.id,
                meta_build_id: request.meta_build_id,
                project_id: request.project_id,
                project_name: request.project_name.clone(),
                reason: request.reason,
                priority: request.priority,
                personal: request.personal,
                queued_at: request.queued_at,
            }))
            .await;
        }
        for (request, into) in outcome.assimilated {
            self.publish(Event::BuildRequestAssimilated(
                BuildRequestAssimilatedPayload {
                    request_id: request.id,
                    into_request_id: into,
                    project_id: request.project_id,
                    revision: request.revision.revision(),
                },
            ))
            .await;
        }
    }

    /// Starts everything the queue releases. Builds that fail to start are
    /// completed with an error, which may release or block more requests.
    async fn poll_and_start(&mut self) {
        loop {
            if self.stopping {
                return;
            }
            let released = self.queue.write().await.poll();
            if released.is_empty() {
                return;
            }
            let mut repoll = false;
            let mut failed = Vec::new();
            for request in released {
                match self.start_build(request).await {
                    Start::Running => {}
                    Start::Dropped => repoll = true,
                    Start::Failed(completion) => failed.push(completion),
                }
            }
            if failed.is_empty() && !repoll {
                return;
            }
            for completion in failed {
                self.record_completion(completion).await;
            }
        }
    }

    async fn start_build(&mut self, request: BuildRequestEvent) -> Start {
        let build_number = match self.projects.build_commenced(request.project_id).await {
            Ok(number) => number,
            Err(e) => {
                error!(project = %request.project_name, error = %e, "Unable to commence build");
                let blocked = self.queue.write().await.on_build_completed(request.id, false);
                self.reject(&request, &e.to_string()).await;
                self.report_blocked(blocked, request.id).await;
                return Start::Dropped;
            }
        };

        let build = ActivatedBuild {
            build_id: BuildId::new(),
            build_number,
            request,
        };
        self.running.insert(build.build_id, build.clone());
        self.publish(Event::BuildRequestActivated(BuildRequestActivatedPayload {
            request_id: build.request.id,
            project_id: build.request.project_id,
            build_id: build.build_id,
            build_number,
            activated_at: Utc::now(),
        }))
        .await;

        let span = build_span(
            &CiAttributes::new()
                .project(
                    build.request.project_id.to_string(),
                    build.request.project_name.clone(),
                )
                .build(build.build_id.to_string(), build_number)
                .request(build.request.id.to_string(), build.request.reason.to_string()),
        );
        let started = self.builds.start(&build).instrument(span).await;
        match started {
            Ok(()) => {
                info!(
                    project = %build.request.project_name,
                    build_id = %build.build_id,
                    build_number,
                    reason = %build.request.reason,
                    "Build started"
                );
                Start::Running
            }
            Err(e) => {
                error!(build_id = %build.build_id, error = %e, "Build failed to start");
                Start::Failed(BuildCompletion::new(&build, BuildOutcome::Error))
            }
        }
    }

    async fn completed(&mut self, completion: BuildCompletion) -> Flow {
        let Some(build) = self.record_completion(completion).await else {
            return Flow::Continue;
        };

        if build.outcome_success && self.expands_on_completion(&build.request) {
            let wave = self.expander.expand_downstream(&build.request);
            if !wave.is_empty() {
                info!(
                    project = %build.request.project_name,
                    size = wave.len(),
                    "Queueing downstream dependents"
                );
                self.enqueue(wave).await;
            }
        }
        self.poll_and_start().await;

        if self.stopping && self.running.is_empty() {
            self.finish_drain().await;
            return Flow::Exit;
        }
        Flow::Continue
    }

    fn expands_on_completion(&self, request: &BuildRequestEvent) -> bool {
        self.config.downstream_mode == DownstreamMode::OnCompletion
            && !self.stopping
            && !request.personal
            && !request.rebuild
            && !matches!(request.reason, BuildReason::Dependency | BuildReason::Rebuild)
    }

    /// Bookkeeping shared by reported completions and failed starts.
    async fn record_completion(&mut self, completion: BuildCompletion) -> Option<FinishedBuild> {
        let Some(build) = self.running.remove(&completion.build_id) else {
            warn!(build_id = %completion.build_id, "Completion for unknown build");
            return None;
        };
        let success = completion.outcome.is_success();
        let project_id = build.request.project_id;
        let still_running = self.is_project_running(project_id);

        if let Err(e) = self
            .projects
            .build_completed(project_id, success, still_running)
            .await
        {
            warn!(project = %build.request.project_name, error = %e, "Unable to record build completion");
        }

        let blocked = self
            .queue
            .write()
            .await
            .on_build_completed(build.request.id, success);

        info!(
            project = %build.request.project_name,
            build_id = %build.build_id,
            outcome = ?completion.outcome,
            "Build completed"
        );
        self.publish(Event::BuildCompleted(BuildCompletedPayload {
            build_id: completion.build_id,
            request_id: build.request.id,
            project_id,
            outcome: completion.outcome,
            completed_at: completion.completed_at,
        }))
        .await;
        self.report_blocked(blocked, build.request.id).await;

        Some(FinishedBuild {
            request: build.request,
            outcome_success: success,
        })
    }

    fn is_project_running(&self, project_id: ProjectId) -> bool {
        self.running
            .values()
            .any(|b| b.request.project_id == project_id)
    }

    async fn cancel(&mut self, id: BuildRequestId) -> bool {
        let (cancelled, blocked) = {
            let mut queue = self.queue.write().await;
            match queue.cancel(id) {
                Some(cancelled) => {
                    let blocked = queue.remove_dependents(id);
                    (cancelled, blocked)
                }
                None => return false,
            }
        };
        info!(request_id = %id, project = %cancelled.request.project_name, "Build request cancelled");
        self.publish(Event::BuildRequestCancelled(BuildRequestCancelledPayload {
            request_id: id,
            project_id: cancelled.project_id(),
        }))
        .await;
        self.report_blocked(blocked, id).await;
        true
    }

    async fn stop(&mut self, force: bool, reply: oneshot::Sender<()>) -> Flow {
        self.stopping = true;
        let drained = self.queue.write().await.stop();
        for queued in &drained {
            self.reject(&queued.request, "Build request queue stopped").await;
        }
        info!(
            force,
            running = self.running.len(),
            discarded = drained.len(),
            "Orchestrator stopping"
        );

        if force {
            self.publish(Event::BuildTerminationRequested(
                BuildTerminationRequestedPayload {
                    build_id: None,
                    reason: "Forced shutdown".to_string(),
                },
            ))
            .await;
            self.recipes.stop().await;
            let _ = reply.send(());
            return Flow::Exit;
        }

        self.drain_waiters.push(reply);
        if self.running.is_empty() {
            self.finish_drain().await;
            return Flow::Exit;
        }
        Flow::Continue
    }

    async fn finish_drain(&mut self) {
        self.recipes.stop().await;
        for waiter in self.drain_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    async fn report_blocked(&self, blocked: Vec<QueuedRequest>, blocked_by: BuildRequestId) {
        for queued in blocked {
            warn!(
                request_id = %queued.id(),
                project = %queued.request.project_name,
                %blocked_by,
                "Build request blocked by failed dependency"
            );
            self.publish(Event::BuildRequestBlocked(BuildRequestBlockedPayload {
                request_id: queued.id(),
                project_id: queued.project_id(),
                project_name: queued.request.project_name.clone(),
                blocked_by,
            }))
            .await;
        }
    }

    async fn reject(&self, request: &BuildRequestEvent, reason: &str) {
        info!(request_id = %request.id, project = %request.project_name, reason, "Build request rejected");
        self.publish(Event::BuildRequestRejected(BuildRequestRejectedPayload {
            request_id: request.id,
            project_id: request.project_id,
            reason: reason.to_string(),
        }))
        .await;
    }

    async fn publish(&self, event: Event) {
        if let Err(e) = self.event_bus.publish(event).await {
            warn!(error = %e, "Failed to publish orchestrator event");
        }
    }
}

/// What became of a released request.
enum Start {
    Running,
    /// Never commenced; the queue slot is already freed.
    Dropped,
    Failed(BuildCompletion),
}

struct FinishedBuild {
    request: BuildRequestEvent,
    outcome_success: bool,
}

/// Cloneable entry point to a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::Sender<Command>,
    queue: Arc<RwLock<BuildRequestQueue>>,
    recipes: RecipeQueue,
}

impl OrchestratorHandle {
    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::Internal("orchestrator is not running".into()))
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.send(command(reply)).await?;
        response
            .await
            .map_err(|_| Error::Internal("orchestrator stopped before replying".into()))
    }

    pub async fn submit_build_request(&self, event: BuildRequestEvent) -> Result<()> {
        self.send(Command::Submit(event)).await
    }

    pub async fn notify_build_completed(&self, completion: BuildCompletion) -> Result<()> {
        self.send(Command::Completed(completion)).await
    }

    /// Removes a queued request and blocks its dependents. Returns false
    /// when the request is not queued.
    pub async fn cancel_queued_build(&self, id: BuildRequestId) -> Result<bool> {
        self.request(|reply| Command::Cancel { id, reply }).await
    }

    pub async fn snapshot_build_queue(&self) -> HashMap<ProjectId, Vec<BuildRequestEvent>> {
        self.queue.read().await.snapshot()
    }

    pub async fn snapshot_dispatch_queue(&self) -> Vec<RecipeDispatchRequest> {
        self.recipes.snapshot().await
    }

    /// Builds currently running. Also orders the caller after every
    /// command sent before it.
    pub async fn running_builds(&self) -> Result<Vec<ActivatedBuild>> {
        self.request(Command::Running).await
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.send(Command::SetEnabled(enabled)).await
    }

    pub async fn terminate_build(&self, build_id: BuildId) -> Result<()> {
        self.send(Command::Terminate(build_id)).await
    }

    /// Graceful stop waits for running builds to finish; forced stop asks
    /// them to terminate and returns at once.
    pub async fn stop(&self, force: bool) -> Result<()> {
        match self.request(|reply| Command::Stop { force, reply }).await {
            Ok(()) => Ok(()),
            Err(_) if self.commands.is_closed() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
