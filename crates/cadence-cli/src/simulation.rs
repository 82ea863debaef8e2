//! Local simulation of the scheduler.
//!
//! The orchestrator and recipe queue run for real; agents, source control
//! and persistence are in-memory. Every dispatched stage finishes at once
//! and frees its agent, and a build completes when all of its stages have.

use crate::config::Workspace;
use anyhow::{Context, bail};
use async_trait::async_trait;
use cadence_core::agent::Agent;
use cadence_core::build::{ActivatedBuild, BuildCompletion, BuildOutcome, BuildReason, BuildRequestEvent};
use cadence_core::events::{AgentPayload, Event, RecipeErrorKind};
use cadence_core::ids::{AgentId, BuildId, ProjectId, ScmRef};
use cadence_core::ports::{AgentBuildService, BuildStarter, EventBus};
use cadence_core::recipe::{BuildContext, RecipeDispatchRequest, RecipeRequest};
use cadence_core::revision::BuildFile;
use cadence_core::{Error, Result};
use cadence_scheduler::memory::{InMemoryAgentDirectory, InMemoryProjectRepository, StaticRevisionSource};
use cadence_scheduler::{
    DirectoryOrderSorter, LocalEventBus, Orchestrator, OrchestratorPorts, ProjectManager,
    RecipeQueue, RecipeQueuePorts,
};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct SimulationOptions {
    pub triggers: Vec<String>,
    pub failing: HashSet<String>,
    pub personal: bool,
    pub rebuild: bool,
    /// Quiet period after which the run is considered finished.
    pub settle: Duration,
}

#[derive(Debug, Default)]
pub struct SimulationReport {
    pub timeline: Vec<String>,
    pub completed: Vec<(String, BuildOutcome)>,
    /// Builds still running when the simulation settled.
    pub unfinished: usize,
    pub pending_recipes: usize,
}

/// A stage that finished on a simulated agent.
#[derive(Debug, Clone)]
struct StageFinished {
    build_id: BuildId,
    stage: String,
    agent_id: AgentId,
    agent_name: String,
}

struct Tracked {
    build: ActivatedBuild,
    remaining: usize,
}

/// Counts outstanding stages per running build.
struct BuildTracker {
    builds: Mutex<HashMap<BuildId, Tracked>>,
    failing: HashSet<String>,
}

impl BuildTracker {
    fn new(failing: HashSet<String>) -> Self {
        Self {
            builds: Mutex::new(HashMap::new()),
            failing,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<BuildId, Tracked>> {
        self.builds.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn track(&self, build: &ActivatedBuild, stages: usize) {
        self.lock().insert(
            build.build_id,
            Tracked {
                build: build.clone(),
                remaining: stages,
            },
        );
    }

    /// Returns the completion once the build's last stage has finished, or
    /// on the first stage of a project marked as failing.
    fn stage_finished(&self, build_id: BuildId) -> Option<BuildCompletion> {
        let mut builds = self.lock();
        let tracked = builds.get_mut(&build_id)?;
        let outcome = if self.failing.contains(&tracked.build.request.project_name) {
            BuildOutcome::Failure
        } else {
            tracked.remaining = tracked.remaining.saturating_sub(1);
            if tracked.remaining > 0 {
                return None;
            }
            BuildOutcome::Success
        };
        let tracked = builds.remove(&build_id)?;
        Some(BuildCompletion::new(&tracked.build, outcome))
    }

    fn recipe_failed(&self, build_id: BuildId, kind: RecipeErrorKind) -> Option<BuildCompletion> {
        let tracked = self.lock().remove(&build_id)?;
        Some(BuildCompletion::new(&tracked.build, kind.build_outcome()))
    }
}

/// Turns each started build into one recipe per stage.
struct StageStarter {
    recipes: RecipeQueue,
    sources: HashMap<ProjectId, (ScmRef, BuildFile)>,
    tracker: Arc<BuildTracker>,
}

#[async_trait]
impl BuildStarter for StageStarter {
    async fn start(&self, build: &ActivatedBuild) -> Result<()> {
        let request = &build.request;
        let (scm, build_file) = self
            .sources
            .get(&request.project_id)
            .ok_or_else(|| Error::ProjectNotFound(request.project_name.clone()))?;

        self.tracker.track(build, build_file.stages.len());
        for stage in &build_file.stages {
            let recipe = RecipeRequest::new(
                build.build_id,
                request.project_id,
                request.project_name.clone(),
                stage.name.clone(),
            )
            .with_build_number(build.build_number)
            .with_priority(stage.priority.unwrap_or(request.priority))
            .with_reason(request.reason);
            let dispatch =
                RecipeDispatchRequest::new(recipe, Arc::clone(&request.revision), scm.clone());
            // A rejected stage is reported as a recipe error, which
            // completes the build with the error's outcome.
            if let Err(e) = self.recipes.enqueue(dispatch).await {
                warn!(build_id = %build.build_id, stage = %stage.name, error = %e, "Stage rejected");
                break;
            }
        }
        Ok(())
    }
}

/// Agents that finish every stage as soon as it arrives.
struct SimulatedAgents {
    finished: mpsc::UnboundedSender<StageFinished>,
}

#[async_trait]
impl AgentBuildService for SimulatedAgents {
    async fn build(&self, agent: &Agent, recipe: &RecipeRequest, context: &BuildContext) -> Result<()> {
        debug!(
            agent = %agent.name,
            project = %context.project_name,
            stage = %context.stage,
            clean = context.clean_build,
            "Simulated stage run"
        );
        self.finished
            .send(StageFinished {
                build_id: recipe.build_id,
                stage: recipe.stage.clone(),
                agent_id: agent.id,
                agent_name: agent.name.clone(),
            })
            .map_err(|_| Error::DispatchTransport(format!("agent {} is gone", agent.name)))
    }
}

/// Runs the triggers to quiescence and reports what happened.
pub async fn run(workspace: &Workspace, options: &SimulationOptions) -> anyhow::Result<SimulationReport> {
    let requests = trigger_requests(workspace, options)?;
    let config = workspace.scheduler.clone();
    let bus = Arc::new(LocalEventBus::default());
    let mut events = bus.subscribe(">").await?;

    let revisions = Arc::new(StaticRevisionSource::new());
    for setup in &workspace.projects {
        revisions.set_latest(&setup.scm, setup.revision.clone(), setup.build_file.clone());
    }
    let repository = Arc::new(InMemoryProjectRepository::with_projects(
        workspace.projects.iter().map(|s| s.project.clone()),
    ));
    let projects = Arc::new(ProjectManager::new(repository, bus.clone()));
    let (finished_tx, mut finished_rx) = mpsc::unbounded_channel();

    let recipes = RecipeQueue::with_sorter(
        &config,
        RecipeQueuePorts {
            revisions,
            agents: Arc::new(InMemoryAgentDirectory::with_agents(workspace.agents.clone())),
            build_service: Arc::new(SimulatedAgents {
                finished: finished_tx,
            }),
            projects: projects.clone(),
            event_bus: bus.clone(),
        },
        Arc::new(DirectoryOrderSorter),
    );

    let tracker = Arc::new(BuildTracker::new(options.failing.clone()));
    let starter = StageStarter {
        recipes: recipes.clone(),
        sources: workspace
            .projects
            .iter()
            .map(|s| (s.project.id, (s.scm.clone(), s.build_file.clone())))
            .collect(),
        tracker: tracker.clone(),
    };
    let orchestrator = Orchestrator::new(
        config,
        workspace.graph.clone(),
        OrchestratorPorts {
            projects,
            builds: Arc::new(starter),
            recipes,
            event_bus: bus.clone(),
        },
    );
    let (handle, task) = orchestrator.start().await?;

    let names: HashMap<ProjectId, String> = workspace
        .projects
        .iter()
        .map(|s| (s.project.id, s.project.name.clone()))
        .collect();

    for request in requests {
        let name = request.project_name.clone();
        handle
            .submit_build_request(request)
            .await
            .with_context(|| format!("Unable to submit build request for {name}"))?;
    }

    let mut report = SimulationReport::default();
    loop {
        tokio::select! {
            finished = finished_rx.recv() => {
                let Some(finished) = finished else { break };
                debug!(build_id = %finished.build_id, stage = %finished.stage, "Stage finished");
                bus.publish(Event::AgentAvailable(AgentPayload {
                    agent_id: finished.agent_id,
                    agent_name: finished.agent_name,
                }))
                .await?;
                if let Some(completion) = tracker.stage_finished(finished.build_id) {
                    handle.notify_build_completed(completion).await?;
                }
            }
            event = events.next() => {
                match event {
                    Some(Ok(event)) => {
                        if let Event::RecipeError(p) = &event {
                            if let Some(completion) = tracker.recipe_failed(p.build_id, p.kind) {
                                handle.notify_build_completed(completion).await?;
                            }
                        }
                        report.record(&event, &names);
                    }
                    Some(Err(e)) => warn!(error = %e, "Event stream error"),
                    None => break,
                }
            }
            _ = tokio::time::sleep(options.settle) => break,
        }
    }

    report.unfinished = handle.running_builds().await?.len();
    report.pending_recipes = handle.snapshot_dispatch_queue().await.len();
    info!(
        unfinished = report.unfinished,
        pending_recipes = report.pending_recipes,
        "Simulation settled"
    );
    handle.stop(report.unfinished > 0).await?;
    task.await.context("Orchestrator task failed")?;

    while let Ok(Some(Ok(event))) = tokio::time::timeout(Duration::from_millis(50), events.next()).await {
        report.record(&event, &names);
    }
    Ok(report)
}

fn trigger_requests(
    workspace: &Workspace,
    options: &SimulationOptions,
) -> anyhow::Result<Vec<BuildRequestEvent>> {
    let reason = if options.rebuild {
        BuildReason::Rebuild
    } else {
        BuildReason::Manual
    };
    options
        .triggers
        .iter()
        .map(|name| {
            let Some(node) = workspace.graph.project_by_name(name) else {
                bail!("Unknown project: {name}");
            };
            Ok(BuildRequestEvent::new(node.id, &node.name, reason)
                .with_priority(node.priority)
                .with_personal(options.personal)
                .with_rebuild(options.rebuild))
        })
        .collect()
}

impl SimulationReport {
    fn record(&mut self, event: &Event, names: &HashMap<ProjectId, String>) {
        if let Event::BuildCompleted(p) = event {
            self.completed.push((project_name(names, p.project_id), p.outcome));
        }
        if let Some(line) = describe(event, names) {
            self.timeline.push(line);
        }
    }
}

fn project_name(names: &HashMap<ProjectId, String>, id: ProjectId) -> String {
    names.get(&id).cloned().unwrap_or_else(|| id.to_string())
}

/// One timeline line per event; status chatter and agent events are skipped.
fn describe(event: &Event, names: &HashMap<ProjectId, String>) -> Option<String> {
    let name = |id| project_name(names, id);
    let line = match event {
        Event::BuildRequestQueued(p) => format!("{} queued ({:?})", p.project_name, p.reason),
        Event::BuildRequestActivated(p) => {
            format!("{} build #{} started", name(p.project_id), p.build_number)
        }
        Event::BuildRequestAssimilated(p) => {
            format!("{} request merged into {}", name(p.project_id), p.into_request_id)
        }
        Event::BuildRequestCancelled(p) => format!("{} request cancelled", name(p.project_id)),
        Event::BuildRequestRejected(p) => {
            format!("{} request rejected: {}", name(p.project_id), p.reason)
        }
        Event::BuildRequestBlocked(p) => {
            format!("{} blocked by failed request {}", p.project_name, p.blocked_by)
        }
        Event::BuildCompleted(p) => format!("{} build finished: {:?}", name(p.project_id), p.outcome),
        Event::BuildTerminationRequested(p) => match p.build_id {
            Some(id) => format!("termination requested for {id}: {}", p.reason),
            None => format!("termination requested for all builds: {}", p.reason),
        },
        Event::ProjectStateChanged(p) => {
            format!("{} {} -> {}", name(p.project_id), p.from, p.to)
        }
        Event::RecipeDispatched(p) => {
            let revision = p
                .revision
                .as_ref()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "?".to_string());
            format!(
                "{}/{} dispatched to {} at {}",
                name(p.project_id),
                p.stage,
                p.agent_name,
                revision
            )
        }
        Event::RecipeError(p) => format!("{} recipe error ({:?}): {}", name(p.project_id), p.kind, p.message),
        Event::RecipeStatus(_)
        | Event::AgentOnline(_)
        | Event::AgentOffline(_)
        | Event::AgentAvailable(_)
        | Event::AgentResourcesDiscovered(_)
        | Event::ScmChanged(_) => return None,
    };
    Some(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkspaceFile;
    use cadence_core::events::RecipeErrorPayload;
    use cadence_core::ids::RecipeId;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    const CHAIN: &str = r#"
projects:
  - name: lib
    stages:
      - name: compile
      - name: test
  - name: app
    dependencies:
      - project: lib
        propagate_revision: true
agents:
  - name: linux-1
"#;

    fn activated(name: &str) -> ActivatedBuild {
        ActivatedBuild {
            build_id: BuildId::new(),
            build_number: 1,
            request: BuildRequestEvent::new(ProjectId::new(), name, BuildReason::Manual),
        }
    }

    fn options(triggers: &[&str]) -> SimulationOptions {
        SimulationOptions {
            triggers: triggers.iter().map(|t| t.to_string()).collect(),
            settle: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[test]
    fn test_tracker_waits_for_every_stage() {
        let tracker = BuildTracker::new(HashSet::new());
        let build = activated("lib");
        tracker.track(&build, 2);

        assert!(tracker.stage_finished(build.build_id).is_none());
        let completion = tracker.stage_finished(build.build_id).unwrap();
        assert_eq!(completion.outcome, BuildOutcome::Success);
        assert!(tracker.stage_finished(build.build_id).is_none());
    }

    #[test]
    fn test_tracker_fails_marked_projects() {
        let tracker = BuildTracker::new(HashSet::from(["lib".to_string()]));
        let build = activated("lib");
        tracker.track(&build, 3);

        let completion = tracker.stage_finished(build.build_id).unwrap();
        assert_eq!(completion.outcome, BuildOutcome::Failure);
    }

    #[test]
    fn test_tracker_recipe_error_outcome() {
        let tracker = BuildTracker::new(HashSet::new());
        let build = activated("lib");
        tracker.track(&build, 1);

        let completion = tracker
            .recipe_failed(build.build_id, RecipeErrorKind::RevisionResolution)
            .unwrap();
        assert_eq!(completion.outcome, BuildOutcome::Error);
        assert!(tracker.recipe_failed(build.build_id, RecipeErrorKind::Timeout).is_none());
    }

    #[test]
    fn test_describe_skips_status() {
        let names = HashMap::new();
        let error = Event::RecipeError(RecipeErrorPayload {
            recipe_id: RecipeId::new(),
            build_id: BuildId::new(),
            project_id: ProjectId::new(),
            kind: RecipeErrorKind::Unsatisfiable,
            message: "no gpu".to_string(),
            timestamp: Utc::now(),
        });
        assert!(describe(&error, &names).unwrap().contains("no gpu"));
    }

    #[tokio::test]
    async fn test_simulated_chain_runs_downstream() {
        let workspace = WorkspaceFile::from_yaml(CHAIN).unwrap().resolve().unwrap();

        let report = run(&workspace, &options(&["lib"])).await.unwrap();

        assert_eq!(
            report.completed,
            vec![
                ("lib".to_string(), BuildOutcome::Success),
                ("app".to_string(), BuildOutcome::Success),
            ]
        );
        assert_eq!(report.unfinished, 0);
        assert!(report.timeline.iter().any(|l| l.contains("lib/compile dispatched to linux-1")));
    }

    #[tokio::test]
    async fn test_simulated_failure_stops_downstream() {
        let workspace = WorkspaceFile::from_yaml(CHAIN).unwrap().resolve().unwrap();
        let mut options = options(&["lib"]);
        options.failing.insert("lib".to_string());

        let report = run(&workspace, &options).await.unwrap();

        assert_eq!(report.completed, vec![("lib".to_string(), BuildOutcome::Failure)]);
    }

    #[tokio::test]
    async fn test_unsatisfiable_stage_fails_build() {
        let workspace = WorkspaceFile::from_yaml(
            r#"
projects:
  - name: ml
    stages:
      - name: train
        requirements:
          - resource: gpu
agents:
  - name: cpu-only
"#,
        )
        .unwrap()
        .resolve()
        .unwrap();

        let report = run(&workspace, &options(&["ml"])).await.unwrap();

        assert_eq!(report.completed, vec![("ml".to_string(), BuildOutcome::Failure)]);
        assert!(report.timeline.iter().any(|l| l.contains("recipe error (Unsatisfiable)")));
    }

    #[tokio::test]
    async fn test_unknown_trigger() {
        let workspace = WorkspaceFile::from_yaml(CHAIN).unwrap().resolve().unwrap();

        let result = run(&workspace, &options(&["nope"])).await;

        assert!(result.unwrap_err().to_string().contains("Unknown project: nope"));
    }
}
