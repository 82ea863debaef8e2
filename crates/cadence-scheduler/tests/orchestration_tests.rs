//! Orchestrator and recipe queue working together over in-memory
//! collaborators.

use async_trait::async_trait;
use cadence_core::agent::{Agent, AgentStatus, ResourceRequirement};
use cadence_core::build::{ActivatedBuild, BuildCompletion, BuildOutcome, BuildReason, BuildRequestEvent};
use cadence_core::events::{AgentPayload, Event, RecipeErrorKind};
use cadence_core::ids::{BuildId, ScmRef};
use cadence_core::ports::{BuildStarter, EventBus, ProjectRepository};
use cadence_core::project::{Project, ProjectState};
use cadence_core::recipe::{RecipeDispatchRequest, RecipeRequest};
use cadence_core::revision::{BuildFile, BuildRevision, Revision, StageDefinition};
use cadence_core::{Error, Result};
use cadence_scheduler::memory::{
    InMemoryAgentDirectory, InMemoryProjectRepository, RecordingBuildService, RecordingEventBus,
    StaticRevisionSource,
};
use cadence_scheduler::{
    DirectoryOrderSorter, Orchestrator, OrchestratorHandle, OrchestratorPorts, ProjectGraph,
    ProjectManager, RecipeQueue, RecipeQueuePorts, SchedulerConfig,
};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Turns every started build into one "default" recipe.
struct RecipeStarter {
    recipes: RecipeQueue,
    scm: ScmRef,
}

#[async_trait]
impl BuildStarter for RecipeStarter {
    async fn start(&self, build: &ActivatedBuild) -> Result<()> {
        let recipe = RecipeRequest::new(
            build.build_id,
            build.request.project_id,
            build.request.project_name.clone(),
            "default",
        )
        .with_build_number(build.build_number)
        .with_priority(build.request.priority)
        .with_reason(build.request.reason);
        self.recipes
            .enqueue(RecipeDispatchRequest::new(
                recipe,
                Arc::clone(&build.request.revision),
                self.scm.clone(),
            ))
            .await
    }
}

struct Ports {
    agents: Arc<InMemoryAgentDirectory>,
    revisions: Arc<StaticRevisionSource>,
    builds: Arc<RecordingBuildService>,
    bus: Arc<RecordingEventBus>,
    repository: Arc<InMemoryProjectRepository>,
    projects: Arc<ProjectManager>,
}

impl Ports {
    fn new(projects: &[Project], agents: Vec<Agent>) -> Self {
        let repository = Arc::new(InMemoryProjectRepository::with_projects(
            projects.iter().cloned(),
        ));
        let bus = Arc::new(RecordingEventBus::new());
        Self {
            agents: Arc::new(InMemoryAgentDirectory::with_agents(agents)),
            revisions: Arc::new(StaticRevisionSource::new()),
            builds: Arc::new(RecordingBuildService::new()),
            projects: Arc::new(ProjectManager::new(repository.clone(), bus.clone())),
            repository,
            bus,
        }
    }

    fn recipe_queue(&self, config: &SchedulerConfig) -> RecipeQueue {
        RecipeQueue::with_sorter(
            config,
            RecipeQueuePorts {
                revisions: self.revisions.clone(),
                agents: self.agents.clone(),
                build_service: self.builds.clone(),
                projects: self.projects.clone(),
                event_bus: self.bus.clone(),
            },
            Arc::new(DirectoryOrderSorter),
        )
    }

    fn errors(&self) -> Vec<(RecipeErrorKind, String)> {
        self.bus
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::RecipeError(p) => Some((p.kind, p.message)),
                _ => None,
            })
            .collect()
    }
}

async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn recipe_for(project: &Project, stage: &str) -> RecipeDispatchRequest {
    RecipeDispatchRequest::new(
        RecipeRequest::new(BuildId::new(), project.id, project.name.clone(), stage),
        BuildRevision::unresolved(),
        ScmRef::new("main"),
    )
}

fn gpu_build_file() -> BuildFile {
    BuildFile {
        stages: vec![StageDefinition {
            name: "train".into(),
            priority: None,
            requirements: vec![ResourceRequirement::new("gpu")],
        }],
    }
}

#[tokio::test]
async fn test_dependency_built_after_upstream_completes() {
    let a = Project::new("a").with_state(ProjectState::Idle);
    let b = Project::new("b").with_state(ProjectState::Idle);
    let graph = ProjectGraph::builder()
        .project(a.id, "a")
        .project(b.id, "b")
        .dependency("b", "a", true)
        .build()
        .unwrap();

    let ports = Ports::new(&[a.clone(), b.clone()], vec![Agent::new("linux-1")]);
    let scm = ScmRef::new("main");
    ports
        .revisions
        .set_latest(&scm, Revision::new("r100"), BuildFile::default());

    let config = SchedulerConfig::default();
    let recipes = ports.recipe_queue(&config);
    let orchestrator = Orchestrator::new(
        config,
        Arc::new(graph),
        OrchestratorPorts {
            projects: ports.projects.clone(),
            builds: Arc::new(RecipeStarter {
                recipes: recipes.clone(),
                scm,
            }),
            recipes,
            event_bus: ports.bus.clone(),
        },
    );
    let (handle, task) = orchestrator.start().await.unwrap();

    handle
        .submit_build_request(BuildRequestEvent::new(a.id, "a", BuildReason::Trigger))
        .await
        .unwrap();

    // Only A is expanded at trigger time.
    let running = handle.running_builds().await.unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].request.project_id, a.id);
    assert!(handle.snapshot_build_queue().await.is_empty());

    let builds = ports.builds.clone();
    eventually(|| {
        let builds = builds.clone();
        async move { builds.dispatched().len() == 1 }
    })
    .await;
    let dispatched = ports.builds.dispatched();
    let first = &dispatched[0];
    assert_eq!(first.recipe.project_name, "a");
    assert_eq!(first.context.properties["build.revision"], "r100");
    assert_eq!(first.context.properties["build.reason"], "trigger");

    // The agent takes nothing else until it reports back.
    ports
        .bus
        .publish(Event::AgentAvailable(AgentPayload {
            agent_id: first.agent.id,
            agent_name: first.agent.name.clone(),
        }))
        .await
        .unwrap();
    handle
        .notify_build_completed(BuildCompletion::new(&running[0], BuildOutcome::Success))
        .await
        .unwrap();

    // B joins with a dependency on A that already holds, and starts.
    let running = handle.running_builds().await.unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].request.project_id, b.id);
    assert_eq!(running[0].request.reason, BuildReason::Dependency);

    eventually(|| {
        let builds = builds.clone();
        async move { builds.dispatched().len() == 2 }
    })
    .await;
    let dispatched = ports.builds.dispatched();
    let second = &dispatched[1];
    assert_eq!(second.recipe.project_name, "b");
    assert_eq!(second.context.properties["build.revision"], "r100");

    handle
        .notify_build_completed(BuildCompletion::new(&running[0], BuildOutcome::Success))
        .await
        .unwrap();
    handle.stop(false).await.unwrap();
    task.await.unwrap();

    let stored_a = ports.repository.get(a.id).await.unwrap().unwrap();
    assert_eq!(stored_a.state, ProjectState::Idle);
    assert_eq!(stored_a.build_count, 1);
    assert_eq!(stored_a.success_count, 1);
}

#[tokio::test]
async fn test_unsatisfiable_rejected_before_enqueue_returns() {
    let project = Project::new("ml").with_state(ProjectState::Idle);
    let ports = Ports::new(&[project.clone()], vec![Agent::new("cpu-1")]);
    ports
        .revisions
        .set_latest(&ScmRef::new("main"), Revision::new("r1"), gpu_build_file());
    let queue = ports.recipe_queue(&SchedulerConfig::default().with_unsatisfiable_timeout_secs(0));

    let result = queue.enqueue(recipe_for(&project, "train")).await;

    assert!(matches!(result, Err(Error::UnsatisfiableRequest(_))));
    assert_eq!(queue.len().await, 0);
    let errors = ports.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, RecipeErrorKind::Unsatisfiable);
}

#[tokio::test]
async fn test_capable_agent_before_deadline_gets_recipe() {
    let project = Project::new("ml").with_state(ProjectState::Idle);
    let ports = Ports::new(&[project.clone()], vec![Agent::new("cpu-1")]);
    ports
        .revisions
        .set_latest(&ScmRef::new("main"), Revision::new("r1"), gpu_build_file());
    let queue = ports.recipe_queue(&SchedulerConfig::default().with_unsatisfiable_timeout_secs(30));
    queue.start().await.unwrap();

    queue.enqueue(recipe_for(&project, "train")).await.unwrap();
    let deadline = queue.snapshot().await[0].timeout_at;
    assert!(deadline.is_some());

    let gpu = Agent::new("gpu-1").with_resource("gpu", "h100");
    ports.agents.upsert(gpu.clone());
    ports
        .bus
        .publish(Event::AgentOnline(AgentPayload {
            agent_id: gpu.id,
            agent_name: gpu.name.clone(),
        }))
        .await
        .unwrap();

    let builds = ports.builds.clone();
    eventually(|| {
        let builds = builds.clone();
        async move { builds.dispatched().len() == 1 }
    })
    .await;
    queue.stop().await;

    assert_eq!(ports.builds.dispatched()[0].agent.id, gpu.id);
    assert!(ports.errors().is_empty());
}

#[tokio::test]
async fn test_deadline_passes_without_capable_agent() {
    let project = Project::new("ml").with_state(ProjectState::Idle);
    let ports = Ports::new(&[project.clone()], vec![Agent::new("cpu-1")]);
    ports
        .revisions
        .set_latest(&ScmRef::new("main"), Revision::new("r1"), gpu_build_file());
    let queue = ports.recipe_queue(&SchedulerConfig::default().with_unsatisfiable_timeout_secs(30));

    queue.enqueue(recipe_for(&project, "train")).await.unwrap();
    queue.process(Utc::now() + chrono::Duration::seconds(31)).await;

    assert_eq!(queue.len().await, 0);
    let errors = ports.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, RecipeErrorKind::Timeout);
}

#[tokio::test]
async fn test_scm_change_rechecks_build_file_requirements() {
    let project = Project::new("ml").with_state(ProjectState::Idle);
    let busy = Agent::new("cpu-1").with_status(AgentStatus::Busy);
    let ports = Ports::new(&[project.clone()], vec![busy]);
    let scm = ScmRef::new("main");
    ports
        .revisions
        .set_latest(&scm, Revision::new("r1"), BuildFile::default());
    let queue = ports.recipe_queue(&SchedulerConfig::default().with_unsatisfiable_timeout_secs(0));

    queue.enqueue(recipe_for(&project, "train")).await.unwrap();
    assert_eq!(queue.len().await, 1);

    // The new revision makes the stage require a GPU nobody has.
    ports
        .revisions
        .set_latest(&scm, Revision::new("r2"), gpu_build_file());
    queue
        .handle_event(&Event::ScmChanged(cadence_core::events::ScmChangedPayload {
            scm,
            revision: Revision::new("r2"),
        }))
        .await;

    assert_eq!(queue.len().await, 0);
    assert_eq!(ports.errors()[0].0, RecipeErrorKind::Unsatisfiable);
}

#[tokio::test]
async fn test_handle_reports_stopped_orchestrator() {
    let project = Project::new("solo").with_state(ProjectState::Idle);
    let ports = Ports::new(&[project.clone()], vec![]);
    let graph = ProjectGraph::builder().project(project.id, "solo").build().unwrap();
    let config = SchedulerConfig::default();
    let recipes = ports.recipe_queue(&config);
    let orchestrator = Orchestrator::new(
        config,
        Arc::new(graph),
        OrchestratorPorts {
            projects: ports.projects.clone(),
            builds: Arc::new(RecipeStarter {
                recipes: recipes.clone(),
                scm: ScmRef::new("main"),
            }),
            recipes,
            event_bus: ports.bus.clone(),
        },
    );
    let (handle, task) = orchestrator.start().await.unwrap();
    handle.stop(false).await.unwrap();
    task.await.unwrap();

    let stopped: OrchestratorHandle = handle.clone();
    assert!(stopped.running_builds().await.is_err());
    assert!(stopped.stop(true).await.is_ok());
}
