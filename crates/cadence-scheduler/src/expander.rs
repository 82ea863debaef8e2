//! Expansion of one build trigger into a wave of gated requests.

use crate::graph::{ProjectGraph, ProjectNode};
use crate::predicates::QueuedRequest;
use cadence_core::build::{BuildReason, BuildRequestEvent};
use cadence_core::ids::{BuildRequestId, MetaBuildId, ProjectId};
use cadence_core::revision::BuildRevision;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpansionMode {
    /// Only the requested project.
    Single,
    /// The project and everything downstream of it.
    Forward,
    /// Everything upstream of the project, then the project.
    Rebuild,
}

/// Turns a trigger into an ordered, gated wave of build requests.
pub struct BuildRequestExpander {
    graph: Arc<ProjectGraph>,
}

impl BuildRequestExpander {
    pub fn new(graph: Arc<ProjectGraph>) -> Self {
        Self { graph }
    }

    pub fn graph(&self) -> &ProjectGraph {
        &self.graph
    }

    /// Expands `event` into a wave. Every request in the wave shares a new
    /// meta-build id, the original event keeps its id, and dependencies
    /// always precede their dependents.
    pub fn expand(&self, mut event: BuildRequestEvent, mode: ExpansionMode) -> Vec<QueuedRequest> {
        event.meta_build_id = Some(MetaBuildId::new());

        if self.graph.project(event.project_id).is_none() {
            return vec![QueuedRequest::new(event)];
        }

        let members = match mode {
            ExpansionMode::Single => HashSet::from([event.project_id]),
            ExpansionMode::Forward => self.graph.downstream_closure(event.project_id),
            ExpansionMode::Rebuild => self.graph.upstream_closure(event.project_id),
        };
        let derived_reason = match mode {
            ExpansionMode::Rebuild => BuildReason::Rebuild,
            _ => BuildReason::Dependency,
        };

        let wave = self.build_wave(Anchor::Root(event), &members, derived_reason);
        debug!(size = wave.len(), ?mode, "Expanded build request");
        wave
    }

    /// Requests for everything downstream of a successfully completed
    /// build. The completed request is already satisfied and is not part of
    /// the wave.
    pub fn expand_downstream(&self, completed: &BuildRequestEvent) -> Vec<QueuedRequest> {
        let mut members = self.graph.downstream_closure(completed.project_id);
        members.remove(&completed.project_id);
        if members.is_empty() {
            return Vec::new();
        }
        self.build_wave(
            Anchor::Completed(completed),
            &members,
            BuildReason::Dependency,
        )
    }

    fn build_wave(
        &self,
        anchor: Anchor<'_>,
        members: &HashSet<ProjectId>,
        derived_reason: BuildReason,
    ) -> Vec<QueuedRequest> {
        let anchor_event = anchor.event();
        let meta_build_id = anchor_event.meta_build_id.unwrap_or_default();

        let order = self.graph.topological_order(members);
        let revisions = self.assign_revisions(&order, anchor_event);

        // Request ids by project, including a completed anchor.
        let mut request_ids: HashMap<ProjectId, BuildRequestId> = HashMap::new();
        if let Anchor::Completed(completed) = anchor {
            request_ids.insert(completed.project_id, completed.id);
        }

        let mut root = match anchor {
            Anchor::Root(event) => Some(event),
            Anchor::Completed(_) => None,
        };

        let mut wave = Vec::with_capacity(order.len());
        for node in order {
            let mut event = match root.take_if(|e| e.project_id == node.id) {
                Some(event) => event,
                None => derived_request(node, meta_build_id, derived_reason),
            };
            if let Some(revision) = revisions.get(&node.id) {
                event.revision = Arc::clone(revision);
            }
            request_ids.insert(node.id, event.id);

            let mut queued = QueuedRequest::new(event);
            for (dependency, _) in self.graph.dependencies(node.id).into_iter().rev() {
                if let Some(&request) = request_ids.get(&dependency.id) {
                    queued = queued.with_dependency(dependency.id, request);
                }
            }
            wave.push(queued);
        }

        wave
    }

    /// Groups projects joined by revision-propagating edges and gives each
    /// group a single shared revision. A group containing the anchor uses
    /// the anchor's revision.
    fn assign_revisions(
        &self,
        order: &[&ProjectNode],
        anchor: &BuildRequestEvent,
    ) -> HashMap<ProjectId, Arc<BuildRevision>> {
        let mut groups = RevisionGroups::default();
        groups.add(anchor.project_id);
        for node in order {
            groups.add(node.id);
        }
        for node in order {
            for (dependency, edge) in self.graph.dependencies(node.id) {
                if edge.propagate_revision && groups.contains(dependency.id) {
                    groups.union(node.id, dependency.id);
                }
            }
        }

        let anchor_group = groups.find(anchor.project_id);
        let mut shared: HashMap<ProjectId, Arc<BuildRevision>> = HashMap::new();
        shared.insert(anchor_group, Arc::clone(&anchor.revision));

        let mut revisions = HashMap::new();
        for node in order {
            if node.id == anchor.project_id {
                continue;
            }
            let group = groups.find(node.id);
            let revision = shared
                .entry(group)
                .or_insert_with(BuildRevision::unresolved);
            revisions.insert(node.id, Arc::clone(revision));
        }
        revisions
    }
}

/// Where a wave starts: a fresh trigger that is part of the wave, or a
/// completed build whose dependents make up the wave.
enum Anchor<'a> {
    Root(BuildRequestEvent),
    Completed(&'a BuildRequestEvent),
}

impl Anchor<'_> {
    fn event(&self) -> &BuildRequestEvent {
        match self {
            Anchor::Root(event) => event,
            Anchor::Completed(event) => event,
        }
    }
}

fn derived_request(
    node: &ProjectNode,
    meta_build_id: MetaBuildId,
    reason: BuildReason,
) -> BuildRequestEvent {
    let mut event =
        BuildRequestEvent::new(node.id, node.name.clone(), reason).with_priority(node.priority);
    event.meta_build_id = Some(meta_build_id);
    event
}

/// Union-find over project ids.
#[derive(Default)]
struct RevisionGroups {
    parent: HashMap<ProjectId, ProjectId>,
}

impl RevisionGroups {
    fn add(&mut self, id: ProjectId) {
        self.parent.entry(id).or_insert(id);
    }

    fn contains(&self, id: ProjectId) -> bool {
        self.parent.contains_key(&id)
    }

    fn find(&mut self, id: ProjectId) -> ProjectId {
        let mut root = id;
        while let Some(&parent) = self.parent.get(&root) {
            if parent == root {
                break;
            }
            root = parent;
        }
        // Path compression
        let mut current = id;
        while current != root {
            let next = self.parent.insert(current, root).unwrap_or(root);
            current = next;
        }
        root
    }

    fn union(&mut self, a: ProjectId, b: ProjectId) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent.insert(ra, rb);
        }
    }
}
