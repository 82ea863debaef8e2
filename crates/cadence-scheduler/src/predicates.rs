//! Gates on queued build requests.
//!
//! Predicates are plain data and are evaluated by [`evaluate`] against the
//! current queue state. They never mutate the queue.

use crate::build_queue::QueueState;
use cadence_core::build::BuildRequestEvent;
use cadence_core::ids::{BuildRequestId, ProjectId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueuedRequestPredicate {
    /// The dependency's request has left the queue and finished building.
    DependencyComplete {
        owner: ProjectId,
        request: BuildRequestId,
    },
    /// This is the first of its project's queued requests able to go.
    HeadOfOwnersCanBuildNow,
    /// The project has room for another active build.
    ProjectNotAlreadyQueued,
}

/// A build request waiting in the queue, with the gates it must pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub request: BuildRequestEvent,
    pub predicates: Vec<QueuedRequestPredicate>,
}

impl QueuedRequest {
    /// Wraps a request with the fixed queue-position predicates.
    pub fn new(request: BuildRequestEvent) -> Self {
        Self {
            request,
            predicates: vec![
                QueuedRequestPredicate::HeadOfOwnersCanBuildNow,
                QueuedRequestPredicate::ProjectNotAlreadyQueued,
            ],
        }
    }

    pub fn with_dependency(mut self, owner: ProjectId, request: BuildRequestId) -> Self {
        self.predicates
            .insert(0, QueuedRequestPredicate::DependencyComplete { owner, request });
        self
    }

    pub fn id(&self) -> BuildRequestId {
        self.request.id
    }

    pub fn project_id(&self) -> ProjectId {
        self.request.project_id
    }

    /// Requests this one waits on.
    pub fn dependencies(&self) -> impl Iterator<Item = BuildRequestId> + '_ {
        self.predicates.iter().filter_map(|p| match p {
            QueuedRequestPredicate::DependencyComplete { request, .. } => Some(*request),
            _ => None,
        })
    }

    pub fn depends_on(&self, request: BuildRequestId) -> bool {
        self.dependencies().any(|r| r == request)
    }

    /// Points dependency predicates at a different request.
    pub(crate) fn redirect_dependency(&mut self, from: BuildRequestId, to: BuildRequestId) {
        for predicate in &mut self.predicates {
            if let QueuedRequestPredicate::DependencyComplete { request, .. } = predicate
                && *request == from
            {
                *request = to;
            }
        }
    }
}

/// Evaluates one predicate for `queued` against the queue state.
pub fn evaluate(
    predicate: &QueuedRequestPredicate,
    queued: &QueuedRequest,
    state: &QueueState,
) -> bool {
    match predicate {
        QueuedRequestPredicate::DependencyComplete { request, .. } => {
            !state.is_queued(*request) && !state.is_active(*request)
        }
        QueuedRequestPredicate::HeadOfOwnersCanBuildNow => state
            .queued_for_project(queued.project_id())
            .find(|candidate| dependencies_complete(candidate, state))
            .is_some_and(|head| head.id() == queued.id()),
        QueuedRequestPredicate::ProjectNotAlreadyQueued => {
            state.active_count(queued.project_id()) < state.max_active_per_project()
        }
    }
}

/// Whether every predicate of `queued` currently holds.
pub fn all_hold(queued: &QueuedRequest, state: &QueueState) -> bool {
    queued
        .predicates
        .iter()
        .all(|p| evaluate(p, queued, state))
}

fn dependencies_complete(queued: &QueuedRequest, state: &QueueState) -> bool {
    queued
        .predicates
        .iter()
        .filter(|p| matches!(p, QueuedRequestPredicate::DependencyComplete { .. }))
        .all(|p| evaluate(p, queued, state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::build::BuildReason;

    fn request(project: ProjectId) -> QueuedRequest {
        QueuedRequest::new(BuildRequestEvent::new(project, "p", BuildReason::Manual))
    }

    #[test]
    fn test_fixed_predicates() {
        let queued = request(ProjectId::new());
        assert_eq!(queued.predicates.len(), 2);
        assert_eq!(queued.dependencies().count(), 0);
    }

    #[test]
    fn test_head_of_owner_is_first_in_arrival_order() {
        let project = ProjectId::new();
        let first = request(project);
        let second = request(project);
        let state = QueueState::with_queued(vec![first.clone(), second.clone()], 1);

        let head = QueuedRequestPredicate::HeadOfOwnersCanBuildNow;
        assert!(evaluate(&head, &first, &state));
        assert!(!evaluate(&head, &second, &state));
    }

    #[test]
    fn test_head_skips_requests_with_pending_dependencies() {
        let upstream_project = ProjectId::new();
        let project = ProjectId::new();
        let upstream = request(upstream_project);
        let waiting = request(project).with_dependency(upstream_project, upstream.id());
        let ready = request(project);
        let state =
            QueueState::with_queued(vec![upstream.clone(), waiting.clone(), ready.clone()], 1);

        let head = QueuedRequestPredicate::HeadOfOwnersCanBuildNow;
        assert!(!evaluate(&head, &waiting, &state));
        assert!(evaluate(&head, &ready, &state));
    }

    #[test]
    fn test_head_is_false_for_unqueued_request() {
        let project = ProjectId::new();
        let queued = request(project);
        let stranger = request(project);
        let state = QueueState::with_queued(vec![queued], 1);
        assert!(!evaluate(
            &QueuedRequestPredicate::HeadOfOwnersCanBuildNow,
            &stranger,
            &state
        ));
    }

    #[test]
    fn test_dependency_complete_once_dependency_leaves_queue() {
        let upstream_project = ProjectId::new();
        let upstream = request(upstream_project);
        let dependent = request(ProjectId::new()).with_dependency(upstream_project, upstream.id());
        let predicate = dependent.predicates[0].clone();

        let state = QueueState::with_queued(vec![upstream.clone(), dependent.clone()], 1);
        assert!(!evaluate(&predicate, &dependent, &state));

        let state = QueueState::with_queued(vec![dependent.clone()], 1);
        assert!(evaluate(&predicate, &dependent, &state));
    }

    #[test]
    fn test_redirect_dependency() {
        let owner = ProjectId::new();
        let old = BuildRequestId::new();
        let new = BuildRequestId::new();
        let mut queued = request(ProjectId::new()).with_dependency(owner, old);
        queued.redirect_dependency(old, new);
        assert!(queued.depends_on(new));
        assert!(!queued.depends_on(old));
    }
}
