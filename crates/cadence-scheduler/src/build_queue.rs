//! Queue of build requests waiting for their gates to open.

use crate::predicates::{QueuedRequest, all_hold};
use cadence_core::build::BuildRequestEvent;
use cadence_core::ids::{BuildRequestId, ProjectId};
use cadence_core::{Error, Result};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// The state predicates are evaluated against.
#[derive(Debug, Default)]
pub struct QueueState {
    queued: Vec<QueuedRequest>,
    active: Vec<BuildRequestEvent>,
    max_active_per_project: usize,
}

impl QueueState {
    fn new(max_active_per_project: usize) -> Self {
        Self {
            queued: Vec::new(),
            active: Vec::new(),
            max_active_per_project: max_active_per_project.max(1),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_queued(queued: Vec<QueuedRequest>, max_active_per_project: usize) -> Self {
        Self {
            queued,
            ..Self::new(max_active_per_project)
        }
    }

    pub fn is_queued(&self, id: BuildRequestId) -> bool {
        self.queued.iter().any(|q| q.id() == id)
    }

    pub fn is_active(&self, id: BuildRequestId) -> bool {
        self.active.iter().any(|r| r.id == id)
    }

    /// A project's queued requests in arrival order.
    pub fn queued_for_project(&self, project: ProjectId) -> impl Iterator<Item = &QueuedRequest> {
        self.queued.iter().filter(move |q| q.project_id() == project)
    }

    pub fn active_count(&self, project: ProjectId) -> usize {
        self.active
            .iter()
            .filter(|r| r.project_id == project)
            .count()
    }

    pub fn max_active_per_project(&self) -> usize {
        self.max_active_per_project
    }
}

/// Result of enqueueing a wave.
#[derive(Debug, Default)]
pub struct EnqueueOutcome {
    pub queued: Vec<BuildRequestEvent>,
    /// New requests folded into an existing one, with the id they joined.
    pub assimilated: Vec<(BuildRequestEvent, BuildRequestId)>,
}

/// Process-wide queue of gated build requests.
///
/// Requests leave the queue in two ways: [`poll`](Self::poll) moves the ones
/// whose predicates hold to the active set, and cancellation or a failed
/// dependency removes them outright.
#[derive(Debug)]
pub struct BuildRequestQueue {
    state: QueueState,
    stopped: bool,
}

impl BuildRequestQueue {
    pub fn new(max_active_per_project: usize) -> Self {
        Self {
            state: QueueState::new(max_active_per_project),
            stopped: false,
        }
    }

    /// Appends a wave in the given order. Predicates are not evaluated here.
    pub fn enqueue(&mut self, wave: Vec<QueuedRequest>) -> Result<EnqueueOutcome> {
        if self.stopped {
            return Err(Error::QueueStopped);
        }

        let mut outcome = EnqueueOutcome::default();
        let mut redirects: HashMap<BuildRequestId, BuildRequestId> = HashMap::new();

        for mut queued in wave {
            for (from, to) in &redirects {
                queued.redirect_dependency(*from, *to);
            }

            let existing = self
                .state
                .queued
                .iter()
                .find(|q| q.request.can_assimilate(&queued.request));

            if let Some(existing) = existing {
                let into = existing.id();
                if queued.request.revision.is_initialised()
                    && let Err(e) = existing.request.revision.adopt(&queued.request.revision)
                {
                    warn!(request_id = %into, error = %e, "Unable to update revision of queued request");
                }
                debug!(
                    request_id = %queued.id(),
                    into = %into,
                    "Assimilated build request"
                );
                redirects.insert(queued.id(), into);
                outcome.assimilated.push((queued.request, into));
                continue;
            }

            outcome.queued.push(queued.request.clone());
            self.state.queued.push(queued);
        }

        Ok(outcome)
    }

    /// Releases every request whose predicates hold, in enqueue order, and
    /// marks them active.
    pub fn poll(&mut self) -> Vec<BuildRequestEvent> {
        if self.stopped {
            return Vec::new();
        }

        let mut released = Vec::new();
        let mut index = 0;
        while index < self.state.queued.len() {
            if all_hold(&self.state.queued[index], &self.state) {
                let queued = self.state.queued.remove(index);
                self.state.active.push(queued.request.clone());
                released.push(queued.request);
            } else {
                index += 1;
            }
        }
        released
    }

    /// Records that an active request finished. When it failed, the queued
    /// requests that can now never run are removed and returned.
    pub fn on_build_completed(&mut self, id: BuildRequestId, success: bool) -> Vec<QueuedRequest> {
        self.state.active.retain(|r| r.id != id);
        if success {
            Vec::new()
        } else {
            self.remove_dependents(id)
        }
    }

    /// Removes every queued request that transitively waits on `id`.
    pub fn remove_dependents(&mut self, id: BuildRequestId) -> Vec<QueuedRequest> {
        let mut blocked = Vec::new();
        let mut failed: HashSet<BuildRequestId> = HashSet::from([id]);
        loop {
            let (hit, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.state.queued)
                .into_iter()
                .partition(|q| q.dependencies().any(|d| failed.contains(&d)));
            self.state.queued = rest;
            if hit.is_empty() {
                break;
            }
            failed.extend(hit.iter().map(|q| q.id()));
            blocked.extend(hit);
        }
        blocked
    }

    /// Removes a queued request. Active requests cannot be cancelled here.
    pub fn cancel(&mut self, id: BuildRequestId) -> Option<QueuedRequest> {
        let index = self.state.queued.iter().position(|q| q.id() == id)?;
        Some(self.state.queued.remove(index))
    }

    pub fn find_queued(&self, id: BuildRequestId) -> Option<&QueuedRequest> {
        self.state.queued.iter().find(|q| q.id() == id)
    }

    pub fn is_active(&self, id: BuildRequestId) -> bool {
        self.state.is_active(id)
    }

    pub fn active(&self) -> &[BuildRequestEvent] {
        &self.state.active
    }

    /// Detached copies of the queued requests per project, in service order.
    pub fn snapshot(&self) -> HashMap<ProjectId, Vec<BuildRequestEvent>> {
        let mut snapshot: HashMap<ProjectId, Vec<BuildRequestEvent>> = HashMap::new();
        for queued in &self.state.queued {
            snapshot
                .entry(queued.project_id())
                .or_default()
                .push(queued.request.snapshot());
        }
        snapshot
    }

    /// Get the current queue length.
    pub fn len(&self) -> usize {
        self.state.queued.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.state.queued.is_empty()
    }

    /// Stops the queue, returning the requests that will never run.
    pub fn stop(&mut self) -> Vec<QueuedRequest> {
        self.stopped = true;
        std::mem::take(&mut self.state.queued)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

impl Default for BuildRequestQueue {
    fn default() -> Self {
        Self::new(1)
    }
}
