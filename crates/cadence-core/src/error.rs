//! Error types for Cadence CI.

use crate::project::{ProjectState, Transition};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Project lifecycle errors
    #[error("Attempt to make illegal state transition {transition} while in state {state}")]
    IllegalTransition {
        state: ProjectState,
        transition: Transition,
    },

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    // Dispatch errors
    #[error("No online agent is capable of executing the build stage: {0}")]
    UnsatisfiableRequest(String),

    #[error("Unable to determine revision to build: {0}")]
    RevisionResolution(String),

    #[error("Unable to dispatch recipe: {0}")]
    DispatchTransport(String),

    #[error("Build revision is fixed and can no longer be updated")]
    RevisionFixed,

    #[error("Invalid build file: {0}")]
    InvalidBuildFile(String),

    // Queue errors
    #[error("Build request queue is stopped")]
    QueueStopped,

    #[error("Build request not found: {0}")]
    RequestNotFound(String),

    // Infrastructure errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Event bus error: {0}")]
    EventBus(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::InvalidBuildFile(err.to_string())
    }
}
