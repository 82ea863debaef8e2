//! Source-control revisions and the build files resolved at them.

use crate::agent::ResourceRequirement;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Opaque, comparable identifier of a source-control state.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stage declarations of a project at one revision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildFile {
    #[serde(default)]
    pub stages: Vec<StageDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default)]
    pub requirements: Vec<ResourceRequirement>,
}

impl BuildFile {
    pub fn from_yaml(source: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(source)?)
    }

    pub fn stage(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Requirements declared for `stage`; empty for unknown stages.
    pub fn requirements_for(&self, stage: &str) -> &[ResourceRequirement] {
        self.stage(stage)
            .map(|s| s.requirements.as_slice())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RevisionState {
    revision: Option<Revision>,
    build_file: Option<Arc<BuildFile>>,
    fixed: bool,
    timestamp: Option<DateTime<Utc>>,
}

/// The revision a build will run against.
///
/// Shared by reference (`Arc<BuildRevision>`) between every build request
/// that propagates it, so an update made while queued is seen by all of
/// them. Once fixed, the revision can no longer change.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BuildRevision {
    state: RwLock<RevisionState>,
}

impl BuildRevision {
    /// A revision to be resolved when the build is first considered.
    pub fn unresolved() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn resolved(revision: Revision, build_file: BuildFile) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(RevisionState {
                revision: Some(revision),
                build_file: Some(Arc::new(build_file)),
                fixed: false,
                timestamp: Some(Utc::now()),
            }),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, RevisionState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RevisionState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_initialised(&self) -> bool {
        self.read().revision.is_some()
    }

    pub fn is_fixed(&self) -> bool {
        self.read().fixed
    }

    pub fn revision(&self) -> Option<Revision> {
        self.read().revision.clone()
    }

    pub fn build_file(&self) -> Option<Arc<BuildFile>> {
        self.read().build_file.clone()
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.read().timestamp
    }

    /// Points the revision at a new source state.
    pub fn update(&self, revision: Revision, build_file: BuildFile) -> Result<()> {
        let mut state = self.write();
        if state.fixed {
            return Err(Error::RevisionFixed);
        }
        state.revision = Some(revision);
        state.build_file = Some(Arc::new(build_file));
        state.timestamp = Some(Utc::now());
        Ok(())
    }

    /// Takes over the state of another revision.
    pub fn adopt(&self, other: &BuildRevision) -> Result<()> {
        let source = other.read().clone();
        let mut state = self.write();
        if state.fixed {
            return Err(Error::RevisionFixed);
        }
        state.revision = source.revision;
        state.build_file = source.build_file;
        state.timestamp = source.timestamp;
        Ok(())
    }

    /// Pins the revision; done when the first recipe is dispatched.
    pub fn fix(&self) {
        self.write().fixed = true;
    }

    /// A detached copy of the current state.
    pub fn snapshot(&self) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(self.read().clone()),
        })
    }
}
