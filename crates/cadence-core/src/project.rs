//! Project lifecycle state machine.
//!
//! Every project owns a [`ProjectState`]. States change only through a
//! [`Transition`] found in the current state's table; anything else is an
//! [`Error::IllegalTransition`]. States named `*_on_idle` record an action
//! deferred until the running build finishes.

use crate::ids::{AgentId, ProjectId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectState {
    Initial,
    Initialising,
    InitialisationFailed,
    InitialiseOnIdle,
    Idle,
    Building,
    Paused,
    PauseOnIdle,
    Cleaning,
    CleanupOnIdle,
    Deleting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Startup,
    Initialise,
    InitialiseSuccess,
    InitialiseFailure,
    Pause,
    Resume,
    Building,
    Idle,
    Cleanup,
    Cleaned,
    Delete,
}

/// Which triggers a state admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerAcceptance {
    Always,
    PersonalOnly,
    Never,
}

/// Static description of one state: its predicates and transition table.
#[derive(Debug, Clone)]
pub struct StateInfo {
    pub initialised: bool,
    pub building: bool,
    pub accepts: TriggerAcceptance,
    pub transitions: HashMap<Transition, ProjectState>,
}

impl StateInfo {
    fn new(
        initialised: bool,
        building: bool,
        accepts: TriggerAcceptance,
        transitions: &[(Transition, ProjectState)],
    ) -> Self {
        Self {
            initialised,
            building,
            accepts,
            transitions: transitions.iter().copied().collect(),
        }
    }
}

static STATE_TABLE: LazyLock<HashMap<ProjectState, StateInfo>> = LazyLock::new(|| {
    use ProjectState as S;
    use Transition as T;
    use TriggerAcceptance as A;

    HashMap::from([
        (
            S::Initial,
            StateInfo::new(
                false,
                false,
                A::Never,
                &[
                    (T::Startup, S::Initial),
                    (T::Initialise, S::Initialising),
                    (T::Delete, S::Deleting),
                ],
            ),
        ),
        (
            S::Initialising,
            StateInfo::new(
                false,
                false,
                A::Never,
                &[
                    (T::Startup, S::Initial),
                    (T::InitialiseFailure, S::InitialisationFailed),
                    (T::InitialiseSuccess, S::Idle),
                ],
            ),
        ),
        (
            S::InitialisationFailed,
            StateInfo::new(
                false,
                false,
                A::Never,
                &[
                    (T::Startup, S::InitialisationFailed),
                    (T::Initialise, S::Initialising),
                    (T::Delete, S::Deleting),
                ],
            ),
        ),
        (
            S::InitialiseOnIdle,
            StateInfo::new(
                true,
                true,
                A::Never,
                &[
                    (T::Startup, S::Initial),
                    (T::Idle, S::Initialising),
                    (T::Cleanup, S::CleanupOnIdle),
                ],
            ),
        ),
        (
            S::Idle,
            StateInfo::new(
                true,
                false,
                A::Always,
                &[
                    (T::Startup, S::Idle),
                    (T::Building, S::Building),
                    (T::Initialise, S::Initialising),
                    (T::Pause, S::Paused),
                    (T::Cleanup, S::Cleaning),
                    (T::Delete, S::Deleting),
                ],
            ),
        ),
        (
            S::Building,
            StateInfo::new(
                true,
                true,
                A::Always,
                &[
                    (T::Startup, S::Idle),
                    (T::Idle, S::Idle),
                    (T::Initialise, S::InitialiseOnIdle),
                    (T::Pause, S::PauseOnIdle),
                    (T::Cleanup, S::CleanupOnIdle),
                ],
            ),
        ),
        (
            S::Paused,
            StateInfo::new(
                true,
                false,
                A::PersonalOnly,
                &[
                    (T::Startup, S::Paused),
                    (T::Initialise, S::Initialising),
                    (T::Resume, S::Idle),
                    (T::Cleanup, S::Cleaning),
                    (T::Delete, S::Deleting),
                ],
            ),
        ),
        (
            S::PauseOnIdle,
            StateInfo::new(
                true,
                true,
                A::PersonalOnly,
                &[
                    (T::Startup, S::Paused),
                    (T::Initialise, S::InitialiseOnIdle),
                    (T::Idle, S::Paused),
                    (T::Resume, S::Building),
                    (T::Cleanup, S::CleanupOnIdle),
                ],
            ),
        ),
        (
            S::Cleaning,
            StateInfo::new(
                false,
                false,
                A::Never,
                &[(T::Startup, S::Initial), (T::Cleaned, S::Initial)],
            ),
        ),
        (
            S::CleanupOnIdle,
            StateInfo::new(
                true,
                true,
                A::Never,
                &[(T::Startup, S::Idle), (T::Idle, S::Cleaning)],
            ),
        ),
        (
            S::Deleting,
            StateInfo::new(true, false, A::Never, &[(T::Startup, S::Deleting)]),
        ),
    ])
});

impl ProjectState {
    pub const ALL: [ProjectState; 11] = [
        ProjectState::Initial,
        ProjectState::Initialising,
        ProjectState::InitialisationFailed,
        ProjectState::InitialiseOnIdle,
        ProjectState::Idle,
        ProjectState::Building,
        ProjectState::Paused,
        ProjectState::PauseOnIdle,
        ProjectState::Cleaning,
        ProjectState::CleanupOnIdle,
        ProjectState::Deleting,
    ];

    pub fn info(&self) -> &'static StateInfo {
        // Every variant has a table entry; see `test_table_is_complete`.
        &STATE_TABLE[self]
    }

    pub fn is_initialised(&self) -> bool {
        self.info().initialised
    }

    pub fn is_building(&self) -> bool {
        self.info().building
    }

    /// The single authority on whether a trigger may be admitted.
    pub fn accept_trigger(&self, personal: bool) -> bool {
        match self.info().accepts {
            TriggerAcceptance::Always => true,
            TriggerAcceptance::PersonalOnly => personal,
            TriggerAcceptance::Never => false,
        }
    }

    pub fn is_transition_valid(&self, transition: Transition) -> bool {
        self.info().transitions.contains_key(&transition)
    }

    pub fn valid_transitions(&self) -> Vec<Transition> {
        Transition::ALL
            .into_iter()
            .filter(|t| self.is_transition_valid(*t))
            .collect()
    }

    /// Applies `transition`, returning the resulting state.
    pub fn transition(self, transition: Transition) -> Result<ProjectState> {
        self.info()
            .transitions
            .get(&transition)
            .copied()
            .ok_or(Error::IllegalTransition {
                state: self,
                transition,
            })
    }
}

impl fmt::Display for ProjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProjectState::Initial => "initial",
            ProjectState::Initialising => "initialising",
            ProjectState::InitialisationFailed => "initialisation failed",
            ProjectState::InitialiseOnIdle => "initialise on idle",
            ProjectState::Idle => "idle",
            ProjectState::Building => "building",
            ProjectState::Paused => "paused",
            ProjectState::PauseOnIdle => "pause on idle",
            ProjectState::Cleaning => "cleaning",
            ProjectState::CleanupOnIdle => "cleanup on idle",
            ProjectState::Deleting => "deleting",
        };
        write!(f, "{s}")
    }
}

impl Transition {
    pub const ALL: [Transition; 11] = [
        Transition::Startup,
        Transition::Initialise,
        Transition::InitialiseSuccess,
        Transition::InitialiseFailure,
        Transition::Pause,
        Transition::Resume,
        Transition::Building,
        Transition::Idle,
        Transition::Cleanup,
        Transition::Cleaned,
        Transition::Delete,
    ];
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Transition::Startup => "STARTUP",
            Transition::Initialise => "INITIALISE",
            Transition::InitialiseSuccess => "INITIALISE_SUCCESS",
            Transition::InitialiseFailure => "INITIALISE_FAILURE",
            Transition::Pause => "PAUSE",
            Transition::Resume => "RESUME",
            Transition::Building => "BUILDING",
            Transition::Idle => "IDLE",
            Transition::Cleanup => "CLEANUP",
            Transition::Cleaned => "CLEANED",
            Transition::Delete => "DELETE",
        };
        write!(f, "{s}")
    }
}

/// A project and its build bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub state: ProjectState,
    pub next_build_number: u64,
    pub build_count: u64,
    pub success_count: u64,
    pub last_poll_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub force_clean_agents: BTreeSet<AgentId>,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ProjectId::new(),
            name: name.into(),
            state: ProjectState::Initial,
            next_build_number: 1,
            build_count: 0,
            success_count: 0,
            last_poll_time: None,
            force_clean_agents: BTreeSet::new(),
        }
    }

    pub fn with_state(mut self, state: ProjectState) -> Self {
        self.state = state;
        self
    }

    pub fn is_transition_valid(&self, transition: Transition) -> bool {
        self.state.is_transition_valid(transition)
    }

    /// Applies a transition in place. On error the state is unchanged.
    pub fn state_transition(&mut self, transition: Transition) -> Result<ProjectState> {
        self.state = self.state.transition(transition)?;
        Ok(self.state)
    }

    /// Hands out the next build number.
    pub fn allocate_build_number(&mut self) -> u64 {
        let number = self.next_build_number;
        self.next_build_number += 1;
        number
    }

    pub fn build_completed(&mut self, success: bool) {
        self.build_count += 1;
        if success {
            self.success_count += 1;
        }
    }

    /// Returns false if the agent was already flagged.
    pub fn set_force_clean_for_agent(&mut self, agent: AgentId) -> bool {
        self.force_clean_agents.insert(agent)
    }

    pub fn clear_force_clean_for_agent(&mut self, agent: AgentId) -> bool {
        self.force_clean_agents.remove(&agent)
    }

    pub fn is_force_clean_for_agent(&self, agent: AgentId) -> bool {
        self.force_clean_agents.contains(&agent)
    }
}
