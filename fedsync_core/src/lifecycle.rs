//! Lifecycle state machines for federates and the federation manager.
//!
//! Both machines are table driven: `allowed_transitions()` lists the legal
//! targets of each source state, and requests outside the table are rejected
//! without changing anything.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A rejected state change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot transition from {from} to {to}")]
pub struct TransitionError {
    pub from: String,
    pub to: String,
}

impl TransitionError {
    fn new(from: impl fmt::Display, to: impl fmt::Display) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

/// Per-participant lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FederateState {
    Created,
    Joined,
    ReadyToPopulate,
    ReadyToRun,
    Running,
    Paused,
    ReadyToResign,
    Resigned,
}

impl FederateState {
    /// Legal targets from this state.
    ///
    /// Late joiners go straight from `Joined` to `Running`.
    pub fn allowed_transitions(self) -> &'static [FederateState] {
        use FederateState::*;
        match self {
            Created => &[Joined],
            Joined => &[ReadyToPopulate, Running, ReadyToResign],
            ReadyToPopulate => &[ReadyToRun, ReadyToResign],
            ReadyToRun => &[Running, ReadyToResign],
            Running => &[Paused, ReadyToResign],
            Paused => &[Running, ReadyToResign],
            ReadyToResign => &[Resigned],
            Resigned => &[],
        }
    }

    pub fn can_transition_to(self, target: FederateState) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Joined => "JOINED",
            Self::ReadyToPopulate => "READY_TO_POPULATE",
            Self::ReadyToRun => "READY_TO_RUN",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::ReadyToResign => "READY_TO_RESIGN",
            Self::Resigned => "RESIGNED",
        }
    }
}

impl fmt::Display for FederateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Federation-wide lifecycle owned by the federation manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FederationManagerState {
    Uninitialized,
    Starting,
    Running,
    Paused,
    Resumed,
    Terminating,
    Terminated,
}

impl FederationManagerState {
    /// Legal targets from this state.
    pub fn allowed_transitions(self) -> &'static [FederationManagerState] {
        use FederationManagerState::*;
        match self {
            Uninitialized => &[Starting, Terminating],
            Starting => &[Running, Paused, Terminating],
            Running => &[Paused, Terminating],
            Paused => &[Running, Resumed, Terminating],
            Resumed => &[Paused, Terminating],
            Terminating => &[Terminated],
            Terminated => &[],
        }
    }

    pub fn can_transition_to(self, target: FederationManagerState) -> bool {
        self.allowed_transitions().contains(&target)
    }

    /// True while federation time is allowed to advance.
    pub fn is_stepping(self) -> bool {
        matches!(self, Self::Running | Self::Resumed)
    }

    /// True once wind-down has begun.
    pub fn is_shutting_down(self) -> bool {
        matches!(self, Self::Terminating | Self::Terminated)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Resumed => "RESUMED",
            Self::Terminating => "TERMINATING",
            Self::Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for FederationManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A participant's current lifecycle state, mutated only by its owner.
#[derive(Debug)]
pub struct FederateLifecycle {
    state: Mutex<FederateState>,
}

impl FederateLifecycle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FederateState::Created),
        }
    }

    pub fn state(&self) -> FederateState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves to `target` if the table allows it.
    ///
    /// # Returns
    /// The previous state on success.
    pub fn transition(&self, target: FederateState) -> Result<FederateState, TransitionError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = *state;
        if !previous.can_transition_to(target) {
            return Err(TransitionError::new(previous, target));
        }
        *state = target;
        Ok(previous)
    }
}

impl Default for FederateLifecycle {
    fn default() -> Self {
        Self::new()
    }
}
