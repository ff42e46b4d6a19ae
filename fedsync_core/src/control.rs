//! Control surface types consumed by an external hosting layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::lifecycle::FederationManagerState;

/// Command accepted by the federation manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ControlAction {
    Start,
    Pause,
    Resume,
    Terminate,
}

impl ControlAction {
    /// State the command asks the manager to enter.
    pub fn target_state(self) -> FederationManagerState {
        match self {
            Self::Start => FederationManagerState::Starting,
            Self::Pause => FederationManagerState::Paused,
            Self::Resume => FederationManagerState::Resumed,
            Self::Terminate => FederationManagerState::Terminating,
        }
    }
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "START",
            Self::Pause => "PAUSE",
            Self::Resume => "RESUME",
            Self::Terminate => "TERMINATE",
        };
        f.write_str(name)
    }
}

impl FromStr for ControlAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "START" => Ok(Self::Start),
            "PAUSE" => Ok(Self::Pause),
            "RESUME" => Ok(Self::Resume),
            "TERMINATE" => Ok(Self::Terminate),
            other => Err(format!("Unknown control action: {}", other)),
        }
    }
}

/// Wire form of a control command: `{"action": "PAUSE"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub action: ControlAction,
}

/// Outcome of a state change request.
///
/// A rejected request reports `previous_state == new_state` and a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChangeResponse {
    pub previous_state: FederationManagerState,
    pub new_state: FederationManagerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StateChangeResponse {
    pub fn accepted(previous: FederationManagerState, new: FederationManagerState) -> Self {
        Self {
            previous_state: previous,
            new_state: new,
            message: None,
        }
    }

    pub fn rejected(current: FederationManagerState, target: FederationManagerState) -> Self {
        Self {
            previous_state: current,
            new_state: current,
            message: Some(format!("cannot transition from {} to {}", current, target)),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.message.is_none()
    }
}
