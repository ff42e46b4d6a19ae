//! Error types for the fedsync environment abstraction.

use thiserror::Error;

use crate::types::{FederateId, LogicalTime};

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// The coordination service already advanced past the requested time.
    #[error("Federation time already passed: requested {requested}, current {current}")]
    TimeAlreadyPassed {
        requested: LogicalTime,
        current: LogicalTime,
    },

    /// The federate is not joined to the coordination service
    #[error("Federate not joined: {0}")]
    NotJoined(FederateId),

    /// The federate joined twice
    #[error("Federate already joined: {0}")]
    AlreadyJoined(FederateId),

    /// Coordination service call failed (transient or unknown)
    #[error("Coordination service error: {0}")]
    ServiceError(String),

    /// Message layer rejected an interaction
    #[error("Message layer error: {0}")]
    MessageError(String),

    /// Context operation failed
    #[error("Context error: {0}")]
    ContextError(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a coordination service error.
    pub fn service(msg: impl Into<String>) -> Self {
        Self::ServiceError(msg.into())
    }

    /// Creates a message layer error.
    pub fn message(msg: impl Into<String>) -> Self {
        Self::MessageError(msg.into())
    }

    /// Returns true for the "time already passed" condition.
    pub fn is_time_already_passed(&self) -> bool {
        matches!(self, Self::TimeAlreadyPassed { .. })
    }
}
