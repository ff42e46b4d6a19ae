//! Error type of federation participants and the federation manager.

use std::time::Duration;

use fedsync_env::EnvError;
use thiserror::Error;

use crate::coa_graph::CoaError;
use crate::config::ConfigError;
use crate::lifecycle::TransitionError;
use crate::membership::MembershipError;
use crate::rendezvous::SyncError;

#[derive(Debug, Error)]
pub enum FederationError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("COA error: {0}")]
    Coa(#[from] CoaError),

    #[error("environment error: {0}")]
    Env(#[from] EnvError),

    #[error("membership error: {0}")]
    Membership(#[from] MembershipError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("synchronization error: {0}")]
    Sync(#[from] SyncError),

    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: &'static str, after: Duration },

    #[error("federate has not joined")]
    NotJoined,

    #[error("federation terminated")]
    Terminated,
}

impl FederationError {
    /// True for the errors a participant sees when the federation (or its
    /// own time-advance loop) shuts down underneath it.
    pub fn is_shutdown(&self) -> bool {
        matches!(
            self,
            Self::Terminated | Self::Sync(SyncError::Terminated | SyncError::NotAccepting)
        )
    }
}
