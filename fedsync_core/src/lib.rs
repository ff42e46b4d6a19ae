//! FedSync Core - time synchronization and orchestration for co-simulation federations
//!
//! This library coordinates independently developed simulators (federates):
//! 1. **Time Advance**: each federate's workers rendezvous with a per-federate
//!    loop that serializes requests to the coordination service
//! 2. **Orchestration**: joins, federation-wide barriers, a master stepping
//!    loop, and a start/pause/resume/terminate control surface
//! 3. **Scenarios**: a COA (Course of Action) graph evaluated step by step
//!    against federation time

pub mod rendezvous;
pub mod request_queue;
pub mod time_advance;
pub mod lifecycle;
pub mod control;
pub mod config;
pub mod membership;
pub mod sync_points;
pub mod coa_graph;
pub mod coa_loader;
pub mod coa_executor;
pub mod federate;
pub mod federation_manager;
pub mod error;

// Re-export key types for convenience
pub use rendezvous::{LoopSignal, ReleaseError, RendezvousRequest, RendezvousTicket, SyncError};
pub use request_queue::RequestQueue;
pub use time_advance::{FederateClock, TimeAdvanceConfig, TimeAdvanceHandle, TimeAdvanceLoop};
pub use lifecycle::{FederateLifecycle, FederateState, FederationManagerState, TransitionError};
pub use control::{ControlAction, ControlRequest, StateChangeResponse};
pub use config::{ConfigError, ExperimentConfig, FederateTypeCount, FederationConfig, InjectedInteraction};
pub use membership::{FederateInfo, FederateRegistry, FederationMembership, MembershipError};
pub use sync_points::{SyncPoint, SyncPointRegistry};
pub use coa_graph::{CoaError, CoaGraph, CoaGraphBuilder, EdgeSpec, EdgeSpecKind, NodeSpec, NodeStatus};
pub use coa_executor::{CoaEffect, CoaExecutor, CoaStep, SIM_END};
pub use federate::{FederateSettings, SynchronizedFederate};
pub use federation_manager::FederationManager;
pub use error::FederationError;
