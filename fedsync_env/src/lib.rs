//! fedsync Environment Abstraction Layer
//!
//! This crate provides the seams that let the fedsync protocol engines run
//! against a real runtime-infrastructure deployment or an in-process
//! simulation.
//!
//! # Core Concept: Intercepted Collaborators
//!
//! Everything the federation core does not own is reached through a trait:
//! - Time and tasks (`now()`, `sleep()`, `spawn()`)
//! - Randomness (`derive_rng()`)
//! - The shared coordination service (`join`, `request_time_advance`, `tick`)
//! - The message layer (`emit`)
//!
//! Deriving all entropy from a single 64-bit seed makes a federation run
//! reproducible from its seed number.
//!
//! # Example
//!
//! ```ignore
//! use fedsync_env::{CoordinationService, FederationContext, TimeAdvanceMode};
//!
//! async fn step<Ctx: FederationContext, Svc: CoordinationService>(
//!     ctx: &Ctx,
//!     svc: &Svc,
//!     id: FederateId,
//! ) {
//!     svc.request_time_advance(id, TimeAdvanceMode::TimeAdvanceRequest, 1.0).await?;
//!     loop {
//!         svc.tick(id).await?;
//!         ctx.sleep(Duration::from_millis(10)).await;
//!     }
//! }
//! ```

mod context;
mod coordination;
mod types;
mod error;
mod tokio_impl;

pub use context::FederationContext;
pub use coordination::{CoordinationService, MessageLayer, TimeGrantListener};
pub use types::{FederateId, Interaction, LogicalTime, TimeAdvanceMode};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
