//! fedsync Deterministic Federation Simulator
//!
//! This crate runs a complete federation in one process: the federation
//! manager, an in-memory coordination service, a broadcast message bus and
//! any number of participants, all driven by one 64-bit seed.
//!
//! # Core Principle: Paused Time
//!
//! Scenarios run on a single-threaded Tokio runtime whose clock is paused:
//! - **Time**: the clock jumps to the next timer once every task is blocked
//! - **Messages**: every interaction is broadcast in send order
//! - **Randomness**: COA draws and federate ids derive from the seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       SimFederation                         │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ SimCoordinator (conservative time management)        │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │       ▲                        ▲                   ▲        │
//! │  ┌────┴─────┐            ┌─────┴────┐        ┌─────┴────┐   │
//! │  │ Manager  │            │   Echo   │        │   Echo   │   │
//! │  │ (COA)    │            │    #1    │  ...   │    #N    │   │
//! │  └────┬─────┘            └─────┬────┘        └─────┬────┘   │
//! │       ▼                        ▼                   ▼        │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ SimMessageBus (broadcast + history)                  │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use fedsync_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::Lockstep);
//! assert!(result.passed);
//! ```

mod context;
mod coordinator;
mod message_bus;
mod participant;
mod world;
mod runner;
pub mod scenarios;

pub use context::SimContext;
pub use coordinator::SimCoordinator;
pub use message_bus::SimMessageBus;
pub use participant::{EchoFederate, ParticipantReport, ECHO, PING};
pub use world::{SimFederation, SimManager};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
