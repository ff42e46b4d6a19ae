//! Coordination service and message layer abstractions.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::EnvError;
use crate::types::{FederateId, Interaction, LogicalTime, TimeAdvanceMode};

/// Callback through which the coordination service delivers time grants.
///
/// Implementations must be cheap and non-blocking: the service may invoke
/// the listener from inside `tick()` or `request_time_advance()`.
pub trait TimeGrantListener: Send + Sync + 'static {
    /// Called once the service has granted `time` to the federate.
    fn time_advance_grant(&self, time: LogicalTime);
}

/// Abstraction of the shared runtime-infrastructure service that owns
/// federation-wide logical time.
///
/// # Implementations
///
/// - **Production**: bridges to an RTI
/// - **Simulation**: `SimCoordinator`, an in-memory conservative time manager
///
/// # Grant Flow
///
/// ```text
/// Time-Advance Loop            Service                  Listener
///   |                             |                          |
///   |-- request_time_advance ---->|                          |
///   |-- tick() ------------------>|                          |
///   |-- tick() ------------------>|-- time_advance_grant --->|
/// ```
///
/// The service is not assumed to be reentrant for one federate; callers
/// serialize their calls per federate.
#[async_trait]
pub trait CoordinationService: Send + Sync + 'static {
    /// Joins a federate and registers its grant listener.
    ///
    /// # Returns
    /// * `Ok(time)` - The logical time the federate starts at
    /// * `Err(EnvError::AlreadyJoined)` - The id is already joined
    async fn join(
        &self,
        federate: FederateId,
        lookahead: LogicalTime,
        listener: Arc<dyn TimeGrantListener>,
    ) -> Result<LogicalTime, EnvError>;

    /// Removes a federate from time management.
    async fn resign(&self, federate: FederateId) -> Result<(), EnvError>;

    /// Asks the service to advance the federate to `time`.
    ///
    /// The grant is delivered asynchronously to the federate's listener.
    ///
    /// # Returns
    /// * `Ok(())` - Request accepted
    /// * `Err(EnvError::TimeAlreadyPassed)` - `time` is not after the
    ///   federate's current time
    async fn request_time_advance(
        &self,
        federate: FederateId,
        mode: TimeAdvanceMode,
        time: LogicalTime,
    ) -> Result<(), EnvError>;

    /// Gives the service a chance to evaluate and deliver pending callbacks.
    async fn tick(&self, federate: FederateId) -> Result<(), EnvError>;
}

/// The injection side of the message layer.
///
/// Used by COA Action nodes and scripted injected interactions.
#[async_trait]
pub trait MessageLayer: Send + Sync + 'static {
    /// Sends an interaction, timestamped with `interaction.time`.
    async fn emit(&self, interaction: Interaction) -> Result<(), EnvError>;
}
