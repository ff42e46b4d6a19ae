//! Simulated participant: a federate that answers pings until SimEnd or
//! until the federation shuts its time-advance loop down.

use fedsync_core::{
    FederateSettings, FederateState, FederationError, FederationMembership, SyncError,
    SynchronizedFederate, SIM_END,
};
use fedsync_env::{FederateId, Interaction, LogicalTime, MessageLayer};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::context::SimContext;
use crate::coordinator::SimCoordinator;
use crate::message_bus::SimMessageBus;

/// Interaction the participants answer.
pub const PING: &str = "Ping";

/// Interaction sent in reply to a ping.
pub const ECHO: &str = "Echo";

/// What a participant did during a run.
#[derive(Debug, Clone)]
pub struct ParticipantReport {
    pub id: FederateId,
    pub federate_type: String,
    pub steps: u64,
    pub echoes: u64,
    pub final_time: LogicalTime,
    pub final_state: FederateState,
    pub error: Option<String>,
}

enum Event {
    Message(Result<Interaction, RecvError>),
    Granted(Result<LogicalTime, SyncError>),
}

/// Steps in lockstep with the federation and replies `Echo` to every
/// `Ping` it did not send itself.
pub struct EchoFederate {
    federate: SynchronizedFederate<SimCoordinator, SimContext>,
    bus: Arc<SimMessageBus>,
    rx: broadcast::Receiver<Interaction>,
    steps: u64,
    echoes: u64,
}

impl EchoFederate {
    /// Creates the participant; it subscribes to the bus immediately so
    /// nothing sent before it joins is missed.
    pub fn new(
        id: FederateId,
        settings: FederateSettings,
        coordinator: Arc<SimCoordinator>,
        ctx: Arc<SimContext>,
        bus: Arc<SimMessageBus>,
        membership: Arc<dyn FederationMembership>,
    ) -> Self {
        let rx = bus.subscribe();
        Self {
            federate: SynchronizedFederate::new(id, settings, coordinator, ctx, membership),
            bus,
            rx,
            steps: 0,
            echoes: 0,
        }
    }

    pub fn id(&self) -> FederateId {
        self.federate.id()
    }

    /// Runs the participant to completion and resigns.
    pub async fn run(mut self) -> ParticipantReport {
        let outcome = match self.participate().await {
            Err(err) if err.is_shutdown() => {
                info!(federate = %self.id(), time = self.federate.current_time(), "Stopped by federation shutdown");
                Ok(())
            }
            other => other,
        };
        if let Err(err) = &outcome {
            warn!(federate = %self.id(), error = %err, "Participant stopped early");
        }

        let state = self.federate.state();
        if state != FederateState::Created && state != FederateState::Resigned {
            if let Err(err) = self.federate.resign().await {
                warn!(federate = %self.id(), error = %err, "Participant resign failed");
            }
        }

        ParticipantReport {
            id: self.id(),
            federate_type: self.federate.settings().federate_type.clone(),
            steps: self.steps,
            echoes: self.echoes,
            final_time: self.federate.current_time(),
            final_state: self.federate.state(),
            error: outcome.err().map(|err| err.to_string()),
        }
    }

    async fn participate(&mut self) -> Result<(), FederationError> {
        self.federate.join().await?;

        let mut backlog = Vec::new();
        let started = {
            let federate = &self.federate;
            let rx = &mut self.rx;
            tokio::select! {
                biased;
                _ = sim_end(rx, &mut backlog) => false,
                ready = async {
                    federate.ready_to_populate().await?;
                    federate.ready_to_run().await
                } => {
                    ready?;
                    true
                }
            }
        };
        if !started {
            info!(federate = %self.id(), "SimEnd before start");
            return Ok(());
        }
        for interaction in backlog {
            if interaction.name == PING && interaction.source != Some(self.id()) {
                self.answer(&interaction).await;
            }
        }

        let mut ticket = self.federate.request_advance(self.federate.current_time())?;
        loop {
            let event = {
                let rx = &mut self.rx;
                tokio::select! {
                    biased;
                    message = rx.recv() => Event::Message(message),
                    granted = ticket.await_grant() => Event::Granted(granted),
                }
            };

            match event {
                Event::Message(Ok(interaction)) if interaction.name == SIM_END => {
                    info!(federate = %self.id(), time = self.federate.current_time(), "SimEnd received");
                    ticket.release_final();
                    return Ok(());
                }
                Event::Message(Ok(interaction)) => {
                    if interaction.name == PING && interaction.source != Some(self.id()) {
                        self.answer(&interaction).await;
                    }
                }
                Event::Message(Err(RecvError::Lagged(missed))) => {
                    warn!(federate = %self.id(), missed, "Participant fell behind the bus");
                }
                Event::Message(Err(RecvError::Closed)) => {
                    ticket.release_final();
                    return Ok(());
                }
                Event::Granted(granted) => {
                    let time = granted?;
                    self.steps += 1;
                    debug!(federate = %self.id(), time, "Participant step");
                    let next = self.federate.request_advance(self.federate.next_step(time))?;
                    ticket.release(&next).map_err(|rejected| rejected.reason)?;
                    ticket = next;
                }
            }
        }
    }

    async fn answer(&mut self, ping: &Interaction) {
        // Never earlier than the ping itself or the lookahead promise
        let earliest = self.federate.current_time() + self.federate.settings().lookahead;
        let echo = Interaction::new(ECHO, ping.time.max(earliest))
            .with_parameter("pingTime", ping.time.to_string())
            .from_federate(self.id());
        match self.bus.emit(echo).await {
            Ok(()) => self.echoes += 1,
            Err(err) => warn!(federate = %self.id(), error = %err, "Echo not sent"),
        }
    }
}

/// Resolves on SimEnd; everything else received meanwhile goes to `backlog`.
async fn sim_end(rx: &mut broadcast::Receiver<Interaction>, backlog: &mut Vec<Interaction>) {
    loop {
        match rx.recv().await {
            Ok(interaction) if interaction.name == SIM_END => return,
            Ok(interaction) => backlog.push(interaction),
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return,
        }
    }
}
