//! Simulated message layer with a broadcast fan-out and a send history.

use async_trait::async_trait;
use fedsync_env::{EnvError, Interaction, MessageLayer};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, trace};

const DEFAULT_CAPACITY: usize = 1024;

/// Every subscriber sees every interaction, in send order.
pub struct SimMessageBus {
    tx: broadcast::Sender<Interaction>,
    history: Mutex<Vec<Interaction>>,

    /// Interaction names silently discarded (fault injection)
    dropped: Mutex<HashSet<String>>,
}

impl SimMessageBus {
    /// Creates a bus with the default subscriber buffer.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            history: Mutex::new(Vec::new()),
            dropped: Mutex::new(HashSet::new()),
        }
    }

    /// Creates an Arc-wrapped bus for sharing.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Receives everything emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Interaction> {
        self.tx.subscribe()
    }

    /// Discards every future interaction named `name`.
    pub fn drop_interactions(&self, name: impl Into<String>) {
        lock(&self.dropped).insert(name.into());
    }

    /// Everything delivered so far.
    pub fn history(&self) -> Vec<Interaction> {
        lock(&self.history).clone()
    }

    /// Delivered interactions named `name`.
    pub fn sent(&self, name: &str) -> Vec<Interaction> {
        lock(&self.history)
            .iter()
            .filter(|i| i.name == name)
            .cloned()
            .collect()
    }
}

impl Default for SimMessageBus {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl MessageLayer for SimMessageBus {
    async fn emit(&self, interaction: Interaction) -> Result<(), EnvError> {
        if lock(&self.dropped).contains(&interaction.name) {
            debug!(interaction = %interaction.name, time = interaction.time, "Interaction dropped");
            return Ok(());
        }

        lock(&self.history).push(interaction.clone());
        // No subscribers is not an error; the history still records it
        let receivers = self.tx.send(interaction).unwrap_or(0);
        trace!(receivers, "Interaction broadcast");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedsync_env::FederateId;

    #[tokio::test]
    async fn test_subscribers_see_interactions_in_order() {
        let bus = SimMessageBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(Interaction::new("Ping", 1.0)).await.unwrap();
        bus.emit(Interaction::new("Echo", 2.0).from_federate(FederateId::from_seed(4)))
            .await
            .unwrap();

        assert_eq!(a.recv().await.unwrap().name, "Ping");
        assert_eq!(a.recv().await.unwrap().name, "Echo");
        assert_eq!(b.recv().await.unwrap().time, 1.0);
        assert_eq!(bus.sent("Echo").len(), 1);
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_recorded() {
        let bus = SimMessageBus::new();
        bus.emit(Interaction::new("SimEnd", 3.0)).await.unwrap();
        assert_eq!(bus.history().len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_interactions_are_not_delivered() {
        let bus = SimMessageBus::new();
        let mut rx = bus.subscribe();
        bus.drop_interactions("Echo");

        bus.emit(Interaction::new("Echo", 1.0)).await.unwrap();
        bus.emit(Interaction::new("Ping", 1.0)).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().name, "Ping");
        assert!(bus.sent("Echo").is_empty());
    }
}
