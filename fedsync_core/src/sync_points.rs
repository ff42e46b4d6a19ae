//! Federation-wide synchronization points (barriers).
//!
//! The federation manager registers the set of federates a barrier waits
//! for; participants report arrival with [`SyncPointRegistry::achieve`]. A
//! barrier is released exactly once, when every required federate arrived.
//! Arrivals before registration are remembered.
//!
//! Once the federation winds down the registry is shut down: waits on the
//! startup barriers return [`FederationError::Terminated`], and participants
//! watching [`SyncPointRegistry::shutdown_signal`] stop their time-advance
//! loops. The ready-to-resign barrier is part of the wind-down and keeps
//! working.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Mutex, PoisonError};

use fedsync_env::FederateId;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::FederationError;

/// The federation's barriers, in the order they are passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SyncPoint {
    ReadyToPopulate,
    ReadyToRun,
    ReadyToResign,
}

impl SyncPoint {
    pub fn label(self) -> &'static str {
        match self {
            Self::ReadyToPopulate => "readyToPopulate",
            Self::ReadyToRun => "readyToRun",
            Self::ReadyToResign => "readyToResign",
        }
    }
}

impl fmt::Display for SyncPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Default)]
struct Barrier {
    /// `None` until the manager registers the barrier
    required: Option<BTreeSet<FederateId>>,
    achieved: BTreeSet<FederateId>,
    releases: u32,
}

impl Barrier {
    fn is_satisfied(&self) -> bool {
        match &self.required {
            Some(required) => required.is_subset(&self.achieved),
            None => false,
        }
    }
}

/// Registry of all barriers of one federation.
#[derive(Debug)]
pub struct SyncPointRegistry {
    barriers: Mutex<BTreeMap<SyncPoint, Barrier>>,
    released: watch::Sender<BTreeSet<SyncPoint>>,
    shutdown: watch::Sender<bool>,
}

impl Default for SyncPointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncPointRegistry {
    pub fn new() -> Self {
        let (released, _) = watch::channel(BTreeSet::new());
        let (shutdown, _) = watch::channel(false);
        Self {
            barriers: Mutex::new(BTreeMap::new()),
            released,
            shutdown,
        }
    }

    /// Sets the federates `point` waits for.
    pub fn register(&self, point: SyncPoint, required: impl IntoIterator<Item = FederateId>) {
        let mut barriers = self.barriers.lock().unwrap_or_else(PoisonError::into_inner);
        let barrier = barriers.entry(point).or_default();
        let required: BTreeSet<_> = required.into_iter().collect();
        info!(sync_point = %point, required = required.len(), "Synchronization point registered");
        barrier.required = Some(required);
        self.try_release(point, barrier);
    }

    /// Records `federate` arriving at `point`.
    pub fn achieve(&self, point: SyncPoint, federate: FederateId) {
        let mut barriers = self.barriers.lock().unwrap_or_else(PoisonError::into_inner);
        let barrier = barriers.entry(point).or_default();
        if barrier.achieved.insert(federate) {
            debug!(sync_point = %point, %federate, "Synchronization point achieved");
        }
        self.try_release(point, barrier);
    }

    /// Drops `federate` from every barrier that has not been released yet.
    pub fn withdraw(&self, federate: FederateId) {
        let mut barriers = self.barriers.lock().unwrap_or_else(PoisonError::into_inner);
        for (point, barrier) in barriers.iter_mut() {
            if barrier.releases > 0 {
                continue;
            }
            if let Some(required) = barrier.required.as_mut() {
                required.remove(&federate);
            }
            self.try_release(*point, barrier);
        }
    }

    fn try_release(&self, point: SyncPoint, barrier: &mut Barrier) {
        if barrier.releases > 0 || !barrier.is_satisfied() {
            return;
        }
        barrier.releases += 1;
        info!(sync_point = %point, arrived = barrier.achieved.len(), "Synchronization point released");
        self.released.send_modify(|released| {
            released.insert(point);
        });
    }

    pub fn is_released(&self, point: SyncPoint) -> bool {
        self.released.borrow().contains(&point)
    }

    /// How many times `point` has been released (0 or 1).
    pub fn release_count(&self, point: SyncPoint) -> u32 {
        self.barriers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&point)
            .map_or(0, |b| b.releases)
    }

    /// Required federates that have not arrived yet.
    pub fn waiting_on(&self, point: SyncPoint) -> Vec<FederateId> {
        let barriers = self.barriers.lock().unwrap_or_else(PoisonError::into_inner);
        match barriers.get(&point).and_then(|b| b.required.as_ref().map(|r| (r, &b.achieved))) {
            Some((required, achieved)) => required.difference(achieved).copied().collect(),
            None => Vec::new(),
        }
    }

    /// Marks the federation as winding down. Idempotent.
    pub fn shut_down(&self) {
        if !self.shutdown.send_replace(true) {
            info!("Synchronization points shut down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Flips to `true` when the federation winds down.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Waits until `point` is released.
    ///
    /// # Returns
    /// * `Err(FederationError::Terminated)` - the registry was shut down
    ///   before a startup barrier was released
    pub async fn wait(&self, point: SyncPoint) -> Result<(), FederationError> {
        let mut released = self.released.subscribe();
        if point == SyncPoint::ReadyToResign {
            return released
                .wait_for(|set| set.contains(&point))
                .await
                .map(|_| ())
                .map_err(|_| FederationError::Terminated);
        }

        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            biased;
            done = released.wait_for(|set| set.contains(&point)) => {
                done.map(|_| ()).map_err(|_| FederationError::Terminated)
            }
            _ = shutdown.wait_for(|down| *down) => {
                debug!(sync_point = %point, "Barrier wait cancelled by shutdown");
                Err(FederationError::Terminated)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_released_once_all_required_arrive() {
        let registry = SyncPointRegistry::new();
        let (a, b) = (FederateId::from_seed(1), FederateId::from_seed(2));

        registry.register(SyncPoint::ReadyToRun, [a, b]);
        registry.achieve(SyncPoint::ReadyToRun, a);
        assert!(!registry.is_released(SyncPoint::ReadyToRun));
        assert_eq!(registry.waiting_on(SyncPoint::ReadyToRun), vec![b]);

        registry.achieve(SyncPoint::ReadyToRun, b);
        registry.achieve(SyncPoint::ReadyToRun, b);
        assert!(registry.is_released(SyncPoint::ReadyToRun));
        assert_eq!(registry.release_count(SyncPoint::ReadyToRun), 1);
    }

    #[test]
    fn test_early_arrival_counts_after_registration() {
        let registry = SyncPointRegistry::new();
        let a = FederateId::from_seed(1);

        registry.achieve(SyncPoint::ReadyToPopulate, a);
        assert!(!registry.is_released(SyncPoint::ReadyToPopulate));

        registry.register(SyncPoint::ReadyToPopulate, [a]);
        assert!(registry.is_released(SyncPoint::ReadyToPopulate));
    }

    #[test]
    fn test_withdraw_unblocks_barrier() {
        let registry = SyncPointRegistry::new();
        let (a, b) = (FederateId::from_seed(1), FederateId::from_seed(2));

        registry.register(SyncPoint::ReadyToResign, [a, b]);
        registry.achieve(SyncPoint::ReadyToResign, a);
        registry.withdraw(b);

        assert!(registry.is_released(SyncPoint::ReadyToResign));
    }

    #[tokio::test]
    async fn test_wait_returns_on_release() {
        let registry = Arc::new(SyncPointRegistry::new());
        let a = FederateId::from_seed(1);
        registry.register(SyncPoint::ReadyToRun, [a]);

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait(SyncPoint::ReadyToRun).await })
        };
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(!waiter.is_finished());

        registry.achieve(SyncPoint::ReadyToRun, a);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_cancels_startup_barrier_wait() {
        let registry = Arc::new(SyncPointRegistry::new());
        let (a, b) = (FederateId::from_seed(1), FederateId::from_seed(2));
        registry.register(SyncPoint::ReadyToPopulate, [a, b]);
        registry.achieve(SyncPoint::ReadyToPopulate, a);

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait(SyncPoint::ReadyToPopulate).await })
        };
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(!waiter.is_finished());

        registry.shut_down();
        assert!(matches!(waiter.await.unwrap(), Err(FederationError::Terminated)));
        assert!(registry.is_shut_down());
        assert!(!registry.is_released(SyncPoint::ReadyToPopulate));

        // Later waits fail straight away
        assert!(matches!(
            registry.wait(SyncPoint::ReadyToRun).await,
            Err(FederationError::Terminated)
        ));
    }

    #[tokio::test]
    async fn test_released_barrier_wins_over_shutdown() {
        let registry = SyncPointRegistry::new();
        let a = FederateId::from_seed(1);
        registry.register(SyncPoint::ReadyToRun, [a]);
        registry.achieve(SyncPoint::ReadyToRun, a);
        registry.shut_down();

        assert!(registry.wait(SyncPoint::ReadyToRun).await.is_ok());
    }

    #[tokio::test]
    async fn test_resign_barrier_survives_shutdown() {
        let registry = Arc::new(SyncPointRegistry::new());
        let (a, b) = (FederateId::from_seed(1), FederateId::from_seed(2));
        let mut signal = registry.shutdown_signal();
        registry.shut_down();
        assert!(*signal.borrow_and_update());

        registry.register(SyncPoint::ReadyToResign, [a, b]);
        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait(SyncPoint::ReadyToResign).await })
        };
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(!waiter.is_finished());

        registry.achieve(SyncPoint::ReadyToResign, a);
        registry.withdraw(b);
        waiter.await.unwrap().unwrap();
    }
}
