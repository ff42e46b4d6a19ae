//! In-memory conservative time management.
//!
//! A federate's request for time `T` is granted once no other federate can
//! still send anything earlier than `T`. Each other federate `G` is bounded
//! by its pending request (or its current time when it has none) plus its
//! lookahead:
//!
//! ```text
//! grant T to F  ⇔  T ≤ min over G ≠ F of (pending(G) or current(G)) + lookahead(G)
//! ```

use async_trait::async_trait;
use fedsync_env::{
    CoordinationService, EnvError, FederateId, LogicalTime, TimeAdvanceMode, TimeGrantListener,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

struct TimeRegulated {
    current: LogicalTime,
    lookahead: LogicalTime,
    pending: Option<(TimeAdvanceMode, LogicalTime)>,
    listener: Arc<dyn TimeGrantListener>,
}

impl TimeRegulated {
    /// Earliest timestamp this federate may still send.
    fn bound(&self) -> LogicalTime {
        self.pending.map_or(self.current, |(_, time)| time) + self.lookahead
    }
}

/// Simulated coordination service shared by every federate of a run.
#[derive(Default)]
pub struct SimCoordinator {
    federates: Mutex<HashMap<FederateId, TimeRegulated>>,

    /// Remaining requests to reject with a transient error
    failures: AtomicU32,

    grants: AtomicU64,
}

impl SimCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an Arc-wrapped coordinator for sharing.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Makes the next `count` time-advance requests fail with a service error.
    pub fn fail_next_requests(&self, count: u32) {
        self.failures.store(count, Ordering::Release);
    }

    /// Total grants delivered.
    pub fn grants(&self) -> u64 {
        self.grants.load(Ordering::Acquire)
    }

    pub fn joined(&self) -> usize {
        self.lock().len()
    }

    /// Current logical time of a joined federate.
    pub fn time_of(&self, federate: FederateId) -> Option<LogicalTime> {
        self.lock().get(&federate).map(|f| f.current)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<FederateId, TimeRegulated>> {
        self.federates.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies every grant that is currently safe and returns the callbacks
    /// to deliver once the lock is released.
    fn collect_grants(
        federates: &mut HashMap<FederateId, TimeRegulated>,
    ) -> Vec<(Arc<dyn TimeGrantListener>, LogicalTime)> {
        let grantable: Vec<(FederateId, LogicalTime)> = federates
            .iter()
            .filter_map(|(id, federate)| {
                let (_, requested) = federate.pending?;
                let bound = federates
                    .iter()
                    .filter(|(other, _)| *other != id)
                    .map(|(_, other)| other.bound())
                    .fold(LogicalTime::INFINITY, LogicalTime::min);
                (requested <= bound).then_some((*id, requested))
            })
            .collect();

        grantable
            .into_iter()
            .filter_map(|(id, time)| {
                let federate = federates.get_mut(&id)?;
                federate.pending = None;
                federate.current = time;
                Some((Arc::clone(&federate.listener), time))
            })
            .collect()
    }
}

#[async_trait]
impl CoordinationService for SimCoordinator {
    async fn join(
        &self,
        federate: FederateId,
        lookahead: LogicalTime,
        listener: Arc<dyn TimeGrantListener>,
    ) -> Result<LogicalTime, EnvError> {
        let mut federates = self.lock();
        if federates.contains_key(&federate) {
            return Err(EnvError::AlreadyJoined(federate));
        }

        // Late joiners start at the slowest federate's time
        let start = federates
            .values()
            .map(|f| f.current)
            .reduce(LogicalTime::min)
            .unwrap_or(0.0);

        federates.insert(
            federate,
            TimeRegulated {
                current: start,
                lookahead,
                pending: None,
                listener,
            },
        );
        info!(%federate, start, lookahead, "Federate joined coordinator");
        Ok(start)
    }

    async fn resign(&self, federate: FederateId) -> Result<(), EnvError> {
        let grants = {
            let mut federates = self.lock();
            federates.remove(&federate).ok_or(EnvError::NotJoined(federate))?;
            Self::collect_grants(&mut federates)
        };
        info!(%federate, "Federate left coordinator");
        self.deliver(grants);
        Ok(())
    }

    async fn request_time_advance(
        &self,
        federate: FederateId,
        mode: TimeAdvanceMode,
        time: LogicalTime,
    ) -> Result<(), EnvError> {
        let consumed = self
            .failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(EnvError::service("injected request failure"));
        }

        let mut federates = self.lock();
        let entry = federates
            .get_mut(&federate)
            .ok_or(EnvError::NotJoined(federate))?;
        if time <= entry.current {
            return Err(EnvError::TimeAlreadyPassed {
                requested: time,
                current: entry.current,
            });
        }
        // Event-driven modes have no event source here and behave like TAR
        entry.pending = Some((mode, time));
        debug!(%federate, %mode, time, "Time advance requested");
        Ok(())
    }

    async fn tick(&self, federate: FederateId) -> Result<(), EnvError> {
        let grants = {
            let mut federates = self.lock();
            if !federates.contains_key(&federate) {
                return Err(EnvError::NotJoined(federate));
            }
            Self::collect_grants(&mut federates)
        };
        self.deliver(grants);
        Ok(())
    }
}

impl SimCoordinator {
    fn deliver(&self, grants: Vec<(Arc<dyn TimeGrantListener>, LogicalTime)>) {
        for (listener, time) in grants {
            self.grants.fetch_add(1, Ordering::AcqRel);
            listener.time_advance_grant(time);
        }
    }
}
