//! Synchronized Federate - participant base shared by every federate.
//!
//! Wraps the join / barrier / step / resign protocol so that a concrete
//! participant only supplies its per-step behavior.
//!
//! When the federation shuts down, pending barrier waits return
//! [`FederationError::Terminated`] and the federate's time-advance loop is
//! terminated, so waiting tickets see [`crate::SyncError::Terminated`].
//!
//! # Lifecycle
//!
//! ```text
//! CREATED ─join─► JOINED ─► READY_TO_POPULATE ─► READY_TO_RUN ─► RUNNING ◄─► PAUSED
//!                   │                                               │
//!                   └──────── (late joiner) ────────────────────────┘
//!                                                                   ▼
//!                                          READY_TO_RESIGN ─► RESIGNED
//! ```

use std::sync::Arc;

use fedsync_env::{
    CoordinationService, FederateId, FederationContext, LogicalTime, TimeGrantListener,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::FederationError;
use crate::lifecycle::{FederateLifecycle, FederateState, TransitionError};
use crate::membership::{FederateInfo, FederationMembership};
use crate::rendezvous::RendezvousTicket;
use crate::sync_points::{SyncPoint, SyncPointRegistry};
use crate::time_advance::{FederateClock, TimeAdvanceConfig, TimeAdvanceHandle, TimeAdvanceLoop};

/// Configuration for a synchronized federate.
#[derive(Debug, Clone)]
pub struct FederateSettings {
    /// Federate type as listed in the experiment
    pub federate_type: String,

    /// Promise not to send anything earlier than `now + lookahead`
    pub lookahead: LogicalTime,

    /// Logical time advanced per step (default: 1.0)
    pub step_size: LogicalTime,

    /// Late joiners skip the startup barriers
    pub late_joiner: bool,

    pub time_advance: TimeAdvanceConfig,
}

impl Default for FederateSettings {
    fn default() -> Self {
        Self {
            federate_type: "Federate".to_string(),
            lookahead: 0.0,
            step_size: 1.0,
            late_joiner: false,
            time_advance: TimeAdvanceConfig::default(),
        }
    }
}

/// A federation participant with its own time-advance loop.
///
/// Generic over the coordination service and the context, so the same
/// participant runs against a production service or the simulation harness.
pub struct SynchronizedFederate<Svc, Ctx>
where
    Svc: CoordinationService,
    Ctx: FederationContext,
{
    id: FederateId,
    settings: FederateSettings,
    service: Arc<Svc>,
    ctx: Arc<Ctx>,
    membership: Arc<dyn FederationMembership>,
    sync_points: Arc<SyncPointRegistry>,
    lifecycle: FederateLifecycle,
    clock: Arc<FederateClock>,
    time_loop: Option<(TimeAdvanceHandle, JoinHandle<()>)>,
    shutdown_watch: Option<JoinHandle<()>>,
}

impl<Svc, Ctx> SynchronizedFederate<Svc, Ctx>
where
    Svc: CoordinationService,
    Ctx: FederationContext,
{
    pub fn new(
        id: FederateId,
        settings: FederateSettings,
        service: Arc<Svc>,
        ctx: Arc<Ctx>,
        membership: Arc<dyn FederationMembership>,
    ) -> Self {
        let sync_points = membership.sync_points();
        Self {
            id,
            settings,
            service,
            ctx,
            membership,
            sync_points,
            lifecycle: FederateLifecycle::new(),
            clock: Arc::new(FederateClock::new(0.0)),
            time_loop: None,
            shutdown_watch: None,
        }
    }

    pub fn id(&self) -> FederateId {
        self.id
    }

    pub fn settings(&self) -> &FederateSettings {
        &self.settings
    }

    pub fn state(&self) -> FederateState {
        self.lifecycle.state()
    }

    pub fn context(&self) -> &Arc<Ctx> {
        &self.ctx
    }

    /// Last logical time granted by the service.
    pub fn current_time(&self) -> LogicalTime {
        self.clock.current_time()
    }

    pub fn time_handle(&self) -> Option<&TimeAdvanceHandle> {
        self.time_loop.as_ref().map(|(handle, _)| handle)
    }

    /// Joins the service, starts the time-advance loop and reports the
    /// federate to the federation.
    ///
    /// # Returns
    /// The logical time the federate starts at.
    pub async fn join(&mut self) -> Result<LogicalTime, FederationError> {
        if self.state() != FederateState::Created {
            return Err(FederationError::Transition(TransitionError {
                from: self.state().to_string(),
                to: FederateState::Joined.to_string(),
            }));
        }

        let listener: Arc<dyn TimeGrantListener> = self.clock.clone();
        let start = self
            .service
            .join(self.id, self.settings.lookahead, listener)
            .await?;
        self.clock.reset(start);

        let info = FederateInfo::new(self.id, &self.settings.federate_type, self.settings.late_joiner)
            .joined_at(self.ctx.system_time());
        if let Err(err) = self.membership.federate_joined(info) {
            warn!(federate = %self.id, error = %err, "Federation refused federate");
            if let Err(resign_err) = self.service.resign(self.id).await {
                warn!(federate = %self.id, error = %resign_err, "Resign after refused join failed");
            }
            return Err(err.into());
        }

        let (time_loop, handle) = TimeAdvanceLoop::new(
            self.id,
            Arc::clone(&self.service),
            Arc::clone(&self.ctx),
            Arc::clone(&self.clock),
            self.settings.time_advance.clone(),
        );
        self.shutdown_watch = Some(self.watch_shutdown(handle.clone()));
        self.time_loop = Some((handle, time_loop.spawn()));
        self.lifecycle.transition(FederateState::Joined)?;

        info!(
            federate = %self.id,
            federate_type = %self.settings.federate_type,
            start,
            late_joiner = self.settings.late_joiner,
            "Federate joined"
        );
        Ok(start)
    }

    /// Terminates the loop behind `handle` once the federation shuts down.
    fn watch_shutdown(&self, handle: TimeAdvanceHandle) -> JoinHandle<()> {
        let mut shutdown = self.sync_points.shutdown_signal();
        let federate = self.id;
        self.ctx.spawn(&format!("shutdown-watch-{federate}"), async move {
            if shutdown.wait_for(|down| *down).await.is_ok() {
                info!(%federate, "Federation shutting down, stopping time advance loop");
                handle.terminate();
            }
        })
    }

    /// Arrives at the ready-to-populate barrier and waits for its release.
    ///
    /// Late joiners return immediately. Returns
    /// [`FederationError::Terminated`] if the federation shuts down first.
    pub async fn ready_to_populate(&self) -> Result<(), FederationError> {
        if self.settings.late_joiner {
            debug!(federate = %self.id, "Late joiner skips readyToPopulate");
            return Ok(());
        }
        self.lifecycle.transition(FederateState::ReadyToPopulate)?;
        self.sync_points.achieve(SyncPoint::ReadyToPopulate, self.id);
        self.sync_points.wait(SyncPoint::ReadyToPopulate).await
    }

    /// Arrives at the ready-to-run barrier, waits for its release, and
    /// enters RUNNING. Late joiners enter RUNNING directly.
    pub async fn ready_to_run(&self) -> Result<(), FederationError> {
        if !self.settings.late_joiner {
            self.lifecycle.transition(FederateState::ReadyToRun)?;
            self.sync_points.achieve(SyncPoint::ReadyToRun, self.id);
            self.sync_points.wait(SyncPoint::ReadyToRun).await?;
        }
        self.lifecycle.transition(FederateState::Running)?;
        info!(federate = %self.id, time = self.current_time(), "Federate running");
        Ok(())
    }

    /// Submits a time-advance request through the federate's loop.
    pub fn request_advance(&self, time: LogicalTime) -> Result<RendezvousTicket, FederationError> {
        let (handle, _) = self.time_loop.as_ref().ok_or(FederationError::NotJoined)?;
        Ok(handle.submit(time)?)
    }

    /// Time of the next step after `time`.
    pub fn next_step(&self, time: LogicalTime) -> LogicalTime {
        time + self.settings.step_size
    }

    pub fn pause(&self) -> Result<(), FederationError> {
        self.lifecycle.transition(FederateState::Paused)?;
        Ok(())
    }

    pub fn resume(&self) -> Result<(), FederationError> {
        self.lifecycle.transition(FederateState::Running)?;
        Ok(())
    }

    /// Leaves the federation: arrives at ready-to-resign, stops the loop,
    /// resigns from the service and reports the resignation.
    pub async fn resign(&mut self) -> Result<(), FederationError> {
        self.lifecycle.transition(FederateState::ReadyToResign)?;
        self.sync_points.achieve(SyncPoint::ReadyToResign, self.id);

        if let Some(watch) = self.shutdown_watch.take() {
            watch.abort();
        }
        if let Some((handle, task)) = self.time_loop.take() {
            handle.terminate();
            if let Err(err) = task.await {
                warn!(federate = %self.id, error = %err, "Time advance loop task failed");
            }
        }

        let service_result = self.service.resign(self.id).await;
        let membership_result = self.membership.federate_resigned(self.id);
        self.lifecycle.transition(FederateState::Resigned)?;
        info!(federate = %self.id, time = self.current_time(), "Federate resigned");

        service_result?;
        membership_result?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::MembershipError;
    use crate::rendezvous::SyncError;
    use async_trait::async_trait;
    use fedsync_env::{EnvError, TimeAdvanceMode, TokioContext};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Grants every request on the next tick.
    #[derive(Default)]
    struct InstantGrants {
        federates: Mutex<HashMap<FederateId, (Arc<dyn TimeGrantListener>, Option<LogicalTime>)>>,
    }

    impl InstantGrants {
        fn is_joined(&self, federate: FederateId) -> bool {
            self.federates.lock().unwrap().contains_key(&federate)
        }
    }

    #[async_trait]
    impl CoordinationService for InstantGrants {
        async fn join(
            &self,
            federate: FederateId,
            _lookahead: LogicalTime,
            listener: Arc<dyn TimeGrantListener>,
        ) -> Result<LogicalTime, EnvError> {
            self.federates.lock().unwrap().insert(federate, (listener, None));
            Ok(0.0)
        }

        async fn resign(&self, federate: FederateId) -> Result<(), EnvError> {
            self.federates.lock().unwrap().remove(&federate);
            Ok(())
        }

        async fn request_time_advance(
            &self,
            federate: FederateId,
            _mode: TimeAdvanceMode,
            time: LogicalTime,
        ) -> Result<(), EnvError> {
            let mut federates = self.federates.lock().unwrap();
            let entry = federates.get_mut(&federate).ok_or(EnvError::NotJoined(federate))?;
            entry.1 = Some(time);
            Ok(())
        }

        async fn tick(&self, federate: FederateId) -> Result<(), EnvError> {
            let grant = {
                let mut federates = self.federates.lock().unwrap();
                federates
                    .get_mut(&federate)
                    .and_then(|(listener, pending)| pending.take().map(|t| (Arc::clone(listener), t)))
            };
            if let Some((listener, time)) = grant {
                listener.time_advance_grant(time);
            }
            Ok(())
        }
    }

    /// Membership without a manager: records joins and resignations.
    #[derive(Default)]
    struct Roster {
        sync_points: Arc<SyncPointRegistry>,
        joined: Mutex<Vec<FederateId>>,
        resigned: Mutex<Vec<FederateId>>,
        refuse: bool,
    }

    impl FederationMembership for Roster {
        fn federate_joined(&self, info: FederateInfo) -> Result<(), MembershipError> {
            if self.refuse {
                return Err(MembershipError::ShuttingDown);
            }
            self.joined.lock().unwrap().push(info.id);
            Ok(())
        }

        fn federate_resigned(&self, federate: FederateId) -> Result<(), MembershipError> {
            self.resigned.lock().unwrap().push(federate);
            self.sync_points.withdraw(federate);
            Ok(())
        }

        fn sync_points(&self) -> Arc<SyncPointRegistry> {
            Arc::clone(&self.sync_points)
        }
    }

    type TestFederate = SynchronizedFederate<InstantGrants, TokioContext>;

    fn new_federate(seed: u64, settings: FederateSettings, roster: &Arc<Roster>) -> (TestFederate, Arc<InstantGrants>) {
        let service = Arc::new(InstantGrants::default());
        let membership: Arc<dyn FederationMembership> = roster.clone();
        let federate = SynchronizedFederate::new(
            FederateId::from_seed(seed),
            settings,
            Arc::clone(&service),
            TokioContext::shared(),
            membership,
        );
        (federate, service)
    }

    fn late_joiner() -> FederateSettings {
        FederateSettings {
            late_joiner: true,
            ..FederateSettings::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_ends_barrier_wait_and_time_loop() {
        let roster = Arc::new(Roster::default());
        let (mut federate, _) = new_federate(1, FederateSettings::default(), &roster);
        let other = FederateId::from_seed(2);
        roster.sync_points.register(SyncPoint::ReadyToPopulate, [federate.id(), other]);
        federate.join().await.unwrap();

        {
            let waiting = federate.ready_to_populate();
            tokio::pin!(waiting);
            assert!(tokio::time::timeout(Duration::from_secs(5), &mut waiting).await.is_err());

            roster.sync_points.shut_down();
            assert!(matches!(waiting.await, Err(FederationError::Terminated)));
        }
        assert_eq!(federate.state(), FederateState::ReadyToPopulate);

        while !federate.time_handle().unwrap().signal().is_terminated() {
            tokio::task::yield_now().await;
        }
        assert!(matches!(federate.request_advance(1.0), Err(FederationError::Sync(SyncError::NotAccepting))));

        federate.resign().await.unwrap();
        assert_eq!(federate.state(), FederateState::Resigned);
        assert_eq!(*roster.resigned.lock().unwrap(), vec![federate.id()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_wakes_waiting_ticket() {
        let roster = Arc::new(Roster::default());
        let (mut federate, _) = new_federate(1, late_joiner(), &roster);
        federate.join().await.unwrap();
        federate.ready_to_populate().await.unwrap();
        federate.ready_to_run().await.unwrap();

        let mut ticket = federate.request_advance(0.0).unwrap();
        assert_eq!(ticket.await_grant().await, Ok(0.0));
        // Grant held: the follow-up request stays queued
        let mut next = federate.request_advance(1.0).unwrap();

        roster.sync_points.shut_down();
        assert_eq!(next.await_grant().await, Err(SyncError::Terminated));
        ticket.release_final();
        federate.resign().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_joiner_skips_barriers() {
        let roster = Arc::new(Roster::default());
        let (mut federate, _) = new_federate(1, late_joiner(), &roster);
        federate.join().await.unwrap();

        federate.ready_to_populate().await.unwrap();
        assert_eq!(federate.state(), FederateState::Joined);
        federate.ready_to_run().await.unwrap();
        assert_eq!(federate.state(), FederateState::Running);

        assert!(roster.sync_points.waiting_on(SyncPoint::ReadyToPopulate).is_empty());
        assert_eq!(roster.sync_points.release_count(SyncPoint::ReadyToPopulate), 0);
        assert_eq!(roster.sync_points.release_count(SyncPoint::ReadyToRun), 0);
        federate.resign().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_resign_releases_peer_waiting_at_barrier() {
        let roster = Arc::new(Roster::default());
        let (mut leaving, _) = new_federate(1, FederateSettings::default(), &roster);
        let (mut staying, _) = new_federate(2, FederateSettings::default(), &roster);
        roster.sync_points.register(SyncPoint::ReadyToPopulate, [leaving.id(), staying.id()]);
        leaving.join().await.unwrap();
        staying.join().await.unwrap();

        {
            let waiting = staying.ready_to_populate();
            tokio::pin!(waiting);
            assert!(tokio::time::timeout(Duration::from_secs(5), &mut waiting).await.is_err());

            leaving.resign().await.unwrap();
            waiting.await.unwrap();
        }
        assert!(roster.sync_points.is_released(SyncPoint::ReadyToPopulate));
        assert_eq!(staying.state(), FederateState::ReadyToPopulate);
        staying.resign().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume() {
        let roster = Arc::new(Roster::default());
        let (mut federate, _) = new_federate(1, late_joiner(), &roster);
        assert!(federate.pause().is_err());

        federate.join().await.unwrap();
        federate.ready_to_run().await.unwrap();
        federate.pause().unwrap();
        assert_eq!(federate.state(), FederateState::Paused);
        assert!(matches!(federate.pause(), Err(FederationError::Transition(_))));

        federate.resume().unwrap();
        assert_eq!(federate.state(), FederateState::Running);
        federate.resign().await.unwrap();
    }

    #[test]
    fn test_next_step_adds_step_size() {
        let roster = Arc::new(Roster::default());
        let settings = FederateSettings {
            step_size: 0.25,
            ..FederateSettings::default()
        };
        let (federate, _) = new_federate(1, settings, &roster);
        assert_eq!(federate.next_step(2.0), 2.25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_advance_requires_join() {
        let roster = Arc::new(Roster::default());
        let (mut federate, _) = new_federate(1, late_joiner(), &roster);
        assert!(matches!(federate.request_advance(0.0), Err(FederationError::NotJoined)));

        federate.join().await.unwrap();
        assert!(matches!(federate.join().await, Err(FederationError::Transition(_))));
        federate.ready_to_run().await.unwrap();

        let mut ticket = federate.request_advance(0.0).unwrap();
        for step in 1..=3 {
            let time = ticket.await_grant().await.unwrap();
            let next = federate.request_advance(federate.next_step(time)).unwrap();
            ticket.release(&next).unwrap();
            ticket = next;
            assert_eq!(federate.current_time(), f64::from(step) - 1.0);
        }
        assert_eq!(ticket.await_grant().await, Ok(3.0));
        ticket.release_final();
        federate.resign().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_join_leaves_service() {
        let roster = Arc::new(Roster {
            refuse: true,
            ..Roster::default()
        });
        let (mut federate, service) = new_federate(1, FederateSettings::default(), &roster);

        assert!(matches!(federate.join().await, Err(FederationError::Membership(_))));
        assert_eq!(federate.state(), FederateState::Created);
        assert!(federate.time_handle().is_none());
        assert!(!service.is_joined(federate.id()));
    }
}
