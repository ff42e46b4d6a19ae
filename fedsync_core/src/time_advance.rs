//! Per-federate time-advance loop.
//!
//! The loop is the only component that talks to the coordination service's
//! time-advance primitive on behalf of a federate. Workers never call the
//! service directly; they submit rendezvous requests and are released in
//! requested-time order.
//!
//! ```text
//! ┌──────────┐ submit ┌──────────────┐ pop ┌──────────────────┐ request/tick ┌─────────┐
//! │ Worker(s)│───────►│ RequestQueue │────►│ TimeAdvanceLoop  │─────────────►│ Service │
//! └──────────┘        └──────────────┘     └──────────────────┘              └─────────┘
//!      ▲                                        │      ▲                          │
//!      └──────────── grant / release ───────────┘      └── FederateClock ◄────────┘
//!                                                           (grant callback)
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fedsync_env::{
    CoordinationService, EnvError, FederateId, FederationContext, LogicalTime, TimeAdvanceMode,
    TimeGrantListener,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::rendezvous::{rendezvous, terminated, LoopSignal, RendezvousRequest, RendezvousTicket, SyncError};
use crate::request_queue::RequestQueue;

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

/// Tuning for a time-advance loop.
#[derive(Debug, Clone)]
pub struct TimeAdvanceConfig {
    /// Time-advance primitive used against the service
    pub mode: TimeAdvanceMode,

    /// Sleep between grant polls
    pub poll_interval: Duration,

    /// Sleep before retrying a failed service call
    pub retry_delay: Duration,
}

impl Default for TimeAdvanceConfig {
    fn default() -> Self {
        Self {
            mode: TimeAdvanceMode::TimeAdvanceRequest,
            poll_interval: Duration::from_millis(10),
            retry_delay: Duration::from_millis(10),
        }
    }
}

/// A federate's view of its granted logical time.
///
/// Registered with the coordination service as the grant listener; the loop
/// polls it while a request is outstanding.
#[derive(Debug)]
pub struct FederateClock {
    current_bits: AtomicU64,
    grant_pending: AtomicBool,
    grants: AtomicU64,
}

impl FederateClock {
    pub fn new(start: LogicalTime) -> Self {
        Self {
            current_bits: AtomicU64::new(start.to_bits()),
            grant_pending: AtomicBool::new(false),
            grants: AtomicU64::new(0),
        }
    }

    pub fn current_time(&self) -> LogicalTime {
        LogicalTime::from_bits(self.current_bits.load(Ordering::Acquire))
    }

    /// Moves the clock without a grant (join offset).
    pub fn reset(&self, time: LogicalTime) {
        self.current_bits.store(time.to_bits(), Ordering::Release);
    }

    pub fn is_grant_pending(&self) -> bool {
        self.grant_pending.load(Ordering::Acquire)
    }

    /// Number of grants delivered by the service.
    pub fn grant_count(&self) -> u64 {
        self.grants.load(Ordering::Relaxed)
    }

    fn begin_request(&self) {
        self.grant_pending.store(true, Ordering::Release);
    }

    fn abandon_request(&self) {
        self.grant_pending.store(false, Ordering::Release);
    }
}

impl TimeGrantListener for FederateClock {
    fn time_advance_grant(&self, time: LogicalTime) {
        self.current_bits.store(time.to_bits(), Ordering::Release);
        self.grants.fetch_add(1, Ordering::Relaxed);
        self.grant_pending.store(false, Ordering::Release);
    }
}

/// State shared between a loop and its handles.
#[derive(Debug)]
struct LoopShared {
    id: u64,
    federate: FederateId,
    queue: RequestQueue,
    clock: Arc<FederateClock>,
    signal: watch::Sender<LoopSignal>,
    next_seq: AtomicU64,
    service_calls: AtomicU64,
}

/// Worker-facing handle to a time-advance loop.
#[derive(Debug, Clone)]
pub struct TimeAdvanceHandle {
    shared: Arc<LoopShared>,
}

impl TimeAdvanceHandle {
    /// Queues a request for `requested_time` and returns the worker's ticket.
    ///
    /// # Returns
    /// * `Err(SyncError::NotAccepting)` - the loop was told to drain or stop
    pub fn submit(&self, requested_time: LogicalTime) -> Result<RendezvousTicket, SyncError> {
        if !self.shared.signal.borrow().accepts_requests() {
            return Err(SyncError::NotAccepting);
        }
        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        let (request, ticket) = rendezvous(
            requested_time,
            seq,
            self.shared.id,
            self.shared.signal.subscribe(),
        );
        self.shared.queue.push(request);
        Ok(ticket)
    }

    /// Signals that no further requests are expected; the loop exits once
    /// its queue is empty.
    pub fn finish(&self) {
        self.shared.signal.send_if_modified(|signal| {
            if *signal == LoopSignal::Running {
                *signal = LoopSignal::Draining;
                true
            } else {
                false
            }
        });
    }

    /// Stops the loop; waiting tickets return [`SyncError::Terminated`].
    pub fn terminate(&self) {
        self.shared.signal.send_replace(LoopSignal::Terminated);
    }

    pub fn signal(&self) -> LoopSignal {
        *self.shared.signal.borrow()
    }

    pub fn federate(&self) -> FederateId {
        self.shared.federate
    }

    pub fn current_time(&self) -> LogicalTime {
        self.shared.clock.current_time()
    }

    pub fn clock(&self) -> Arc<FederateClock> {
        Arc::clone(&self.shared.clock)
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.queue.len()
    }

    /// Number of `request_time_advance` calls made against the service.
    pub fn service_calls(&self) -> u64 {
        self.shared.service_calls.load(Ordering::Relaxed)
    }
}

/// Coordination loop serializing one federate's time advances.
pub struct TimeAdvanceLoop<Svc: CoordinationService, Ctx: FederationContext> {
    shared: Arc<LoopShared>,
    service: Arc<Svc>,
    ctx: Arc<Ctx>,
    config: TimeAdvanceConfig,

    /// Only one outstanding service call per loop
    service_guard: tokio::sync::Mutex<()>,
}

impl<Svc: CoordinationService, Ctx: FederationContext> TimeAdvanceLoop<Svc, Ctx> {
    /// Creates a loop for `federate` and its worker handle.
    ///
    /// `clock` must be the listener the federate registered when joining
    /// the service.
    pub fn new(
        federate: FederateId,
        service: Arc<Svc>,
        ctx: Arc<Ctx>,
        clock: Arc<FederateClock>,
        config: TimeAdvanceConfig,
    ) -> (Self, TimeAdvanceHandle) {
        let (signal, _) = watch::channel(LoopSignal::Running);
        let shared = Arc::new(LoopShared {
            id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
            federate,
            queue: RequestQueue::new(),
            clock,
            signal,
            next_seq: AtomicU64::new(0),
            service_calls: AtomicU64::new(0),
        });
        let handle = TimeAdvanceHandle {
            shared: Arc::clone(&shared),
        };
        let time_loop = Self {
            shared,
            service,
            ctx,
            config,
            service_guard: tokio::sync::Mutex::new(()),
        };
        (time_loop, handle)
    }

    /// Runs the loop on a context task.
    pub fn spawn(self) -> JoinHandle<()> {
        let ctx = Arc::clone(&self.ctx);
        let name = format!("time-advance-{}", self.shared.federate);
        ctx.spawn(&name, self.run())
    }

    /// Drains requests until told to finish (and the queue is empty) or
    /// terminated.
    pub async fn run(self) {
        let federate = self.shared.federate;
        let mut signal = self.shared.signal.subscribe();
        info!(%federate, mode = %self.config.mode, "Time advance loop started");

        while let Some(request) = self.next_request(&mut signal).await {
            let requested = request.requested_time();
            let current = self.shared.clock.current_time();

            let granted = if requested <= current {
                debug!(%federate, requested, current, "Granting request at current time");
                current
            } else {
                match self.advance_to(requested, &mut signal).await {
                    Some(time) => time,
                    None => break,
                }
            };

            let Some(release) = request.grant(granted) else {
                debug!(%federate, granted, "Worker dropped its ticket before the grant");
                continue;
            };

            tokio::select! {
                biased;
                _ = release => {}
                _ = terminated(&mut signal) => break,
            }
        }

        info!(%federate, time = self.shared.clock.current_time(), "Time advance loop exited");
    }

    async fn next_request(
        &self,
        signal: &mut watch::Receiver<LoopSignal>,
    ) -> Option<RendezvousRequest> {
        loop {
            let state = *signal.borrow_and_update();
            if state.is_terminated() {
                return None;
            }
            if let Some(request) = self.shared.queue.pop() {
                return Some(request);
            }
            if state == LoopSignal::Draining {
                return None;
            }

            tokio::select! {
                _ = self.shared.queue.notified() => {}
                changed = signal.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Obtains a grant for `time` from the service.
    ///
    /// Returns `None` if the loop was terminated while waiting.
    async fn advance_to(
        &self,
        time: LogicalTime,
        signal: &mut watch::Receiver<LoopSignal>,
    ) -> Option<LogicalTime> {
        let federate = self.shared.federate;
        let clock = &self.shared.clock;
        clock.begin_request();

        loop {
            if signal.borrow().is_terminated() {
                clock.abandon_request();
                return None;
            }

            let result = {
                let _guard = self.service_guard.lock().await;
                self.shared.service_calls.fetch_add(1, Ordering::Relaxed);
                self.service
                    .request_time_advance(federate, self.config.mode, time)
                    .await
            };

            match result {
                Ok(()) => break,
                Err(EnvError::TimeAlreadyPassed { requested, current }) => {
                    warn!(%federate, requested, current, "Time already passed; proceeding at current time");
                    clock.abandon_request();
                    return Some(clock.current_time());
                }
                Err(e) => {
                    warn!(%federate, time, error = %e, "Time advance request failed; retrying");
                    self.ctx.sleep(self.config.retry_delay).await;
                }
            }
        }

        while clock.is_grant_pending() {
            if signal.borrow().is_terminated() {
                clock.abandon_request();
                return None;
            }

            let ticked = {
                let _guard = self.service_guard.lock().await;
                self.service.tick(federate).await
            };
            if let Err(e) = ticked {
                debug!(%federate, error = %e, "Tick failed");
            }

            if clock.is_grant_pending() {
                self.ctx.sleep(self.config.poll_interval).await;
            }
        }

        Some(clock.current_time())
    }
}
