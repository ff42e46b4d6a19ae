//! Federation Manager - orchestrates a whole federation run.
//!
//! The manager is itself a federate: it joins the coordination service with
//! its own time-advance loop and drives the master stepping loop. Around the
//! loop it tracks membership, owns the federation-wide barriers, evaluates
//! the COA graph, sends scripted injections, and exposes the control surface
//! (start/pause/resume/terminate).
//!
//! # Run
//!
//! ```text
//! STARTING   join service ─► wait for expected federates
//!            ─► readyToPopulate ─► readyToRun
//! RUNNING    loop { grant(t) ─► [paused?] ─► injections + COA ─► submit(t+step) ─► release }
//! TERMINATING shutdown ─► SimEnd ─► readyToResign ─► resignations (bounded) ─► resign
//! TERMINATED
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use fedsync_env::{
    CoordinationService, FederateId, FederationContext, Interaction, LogicalTime, MessageLayer,
    TimeGrantListener,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::coa_executor::{CoaEffect, CoaExecutor, CoaStep, SIM_END};
use crate::coa_graph::CoaGraph;
use crate::coa_loader::load_experiment_graph;
use crate::config::{ExperimentConfig, FederationConfig, InjectedInteraction};
use crate::control::{ControlAction, StateChangeResponse};
use crate::error::FederationError;
use crate::lifecycle::FederationManagerState;
use crate::membership::{FederateInfo, FederateRegistry, FederationMembership, MembershipError};
use crate::sync_points::{SyncPoint, SyncPointRegistry};
use crate::time_advance::{FederateClock, TimeAdvanceHandle, TimeAdvanceLoop};

/// Seed extension of the COA random stream when no seed is configured.
const COA_RNG_STREAM: u64 = 0xC0A;

/// Seed extension used to derive the manager's own federate id.
const MANAGER_ID_STREAM: u64 = 0xFED;

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|requested| *requested).await;
}

async fn left_paused(state: &mut watch::Receiver<FederationManagerState>) {
    let _ = state
        .wait_for(|state| *state != FederationManagerState::Paused)
        .await;
}

/// Orchestrator of one federation.
///
/// Cheap to clone; every clone controls the same federation.
pub struct FederationManager<Svc, Ctx, Msg>
where
    Svc: CoordinationService,
    Ctx: FederationContext,
    Msg: MessageLayer,
{
    inner: Arc<ManagerInner<Svc, Ctx, Msg>>,
}

impl<Svc, Ctx, Msg> Clone for FederationManager<Svc, Ctx, Msg>
where
    Svc: CoordinationService,
    Ctx: FederationContext,
    Msg: MessageLayer,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ManagerInner<Svc, Ctx, Msg> {
    id: FederateId,
    config: FederationConfig,
    experiment: ExperimentConfig,
    service: Arc<Svc>,
    ctx: Arc<Ctx>,
    messages: Arc<Msg>,

    state: watch::Sender<FederationManagerState>,
    registry: Mutex<FederateRegistry>,

    /// Bumped on every join and resign
    membership_version: watch::Sender<u64>,
    sync_points: Arc<SyncPointRegistry>,

    coa: Mutex<Option<CoaExecutor>>,
    inbox: Mutex<Vec<Interaction>>,

    current_time: AtomicU64,
    steps: AtomicU64,
    clock: Arc<FederateClock>,
    time_loop: Mutex<Option<(TimeAdvanceHandle, JoinHandle<()>)>>,
    run_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn coa_rng<Ctx: FederationContext>(config: &FederationConfig, ctx: &Ctx) -> ChaCha8Rng {
    if config.seed != 0 {
        ChaCha8Rng::seed_from_u64(config.seed)
    } else {
        ctx.derive_rng(COA_RNG_STREAM)
    }
}

impl<Svc, Ctx, Msg> FederationManager<Svc, Ctx, Msg>
where
    Svc: CoordinationService,
    Ctx: FederationContext,
    Msg: MessageLayer,
{
    /// Creates a manager, loading the COA graph the experiment refers to.
    ///
    /// Fails on invalid configuration, an unusable log directory, or an
    /// invalid COA document.
    pub fn new(
        config: FederationConfig,
        experiment: ExperimentConfig,
        service: Arc<Svc>,
        ctx: Arc<Ctx>,
        messages: Arc<Msg>,
    ) -> Result<Self, FederationError> {
        let mut rng = coa_rng(&config, ctx.as_ref());
        let graph = load_experiment_graph(&experiment, &mut rng)?;
        Self::build(config, experiment, graph, rng, service, ctx, messages)
    }

    /// Creates a manager running an already built COA graph.
    pub fn with_coa(
        config: FederationConfig,
        experiment: ExperimentConfig,
        graph: CoaGraph,
        service: Arc<Svc>,
        ctx: Arc<Ctx>,
        messages: Arc<Msg>,
    ) -> Result<Self, FederationError> {
        let rng = coa_rng(&config, ctx.as_ref());
        Self::build(config, experiment, Some(graph), rng, service, ctx, messages)
    }

    fn build(
        config: FederationConfig,
        experiment: ExperimentConfig,
        graph: Option<CoaGraph>,
        rng: ChaCha8Rng,
        service: Arc<Svc>,
        ctx: Arc<Ctx>,
        messages: Arc<Msg>,
    ) -> Result<Self, FederationError> {
        config.validate()?;
        experiment.validate()?;
        if let Some(dir) = config.prepare_log_dir()? {
            info!(log_dir = %dir.display(), "Log directory ready");
        }

        let id = FederateId::from_seed(ctx.derive_rng(MANAGER_ID_STREAM).gen());
        let coa = graph.map(|graph| {
            info!(nodes = graph.len(), edges = graph.edges().len(), "COA attached");
            CoaExecutor::new(graph, rng, config.lookahead).with_source(id)
        });
        if coa.is_none() && experiment.terminate_on_coa_finish {
            warn!("terminateOnCOAFinish is set but no COA is configured; ignoring");
        }

        let (state, _) = watch::channel(FederationManagerState::Uninitialized);
        let (membership_version, _) = watch::channel(0);
        let (shutdown, _) = watch::channel(false);
        let registry = FederateRegistry::new(&experiment);

        info!(
            federation = %config.federation_name,
            manager = %id,
            expected = experiment.expected_federate_count(),
            step_size = config.step_size,
            lookahead = config.lookahead,
            end_time = config.federation_end_time,
            seed = config.seed,
            "Federation manager created"
        );

        Ok(Self {
            inner: Arc::new(ManagerInner {
                id,
                config,
                experiment,
                service,
                ctx,
                messages,
                state,
                registry: Mutex::new(registry),
                membership_version,
                sync_points: Arc::new(SyncPointRegistry::new()),
                coa: Mutex::new(coa),
                inbox: Mutex::new(Vec::new()),
                current_time: AtomicU64::new(0f64.to_bits()),
                steps: AtomicU64::new(0),
                clock: Arc::new(FederateClock::new(0.0)),
                time_loop: Mutex::new(None),
                run_task: Mutex::new(None),
                shutdown,
            }),
        })
    }

    pub fn id(&self) -> FederateId {
        self.inner.id
    }

    pub fn config(&self) -> &FederationConfig {
        &self.inner.config
    }

    pub fn experiment(&self) -> &ExperimentConfig {
        &self.inner.experiment
    }

    pub fn state(&self) -> FederationManagerState {
        self.inner.state()
    }

    /// Receiver observing every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<FederationManagerState> {
        self.inner.state.subscribe()
    }

    /// Membership callbacks for participants.
    pub fn membership(&self) -> Arc<dyn FederationMembership> {
        self.inner.clone()
    }

    pub fn sync_points(&self) -> Arc<SyncPointRegistry> {
        Arc::clone(&self.inner.sync_points)
    }

    /// Every federate that ever joined, online ones first.
    pub fn federates(&self) -> Vec<FederateInfo> {
        lock(&self.inner.registry).all()
    }

    pub fn expected_left_to_join(&self) -> usize {
        lock(&self.inner.registry).expected_left_to_join()
    }

    /// Federation time of the last granted step.
    pub fn current_time(&self) -> LogicalTime {
        self.inner.current_time()
    }

    pub fn steps_executed(&self) -> u64 {
        self.inner.steps.load(Ordering::Acquire)
    }

    pub fn barrier_releases(&self, point: SyncPoint) -> u32 {
        self.inner.sync_points.release_count(point)
    }

    /// True when a COA is attached and has finished.
    pub fn coa_finished(&self) -> bool {
        self.inner.coa_finished()
    }

    /// Hands an interaction received from the message layer to the COA.
    pub fn interaction_arrived(&self, interaction: Interaction) {
        self.inner.interaction_arrived(interaction);
    }

    /// Applies a control command.
    pub fn control(&self, action: ControlAction) -> StateChangeResponse {
        debug!(%action, "Control command received");
        self.set_state(action.target_state())
    }

    /// Requests a state change.
    ///
    /// Illegal targets are rejected without side effects. STARTING begins
    /// the run in the background; TERMINATING stops the stepping loop and
    /// winds the federation down in the background.
    pub fn set_state(&self, target: FederationManagerState) -> StateChangeResponse {
        let previous = match self.inner.transition(target) {
            Ok(previous) => previous,
            Err(rejected) => return rejected,
        };

        match target {
            FederationManagerState::Starting => {
                let mut run_task = lock(&self.inner.run_task);
                let inner = Arc::clone(&self.inner);
                *run_task = Some(self.inner.ctx.spawn("federation-run", inner.run()));
            }
            FederationManagerState::Terminating => {
                self.inner.request_shutdown();
                let mut run_task = lock(&self.inner.run_task);
                if run_task.is_none() {
                    let inner = Arc::clone(&self.inner);
                    *run_task = Some(self.inner.ctx.spawn("federation-wind-down", async move {
                        inner.wind_down().await;
                    }));
                }
            }
            _ => {}
        }

        StateChangeResponse::accepted(previous, target)
    }

    /// Waits until the federation reaches TERMINATED.
    pub async fn wait_terminated(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state
            .wait_for(|state| *state == FederationManagerState::Terminated)
            .await;
    }
}

impl<Svc, Ctx, Msg> ManagerInner<Svc, Ctx, Msg>
where
    Svc: CoordinationService,
    Ctx: FederationContext,
    Msg: MessageLayer,
{
    fn state(&self) -> FederationManagerState {
        *self.state.borrow()
    }

    fn current_time(&self) -> LogicalTime {
        LogicalTime::from_bits(self.current_time.load(Ordering::Acquire))
    }

    /// Atomically checks the transition table and applies `target`.
    fn transition(
        &self,
        target: FederationManagerState,
    ) -> Result<FederationManagerState, StateChangeResponse> {
        let mut previous = self.state();
        let changed = self.state.send_if_modified(|state| {
            previous = *state;
            if state.can_transition_to(target) {
                *state = target;
                true
            } else {
                false
            }
        });
        if changed {
            info!(from = %previous, to = %target, "Federation state changed");
            Ok(previous)
        } else {
            warn!(from = %previous, to = %target, "Rejected federation state change");
            Err(StateChangeResponse::rejected(previous, target))
        }
    }

    /// Applies `target` only while the state is still `expected`.
    fn transition_from(&self, expected: FederationManagerState, target: FederationManagerState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if *state == expected && state.can_transition_to(target) {
                *state = target;
                true
            } else {
                false
            }
        });
        if changed {
            info!(from = %expected, to = %target, "Federation state changed");
        }
        changed
    }

    fn coa_finished(&self) -> bool {
        lock(&self.coa).as_ref().is_some_and(CoaExecutor::is_finished)
    }

    fn interaction_arrived(&self, interaction: Interaction) {
        if interaction.source == Some(self.id) {
            return;
        }
        if self.experiment.monitored_interactions.contains(&interaction.name) {
            info!(interaction = %interaction.name, time = interaction.time, "Monitored interaction received");
        }
        lock(&self.inbox).push(interaction);
    }

    async fn emit(&self, interaction: Interaction) {
        let name = interaction.name.clone();
        let time = interaction.time;
        match self.messages.emit(interaction).await {
            Ok(()) => debug!(interaction = %name, time, "Interaction sent"),
            Err(err) => warn!(interaction = %name, time, error = %err, "Failed to send interaction"),
        }
    }

    async fn run(self: Arc<Self>) {
        match self.run_federation().await {
            Ok(()) => {}
            Err(FederationError::Terminated) => info!("Federation run interrupted by termination"),
            Err(err) => error!(error = %err, "Federation run failed"),
        }
        self.wind_down().await;
    }

    async fn run_federation(&self) -> Result<(), FederationError> {
        let handle = self.join_service().await?;
        self.wait_for_expected().await?;
        self.barrier(SyncPoint::ReadyToPopulate).await?;
        self.barrier(SyncPoint::ReadyToRun).await?;
        self.transition_from(FederationManagerState::Starting, FederationManagerState::Running);
        self.step_loop(&handle).await
    }

    async fn join_service(&self) -> Result<TimeAdvanceHandle, FederationError> {
        let listener: Arc<dyn TimeGrantListener> = self.clock.clone();
        let start = self
            .service
            .join(self.id, self.config.lookahead, listener)
            .await?;
        self.clock.reset(start);
        self.current_time.store(start.to_bits(), Ordering::Release);

        let (time_loop, handle) = TimeAdvanceLoop::new(
            self.id,
            Arc::clone(&self.service),
            Arc::clone(&self.ctx),
            Arc::clone(&self.clock),
            self.config.time_advance(),
        );
        let task = time_loop.spawn();
        *lock(&self.time_loop) = Some((handle.clone(), task));

        info!(manager = %self.id, start, "Federation manager joined");
        Ok(handle)
    }

    async fn wait_for_expected(&self) -> Result<(), FederationError> {
        let mut changes = self.membership_version.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let left = lock(&self.registry).expected_left_to_join();
            if left == 0 {
                info!("All expected federates joined");
                return Ok(());
            }
            info!(left, "Waiting for expected federates to join");
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => return Err(FederationError::Terminated),
                changed = changes.changed() => {
                    if changed.is_err() {
                        return Err(FederationError::Terminated);
                    }
                }
            }
        }
    }

    /// Registers `point` over the online expected federates plus the
    /// manager, arrives, and waits for the release.
    async fn barrier(&self, point: SyncPoint) -> Result<(), FederationError> {
        let mut required = lock(&self.registry).online_expected_ids();
        required.push(self.id);
        self.sync_points.register(point, required);
        self.sync_points.achieve(point, self.id);

        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => Err(FederationError::Terminated),
            released = self.sync_points.wait(point) => released,
        }
    }

    async fn step_loop(&self, handle: &TimeAdvanceHandle) -> Result<(), FederationError> {
        let step = self.config.step_size;
        let end_time = self.config.federation_end_time;
        let mut state = self.state.subscribe();
        let mut shutdown = self.shutdown.subscribe();

        let mut pause_times: Vec<LogicalTime> = self.experiment.pause_times.clone();
        pause_times.sort_by(|a, b| a.total_cmp(b));
        let mut pause_times = VecDeque::from(pause_times);

        let mut injections = self.experiment.injected_interactions.clone();
        injections.sort_by(|a, b| a.injection_time.total_cmp(&b.injection_time));
        let mut injections = VecDeque::from(injections);

        let mut time = handle.current_time();
        let mut pacing_origin = (self.ctx.now(), time);
        let mut ticket = handle.submit(time)?;

        info!(time, step, end_time, "Stepping loop started");
        loop {
            let granted = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => None,
                granted = ticket.await_grant() => Some(granted),
            };
            let Some(granted) = granted else {
                ticket.release_final();
                info!(time, "Stepping loop stopped by termination");
                return Ok(());
            };
            time = granted?;
            self.current_time.store(time.to_bits(), Ordering::Release);

            if self.state() == FederationManagerState::Paused {
                info!(time, "Federation paused");
                let resumed = tokio::select! {
                    biased;
                    _ = shutdown_requested(&mut shutdown) => false,
                    _ = left_paused(&mut state) => true,
                };
                if !resumed {
                    ticket.release_final();
                    info!(time, "Stepping loop stopped while paused");
                    return Ok(());
                }
                info!(time, state = %self.state(), "Federation resumed");
                pacing_origin = (self.ctx.now(), time);
            }

            if self.config.real_time_mode {
                self.pace(pacing_origin, time).await;
            }

            self.send_injections(&mut injections, time).await;

            let mut stop = false;
            if let Some(coa_step) = self.step_coa(time) {
                stop |= self.apply_coa_step(coa_step, time).await;
            }
            self.steps.fetch_add(1, Ordering::AcqRel);

            if pause_times.front().is_some_and(|&pause| time > pause) {
                let pause = pause_times.pop_front();
                if self.transition(FederationManagerState::Paused).is_ok() {
                    info!(pause_time = ?pause, time, "Pause time reached");
                }
            }

            if self.experiment.terminate_on_coa_finish && self.coa_finished() {
                info!(time, "COA finished; ending federation");
                stop = true;
            }

            let next = time + step;
            if end_time > 0.0 && next > end_time {
                info!(time, end_time, "Federation end time reached");
                stop = true;
            }

            if stop {
                ticket.release_final();
                return Ok(());
            }

            let next_ticket = handle.submit(next)?;
            if let Err(rejected) = ticket.release(&next_ticket) {
                return Err(rejected.reason.into());
            }
            ticket = next_ticket;
        }
    }

    /// Keeps logical time from running ahead of context time.
    async fn pace(&self, (origin_now, origin_time): (Duration, LogicalTime), time: LogicalTime) {
        let target = origin_now + Duration::from_secs_f64((time - origin_time).max(0.0));
        let now = self.ctx.now();
        if target > now {
            self.ctx.sleep(target - now).await;
        }
    }

    /// Sends the injections due in `[tmin, tmin + step)`; drops those that
    /// can no longer be sent.
    async fn send_injections(&self, pending: &mut VecDeque<InjectedInteraction>, time: LogicalTime) {
        let tmin = self.config.earliest_send_time(time);
        let tmax = tmin + self.config.step_size;

        while let Some(injection_time) = pending.front().map(|i| i.injection_time) {
            if injection_time >= tmax {
                break;
            }
            let Some(injection) = pending.pop_front() else {
                break;
            };
            if injection_time < tmin {
                error!(
                    interaction = %injection.interaction_name,
                    injection_time,
                    time,
                    "Missed injected interaction"
                );
                continue;
            }
            let interaction = Interaction::new(injection.interaction_name, injection_time)
                .with_parameters(injection.parameter_values)
                .from_federate(self.id);
            self.emit(interaction).await;
        }
    }

    fn step_coa(&self, time: LogicalTime) -> Option<CoaStep> {
        let arrivals = std::mem::take(&mut *lock(&self.inbox));
        let mut coa = lock(&self.coa);
        let executor = coa.as_mut()?;
        for arrival in arrivals {
            executor.record_arrival(arrival);
        }
        Some(executor.step(time))
    }

    /// Dispatches the effects of a COA step; returns true when the COA asked
    /// for the simulation to end.
    async fn apply_coa_step(&self, coa_step: CoaStep, time: LogicalTime) -> bool {
        let mut terminate = false;
        for effect in coa_step.effects {
            match effect {
                CoaEffect::Emit(interaction) => self.emit(interaction).await,
                CoaEffect::CoaFinished => info!(time, "COA finished"),
                CoaEffect::TerminateSimulation => {
                    info!(time, "COA requested termination");
                    terminate = true;
                }
            }
        }
        terminate
    }

    /// Stops the stepping loop, cancels startup barrier waits and tells
    /// every participant to stop its time-advance loop.
    fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
        self.sync_points.shut_down();
    }

    /// Brings the federation from wherever it is to TERMINATED.
    async fn wind_down(&self) {
        if !self.state().is_shutting_down() {
            let _ = self.transition(FederationManagerState::Terminating);
        }
        self.request_shutdown();

        let time = self.current_time();
        let sim_end = Interaction::new(SIM_END, self.config.earliest_send_time(time)).from_federate(self.id);
        self.emit(sim_end).await;

        let online = lock(&self.registry).online_ids();
        let barrier = !online.is_empty();
        if barrier {
            self.sync_points.register(SyncPoint::ReadyToResign, online);
        }

        let timeout = self.config.resign_timeout();
        let resigned = tokio::select! {
            _ = self.await_resignations(barrier) => true,
            _ = self.ctx.sleep(timeout) => false,
        };
        if !resigned {
            let still_online: Vec<String> = lock(&self.registry)
                .online_ids()
                .iter()
                .map(ToString::to_string)
                .collect();
            warn!(?timeout, ?still_online, "Timed out waiting for federates to resign");
        }

        let own_loop = lock(&self.time_loop).take();
        if let Some((handle, task)) = own_loop {
            handle.terminate();
            if let Err(err) = task.await {
                warn!(error = %err, "Manager time advance loop failed");
            }
            if let Err(err) = self.service.resign(self.id).await {
                warn!(error = %err, "Manager resign failed");
            }
        }

        let _ = self.transition(FederationManagerState::Terminated);
        info!(
            time,
            steps = self.steps.load(Ordering::Acquire),
            "Federation terminated"
        );
    }

    async fn await_resignations(&self, barrier: bool) {
        if barrier && self.sync_points.wait(SyncPoint::ReadyToResign).await.is_err() {
            return;
        }
        let mut changes = self.membership_version.subscribe();
        loop {
            if lock(&self.registry).online().is_empty() {
                return;
            }
            if changes.changed().await.is_err() {
                return;
            }
        }
    }
}

impl<Svc, Ctx, Msg> FederationMembership for ManagerInner<Svc, Ctx, Msg>
where
    Svc: CoordinationService,
    Ctx: FederationContext,
    Msg: MessageLayer,
{
    fn federate_joined(&self, info: FederateInfo) -> Result<(), MembershipError> {
        if self.state().is_shutting_down() {
            return Err(MembershipError::ShuttingDown);
        }
        lock(&self.registry).federate_joined(info)?;
        self.membership_version.send_modify(|version| *version += 1);
        Ok(())
    }

    fn federate_resigned(&self, federate: FederateId) -> Result<(), MembershipError> {
        let result = lock(&self.registry)
            .federate_resigned(federate, self.ctx.system_time())
            .map(|_| ());
        self.sync_points.withdraw(federate);
        self.membership_version.send_modify(|version| *version += 1);
        result
    }

    fn sync_points(&self) -> Arc<SyncPointRegistry> {
        Arc::clone(&self.sync_points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coa_graph::NodeSpec;
    use crate::config::FederateTypeCount;
    use crate::federate::{FederateSettings, SynchronizedFederate};
    use crate::lifecycle::FederateState;
    use crate::rendezvous::SyncError;
    use async_trait::async_trait;
    use fedsync_env::{EnvError, TimeAdvanceMode, TokioContext};
    use std::collections::{BTreeMap, HashMap};

    /// Grants every request on the next tick.
    #[derive(Default)]
    struct InstantGrants {
        federates: Mutex<HashMap<FederateId, (Arc<dyn TimeGrantListener>, Option<LogicalTime>)>>,
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

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Interaction>>,
    }

    impl Recorder {
        fn names(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|i| i.name.clone()).collect()
        }
    }

    #[async_trait]
    impl MessageLayer for Recorder {
        async fn emit(&self, interaction: Interaction) -> Result<(), EnvError> {
            self.sent.lock().unwrap().push(interaction);
            Ok(())
        }
    }

    type TestManager = FederationManager<InstantGrants, TokioContext, Recorder>;

    fn config(end_time: LogicalTime) -> FederationConfig {
        FederationConfig {
            federation_end_time: end_time,
            seed: 99,
            ..FederationConfig::default()
        }
    }

    fn manager(config: FederationConfig, experiment: ExperimentConfig) -> (TestManager, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let manager = FederationManager::new(
            config,
            experiment,
            Arc::new(InstantGrants::default()),
            TokioContext::shared(),
            Arc::clone(&recorder),
        )
        .unwrap();
        (manager, recorder)
    }

    async fn wait_for_state(manager: &TestManager, target: FederationManagerState) {
        let mut state = manager.subscribe_state();
        state.wait_for(|state| *state == target).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_illegal_command_is_rejected_without_side_effects() {
        let (manager, _) = manager(config(0.0), ExperimentConfig::default());

        let response = manager.control(ControlAction::Pause);
        assert!(!response.is_accepted());
        assert_eq!(response.previous_state, FederationManagerState::Uninitialized);
        assert_eq!(response.new_state, FederationManagerState::Uninitialized);
        assert_eq!(
            response.message.as_deref(),
            Some("cannot transition from UNINITIALIZED to PAUSED")
        );
        assert_eq!(manager.state(), FederationManagerState::Uninitialized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_until_end_time() {
        let (manager, recorder) = manager(config(3.0), ExperimentConfig::default());

        let response = manager.control(ControlAction::Start);
        assert_eq!(response, StateChangeResponse::accepted(FederationManagerState::Uninitialized, FederationManagerState::Starting));
        manager.wait_terminated().await;

        assert_eq!(manager.steps_executed(), 4);
        assert_eq!(manager.current_time(), 3.0);
        assert_eq!(manager.barrier_releases(SyncPoint::ReadyToPopulate), 1);
        assert_eq!(manager.barrier_releases(SyncPoint::ReadyToRun), 1);
        assert_eq!(recorder.names(), vec![SIM_END.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_resume_and_start_from_paused() {
        let (manager, _) = manager(config(0.0), ExperimentConfig::default());

        manager.control(ControlAction::Start);
        wait_for_state(&manager, FederationManagerState::Running).await;

        let paused = manager.control(ControlAction::Pause);
        assert!(paused.is_accepted());
        assert_eq!(paused.new_state, FederationManagerState::Paused);

        let restart = manager.control(ControlAction::Start);
        assert!(!restart.is_accepted());
        assert_eq!(restart.new_state, FederationManagerState::Paused);
        assert_eq!(manager.state(), FederationManagerState::Paused);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let frozen = manager.steps_executed();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(manager.steps_executed(), frozen);

        let resumed = manager.control(ControlAction::Resume);
        assert_eq!(resumed.new_state, FederationManagerState::Resumed);
        while manager.steps_executed() <= frozen {
            tokio::task::yield_now().await;
        }

        assert!(manager.control(ControlAction::Terminate).is_accepted());
        manager.wait_terminated().await;
        assert_eq!(manager.state(), FederationManagerState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_before_start_winds_down() {
        let (manager, recorder) = manager(config(0.0), ExperimentConfig::default());
        assert!(manager.control(ControlAction::Terminate).is_accepted());
        manager.wait_terminated().await;
        assert_eq!(manager.steps_executed(), 0);
        assert_eq!(recorder.names(), vec![SIM_END.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_time_pauses_federation() {
        let experiment = ExperimentConfig {
            pause_times: vec![1.5],
            ..ExperimentConfig::default()
        };
        let (manager, _) = manager(config(10.0), experiment);

        manager.control(ControlAction::Start);
        wait_for_state(&manager, FederationManagerState::Paused).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(manager.steps_executed(), 3);
        assert_eq!(manager.state(), FederationManagerState::Paused);

        manager.control(ControlAction::Resume);
        manager.wait_terminated().await;
        assert_eq!(manager.current_time(), 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_injections_sent_at_their_time() {
        let experiment = ExperimentConfig {
            injected_interactions: vec![
                InjectedInteraction {
                    injection_time: 2.0,
                    interaction_name: "Fault".to_string(),
                    parameter_values: BTreeMap::from([("severity".to_string(), "high".to_string())]),
                },
                InjectedInteraction {
                    injection_time: 40.0,
                    interaction_name: "TooLate".to_string(),
                    parameter_values: BTreeMap::new(),
                },
            ],
            ..ExperimentConfig::default()
        };
        let (manager, recorder) = manager(config(4.0), experiment);

        manager.control(ControlAction::Start);
        manager.wait_terminated().await;

        let sent = recorder.sent.lock().unwrap().clone();
        let fault = sent.iter().find(|i| i.name == "Fault").unwrap();
        assert_eq!(fault.time, 2.0);
        assert_eq!(fault.parameters.get("severity").map(String::as_str), Some("high"));
        assert!(sent.iter().all(|i| i.name != "TooLate"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_coa_termination_ends_federation() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut builder = CoaGraph::builder();
        builder.add_node("wait", "wait", NodeSpec::Duration { duration: 2.0 }, &mut rng).unwrap();
        builder.add_node("ping", "ping", NodeSpec::action("Ping"), &mut rng).unwrap();
        builder.add_node("end", "end", NodeSpec::TerminateCoa, &mut rng).unwrap();
        builder.add_edge(crate::coa_graph::EdgeSpec::flow("e1", "wait", "ping")).unwrap();
        builder.add_edge(crate::coa_graph::EdgeSpec::flow("e2", "ping", "end")).unwrap();

        let experiment = ExperimentConfig {
            terminate_on_coa_finish: true,
            ..ExperimentConfig::default()
        };
        let recorder = Arc::new(Recorder::default());
        let manager: TestManager = FederationManager::with_coa(
            config(0.0),
            experiment,
            builder.build(),
            Arc::new(InstantGrants::default()),
            TokioContext::shared(),
            Arc::clone(&recorder),
        )
        .unwrap();

        manager.control(ControlAction::Start);
        manager.wait_terminated().await;

        assert!(manager.coa_finished());
        assert_eq!(manager.current_time(), 2.0);
        assert_eq!(recorder.names(), vec!["Ping".to_string(), SIM_END.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_federate_joins_steps_and_resigns() {
        let experiment = ExperimentConfig {
            expected_federates: vec![FederateTypeCount::new("Echo", 1)],
            ..ExperimentConfig::default()
        };
        let service = Arc::new(InstantGrants::default());
        let ctx = TokioContext::shared();
        let recorder = Arc::new(Recorder::default());
        // Far enough out that the federate resigns before the shutdown
        let manager: TestManager = FederationManager::new(
            config(20.0),
            experiment,
            Arc::clone(&service),
            Arc::clone(&ctx),
            recorder,
        )
        .unwrap();
        manager.control(ControlAction::Start);

        let settings = FederateSettings {
            federate_type: "Echo".to_string(),
            ..FederateSettings::default()
        };
        let mut federate =
            SynchronizedFederate::new(FederateId::from_seed(7), settings, service, ctx, manager.membership());
        federate.join().await.unwrap();
        federate.ready_to_populate().await.unwrap();
        federate.ready_to_run().await.unwrap();
        assert_eq!(federate.state(), FederateState::Running);

        let mut ticket = federate.request_advance(0.0).unwrap();
        for step in 1..=2 {
            ticket.await_grant().await.unwrap();
            let next = federate.request_advance(f64::from(step)).unwrap();
            ticket.release(&next).unwrap();
            ticket = next;
        }
        assert_eq!(ticket.await_grant().await, Ok(2.0));
        ticket.release_final();

        federate.resign().await.unwrap();
        assert_eq!(federate.state(), FederateState::Resigned);
        manager.wait_terminated().await;

        assert_eq!(manager.barrier_releases(SyncPoint::ReadyToPopulate), 1);
        assert_eq!(manager.barrier_releases(SyncPoint::ReadyToRun), 1);
        let federates = manager.federates();
        assert_eq!(federates.len(), 1);
        assert!(federates[0].resigned_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_stops_participant_loop_without_sim_end() {
        let experiment = ExperimentConfig {
            expected_federates: vec![FederateTypeCount::new("Echo", 1)],
            ..ExperimentConfig::default()
        };
        let service = Arc::new(InstantGrants::default());
        let ctx = TokioContext::shared();
        let manager: TestManager = FederationManager::new(
            config(1000.0),
            experiment,
            Arc::clone(&service),
            Arc::clone(&ctx),
            Arc::new(Recorder::default()),
        )
        .unwrap();
        manager.control(ControlAction::Start);

        let settings = FederateSettings {
            federate_type: "Echo".to_string(),
            ..FederateSettings::default()
        };
        let mut federate =
            SynchronizedFederate::new(FederateId::from_seed(8), settings, service, ctx, manager.membership());
        federate.join().await.unwrap();
        federate.ready_to_populate().await.unwrap();
        federate.ready_to_run().await.unwrap();

        // Holds its first grant and never listens for SimEnd
        let mut ticket = federate.request_advance(0.0).unwrap();
        assert_eq!(ticket.await_grant().await, Ok(0.0));
        let mut next = federate.request_advance(1.0).unwrap();

        assert!(manager.control(ControlAction::Terminate).is_accepted());
        assert_eq!(next.await_grant().await, Err(SyncError::Terminated));
        assert!(federate.time_handle().unwrap().signal().is_terminated());
        assert!(federate.request_advance(2.0).is_err_and(|err| err.is_shutdown()));

        ticket.release_final();
        federate.resign().await.unwrap();
        manager.wait_terminated().await;
        assert!(manager.federates()[0].resigned_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_cancels_participant_barrier_wait() {
        let experiment = ExperimentConfig {
            expected_federates: vec![FederateTypeCount::new("Echo", 2)],
            ..ExperimentConfig::default()
        };
        let service = Arc::new(InstantGrants::default());
        let ctx = TokioContext::shared();
        let manager: TestManager = FederationManager::new(
            config(10.0),
            experiment,
            Arc::clone(&service),
            Arc::clone(&ctx),
            Arc::new(Recorder::default()),
        )
        .unwrap();

        let settings = FederateSettings {
            federate_type: "Echo".to_string(),
            ..FederateSettings::default()
        };
        let mut federate =
            SynchronizedFederate::new(FederateId::from_seed(9), settings, service, ctx, manager.membership());
        federate.join().await.unwrap();
        manager.control(ControlAction::Start);

        {
            // The second expected federate never shows up
            let waiting = federate.ready_to_populate();
            tokio::pin!(waiting);
            assert!(tokio::time::timeout(Duration::from_secs(1), &mut waiting).await.is_err());

            assert!(manager.control(ControlAction::Terminate).is_accepted());
            assert!(matches!(waiting.await, Err(FederationError::Terminated)));
        }

        federate.resign().await.unwrap();
        manager.wait_terminated().await;
        assert_eq!(manager.state(), FederationManagerState::Terminated);
        assert_eq!(manager.barrier_releases(SyncPoint::ReadyToPopulate), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disallowed_type_is_refused() {
        let experiment = ExperimentConfig {
            federate_types_allowed: vec!["Echo".to_string()],
            ..ExperimentConfig::default()
        };
        let (manager, _) = manager(config(0.0), experiment);
        let refused = manager
            .membership()
            .federate_joined(FederateInfo::new(FederateId::from_seed(3), "Radar", false));
        assert_eq!(refused, Err(MembershipError::TypeNotAllowed("Radar".to_string())));
    }
}
