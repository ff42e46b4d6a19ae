//! SimFederation - the in-process federation container.

use crate::context::SimContext;
use crate::coordinator::SimCoordinator;
use crate::message_bus::SimMessageBus;
use crate::participant::{EchoFederate, ParticipantReport};

use fedsync_core::{
    CoaGraph, ExperimentConfig, FederateSettings, FederationConfig, FederationError,
    FederationManager,
};
use fedsync_env::{FederateId, FederationContext};
use rand::Rng;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Manager type of a simulated federation.
pub type SimManager = FederationManager<SimCoordinator, SimContext, SimMessageBus>;

/// Seed extension of the participant id stream.
const PARTICIPANT_ID_STREAM: u64 = 0x5EED;

/// A whole federation in one process: coordinator, message bus, manager
/// and any number of echo participants.
///
/// Must be created inside a Tokio runtime; a paused runtime makes the run
/// reproducible from its seed.
pub struct SimFederation {
    /// Shared simulation context (virtual clock)
    pub context: Arc<SimContext>,

    /// Shared time management
    pub coordinator: Arc<SimCoordinator>,

    /// Shared message layer
    pub bus: Arc<SimMessageBus>,

    manager: SimManager,
    participants: Vec<JoinHandle<ParticipantReport>>,
    forwarder: JoinHandle<()>,
    spawned: u64,
}

impl SimFederation {
    /// Creates a federation whose manager loads the experiment's COA.
    pub fn new(
        seed: u64,
        config: FederationConfig,
        experiment: ExperimentConfig,
    ) -> Result<Self, FederationError> {
        let context = SimContext::shared(seed);
        let coordinator = SimCoordinator::shared();
        let bus = SimMessageBus::shared();
        let manager = FederationManager::new(
            config,
            experiment,
            Arc::clone(&coordinator),
            Arc::clone(&context),
            Arc::clone(&bus),
        )?;
        Ok(Self::assemble(context, coordinator, bus, manager))
    }

    /// Creates a federation running an already built COA graph.
    pub fn with_coa(
        seed: u64,
        config: FederationConfig,
        experiment: ExperimentConfig,
        graph: CoaGraph,
    ) -> Result<Self, FederationError> {
        let context = SimContext::shared(seed);
        let coordinator = SimCoordinator::shared();
        let bus = SimMessageBus::shared();
        let manager = FederationManager::with_coa(
            config,
            experiment,
            graph,
            Arc::clone(&coordinator),
            Arc::clone(&context),
            Arc::clone(&bus),
        )?;
        Ok(Self::assemble(context, coordinator, bus, manager))
    }

    fn assemble(
        context: Arc<SimContext>,
        coordinator: Arc<SimCoordinator>,
        bus: Arc<SimMessageBus>,
        manager: SimManager,
    ) -> Self {
        // Everything on the bus also reaches the manager's COA
        let mut rx = bus.subscribe();
        let sink = manager.clone();
        let forwarder = context.spawn("interaction-forwarder", async move {
            loop {
                match rx.recv().await {
                    Ok(interaction) => sink.interaction_arrived(interaction),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Manager fell behind the message bus");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Self {
            context,
            coordinator,
            bus,
            manager,
            participants: Vec::new(),
            forwarder,
            spawned: 0,
        }
    }

    pub fn manager(&self) -> &SimManager {
        &self.manager
    }

    /// Starts an echo participant of `federate_type` and returns its id.
    ///
    /// Lookahead, step size and time-advance settings follow the
    /// federation configuration.
    pub fn spawn_participant(&mut self, federate_type: &str, late_joiner: bool) -> FederateId {
        let id = FederateId::from_seed(
            self.context
                .derive_rng(PARTICIPANT_ID_STREAM.wrapping_add(self.spawned))
                .gen(),
        );
        self.spawned += 1;

        let config = self.manager.config();
        let settings = FederateSettings {
            federate_type: federate_type.to_string(),
            lookahead: config.lookahead,
            step_size: config.step_size,
            late_joiner,
            time_advance: config.time_advance(),
        };
        let participant = EchoFederate::new(
            id,
            settings,
            Arc::clone(&self.coordinator),
            Arc::clone(&self.context),
            Arc::clone(&self.bus),
            self.manager.membership(),
        );
        debug!(federate = %id, federate_type, late_joiner, "Spawning participant");
        self.participants.push(tokio::spawn(participant.run()));
        id
    }

    /// Starts one participant per expected federate slot.
    pub fn spawn_expected(&mut self) -> Vec<FederateId> {
        let expected: Vec<(String, usize)> = self
            .manager
            .experiment()
            .expected_federates
            .iter()
            .map(|e| (e.federate_type.clone(), e.count))
            .collect();
        expected
            .into_iter()
            .flat_map(|(federate_type, count)| std::iter::repeat(federate_type).take(count))
            .map(|federate_type| self.spawn_participant(&federate_type, false))
            .collect()
    }

    /// Waits for the federation to terminate and collects every
    /// participant's report.
    pub async fn finish(self) -> Vec<ParticipantReport> {
        self.manager.wait_terminated().await;

        let mut reports = Vec::with_capacity(self.participants.len());
        for participant in self.participants {
            match participant.await {
                Ok(report) => reports.push(report),
                Err(err) => warn!(error = %err, "Participant task failed"),
            }
        }
        self.forwarder.abort();

        info!(
            participants = reports.len(),
            grants = self.coordinator.grants(),
            interactions = self.bus.history().len(),
            "Simulated federation finished"
        );
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedsync_core::{ControlAction, FederateState, FederateTypeCount, SyncPoint, SIM_END};

    fn lockstep_config(end_time: f64) -> FederationConfig {
        FederationConfig {
            federation_name: "world-test".to_string(),
            federation_end_time: end_time,
            seed: 5,
            ..FederationConfig::default()
        }
    }

    fn echo_experiment(count: usize) -> ExperimentConfig {
        ExperimentConfig {
            expected_federates: vec![FederateTypeCount::new("Echo", count)],
            ..ExperimentConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_participants_step_to_end_time() {
        let mut world = SimFederation::new(7, lockstep_config(4.0), echo_experiment(2)).unwrap();
        let ids = world.spawn_expected();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);

        world.manager().control(ControlAction::Start);
        let manager = world.manager().clone();
        let bus = Arc::clone(&world.bus);
        let coordinator = Arc::clone(&world.coordinator);
        let reports = world.finish().await;

        assert_eq!(manager.steps_executed(), 5);
        assert_eq!(manager.current_time(), 4.0);
        assert_eq!(manager.barrier_releases(SyncPoint::ReadyToPopulate), 1);
        assert_eq!(manager.barrier_releases(SyncPoint::ReadyToRun), 1);
        assert_eq!(manager.barrier_releases(SyncPoint::ReadyToResign), 1);
        assert_eq!(bus.sent(SIM_END).len(), 1);
        assert_eq!(coordinator.joined(), 0);

        assert_eq!(reports.len(), 2);
        for report in reports {
            assert_eq!(report.final_state, FederateState::Resigned);
            assert_eq!(report.final_time, 4.0);
            assert!(report.steps >= 4);
            assert!(report.error.is_none());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_participant_ids_follow_seed() {
        let mut a = SimFederation::new(11, lockstep_config(1.0), echo_experiment(1)).unwrap();
        let mut b = SimFederation::new(11, lockstep_config(1.0), echo_experiment(1)).unwrap();
        assert_eq!(a.spawn_expected(), b.spawn_expected());
        assert_eq!(a.manager().id(), b.manager().id());

        a.manager().control(ControlAction::Terminate);
        b.manager().control(ControlAction::Terminate);
        a.finish().await;
        b.finish().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_demo_configuration_runs_to_coa_finish() {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../demos/federation.json");
        let config = FederationConfig::from_file(&path).unwrap();
        let experiment = config.load_experiment().unwrap();
        assert_eq!(experiment.expected_federate_count(), 2);

        let mut world = SimFederation::new(config.seed, config, experiment).unwrap();
        world.spawn_expected();
        world.spawn_participant("Observer", true);
        world.manager().control(ControlAction::Start);

        let manager = world.manager().clone();
        let bus = Arc::clone(&world.bus);
        let reports = world.finish().await;

        assert!(manager.coa_finished());
        assert!(manager.current_time() < 30.0);
        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(|r| r.final_state == FederateState::Resigned));
        assert!(bus.sent("Ping").iter().any(|p| p.parameters.get("origin").map(String::as_str) == Some("script")));
        assert!(!bus.sent("Echo").is_empty());
    }
}
