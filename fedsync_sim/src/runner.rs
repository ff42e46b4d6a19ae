//! Scenario runner - executes federation scenarios on a paused runtime.

use crate::participant::{ParticipantReport, ECHO, PING};
use crate::scenarios::ScenarioId;
use crate::world::{SimFederation, SimManager};

use fedsync_core::coa_loader::load_graph;
use fedsync_core::{
    CoaError, CoaGraph, ControlAction, EdgeSpec, ExperimentConfig, FederateState, FederateTypeCount,
    FederationConfig, FederationError, FederationManagerState, NodeSpec, SyncPoint, SIM_END,
};
use fedsync_env::{FederationContext, LogicalTime};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Verdict of one scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// True when no check failed
    pub passed: bool,

    /// Steps executed by the manager
    pub total_steps: u64,

    /// Final federation time
    pub final_time: LogicalTime,

    /// Every failed check, joined
    pub failure_reason: Option<String>,

    /// Counters gathered from the coordinator, bus and participants
    pub metrics: ScenarioMetrics,
}

/// Traffic observed during one scenario.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    /// Participants that ran
    pub participants: usize,

    /// Interactions delivered by the bus
    pub interactions_sent: usize,

    /// Grants delivered by the coordinator
    pub grants: u64,

    /// Echo replies sent by participants
    pub echoes: u64,
}

/// Assertions gathered while a scenario runs.
#[derive(Debug, Default)]
struct Checks {
    failures: Vec<String>,
}

impl Checks {
    fn check(&mut self, ok: bool, what: impl FnOnce() -> String) {
        if !ok {
            let failure = what();
            warn!(%failure, "Scenario check failed");
            self.failures.push(failure);
        }
    }

    fn check_eq<T: PartialEq + std::fmt::Debug>(&mut self, what: &str, actual: T, expected: T) {
        self.check(actual == expected, || {
            format!("{}: expected {:?}, got {:?}", what, expected, actual)
        });
    }
}

/// What one scenario observed.
#[derive(Debug, Default)]
struct Outcome {
    steps: u64,
    final_time: LogicalTime,
    metrics: ScenarioMetrics,
    checks: Checks,
}

/// Runs federation scenarios.
pub struct ScenarioRunner {
    /// Seed of every federation the runner builds
    seed: u64,

    /// Virtual time after which a scenario counts as hung
    time_limit: Duration,
}

impl ScenarioRunner {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            time_limit: Duration::from_secs(3600),
        }
    }

    /// Sets the virtual time limit.
    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = limit;
        self
    }

    /// Runs a scenario on its own paused runtime and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build();
        match runtime {
            Ok(runtime) => runtime.block_on(self.run_async(scenario)),
            Err(err) => self.failed(scenario, format!("runtime: {}", err)),
        }
    }

    /// Runs a scenario on the current runtime.
    pub async fn run_async(&self, scenario: ScenarioId) -> ScenarioResult {
        info!(scenario = scenario.name(), seed = self.seed, "Running scenario");
        debug!(description = scenario.description());

        match tokio::time::timeout(self.time_limit, self.dispatch(scenario)).await {
            Ok(Ok(outcome)) => {
                let passed = outcome.checks.failures.is_empty();
                ScenarioResult {
                    scenario,
                    seed: self.seed,
                    passed,
                    total_steps: outcome.steps,
                    final_time: outcome.final_time,
                    failure_reason: (!passed).then(|| outcome.checks.failures.join("; ")),
                    metrics: outcome.metrics,
                }
            }
            Ok(Err(err)) => self.failed(scenario, err.to_string()),
            Err(_) => self.failed(scenario, format!("no termination within {:?}", self.time_limit)),
        }
    }

    async fn dispatch(&self, scenario: ScenarioId) -> Result<Outcome, FederationError> {
        match scenario {
            ScenarioId::Lockstep => self.run_lockstep().await,
            ScenarioId::ProbabilisticBranching => self.run_probabilistic_branching().await,
            ScenarioId::LateJoiner => self.run_late_joiner().await,
            ScenarioId::PauseResume => self.run_pause_resume().await,
            ScenarioId::CoaTermination => self.run_coa_termination().await,
            ScenarioId::FlakyService => self.run_flaky_service().await,
        }
    }

    fn failed(&self, scenario: ScenarioId, reason: String) -> ScenarioResult {
        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: false,
            total_steps: 0,
            final_time: 0.0,
            failure_reason: Some(reason),
            metrics: ScenarioMetrics::default(),
        }
    }

    fn config(&self, end_time: LogicalTime) -> FederationConfig {
        FederationConfig {
            federation_name: "fedsync-sim".to_string(),
            federation_end_time: end_time,
            seed: self.seed,
            ..FederationConfig::default()
        }
    }

    /// FED-001: Lockstep - two echo federates reach the end time together.
    async fn run_lockstep(&self) -> Result<Outcome, FederationError> {
        let end_time = 5.0;
        let mut world = SimFederation::new(self.seed, self.config(end_time), echo_experiment(2))?;
        world.spawn_expected();
        world.manager().control(ControlAction::Start);

        let (mut outcome, reports) = observe(world).await;
        check_completed(&mut outcome.checks, &reports, end_time);
        outcome.checks.check_eq("steps", outcome.steps, 6);
        outcome.checks.check_eq("final time", outcome.final_time, end_time);
        Ok(outcome)
    }

    /// FED-002: ProbabilisticBranching - a 30/70 choice takes exactly one
    /// branch, the same one for the same seed.
    async fn run_probabilistic_branching(&self) -> Result<Outcome, FederationError> {
        let (mut outcome, branch) = self.branching_run().await?;
        let (_, replay) = self.branching_run().await?;

        outcome.checks.check(branch.len() == 1, || format!("expected one branch, took {:?}", branch));
        outcome.checks.check_eq("replayed branch", replay, branch);
        Ok(outcome)
    }

    async fn branching_run(&self) -> Result<(Outcome, Vec<String>), FederationError> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let graph = load_graph(BRANCHING_COA, None, &mut rng)?;
        let experiment = ExperimentConfig {
            terminate_on_coa_finish: true,
            ..echo_experiment(1)
        };
        let mut world = SimFederation::with_coa(self.seed, self.config(10.0), experiment, graph)?;
        world.spawn_expected();
        world.manager().control(ControlAction::Start);

        let manager = world.manager().clone();
        let bus = Arc::clone(&world.bus);
        let (mut outcome, reports) = observe(world).await;
        check_completed(&mut outcome.checks, &reports, outcome.final_time);
        outcome.checks.check(manager.coa_finished(), || "COA did not finish".to_string());

        let branch: Vec<String> = bus
            .history()
            .into_iter()
            .map(|i| i.name)
            .filter(|name| name == "Left" || name == "Right")
            .collect();
        Ok((outcome, branch))
    }

    /// FED-003: LateJoiner - joins at federation time once the run is under
    /// way, without touching the startup barriers.
    async fn run_late_joiner(&self) -> Result<Outcome, FederationError> {
        let end_time = 8.0;
        let experiment = ExperimentConfig {
            late_joiner_federates: vec![FederateTypeCount::new("Observer", 1)],
            ..echo_experiment(1)
        };
        let mut world = SimFederation::new(self.seed, self.config(end_time), experiment)?;
        world.spawn_expected();
        world.manager().control(ControlAction::Start);

        while world.manager().current_time() < 3.0 && !world.manager().state().is_shutting_down() {
            world.context.sleep(Duration::from_millis(1)).await;
        }
        let late = world.spawn_participant("Observer", true);
        let manager = world.manager().clone();

        let (mut outcome, reports) = observe(world).await;
        check_completed(&mut outcome.checks, &reports, end_time);
        outcome.checks.check_eq("reports", reports.len(), 2);
        outcome.checks.check_eq("expected left to join", manager.expected_left_to_join(), 0);

        let joined_late = manager
            .federates()
            .into_iter()
            .any(|info| info.id == late && info.late_joiner);
        outcome.checks.check(joined_late, || "late joiner not registered as late".to_string());
        let late_report = reports.iter().find(|r| r.id == late);
        outcome.checks.check(late_report.is_some_and(|r| r.steps > 0), || {
            "late joiner never stepped".to_string()
        });
        Ok(outcome)
    }

    /// FED-004: PauseResume - stepping stops at the pause time and continues
    /// only after RESUME.
    async fn run_pause_resume(&self) -> Result<Outcome, FederationError> {
        let end_time = 6.0;
        let experiment = ExperimentConfig {
            pause_times: vec![2.5],
            ..echo_experiment(1)
        };
        let mut world = SimFederation::new(self.seed, self.config(end_time), experiment)?;
        world.spawn_expected();
        world.manager().control(ControlAction::Start);
        let manager = world.manager().clone();

        let mut state = manager.subscribe_state();
        let paused = state
            .wait_for(|s| *s == FederationManagerState::Paused || s.is_shutting_down())
            .await
            .map(|s| *s == FederationManagerState::Paused)
            .unwrap_or(false);

        let mut checks = Checks::default();
        checks.check(paused, || "federation never paused".to_string());
        world.context.sleep(Duration::from_secs(1)).await;
        let frozen = manager.steps_executed();
        world.context.sleep(Duration::from_secs(2)).await;
        checks.check_eq("steps while paused", manager.steps_executed(), frozen);

        let restart = manager.control(ControlAction::Start);
        checks.check(!restart.is_accepted(), || "START accepted while paused".to_string());
        let resume = manager.control(ControlAction::Resume);
        checks.check_eq("state after resume", resume.new_state, FederationManagerState::Resumed);

        let (mut outcome, reports) = observe(world).await;
        check_completed(&mut outcome.checks, &reports, end_time);
        outcome.checks.failures.extend(checks.failures);
        outcome.checks.check_eq("steps", outcome.steps, 7);
        outcome.checks.check_eq("final time", outcome.final_time, end_time);
        Ok(outcome)
    }

    /// FED-005: CoaTermination - Ping, await the Echo, finish the COA.
    async fn run_coa_termination(&self) -> Result<Outcome, FederationError> {
        let end_time = 50.0;
        let experiment = ExperimentConfig {
            terminate_on_coa_finish: true,
            monitored_interactions: vec![ECHO.to_string()],
            ..echo_experiment(1)
        };
        let mut world =
            SimFederation::with_coa(self.seed, self.config(end_time), experiment, ping_echo_coa(self.seed)?)?;
        world.spawn_expected();
        world.manager().control(ControlAction::Start);

        let manager = world.manager().clone();
        let bus = Arc::clone(&world.bus);
        let (mut outcome, reports) = observe(world).await;
        let final_time = outcome.final_time;
        check_completed(&mut outcome.checks, &reports, final_time);

        outcome.checks.check(manager.coa_finished(), || "COA did not finish".to_string());
        outcome.checks.check(final_time < end_time, || {
            format!("ran to the end time {} instead of finishing early", final_time)
        });
        outcome.checks.check_eq("pings", bus.sent(PING).len(), 1);
        outcome.checks.check_eq("echoes", outcome.metrics.echoes, 1);
        Ok(outcome)
    }

    /// FED-006: FlakyService - rejected requests are retried and every step
    /// still happens.
    async fn run_flaky_service(&self) -> Result<Outcome, FederationError> {
        let end_time = 5.0;
        let mut world = SimFederation::new(self.seed, self.config(end_time), echo_experiment(1))?;
        world.coordinator.fail_next_requests(6);
        world.spawn_expected();
        world.manager().control(ControlAction::Start);

        let (mut outcome, reports) = observe(world).await;
        check_completed(&mut outcome.checks, &reports, end_time);
        outcome.checks.check_eq("steps", outcome.steps, 6);
        Ok(outcome)
    }
}

/// COA with a weighted choice between two actions.
const BRANCHING_COA: &str = r#"{
    "branching": {
        "nodes": [
            {"ID": "choice", "name": "choice", "nodeType": "ProbabilisticChoice", "isDecisionPoint": true},
            {"ID": "left", "name": "left", "nodeType": "Action", "interactionName": "Left"},
            {"ID": "right", "name": "right", "nodeType": "Action", "interactionName": "Right"},
            {"ID": "end", "name": "end", "nodeType": "TerminateCOA"}
        ],
        "edges": [
            {"ID": "choice-left", "fromNode": "choice", "toNode": "left", "type": "COAFlowWithProbability", "probability": 0.3},
            {"ID": "choice-right", "fromNode": "choice", "toNode": "right", "type": "COAFlowWithProbability", "probability": 0.7},
            {"ID": "left-end", "fromNode": "left", "toNode": "end", "type": "COAFlow"},
            {"ID": "right-end", "fromNode": "right", "toNode": "end", "type": "COAFlow"}
        ]
    }
}"#;

fn ping_echo_coa(seed: u64) -> Result<CoaGraph, CoaError> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut builder = CoaGraph::builder();
    builder.add_node("ping", "send ping", NodeSpec::action(PING), &mut rng)?;
    builder.add_node("echo", "await echo", NodeSpec::outcome(ECHO), &mut rng)?;
    builder.add_node("done", "done", NodeSpec::TerminateCoa, &mut rng)?;
    builder.add_edge(EdgeSpec::flow("ping-echo", "ping", "echo"))?;
    builder.add_edge(EdgeSpec::flow("echo-done", "echo", "done"))?;
    Ok(builder.build())
}

fn echo_experiment(count: usize) -> ExperimentConfig {
    ExperimentConfig {
        expected_federates: vec![FederateTypeCount::new("Echo", count)],
        ..ExperimentConfig::default()
    }
}

/// Waits for the federation to end and records what every run must satisfy.
async fn observe(world: SimFederation) -> (Outcome, Vec<ParticipantReport>) {
    let manager: SimManager = world.manager().clone();
    let bus = Arc::clone(&world.bus);
    let coordinator = Arc::clone(&world.coordinator);
    let reports = world.finish().await;

    let mut checks = Checks::default();
    for point in [SyncPoint::ReadyToPopulate, SyncPoint::ReadyToRun] {
        checks.check_eq(point.label(), manager.barrier_releases(point), 1);
    }
    checks.check_eq("SimEnd sent", bus.sent(SIM_END).len(), 1);
    checks.check_eq("left on coordinator", coordinator.joined(), 0);
    checks.check_eq("manager state", manager.state(), FederationManagerState::Terminated);

    let outcome = Outcome {
        steps: manager.steps_executed(),
        final_time: manager.current_time(),
        metrics: ScenarioMetrics {
            participants: reports.len(),
            interactions_sent: bus.history().len(),
            grants: coordinator.grants(),
            echoes: reports.iter().map(|r| r.echoes).sum(),
        },
        checks,
    };
    (outcome, reports)
}

/// Every participant resigned cleanly at `final_time`.
fn check_completed(checks: &mut Checks, reports: &[ParticipantReport], final_time: LogicalTime) {
    for report in reports {
        checks.check_eq("participant state", report.final_state, FederateState::Resigned);
        checks.check(report.error.is_none(), || {
            format!("participant {} failed: {:?}", report.id, report.error)
        });
        checks.check(report.final_time <= final_time, || {
            format!("participant {} ran ahead to {}", report.id, report.final_time)
        });
    }
}
