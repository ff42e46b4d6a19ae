//! Stepwise evaluation of a COA graph against logical time.

use std::collections::HashMap;
use std::fmt;

use fedsync_env::{FederateId, Interaction, LogicalTime};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};

use crate::coa_graph::{CoaGraph, EdgeKind, NodeIndex, NodeKind, NodeStatus};

/// Name of the interaction that tells every participant the run is over.
pub const SIM_END: &str = "SimEnd";

/// Predicate deciding whether an OutcomeFilter lets an arrival through.
pub type OutcomeFilterFn = Box<dyn Fn(&Interaction) -> bool + Send + Sync>;

/// Side effect requested by an executed node.
#[derive(Debug, Clone, PartialEq)]
pub enum CoaEffect {
    /// Send this interaction through the message layer.
    Emit(Interaction),
    /// A TerminateCOA or TerminateSimulation node ran.
    CoaFinished,
    /// The whole simulation should end.
    TerminateSimulation,
}

/// Result of one [`CoaExecutor::step`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoaStep {
    /// Ids of the nodes executed, in execution order.
    pub executed: Vec<String>,
    pub effects: Vec<CoaEffect>,
}

impl CoaStep {
    pub fn requests_termination(&self) -> bool {
        self.effects.contains(&CoaEffect::TerminateSimulation)
    }

    pub fn emitted(&self) -> impl Iterator<Item = &Interaction> {
        self.effects.iter().filter_map(|effect| match effect {
            CoaEffect::Emit(interaction) => Some(interaction),
            _ => None,
        })
    }
}

/// Picks an index proportionally to `weights` using a uniform `draw` in
/// `[0, 1)`.
///
/// Weights need not sum to one. When rounding (or all-zero weights) leaves
/// the draw unassigned, the last index is chosen.
pub fn select_weighted(weights: &[f64], draw: f64) -> Option<usize> {
    if weights.is_empty() {
        return None;
    }
    let target = draw * weights.iter().sum::<f64>();
    let mut cumulative = 0.0;
    for (index, weight) in weights.iter().enumerate() {
        cumulative += weight;
        if target < cumulative {
            return Some(index);
        }
    }
    Some(weights.len() - 1)
}

/// Drives a [`CoaGraph`] one logical time step at a time.
///
/// Interactions delivered between steps are recorded with
/// [`record_arrival`](Self::record_arrival) and are visible to Outcome nodes
/// during the next step only.
pub struct CoaExecutor {
    graph: CoaGraph,
    rng: ChaCha8Rng,
    lookahead: LogicalTime,
    source: Option<FederateId>,
    arrivals: Vec<Interaction>,
    filters: HashMap<String, OutcomeFilterFn>,
    terminated: bool,
}

impl fmt::Debug for CoaExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoaExecutor")
            .field("nodes", &self.graph.len())
            .field("lookahead", &self.lookahead)
            .field("arrivals", &self.arrivals.len())
            .field("filters", &self.filters.len())
            .field("terminated", &self.terminated)
            .finish()
    }
}

impl CoaExecutor {
    pub fn new(graph: CoaGraph, rng: ChaCha8Rng, lookahead: LogicalTime) -> Self {
        Self {
            graph,
            rng,
            lookahead,
            source: None,
            arrivals: Vec::new(),
            filters: HashMap::new(),
            terminated: false,
        }
    }

    /// Stamps emitted interactions with the sending federate.
    pub fn with_source(mut self, source: FederateId) -> Self {
        self.source = Some(source);
        self
    }

    /// Registers the predicate of the OutcomeFilter node `filter_id`.
    ///
    /// A filter without a predicate lets every arrival through.
    pub fn with_outcome_filter<F>(mut self, filter_id: impl Into<String>, filter: F) -> Self
    where
        F: Fn(&Interaction) -> bool + Send + Sync + 'static,
    {
        self.filters.insert(filter_id.into(), Box::new(filter));
        self
    }

    pub fn graph(&self) -> &CoaGraph {
        &self.graph
    }

    pub fn record_arrival(&mut self, interaction: Interaction) {
        self.arrivals.push(interaction);
    }

    pub fn pending_arrivals(&self) -> usize {
        self.arrivals.len()
    }

    /// True once a terminate node ran or nothing is left Active.
    pub fn is_finished(&self) -> bool {
        self.terminated || self.graph.active_nodes().is_empty()
    }

    /// Restores the graph to its initial runtime state.
    pub fn reset(&mut self) {
        self.graph.reset();
        self.arrivals.clear();
        self.terminated = false;
    }

    /// Executes every node that is ready at `now`, repeating until no
    /// further node becomes ready, then discards the recorded arrivals.
    pub fn step(&mut self, now: LogicalTime) -> CoaStep {
        let mut step = CoaStep::default();

        'fixpoint: loop {
            let mut progressed = false;
            for index in self.graph.active_nodes() {
                if self.graph.node(index).status() != NodeStatus::Active || !self.is_ready(index, now) {
                    continue;
                }
                self.execute(index, now, &mut step);
                progressed = true;
                if self.terminated {
                    break 'fixpoint;
                }
            }
            if !progressed {
                break;
            }
        }

        self.arrivals.clear();
        step
    }

    fn is_ready(&mut self, index: NodeIndex, now: LogicalTime) -> bool {
        if matches!(self.graph.node(index).kind(), NodeKind::OutcomeFilter) {
            return self.filter_passes(index);
        }

        let arrivals = &self.arrivals;
        match self.graph.node_mut(index).kind_mut() {
            // The timer starts the first time the node is evaluated, and the
            // same evaluation already checks it, so a zero duration fires at once
            NodeKind::Duration(timer) | NodeKind::RandomDuration { timer, .. } => {
                if !timer.is_on() {
                    timer.start(now);
                }
                timer.is_expired(now)
            }
            NodeKind::AwaitN(counter) => counter.is_satisfied(),
            NodeKind::SyncPoint { time, branches } => branches.is_satisfied() && now >= *time,
            NodeKind::Outcome {
                interaction,
                await_start,
                occurrence,
            } => {
                // Arrivals stamped exactly at the await start count
                let start = *await_start.get_or_insert(now);
                match arrivals
                    .iter()
                    .find(|arrival| arrival.name == *interaction && arrival.time >= start)
                {
                    Some(arrival) => {
                        *occurrence = Some(arrival.clone());
                        true
                    }
                    None => false,
                }
            }
            _ => true,
        }
    }

    fn filter_passes(&self, index: NodeIndex) -> bool {
        let outcome = self
            .graph
            .incoming(index)
            .next()
            .map(|edge| self.graph.node(edge.from()).kind());
        let Some(NodeKind::Outcome {
            occurrence: Some(occurrence),
            ..
        }) = outcome
        else {
            return false;
        };
        let id = self.graph.node(index).id();
        self.filters.get(id).map_or(true, |filter| filter(occurrence))
    }

    fn execute(&mut self, index: NodeIndex, now: LogicalTime, step: &mut CoaStep) {
        let node = self.graph.node_mut(index);
        node.mark_executed(now);
        debug!(node = %node, time = now, "COA node executed");
        step.executed.push(node.id().to_string());

        match node.kind() {
            NodeKind::Action {
                interaction,
                parameters,
            } => {
                let send_time = now + self.lookahead + self.lookahead / 10_000.0;
                let mut emitted = Interaction::new(interaction.clone(), send_time)
                    .with_parameters(parameters.clone());
                if let Some(source) = self.source {
                    emitted = emitted.from_federate(source);
                }
                let ends_simulation = interaction == SIM_END;
                step.effects.push(CoaEffect::Emit(emitted));
                if ends_simulation {
                    step.effects.push(CoaEffect::TerminateSimulation);
                }
            }
            NodeKind::TerminateCoa => {
                info!(time = now, "COA terminated");
                self.terminated = true;
                step.effects.push(CoaEffect::CoaFinished);
            }
            NodeKind::TerminateSimulation => {
                info!(time = now, "COA requested simulation termination");
                self.terminated = true;
                step.effects.push(CoaEffect::CoaFinished);
                step.effects.push(CoaEffect::TerminateSimulation);
            }
            _ => {}
        }

        self.propagate(index);
    }

    fn propagate(&mut self, index: NodeIndex) {
        let graph = &self.graph;
        let exception_targets: Vec<NodeIndex> = graph
            .outgoing(index)
            .filter(|edge| match edge.kind() {
                EdgeKind::Exception {
                    branches_finished_condition,
                } => branches_finished_condition
                    .iter()
                    .all(|&node| graph.node(node).status() == NodeStatus::Executed),
                _ => false,
            })
            .map(|edge| edge.to())
            .collect();

        let targets = if !exception_targets.is_empty() {
            exception_targets
        } else if matches!(graph.node(index).kind(), NodeKind::ProbabilisticChoice { .. }) {
            let (targets, weights): (Vec<NodeIndex>, Vec<f64>) = graph
                .outgoing(index)
                .filter_map(|edge| match edge.kind() {
                    EdgeKind::FlowWithProbability { probability } => Some((edge.to(), *probability)),
                    _ => None,
                })
                .unzip();
            let draw: f64 = self.rng.gen();
            match select_weighted(&weights, draw) {
                Some(choice) => vec![targets[choice]],
                None => {
                    warn!(node = %graph.node(index), "probabilistic choice has no outgoing branch");
                    Vec::new()
                }
            }
        } else {
            graph
                .outgoing(index)
                .filter(|edge| !edge.is_exception())
                .map(|edge| edge.to())
                .collect()
        };

        for target in targets {
            self.activate(target);
        }
    }

    fn activate(&mut self, index: NodeIndex) {
        let node = self.graph.node_mut(index);
        if node.status() == NodeStatus::Executed {
            return;
        }
        let ready = match node.kind_mut().branch_counter_mut() {
            Some(counter) => {
                counter.increment();
                counter.is_satisfied()
            }
            None => true,
        };
        if ready && node.status() == NodeStatus::Inactive {
            node.set_status(NodeStatus::Active);
        }
    }
}
