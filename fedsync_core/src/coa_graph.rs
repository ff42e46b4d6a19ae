//! COA (Course of Action) graph: nodes, edges and validated construction.
//!
//! A graph is built once through [`CoaGraphBuilder`], which rejects every
//! malformed node or edge up front. After `build()` the structure is fixed;
//! only per-node runtime state (status, counters, timers, outcome
//! occurrences) changes, and only through the executor.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use fedsync_env::{Interaction, LogicalTime};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type NodeIndex = usize;
pub type EdgeIndex = usize;

/// Graph construction and loading errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoaError {
    #[error("node id is missing or empty")]
    MissingNodeId,

    #[error("duplicate node id {0}")]
    DuplicateNode(String),

    #[error("edge id is missing or empty")]
    MissingEdgeId,

    #[error("duplicate edge id {0}")]
    DuplicateEdge(String),

    #[error("edge {edge} has no {end} node")]
    NullEndpoint { edge: String, end: &'static str },

    #[error("edge {edge} references unknown node {node}")]
    DanglingReference { edge: String, node: String },

    #[error("node {node}: duration {duration} is negative")]
    NegativeDuration { node: String, duration: f64 },

    #[error("node {node}: bounds [{lower}, {upper}] are invalid")]
    InvalidBounds { node: String, lower: f64, upper: f64 },

    #[error("edge {0} requires a probability")]
    MissingProbability(String),

    #[error("edge {edge}: probability {probability} is negative")]
    NegativeProbability { edge: String, probability: f64 },

    #[error("exception edge {0} has no branchesFinishedCondition")]
    MissingExceptionCondition(String),

    #[error("outcome filter {0} must be preceded by exactly one outcome")]
    InvalidOutcomeFilter(String),

    #[error("edge {edge} has unsupported type {kind}")]
    UnsupportedEdge { edge: String, kind: String },

    #[error("malformed COA document: {0}")]
    Malformed(String),

    #[error("COA selection {0} not found")]
    UnknownSelection(String),

    #[error("COA {0} not found in definition")]
    UnknownCoa(String),

    #[error("failed to read COA document {path}: {reason}")]
    Io { path: String, reason: String },
}

/// Runtime status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    Inactive,
    Active,
    Executed,
}

/// N-of-M branch counter used by AwaitN and SyncPoint nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BranchCounter {
    required: u32,
    finished: u32,
}

impl BranchCounter {
    pub fn new(required: u32) -> Self {
        Self {
            required,
            finished: 0,
        }
    }

    /// Records one more finished branch. Never decreases.
    pub fn increment(&mut self) {
        self.finished = self.finished.saturating_add(1);
    }

    pub fn is_satisfied(&self) -> bool {
        self.finished >= self.required
    }

    pub fn required(&self) -> u32 {
        self.required
    }

    pub fn finished(&self) -> u32 {
        self.finished
    }

    fn reset(&mut self) {
        self.finished = 0;
    }
}

/// Countdown started the first time a Duration node is evaluated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoaTimer {
    duration: f64,
    end_time: Option<LogicalTime>,
}

impl CoaTimer {
    fn new(node: &str, duration: f64) -> Result<Self, CoaError> {
        if !duration.is_finite() || duration < 0.0 {
            return Err(CoaError::NegativeDuration {
                node: node.to_string(),
                duration,
            });
        }
        Ok(Self {
            duration,
            end_time: None,
        })
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn is_on(&self) -> bool {
        self.end_time.is_some()
    }

    pub fn end_time(&self) -> Option<LogicalTime> {
        self.end_time
    }

    pub fn start(&mut self, now: LogicalTime) {
        self.end_time = Some(now + self.duration);
    }

    pub fn is_expired(&self, now: LogicalTime) -> bool {
        self.end_time.is_some_and(|end| now >= end)
    }

    fn reset(&mut self) {
        self.end_time = None;
    }
}

/// Construction parameters of a node, one variant per node type.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeSpec {
    Action {
        interaction: String,
        parameters: BTreeMap<String, String>,
    },
    Outcome {
        interaction: String,
    },
    OutcomeFilter,
    AwaitN {
        branches_required: u32,
    },
    Duration {
        duration: f64,
    },
    RandomDuration {
        lower_bound: f64,
        upper_bound: f64,
    },
    SyncPoint {
        time: LogicalTime,
        branches_required: u32,
    },
    ProbabilisticChoice {
        is_decision_point: bool,
    },
    Fork {
        is_decision_point: bool,
    },
    TerminateCoa,
    TerminateSimulation,
}

impl NodeSpec {
    pub fn action(interaction: impl Into<String>) -> Self {
        Self::Action {
            interaction: interaction.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn outcome(interaction: impl Into<String>) -> Self {
        Self::Outcome {
            interaction: interaction.into(),
        }
    }
}

/// Node kind with its runtime payload.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Action {
        interaction: String,
        parameters: BTreeMap<String, String>,
    },
    Outcome {
        interaction: String,
        await_start: Option<LogicalTime>,
        occurrence: Option<Interaction>,
    },
    OutcomeFilter,
    AwaitN(BranchCounter),
    Duration(CoaTimer),
    RandomDuration {
        lower_bound: f64,
        upper_bound: f64,
        timer: CoaTimer,
    },
    SyncPoint {
        time: LogicalTime,
        branches: BranchCounter,
    },
    ProbabilisticChoice {
        is_decision_point: bool,
    },
    Fork {
        is_decision_point: bool,
    },
    TerminateCoa,
    TerminateSimulation,
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Action { .. } => "Action",
            Self::Outcome { .. } => "Outcome",
            Self::OutcomeFilter => "OutcomeFilter",
            Self::AwaitN(_) => "AwaitN",
            Self::Duration(_) => "Dur",
            Self::RandomDuration { .. } => "RandomDur",
            Self::SyncPoint { .. } => "SyncPoint",
            Self::ProbabilisticChoice { .. } => "ProbabilisticChoice",
            Self::Fork { .. } => "Fork",
            Self::TerminateCoa => "TerminateCOA",
            Self::TerminateSimulation => "TerminateSimulation",
        }
    }

    /// Branch counter of N-of-M nodes.
    pub fn branch_counter(&self) -> Option<&BranchCounter> {
        match self {
            Self::AwaitN(counter) | Self::SyncPoint { branches: counter, .. } => Some(counter),
            _ => None,
        }
    }

    pub(crate) fn branch_counter_mut(&mut self) -> Option<&mut BranchCounter> {
        match self {
            Self::AwaitN(counter) | Self::SyncPoint { branches: counter, .. } => Some(counter),
            _ => None,
        }
    }

    /// Timer of Duration and RandomDuration nodes.
    pub fn timer(&self) -> Option<&CoaTimer> {
        match self {
            Self::Duration(timer) | Self::RandomDuration { timer, .. } => Some(timer),
            _ => None,
        }
    }

    fn reset(&mut self) {
        match self {
            Self::Outcome {
                await_start,
                occurrence,
                ..
            } => {
                *await_start = None;
                *occurrence = None;
            }
            Self::AwaitN(counter) | Self::SyncPoint { branches: counter, .. } => counter.reset(),
            Self::Duration(timer) | Self::RandomDuration { timer, .. } => timer.reset(),
            _ => {}
        }
    }
}

/// One scenario node.
#[derive(Debug, Clone, PartialEq)]
pub struct CoaNode {
    id: String,
    name: String,
    status: NodeStatus,
    executed_at: Option<LogicalTime>,
    kind: NodeKind,
}

impl CoaNode {
    /// Validates `spec` and creates the node.
    ///
    /// A RandomDuration draws its duration here, once, from `rng`: uniformly
    /// from `[lower_bound, upper_bound)`, or exactly the bound when both are
    /// equal.
    pub fn new<R: Rng + ?Sized>(
        id: impl Into<String>,
        name: impl Into<String>,
        spec: NodeSpec,
        rng: &mut R,
    ) -> Result<Self, CoaError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(CoaError::MissingNodeId);
        }

        let kind = match spec {
            NodeSpec::Action {
                interaction,
                parameters,
            } => NodeKind::Action {
                interaction,
                parameters,
            },
            NodeSpec::Outcome { interaction } => NodeKind::Outcome {
                interaction,
                await_start: None,
                occurrence: None,
            },
            NodeSpec::OutcomeFilter => NodeKind::OutcomeFilter,
            NodeSpec::AwaitN { branches_required } => {
                NodeKind::AwaitN(BranchCounter::new(branches_required))
            }
            NodeSpec::Duration { duration } => NodeKind::Duration(CoaTimer::new(&id, duration)?),
            NodeSpec::RandomDuration {
                lower_bound,
                upper_bound,
            } => {
                let valid = lower_bound.is_finite()
                    && upper_bound.is_finite()
                    && lower_bound >= 0.0
                    && upper_bound >= lower_bound;
                if !valid {
                    return Err(CoaError::InvalidBounds {
                        node: id,
                        lower: lower_bound,
                        upper: upper_bound,
                    });
                }
                let duration = if lower_bound == upper_bound {
                    lower_bound
                } else {
                    rng.gen_range(lower_bound..upper_bound)
                };
                NodeKind::RandomDuration {
                    lower_bound,
                    upper_bound,
                    timer: CoaTimer::new(&id, duration)?,
                }
            }
            NodeSpec::SyncPoint {
                time,
                branches_required,
            } => NodeKind::SyncPoint {
                time,
                branches: BranchCounter::new(branches_required),
            },
            NodeSpec::ProbabilisticChoice { is_decision_point } => {
                NodeKind::ProbabilisticChoice { is_decision_point }
            }
            NodeSpec::Fork { is_decision_point } => NodeKind::Fork { is_decision_point },
            NodeSpec::TerminateCoa => NodeKind::TerminateCoa,
            NodeSpec::TerminateSimulation => NodeKind::TerminateSimulation,
        };

        Ok(Self {
            id,
            name: name.into(),
            status: NodeStatus::Inactive,
            executed_at: None,
            kind,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> NodeStatus {
        self.status
    }

    pub fn executed_at(&self) -> Option<LogicalTime> {
        self.executed_at
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub(crate) fn kind_mut(&mut self) -> &mut NodeKind {
        &mut self.kind
    }

    pub(crate) fn set_status(&mut self, status: NodeStatus) {
        self.status = status;
    }

    pub(crate) fn mark_executed(&mut self, now: LogicalTime) {
        self.status = NodeStatus::Executed;
        self.executed_at = Some(now);
    }

    fn reset(&mut self) {
        self.status = NodeStatus::Inactive;
        self.executed_at = None;
        self.kind.reset();
    }
}

impl fmt::Display for CoaNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}, {})", self.kind.type_name(), self.id, self.name)
    }
}

/// Edge type with its resolved payload.
#[derive(Debug, Clone, PartialEq)]
pub enum EdgeKind {
    Flow,
    FlowWithProbability {
        probability: f64,
    },
    OutcomeToFilter,
    FilterToElement,
    Exception {
        branches_finished_condition: Vec<NodeIndex>,
    },
}

/// Edge type as described, before references are resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum EdgeSpecKind {
    Flow,
    FlowWithProbability { probability: Option<f64> },
    OutcomeToFilter,
    FilterToElement,
    Exception { branches_finished_condition: Option<Vec<String>> },
    Unknown(String),
}

/// Description of an edge; node references are ids.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeSpec {
    pub id: Option<String>,
    pub name: String,
    pub from: Option<String>,
    pub to: Option<String>,
    pub kind: EdgeSpecKind,
}

impl EdgeSpec {
    pub fn new(
        id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        kind: EdgeSpecKind,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id: Some(id),
            from: Some(from.into()),
            to: Some(to.into()),
            kind,
        }
    }

    pub fn flow(id: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(id, from, to, EdgeSpecKind::Flow)
    }

    pub fn with_probability(
        id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        probability: f64,
    ) -> Self {
        Self::new(
            id,
            from,
            to,
            EdgeSpecKind::FlowWithProbability {
                probability: Some(probability),
            },
        )
    }

    pub fn exception(
        id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        condition: &[&str],
    ) -> Self {
        Self::new(
            id,
            from,
            to,
            EdgeSpecKind::Exception {
                branches_finished_condition: Some(condition.iter().map(|s| s.to_string()).collect()),
            },
        )
    }
}

/// A resolved edge.
#[derive(Debug, Clone, PartialEq)]
pub struct CoaEdge {
    id: String,
    name: String,
    from: NodeIndex,
    to: NodeIndex,
    kind: EdgeKind,
}

impl CoaEdge {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn from(&self) -> NodeIndex {
        self.from
    }

    pub fn to(&self) -> NodeIndex {
        self.to
    }

    pub fn kind(&self) -> &EdgeKind {
        &self.kind
    }

    pub fn is_exception(&self) -> bool {
        matches!(self.kind, EdgeKind::Exception { .. })
    }
}

/// An immutable-structure scenario graph.
#[derive(Debug, Clone, Default)]
pub struct CoaGraph {
    nodes: Vec<CoaNode>,
    index: HashMap<String, NodeIndex>,
    edges: Vec<CoaEdge>,
    outgoing: Vec<Vec<EdgeIndex>>,
    incoming: Vec<Vec<EdgeIndex>>,
}

impl CoaGraph {
    pub fn builder() -> CoaGraphBuilder {
        CoaGraphBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[CoaNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[CoaEdge] {
        &self.edges
    }

    pub fn node(&self, index: NodeIndex) -> &CoaNode {
        &self.nodes[index]
    }

    pub(crate) fn node_mut(&mut self, index: NodeIndex) -> &mut CoaNode {
        &mut self.nodes[index]
    }

    pub fn index_of(&self, id: &str) -> Option<NodeIndex> {
        self.index.get(id).copied()
    }

    pub fn node_by_id(&self, id: &str) -> Option<&CoaNode> {
        self.index_of(id).map(|i| &self.nodes[i])
    }

    pub fn status_of(&self, id: &str) -> Option<NodeStatus> {
        self.node_by_id(id).map(CoaNode::status)
    }

    pub fn outgoing(&self, node: NodeIndex) -> impl Iterator<Item = &CoaEdge> + '_ {
        self.outgoing[node].iter().map(move |&e| &self.edges[e])
    }

    pub fn incoming(&self, node: NodeIndex) -> impl Iterator<Item = &CoaEdge> + '_ {
        self.incoming[node].iter().map(move |&e| &self.edges[e])
    }

    /// Nodes without predecessors; these start Active.
    pub fn root_nodes(&self) -> Vec<NodeIndex> {
        (0..self.nodes.len())
            .filter(|&i| self.incoming[i].is_empty())
            .collect()
    }

    pub fn active_nodes(&self) -> Vec<NodeIndex> {
        (0..self.nodes.len())
            .filter(|&i| self.nodes[i].status == NodeStatus::Active)
            .collect()
    }

    /// Restores every node's runtime state and re-activates the roots.
    pub fn reset(&mut self) {
        for node in &mut self.nodes {
            node.reset();
        }
        for root in self.root_nodes() {
            self.nodes[root].status = NodeStatus::Active;
        }
    }
}

/// Validating builder for [`CoaGraph`].
#[derive(Debug, Default)]
pub struct CoaGraphBuilder {
    graph: CoaGraph,
    edge_ids: HashSet<String>,
}

impl CoaGraphBuilder {
    pub fn contains_node(&self, id: &str) -> bool {
        self.graph.index.contains_key(id)
    }

    /// Validates and adds a node.
    pub fn add_node<R: Rng + ?Sized>(
        &mut self,
        id: impl Into<String>,
        name: impl Into<String>,
        spec: NodeSpec,
        rng: &mut R,
    ) -> Result<NodeIndex, CoaError> {
        let node = CoaNode::new(id, name, spec, rng)?;
        if self.graph.index.contains_key(node.id()) {
            return Err(CoaError::DuplicateNode(node.id().to_string()));
        }
        let index = self.graph.nodes.len();
        self.graph.index.insert(node.id().to_string(), index);
        self.graph.nodes.push(node);
        self.graph.outgoing.push(Vec::new());
        self.graph.incoming.push(Vec::new());
        Ok(index)
    }

    fn resolve(&self, edge: &str, node: &str) -> Result<NodeIndex, CoaError> {
        self.graph
            .index_of(node)
            .ok_or_else(|| CoaError::DanglingReference {
                edge: edge.to_string(),
                node: node.to_string(),
            })
    }

    /// Validates and adds an edge; both endpoints must already exist.
    pub fn add_edge(&mut self, spec: EdgeSpec) -> Result<EdgeIndex, CoaError> {
        let id = spec
            .id
            .filter(|id| !id.trim().is_empty())
            .ok_or(CoaError::MissingEdgeId)?;
        if self.edge_ids.contains(&id) {
            return Err(CoaError::DuplicateEdge(id));
        }
        let from_id = spec.from.ok_or_else(|| CoaError::NullEndpoint {
            edge: id.clone(),
            end: "from",
        })?;
        let to_id = spec.to.ok_or_else(|| CoaError::NullEndpoint {
            edge: id.clone(),
            end: "to",
        })?;
        let from = self.resolve(&id, &from_id)?;
        let to = self.resolve(&id, &to_id)?;

        let kind = match spec.kind {
            EdgeSpecKind::Flow => EdgeKind::Flow,
            EdgeSpecKind::FlowWithProbability { probability } => {
                let probability = probability.ok_or_else(|| CoaError::MissingProbability(id.clone()))?;
                if !probability.is_finite() || probability < 0.0 {
                    return Err(CoaError::NegativeProbability { edge: id, probability });
                }
                EdgeKind::FlowWithProbability { probability }
            }
            EdgeSpecKind::OutcomeToFilter => EdgeKind::OutcomeToFilter,
            EdgeSpecKind::FilterToElement => EdgeKind::FilterToElement,
            EdgeSpecKind::Exception {
                branches_finished_condition,
            } => {
                let condition = branches_finished_condition
                    .filter(|c| !c.is_empty())
                    .ok_or_else(|| CoaError::MissingExceptionCondition(id.clone()))?;
                let resolved = condition
                    .iter()
                    .map(|node| self.resolve(&id, node))
                    .collect::<Result<Vec<_>, _>>()?;
                EdgeKind::Exception {
                    branches_finished_condition: resolved,
                }
            }
            EdgeSpecKind::Unknown(kind) => return Err(CoaError::UnsupportedEdge { edge: id, kind }),
        };

        let from_kind = &self.graph.nodes[from].kind;
        if matches!(from_kind, NodeKind::ProbabilisticChoice { .. })
            && !matches!(kind, EdgeKind::FlowWithProbability { .. } | EdgeKind::Exception { .. })
        {
            return Err(CoaError::MissingProbability(id));
        }
        if matches!(self.graph.nodes[to].kind, NodeKind::OutcomeFilter)
            && (!matches!(from_kind, NodeKind::Outcome { .. }) || !self.graph.incoming[to].is_empty())
        {
            return Err(CoaError::InvalidOutcomeFilter(self.graph.nodes[to].id.clone()));
        }

        let index = self.graph.edges.len();
        self.graph.edges.push(CoaEdge {
            name: if spec.name.is_empty() { id.clone() } else { spec.name },
            id: id.clone(),
            from,
            to,
            kind,
        });
        self.graph.outgoing[from].push(index);
        self.graph.incoming[to].push(index);
        self.edge_ids.insert(id);
        Ok(index)
    }

    /// Finishes construction with the root nodes Active.
    pub fn build(mut self) -> CoaGraph {
        self.graph.reset();
        self.graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(7)
    }

    fn random_duration(lower: f64, upper: f64, rng: &mut ChaCha8Rng) -> Result<CoaNode, CoaError> {
        CoaNode::new(
            "r",
            "random",
            NodeSpec::RandomDuration {
                lower_bound: lower,
                upper_bound: upper,
            },
            rng,
        )
    }

    #[test]
    fn test_random_duration_equal_bounds_is_constant() {
        let mut rng = rng();
        for _ in 0..100 {
            let node = random_duration(5.0, 5.0, &mut rng).unwrap();
            assert_eq!(node.kind().timer().unwrap().duration(), 5.0);
        }
        assert!(random_duration(2.0, 2.0, &mut rng).is_ok());
    }

    #[test]
    fn test_random_duration_inverted_bounds_rejected() {
        let mut rng = rng();
        for _ in 0..10 {
            assert!(matches!(
                random_duration(5.0, 2.0, &mut rng),
                Err(CoaError::InvalidBounds { .. })
            ));
        }
        assert!(random_duration(-1.0, 2.0, &mut rng).is_err());
    }

    #[test]
    fn test_random_duration_draw_within_bounds() {
        let mut rng = rng();
        for _ in 0..1000 {
            let node = random_duration(2.0, 4.0, &mut rng).unwrap();
            let duration = node.kind().timer().unwrap().duration();
            assert!((2.0..4.0).contains(&duration));
        }
    }

    #[test]
    fn test_negative_duration_rejected() {
        let err = CoaNode::new("d", "wait", NodeSpec::Duration { duration: -0.5 }, &mut rng()).unwrap_err();
        assert!(matches!(err, CoaError::NegativeDuration { .. }));
    }

    #[test]
    fn test_branch_counter_predicate() {
        let mut counter = BranchCounter::new(3);
        for finished in 0..6 {
            assert_eq!(counter.finished(), finished);
            assert_eq!(counter.is_satisfied(), finished >= 3);
            counter.increment();
        }
    }

    #[test]
    fn test_timer_expires_at_end_time() {
        let mut timer = CoaTimer::new("d", 2.0).unwrap();
        assert!(!timer.is_on());
        timer.start(3.0);
        assert_eq!(timer.end_time(), Some(5.0));
        assert!(!timer.is_expired(4.0));
        assert!(timer.is_expired(5.0));
    }

    fn two_node_builder() -> CoaGraphBuilder {
        let mut rng = rng();
        let mut builder = CoaGraph::builder();
        builder.add_node("a", "start", NodeSpec::Fork { is_decision_point: false }, &mut rng).unwrap();
        builder.add_node("b", "ping", NodeSpec::action("Ping"), &mut rng).unwrap();
        builder
    }

    #[test]
    fn test_edge_validation_errors() {
        let mut builder = two_node_builder();

        let mut no_id = EdgeSpec::flow("e", "a", "b");
        no_id.id = None;
        assert_eq!(builder.add_edge(no_id), Err(CoaError::MissingEdgeId));

        let mut no_to = EdgeSpec::flow("e", "a", "b");
        no_to.to = None;
        assert_eq!(
            builder.add_edge(no_to),
            Err(CoaError::NullEndpoint { edge: "e".into(), end: "to" })
        );

        assert_eq!(
            builder.add_edge(EdgeSpec::flow("e", "a", "zzz")),
            Err(CoaError::DanglingReference { edge: "e".into(), node: "zzz".into() })
        );

        let missing_probability =
            EdgeSpec::new("e", "a", "b", EdgeSpecKind::FlowWithProbability { probability: None });
        assert_eq!(builder.add_edge(missing_probability), Err(CoaError::MissingProbability("e".into())));

        assert!(matches!(
            builder.add_edge(EdgeSpec::with_probability("e", "a", "b", -0.1)),
            Err(CoaError::NegativeProbability { .. })
        ));

        assert_eq!(
            builder.add_edge(EdgeSpec::exception("e", "a", "b", &[])),
            Err(CoaError::MissingExceptionCondition("e".into()))
        );

        builder.add_edge(EdgeSpec::flow("e", "a", "b")).unwrap();
        assert_eq!(builder.add_edge(EdgeSpec::flow("e", "a", "b")), Err(CoaError::DuplicateEdge("e".into())));
    }

    #[test]
    fn test_choice_edges_need_probability() {
        let mut rng = rng();
        let mut builder = CoaGraph::builder();
        builder.add_node("p", "choice", NodeSpec::ProbabilisticChoice { is_decision_point: true }, &mut rng).unwrap();
        builder.add_node("x", "x", NodeSpec::TerminateCoa, &mut rng).unwrap();

        assert_eq!(builder.add_edge(EdgeSpec::flow("e", "p", "x")), Err(CoaError::MissingProbability("e".into())));
        assert!(builder.add_edge(EdgeSpec::with_probability("e", "p", "x", 1.0)).is_ok());
    }

    #[test]
    fn test_outcome_filter_needs_single_outcome() {
        let mut rng = rng();
        let mut builder = CoaGraph::builder();
        builder.add_node("o", "echo", NodeSpec::outcome("Echo"), &mut rng).unwrap();
        builder.add_node("o2", "echo2", NodeSpec::outcome("Echo"), &mut rng).unwrap();
        builder.add_node("f", "filter", NodeSpec::OutcomeFilter, &mut rng).unwrap();
        builder.add_node("a", "act", NodeSpec::action("Ping"), &mut rng).unwrap();

        assert_eq!(
            builder.add_edge(EdgeSpec::flow("e0", "a", "f")),
            Err(CoaError::InvalidOutcomeFilter("f".into()))
        );
        builder.add_edge(EdgeSpec::new("e1", "o", "f", EdgeSpecKind::OutcomeToFilter)).unwrap();
        assert_eq!(
            builder.add_edge(EdgeSpec::new("e2", "o2", "f", EdgeSpecKind::OutcomeToFilter)),
            Err(CoaError::InvalidOutcomeFilter("f".into()))
        );
    }

    #[test]
    fn test_build_activates_roots_only() {
        let mut builder = two_node_builder();
        builder.add_edge(EdgeSpec::flow("e", "a", "b")).unwrap();
        let graph = builder.build();

        assert_eq!(graph.root_nodes(), vec![0]);
        assert_eq!(graph.status_of("a"), Some(NodeStatus::Active));
        assert_eq!(graph.status_of("b"), Some(NodeStatus::Inactive));
        assert_eq!(graph.outgoing(0).count(), 1);
        assert_eq!(graph.incoming(1).next().map(CoaEdge::from), Some(0));
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let mut builder = two_node_builder();
        assert_eq!(
            builder.add_node("a", "again", NodeSpec::TerminateCoa, &mut rng()),
            Err(CoaError::DuplicateNode("a".into()))
        );
    }
}
