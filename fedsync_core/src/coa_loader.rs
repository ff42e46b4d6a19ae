//! Loading COA graphs from their JSON definition and selection documents.
//!
//! The definition document maps a COA name to `{ "nodes": [...], "edges":
//! [...] }`. The selection document maps a selection name to the COAs it
//! runs; every selected COA is merged into one graph.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use rand::Rng;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::coa_graph::{CoaError, CoaGraph, CoaGraphBuilder, EdgeSpec, EdgeSpecKind, NodeSpec};
use crate::config::ExperimentConfig;

/// Keys of an Action node that are not interaction parameters.
const ACTION_RESERVED_KEYS: [&str; 6] = ["ID", "id", "name", "nodeType", "interactionName", "parameters"];

#[derive(Debug, Default, Deserialize)]
struct CoaDocument {
    #[serde(default)]
    nodes: Vec<Value>,
    #[serde(default)]
    edges: Vec<EdgeDescription>,
}

#[derive(Debug, Deserialize)]
struct NodeHeader {
    #[serde(rename = "ID", alias = "id", default)]
    id: Option<String>,
    #[serde(default)]
    name: String,
    #[serde(rename = "nodeType", default)]
    node_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "nodeType")]
enum NodeDescription {
    Action {
        #[serde(rename = "interactionName")]
        interaction_name: String,
    },
    Outcome {
        #[serde(rename = "interactionName")]
        interaction_name: String,
    },
    OutcomeFilter,
    AwaitN {
        #[serde(rename = "minBranchesToAwait", default)]
        min_branches: u32,
    },
    Dur {
        #[serde(default)]
        time: f64,
    },
    RandomDur {
        #[serde(rename = "lowerBound", default)]
        lower_bound: f64,
        #[serde(rename = "upperBound", default)]
        upper_bound: f64,
    },
    SyncPoint {
        #[serde(default)]
        time: f64,
        #[serde(rename = "minBranchesToSync", default)]
        min_branches: u32,
    },
    ProbabilisticChoice {
        #[serde(rename = "isDecisionPoint", default)]
        is_decision_point: bool,
    },
    Fork {
        #[serde(rename = "isDecisionPoint", default)]
        is_decision_point: bool,
    },
    #[serde(rename = "TerminateCOA")]
    TerminateCoa,
    TerminateSimulation,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct EdgeDescription {
    #[serde(rename = "ID", alias = "id", default)]
    id: Option<String>,
    #[serde(default)]
    name: String,
    #[serde(rename = "fromNode", default)]
    from_node: Option<String>,
    #[serde(rename = "toNode", default)]
    to_node: Option<String>,
    #[serde(rename = "type", default)]
    edge_type: String,
    #[serde(default)]
    probability: Option<f64>,
    #[serde(rename = "branchesFinishedCondition", default)]
    branches_finished_condition: Option<BTreeSet<String>>,
}

impl EdgeDescription {
    fn into_spec(self) -> EdgeSpec {
        let kind = match self.edge_type.as_str() {
            "COAFlow" => EdgeSpecKind::Flow,
            "COAFlowWithProbability" => EdgeSpecKind::FlowWithProbability {
                probability: self.probability,
            },
            "COAException" => EdgeSpecKind::Exception {
                branches_finished_condition: self
                    .branches_finished_condition
                    .map(|condition| condition.into_iter().collect()),
            },
            // Both spellings occur in exported definitions
            "Outcome2Filter" | "OutcomeToFilter" => EdgeSpecKind::OutcomeToFilter,
            "Filter2COAElement" => EdgeSpecKind::FilterToElement,
            other => EdgeSpecKind::Unknown(other.to_string()),
        };
        EdgeSpec {
            id: self.id,
            name: self.name,
            from: self.from_node,
            to: self.to_node,
            kind,
        }
    }
}

/// One entry of a selection: a bare name, `{"Name": ...}`, or a list whose
/// first element is one of those.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SelectionEntry {
    Name(String),
    Named {
        #[serde(rename = "Name", alias = "name")]
        name: String,
    },
    Group(Vec<SelectionEntry>),
}

impl SelectionEntry {
    fn coa_name(&self) -> Option<&str> {
        match self {
            Self::Name(name) | Self::Named { name } => Some(name),
            Self::Group(entries) => entries.first().and_then(SelectionEntry::coa_name),
        }
    }
}

fn malformed(err: serde_json::Error) -> CoaError {
    CoaError::Malformed(err.to_string())
}

fn read_document(path: &Path) -> Result<String, CoaError> {
    std::fs::read_to_string(path).map_err(|err| CoaError::Io {
        path: path.display().to_string(),
        reason: err.to_string(),
    })
}

/// Collects the string-valued extra fields of an Action node.
fn action_parameters(node: &Value) -> BTreeMap<String, String> {
    let Some(object) = node.as_object() else {
        return BTreeMap::new();
    };
    let mut parameters: BTreeMap<String, String> = object
        .iter()
        .filter(|(key, _)| !ACTION_RESERVED_KEYS.contains(&key.as_str()))
        .filter_map(|(key, value)| parameter_value(value).map(|v| (key.clone(), v)))
        .collect();
    if let Some(explicit) = object.get("parameters").and_then(Value::as_object) {
        parameters.extend(explicit_parameters(explicit));
    }
    parameters
}

fn explicit_parameters(map: &Map<String, Value>) -> impl Iterator<Item = (String, String)> + '_ {
    map.iter()
        .filter_map(|(key, value)| parameter_value(value).map(|v| (key.clone(), v)))
}

fn parameter_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn add_node<R: Rng + ?Sized>(
    builder: &mut CoaGraphBuilder,
    node: &Value,
    rng: &mut R,
) -> Result<(), CoaError> {
    let header = NodeHeader::deserialize(node).map_err(malformed)?;
    let description = NodeDescription::deserialize(node).map_err(malformed)?;

    let spec = match description {
        NodeDescription::Action { interaction_name } => NodeSpec::Action {
            interaction: interaction_name,
            parameters: action_parameters(node),
        },
        NodeDescription::Outcome { interaction_name } => NodeSpec::outcome(interaction_name),
        NodeDescription::OutcomeFilter => NodeSpec::OutcomeFilter,
        NodeDescription::AwaitN { min_branches } => NodeSpec::AwaitN {
            branches_required: min_branches,
        },
        NodeDescription::Dur { time } => NodeSpec::Duration { duration: time },
        NodeDescription::RandomDur {
            lower_bound,
            upper_bound,
        } => NodeSpec::RandomDuration {
            lower_bound,
            upper_bound,
        },
        NodeDescription::SyncPoint { time, min_branches } => NodeSpec::SyncPoint {
            time,
            branches_required: min_branches,
        },
        NodeDescription::ProbabilisticChoice { is_decision_point } => {
            NodeSpec::ProbabilisticChoice { is_decision_point }
        }
        NodeDescription::Fork { is_decision_point } => NodeSpec::Fork { is_decision_point },
        NodeDescription::TerminateCoa => NodeSpec::TerminateCoa,
        NodeDescription::TerminateSimulation => NodeSpec::TerminateSimulation,
        NodeDescription::Unknown => {
            warn!(
                node_type = header.node_type.as_deref().unwrap_or("<none>"),
                "unknown COA node type, skipping"
            );
            return Ok(());
        }
    };

    let id = header.id.unwrap_or_default();
    builder.add_node(id.clone(), header.name, spec, rng)?;
    debug!(node = %id, "added COA node");
    Ok(())
}

/// Names of the COAs a selection runs, or `None` when the selection does
/// not exist or is empty.
pub fn selected_coas(selection_json: &str, selection: &str) -> Result<Option<Vec<String>>, CoaError> {
    let document: BTreeMap<String, Vec<SelectionEntry>> =
        serde_json::from_str(selection_json).map_err(malformed)?;
    let names: Vec<String> = document
        .get(selection)
        .map(|entries| {
            entries
                .iter()
                .filter_map(SelectionEntry::coa_name)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Ok(if names.is_empty() { None } else { Some(names) })
}

/// Builds one graph from every COA of `definition_json` that `selected`
/// admits (all of them when `selected` is `None`).
///
/// Nodes and edges of an unknown type are skipped with a warning; any
/// other invalid element fails the whole load.
pub fn load_graph<R: Rng + ?Sized>(
    definition_json: &str,
    selected: Option<&[String]>,
    rng: &mut R,
) -> Result<CoaGraph, CoaError> {
    let document: BTreeMap<String, CoaDocument> =
        serde_json::from_str(definition_json).map_err(malformed)?;

    if let Some(selected) = selected {
        if let Some(missing) = selected.iter().find(|name| !document.contains_key(*name)) {
            return Err(CoaError::UnknownCoa(missing.clone()));
        }
    }

    let coas: Vec<(String, CoaDocument)> = document
        .into_iter()
        .filter(|(name, _)| selected.map_or(true, |selected| selected.contains(name)))
        .collect();

    // Edges may cross COAs, so every node goes in before the first edge
    let mut builder = CoaGraph::builder();
    for (_, coa) in &coas {
        for node in &coa.nodes {
            add_node(&mut builder, node, rng)?;
        }
    }
    for (name, coa) in coas {
        for edge in coa.edges {
            let spec = edge.into_spec();
            if let EdgeSpecKind::Unknown(kind) = &spec.kind {
                warn!(edge = ?spec.id, kind = %kind, "unknown COA edge type, skipping");
                continue;
            }
            builder.add_edge(spec)?;
        }
        debug!(coa = %name, "loaded COA");
    }

    let graph = builder.build();
    info!(nodes = graph.len(), edges = graph.edges().len(), "COA graph loaded");
    Ok(graph)
}

/// Loads the COA graph an experiment refers to, if any.
///
/// A selection that is named but cannot be found yields an empty graph.
pub fn load_experiment_graph<R: Rng + ?Sized>(
    experiment: &ExperimentConfig,
    rng: &mut R,
) -> Result<Option<CoaGraph>, CoaError> {
    let Some(definition) = &experiment.coa_definition else {
        return Ok(None);
    };
    let definition = read_document(&experiment.resolve(definition))?;

    let selected = match (&experiment.coa_selection, &experiment.coa_selection_to_execute) {
        (Some(path), Some(selection)) if !selection.is_empty() => {
            let document = read_document(&experiment.resolve(path))?;
            match selected_coas(&document, selection)? {
                Some(names) => Some(names),
                None => {
                    warn!(selection = %selection, "COA selection not found, running an empty COA");
                    return Ok(Some(CoaGraph::default()));
                }
            }
        }
        _ => None,
    };

    load_graph(&definition, selected.as_deref(), rng).map(Some)
}
