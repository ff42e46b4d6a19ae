//! Common types for the fedsync environment abstraction.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Logical (simulation) time, distinct from wall-clock time.
pub type LogicalTime = f64;

/// Identity of a federate (or of the federation manager) within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FederateId(pub Uuid);

impl FederateId {
    /// Random v4 id, unique without any coordination.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Id that is a pure function of `seed`, for reproducible runs.
    pub fn from_seed(seed: u64) -> Self {
        let high = seed.to_le_bytes();
        let low = seed.wrapping_mul(0x517c_c1b7_2722_0a95).to_le_bytes();
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&high);
        bytes[8..].copy_from_slice(&low);
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for FederateId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FederateId {
    /// Short form: the first eight hex digits.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let full = self.0.simple().to_string();
        f.write_str(&full[..8])
    }
}

/// Policy used when asking the coordination service to move a federate's clock.
///
/// The event-driven modes may grant earlier than requested when an event is
/// pending; the "available" variants proceed once no earlier event is
/// outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TimeAdvanceMode {
    #[default]
    TimeAdvanceRequest,
    TimeAdvanceRequestAvailable,
    NextEventRequest,
    NextEventRequestAvailable,
}

impl TimeAdvanceMode {
    /// Returns true for the next-event (event-driven) modes.
    pub fn is_event_driven(self) -> bool {
        matches!(self, Self::NextEventRequest | Self::NextEventRequestAvailable)
    }

    /// Returns true for the "available" variants.
    pub fn is_available(self) -> bool {
        matches!(
            self,
            Self::TimeAdvanceRequestAvailable | Self::NextEventRequestAvailable
        )
    }

    /// Short protocol name of the mode.
    pub fn name(self) -> &'static str {
        match self {
            Self::TimeAdvanceRequest => "TAR",
            Self::TimeAdvanceRequestAvailable => "TARA",
            Self::NextEventRequest => "NER",
            Self::NextEventRequestAvailable => "NERA",
        }
    }
}

impl fmt::Display for TimeAdvanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TimeAdvanceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tar" | "time_advance_request" | "timeadvancerequest" => Ok(Self::TimeAdvanceRequest),
            "tara" | "time_advance_request_available" | "timeadvancerequestavailable" => {
                Ok(Self::TimeAdvanceRequestAvailable)
            }
            "ner" | "next_event_request" | "nexteventrequest" => Ok(Self::NextEventRequest),
            "nera" | "next_event_request_available" | "nexteventrequestavailable" => {
                Ok(Self::NextEventRequestAvailable)
            }
            _ => Err(format!("Unknown time advance mode: {}", s)),
        }
    }
}

/// A named interaction travelling through the message layer.
///
/// Parameter values are opaque strings; the core never interprets them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    /// Interaction class name (e.g. "SimEnd", "Ping")
    pub name: String,

    /// Parameter name -> value
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,

    /// Logical timestamp the interaction takes effect at
    pub time: LogicalTime,

    /// Federate that emitted it, if known
    #[serde(default)]
    pub source: Option<FederateId>,
}

impl Interaction {
    /// Creates an interaction without parameters.
    pub fn new(name: impl Into<String>, time: LogicalTime) -> Self {
        Self {
            name: name.into(),
            parameters: BTreeMap::new(),
            time,
            source: None,
        }
    }

    /// Adds a parameter value.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Replaces all parameter values.
    pub fn with_parameters(mut self, parameters: BTreeMap<String, String>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Stamps the emitting federate.
    pub fn from_federate(mut self, source: FederateId) -> Self {
        self.source = Some(source);
        self
    }
}
