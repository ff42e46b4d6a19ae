//! Federation scenarios exercised by the simulator.

use serde::Serialize;

/// Named federation runs with known expected outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// FED-001: Two echo federates stepping in lockstep to the end time
    Lockstep,

    /// FED-002: Weighted COA branch chosen from the seed
    ProbabilisticBranching,

    /// FED-003: A late joiner enters a running federation
    LateJoiner,

    /// FED-004: Scripted pause time, then an operator resume
    PauseResume,

    /// FED-005: Ping/Echo COA ends the federation
    CoaTermination,

    /// FED-006: Coordination service rejects requests for a while
    FlakyService,
}

impl ScenarioId {
    /// Every scenario, in run order.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Lockstep,
            ScenarioId::ProbabilisticBranching,
            ScenarioId::LateJoiner,
            ScenarioId::PauseResume,
            ScenarioId::CoaTermination,
            ScenarioId::FlakyService,
        ]
    }

    /// Name accepted on the command line.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Lockstep => "lockstep",
            ScenarioId::ProbabilisticBranching => "probabilistic_branching",
            ScenarioId::LateJoiner => "late_joiner",
            ScenarioId::PauseResume => "pause_resume",
            ScenarioId::CoaTermination => "coa_termination",
            ScenarioId::FlakyService => "flaky_service",
        }
    }

    /// One-line summary for listings.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Lockstep => "2 echo federates, barriers released once, all reach the end time",
            ScenarioId::ProbabilisticBranching => "30/70 COA choice, exactly one branch runs",
            ScenarioId::LateJoiner => "late joiner skips the barriers and joins at federation time",
            ScenarioId::PauseResume => "pause time freezes stepping until RESUME",
            ScenarioId::CoaTermination => "Ping action, Echo outcome, COA finish ends the run",
            ScenarioId::FlakyService => "transient service failures are retried without losing steps",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lockstep" | "fed-001" => Ok(ScenarioId::Lockstep),
            "probabilistic_branching" | "branching" | "fed-002" => Ok(ScenarioId::ProbabilisticBranching),
            "late_joiner" | "latejoiner" | "fed-003" => Ok(ScenarioId::LateJoiner),
            "pause_resume" | "pauseresume" | "fed-004" => Ok(ScenarioId::PauseResume),
            "coa_termination" | "coatermination" | "fed-005" => Ok(ScenarioId::CoaTermination),
            "flaky_service" | "flakyservice" | "fed-006" => Ok(ScenarioId::FlakyService),
            other => Err(format!("no scenario named {:?}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
        }
        assert_eq!("FED-003".parse::<ScenarioId>(), Ok(ScenarioId::LateJoiner));
        assert!("split_brain".parse::<ScenarioId>().is_err());
    }

    #[test]
    fn test_serializes_as_name() {
        for scenario in ScenarioId::all() {
            let json = serde_json::to_value(scenario).unwrap();
            assert_eq!(json, serde_json::json!(scenario.name()));
        }
    }
}
