//! Federation and experiment configuration.
//!
//! Both documents are JSON with camelCase keys. Relative paths inside a
//! document resolve against the directory the document was loaded from.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fedsync_env::{LogicalTime, TimeAdvanceMode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::time_advance::TimeAdvanceConfig;

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("log directory {} is unusable: {source}", path.display())]
    LogDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn resolve_against(root: Option<&Path>, path: &Path) -> PathBuf {
    match root {
        Some(root) if path.is_relative() => root.join(path),
        _ => path.to_path_buf(),
    }
}

/// Number of federates of one type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederateTypeCount {
    pub federate_type: String,
    pub count: usize,
}

impl FederateTypeCount {
    pub fn new(federate_type: impl Into<String>, count: usize) -> Self {
        Self {
            federate_type: federate_type.into(),
            count,
        }
    }
}

/// A scripted interaction sent by the manager at a fixed logical time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectedInteraction {
    pub injection_time: LogicalTime,
    pub interaction_name: String,
    #[serde(default)]
    pub parameter_values: BTreeMap<String, String>,
}

/// Experiment description: who is expected, what is scripted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExperimentConfig {
    pub federate_types_allowed: Vec<String>,
    pub expected_federates: Vec<FederateTypeCount>,
    pub late_joiner_federates: Vec<FederateTypeCount>,
    pub pause_times: Vec<LogicalTime>,
    pub injected_interactions: Vec<InjectedInteraction>,
    pub monitored_interactions: Vec<String>,

    /// COA description document (name -> {nodes, edges})
    pub coa_definition: Option<PathBuf>,

    /// COA selection document (selection -> [coa names])
    pub coa_selection: Option<PathBuf>,

    /// Selection to load from `coa_selection`; all COAs when unset
    #[serde(alias = "COASelectionToExecute")]
    pub coa_selection_to_execute: Option<String>,

    #[serde(rename = "terminateOnCOAFinish")]
    pub terminate_on_coa_finish: bool,

    #[serde(skip)]
    pub root_dir: Option<PathBuf>,
}

impl ExperimentConfig {
    /// Loads and validates an experiment document.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config: Self = read_json(path)?;
        config.root_dir = path.parent().map(Path::to_path_buf);
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates an experiment document from a string.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Total number of non-late federates the federation waits for.
    pub fn expected_federate_count(&self) -> usize {
        self.expected_federates.iter().map(|e| e.count).sum()
    }

    pub fn is_expected_type(&self, federate_type: &str) -> bool {
        self.expected_federates
            .iter()
            .any(|e| e.federate_type.eq_ignore_ascii_case(federate_type))
    }

    pub fn is_late_joiner_type(&self, federate_type: &str) -> bool {
        self.late_joiner_federates
            .iter()
            .any(|e| e.federate_type.eq_ignore_ascii_case(federate_type))
    }

    /// True when `federate_type` may join (an empty allow-list admits all).
    pub fn is_allowed_type(&self, federate_type: &str) -> bool {
        self.federate_types_allowed.is_empty()
            || self
                .federate_types_allowed
                .iter()
                .any(|t| t.eq_ignore_ascii_case(federate_type))
    }

    /// Resolves a path from this document against its directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        resolve_against(self.root_dir.as_deref(), path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for entry in self.expected_federates.iter().chain(&self.late_joiner_federates) {
            if !self.is_allowed_type(&entry.federate_type) {
                return Err(ConfigError::Invalid(format!(
                    "federate type {} is not in federateTypesAllowed",
                    entry.federate_type
                )));
            }
        }
        if let Some(t) = self.pause_times.iter().find(|t| !t.is_finite() || **t < 0.0) {
            return Err(ConfigError::Invalid(format!("pause time {} is negative", t)));
        }
        if let Some(i) = self
            .injected_interactions
            .iter()
            .find(|i| !i.injection_time.is_finite() || i.injection_time < 0.0)
        {
            return Err(ConfigError::Invalid(format!(
                "injection time {} of {} is negative",
                i.injection_time, i.interaction_name
            )));
        }
        if self.coa_selection_to_execute.is_some() && self.coa_selection.is_none() {
            return Err(ConfigError::Invalid(
                "coaSelectionToExecute set without coaSelection".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_step_size() -> LogicalTime {
    1.0
}

fn default_auto_start() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_resign_timeout_ms() -> u64 {
    5_000
}

/// Settings of the federation manager itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederationConfig {
    pub federation_name: String,

    /// Scenario description (object model) filename, passed through to the
    /// coordination service
    #[serde(default)]
    pub fed_file: Option<PathBuf>,

    /// Experiment (script) filename
    #[serde(default)]
    pub experiment_config: Option<PathBuf>,

    #[serde(default = "default_step_size")]
    pub step_size: LogicalTime,

    #[serde(default)]
    pub lookahead: LogicalTime,

    /// Stop once federation time exceeds this (0 = unbounded)
    #[serde(default)]
    pub federation_end_time: LogicalTime,

    /// Seed of the COA random source (0 = process-seeded)
    #[serde(default)]
    pub seed: u64,

    #[serde(default)]
    pub real_time_mode: bool,

    #[serde(default = "default_auto_start")]
    pub auto_start: bool,

    #[serde(default)]
    pub time_advance_mode: TimeAdvanceMode,

    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_resign_timeout_ms")]
    pub resign_timeout_ms: u64,

    #[serde(skip)]
    pub root_dir: Option<PathBuf>,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            federation_name: "fedsync".to_string(),
            fed_file: None,
            experiment_config: None,
            step_size: default_step_size(),
            lookahead: 0.0,
            federation_end_time: 0.0,
            seed: 0,
            real_time_mode: false,
            auto_start: default_auto_start(),
            time_advance_mode: TimeAdvanceMode::default(),
            log_dir: None,
            poll_interval_ms: default_poll_interval_ms(),
            resign_timeout_ms: default_resign_timeout_ms(),
            root_dir: None,
        }
    }
}

impl FederationConfig {
    /// Loads and validates a federation document.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config: Self = read_json(path)?;
        config.root_dir = path.parent().map(Path::to_path_buf);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.federation_name.trim().is_empty() {
            return Err(ConfigError::Invalid("federationName is empty".to_string()));
        }
        if !(self.step_size.is_finite() && self.step_size > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "stepSize must be positive, got {}",
                self.step_size
            )));
        }
        if !(self.lookahead.is_finite() && self.lookahead >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "lookahead must be non-negative, got {}",
                self.lookahead
            )));
        }
        if !(self.federation_end_time.is_finite() && self.federation_end_time >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "federationEndTime must be non-negative, got {}",
                self.federation_end_time
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("pollIntervalMs must be positive".to_string()));
        }
        Ok(())
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        resolve_against(self.root_dir.as_deref(), path)
    }

    /// Loads the experiment document, or an empty experiment when none is
    /// configured.
    pub fn load_experiment(&self) -> Result<ExperimentConfig, ConfigError> {
        match &self.experiment_config {
            Some(path) => ExperimentConfig::from_file(self.resolve(path)),
            None => Ok(ExperimentConfig::default()),
        }
    }

    /// Creates the log directory if one is configured.
    pub fn prepare_log_dir(&self) -> Result<Option<PathBuf>, ConfigError> {
        let Some(dir) = &self.log_dir else {
            return Ok(None);
        };
        let path = self.resolve(dir);
        fs::create_dir_all(&path).map_err(|source| ConfigError::LogDirectory {
            path: path.clone(),
            source,
        })?;
        Ok(Some(path))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn resign_timeout(&self) -> Duration {
        Duration::from_millis(self.resign_timeout_ms)
    }

    /// Time-advance loop settings derived from this configuration.
    pub fn time_advance(&self) -> TimeAdvanceConfig {
        TimeAdvanceConfig {
            mode: self.time_advance_mode,
            poll_interval: self.poll_interval(),
            retry_delay: self.poll_interval(),
        }
    }

    /// Lower bound on the timestamp of anything sent at `time`.
    pub fn earliest_send_time(&self, time: LogicalTime) -> LogicalTime {
        time + self.lookahead + self.lookahead / 10_000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_experiment_parses_camel_case() {
        let config = ExperimentConfig::from_json(
            r#"{
                "federateTypesAllowed": ["Echo", "Monitor"],
                "expectedFederates": [{"federateType": "Echo", "count": 2}],
                "lateJoinerFederates": [{"federateType": "Monitor", "count": 1}],
                "pauseTimes": [4.0],
                "injectedInteractions": [
                    {"injectionTime": 2.0, "interactionName": "Ping", "parameterValues": {"n": "1"}}
                ],
                "terminateOnCOAFinish": true
            }"#,
        )
        .unwrap();

        assert_eq!(config.expected_federate_count(), 2);
        assert!(config.is_expected_type("echo"));
        assert!(config.is_late_joiner_type("Monitor"));
        assert!(!config.is_late_joiner_type("Echo"));
        assert!(config.terminate_on_coa_finish);
        assert_eq!(config.injected_interactions[0].parameter_values["n"], "1");
    }

    #[test]
    fn test_experiment_rejects_disallowed_type() {
        let err = ExperimentConfig::from_json(
            r#"{"federateTypesAllowed": ["Echo"], "expectedFederates": [{"federateType": "Sink", "count": 1}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_federation_defaults_and_validation() {
        let config: FederationConfig =
            serde_json::from_str(r#"{"federationName": "Echo", "lookahead": 0.1}"#).unwrap();
        assert_eq!(config.step_size, 1.0);
        assert!(config.auto_start);
        assert_eq!(config.poll_interval(), Duration::from_millis(10));
        assert!(config.validate().is_ok());

        let bad = FederationConfig {
            step_size: 0.0,
            ..FederationConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_earliest_send_time_adds_lookahead_epsilon() {
        let config = FederationConfig {
            lookahead: 0.5,
            ..FederationConfig::default()
        };
        assert!((config.earliest_send_time(2.0) - 2.50005).abs() < 1e-12);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = FederationConfig::from_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_relative_paths_resolve_against_root() {
        let config = FederationConfig {
            root_dir: Some(PathBuf::from("/opt/fed")),
            ..FederationConfig::default()
        };
        assert_eq!(config.resolve(Path::new("exp.json")), PathBuf::from("/opt/fed/exp.json"));
        assert_eq!(config.resolve(Path::new("/abs.json")), PathBuf::from("/abs.json"));
    }
}
