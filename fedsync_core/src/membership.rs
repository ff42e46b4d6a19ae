//! Tracking of joined, expected and resigned federates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use fedsync_env::FederateId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ExperimentConfig;
use crate::sync_points::SyncPointRegistry;

/// Membership errors reported back to a joining or resigning federate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MembershipError {
    #[error("federate type {0} is not allowed in this federation")]
    TypeNotAllowed(String),

    #[error("federate {0} already joined")]
    AlreadyJoined(FederateId),

    #[error("federate {0} is not online")]
    UnknownFederate(FederateId),

    #[error("federation is shutting down")]
    ShuttingDown,
}

/// What the federation knows about one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederateInfo {
    pub id: FederateId,
    pub federate_type: String,
    pub late_joiner: bool,
    pub joined_at: Option<SystemTime>,
    pub resigned_at: Option<SystemTime>,
}

impl FederateInfo {
    pub fn new(id: FederateId, federate_type: impl Into<String>, late_joiner: bool) -> Self {
        Self {
            id,
            federate_type: federate_type.into(),
            late_joiner,
            joined_at: None,
            resigned_at: None,
        }
    }

    pub fn joined_at(mut self, at: SystemTime) -> Self {
        self.joined_at = Some(at);
        self
    }
}

/// Interface the message layer uses to report membership to the federation.
pub trait FederationMembership: Send + Sync {
    fn federate_joined(&self, info: FederateInfo) -> Result<(), MembershipError>;

    fn federate_resigned(&self, federate: FederateId) -> Result<(), MembershipError>;

    /// Barriers participants report arrival at.
    fn sync_points(&self) -> Arc<SyncPointRegistry>;
}

fn type_key(federate_type: &str) -> String {
    federate_type.to_ascii_lowercase()
}

/// Expected and late-joiner slots per federate type, plus online and
/// resigned lists.
///
/// A slot count below zero means more federates of that type joined than
/// configured; this is allowed and logged.
#[derive(Debug, Default)]
pub struct FederateRegistry {
    allowed: Vec<String>,
    expected_remaining: HashMap<String, i64>,
    late_remaining: HashMap<String, i64>,
    online: Vec<FederateInfo>,
    resigned: Vec<FederateInfo>,
}

impl FederateRegistry {
    pub fn new(experiment: &ExperimentConfig) -> Self {
        let mut registry = Self {
            allowed: experiment.federate_types_allowed.iter().map(|t| type_key(t)).collect(),
            ..Self::default()
        };
        for entry in &experiment.expected_federates {
            *registry
                .expected_remaining
                .entry(type_key(&entry.federate_type))
                .or_default() += entry.count as i64;
        }
        for entry in &experiment.late_joiner_federates {
            *registry
                .late_remaining
                .entry(type_key(&entry.federate_type))
                .or_default() += entry.count as i64;
        }
        registry
    }

    /// Records a join.
    pub fn federate_joined(&mut self, info: FederateInfo) -> Result<(), MembershipError> {
        let key = type_key(&info.federate_type);
        if !self.allowed.is_empty() && !self.allowed.contains(&key) {
            return Err(MembershipError::TypeNotAllowed(info.federate_type));
        }
        if self.is_online(info.id) {
            return Err(MembershipError::AlreadyJoined(info.id));
        }

        let slots = if info.late_joiner {
            &mut self.late_remaining
        } else {
            &mut self.expected_remaining
        };
        let remaining = slots.entry(key).or_default();
        *remaining -= 1;
        if *remaining < 0 {
            warn!(
                federate = %info.id,
                federate_type = %info.federate_type,
                late_joiner = info.late_joiner,
                "More federates of this type joined than configured"
            );
        }

        info!(
            federate = %info.id,
            federate_type = %info.federate_type,
            late_joiner = info.late_joiner,
            "Federate joined"
        );
        self.online.push(info);
        Ok(())
    }

    /// Records a resignation; a late joiner's slot is re-opened.
    pub fn federate_resigned(
        &mut self,
        federate: FederateId,
        at: SystemTime,
    ) -> Result<FederateInfo, MembershipError> {
        let index = self
            .online
            .iter()
            .position(|f| f.id == federate)
            .ok_or(MembershipError::UnknownFederate(federate))?;
        let mut info = self.online.remove(index);
        info.resigned_at = Some(at);

        if info.late_joiner {
            *self
                .late_remaining
                .entry(type_key(&info.federate_type))
                .or_default() += 1;
        }

        info!(federate = %info.id, federate_type = %info.federate_type, "Federate resigned");
        self.resigned.push(info.clone());
        Ok(info)
    }

    /// Expected (non-late) federates still to join.
    pub fn expected_left_to_join(&self) -> usize {
        self.expected_remaining
            .values()
            .map(|&n| n.max(0) as usize)
            .sum()
    }

    pub fn is_online(&self, federate: FederateId) -> bool {
        self.online.iter().any(|f| f.id == federate)
    }

    pub fn online(&self) -> &[FederateInfo] {
        &self.online
    }

    pub fn resigned(&self) -> &[FederateInfo] {
        &self.resigned
    }

    /// Online federates that are subject to the initial barriers.
    pub fn online_expected_ids(&self) -> Vec<FederateId> {
        self.online
            .iter()
            .filter(|f| !f.late_joiner)
            .map(|f| f.id)
            .collect()
    }

    pub fn online_ids(&self) -> Vec<FederateId> {
        self.online.iter().map(|f| f.id).collect()
    }

    /// Online and resigned federates, in join order per list.
    pub fn all(&self) -> Vec<FederateInfo> {
        self.online.iter().chain(&self.resigned).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FederateTypeCount;

    fn experiment() -> ExperimentConfig {
        ExperimentConfig {
            federate_types_allowed: vec!["Echo".into(), "Monitor".into()],
            expected_federates: vec![FederateTypeCount::new("Echo", 2)],
            late_joiner_federates: vec![FederateTypeCount::new("Monitor", 1)],
            ..Default::default()
        }
    }

    #[test]
    fn test_expected_count_drops_with_joins() {
        let mut registry = FederateRegistry::new(&experiment());
        assert_eq!(registry.expected_left_to_join(), 2);

        registry
            .federate_joined(FederateInfo::new(FederateId::from_seed(1), "echo", false))
            .unwrap();
        assert_eq!(registry.expected_left_to_join(), 1);

        // Late joiners never count towards the expected set
        registry
            .federate_joined(FederateInfo::new(FederateId::from_seed(2), "Monitor", true))
            .unwrap();
        assert_eq!(registry.expected_left_to_join(), 1);

        registry
            .federate_joined(FederateInfo::new(FederateId::from_seed(3), "Echo", false))
            .unwrap();
        assert_eq!(registry.expected_left_to_join(), 0);
        assert_eq!(registry.online_expected_ids().len(), 2);
    }

    #[test]
    fn test_over_join_is_admitted() {
        let mut registry = FederateRegistry::new(&experiment());
        for seed in 0..3 {
            registry
                .federate_joined(FederateInfo::new(FederateId::from_seed(seed), "Echo", false))
                .unwrap();
        }
        assert_eq!(registry.expected_left_to_join(), 0);
        assert_eq!(registry.online().len(), 3);
    }

    #[test]
    fn test_rejects_disallowed_and_duplicate() {
        let mut registry = FederateRegistry::new(&experiment());
        let id = FederateId::from_seed(9);

        assert_eq!(
            registry.federate_joined(FederateInfo::new(id, "Sink", false)),
            Err(MembershipError::TypeNotAllowed("Sink".into()))
        );
        registry.federate_joined(FederateInfo::new(id, "Echo", false)).unwrap();
        assert_eq!(
            registry.federate_joined(FederateInfo::new(id, "Echo", false)),
            Err(MembershipError::AlreadyJoined(id))
        );
    }

    #[test]
    fn test_resign_moves_to_resigned_list() {
        let mut registry = FederateRegistry::new(&experiment());
        let id = FederateId::from_seed(4);
        registry.federate_joined(FederateInfo::new(id, "Monitor", true)).unwrap();

        let info = registry.federate_resigned(id, SystemTime::now()).unwrap();
        assert!(info.resigned_at.is_some());
        assert!(!registry.is_online(id));
        assert_eq!(registry.resigned().len(), 1);
        assert_eq!(
            registry.federate_resigned(id, SystemTime::now()),
            Err(MembershipError::UnknownFederate(id))
        );
    }
}
