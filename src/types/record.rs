//! Status record types: StatusRecord, LivenessMarker, Phase

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Condition, ConditionType};

// ============================================================================
// Liveness Phase
// ============================================================================

/// Externally observable liveness phase of a target's status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// No open challenge
    #[default]
    Normal,
    /// The owner has been asked to reassert its conditions
    Challenging,
    /// The owner failed to answer a challenge in time
    Stale,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Normal => write!(f, "Normal"),
            Phase::Challenging => write!(f, "Challenging"),
            Phase::Stale => write!(f, "Stale"),
        }
    }
}

/// Structured liveness state carried on the record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LivenessMarker {
    pub phase: Phase,
    /// When the record entered `phase`
    pub since: DateTime<Utc>,
}

// ============================================================================
// Status Record
// ============================================================================

/// Externally persisted status of one monitored target.
///
/// Written by the target's own control loop and by the watchdog loops.
/// `resource_version` is bumped by the store on every successful write and
/// is the token for compare-and-swap updates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    pub name: String,
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness: Option<LivenessMarker>,
}

impl StatusRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource_version: 0,
            conditions: Vec::new(),
            liveness: None,
        }
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// First condition of the given type, if any
    pub fn condition(&self, condition_type: &ConditionType) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| &c.condition_type == condition_type)
    }

    /// Whether a condition of the given type exists with status True
    pub fn is_condition_true(&self, condition_type: &ConditionType) -> bool {
        self.condition(condition_type).is_some_and(Condition::is_true)
    }

    /// Phase recorded in the structured marker (Normal when absent)
    pub fn marked_phase(&self) -> Phase {
        self.liveness.map(|m| m.phase).unwrap_or_default()
    }
}
