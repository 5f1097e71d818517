//! Condition types: ConditionType, ConditionStatus, Condition

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Condition Type
// ============================================================================

/// Condition type reported by a target operator.
///
/// The four well-known types carry fleet-wide health meaning. Anything else
/// is an extension type the operator publishes for its own purposes and is
/// kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ConditionType {
    Available,
    Degraded,
    Progressing,
    Upgradeable,
    Other(String),
}

impl ConditionType {
    /// Extension condition an operator sets to opt out of status management.
    pub const DISABLED: &'static str = "Disabled";

    pub fn as_str(&self) -> &str {
        match self {
            ConditionType::Available => "Available",
            ConditionType::Degraded => "Degraded",
            ConditionType::Progressing => "Progressing",
            ConditionType::Upgradeable => "Upgradeable",
            ConditionType::Other(name) => name,
        }
    }

    /// The `Disabled` extension condition type
    pub fn disabled() -> Self {
        ConditionType::Other(Self::DISABLED.to_string())
    }
}

impl From<String> for ConditionType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Available" => ConditionType::Available,
            "Degraded" => ConditionType::Degraded,
            "Progressing" => ConditionType::Progressing,
            "Upgradeable" => ConditionType::Upgradeable,
            _ => ConditionType::Other(value),
        }
    }
}

impl From<&str> for ConditionType {
    fn from(value: &str) -> Self {
        ConditionType::from(value.to_string())
    }
}

impl From<ConditionType> for String {
    fn from(value: ConditionType) -> Self {
        match value {
            ConditionType::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Condition Status
// ============================================================================

/// Tri-state condition status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

// ============================================================================
// Condition
// ============================================================================

/// A single health assertion inside a status record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    /// When `status` last changed
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        condition_type: impl Into<ConditionType>,
        status: ConditionStatus,
        last_transition_time: DateTime<Utc>,
    ) -> Self {
        Self {
            condition_type: condition_type.into(),
            status,
            reason: String::new(),
            message: String::new(),
            last_transition_time,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn well_known_types_round_trip_through_strings() {
        for name in ["Available", "Degraded", "Progressing", "Upgradeable"] {
            let parsed = ConditionType::from(name);
            assert!(!matches!(parsed, ConditionType::Other(_)), "{name} should be well-known");
            assert_eq!(String::from(parsed), name);
        }
    }

    #[test]
    fn extension_types_are_kept_verbatim() {
        let parsed = ConditionType::from("CertRotationDegraded");
        assert_eq!(parsed, ConditionType::Other("CertRotationDegraded".to_string()));
        assert_eq!(parsed.to_string(), "CertRotationDegraded");
    }

    #[test]
    fn condition_serializes_with_wire_field_names() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let condition = Condition::new(ConditionType::Degraded, ConditionStatus::False, t)
            .with_reason("AsExpected")
            .with_message("all good");

        let json = serde_json::to_value(&condition).unwrap();
        assert_eq!(json["type"], "Degraded");
        assert_eq!(json["status"], "False");
        assert_eq!(json["reason"], "AsExpected");
        assert!(json.get("lastTransitionTime").is_some());

        let back: Condition = serde_json::from_value(json).unwrap();
        assert_eq!(back, condition);
    }
}
