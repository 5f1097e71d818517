//! Condition filter
//!
//! Restricts the liveness protocol to the well-known condition types. Any
//! extension condition a target publishes for its own telemetry is never
//! evaluated and never rewritten.

use crate::types::{Condition, ConditionType};

/// Condition types the liveness protocol evaluates and rewrites
pub const TRACKED_CONDITION_TYPES: [ConditionType; 4] = [
    ConditionType::Available,
    ConditionType::Degraded,
    ConditionType::Progressing,
    ConditionType::Upgradeable,
];

/// Whether a condition type is one of the well-known types
pub fn is_tracked(condition_type: &ConditionType) -> bool {
    TRACKED_CONDITION_TYPES.contains(condition_type)
}

/// Tracked conditions, in their original order
pub fn filter_tracked(conditions: &[Condition]) -> Vec<&Condition> {
    conditions
        .iter()
        .filter(|c| is_tracked(&c.condition_type))
        .collect()
}

/// Mutable view over the tracked conditions; extension conditions are skipped
pub fn tracked_mut(conditions: &mut [Condition]) -> impl Iterator<Item = &mut Condition> {
    conditions
        .iter_mut()
        .filter(|c| is_tracked(&c.condition_type))
}
