//! Liveness phase detection and marking
//!
//! The phase is carried as a structured [`LivenessMarker`] on the record.
//! Under [`PhaseProtocol::DualWrite`] the legacy sentinel text is written as
//! well and is what decides the phase, because owners that predate the
//! marker answer a challenge by rewriting their messages and leave the
//! marker untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::sentinel::{is_challenge_message, is_stale_message};
use crate::conditions::filter_tracked;
use crate::types::{LivenessMarker, Phase, StatusRecord};

/// How the liveness phase is encoded on status records
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseProtocol {
    /// Write the marker and the sentinel text; read the sentinel text
    #[default]
    DualWrite,
    /// Write and read the marker only
    Structured,
}

impl PhaseProtocol {
    pub fn writes_sentinel_text(self) -> bool {
        matches!(self, PhaseProtocol::DualWrite)
    }
}

impl std::fmt::Display for PhaseProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseProtocol::DualWrite => write!(f, "dual-write"),
            PhaseProtocol::Structured => write!(f, "structured"),
        }
    }
}

/// Current liveness phase of a record. Derived from the record alone.
pub fn detect_phase(record: &StatusRecord, protocol: PhaseProtocol) -> Phase {
    match protocol {
        PhaseProtocol::Structured => record.marked_phase(),
        PhaseProtocol::DualWrite => {
            let tracked = filter_tracked(&record.conditions);
            if tracked.iter().any(|c| is_challenge_message(&c.message)) {
                Phase::Challenging
            } else if tracked.iter().any(|c| is_stale_message(&c.message)) {
                Phase::Stale
            } else {
                Phase::Normal
            }
        }
    }
}

/// Set the structured marker
pub fn mark(record: &mut StatusRecord, phase: Phase, since: DateTime<Utc>) {
    record.liveness = Some(LivenessMarker { phase, since });
}
