//! Operator status liveness protocol
//!
//! Two independent loops share nothing but the status records:
//!
//! ```text
//!   Normal ──(challenger: no change for challenge_interval)──▶ Challenging
//!   Challenging ──(owner rewrites its conditions)──────────────▶ Normal
//!   Challenging ──(checker: unanswered for grace period)───────▶ Stale
//!   Stale ──(owner rewrites its conditions)────────────────────▶ Normal
//! ```
//!
//! Either loop can restart or scale on its own and rebuild its local state
//! from the records alone.

pub mod challenger;
pub mod checker;
pub mod phase;
pub mod sentinel;

pub use challenger::{Challenger, ChallengerOptions};
pub use checker::{CheckerOptions, StalenessChecker};
pub use phase::{detect_phase, PhaseProtocol};
pub use sentinel::{format_go_duration, CHALLENGE_PREFIX, STALE_REASON};
