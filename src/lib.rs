//! Staleguard: operator status liveness watchdog
//!
//! Detects control loops that stopped reconciling their own published status
//! and downgrades that status so consumers stop trusting it.
//!
//! ## Architecture
//!
//! - **Condition Filter**: restricts the protocol to the four well-known condition types
//! - **Challenger**: asks an owner to reassert conditions that have not changed in a while
//! - **Staleness Checker**: rewrites conditions of owners that ignore a challenge
//! - **Controller**: de-duplicating work queue and worker pool driving both loops
//! - **Heartbeat Watchdog**: detects that this process itself was down across a restart
//! - **Status Inbox**: lets owners in other processes publish status while the daemon runs

pub mod clock;
pub mod conditions;
pub mod config;
pub mod controller;
pub mod events;
pub mod heartbeat;
pub mod staleness;
pub mod store;
pub mod types;

// Re-export configuration
pub use config::StaleguardConfig;

// Re-export commonly used types
pub use types::{Condition, ConditionStatus, ConditionType, LivenessMarker, Phase, StatusRecord};

// Re-export the protocol loops and their runtime
pub use controller::{Controller, ControllerOptions, Reconciler};
pub use staleness::{Challenger, ChallengerOptions, CheckerOptions, PhaseProtocol, StalenessChecker};

// Re-export storage
pub use store::{InMemoryStatusStore, SledStatusStore, StatusInbox, StatusStore, StoreError};

// Re-export heartbeat components
pub use heartbeat::{HeartbeatConfig, HeartbeatError, HeartbeatWatchdog, RecoveryCallback};
