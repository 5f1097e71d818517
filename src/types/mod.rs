//! Shared data structures for operator status liveness tracking
//!
//! - `Condition`: one health assertion published by a target operator
//! - `StatusRecord`: the externally persisted status of a target
//! - `LivenessMarker` / `Phase`: structured challenge/staleness state

mod condition;
mod record;

pub use condition::*;
pub use record::*;
