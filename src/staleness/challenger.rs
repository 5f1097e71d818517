//! Operator condition challenger
//!
//! Asks each target to prove it is still reconciling its status: once a
//! record's newest condition transition is older than the challenge interval,
//! every tracked condition message is prefixed with the challenge sentinel.
//! An active owner rewrites its conditions on its next reconcile, which
//! clears the sentinel. The staleness checker watches for the owners that
//! don't.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info};

use super::phase::{detect_phase, mark, PhaseProtocol};
use super::sentinel::challenge_message;
use crate::clock::{saturating_add, to_time_delta, Clock};
use crate::conditions::{filter_tracked, tracked_mut};
use crate::controller::Reconciler;
use crate::store::{StatusStore, StoreError};
use crate::types::{ConditionType, Phase, StatusRecord};

/// Challenger tuning
#[derive(Debug, Clone, Copy)]
pub struct ChallengerOptions {
    /// Minimum spacing between challenge episodes for one target
    pub challenge_interval: Duration,
    pub protocol: PhaseProtocol,
}

/// Issues liveness challenges against status records
pub struct Challenger {
    store: Arc<dyn StatusStore>,
    clock: Arc<dyn Clock>,
    challenge_interval: TimeDelta,
    protocol: PhaseProtocol,
    /// Name -> earliest time the next challenge may be issued. Only moves forward.
    schedule: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Challenger {
    pub fn new(store: Arc<dyn StatusStore>, clock: Arc<dyn Clock>, options: ChallengerOptions) -> Self {
        Self {
            store,
            clock,
            challenge_interval: to_time_delta(options.challenge_interval),
            protocol: options.protocol,
            schedule: Mutex::new(HashMap::new()),
        }
    }

    /// Scheduled time of the next eligible challenge for a target
    pub fn next_check(&self, name: &str) -> Option<DateTime<Utc>> {
        self.schedule().get(name).copied()
    }

    fn schedule(&self) -> MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Merge a candidate into the schedule, never moving it earlier
    fn advance_schedule(&self, name: &str, candidate: DateTime<Utc>) -> DateTime<Utc> {
        let mut schedule = self.schedule();
        let entry = schedule.entry(name.to_string()).or_insert(candidate);
        if candidate > *entry {
            *entry = candidate;
        }
        *entry
    }

    /// Evaluate one target and challenge it if it is due
    pub async fn sync_target(&self, name: &str) -> Result<(), StoreError> {
        let record = match self.store.get(name).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => {
                debug!(target_name = name, "Status record gone, nothing to challenge");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let phase = detect_phase(&record, self.protocol);
        if phase != Phase::Normal {
            debug!(target_name = name, %phase, "Episode already open");
            return Ok(());
        }

        if record.is_condition_true(&ConditionType::disabled()) {
            debug!(target_name = name, "Operator is disabled, not challenging");
            return Ok(());
        }

        let Some(last_update) = filter_tracked(&record.conditions)
            .iter()
            .map(|c| c.last_transition_time)
            .max()
        else {
            debug!(target_name = name, "No tracked conditions to challenge");
            return Ok(());
        };

        let candidate = saturating_add(last_update, self.challenge_interval);
        let next_check = self.advance_schedule(name, candidate);

        let now = self.clock.now();
        if now < next_check {
            debug!(target_name = name, next_check = %next_check, "Not yet due for a challenge");
            return Ok(());
        }

        let expected_version = record.resource_version;
        let challenged = challenge_record(record, self.protocol, now);
        self.store.update(challenged, expected_version).await?;

        info!(
            target_name = name,
            last_update = %last_update,
            "Challenged operator to reassert its status"
        );

        self.schedule()
            .insert(name.to_string(), saturating_add(now, self.challenge_interval));
        Ok(())
    }
}

/// Copy of `record` carrying an open challenge
fn challenge_record(mut record: StatusRecord, protocol: PhaseProtocol, now: DateTime<Utc>) -> StatusRecord {
    if protocol.writes_sentinel_text() {
        for condition in tracked_mut(&mut record.conditions) {
            condition.message = challenge_message(&condition.message);
        }
    }
    mark(&mut record, Phase::Challenging, now);
    record
}

#[async_trait]
impl Reconciler for Challenger {
    fn name(&self) -> &'static str {
        "OperatorConditionChallenger"
    }

    async fn sync(&self, target: &str) -> Result<(), StoreError> {
        self.sync_target(target).await
    }
}
