//! Operator staleness checker
//!
//! Watches records under challenge. The first time this loop sees a given
//! challenge it starts its own response deadline; if the challenge is still
//! open once the deadline passes, every tracked condition is rewritten to say
//! the reported health can no longer be trusted.
//!
//! Per-type downgrade:
//! - Degraded    -> True
//! - Upgradeable -> False stays False, anything else becomes Unknown
//! - others      -> Unknown

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, warn};

use super::phase::{detect_phase, mark, PhaseProtocol};
use super::sentinel::{format_go_duration, stale_message, strip_challenge, STALE_REASON};
use crate::clock::{saturating_add, to_time_delta, Clock};
use crate::conditions::tracked_mut;
use crate::controller::Reconciler;
use crate::events::{Event, EventRecorder};
use crate::store::{StatusStore, StoreError};
use crate::types::{ConditionStatus, ConditionType, Phase, StatusRecord};

/// Staleness checker tuning
#[derive(Debug, Clone, Copy)]
pub struct CheckerOptions {
    /// How long an owner has to clear an open challenge
    pub response_grace_period: Duration,
    pub protocol: PhaseProtocol,
}

/// Declares targets stale when they leave a challenge unanswered
pub struct StalenessChecker {
    store: Arc<dyn StatusStore>,
    clock: Arc<dyn Clock>,
    recorder: Arc<dyn EventRecorder>,
    grace: Duration,
    grace_delta: TimeDelta,
    protocol: PhaseProtocol,
    /// Name -> response deadline of the currently open challenge
    deadlines: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl StalenessChecker {
    pub fn new(
        store: Arc<dyn StatusStore>,
        clock: Arc<dyn Clock>,
        recorder: Arc<dyn EventRecorder>,
        options: CheckerOptions,
    ) -> Self {
        Self {
            store,
            clock,
            recorder,
            grace: options.response_grace_period,
            grace_delta: to_time_delta(options.response_grace_period),
            protocol: options.protocol,
            deadlines: Mutex::new(HashMap::new()),
        }
    }

    /// Response deadline currently tracked for a target
    pub fn deadline(&self, name: &str) -> Option<DateTime<Utc>> {
        self.deadlines().get(name).copied()
    }

    fn deadlines(&self) -> MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.deadlines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Evaluate one target and declare it stale if its challenge expired
    pub async fn sync_target(&self, name: &str) -> Result<(), StoreError> {
        let record = match self.store.get(name).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => {
                debug!(target_name = name, "Status record gone, nothing to check");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if detect_phase(&record, self.protocol) != Phase::Challenging {
            if self.deadlines().remove(name).is_some() {
                debug!(target_name = name, "Challenge resolved, clearing deadline");
            }
            return Ok(());
        }

        let now = self.clock.now();
        let deadline = {
            let mut deadlines = self.deadlines();
            match deadlines.get(name) {
                Some(deadline) => *deadline,
                None => {
                    let deadline = saturating_add(now, self.grace_delta);
                    deadlines.insert(name.to_string(), deadline);
                    debug!(target_name = name, deadline = %deadline, "Observed new challenge");
                    return Ok(());
                }
            }
        };

        if now < deadline {
            return Ok(());
        }

        let grace = format_go_duration(self.grace);
        let expected_version = record.resource_version;
        let stale = stale_record(record, self.grace, self.protocol, now);

        self.store.update(stale, expected_version).await?;
        self.deadlines().remove(name);

        warn!(
            target_name = name,
            grace = %grace,
            "Operator did not answer staleness challenge, marked status stale"
        );
        self.recorder.record(Event::warning(
            now,
            name,
            STALE_REASON,
            format!(
                "Operator {name} did not reset its status within {grace}; its conditions are no longer trusted"
            ),
        ));
        Ok(())
    }
}

/// Copy of `record` with every tracked condition downgraded
fn stale_record(
    mut record: StatusRecord,
    grace: Duration,
    protocol: PhaseProtocol,
    now: DateTime<Utc>,
) -> StatusRecord {
    for condition in tracked_mut(&mut record.conditions) {
        let status = match condition.condition_type {
            ConditionType::Degraded => ConditionStatus::True,
            ConditionType::Upgradeable if condition.status == ConditionStatus::False => {
                ConditionStatus::False
            }
            _ => ConditionStatus::Unknown,
        };
        if status != condition.status {
            condition.status = status;
            condition.last_transition_time = now;
        }

        let last_message = if protocol.writes_sentinel_text() {
            strip_challenge(&condition.message)
        } else {
            condition.message.as_str()
        };
        condition.message = stale_message(grace, &condition.reason, last_message);
        condition.reason = STALE_REASON.to_string();
    }
    mark(&mut record, Phase::Stale, now);
    record
}

#[async_trait]
impl Reconciler for StalenessChecker {
    fn name(&self) -> &'static str {
        "OperatorStalenessChecker"
    }

    async fn sync(&self, target: &str) -> Result<(), StoreError> {
        self.sync_target(target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::MemoryRecorder;
    use crate::staleness::sentinel::challenge_message;
    use crate::store::InMemoryStatusStore;
    use crate::types::Condition;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    struct Harness {
        store: Arc<InMemoryStatusStore>,
        clock: ManualClock,
        recorder: Arc<MemoryRecorder>,
        checker: StalenessChecker,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryStatusStore::new());
        let clock = ManualClock::new(t0());
        let recorder = Arc::new(MemoryRecorder::new());
        let checker = StalenessChecker::new(
            store.clone(),
            Arc::new(clock.clone()),
            recorder.clone(),
            CheckerOptions {
                response_grace_period: Duration::from_secs(60),
                protocol: PhaseProtocol::DualWrite,
            },
        );
        Harness { store, clock, recorder, checker }
    }

    fn challenged(condition_type: ConditionType, status: ConditionStatus) -> Condition {
        Condition::new(condition_type, status, t0() - TimeDelta::minutes(5))
            .with_reason("AsExpected")
            .with_message(challenge_message("fine"))
    }

    /// Store failing every update, for retry-path checks
    struct FailingUpdates(InMemoryStatusStore);

    #[async_trait]
    impl StatusStore for FailingUpdates {
        async fn get(&self, name: &str) -> Result<StatusRecord, StoreError> {
            self.0.get(name).await
        }
        async fn list(&self) -> Result<Vec<StatusRecord>, StoreError> {
            self.0.list().await
        }
        async fn create(&self, record: StatusRecord) -> Result<StatusRecord, StoreError> {
            self.0.create(record).await
        }
        async fn update(&self, record: StatusRecord, _expected: u64) -> Result<StatusRecord, StoreError> {
            Err(StoreError::Conflict {
                name: record.name,
                expected: 0,
                actual: 0,
            })
        }
        fn watch(&self) -> tokio::sync::broadcast::Receiver<String> {
            self.0.watch()
        }
        fn backend_name(&self) -> &'static str {
            "failing"
        }
    }

    #[tokio::test]
    async fn first_observation_only_sets_deadline() {
        let h = harness();
        h.store
            .create(StatusRecord::new("etcd").with_condition(challenged(ConditionType::Available, ConditionStatus::True)))
            .await
            .unwrap();

        h.checker.sync_target("etcd").await.unwrap();

        assert_eq!(h.checker.deadline("etcd"), Some(t0() + TimeDelta::seconds(60)));
        assert_eq!(h.store.update_count(), 0);
        assert!(h.recorder.events().is_empty());
    }

    #[tokio::test]
    async fn unanswered_challenge_downgrades_each_type() {
        let h = harness();
        h.store
            .create(
                StatusRecord::new("etcd")
                    .with_condition(challenged(ConditionType::Available, ConditionStatus::True))
                    .with_condition(challenged(ConditionType::Degraded, ConditionStatus::False))
                    .with_condition(challenged(ConditionType::Progressing, ConditionStatus::False))
                    .with_condition(challenged(ConditionType::Upgradeable, ConditionStatus::False))
                    .with_condition(
                        Condition::new("EtcdMembersDegraded", ConditionStatus::False, t0())
                            .with_message("extension"),
                    ),
            )
            .await
            .unwrap();

        h.checker.sync_target("etcd").await.unwrap();
        h.clock.advance(TimeDelta::seconds(61));
        h.checker.sync_target("etcd").await.unwrap();

        let record = h.store.get("etcd").await.unwrap();
        let statuses: Vec<ConditionStatus> = record.conditions.iter().map(|c| c.status).collect();
        assert_eq!(
            statuses,
            vec![
                ConditionStatus::Unknown,
                ConditionStatus::True,
                ConditionStatus::Unknown,
                ConditionStatus::False,
                ConditionStatus::False,
            ]
        );

        let now = t0() + TimeDelta::seconds(61);
        assert_eq!(record.conditions[0].last_transition_time, now);
        // Upgradeable kept its status, so its transition time is untouched
        assert_eq!(record.conditions[3].last_transition_time, t0() - TimeDelta::minutes(5));
        for condition in &record.conditions[..4] {
            assert_eq!(condition.reason, STALE_REASON);
            assert_eq!(
                condition.message,
                "Operator has not fixed status in at least 1m0s.  Last reason was \"AsExpected\", last status was: fine"
            );
        }
        assert_eq!(record.conditions[4].message, "extension");
        assert_eq!(record.marked_phase(), Phase::Stale);

        assert!(h.checker.deadline("etcd").is_none());
        let events = h.recorder.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, STALE_REASON);
        assert_eq!(events[0].target, "etcd");
    }

    #[tokio::test]
    async fn upgradeable_unknown_or_true_becomes_unknown() {
        let h = harness();
        h.store
            .create(StatusRecord::new("etcd").with_condition(challenged(ConditionType::Upgradeable, ConditionStatus::True)))
            .await
            .unwrap();

        h.checker.sync_target("etcd").await.unwrap();
        h.clock.advance(TimeDelta::seconds(60));
        h.checker.sync_target("etcd").await.unwrap();

        let record = h.store.get("etcd").await.unwrap();
        assert_eq!(record.conditions[0].status, ConditionStatus::Unknown);
    }

    #[tokio::test]
    async fn answered_challenge_clears_deadline() {
        let h = harness();
        let created = h
            .store
            .create(StatusRecord::new("etcd").with_condition(challenged(ConditionType::Degraded, ConditionStatus::False)))
            .await
            .unwrap();

        h.checker.sync_target("etcd").await.unwrap();
        assert!(h.checker.deadline("etcd").is_some());

        // Owner reasserts its status
        let mut answered = created.clone();
        answered.conditions[0].message = "fine".to_string();
        h.store.update(answered, created.resource_version).await.unwrap();

        h.clock.advance(TimeDelta::seconds(120));
        h.checker.sync_target("etcd").await.unwrap();

        assert!(h.checker.deadline("etcd").is_none());
        let record = h.store.get("etcd").await.unwrap();
        assert_eq!(record.conditions[0].status, ConditionStatus::False);
        assert!(h.recorder.events().is_empty());
    }

    #[tokio::test]
    async fn failed_write_keeps_deadline_for_retry() {
        let inner = InMemoryStatusStore::new();
        inner
            .create(StatusRecord::new("etcd").with_condition(challenged(ConditionType::Degraded, ConditionStatus::False)))
            .await
            .unwrap();
        let clock = ManualClock::new(t0());
        let recorder = Arc::new(MemoryRecorder::new());
        let checker = StalenessChecker::new(
            Arc::new(FailingUpdates(inner)),
            Arc::new(clock.clone()),
            recorder.clone(),
            CheckerOptions {
                response_grace_period: Duration::from_secs(60),
                protocol: PhaseProtocol::DualWrite,
            },
        );

        checker.sync_target("etcd").await.unwrap();
        clock.advance(TimeDelta::seconds(90));

        let err = checker.sync_target("etcd").await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(checker.deadline("etcd"), Some(t0() + TimeDelta::seconds(60)));

        // Retries that keep conflicting never announce staleness
        checker.sync_target("etcd").await.unwrap_err();
        assert!(recorder.events().is_empty());
    }

    #[tokio::test]
    async fn normal_record_is_ignored() {
        let h = harness();
        h.store
            .create(
                StatusRecord::new("etcd").with_condition(
                    Condition::new(ConditionType::Available, ConditionStatus::True, t0()).with_message("fine"),
                ),
            )
            .await
            .unwrap();

        h.checker.sync_target("etcd").await.unwrap();
        h.checker.sync_target("missing").await.unwrap();

        assert!(h.checker.deadline("etcd").is_none());
        assert_eq!(h.store.update_count(), 0);
    }
}
