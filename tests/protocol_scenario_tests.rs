//! Challenge/response protocol scenarios
//!
//! Drives the challenger and staleness checker by hand against the in-memory
//! store with a manual clock, the way the two controllers would.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use staleguard::clock::{Clock, ManualClock};
use staleguard::events::{EventKind, MemoryRecorder};
use staleguard::staleness::detect_phase;
use staleguard::{
    Challenger, ChallengerOptions, CheckerOptions, Condition, ConditionStatus, ConditionType,
    InMemoryStatusStore, Phase, PhaseProtocol, StalenessChecker, StatusRecord, StatusStore,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 14, 9, 0, 0).unwrap()
}

struct Loops {
    store: Arc<InMemoryStatusStore>,
    clock: ManualClock,
    recorder: Arc<MemoryRecorder>,
    challenger: Challenger,
    checker: StalenessChecker,
    protocol: PhaseProtocol,
}

impl Loops {
    fn new(protocol: PhaseProtocol) -> Self {
        let store = Arc::new(InMemoryStatusStore::new());
        let clock = ManualClock::new(t0());
        let recorder = Arc::new(MemoryRecorder::new());
        let challenger = Challenger::new(
            store.clone(),
            Arc::new(clock.clone()),
            ChallengerOptions {
                challenge_interval: Duration::from_secs(60),
                protocol,
            },
        );
        let checker = StalenessChecker::new(
            store.clone(),
            Arc::new(clock.clone()),
            recorder.clone(),
            CheckerOptions {
                response_grace_period: Duration::from_secs(60),
                protocol,
            },
        );
        Self {
            store,
            clock,
            recorder,
            challenger,
            checker,
            protocol,
        }
    }

    async fn sync_both(&self, name: &str) {
        self.challenger.sync_target(name).await.unwrap();
        self.checker.sync_target(name).await.unwrap();
    }

    async fn phase(&self, name: &str) -> Phase {
        detect_phase(&self.store.get(name).await.unwrap(), self.protocol)
    }
}

fn kube_apiserver() -> StatusRecord {
    StatusRecord::new("kube-apiserver").with_condition(
        Condition::new(ConditionType::Degraded, ConditionStatus::False, t0() - TimeDelta::seconds(90))
            .with_reason("OkReason")
            .with_message("cool message"),
    )
}

#[tokio::test]
async fn unanswered_challenge_ends_stale() {
    let loops = Loops::new(PhaseProtocol::DualWrite);
    loops.store.create(kube_apiserver()).await.unwrap();

    // T: challenged, deadline starts
    loops.sync_both("kube-apiserver").await;

    let record = loops.store.get("kube-apiserver").await.unwrap();
    let degraded = record.condition(&ConditionType::Degraded).unwrap();
    assert_eq!(
        degraded.message,
        "Checking for stale status, the active operator will reset this message: cool message"
    );
    assert_eq!(degraded.status, ConditionStatus::False);
    assert_eq!(loops.phase("kube-apiserver").await, Phase::Challenging);
    assert_eq!(
        loops.checker.deadline("kube-apiserver"),
        Some(t0() + TimeDelta::seconds(60))
    );

    // T+30s: still inside the grace period
    loops.clock.advance(TimeDelta::seconds(30));
    loops.sync_both("kube-apiserver").await;
    assert_eq!(loops.phase("kube-apiserver").await, Phase::Challenging);

    // T+61s: stale
    loops.clock.advance(TimeDelta::seconds(31));
    loops.sync_both("kube-apiserver").await;

    let record = loops.store.get("kube-apiserver").await.unwrap();
    let degraded = record.condition(&ConditionType::Degraded).unwrap();
    assert_eq!(degraded.status, ConditionStatus::True);
    assert_eq!(degraded.reason, "OperatorFailedStalenessCheck");
    assert_eq!(
        degraded.message,
        "Operator has not fixed status in at least 1m0s.  Last reason was \"OkReason\", last status was: cool message"
    );
    assert_eq!(degraded.last_transition_time, t0() + TimeDelta::seconds(61));
    assert_eq!(loops.phase("kube-apiserver").await, Phase::Stale);
    assert_eq!(record.marked_phase(), Phase::Stale);
    assert_eq!(loops.checker.deadline("kube-apiserver"), None);

    let events = loops.recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::Warning);
    assert_eq!(events[0].target, "kube-apiserver");
    assert_eq!(events[0].reason, "OperatorFailedStalenessCheck");

    // Stale is terminal for both loops until the owner writes again
    let writes = loops.store.update_count();
    loops.clock.advance(TimeDelta::minutes(10));
    loops.sync_both("kube-apiserver").await;
    assert_eq!(loops.store.update_count(), writes);
    assert_eq!(loops.recorder.events().len(), 1);
}

#[tokio::test]
async fn owner_answering_clears_the_challenge() {
    let loops = Loops::new(PhaseProtocol::DualWrite);
    loops.store.create(kube_apiserver()).await.unwrap();

    loops.sync_both("kube-apiserver").await;
    assert_eq!(loops.phase("kube-apiserver").await, Phase::Challenging);

    // The owner reasserts its conditions
    loops.clock.advance(TimeDelta::seconds(20));
    loops.store.apply(kube_apiserver()).await.unwrap();
    loops.sync_both("kube-apiserver").await;

    assert_eq!(loops.phase("kube-apiserver").await, Phase::Normal);
    assert_eq!(loops.checker.deadline("kube-apiserver"), None);

    // Past the old deadline nothing is declared stale
    loops.clock.advance(TimeDelta::seconds(45));
    loops.sync_both("kube-apiserver").await;
    assert_eq!(loops.phase("kube-apiserver").await, Phase::Normal);
    assert!(loops.recorder.events().is_empty());

    // The next episode opens one interval after the previous challenge
    loops.clock.set(t0() + TimeDelta::seconds(60));
    loops.sync_both("kube-apiserver").await;
    assert_eq!(loops.phase("kube-apiserver").await, Phase::Challenging);
}

#[tokio::test]
async fn stale_owner_recovers_by_writing_again() {
    let loops = Loops::new(PhaseProtocol::DualWrite);
    loops.store.create(kube_apiserver()).await.unwrap();

    loops.sync_both("kube-apiserver").await;
    loops.clock.advance(TimeDelta::seconds(61));
    loops.sync_both("kube-apiserver").await;
    assert_eq!(loops.phase("kube-apiserver").await, Phase::Stale);

    let fresh = StatusRecord::new("kube-apiserver").with_condition(
        Condition::new(ConditionType::Degraded, ConditionStatus::False, loops.clock.now())
            .with_reason("OkReason")
            .with_message("cool message"),
    );
    loops.store.apply(fresh).await.unwrap();
    loops.sync_both("kube-apiserver").await;

    assert_eq!(loops.phase("kube-apiserver").await, Phase::Normal);
}

#[tokio::test]
async fn extension_conditions_and_upgradeable_false_survive() {
    let loops = Loops::new(PhaseProtocol::DualWrite);
    let old = t0() - TimeDelta::minutes(5);
    loops
        .store
        .create(
            StatusRecord::new("machine-config")
                .with_condition(Condition::new(ConditionType::Upgradeable, ConditionStatus::False, old).with_message("pools updating"))
                .with_condition(Condition::new(ConditionType::Available, ConditionStatus::True, old).with_message("ok"))
                .with_condition(
                    Condition::new(ConditionType::from("VendorSpecific".to_string()), ConditionStatus::True, old)
                        .with_reason("Vendor")
                        .with_message("vendor text"),
                ),
        )
        .await
        .unwrap();

    loops.sync_both("machine-config").await;
    loops.clock.advance(TimeDelta::seconds(61));
    loops.sync_both("machine-config").await;

    let record = loops.store.get("machine-config").await.unwrap();
    assert_eq!(
        record.condition(&ConditionType::Upgradeable).unwrap().status,
        ConditionStatus::False
    );
    assert_eq!(
        record.condition(&ConditionType::Available).unwrap().status,
        ConditionStatus::Unknown
    );

    let vendor = record
        .condition(&ConditionType::from("VendorSpecific".to_string()))
        .unwrap();
    assert_eq!(vendor.status, ConditionStatus::True);
    assert_eq!(vendor.reason, "Vendor");
    assert_eq!(vendor.message, "vendor text");
}

#[tokio::test]
async fn disabled_target_is_never_challenged() {
    let loops = Loops::new(PhaseProtocol::DualWrite);
    let old = t0() - TimeDelta::hours(1);
    loops
        .store
        .create(
            kube_apiserver()
                .with_condition(Condition::new(ConditionType::disabled(), ConditionStatus::True, old)),
        )
        .await
        .unwrap();

    for _ in 0..3 {
        loops.sync_both("kube-apiserver").await;
        loops.clock.advance(TimeDelta::minutes(5));
    }

    assert_eq!(loops.store.update_count(), 0);
    assert_eq!(loops.phase("kube-apiserver").await, Phase::Normal);
}

#[tokio::test]
async fn structured_protocol_leaves_messages_alone() {
    let loops = Loops::new(PhaseProtocol::Structured);
    loops.store.create(kube_apiserver()).await.unwrap();

    loops.sync_both("kube-apiserver").await;
    let record = loops.store.get("kube-apiserver").await.unwrap();
    assert_eq!(record.marked_phase(), Phase::Challenging);
    assert_eq!(
        record.condition(&ConditionType::Degraded).unwrap().message,
        "cool message"
    );

    loops.clock.advance(TimeDelta::seconds(61));
    loops.sync_both("kube-apiserver").await;

    let record = loops.store.get("kube-apiserver").await.unwrap();
    let degraded = record.condition(&ConditionType::Degraded).unwrap();
    assert_eq!(record.marked_phase(), Phase::Stale);
    assert_eq!(degraded.status, ConditionStatus::True);
    assert_eq!(degraded.reason, "OperatorFailedStalenessCheck");
    assert_eq!(
        degraded.message,
        "Operator has not fixed status in at least 1m0s.  Last reason was \"OkReason\", last status was: cool message"
    );
}
