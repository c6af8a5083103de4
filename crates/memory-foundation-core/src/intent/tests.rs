use std::sync::{Arc, Mutex};

use proptest::prelude::*;
use serde_json::json;
use time::{Duration, OffsetDateTime};

use super::*;
use crate::clock::SteppingClock;

fn fixture_time() -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
}

fn fixture_lock() -> IntentLock {
    IntentLock::new(Arc::new(SteppingClock::new(fixture_time(), Duration::seconds(1))))
}

fn fixture_lock_with(limits: IntentLimits) -> IntentLock {
    IntentLock::with_limits(
        Arc::new(SteppingClock::new(fixture_time(), Duration::seconds(1))),
        limits,
    )
}

fn create_ok(lock: &mut IntentLock, description: &str, priority: IntentPriority) -> Intent {
    match lock.create(CreateIntentInput::new(IntentType::Update, description).with_priority(priority)) {
        Ok(intent) => intent,
        Err(err) => panic!("create should succeed: {err}"),
    }
}

fn step_ok(result: Result<Intent, IntentError>, step: &str) -> Intent {
    match result {
        Ok(intent) => intent,
        Err(err) => panic!("{step} should succeed: {err}"),
    }
}

fn running(lock: &mut IntentLock, description: &str) -> Intent {
    let intent = create_ok(lock, description, IntentPriority::Normal);
    step_ok(lock.lock(intent.id), "lock");
    step_ok(lock.execute(intent.id), "execute")
}

// Test IDs: TLCK-001
#[test]
fn intent_walks_the_happy_path_and_records_each_transition() {
    let mut lock = fixture_lock();
    let created = match lock.create(
        CreateIntentInput::new(IntentType::Create, "add alice's eye colour")
            .with_payload(json!({ "subject": "alice", "predicate": "eyes" })),
    ) {
        Ok(intent) => intent,
        Err(err) => panic!("create should succeed: {err}"),
    };
    assert_eq!(created.state, IntentState::Pending);
    assert_eq!(created.priority, IntentPriority::Normal);
    assert!(created.verify_hash());

    step_ok(lock.lock(created.id), "lock");
    let executing = step_ok(lock.execute(created.id), "execute");
    assert_eq!(lock.get_current().map(|intent| intent.id), Some(created.id));
    assert_ne!(executing.hash, created.hash);

    let done = step_ok(lock.complete(created.id, Some(json!({ "factId": "f-1" }))), "complete");
    assert_eq!(done.state, IntentState::Complete);
    assert_eq!(done.result, Some(json!({ "factId": "f-1" })));
    assert!(lock.get_current().is_none());
    assert!(lock.get_queue().is_empty());

    let actions: Vec<IntentAction> =
        lock.get_history(created.id).iter().map(|transition| transition.action).collect();
    assert_eq!(
        actions,
        vec![IntentAction::Create, IntentAction::Lock, IntentAction::Execute, IntentAction::Complete]
    );
    assert!(lock.get_history(created.id).iter().all(|transition| transition.actor == "system"));

    let metrics = lock.get_metrics();
    assert_eq!(metrics.total_created, 1);
    assert_eq!(metrics.total_completed, 1);
    assert_eq!(metrics.by_state.get(&IntentState::Complete), Some(&1));
    assert_eq!(metrics.by_type.get(&IntentType::Create), Some(&1));
    assert!((metrics.avg_execution_time_ms - 1_000.0).abs() < f64::EPSILON);
    assert!(lock.verify_no_ambiguity().valid);
}

// Test IDs: TLCK-002
#[test]
fn second_intent_cannot_execute_while_lock_is_held() {
    let mut lock = fixture_lock();
    let first = running(&mut lock, "first");
    let second = create_ok(&mut lock, "second", IntentPriority::Critical);
    step_ok(lock.lock(second.id), "lock");

    match lock.execute(second.id) {
        Err(err) => {
            assert_eq!(err, IntentError::AlreadyExecuting { current: first.id });
            assert_eq!(err.code(), "ALREADY_EXECUTING");
        }
        Ok(intent) => panic!("second execution should be refused: {intent:?}"),
    }
    assert_eq!(lock.get_intent(second.id).map(|intent| intent.state), Some(IntentState::Locked));

    step_ok(lock.complete(first.id, None), "complete");
    let second = step_ok(lock.execute(second.id), "execute");
    assert_eq!(second.state, IntentState::Executing);
    assert_eq!(lock.get_metrics().current_executing, 1);
}

// Test IDs: TLCK-003
#[test]
fn actions_outside_the_transition_table_are_rejected() {
    let mut lock = fixture_lock();
    let intent = create_ok(&mut lock, "rename bob", IntentPriority::Low);

    for (attempt, action) in [
        (lock.execute(intent.id), IntentAction::Execute),
        (lock.complete(intent.id, None), IntentAction::Complete),
        (lock.reset(intent.id), IntentAction::Reset),
        (lock.retry(intent.id), IntentAction::Retry),
    ] {
        match attempt {
            Err(err) => {
                assert_eq!(err.code(), "INVALID_TRANSITION");
                assert_eq!(
                    err,
                    IntentError::InvalidTransition { id: intent.id, from: IntentState::Pending, action }
                );
            }
            Ok(intent) => panic!("{action} from PENDING should fail: {intent:?}"),
        }
    }
    assert_eq!(lock.get_history(intent.id).len(), 1);

    let missing = IntentId(ulid::Ulid::nil());
    assert_eq!(lock.lock(missing), Err(IntentError::IntentNotFound(missing)));
    assert_eq!(IntentAction::Cancel.target(IntentState::Executing), None);
    assert_eq!(IntentAction::Cancel.target(IntentState::Locked), Some(IntentState::Idle));
}

// Test IDs: TLCK-004
#[test]
fn queue_orders_by_priority_then_arrival() {
    let mut lock = fixture_lock();
    let low = create_ok(&mut lock, "low", IntentPriority::Low);
    let normal = create_ok(&mut lock, "normal", IntentPriority::Normal);
    let critical = create_ok(&mut lock, "critical", IntentPriority::Critical);
    let normal_later = create_ok(&mut lock, "normal later", IntentPriority::Normal);

    let order: Vec<IntentId> = lock.get_queue().iter().map(|queued| queued.intent.id).collect();
    assert_eq!(order, vec![critical.id, normal.id, normal_later.id, low.id]);
    assert_eq!(lock.get_queue()[0].priority_score, IntentPriority::Critical.score());
    assert_eq!(lock.get_next_in_queue().map(|intent| intent.id), Some(critical.id));

    step_ok(lock.lock(critical.id), "lock");
    assert_eq!(lock.get_queue().len(), 4);
    assert_eq!(lock.get_next_in_queue().map(|intent| intent.id), Some(normal.id));

    step_ok(lock.execute(critical.id), "execute");
    assert_eq!(lock.get_queue().len(), 3);
    assert_eq!(lock.get_metrics().current_pending, 3);
}

// Test IDs: TLCK-005
#[test]
fn retries_are_bounded_and_reset_clears_failure() {
    let mut lock = fixture_lock_with(IntentLimits { max_retries: 1, ..IntentLimits::default() });
    let intent = running(&mut lock, "merge timelines");
    let failed = step_ok(
        lock.fail(intent.id, IntentFailureCode::ExecutionError, "store refused"),
        "fail",
    );
    assert_eq!(failed.failure_code, Some(IntentFailureCode::ExecutionError));
    assert!(lock.get_current().is_none());

    let retried = step_ok(lock.retry(intent.id), "retry");
    assert_eq!(retried.state, IntentState::Pending);
    assert_eq!(retried.retry_count, 1);
    assert_eq!(retried.failure_code, None);
    assert_eq!(lock.get_next_in_queue().map(|queued| queued.id), Some(intent.id));

    step_ok(lock.lock(intent.id), "lock");
    step_ok(lock.execute(intent.id), "execute");
    step_ok(lock.fail(intent.id, IntentFailureCode::Unknown, "again"), "fail");
    match lock.retry(intent.id) {
        Err(err) => assert_eq!(err.code(), "MAX_RETRIES_EXCEEDED"),
        Ok(intent) => panic!("retry budget should be spent: {intent:?}"),
    }

    let idle = step_ok(lock.reset(intent.id), "reset");
    assert_eq!(idle.state, IntentState::Idle);
    assert_eq!(idle.failure_code, None);
    assert_eq!(idle.failure_message, None);
    assert_eq!(lock.get_metrics().total_failed, 2);
    assert!(lock.verify_no_ambiguity().valid);
}

// Test IDs: TLCK-006
#[test]
fn create_validates_description_payload_and_queue_room() {
    let mut lock = fixture_lock_with(IntentLimits {
        max_queue_size: 1,
        max_payload_bytes: 16,
        ..IntentLimits::default()
    });

    let blank = lock.create(CreateIntentInput::new(IntentType::Query, "  "));
    assert_eq!(blank.map_err(|err| err.code()), Err("INVALID_PAYLOAD"));

    let array = lock.create(CreateIntentInput::new(IntentType::Query, "scan").with_payload(json!([1, 2])));
    assert_eq!(array.map_err(|err| err.code()), Err("INVALID_PAYLOAD"));

    let large = lock.create(
        CreateIntentInput::new(IntentType::Query, "scan")
            .with_payload(json!({ "text": "far more than sixteen bytes" })),
    );
    assert_eq!(large.map_err(|err| err.code()), Err("PAYLOAD_TOO_LARGE"));

    create_ok(&mut lock, "first", IntentPriority::Normal);
    let full = lock.create(CreateIntentInput::new(IntentType::Query, "second"));
    assert_eq!(full, Err(IntentError::QueueFull { max: 1 }));
    assert_eq!(lock.count(), 1);

    assert_eq!("critical".parse::<IntentPriority>(), Ok(IntentPriority::Critical));
    assert_eq!(
        "URGENT".parse::<IntentPriority>().map_err(|err| err.code()),
        Err("INVALID_PRIORITY")
    );
    assert_eq!("wizard".parse::<IntentType>().map_err(|err| err.code()), Err("INVALID_TYPE"));
}

// Test IDs: TLCK-007
#[test]
fn cancel_returns_to_idle_and_frees_queue_room() {
    let mut lock = fixture_lock_with(IntentLimits { max_queue_size: 1, ..IntentLimits::default() });
    let intent = create_ok(&mut lock, "drop chapter", IntentPriority::High);
    step_ok(lock.lock(intent.id), "lock");

    let cancelled = step_ok(lock.cancel(intent.id, "author changed mind"), "cancel");
    assert_eq!(cancelled.state, IntentState::Idle);
    assert_eq!(cancelled.failure_code, Some(IntentFailureCode::Cancelled));
    assert_eq!(cancelled.failure_message.as_deref(), Some("author changed mind"));
    assert!(lock.get_queue().is_empty());

    create_ok(&mut lock, "replacement", IntentPriority::Normal);
    assert_eq!(lock.get_queue().len(), 1);
}

// Test IDs: TLCK-008
#[test]
fn executing_intent_times_out_after_the_limit() {
    let mut lock =
        fixture_lock_with(IntentLimits { execution_timeout_ms: 2_000, ..IntentLimits::default() });
    let intent = running(&mut lock, "slow import");

    match lock.expire_timeouts() {
        Ok(None) => {}
        other => panic!("one second in should not time out: {other:?}"),
    }
    let expired = match lock.expire_timeouts() {
        Ok(Some(expired)) => expired,
        other => panic!("two seconds in should time out: {other:?}"),
    };
    assert_eq!(expired.id, intent.id);
    assert_eq!(expired.state, IntentState::Failed);
    assert_eq!(expired.failure_code, Some(IntentFailureCode::Timeout));
    assert!(lock.get_current().is_none());
    assert!(matches!(lock.expire_timeouts(), Ok(None)));
}

// Test IDs: TLCK-009
#[test]
fn listeners_see_previous_state_and_panics_are_contained() {
    let mut lock = fixture_lock();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let listener = lock.add_listener(move |event: &IntentEvent| {
        if let Ok(mut events) = sink.lock() {
            events.push((event.previous.state, event.intent.state, event.transition.action));
        }
    });
    lock.add_listener(|_: &IntentEvent| panic!("listener failure"));

    let intent = create_ok(&mut lock, "observe", IntentPriority::Normal);
    step_ok(lock.lock(intent.id), "lock");
    assert!(lock.remove_listener(listener));
    step_ok(lock.cancel(intent.id, "stop"), "cancel");

    let events = seen.lock().map(|events| events.clone()).unwrap_or_default();
    assert_eq!(
        events,
        vec![
            (IntentState::Idle, IntentState::Pending, IntentAction::Create),
            (IntentState::Pending, IntentState::Locked, IntentAction::Lock),
        ]
    );
    assert!(!lock.remove_listener(listener));
}

// Test IDs: TLCK-010
#[test]
fn ambiguity_check_flags_tampered_intents_and_history() {
    let mut lock = fixture_lock();
    let first = running(&mut lock, "first");
    let second = create_ok(&mut lock, "second", IntentPriority::Normal);
    assert!(lock.verify_no_ambiguity().valid);

    if let Some(intent) = lock.intents.get_mut(&second.id) {
        intent.state = IntentState::Executing;
        intent.description = "rewritten".to_string();
    }
    let report = lock.verify_no_ambiguity();
    assert!(!report.valid);
    assert!(report.errors.iter().any(|error| error.contains("2 intents are executing")));
    assert!(report.errors.iter().any(|error| error.contains("last transition ends in PENDING")));
    assert!(report.errors.iter().any(|error| error.contains(&format!("hash mismatch for intent {}", second.id))));
    assert!(!report.errors.iter().any(|error| error.contains(&first.id.to_string())));
}

// Test IDs: TLCK-011
#[test]
fn clear_drops_intents_lock_and_listeners() {
    let mut lock = fixture_lock();
    let listener = lock.add_listener(|_: &IntentEvent| {});
    running(&mut lock, "busy");

    lock.clear();
    assert_eq!(lock.count(), 0);
    assert!(lock.get_current().is_none());
    assert!(lock.get_queue().is_empty());
    assert!(!lock.remove_listener(listener));
    assert_eq!(lock.get_metrics().total_created, 0);
    running(&mut lock, "fresh");
}

// Test IDs: TLCK-012
#[test]
fn intent_serializes_with_screaming_enums_and_type_key() {
    let mut lock = fixture_lock();
    let intent = create_ok(&mut lock, "serialize", IntentPriority::High);
    let value = match serde_json::to_value(&intent) {
        Ok(value) => value,
        Err(err) => panic!("intent should serialize: {err}"),
    };
    assert_eq!(value["type"], "UPDATE");
    assert_eq!(value["state"], "PENDING");
    assert_eq!(value["priority"], "HIGH");
    assert_eq!(value["metadata"]["createdBy"], "system");
    assert!(value.get("failureCode").is_none());

    let parsed: Intent = match serde_json::from_value(value) {
        Ok(parsed) => parsed,
        Err(err) => panic!("intent should deserialize: {err}"),
    };
    assert_eq!(parsed, intent);
    assert!(parsed.verify_hash());
}

proptest! {
    // Test IDs: TLCK-013
    #[test]
    fn random_action_sequences_never_leave_two_intents_executing(
        steps in proptest::collection::vec((0_u8..7, 0_usize..3), 1..40),
    ) {
        let mut lock = fixture_lock();
        let ids: Vec<IntentId> = ["a", "b", "c"]
            .into_iter()
            .map(|description| create_ok(&mut lock, description, IntentPriority::Normal).id)
            .collect();

        for (action, index) in steps {
            let id = ids[index];
            let _ = match action {
                0 => lock.lock(id),
                1 => lock.execute(id),
                2 => lock.complete(id, None),
                3 => lock.fail(id, IntentFailureCode::Unknown, "random"),
                4 => lock.cancel(id, "random"),
                5 => lock.reset(id),
                _ => lock.retry(id),
            };
            prop_assert!(lock.get_by_state(IntentState::Executing).len() <= 1);
        }
        let report = lock.verify_no_ambiguity();
        prop_assert!(report.valid, "{:?}", report.errors);
    }
}
