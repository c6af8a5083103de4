use std::sync::Arc;

use proptest::prelude::*;
use time::{Duration, OffsetDateTime};

use super::*;
use crate::clock::SteppingClock;

fn fixture_time() -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
}

fn fixture_tracker() -> ContextTracker {
    ContextTracker::new(Arc::new(SteppingClock::new(fixture_time(), Duration::seconds(1))))
}

fn fixture_tracker_with(limits: ContextLimits) -> ContextTracker {
    ContextTracker::with_limits(
        Arc::new(SteppingClock::new(fixture_time(), Duration::seconds(1))),
        limits,
    )
}

fn add_ok(tracker: &mut ContextTracker, input: AddElementInput) -> ContextElement {
    match tracker.add_element(input) {
        Ok(element) => element,
        Err(err) => panic!("add_element should succeed: {err}"),
    }
}

fn move_ok(tracker: &mut ContextTracker, position: TextPosition) {
    if let Err(err) = tracker.move_to(position) {
        panic!("move_to should succeed: {err}");
    }
}

fn element(tracker: &ContextTracker, id: ElementId) -> &ContextElement {
    match tracker.get_element(id) {
        Some(element) => element,
        None => panic!("element {id} should exist"),
    }
}

fn assert_weight(actual: f64, expected: f64) {
    assert!((actual - expected).abs() < 1e-9, "weight {actual} should be {expected}");
}

// Test IDs: TCTX-001
#[test]
fn move_to_rejects_negative_components() {
    let mut tracker = fixture_tracker();

    let negative_paragraph = tracker.move_to(TextPosition::paragraph(-1));
    let negative_chapter = tracker.move_to(TextPosition::in_chapter(-2, 3));

    assert_eq!(negative_paragraph, Err(ContextError::InvalidPosition("paragraph")));
    assert_eq!(negative_chapter.map_err(|err| err.code()), Err("INVALID_POSITION"));
    assert_eq!(tracker.get_position(), TextPosition::default());
    assert!(tracker.get_history(None).is_empty());
}

// Test IDs: TCTX-002
#[test]
fn scene_element_keeps_active_after_short_move() {
    let mut tracker = fixture_tracker();
    let added =
        add_ok(&mut tracker, AddElementInput::new("char:alice", ElementType::Character).in_scope(ContextScope::Scene));
    assert_weight(added.weight, 1.0);

    for _ in 0..3 {
        if let Err(err) = tracker.advance() {
            panic!("advance should succeed: {err}");
        }
    }
    move_ok(&mut tracker, TextPosition::paragraph(4));

    let decayed = element(&tracker, added.id);
    assert_weight(decayed.weight, 0.6);
    assert_eq!(decayed.state, ElementState::Active);
}

// Test IDs: TCTX-003
#[test]
fn chapter_jump_exits_local_elements_and_spares_global_ones() {
    let mut tracker = fixture_tracker();
    let local = add_ok(&mut tracker, AddElementInput::new("obj:lamp", ElementType::Object));
    let global = add_ok(
        &mut tracker,
        AddElementInput::new("concept:prophecy", ElementType::Concept).in_scope(ContextScope::Global),
    );

    let destination = TextPosition::in_chapter(1, 0);
    move_ok(&mut tracker, destination);

    let local = element(&tracker, local.id);
    assert_weight(local.weight, 0.0);
    assert_eq!(local.state, ElementState::Exited);
    assert_eq!(local.exited_at, Some(destination));

    let global = element(&tracker, global.id);
    assert_weight(global.weight, 1.0);
    assert_eq!(global.state, ElementState::Active);
}

// Test IDs: TCTX-004
#[test]
fn active_element_below_threshold_drops_to_background() {
    let mut tracker = fixture_tracker();
    let mut input = AddElementInput::new("emotion:dread", ElementType::Emotion).in_scope(ContextScope::Scene);
    input.weight = Some(0.15);
    let added = add_ok(&mut tracker, input);

    move_ok(&mut tracker, TextPosition::paragraph(1));

    let decayed = element(&tracker, added.id);
    assert_eq!(decayed.state, ElementState::Background);
    assert!(decayed.weight > 0.0 && decayed.weight < 0.1);

    let reactivated = match tracker.reactivate(added.id, None) {
        Ok(element) => element,
        Err(err) => panic!("reactivate should succeed: {err}"),
    };
    assert_eq!(reactivated.state, ElementState::Active);
    assert_weight(reactivated.weight, 1.0);
}

// Test IDs: TCTX-005
#[test]
fn move_records_decay_then_move_history() {
    let mut tracker = fixture_tracker();
    add_ok(&mut tracker, AddElementInput::new("loc:harbor", ElementType::Location));
    move_ok(&mut tracker, TextPosition::paragraph(2));

    let actions: Vec<ContextAction> =
        tracker.get_history(None).into_iter().map(|entry| entry.action).collect();
    assert_eq!(actions, vec![ContextAction::AddElement, ContextAction::Decay, ContextAction::Move]);

    let last = match tracker.get_history(Some(1)).pop() {
        Some(entry) => entry,
        None => panic!("history should not be empty"),
    };
    assert_eq!(last.state_before, Some(HistoryState::Position(TextPosition::default())));
    assert_eq!(last.state_after, Some(HistoryState::Position(TextPosition::paragraph(2))));
}

// Test IDs: TCTX-006
#[test]
fn history_evicts_oldest_entries_at_depth() {
    let mut tracker =
        fixture_tracker_with(ContextLimits { max_history_depth: 3, ..ContextLimits::default() });
    let mut ids = Vec::new();
    for index in 0..5 {
        ids.push(add_ok(&mut tracker, AddElementInput::new(format!("char:{index}"), ElementType::Character)).id);
    }

    let history = tracker.get_history(None);
    assert_eq!(history.len(), 3);
    let recorded: Vec<Option<ElementId>> = history.iter().map(|entry| entry.element_id).collect();
    assert_eq!(recorded, vec![Some(ids[2]), Some(ids[3]), Some(ids[4])]);
}

// Test IDs: TCTX-007
#[test]
fn adding_same_entity_updates_instead_of_duplicating() {
    let mut tracker = fixture_tracker();
    let first = add_ok(&mut tracker, AddElementInput::new("char:bob", ElementType::Character));
    let mut again = AddElementInput::new("char:bob", ElementType::Character);
    again.weight = Some(0.4);
    let second = add_ok(&mut tracker, again);

    assert_eq!(first.id, second.id);
    assert_eq!(tracker.count(), 1);
    assert_weight(second.weight, 0.4);
    assert_eq!(tracker.get_by_entity_ref("char:bob").map(|element| element.id), Some(first.id));
}

// Test IDs: TCTX-008
#[test]
fn add_element_validates_input_and_scope_cap() {
    let mut tracker =
        fixture_tracker_with(ContextLimits { max_elements_per_scope: 2, ..ContextLimits::default() });

    let blank = tracker.add_element(AddElementInput::new("  ", ElementType::Object));
    assert_eq!(blank, Err(ContextError::InvalidEntityRef));

    let mut heavy = AddElementInput::new("obj:anvil", ElementType::Object);
    heavy.weight = Some(1.5);
    assert_eq!(tracker.add_element(heavy).map_err(|err| err.code()), Err("INVALID_WEIGHT"));

    let first = add_ok(&mut tracker, AddElementInput::new("obj:a", ElementType::Object));
    add_ok(&mut tracker, AddElementInput::new("obj:b", ElementType::Object));
    let third = tracker.add_element(AddElementInput::new("obj:c", ElementType::Object));
    assert_eq!(
        third,
        Err(ContextError::MaxElementsExceeded { scope: ContextScope::Local, max: 2 })
    );

    // EXITED elements no longer count toward the cap.
    if let Err(err) = tracker.remove_element(first.id) {
        panic!("remove_element should succeed: {err}");
    }
    add_ok(&mut tracker, AddElementInput::new("obj:c", ElementType::Object));
    assert_eq!(tracker.count(), 3);
}

// Test IDs: TCTX-009
#[test]
fn remove_element_is_soft() {
    let mut tracker = fixture_tracker();
    move_ok(&mut tracker, TextPosition::paragraph(7));
    let added = add_ok(&mut tracker, AddElementInput::new("char:eve", ElementType::Character));
    assert_eq!(added.entered_at, TextPosition::paragraph(7));

    let removed = match tracker.remove_element(added.id) {
        Ok(element) => element,
        Err(err) => panic!("remove_element should succeed: {err}"),
    };

    assert_eq!(removed.state, ElementState::Exited);
    assert_weight(removed.weight, 0.0);
    assert_eq!(removed.exited_at, Some(TextPosition::paragraph(7)));
    assert!(tracker.has_element(added.id));
    assert!(tracker.get_by_entity_ref("char:eve").is_none());

    let unknown = ElementId(ulid::Ulid::nil());
    assert_eq!(tracker.remove_element(unknown), Err(ContextError::ElementNotFound(unknown)));
}

// Test IDs: TCTX-010
#[test]
fn query_elements_filters_and_sorts_by_weight() {
    let mut tracker = fixture_tracker();
    for (entity, weight, kind) in [
        ("char:low", 0.3, ElementType::Character),
        ("char:high", 0.9, ElementType::Character),
        ("loc:mid", 0.5, ElementType::Location),
    ] {
        let mut input = AddElementInput::new(entity, kind);
        input.weight = Some(weight);
        add_ok(&mut tracker, input);
    }

    let all = match tracker.query_elements(&ElementFilter::default()) {
        Ok(elements) => elements,
        Err(err) => panic!("query should succeed: {err}"),
    };
    let refs: Vec<&str> = all.iter().map(|element| element.entity_ref.as_str()).collect();
    assert_eq!(refs, vec!["char:high", "loc:mid", "char:low"]);

    let characters = match tracker.query_elements(&ElementFilter {
        entity_ref_pattern: Some("^CHAR:".to_string()),
        min_weight: Some(0.4),
        ..ElementFilter::default()
    }) {
        Ok(elements) => elements,
        Err(err) => panic!("query should succeed: {err}"),
    };
    assert_eq!(characters.len(), 1);
    assert_eq!(characters[0].entity_ref, "char:high");

    let limited = tracker.query_elements(&ElementFilter { limit: Some(2), ..ElementFilter::default() });
    assert_eq!(limited.map(|elements| elements.len()), Ok(2));

    let invalid = tracker.query_elements(&ElementFilter {
        entity_ref_pattern: Some("(".to_string()),
        ..ElementFilter::default()
    });
    assert_eq!(invalid.map_err(|err| err.code()), Err("INVALID_PATTERN"));

    assert_eq!(tracker.get_elements_by_scope(ContextScope::Local).len(), 3);
    assert!(tracker.get_elements_by_scope(ContextScope::Global).is_empty());
}

// Test IDs: TCTX-011
#[test]
fn rollback_restores_snapshot_state() {
    let mut tracker = fixture_tracker();
    let kept = add_ok(&mut tracker, AddElementInput::new("char:ann", ElementType::Character));
    let snapshot = match tracker.create_snapshot(Some("before the storm".to_string())) {
        Ok(snapshot) => snapshot,
        Err(err) => panic!("snapshot should succeed: {err}"),
    };
    assert_eq!(snapshot.hash.len(), 64);
    let before = match tracker.get_state() {
        Ok(state) => state,
        Err(err) => panic!("state should hash: {err}"),
    };

    add_ok(&mut tracker, AddElementInput::new("char:ben", ElementType::Character));
    move_ok(&mut tracker, TextPosition::in_chapter(2, 5));

    let restored = match tracker.rollback_to(snapshot.id) {
        Ok(state) => state,
        Err(err) => panic!("rollback should succeed: {err}"),
    };
    assert_eq!(restored.hash, before.hash);
    assert_eq!(restored.position, TextPosition::default());
    assert_eq!(tracker.count(), 1);
    assert_weight(element(&tracker, kept.id).weight, 1.0);

    let missing = ContextSnapshotId(ulid::Ulid::nil());
    assert_eq!(tracker.rollback_to(missing).map_err(|err| err.code()), Err("SNAPSHOT_NOT_FOUND"));
}

// Test IDs: TCTX-012
#[test]
fn snapshots_are_rejected_at_cap() {
    let mut tracker =
        fixture_tracker_with(ContextLimits { max_snapshots: 2, ..ContextLimits::default() });
    let first = tracker.create_snapshot(None).map(|snapshot| snapshot.id);
    let second = tracker.create_snapshot(Some("second".to_string())).map(|snapshot| snapshot.id);
    let third = tracker.create_snapshot(None);

    assert_eq!(third, Err(ContextError::MaxSnapshotsExceeded { max: 2 }));
    let listed: Vec<ContextSnapshotId> = tracker.list_snapshots().iter().map(|snapshot| snapshot.id).collect();
    match (first, second) {
        (Ok(first), Ok(second)) => assert_eq!(listed, vec![second, first]),
        _ => panic!("first two snapshots should succeed"),
    }
}

// Test IDs: TCTX-013
#[test]
fn undo_rewinds_to_latest_snapshot_only() {
    let mut tracker = fixture_tracker();
    assert_eq!(tracker.undo(), Err(ContextError::HistoryEmpty));

    add_ok(&mut tracker, AddElementInput::new("char:cal", ElementType::Character));
    assert_eq!(tracker.undo().map_err(|err| err.code()), Err("SNAPSHOT_NOT_FOUND"));

    if let Err(err) = tracker.create_snapshot(None) {
        panic!("snapshot should succeed: {err}");
    }
    move_ok(&mut tracker, TextPosition::paragraph(3));
    add_ok(&mut tracker, AddElementInput::new("char:dee", ElementType::Character));

    let state = match tracker.undo() {
        Ok(state) => state,
        Err(err) => panic!("undo should succeed: {err}"),
    };
    assert_eq!(state.position, TextPosition::default());
    assert_eq!(state.elements.len(), 1);
    assert_eq!(tracker.get_history(Some(1))[0].action, ContextAction::Rollback);
}

// Test IDs: TCTX-014
#[test]
fn metrics_count_elements_and_average_active_weight() {
    let mut tracker = fixture_tracker();
    let mut light = AddElementInput::new("char:light", ElementType::Character);
    light.weight = Some(0.5);
    add_ok(&mut tracker, light);
    add_ok(&mut tracker, AddElementInput::new("loc:hall", ElementType::Location).in_scope(ContextScope::Chapter));
    let gone = add_ok(&mut tracker, AddElementInput::new("obj:key", ElementType::Object));
    if let Err(err) = tracker.remove_element(gone.id) {
        panic!("remove_element should succeed: {err}");
    }
    if let Err(err) = tracker.create_snapshot(None) {
        panic!("snapshot should succeed: {err}");
    }

    let metrics = tracker.get_metrics();
    assert_eq!(metrics.elements_by_state.get(&ElementState::Active), Some(&2));
    assert_eq!(metrics.elements_by_state.get(&ElementState::Exited), Some(&1));
    assert_eq!(metrics.elements_by_state.get(&ElementState::Mentioned), Some(&0));
    assert_eq!(metrics.elements_by_scope.get(&ContextScope::Chapter), Some(&1));
    assert_eq!(metrics.elements_by_type.get(&ElementType::Object), Some(&1));
    assert_eq!(metrics.snapshot_count, 1);
    assert_eq!(metrics.history_size, 5);
    assert_weight(metrics.avg_active_weight, 0.75);

    tracker.clear();
    assert_eq!(tracker.count(), 0);
    assert!(tracker.get_history(None).is_empty());
    assert!(tracker.list_snapshots().is_empty());
}

// Test IDs: TCTX-015
#[test]
fn replay_with_same_clock_yields_same_state_hash() {
    fn run() -> String {
        let mut tracker = fixture_tracker();
        add_ok(&mut tracker, AddElementInput::new("char:a", ElementType::Character).in_scope(ContextScope::Scene));
        add_ok(&mut tracker, AddElementInput::new("rel:a-b", ElementType::Relation));
        move_ok(&mut tracker, TextPosition::paragraph(3));
        match tracker.get_state() {
            Ok(state) => state.hash,
            Err(err) => panic!("state should hash: {err}"),
        }
    }

    assert_eq!(run(), run());
}

#[test]
fn reading_order_treats_absent_components_as_zero() {
    let bare = TextPosition::paragraph(5);
    let chapter_zero = TextPosition::in_chapter(0, 5);
    let chapter_one = TextPosition::in_chapter(1, 0);

    assert_eq!(bare.reading_order(&chapter_zero), std::cmp::Ordering::Equal);
    assert_eq!(bare.reading_order(&chapter_one), std::cmp::Ordering::Less);
    assert_eq!(bare.distance_to(&chapter_zero), 10);
}

// Test IDs: TCTX-017
#[test]
fn reviving_exited_element_keeps_one_live_element_per_entity() {
    let mut tracker = fixture_tracker();
    let first = add_ok(&mut tracker, AddElementInput::new("char:hero", ElementType::Character));
    if let Err(err) = tracker.remove_element(first.id) {
        panic!("remove_element should succeed: {err}");
    }
    let second = add_ok(&mut tracker, AddElementInput::new("char:hero", ElementType::Character));
    assert_ne!(first.id, second.id);

    assert_eq!(
        tracker.reactivate(first.id, None),
        Err(ContextError::EntityAlreadyLive { entity_ref: "char:hero".to_string(), live: second.id })
    );
    let revive = UpdateElementInput { state: Some(ElementState::Mentioned), ..UpdateElementInput::default() };
    assert_eq!(
        tracker.update_element(first.id, revive.clone()).map_err(|err| err.code()),
        Err("ENTITY_ALREADY_LIVE")
    );
    assert_eq!(element(&tracker, first.id).state, ElementState::Exited);

    let live = match tracker.query_elements(&ElementFilter {
        entity_ref_pattern: Some("^char:hero$".to_string()),
        ..ElementFilter::default()
    }) {
        Ok(elements) => elements,
        Err(err) => panic!("query should succeed: {err}"),
    };
    assert_eq!(live.iter().filter(|element| element.state != ElementState::Exited).count(), 1);

    if let Err(err) = tracker.remove_element(second.id) {
        panic!("remove_element should succeed: {err}");
    }
    let revived = match tracker.update_element(first.id, revive) {
        Ok(element) => element,
        Err(err) => panic!("revive should succeed once the entity has no live element: {err}"),
    };
    assert_eq!(revived.state, ElementState::Mentioned);
    assert_eq!(revived.exited_at, None);
}

// Test IDs: TCTX-018
#[test]
fn scope_cap_applies_to_revivals_and_scope_moves() {
    let mut tracker =
        fixture_tracker_with(ContextLimits { max_elements_per_scope: 1, ..ContextLimits::default() });
    let local = add_ok(&mut tracker, AddElementInput::new("obj:lamp", ElementType::Object));
    let scene =
        add_ok(&mut tracker, AddElementInput::new("obj:door", ElementType::Object).in_scope(ContextScope::Scene));

    let into_scene = UpdateElementInput { scope: Some(ContextScope::Scene), ..UpdateElementInput::default() };
    assert_eq!(
        tracker.update_element(local.id, into_scene),
        Err(ContextError::MaxElementsExceeded { scope: ContextScope::Scene, max: 1 })
    );
    assert_eq!(element(&tracker, local.id).scope, ContextScope::Local);

    if let Err(err) = tracker.remove_element(local.id) {
        panic!("remove_element should succeed: {err}");
    }
    add_ok(&mut tracker, AddElementInput::new("obj:chair", ElementType::Object));
    assert_eq!(
        tracker.reactivate(local.id, None).map_err(|err| err.code()),
        Err("MAX_ELEMENTS_EXCEEDED")
    );

    // Leaving a scope never needs room.
    let exit_scene = UpdateElementInput {
        state: Some(ElementState::Exited),
        scope: Some(ContextScope::Local),
        ..UpdateElementInput::default()
    };
    assert!(tracker.update_element(scene.id, exit_scene).is_ok());
}

proptest! {
    // Test IDs: TCTX-016
    #[test]
    fn decay_never_increases_weight(
        moves in proptest::collection::vec((0_i32..5, 0_i32..50), 1..12),
        scope_index in 0_usize..5,
    ) {
        let mut tracker = fixture_tracker();
        let scope = ContextScope::ALL[scope_index];
        let added = add_ok(&mut tracker, AddElementInput::new("char:p", ElementType::Character).in_scope(scope));
        let mut previous = added.weight;

        for (chapter, paragraph) in moves {
            move_ok(&mut tracker, TextPosition::in_chapter(chapter, paragraph));
            let current = element(&tracker, added.id);
            prop_assert!(current.weight <= previous);
            prop_assert!(current.weight >= 0.0);
            previous = current.weight;
        }
    }
}
