//! Property-based tests for reconciliation invariants.

use entity_sync::{
    apply_event, Baseline, ChangeEvent, CollectionName, Entity, Predicate, Reconciler,
};
use proptest::prelude::*;
use serde_json::{json, Map, Value};
use std::collections::HashSet;

fn entity_strategy() -> impl Strategy<Value = Entity> {
    (0..8u64, "[ab][0-9]", 0..3i64).prop_map(|(id, name, rank)| {
        Entity::new(id)
            .with_field("name", name)
            .with_field("rank", rank)
    })
}

fn fields_strategy() -> impl Strategy<Value = Map<String, Value>> {
    (proptest::option::of("[ab][0-9]"), proptest::option::of(0..3i64)).prop_map(|(name, rank)| {
        let mut fields = Map::new();
        if let Some(name) = name {
            fields.insert("name".to_string(), json!(name));
        }
        if let Some(rank) = rank {
            fields.insert("rank".to_string(), json!(rank));
        }
        fields
    })
}

fn event_strategy() -> impl Strategy<Value = ChangeEvent> {
    prop_oneof![
        3 => entity_strategy().prop_map(ChangeEvent::created),
        3 => (0..8u64, fields_strategy()).prop_map(|(id, fields)| ChangeEvent::updated(id, fields)),
        2 => (0..8u64).prop_map(ChangeEvent::deleted),
        1 => Just(ChangeEvent::Unknown),
    ]
}

fn snapshot_strategy() -> impl Strategy<Value = Vec<Entity>> {
    prop::collection::vec(entity_strategy(), 0..6)
}

fn starts_with_a() -> Predicate {
    Predicate::field_starts_with("name", "a")
}

fn loading(predicate: Option<Predicate>) -> Reconciler {
    let mut r = Reconciler::new(CollectionName::new("props").unwrap(), predicate);
    r.begin();
    r
}

fn assert_consistent(r: &Reconciler, predicate: &Predicate) {
    let expected: Vec<Entity> = r
        .baseline()
        .iter()
        .filter(|e| predicate.matches(e))
        .cloned()
        .collect();
    assert_eq!(r.projection(), expected.as_slice());
}

proptest! {
    // Property: the baseline never holds two entities with the same id
    #[test]
    fn test_ids_stay_unique(
        snapshot in snapshot_strategy(),
        events in prop::collection::vec(event_strategy(), 0..40),
    ) {
        let mut r = loading(None);
        r.on_snapshot(Ok(snapshot));
        for event in events {
            r.on_event(event);
            let ids: HashSet<_> = r.baseline().iter().map(|e| e.id.clone()).collect();
            prop_assert_eq!(ids.len(), r.baseline().len());
        }
    }

    // Property: the projection always equals the filtered baseline
    #[test]
    fn test_projection_never_stale(
        snapshot in snapshot_strategy(),
        events in prop::collection::vec(event_strategy(), 0..40),
        switch_at in 0..40usize,
    ) {
        let predicate = starts_with_a();
        let mut r = loading(Some(predicate.clone()));
        r.on_snapshot(Ok(snapshot));
        assert_consistent(&r, &predicate);

        let other = Predicate::field_eq("rank", 0);
        let mut current = predicate;
        for (i, event) in events.into_iter().enumerate() {
            if i == switch_at {
                r.set_predicate(Some(other.clone()));
                current = other.clone();
                assert_consistent(&r, &current);
            }
            r.on_event(event);
            assert_consistent(&r, &current);
        }
    }

    // Property: a repeated create equals a create followed by an update
    #[test]
    fn test_create_is_idempotent(
        snapshot in snapshot_strategy(),
        entity in entity_strategy(),
    ) {
        let mut twice = Baseline::from_snapshot(snapshot.clone());
        apply_event(&mut twice, ChangeEvent::created(entity.clone()));
        apply_event(&mut twice, ChangeEvent::created(entity.clone()));

        let mut create_then_update = Baseline::from_snapshot(snapshot);
        apply_event(&mut create_then_update, ChangeEvent::created(entity.clone()));
        apply_event(
            &mut create_then_update,
            ChangeEvent::updated(entity.id.clone(), entity.fields.clone()),
        );

        prop_assert_eq!(twice.entities(), create_then_update.entities());
    }

    // Property: buffering any prefix of the stream before the snapshot
    // yields the same state as in-order application after it
    #[test]
    fn test_buffered_replay_matches_in_order(
        snapshot in snapshot_strategy(),
        events in prop::collection::vec(event_strategy(), 0..40),
        split in 0..41usize,
    ) {
        let split = split.min(events.len());

        let mut canonical = loading(None);
        canonical.on_snapshot(Ok(snapshot.clone()));
        for event in events.iter().cloned() {
            canonical.on_event(event);
        }

        let mut buffered = loading(None);
        for event in events[..split].iter().cloned() {
            buffered.on_event(event);
        }
        prop_assert_eq!(buffered.buffered_len(), split);
        buffered.on_snapshot(Ok(snapshot));
        for event in events[split..].iter().cloned() {
            buffered.on_event(event);
        }

        prop_assert_eq!(buffered.baseline().entities(), canonical.baseline().entities());
        prop_assert_eq!(buffered.projection(), canonical.projection());
    }

    // Property: nothing changes after deactivation
    #[test]
    fn test_deactivated_is_inert(
        snapshot in snapshot_strategy(),
        events in prop::collection::vec(event_strategy(), 0..20),
    ) {
        let mut r = loading(None);
        r.deactivate();
        let version = r.version();

        prop_assert!(!r.on_snapshot(Ok(snapshot)));
        for event in events {
            prop_assert!(!r.on_event(event));
        }
        prop_assert_eq!(r.version(), version);
        prop_assert!(r.baseline().is_empty());
    }
}
