//! Change event application.

use super::Baseline;
use crate::types::{ChangeEvent, EntityId};

/// What applying one event did to the baseline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new entity was appended.
    Inserted(EntityId),
    /// Fields were merged into an existing entity.
    Merged(EntityId),
    /// An entity was removed.
    Removed(EntityId),
    /// Nothing changed.
    Ignored(IgnoreReason),
}

impl ApplyOutcome {
    /// Whether the baseline was modified.
    pub fn changed(&self) -> bool {
        !matches!(self, ApplyOutcome::Ignored(_))
    }
}

/// Why an event was dropped without effect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Update for an id the baseline has never seen. Dropped, not queued.
    StaleUpdate(EntityId),
    /// Delete for an id that is not present.
    MissingDelete(EntityId),
    /// Event kind not understood by this version.
    UnknownEvent,
}

/// Apply a change event to a baseline.
///
/// Each event either applies fully or not at all:
/// - `Created` appends, or merges into an existing entity with the same id
/// - `Updated` shallow-merges fields into a known entity, else is ignored
/// - `Deleted` removes a known entity, else is ignored
/// - `Unknown` is ignored
pub fn apply_event(baseline: &mut Baseline, event: ChangeEvent) -> ApplyOutcome {
    match event {
        ChangeEvent::Created { entity } => {
            let id = entity.id.clone();
            if let Some(existing) = baseline.get_mut(&id) {
                // Duplicate delivery of a create: treat as an update
                existing.merge(&entity.fields);
                ApplyOutcome::Merged(id)
            } else {
                baseline.push(entity);
                ApplyOutcome::Inserted(id)
            }
        }

        ChangeEvent::Updated { id, fields } => match baseline.get_mut(&id) {
            Some(existing) => {
                existing.merge(&fields);
                ApplyOutcome::Merged(id)
            }
            None => ApplyOutcome::Ignored(IgnoreReason::StaleUpdate(id)),
        },

        ChangeEvent::Deleted { id } => match baseline.remove(&id) {
            Some(_) => ApplyOutcome::Removed(id),
            None => ApplyOutcome::Ignored(IgnoreReason::MissingDelete(id)),
        },

        ChangeEvent::Unknown => ApplyOutcome::Ignored(IgnoreReason::UnknownEvent),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Entity;
    use serde_json::{json, Map, Value};

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn names(baseline: &Baseline) -> Vec<String> {
        baseline
            .iter()
            .map(|e| format!("{}:{}", e.id, e.get_str("name").unwrap_or("")))
            .collect()
    }

    #[test]
    fn test_create_appends() {
        let mut baseline = Baseline::from_snapshot(vec![Entity::new(1).with_field("name", "A")]);
        let outcome = apply_event(
            &mut baseline,
            ChangeEvent::created(Entity::new(2).with_field("name", "B")),
        );
        assert_eq!(outcome, ApplyOutcome::Inserted(EntityId::from(2)));
        assert_eq!(names(&baseline), vec!["1:A", "2:B"]);
    }

    #[test]
    fn test_duplicate_create_merges() {
        let mut baseline = Baseline::new();
        let e = Entity::new(1).with_field("name", "A").with_field("rank", 1);

        apply_event(&mut baseline, ChangeEvent::created(e.clone()));
        let outcome = apply_event(
            &mut baseline,
            ChangeEvent::created(Entity::new(1).with_field("name", "A2")),
        );

        assert_eq!(outcome, ApplyOutcome::Merged(EntityId::from(1)));
        assert_eq!(baseline.len(), 1);
        let entity = baseline.get(&EntityId::from(1)).unwrap();
        assert_eq!(entity.get_str("name"), Some("A2"));
        assert_eq!(entity.get("rank"), Some(&json!(1)));
    }

    #[test]
    fn test_update_merges_fields() {
        let mut baseline = Baseline::from_snapshot(vec![
            Entity::new(1).with_field("name", "A").with_field("done", false),
            Entity::new(2).with_field("name", "B"),
        ]);

        let outcome = apply_event(
            &mut baseline,
            ChangeEvent::updated(1, fields(json!({"name": "A2"}))),
        );

        assert!(outcome.changed());
        assert_eq!(names(&baseline), vec!["1:A2", "2:B"]);
        let first = baseline.get(&EntityId::from(1)).unwrap();
        assert_eq!(first.get("done"), Some(&json!(false)));
    }

    #[test]
    fn test_update_for_unknown_id_is_dropped() {
        let mut baseline = Baseline::from_snapshot(vec![Entity::new(1).with_field("name", "A")]);
        let outcome = apply_event(
            &mut baseline,
            ChangeEvent::updated(99, fields(json!({"name": "X"}))),
        );

        assert_eq!(
            outcome,
            ApplyOutcome::Ignored(IgnoreReason::StaleUpdate(EntityId::from(99)))
        );
        assert_eq!(names(&baseline), vec!["1:A"]);
        assert!(!baseline.contains(&EntityId::from(99)));
    }

    #[test]
    fn test_delete() {
        let mut baseline = Baseline::from_snapshot(vec![
            Entity::new(1).with_field("name", "A"),
            Entity::new(2).with_field("name", "B"),
        ]);

        let outcome = apply_event(&mut baseline, ChangeEvent::deleted(2));
        assert_eq!(outcome, ApplyOutcome::Removed(EntityId::from(2)));
        assert_eq!(names(&baseline), vec!["1:A"]);

        // Second delete is a no-op
        let outcome = apply_event(&mut baseline, ChangeEvent::deleted(2));
        assert!(!outcome.changed());
        assert_eq!(names(&baseline), vec!["1:A"]);
    }

    #[test]
    fn test_unknown_event_is_noop() {
        let mut baseline = Baseline::from_snapshot(vec![Entity::new(1).with_field("name", "A")]);
        let outcome = apply_event(&mut baseline, ChangeEvent::Unknown);
        assert_eq!(outcome, ApplyOutcome::Ignored(IgnoreReason::UnknownEvent));
        assert_eq!(names(&baseline), vec!["1:A"]);
    }

    #[test]
    fn test_recreate_after_delete_goes_to_end() {
        let mut baseline = Baseline::from_snapshot(vec![
            Entity::new(1).with_field("name", "A"),
            Entity::new(2).with_field("name", "B"),
        ]);

        apply_event(&mut baseline, ChangeEvent::deleted(1));
        apply_event(
            &mut baseline,
            ChangeEvent::created(Entity::new(1).with_field("name", "A3")),
        );

        assert_eq!(names(&baseline), vec!["2:B", "1:A3"]);
    }
}
