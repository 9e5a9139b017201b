//! Core types for entity synchronization.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Name of a remote entity collection.
///
/// Selects both the snapshot query and the change stream. Never empty.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CollectionName(String);

impl CollectionName {
    /// Validate and wrap a collection name.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(SyncError::InvalidCollection(name));
        }
        Ok(CollectionName(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CollectionName {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self> {
        CollectionName::new(value)
    }
}

impl TryFrom<&str> for CollectionName {
    type Error = SyncError;

    fn try_from(value: &str) -> Result<Self> {
        CollectionName::new(value)
    }
}

impl From<CollectionName> for String {
    fn from(name: CollectionName) -> Self {
        name.0
    }
}

impl fmt::Debug for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Collection({})", self.0)
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an entity, assigned by the remote store.
///
/// Accepts both string and numeric ids on the wire; numbers are kept in
/// their decimal form so `1` and `"1"` name the same entity.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        EntityId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Text(String),
            Number(serde_json::Number),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Text(s) => EntityId(s),
            RawId::Number(n) => EntityId(n.to_string()),
        })
    }
}

impl From<u64> for EntityId {
    fn from(id: u64) -> Self {
        EntityId(id.to_string())
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        EntityId(id.to_string())
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        EntityId(id)
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single entity: an id plus arbitrary named fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable identifier (assigned by the remote store).
    pub id: EntityId,

    /// All other fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Entity {
    /// Create an entity with no fields besides its id.
    pub fn new(id: impl Into<EntityId>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Decode an entity from its JSON representation.
    pub fn from_json(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Get a string field, if present and a string.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Set a field. The `id` field cannot be set this way.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        if name != "id" {
            self.fields.insert(name, value.into());
        }
    }

    /// Shallow merge: every field in `partial` overwrites, absent fields are kept.
    ///
    /// An `id` key in `partial` is ignored; ids are never reassigned.
    pub fn merge(&mut self, partial: &Map<String, Value>) {
        for (name, value) in partial {
            if name != "id" {
                self.fields.insert(name.clone(), value.clone());
            }
        }
    }
}

/// A committed remote mutation, as delivered by the change stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    /// A new entity was created.
    Created { entity: Entity },

    /// Some fields of an existing entity changed.
    Updated {
        id: EntityId,
        fields: Map<String, Value>,
    },

    /// An entity was removed.
    Deleted { id: EntityId },

    /// An event kind this version does not know about. Applying it is a no-op.
    #[serde(other)]
    Unknown,
}

impl ChangeEvent {
    pub fn created(entity: Entity) -> Self {
        ChangeEvent::Created { entity }
    }

    pub fn updated(id: impl Into<EntityId>, fields: Map<String, Value>) -> Self {
        ChangeEvent::Updated {
            id: id.into(),
            fields,
        }
    }

    pub fn deleted(id: impl Into<EntityId>) -> Self {
        ChangeEvent::Deleted { id: id.into() }
    }

    /// Decode an event from the remote store's JSON form.
    pub fn from_json(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// The entity this event targets, if any.
    pub fn entity_id(&self) -> Option<&EntityId> {
        match self {
            ChangeEvent::Created { entity } => Some(&entity.id),
            ChangeEvent::Updated { id, .. } | ChangeEvent::Deleted { id } => Some(id),
            ChangeEvent::Unknown => None,
        }
    }

    /// Short name of the variant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::Created { .. } => "created",
            ChangeEvent::Updated { .. } => "updated",
            ChangeEvent::Deleted { .. } => "deleted",
            ChangeEvent::Unknown => "unknown",
        }
    }
}

/// Filter deciding which baseline entities are visible in the projection.
///
/// Must be pure: the same entity always yields the same answer.
#[derive(Clone)]
pub struct Predicate(Arc<dyn Fn(&Entity) -> bool + Send + Sync>);

impl Predicate {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Entity) -> bool + Send + Sync + 'static,
    {
        Predicate(Arc::new(f))
    }

    /// Matches entities whose field equals `value`.
    pub fn field_eq(name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        let value = value.into();
        Predicate::new(move |e| e.get(&name) == Some(&value))
    }

    /// Matches entities whose string field starts with `prefix`.
    pub fn field_starts_with(name: impl Into<String>, prefix: impl Into<String>) -> Self {
        let name = name.into();
        let prefix = prefix.into();
        Predicate::new(move |e| e.get_str(&name).is_some_and(|s| s.starts_with(&prefix)))
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        (self.0)(entity)
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Predicate(..)")
    }
}

/// Lifecycle state of one activation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Created but not yet started.
    Idle,
    /// Waiting for the initial snapshot.
    Loading,
    /// Snapshot installed, applying live events.
    Synced,
    /// A snapshot or stream failure has been recorded.
    Error,
    /// Torn down; no further changes will be applied.
    Deactivated,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_collection_name_rejects_empty() {
        assert!(matches!(
            CollectionName::new(""),
            Err(SyncError::InvalidCollection(_))
        ));
        assert!(CollectionName::new("   ").is_err());
        assert_eq!(CollectionName::new("tasks").unwrap().as_str(), "tasks");
    }

    #[test]
    fn test_entity_id_accepts_numbers_and_strings() {
        let a: EntityId = serde_json::from_value(json!(1)).unwrap();
        let b: EntityId = serde_json::from_value(json!("1")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, EntityId::from(1));
    }

    #[test]
    fn test_entity_json_flattens_fields() {
        let entity = Entity::from_json(json!({"id": 7, "name": "A", "done": false})).unwrap();
        assert_eq!(entity.id, EntityId::from(7));
        assert_eq!(entity.get_str("name"), Some("A"));
        assert_eq!(entity.get("done"), Some(&json!(false)));
        assert!(entity.get("id").is_none());
    }

    #[test]
    fn test_merge_keeps_absent_fields_and_id() {
        let mut entity = Entity::new(1).with_field("name", "A").with_field("rank", 3);
        let partial = json!({"name": "A2", "id": 99}).as_object().unwrap().clone();
        entity.merge(&partial);

        assert_eq!(entity.id, EntityId::from(1));
        assert_eq!(entity.get_str("name"), Some("A2"));
        assert_eq!(entity.get("rank"), Some(&json!(3)));
    }

    #[test]
    fn test_change_event_decoding() {
        let created = ChangeEvent::from_json(json!({
            "type": "created",
            "entity": {"id": 2, "name": "B"}
        }))
        .unwrap();
        assert_eq!(created.kind(), "created");
        assert_eq!(created.entity_id(), Some(&EntityId::from(2)));

        let updated = ChangeEvent::from_json(json!({
            "type": "updated",
            "id": "2",
            "fields": {"name": "B2"}
        }))
        .unwrap();
        assert!(matches!(updated, ChangeEvent::Updated { .. }));

        let deleted = ChangeEvent::from_json(json!({"type": "deleted", "id": 2})).unwrap();
        assert_eq!(deleted, ChangeEvent::deleted(2));
    }

    #[test]
    fn test_unknown_event_kind_decodes_to_unknown() {
        let event = ChangeEvent::from_json(json!({"type": "archived", "id": 5})).unwrap();
        assert_eq!(event, ChangeEvent::Unknown);
        assert!(event.entity_id().is_none());
    }

    #[test]
    fn test_predicates() {
        let a = Entity::new(1).with_field("name", "A2");
        let b = Entity::new(2).with_field("name", "B2");

        let starts = Predicate::field_starts_with("name", "A");
        assert!(starts.matches(&a));
        assert!(!starts.matches(&b));

        let eq = Predicate::field_eq("name", "B2");
        assert!(eq.matches(&b));
        assert!(!eq.matches(&a));

        let missing = Predicate::field_starts_with("title", "A");
        assert!(!missing.matches(&a));
    }
}
