//! Ordered, id-indexed entity list.

use crate::types::{Entity, EntityId, Predicate};
use std::collections::HashMap;

/// The engine's current belief about a collection's full contents.
///
/// Entities keep arrival order (snapshot order, then creation order) so that
/// projections render stably. Lookups by id go through a position index.
#[derive(Clone, Debug, Default)]
pub struct Baseline {
    entities: Vec<Entity>,
    /// Position of each id within `entities`.
    index: HashMap<EntityId, usize>,
}

impl Baseline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a baseline from a snapshot.
    ///
    /// A repeated id in the snapshot is folded into its first occurrence the
    /// same way a duplicate create would be.
    pub fn from_snapshot(snapshot: Vec<Entity>) -> Self {
        let mut baseline = Self {
            entities: Vec::with_capacity(snapshot.len()),
            index: HashMap::with_capacity(snapshot.len()),
        };
        for entity in snapshot {
            baseline.push(entity);
        }
        baseline
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &EntityId) -> Option<&Entity> {
        self.index.get(id).map(|&pos| &self.entities[pos])
    }

    pub fn get_mut(&mut self, id: &EntityId) -> Option<&mut Entity> {
        match self.index.get(id) {
            Some(&pos) => Some(&mut self.entities[pos]),
            None => None,
        }
    }

    /// All entities in order.
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.iter()
    }

    /// Append an entity, or merge it into the existing one with the same id.
    pub(crate) fn push(&mut self, entity: Entity) {
        if let Some(&pos) = self.index.get(&entity.id) {
            self.entities[pos].merge(&entity.fields);
            return;
        }
        self.index.insert(entity.id.clone(), self.entities.len());
        self.entities.push(entity);
    }

    /// Remove an entity, returning it if it was present.
    pub(crate) fn remove(&mut self, id: &EntityId) -> Option<Entity> {
        let pos = self.index.remove(id)?;
        let removed = self.entities.remove(pos);

        // Everything after the removed slot shifted down by one
        for entity in &self.entities[pos..] {
            if let Some(slot) = self.index.get_mut(&entity.id) {
                *slot -= 1;
            }
        }

        Some(removed)
    }

    pub(crate) fn clear(&mut self) {
        self.entities.clear();
        self.index.clear();
    }

    /// Filtered view of the baseline, in baseline order.
    pub fn project(&self, predicate: Option<&Predicate>) -> Vec<Entity> {
        match predicate {
            Some(p) => self.entities.iter().filter(|e| p.matches(e)).cloned().collect(),
            None => self.entities.clone(),
        }
    }
}
