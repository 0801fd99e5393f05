//! The entity registry: the canonical set of simulated entities.
//!
//! Pure data, no behavior. The registry is owned by the kernel; every
//! other component refers to entities by [`EntityId`] and goes through the
//! registry to read or mutate them. Exactly one mutator (the injection
//! gateway or the world driver) touches the registry at any instant; the
//! kernel's `&mut` discipline enforces that at compile time.

use crate::id::EntityId;
use crate::value::{Attributes, merge_attributes};
use serde::{Deserialize, Serialize};
use slotmap::SlotMap;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by registry mutations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no entity with id {0}")]
    NotFound(u64),
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A simulated entity. Identity lives in the registry key and never
/// changes; everything here is mutable through the registry's API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Display name. Mutable, not unique.
    pub name: String,
    /// Heterogeneous attribute map (any JSON-representable value).
    pub attributes: Attributes,
    /// Free-form metadata, opaque to the kernel.
    pub metadata: Attributes,
}

// ---------------------------------------------------------------------------
// EntityRegistry
// ---------------------------------------------------------------------------

/// Mapping from identity to entity. Removal is permanent within a live
/// registry instance; history lives only in snapshots. Slot versioning
/// guarantees a removed identity never resolves to a later entity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityRegistry {
    entities: SlotMap<EntityId, Entity>,
}

// `SlotMap` carries no `PartialEq`; registry equality is content equality
// over `(identity, entity)` pairs, identities included.
impl PartialEq for EntityRegistry {
    fn eq(&self, other: &Self) -> bool {
        self.entities.len() == other.entities.len()
            && self
                .entities
                .iter()
                .zip(other.entities.iter())
                .all(|((id_a, a), (id_b, b))| id_a == id_b && a == b)
    }
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new entity and return its freshly allocated identity.
    pub fn create(
        &mut self,
        name: impl Into<String>,
        attributes: Attributes,
        metadata: Attributes,
    ) -> EntityId {
        self.entities.insert(Entity {
            name: name.into(),
            attributes,
            metadata,
        })
    }

    /// Look up an entity by identity.
    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(id)
    }

    /// Merge an attribute delta into an existing entity (merge-patch:
    /// `Null` removes a key, maps merge one level deep, scalars overwrite).
    pub fn update(&mut self, id: EntityId, delta: &Attributes) -> Result<(), RegistryError> {
        let entity = self
            .entities
            .get_mut(id)
            .ok_or(RegistryError::NotFound(id.to_raw()))?;
        merge_attributes(&mut entity.attributes, delta);
        Ok(())
    }

    /// Rename an entity. Names are mutable and not unique.
    pub fn rename(&mut self, id: EntityId, name: impl Into<String>) -> Result<(), RegistryError> {
        let entity = self
            .entities
            .get_mut(id)
            .ok_or(RegistryError::NotFound(id.to_raw()))?;
        entity.name = name.into();
        Ok(())
    }

    /// Delete an entity. Idempotent: removing an absent identity is a
    /// no-op, never an error.
    pub fn remove(&mut self, id: EntityId) {
        self.entities.remove(id);
    }

    /// Whether the identity refers to a live entity.
    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(id)
    }

    /// A deep, immutable copy of the registry for the state manager.
    /// Mutations of the live registry after this call are never visible
    /// through the returned copy.
    pub fn snapshot_view(&self) -> EntityRegistry {
        self.clone()
    }

    /// Replace the entire contents with a restored snapshot.
    pub fn restore_from(&mut self, snapshot: EntityRegistry) {
        self.entities = snapshot.entities;
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Iterate over `(identity, entity)` pairs in deterministic slot order.
    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &Entity)> {
        self.entities.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn attrs(pairs: &[(&str, Value)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn create_then_get() {
        let mut registry = EntityRegistry::new();
        let id = registry.create("Neo", attrs(&[("power", Value::Int(100))]), Attributes::new());
        let entity = registry.get(id).unwrap();
        assert_eq!(entity.name, "Neo");
        assert_eq!(entity.attributes["power"], Value::Int(100));
    }

    #[test]
    fn identities_are_unique() {
        let mut registry = EntityRegistry::new();
        let a = registry.create("a", Attributes::new(), Attributes::new());
        let b = registry.create("a", Attributes::new(), Attributes::new());
        assert_ne!(a, b);
    }

    #[test]
    fn update_merges_delta() {
        let mut registry = EntityRegistry::new();
        let id = registry.create(
            "x",
            attrs(&[("power", Value::Int(100)), ("mood", Value::Text("calm".into()))]),
            Attributes::new(),
        );
        registry
            .update(id, &attrs(&[("power", Value::Int(42)), ("mood", Value::Null)]))
            .unwrap();
        let entity = registry.get(id).unwrap();
        assert_eq!(entity.attributes["power"], Value::Int(42));
        assert!(!entity.attributes.contains_key("mood"));
    }

    #[test]
    fn update_absent_entity_is_not_found() {
        let mut registry = EntityRegistry::new();
        let id = registry.create("x", Attributes::new(), Attributes::new());
        registry.remove(id);
        assert!(matches!(
            registry.update(id, &Attributes::new()),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn remove_is_idempotent() {
        let mut registry = EntityRegistry::new();
        let keep = registry.create("keep", Attributes::new(), Attributes::new());
        let gone = registry.create("gone", Attributes::new(), Attributes::new());
        registry.remove(gone);
        let before = registry.snapshot_view();
        registry.remove(gone); // second removal: no error, no change
        assert_eq!(registry, before);
        assert!(registry.contains(keep));
    }

    #[test]
    fn removed_identity_never_resurrects() {
        let mut registry = EntityRegistry::new();
        let id = registry.create("old", Attributes::new(), Attributes::new());
        registry.remove(id);
        let _new = registry.create("new", Attributes::new(), Attributes::new());
        assert!(registry.get(id).is_none());
    }

    #[test]
    fn snapshot_view_is_isolated() {
        let mut registry = EntityRegistry::new();
        let id = registry.create("x", attrs(&[("hp", Value::Int(10))]), Attributes::new());
        let view = registry.snapshot_view();
        registry.update(id, &attrs(&[("hp", Value::Int(0))])).unwrap();
        registry.create("y", Attributes::new(), Attributes::new());
        assert_eq!(view.len(), 1);
        assert_eq!(view.get(id).unwrap().attributes["hp"], Value::Int(10));
    }

    #[test]
    fn equality_compares_identities_and_contents() {
        let mut a = EntityRegistry::new();
        let mut b = EntityRegistry::new();
        let id_a = a.create("x", attrs(&[("hp", Value::Int(1))]), Attributes::new());
        let id_b = b.create("x", attrs(&[("hp", Value::Int(1))]), Attributes::new());
        assert_eq!(id_a, id_b);
        assert_eq!(a, b);

        b.update(id_b, &attrs(&[("hp", Value::Int(2))])).unwrap();
        assert_ne!(a, b);

        // Same contents under a different identity is a different registry.
        let mut c = EntityRegistry::new();
        let tmp = c.create("tmp", Attributes::new(), Attributes::new());
        c.remove(tmp);
        c.create("x", attrs(&[("hp", Value::Int(1))]), Attributes::new());
        assert_ne!(a, c);
    }

    #[test]
    fn rename_changes_name_only() {
        let mut registry = EntityRegistry::new();
        let id = registry.create("before", attrs(&[("hp", Value::Int(1))]), Attributes::new());
        registry.rename(id, "after").unwrap();
        let entity = registry.get(id).unwrap();
        assert_eq!(entity.name, "after");
        assert_eq!(entity.attributes["hp"], Value::Int(1));
    }
}
