use serde::{Deserialize, Serialize};
use slotmap::{Key, KeyData, new_key_type};

new_key_type! {
    /// Identifies an entity in the registry. Versioned: once an entity is
    /// removed its identity can never refer to a later entity.
    pub struct EntityId;
}

impl EntityId {
    /// The 64-bit form used in external artifacts (injection requests,
    /// event payloads). Stable across snapshot/restore.
    pub fn to_raw(self) -> u64 {
        self.data().as_ffi()
    }

    /// Rebuild an identity from its 64-bit form. The result may not refer
    /// to a live entity; callers must look it up.
    pub fn from_raw(raw: u64) -> Self {
        KeyData::from_ffi(raw).into()
    }
}

/// Identifies a simulation lineage. Snapshots are keyed by `(WorldId, tick)`;
/// branching duplicates a snapshot under a fresh world id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorldId(pub String);

impl WorldId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorldId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one injection request in its source. The gateway sorts
/// requests lexicographically by this id, so `Ord` is load-bearing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a stored snapshot record. Assigned sequentially by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotId(pub u64);

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    #[test]
    fn entity_id_raw_round_trip() {
        let mut sm = SlotMap::<EntityId, ()>::with_key();
        let id = sm.insert(());
        assert_eq!(EntityId::from_raw(id.to_raw()), id);
    }

    #[test]
    fn request_ids_sort_lexicographically() {
        let mut ids = vec![
            RequestId::new("0002-b"),
            RequestId::new("0010-a"),
            RequestId::new("0001-z"),
        ];
        ids.sort();
        assert_eq!(ids[0].0, "0001-z");
        assert_eq!(ids[2].0, "0010-a");
    }

    #[test]
    fn world_ids_are_hashable() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(WorldId::new("alpha"), 1);
        map.insert(WorldId::new("beta"), 2);
        assert_eq!(map[&WorldId::new("alpha")], 1);
    }
}
