//! Versioned world snapshots and the append-only snapshot store.
//!
//! A snapshot is a full structural copy of the entity registry plus the
//! driver's auxiliary state, encoded with `bitcode` behind a magic/version
//! header that is validated before any decode is trusted. The store keys
//! records by `(world, tick)` and never overwrites: re-snapshotting a
//! recorded tick is a conflict, restoring never deletes later records, and
//! branching duplicates a record under a fresh world id so the same
//! lineage can fork.
//!
//! The store is passive. Snapshot cadence is the kernel's concern.

use crate::id::{SnapshotId, WorldId};
use crate::registry::EntityRegistry;
use crate::value::Attributes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Magic number identifying a chronicle world snapshot.
pub const SNAPSHOT_MAGIC: u32 = 0xC4A0_0001;

/// Current wire format version. Increment on breaking changes.
pub const FORMAT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the snapshot store and codec.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot already recorded for world `{world}` at tick {tick}")]
    Conflict { world: WorldId, tick: u64 },
    #[error("no snapshot for world `{world}` at tick {tick}")]
    NotFound { world: WorldId, tick: u64 },
    #[error("snapshot encoding failed: {0}")]
    Encode(String),
    #[error("snapshot decoding failed: {0}")]
    Decode(String),
    #[error("invalid magic number: expected 0x{SNAPSHOT_MAGIC:08X}, got 0x{0:08X}")]
    InvalidMagic(u32),
    #[error("unsupported format version {0} (this build reads version {FORMAT_VERSION})")]
    UnsupportedVersion(u32),
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

/// Header carried by every encoded snapshot. Checked before the payload
/// is trusted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub magic: u32,
    pub version: u32,
    pub tick: u64,
}

impl SnapshotHeader {
    pub fn new(tick: u64) -> Self {
        Self {
            magic: SNAPSHOT_MAGIC,
            version: FORMAT_VERSION,
            tick,
        }
    }

    pub fn validate(&self) -> Result<(), SnapshotError> {
        if self.magic != SNAPSHOT_MAGIC {
            return Err(SnapshotError::InvalidMagic(self.magic));
        }
        if self.version != FORMAT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(self.version));
        }
        Ok(())
    }
}

/// The decoded form of a snapshot: tick, full registry contents, and the
/// world driver's auxiliary state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub header: SnapshotHeader,
    pub registry: EntityRegistry,
    pub aux: Attributes,
}

/// Encode a snapshot blob. The blob is deterministic for identical state:
/// wall-clock metadata lives outside it, in the store record.
pub fn encode_snapshot(
    tick: u64,
    registry: &EntityRegistry,
    aux: &Attributes,
) -> Result<Vec<u8>, SnapshotError> {
    let snapshot = WorldSnapshot {
        header: SnapshotHeader::new(tick),
        registry: registry.snapshot_view(),
        aux: aux.clone(),
    };
    bitcode::serialize(&snapshot).map_err(|e| SnapshotError::Encode(e.to_string()))
}

/// Decode and validate a snapshot blob.
pub fn decode_snapshot(bytes: &[u8]) -> Result<WorldSnapshot, SnapshotError> {
    let snapshot: WorldSnapshot =
        bitcode::deserialize(bytes).map_err(|e| SnapshotError::Decode(e.to_string()))?;
    snapshot.header.validate()?;
    Ok(snapshot)
}

// ---------------------------------------------------------------------------
// SnapshotStore
// ---------------------------------------------------------------------------

/// One stored record. The blob is immutable once recorded.
#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub id: SnapshotId,
    pub tick: u64,
    /// Wall-clock capture time. Metadata only; never part of the blob.
    pub taken_at: SystemTime,
    bytes: Vec<u8>,
}

impl StoredSnapshot {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Append-only store of snapshots keyed by `(world, tick)`.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    worlds: BTreeMap<WorldId, BTreeMap<u64, StoredSnapshot>>,
    next_id: u64,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&mut self) -> SnapshotId {
        let id = SnapshotId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Append a new record. Never overwrites: a second snapshot for the
    /// same `(world, tick)` is a conflict — callers wanting to re-record a
    /// tick must branch to a fresh world id.
    pub fn snapshot(
        &mut self,
        world: &WorldId,
        tick: u64,
        registry: &EntityRegistry,
        aux: &Attributes,
    ) -> Result<SnapshotId, SnapshotError> {
        if self.contains(world, tick) {
            return Err(SnapshotError::Conflict {
                world: world.clone(),
                tick,
            });
        }
        let bytes = encode_snapshot(tick, registry, aux)?;
        let id = self.allocate_id();
        self.worlds.entry(world.clone()).or_default().insert(
            tick,
            StoredSnapshot {
                id,
                tick,
                taken_at: SystemTime::now(),
                bytes,
            },
        );
        tracing::debug!(world = %world, tick, snapshot = id.0, "snapshot recorded");
        Ok(id)
    }

    /// Whether a record exists for `(world, tick)`.
    pub fn contains(&self, world: &WorldId, tick: u64) -> bool {
        self.worlds
            .get(world)
            .is_some_and(|lineage| lineage.contains_key(&tick))
    }

    /// Return the exact recorded state for `(world, tick)`. Later records
    /// are untouched; the caller forks the lineage from here.
    pub fn restore(
        &self,
        world: &WorldId,
        tick: u64,
    ) -> Result<(EntityRegistry, Attributes), SnapshotError> {
        let record = self.record(world, tick).ok_or_else(|| SnapshotError::NotFound {
            world: world.clone(),
            tick,
        })?;
        let snapshot = decode_snapshot(&record.bytes)?;
        Ok((snapshot.registry, snapshot.aux))
    }

    /// The stored record for `(world, tick)`, if any.
    pub fn record(&self, world: &WorldId, tick: u64) -> Option<&StoredSnapshot> {
        self.worlds.get(world).and_then(|lineage| lineage.get(&tick))
    }

    /// All recorded `(tick, id)` pairs for a world, ascending by tick.
    pub fn list_history(&self, world: &WorldId) -> Vec<(u64, SnapshotId)> {
        self.worlds
            .get(world)
            .map(|lineage| lineage.iter().map(|(tick, rec)| (*tick, rec.id)).collect())
            .unwrap_or_default()
    }

    /// Duplicate the snapshot at `from_tick` under `new_world`, enabling
    /// independent continued simulation without touching the original
    /// lineage.
    pub fn branch(
        &mut self,
        world: &WorldId,
        from_tick: u64,
        new_world: &WorldId,
    ) -> Result<SnapshotId, SnapshotError> {
        let source = self
            .record(world, from_tick)
            .ok_or_else(|| SnapshotError::NotFound {
                world: world.clone(),
                tick: from_tick,
            })?
            .clone();
        if self.contains(new_world, from_tick) {
            return Err(SnapshotError::Conflict {
                world: new_world.clone(),
                tick: from_tick,
            });
        }
        let id = self.allocate_id();
        self.worlds.entry(new_world.clone()).or_default().insert(
            from_tick,
            StoredSnapshot {
                id,
                tick: from_tick,
                taken_at: SystemTime::now(),
                bytes: source.bytes,
            },
        );
        tracing::debug!(from = %world, to = %new_world, tick = from_tick, "lineage branched");
        Ok(id)
    }

    /// Drop every record of a world strictly older than `tick`. Returns
    /// the number of records removed.
    pub fn prune_before(&mut self, world: &WorldId, tick: u64) -> usize {
        let Some(lineage) = self.worlds.get_mut(world) else {
            return 0;
        };
        let keep = lineage.split_off(&tick);
        let pruned = lineage.len();
        *lineage = keep;
        pruned
    }
}
