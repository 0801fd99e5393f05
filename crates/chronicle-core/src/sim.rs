//! Kernel state-machine types, configuration, and per-tick reports.

use crate::event::DEFAULT_PUBLISH_DEPTH;
use crate::id::{RequestId, SnapshotId};
use crate::injection::Rejection;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Kernel state machine
// ---------------------------------------------------------------------------

/// Lifecycle of the simulation kernel.
///
/// `Idle -> Running` on start, `Running <-> Paused` at tick boundaries,
/// `Running | Paused -> Stopped` on shutdown or a fatal driver fault.
/// `Stopped` is terminal: no further ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelState {
    Idle,
    Running,
    Paused,
    Stopped,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Kernel configuration. The kernel owns the snapshot cadence; the store
/// itself has no tick-driving behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Snapshot every N ticks. 0 disables cadence snapshots (the baseline
    /// snapshot at start is still taken).
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: u64,

    /// Bound on reentrant event publishing depth.
    #[serde(default = "default_publish_depth")]
    pub max_publish_depth: u32,
}

fn default_snapshot_interval() -> u64 {
    30
}

fn default_publish_depth() -> u32 {
    DEFAULT_PUBLISH_DEPTH
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: default_snapshot_interval(),
            max_publish_depth: default_publish_depth(),
        }
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Result of one completed tick.
#[derive(Debug)]
pub struct TickReport {
    /// The tick that just completed.
    pub tick: u64,
    /// Injection requests applied during the drain phase.
    pub injections_applied: usize,
    /// Injection requests rejected during the drain phase, with reasons.
    pub rejections: Vec<Rejection>,
    /// Raw request bodies consumed this tick, in application order.
    /// Feeds replay recording.
    pub consumed: Vec<(RequestId, Vec<u8>)>,
    /// Cadence snapshot recorded this tick, if any.
    pub snapshot: Option<SnapshotId>,
    /// The cadence hit an already-recorded tick (possible after a rollback
    /// on the same lineage); the snapshot was skipped, not overwritten.
    pub snapshot_conflict: bool,
    /// Deterministic hash of post-tick state, for desync detection.
    pub state_hash: u64,
}

/// Structured record of a fatal transition: the kernel stopped rather
/// than complete a corrupt tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FatalRecord {
    pub tick: u64,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// State hash
// ---------------------------------------------------------------------------

/// A deterministic hash of simulation state for desync detection and
/// replay verification. FNV-1a (64-bit); not cryptographic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateHash(pub u64);

impl StateHash {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    /// Start a new hash.
    pub fn new() -> Self {
        Self(Self::FNV_OFFSET)
    }

    /// Mix bytes into the hash.
    pub fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.0 ^= u64::from(*byte);
            self.0 = self.0.wrapping_mul(Self::FNV_PRIME);
        }
    }

    /// The final hash value.
    pub fn finish(self) -> u64 {
        self.0
    }

    /// Hash a byte slice in one call.
    pub fn hash_bytes(bytes: &[u8]) -> u64 {
        let mut hash = Self::new();
        hash.write(bytes);
        hash.finish()
    }
}

impl Default for StateHash {
    fn default() -> Self {
        Self::new()
    }
}
