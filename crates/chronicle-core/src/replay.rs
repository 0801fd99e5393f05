//! Deterministic replay: recording and playback for debugging and for
//! verifying that rollback/branching stays meaningful.
//!
//! A replay log captures the encoded state a run started from plus the
//! raw injection requests consumed at each tick. Playing it back against
//! the same (deterministic) world driver reproduces the exact same
//! registry, verified by state-hash checkpoints.

use crate::id::{RequestId, WorldId};
use crate::injection::{InjectionSource, MemoryInbox};
use crate::kernel::{Kernel, KernelError, WorldDriver};
use crate::sim::{KernelConfig, TickReport};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced while recording or playing a replay log.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error("replay log encoding failed: {0}")]
    Encode(String),
    #[error("replay log decoding failed: {0}")]
    Decode(String),
    #[error("state hash mismatch at tick {tick}: expected {expected:#018x}, got {actual:#018x}")]
    Mismatch {
        tick: u64,
        expected: u64,
        actual: u64,
    },
}

// ---------------------------------------------------------------------------
// ReplayLog
// ---------------------------------------------------------------------------

/// The injection requests consumed during one tick, in application order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayBatch {
    pub tick: u64,
    pub requests: Vec<(RequestId, Vec<u8>)>,
}

/// A recorded run: starting state plus the per-tick injection sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayLog {
    /// Lineage the run belongs to.
    pub world: WorldId,
    /// Encoded kernel state at the start of recording.
    pub initial_snapshot: Vec<u8>,
    /// One batch per recorded tick, in order.
    pub batches: Vec<ReplayBatch>,
    /// `(tick, state_hash)` checkpoints used to verify playback.
    pub hash_checkpoints: Vec<(u64, u64)>,
}

impl ReplayLog {
    /// Start recording from the kernel's current state.
    pub fn new<D: WorldDriver, S: InjectionSource>(
        kernel: &Kernel<D, S>,
    ) -> Result<Self, KernelError> {
        Ok(Self {
            world: kernel.world().clone(),
            initial_snapshot: kernel.encode_state()?,
            batches: Vec::new(),
            hash_checkpoints: Vec::new(),
        })
    }

    /// Record one completed tick.
    pub fn record(&mut self, report: &TickReport) {
        self.batches.push(ReplayBatch {
            tick: report.tick,
            requests: report.consumed.clone(),
        });
        self.hash_checkpoints.push((report.tick, report.state_hash));
    }

    /// Number of recorded ticks.
    pub fn tick_count(&self) -> usize {
        self.batches.len()
    }

    /// Serialize the log for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ReplayError> {
        bitcode::serialize(self).map_err(|e| ReplayError::Encode(e.to_string()))
    }

    /// Deserialize a stored log.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ReplayError> {
        bitcode::deserialize(bytes).map_err(|e| ReplayError::Decode(e.to_string()))
    }

    /// Play the log back against a fresh driver, verifying every hash
    /// checkpoint. Returns the kernel in its post-playback state.
    ///
    /// The driver must be deterministic and behaviorally identical to the
    /// one used during recording; a divergence surfaces as `Mismatch`.
    pub fn play<D: WorldDriver>(
        &self,
        driver: D,
        config: KernelConfig,
    ) -> Result<Kernel<D, MemoryInbox>, ReplayError> {
        let mut kernel = Kernel::from_state_bytes(
            self.world.clone(),
            &self.initial_snapshot,
            config,
            driver,
            MemoryInbox::new(),
        )?;
        kernel.resume()?;

        for batch in &self.batches {
            for (id, body) in &batch.requests {
                kernel.gateway_mut().source_mut().push(id.clone(), body.clone());
            }
            let report = kernel.step()?;
            if let Some((_, expected)) = self
                .hash_checkpoints
                .iter()
                .find(|(tick, _)| *tick == report.tick)
                && *expected != report.state_hash
            {
                return Err(ReplayError::Mismatch {
                    tick: report.tick,
                    expected: *expected,
                    actual: report.state_hash,
                });
            }
        }
        Ok(kernel)
    }
}
