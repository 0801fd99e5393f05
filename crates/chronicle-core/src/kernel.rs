//! The simulation kernel: owns the tick counter and orchestrates one tick.
//!
//! # Tick pipeline
//!
//! Each `step()` while Running:
//!
//! 1. **Drain** — the injection gateway applies every pending external
//!    request, strictly before the driver runs.
//! 2. **Drive** — the world driver's step callback reads and mutates the
//!    registry and emits domain events; its aux-state delta is merged.
//! 3. **Boundary** — a `tick-boundary` event is published.
//! 4. **Snapshot** — on the configured cadence, post-step state is
//!    recorded in the snapshot store.
//! 5. **Bookkeeping** — state hash recomputed; pending pause/stop
//!    requests take effect.
//!
//! A started tick always completes (or faults to Stopped); pause and stop
//! are observed only between ticks. The kernel is the sole driver of world
//! mutation: every phase runs through `&mut self`, so exactly one tick is
//! ever in flight.

use crate::event::{Event, EventBus, EventKind};
use crate::id::{SnapshotId, WorldId};
use crate::injection::{InjectionGateway, InjectionSource};
use crate::registry::EntityRegistry;
use crate::sim::{FatalRecord, KernelConfig, KernelState, StateHash, TickReport};
use crate::snapshot::{SnapshotError, SnapshotStore, decode_snapshot, encode_snapshot};
use crate::value::{Attributes, merge_attributes};

// ---------------------------------------------------------------------------
// World driver contract
// ---------------------------------------------------------------------------

/// Unrecoverable failure inside a world driver step. Fatal to the kernel:
/// the tick is aborted and the kernel stops.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct DriverError(pub String);

impl DriverError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// The pluggable, world-specific per-tick behavior.
///
/// Must be deterministic given identical registry contents and tick
/// number, so rollback and replay stay meaningful. May publish events via
/// the provided bus; must not drive further ticks. The returned attribute
/// delta is merge-patched into the world's auxiliary state.
pub trait WorldDriver {
    fn step(
        &mut self,
        tick: u64,
        registry: &mut EntityRegistry,
        bus: &mut EventBus,
    ) -> Result<Attributes, DriverError>;
}

impl<F> WorldDriver for F
where
    F: FnMut(u64, &mut EntityRegistry, &mut EventBus) -> Result<Attributes, DriverError>,
{
    fn step(
        &mut self,
        tick: u64,
        registry: &mut EntityRegistry,
        bus: &mut EventBus,
    ) -> Result<Attributes, DriverError> {
        self(tick, registry, bus)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by kernel operations.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("`{operation}` is not permitted while the kernel is {actual:?}")]
    InvalidState {
        operation: &'static str,
        actual: KernelState,
    },
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("world driver fault at tick {tick}: {reason}")]
    DriverFault { tick: u64, reason: String },
}

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

/// Orchestrates the tick loop over one world lineage.
pub struct Kernel<D: WorldDriver, S: InjectionSource> {
    world: WorldId,
    config: KernelConfig,
    state: KernelState,
    tick: u64,
    registry: EntityRegistry,
    aux: Attributes,
    driver: D,
    gateway: InjectionGateway<S>,
    bus: EventBus,
    store: SnapshotStore,
    pause_requested: bool,
    stop_requested: bool,
    last_fatal: Option<FatalRecord>,
    last_state_hash: u64,
}

impl<D: WorldDriver, S: InjectionSource> std::fmt::Debug for Kernel<D, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("world", &self.world)
            .field("state", &self.state)
            .field("tick", &self.tick)
            .field("entities", &self.registry.len())
            .field("last_fatal", &self.last_fatal)
            .finish_non_exhaustive()
    }
}

impl<D: WorldDriver, S: InjectionSource> Kernel<D, S> {
    /// Create an idle kernel over an empty world.
    pub fn new(world: WorldId, config: KernelConfig, driver: D, source: S) -> Self {
        let bus = EventBus::new(config.max_publish_depth);
        Self {
            world,
            config,
            state: KernelState::Idle,
            tick: 0,
            registry: EntityRegistry::new(),
            aux: Attributes::new(),
            driver,
            gateway: InjectionGateway::new(source),
            bus,
            store: SnapshotStore::new(),
            pause_requested: false,
            stop_requested: false,
            last_fatal: None,
            last_state_hash: 0,
        }
    }

    /// Resume a recorded lineage: restores `(world, tick)` from the given
    /// store and starts Paused at that tick. Used for branch exploration
    /// and crash recovery.
    pub fn from_snapshot(
        world: WorldId,
        tick: u64,
        store: SnapshotStore,
        config: KernelConfig,
        driver: D,
        source: S,
    ) -> Result<Self, KernelError> {
        let (registry, aux) = store.restore(&world, tick)?;
        let mut kernel = Self::new(world, config, driver, source);
        kernel.store = store;
        kernel.registry = registry;
        kernel.aux = aux;
        kernel.tick = tick;
        kernel.state = KernelState::Paused;
        kernel.last_state_hash = kernel.compute_state_hash()?;
        Ok(kernel)
    }

    /// Reconstruct a kernel from encoded snapshot bytes (replay playback).
    /// Starts Paused; the fresh store gets the decoded state as its
    /// baseline record.
    pub fn from_state_bytes(
        world: WorldId,
        bytes: &[u8],
        config: KernelConfig,
        driver: D,
        source: S,
    ) -> Result<Self, KernelError> {
        let snapshot = decode_snapshot(bytes)?;
        let mut kernel = Self::new(world, config, driver, source);
        kernel.tick = snapshot.header.tick;
        kernel.registry = snapshot.registry;
        kernel.aux = snapshot.aux;
        kernel
            .store
            .snapshot(&kernel.world, kernel.tick, &kernel.registry, &kernel.aux)?;
        kernel.state = KernelState::Paused;
        kernel.last_state_hash = kernel.compute_state_hash()?;
        Ok(kernel)
    }

    // -- state machine -----------------------------------------------------

    /// Idle → Running. Records the baseline snapshot so every lineage has
    /// a rollback floor (an existing record for this tick is tolerated).
    pub fn start(&mut self) -> Result<(), KernelError> {
        if self.state != KernelState::Idle {
            return Err(KernelError::InvalidState {
                operation: "start",
                actual: self.state,
            });
        }
        match self
            .store
            .snapshot(&self.world, self.tick, &self.registry, &self.aux)
        {
            Ok(_) | Err(SnapshotError::Conflict { .. }) => {}
            Err(err) => return Err(err.into()),
        }
        self.last_state_hash = self.compute_state_hash()?;
        self.state = KernelState::Running;
        tracing::debug!(world = %self.world, "kernel started");
        Ok(())
    }

    /// Ask the kernel to pause at the next tick boundary. No-op unless
    /// Running.
    pub fn request_pause(&mut self) {
        if self.state == KernelState::Running {
            self.pause_requested = true;
        }
    }

    /// Ask the kernel to stop at the next tick boundary. No-op unless
    /// Running (use `shutdown` for an immediate between-ticks stop).
    pub fn request_stop(&mut self) {
        if self.state == KernelState::Running {
            self.stop_requested = true;
        }
    }

    /// Running → Paused, between ticks. The caller holds `&mut self`, so
    /// no tick is in flight.
    pub fn pause(&mut self) -> Result<(), KernelError> {
        if self.state != KernelState::Running {
            return Err(KernelError::InvalidState {
                operation: "pause",
                actual: self.state,
            });
        }
        self.state = KernelState::Paused;
        tracing::debug!(world = %self.world, tick = self.tick, "kernel paused");
        Ok(())
    }

    /// Paused → Running.
    pub fn resume(&mut self) -> Result<(), KernelError> {
        if self.state != KernelState::Paused {
            return Err(KernelError::InvalidState {
                operation: "resume",
                actual: self.state,
            });
        }
        self.state = KernelState::Running;
        tracing::debug!(world = %self.world, tick = self.tick, "kernel resumed");
        Ok(())
    }

    /// Running | Paused → Stopped (terminal). Idempotent once Stopped.
    pub fn shutdown(&mut self) -> Result<(), KernelError> {
        match self.state {
            KernelState::Running | KernelState::Paused => {
                self.state = KernelState::Stopped;
                tracing::debug!(world = %self.world, tick = self.tick, "kernel stopped");
                Ok(())
            }
            KernelState::Stopped => Ok(()),
            KernelState::Idle => Err(KernelError::InvalidState {
                operation: "shutdown",
                actual: self.state,
            }),
        }
    }

    // -- tick loop ---------------------------------------------------------

    /// Advance exactly one tick. Only valid while Running.
    pub fn step(&mut self) -> Result<TickReport, KernelError> {
        if self.state != KernelState::Running {
            return Err(KernelError::InvalidState {
                operation: "step",
                actual: self.state,
            });
        }
        let tick = self.tick + 1;

        // Phase 1: drain injections strictly before the driver, so driver
        // logic always sees an injection-complete registry.
        let drain = self.gateway.drain(tick, &mut self.registry, &mut self.bus);

        // Phase 2: world driver.
        match self.driver.step(tick, &mut self.registry, &mut self.bus) {
            Ok(delta) => merge_attributes(&mut self.aux, &delta),
            Err(err) => return Err(self.fault(tick, err)),
        }
        self.tick = tick;

        // Phase 3: boundary event.
        self.bus
            .publish(Event::new(EventKind::TickBoundary, tick).with("tick", tick));

        // Phase 4: cadence snapshot of post-step state.
        let (snapshot, snapshot_conflict) = self.cadence_snapshot(tick)?;

        // Phase 5: bookkeeping and cooperative control.
        self.last_state_hash = self.compute_state_hash()?;
        if self.stop_requested {
            self.stop_requested = false;
            self.pause_requested = false;
            self.state = KernelState::Stopped;
            tracing::debug!(world = %self.world, tick, "stop request honored at boundary");
        } else if self.pause_requested {
            self.pause_requested = false;
            self.state = KernelState::Paused;
            tracing::debug!(world = %self.world, tick, "pause request honored at boundary");
        }

        Ok(TickReport {
            tick,
            injections_applied: drain.applied,
            rejections: drain.rejections,
            consumed: drain.consumed,
            snapshot,
            snapshot_conflict,
            state_hash: self.last_state_hash,
        })
    }

    /// Step repeatedly while Running, up to `max_ticks`. A pause or stop
    /// request ends the loop at the boundary where it takes effect.
    pub fn run(&mut self, max_ticks: u64) -> Result<Vec<TickReport>, KernelError> {
        let mut reports = Vec::new();
        while self.state == KernelState::Running && (reports.len() as u64) < max_ticks {
            reports.push(self.step()?);
        }
        Ok(reports)
    }

    fn fault(&mut self, tick: u64, err: DriverError) -> KernelError {
        // The aborted tick never completed: the counter stays at the last
        // completed tick. Live registry contents are suspect; the last
        // durable snapshot is the recovery point.
        let reason = err.0;
        tracing::error!(world = %self.world, tick, %reason, "world driver fault; stopping kernel");
        self.bus.publish(
            Event::new(EventKind::SimulationFatal, tick).with("reason", reason.as_str()),
        );
        self.last_fatal = Some(FatalRecord {
            tick,
            reason: reason.clone(),
        });
        self.state = KernelState::Stopped;
        KernelError::DriverFault { tick, reason }
    }

    fn cadence_snapshot(&mut self, tick: u64) -> Result<(Option<SnapshotId>, bool), KernelError> {
        if self.config.snapshot_interval == 0 || tick % self.config.snapshot_interval != 0 {
            return Ok((None, false));
        }
        match self
            .store
            .snapshot(&self.world, tick, &self.registry, &self.aux)
        {
            Ok(id) => Ok((Some(id), false)),
            Err(SnapshotError::Conflict { .. }) => {
                // The cadence re-reached a recorded tick after a rollback on
                // this lineage. Skip; never overwrite.
                tracing::warn!(world = %self.world, tick, "snapshot cadence conflict; skipped");
                Ok((None, true))
            }
            Err(err) => Err(err.into()),
        }
    }

    // -- rollback and branching --------------------------------------------

    /// Restore live state to the snapshot at `tick` and reset the tick
    /// counter. Only permitted while Paused or Stopped.
    pub fn rollback_to(&mut self, tick: u64) -> Result<(), KernelError> {
        if !matches!(self.state, KernelState::Paused | KernelState::Stopped) {
            return Err(KernelError::InvalidState {
                operation: "rollback_to",
                actual: self.state,
            });
        }
        let (registry, aux) = self.store.restore(&self.world, tick)?;
        self.registry = registry;
        self.aux = aux;
        self.tick = tick;
        self.last_state_hash = self.compute_state_hash()?;
        tracing::debug!(world = %self.world, tick, "rolled back");
        Ok(())
    }

    /// Duplicate the snapshot at `from_tick` under `new_world` in the
    /// store. Pair with [`Kernel::from_snapshot`] to explore the branch.
    pub fn branch_to(
        &mut self,
        from_tick: u64,
        new_world: &WorldId,
    ) -> Result<SnapshotId, KernelError> {
        Ok(self.store.branch(&self.world, from_tick, new_world)?)
    }

    // -- accessors ---------------------------------------------------------

    pub fn world(&self) -> &WorldId {
        &self.world
    }

    pub fn state(&self) -> KernelState {
        self.state
    }

    /// The last completed tick. Strictly +1 per completed tick while
    /// Running.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn aux(&self) -> &Attributes {
        &self.aux
    }

    /// Bus access for subscriptions and sink attachment.
    pub fn bus_mut(&mut self) -> &mut EventBus {
        &mut self.bus
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn gateway_mut(&mut self) -> &mut InjectionGateway<S> {
        &mut self.gateway
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SnapshotStore {
        &mut self.store
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// The structured record of the last fatal transition, if any.
    pub fn last_fatal(&self) -> Option<&FatalRecord> {
        self.last_fatal.as_ref()
    }

    /// Deterministic hash of the current state.
    pub fn state_hash(&self) -> u64 {
        self.last_state_hash
    }

    /// Encode the current state as snapshot bytes (replay recording).
    pub fn encode_state(&self) -> Result<Vec<u8>, KernelError> {
        Ok(encode_snapshot(self.tick, &self.registry, &self.aux)?)
    }

    fn compute_state_hash(&self) -> Result<u64, KernelError> {
        let bytes = encode_snapshot(self.tick, &self.registry, &self.aux)?;
        Ok(StateHash::hash_bytes(&bytes))
    }
}
