//! Chronicle Core -- a deterministic, tick-based simulation kernel for
//! narrative world engines.
//!
//! The kernel advances a mutable entity registry in discrete ticks,
//! dispatches state-change notifications through a synchronous
//! publish/subscribe bus, captures durable snapshots on a configurable
//! cadence for rollback and branch exploration, and safely absorbs
//! externally authored mutation requests ("hot injections") between
//! ticks.
//!
//! # Tick Pipeline
//!
//! Each call to [`kernel::Kernel::step`] advances the world by one tick
//! through the following phases:
//!
//! 1. **Drain** -- the injection gateway validates and applies every
//!    pending external request, in deterministic order, strictly before
//!    the world driver runs.
//! 2. **Drive** -- the pluggable [`kernel::WorldDriver`] reads and
//!    mutates the registry and emits domain events.
//! 3. **Boundary** -- a `tick-boundary` event is published.
//! 4. **Snapshot** -- on the configured cadence, post-step state is
//!    recorded in the append-only snapshot store.
//! 5. **Bookkeeping** -- the state hash is recomputed and pending
//!    pause/stop requests take effect. A started tick always completes.
//!
//! # Key Types
//!
//! - [`kernel::Kernel`] -- tick orchestrator and state machine
//!   (Idle/Running/Paused/Stopped); sole owner of the tick counter.
//! - [`registry::EntityRegistry`] -- the canonical entity set, keyed by
//!   versioned identities that never resurrect.
//! - [`event::EventBus`] -- synchronous pub/sub with passive listeners,
//!   reactive handlers (depth-first follow-ups), contained handler
//!   failures, and an optional append-only log for narrative tooling.
//! - [`injection::InjectionGateway`] -- drains an untrusted external
//!   request source with exactly-once removal and schema validation.
//! - [`snapshot::SnapshotStore`] -- append-only `(world, tick)` snapshot
//!   records with restore, branching, and history.
//! - [`replay::ReplayLog`] -- deterministic replay with hash-checkpoint
//!   verification.
//! - [`value::Value`] -- closed tagged-union attribute values with JSON
//!   round-trip fidelity.

pub mod event;
pub mod id;
pub mod injection;
pub mod kernel;
pub mod registry;
pub mod replay;
pub mod sim;
pub mod snapshot;
pub mod value;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
