//! Shared helpers for unit and integration tests. Available to downstream
//! crates behind the `test-utils` feature.

use crate::event::EventBus;
use crate::id::RequestId;
use crate::injection::MemoryInbox;
use crate::kernel::{DriverError, WorldDriver};
use crate::registry::EntityRegistry;
use crate::value::Attributes;
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Drivers
// ---------------------------------------------------------------------------

/// A driver that does nothing. Every tick succeeds with an empty delta.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDriver;

impl WorldDriver for NullDriver {
    fn step(
        &mut self,
        _tick: u64,
        _registry: &mut EntityRegistry,
        _bus: &mut EventBus,
    ) -> Result<Attributes, DriverError> {
        Ok(Attributes::new())
    }
}

/// A deterministic driver that returns a pre-scripted aux delta at chosen
/// ticks and an empty delta otherwise.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDriver {
    deltas: BTreeMap<u64, Attributes>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the aux delta returned at `tick`.
    pub fn set_delta(&mut self, tick: u64, delta: Attributes) {
        self.deltas.insert(tick, delta);
    }
}

impl WorldDriver for ScriptedDriver {
    fn step(
        &mut self,
        tick: u64,
        _registry: &mut EntityRegistry,
        _bus: &mut EventBus,
    ) -> Result<Attributes, DriverError> {
        Ok(self.deltas.get(&tick).cloned().unwrap_or_default())
    }
}

/// A driver that succeeds until `fail_at`, then faults with `reason`.
pub fn failing_driver(
    fail_at: u64,
    reason: &str,
) -> impl FnMut(u64, &mut EntityRegistry, &mut EventBus) -> Result<Attributes, DriverError> {
    let reason = reason.to_string();
    move |tick, _registry, _bus| {
        if tick == fail_at {
            Err(DriverError::new(reason.clone()))
        } else {
            Ok(Attributes::new())
        }
    }
}

// ---------------------------------------------------------------------------
// Request builders
// ---------------------------------------------------------------------------

/// JSON body for an `add-entity` request with integer attributes.
pub fn add_entity_request(name: &str, attrs: &[(&str, i64)]) -> serde_json::Value {
    let attributes: serde_json::Map<String, serde_json::Value> = attrs
        .iter()
        .map(|(k, v)| (k.to_string(), serde_json::Value::from(*v)))
        .collect();
    serde_json::json!({
        "kind": "add-entity",
        "name": name,
        "attributes": attributes,
    })
}

/// JSON body for a `modify-attribute` request with integer attributes.
pub fn modify_attribute_request(target: u64, attrs: &[(&str, i64)]) -> serde_json::Value {
    let attributes: serde_json::Map<String, serde_json::Value> = attrs
        .iter()
        .map(|(k, v)| (k.to_string(), serde_json::Value::from(*v)))
        .collect();
    serde_json::json!({
        "kind": "modify-attribute",
        "target": target,
        "attributes": attributes,
    })
}

/// JSON body for a `remove-entity` request.
pub fn remove_entity_request(target: u64) -> serde_json::Value {
    serde_json::json!({ "kind": "remove-entity", "target": target })
}

/// An inbox pre-seeded with `(id, body)` pairs.
pub fn seeded_inbox(requests: &[(&str, serde_json::Value)]) -> MemoryInbox {
    let mut inbox = MemoryInbox::new();
    for (id, body) in requests {
        inbox.push_json(RequestId::new(*id), body);
    }
    inbox
}
