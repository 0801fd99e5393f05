//! The injection gateway: bridges untrusted external mutation requests
//! ("hot injections") into the registry between ticks.
//!
//! Requests live in an external source (directory-like: list, read,
//! remove). Once per tick, before the world driver runs, the gateway
//! drains the source: every request is parsed, validated against a schema
//! keyed by its kind tag, applied or rejected, and removed from the source
//! exactly once regardless of outcome. A malformed request is therefore
//! never retried, and the inbox never grows unbounded.
//!
//! Application order is lexicographic by request id, imposed by the
//! gateway itself (the source guarantees no ordering), so two runs over
//! the same inbox contents apply identically.

use crate::event::{Event, EventBus, EventKind};
use crate::id::{EntityId, RequestId};
use crate::registry::EntityRegistry;
use crate::value::{Attributes, Value, attributes_from_json};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Source abstraction
// ---------------------------------------------------------------------------

/// Errors from the external request source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("request {0} not present in source")]
    Missing(RequestId),
    #[error("source i/o failure: {0}")]
    Io(String),
}

/// A directory-like collection of discrete request artifacts. The gateway
/// relies only on these three operations; no ordering is assumed.
pub trait InjectionSource {
    /// All pending request ids, in any order.
    fn list(&self) -> Vec<RequestId>;
    /// Read one request's raw bytes.
    fn read(&self, id: &RequestId) -> Result<Vec<u8>, SourceError>;
    /// Atomically remove one request.
    fn remove(&mut self, id: &RequestId) -> Result<(), SourceError>;
}

/// In-process injection source. The production deployment fronts a spool
/// directory with the same contract; keeping the trait this narrow makes
/// ordering and exactly-once-removal unit-testable without a filesystem.
#[derive(Debug, Default)]
pub struct MemoryInbox {
    entries: BTreeMap<RequestId, Vec<u8>>,
}

impl MemoryInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a raw request body under the given id.
    pub fn push(&mut self, id: RequestId, body: impl Into<Vec<u8>>) {
        self.entries.insert(id, body.into());
    }

    /// Add a JSON request body under the given id.
    pub fn push_json(&mut self, id: RequestId, body: &serde_json::Value) {
        self.entries.insert(id, body.to_string().into_bytes());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl InjectionSource for MemoryInbox {
    fn list(&self) -> Vec<RequestId> {
        self.entries.keys().cloned().collect()
    }

    fn read(&self, id: &RequestId) -> Result<Vec<u8>, SourceError> {
        self.entries
            .get(id)
            .cloned()
            .ok_or_else(|| SourceError::Missing(id.clone()))
    }

    fn remove(&mut self, id: &RequestId) -> Result<(), SourceError> {
        self.entries
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| SourceError::Missing(id.clone()))
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Why a request was rejected. Recovered locally: the request is removed
/// and never retried.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("unknown request kind `{0}`")]
    UnknownKind(String),
    #[error("request body is not valid JSON: {0}")]
    MalformedJson(String),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid value for field `{field}`: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
    #[error("target entity {0} not found")]
    TargetNotFound(u64),
}

impl ValidationError {
    /// Stable reason code carried by rejection events and reports.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ValidationError::UnknownKind(_) => "unknown-kind",
            ValidationError::MalformedJson(_) => "malformed-json",
            ValidationError::MissingField(_) => "missing-field",
            ValidationError::InvalidField { .. } => "invalid-field",
            ValidationError::TargetNotFound(_) => "target-not-found",
        }
    }
}

/// A fully validated request, ready to apply. Producing one performs every
/// check, so application itself cannot half-fail.
#[derive(Debug, Clone, PartialEq)]
enum InjectionOp {
    AddEntity {
        name: String,
        attributes: Attributes,
        metadata: Attributes,
    },
    ModifyAttribute {
        target: EntityId,
        rename: Option<String>,
        delta: Attributes,
    },
    RemoveEntity {
        target: EntityId,
    },
    InjectEvent {
        kind: EventKind,
        payload: Attributes,
    },
}

fn field_str<'a>(
    body: &'a serde_json::Value,
    field: &'static str,
) -> Result<Option<&'a str>, ValidationError> {
    match body.get(field) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(ValidationError::InvalidField {
            field,
            reason: format!("expected string, got {other}"),
        }),
    }
}

fn field_object(
    body: &serde_json::Value,
    field: &'static str,
) -> Result<Option<Attributes>, ValidationError> {
    match body.get(field) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => attributes_from_json(value)
            .map(Some)
            .ok_or(ValidationError::InvalidField {
                field,
                reason: "expected object".to_string(),
            }),
    }
}

fn field_target(
    body: &serde_json::Value,
    registry: &EntityRegistry,
) -> Result<EntityId, ValidationError> {
    let raw = match body.get("target") {
        None | Some(serde_json::Value::Null) => {
            return Err(ValidationError::MissingField("target"));
        }
        Some(serde_json::Value::Number(n)) => {
            n.as_u64().ok_or(ValidationError::InvalidField {
                field: "target",
                reason: "expected unsigned 64-bit id".to_string(),
            })?
        }
        Some(other) => {
            return Err(ValidationError::InvalidField {
                field: "target",
                reason: format!("expected number, got {other}"),
            });
        }
    };
    let id = EntityId::from_raw(raw);
    if registry.contains(id) {
        Ok(id)
    } else {
        Err(ValidationError::TargetNotFound(raw))
    }
}

/// Validate one parsed request body against the schema for its kind tag.
/// Nothing is mutated here.
fn validate(
    body: &serde_json::Value,
    registry: &EntityRegistry,
) -> Result<InjectionOp, ValidationError> {
    let kind = field_str(body, "kind")?.ok_or(ValidationError::MissingField("kind"))?;

    match kind {
        "add-entity" => {
            let name = field_str(body, "name")?.ok_or(ValidationError::MissingField("name"))?;
            if name.is_empty() {
                return Err(ValidationError::InvalidField {
                    field: "name",
                    reason: "must not be empty".to_string(),
                });
            }
            Ok(InjectionOp::AddEntity {
                name: name.to_string(),
                attributes: field_object(body, "attributes")?.unwrap_or_default(),
                metadata: field_object(body, "metadata")?.unwrap_or_default(),
            })
        }
        "modify-attribute" => {
            let target = field_target(body, registry)?;
            let delta =
                field_object(body, "attributes")?.ok_or(ValidationError::MissingField("attributes"))?;
            if delta.is_empty() {
                return Err(ValidationError::InvalidField {
                    field: "attributes",
                    reason: "must not be empty".to_string(),
                });
            }
            Ok(InjectionOp::ModifyAttribute {
                target,
                rename: field_str(body, "name")?.map(str::to_string),
                delta,
            })
        }
        "remove-entity" => Ok(InjectionOp::RemoveEntity {
            target: field_target(body, registry)?,
        }),
        "inject-event" => {
            let label = field_str(body, "event_kind")?
                .ok_or(ValidationError::MissingField("event_kind"))?;
            if label.is_empty() {
                return Err(ValidationError::InvalidField {
                    field: "event_kind",
                    reason: "must not be empty".to_string(),
                });
            }
            Ok(InjectionOp::InjectEvent {
                kind: EventKind::parse(label),
                payload: field_object(body, "payload")?.unwrap_or_default(),
            })
        }
        other => Err(ValidationError::UnknownKind(other.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Drain reporting
// ---------------------------------------------------------------------------

/// One rejected request: the structured record the operator inspects.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub request: RequestId,
    /// Stable reason code, e.g. `unknown-kind`.
    pub reason: String,
    /// Human-readable detail.
    pub detail: String,
}

/// Outcome of one drain cycle.
#[derive(Debug, Default)]
pub struct DrainReport {
    /// Requests applied, in discovery order.
    pub applied: usize,
    /// Requests rejected, with reasons.
    pub rejections: Vec<Rejection>,
    /// Raw request bodies consumed this cycle (accepted and rejected),
    /// in discovery order. Feeds replay recording.
    pub consumed: Vec<(RequestId, Vec<u8>)>,
}

// ---------------------------------------------------------------------------
// InjectionGateway
// ---------------------------------------------------------------------------

/// Scans the external source, validates each request, and turns accepted
/// ones into registry mutations plus published events.
#[derive(Debug)]
pub struct InjectionGateway<S: InjectionSource> {
    source: S,
}

impl<S: InjectionSource> InjectionGateway<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Drain and apply every pending request. Invoked once per tick by the
    /// kernel, strictly before the world driver runs, so driver logic
    /// always sees an injection-complete registry.
    ///
    /// Requests targeting the same entity apply in discovery order; on
    /// overlapping attribute keys the later request wins.
    pub fn drain(
        &mut self,
        tick: u64,
        registry: &mut EntityRegistry,
        bus: &mut EventBus,
    ) -> DrainReport {
        let mut ids = self.source.list();
        ids.sort();

        let mut report = DrainReport::default();
        for id in ids {
            self.process(&id, tick, registry, bus, &mut report);
            // Exactly-once removal, accepted or rejected: the inbox is
            // fully drained every cycle.
            if let Err(err) = self.source.remove(&id) {
                tracing::warn!(request = %id, error = %err, "failed to remove drained request");
            }
        }
        report
    }

    fn process(
        &mut self,
        id: &RequestId,
        tick: u64,
        registry: &mut EntityRegistry,
        bus: &mut EventBus,
        report: &mut DrainReport,
    ) {
        let bytes = match self.source.read(id) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.reject(id, tick, "unreadable", &err.to_string(), bus, report);
                return;
            }
        };
        report.consumed.push((id.clone(), bytes.clone()));

        let body: serde_json::Value = match serde_json::from_slice(&bytes) {
            Ok(body) => body,
            Err(err) => {
                let err = ValidationError::MalformedJson(err.to_string());
                self.reject(id, tick, err.reason_code(), &err.to_string(), bus, report);
                return;
            }
        };

        let op = match validate(&body, registry) {
            Ok(op) => op,
            Err(err) => {
                self.reject(id, tick, err.reason_code(), &err.to_string(), bus, report);
                return;
            }
        };

        // Validation resolved every reference, so application is a
        // straight-line mutation: no partial effects possible. The applied
        // event carries the full request body; the event stream alone is
        // enough to reconstruct what was asked for.
        let mut applied = Event::new(EventKind::InjectionApplied, tick)
            .with("request", id.0.as_str())
            .with("body", Value::from_json(&body));
        match op {
            InjectionOp::AddEntity {
                name,
                attributes,
                metadata,
            } => {
                let entity = registry.create(name, attributes, metadata);
                applied = applied
                    .with("kind", "add-entity")
                    .with("entity", entity.to_raw());
            }
            InjectionOp::ModifyAttribute {
                target,
                rename,
                delta,
            } => {
                if let Some(name) = rename {
                    // Target existence was checked during validation.
                    let _ = registry.rename(target, name);
                }
                let _ = registry.update(target, &delta);
                applied = applied
                    .with("kind", "modify-attribute")
                    .with("entity", target.to_raw());
            }
            InjectionOp::RemoveEntity { target } => {
                registry.remove(target);
                applied = applied
                    .with("kind", "remove-entity")
                    .with("entity", target.to_raw());
            }
            InjectionOp::InjectEvent { kind, payload } => {
                applied = applied
                    .with("kind", "inject-event")
                    .with("event", kind.label());
                bus.publish(Event {
                    kind,
                    payload,
                    tick,
                });
            }
        }
        bus.publish(applied);
        report.applied += 1;
    }

    fn reject(
        &self,
        id: &RequestId,
        tick: u64,
        reason: &str,
        detail: &str,
        bus: &mut EventBus,
        report: &mut DrainReport,
    ) {
        tracing::warn!(request = %id, reason, detail, "injection rejected");
        bus.publish(
            Event::new(EventKind::InjectionRejected, tick)
                .with("request", id.0.as_str())
                .with("reason", reason)
                .with("detail", detail),
        );
        report.rejections.push(Rejection {
            request: id.clone(),
            reason: reason.to_string(),
            detail: detail.to_string(),
        });
    }
}
