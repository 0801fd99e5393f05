//! Typed event system: synchronous publish/subscribe with an optional
//! append-only log.
//!
//! Events are published during the drain and driver phases of a tick and
//! delivered immediately, in subscription order, on the publisher's call
//! stack. Two subscriber flavors exist:
//!
//! - **Passive listeners**: read-only (UI, analytics, narrative log).
//! - **Reactive handlers**: return follow-up events, which the bus
//!   publishes depth-first before `publish` returns to the original
//!   publisher. Recursion depth is bounded by configuration.
//!
//! A handler failure is recorded against that handler/event pair and
//! delivery continues; `publish` itself never fails.

use crate::value::{Attributes, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Event kinds
// ---------------------------------------------------------------------------

/// Discriminant for events. The core set is closed; world drivers add
/// their own kinds through the `Custom` slot without core changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    CharacterAction,
    WorldChange,
    EntityAdded,
    EntityRemoved,
    InjectionApplied,
    InjectionRejected,
    TickBoundary,
    SimulationFatal,
    Custom(String),
}

impl EventKind {
    /// Parse a kind label. Unrecognized labels become `Custom`.
    pub fn parse(label: &str) -> Self {
        match label {
            "character-action" => EventKind::CharacterAction,
            "world-change" => EventKind::WorldChange,
            "entity-added" => EventKind::EntityAdded,
            "entity-removed" => EventKind::EntityRemoved,
            "injection-applied" => EventKind::InjectionApplied,
            "injection-rejected" => EventKind::InjectionRejected,
            "tick-boundary" => EventKind::TickBoundary,
            "simulation-fatal" => EventKind::SimulationFatal,
            other => EventKind::Custom(other.to_string()),
        }
    }

    /// Stable label for logs and external records.
    pub fn label(&self) -> &str {
        match self {
            EventKind::CharacterAction => "character-action",
            EventKind::WorldChange => "world-change",
            EventKind::EntityAdded => "entity-added",
            EventKind::EntityRemoved => "entity-removed",
            EventKind::InjectionApplied => "injection-applied",
            EventKind::InjectionRejected => "injection-rejected",
            EventKind::TickBoundary => "tick-boundary",
            EventKind::SimulationFatal => "simulation-fatal",
            EventKind::Custom(label) => label,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A simulation event. Immutable once published; carries the tick at
/// which it was produced and an opaque payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub payload: Attributes,
    pub tick: u64,
}

impl Event {
    pub fn new(kind: EventKind, tick: u64) -> Self {
        Self {
            kind,
            payload: Attributes::new(),
            tick,
        }
    }

    /// Builder-style payload entry.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// External event log
// ---------------------------------------------------------------------------

/// One record of the append-only external event log: the sole contract
/// narrative tooling relies on. Records appear in emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub tick: u64,
    pub kind: EventKind,
    pub payload: Attributes,
}

/// Append-only consumer of every published event.
pub trait EventSink {
    fn append(&mut self, record: EventRecord);
}

/// In-process event log, useful for tests and for handing the narrative
/// generator a read-only stream.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    records: Vec<EventRecord>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[EventRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl EventSink for MemoryEventLog {
    fn append(&mut self, record: EventRecord) {
        self.records.push(record);
    }
}

// A shared handle lets the publisher keep reading the log while the bus
// owns the sink. The bus is single-threaded, so Rc suffices.
impl EventSink for std::rc::Rc<std::cell::RefCell<MemoryEventLog>> {
    fn append(&mut self, record: EventRecord) {
        self.borrow_mut().records.push(record);
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Error raised by a reactive handler. Contained at the bus boundary.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

/// A passive listener receives events read-only.
pub type PassiveListener = Box<dyn FnMut(&Event)>;

/// A reactive handler returns follow-up events to publish depth-first,
/// or an error which the bus records without aborting delivery.
pub type ReactiveHandler = Box<dyn FnMut(&Event) -> Result<Vec<Event>, HandlerError>>;

enum Subscriber {
    Passive(PassiveListener),
    Reactive(ReactiveHandler),
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subscriber::Passive(_) => write!(f, "Passive(<fn>)"),
            Subscriber::Reactive(_) => write!(f, "Reactive(<fn>)"),
        }
    }
}

/// Record of a contained delivery failure: which kind, at which tick,
/// and why. Inspectable by the operator; never aborts the publishing tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerFailure {
    pub kind: EventKind,
    pub tick: u64,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default bound on reentrant publish depth.
pub const DEFAULT_PUBLISH_DEPTH: u32 = 8;

/// The central event bus. No persistence: an event with no subscribers is
/// dropped (after being forwarded to the sink, when one is attached).
pub struct EventBus {
    subscribers: HashMap<EventKind, Vec<Subscriber>>,
    failures: Vec<HandlerFailure>,
    sink: Option<Box<dyn EventSink>>,
    max_depth: u32,
    published: u64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers)
            .field("failures", &self.failures)
            .field("sink", &self.sink.is_some())
            .field("max_depth", &self.max_depth)
            .field("published", &self.published)
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_PUBLISH_DEPTH)
    }
}

impl EventBus {
    /// Create a bus with the given reentrancy bound (clamped to >= 1).
    pub fn new(max_depth: u32) -> Self {
        Self {
            subscribers: HashMap::new(),
            failures: Vec::new(),
            sink: None,
            max_depth: max_depth.max(1),
            published: 0,
        }
    }

    /// Register a passive listener for an event kind. Listeners run in
    /// subscription order during delivery.
    pub fn on_passive(&mut self, kind: EventKind, listener: impl FnMut(&Event) + 'static) {
        self.subscribers
            .entry(kind)
            .or_default()
            .push(Subscriber::Passive(Box::new(listener)));
    }

    /// Register a reactive handler for an event kind.
    pub fn on_reactive(
        &mut self,
        kind: EventKind,
        handler: impl FnMut(&Event) -> Result<Vec<Event>, HandlerError> + 'static,
    ) {
        self.subscribers
            .entry(kind)
            .or_default()
            .push(Subscriber::Reactive(Box::new(handler)));
    }

    /// Attach the append-only external log. Every subsequently published
    /// event (follow-ups included) is forwarded in emission order.
    pub fn set_sink(&mut self, sink: impl EventSink + 'static) {
        self.sink = Some(Box::new(sink));
    }

    /// Publish an event: synchronous fan-out to every subscriber of that
    /// exact kind, then return. Handler errors are recorded, never raised.
    pub fn publish(&mut self, event: Event) {
        self.deliver(&event, 0);
    }

    fn deliver(&mut self, event: &Event, depth: u32) {
        self.published += 1;
        if let Some(sink) = self.sink.as_mut() {
            sink.append(EventRecord {
                tick: event.tick,
                kind: event.kind.clone(),
                payload: event.payload.clone(),
            });
        }

        if depth >= self.max_depth {
            tracing::warn!(kind = %event.kind, tick = event.tick, "publish depth bound reached");
            self.failures.push(HandlerFailure {
                kind: event.kind.clone(),
                tick: event.tick,
                reason: format!("publish depth bound ({}) reached", self.max_depth),
            });
            return;
        }

        // Take the subscriber list out of the map so follow-up delivery can
        // reborrow the bus. Handlers cannot subscribe during delivery (they
        // hold no bus reference), so putting the list back is lossless.
        let Some(mut entries) = self.subscribers.remove(&event.kind) else {
            return;
        };

        let mut followups = Vec::new();
        for subscriber in &mut entries {
            match subscriber {
                Subscriber::Passive(listener) => listener(event),
                Subscriber::Reactive(handler) => match handler(event) {
                    Ok(events) => followups.extend(events),
                    Err(err) => {
                        tracing::warn!(kind = %event.kind, tick = event.tick, error = %err, "event handler failed");
                        self.failures.push(HandlerFailure {
                            kind: event.kind.clone(),
                            tick: event.tick,
                            reason: err.0,
                        });
                    }
                },
            }
        }
        self.subscribers.insert(event.kind.clone(), entries);

        // Depth-first: follow-ups complete before control returns to the
        // original publisher.
        for follow in followups {
            self.deliver(&follow, depth + 1);
        }
    }

    /// Contained delivery failures recorded so far.
    pub fn failures(&self) -> &[HandlerFailure] {
        &self.failures
    }

    /// Drain the failure records, clearing the internal list.
    pub fn take_failures(&mut self) -> Vec<HandlerFailure> {
        std::mem::take(&mut self.failures)
    }

    /// Total events published since creation (follow-ups included).
    pub fn published_count(&self) -> u64 {
        self.published
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn publish_delivers_in_subscription_order() {
        let mut bus = EventBus::default();
        let log: Rc<RefCell<Vec<String>>> = Rc::default();
        let first = log.clone();
        bus.on_passive(EventKind::WorldChange, move |_| {
            first.borrow_mut().push("first".into());
        });
        let second = log.clone();
        bus.on_passive(EventKind::WorldChange, move |_| {
            second.borrow_mut().push("second".into());
        });
        bus.publish(Event::new(EventKind::WorldChange, 1));
        assert_eq!(*log.borrow(), vec!["first", "second"]);
    }

    #[test]
    fn no_subscribers_drops_event() {
        let mut bus = EventBus::default();
        bus.publish(Event::new(EventKind::CharacterAction, 1));
        assert_eq!(bus.published_count(), 1);
        assert!(bus.failures().is_empty());
    }

    #[test]
    fn exact_kind_match_only() {
        let mut bus = EventBus::default();
        let log: Rc<RefCell<Vec<String>>> = Rc::default();
        let hits = log.clone();
        bus.on_passive(EventKind::WorldChange, move |_| {
            hits.borrow_mut().push("hit".into());
        });
        bus.publish(Event::new(EventKind::CharacterAction, 1));
        bus.publish(Event::new(EventKind::Custom("world-change-2".into()), 1));
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn handler_failure_is_contained() {
        let mut bus = EventBus::default();
        let log: Rc<RefCell<Vec<String>>> = Rc::default();
        let survivor = log.clone();
        bus.on_reactive(EventKind::WorldChange, |_| {
            Err(HandlerError("boom".into()))
        });
        bus.on_passive(EventKind::WorldChange, move |_| {
            survivor.borrow_mut().push("still ran".into());
        });
        bus.publish(Event::new(EventKind::WorldChange, 7));

        // Delivery continued past the failing handler.
        assert_eq!(*log.borrow(), vec!["still ran"]);
        assert_eq!(bus.failures().len(), 1);
        assert_eq!(bus.failures()[0].tick, 7);
        assert_eq!(bus.failures()[0].reason, "boom");
    }

    #[test]
    fn followups_publish_depth_first() {
        let mut bus = EventBus::default();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        bus.on_reactive(EventKind::WorldChange, move |e| {
            o.borrow_mut().push(format!("a:{}", e.kind));
            Ok(vec![Event::new(EventKind::Custom("b".into()), e.tick)])
        });
        let o = order.clone();
        bus.on_reactive(EventKind::WorldChange, move |e| {
            o.borrow_mut().push(format!("c:{}", e.kind));
            Ok(vec![Event::new(EventKind::Custom("d".into()), e.tick)])
        });
        let o = order.clone();
        bus.on_reactive(EventKind::Custom("b".into()), move |_| {
            o.borrow_mut().push("b-nested".into());
            Ok(vec![Event::new(EventKind::Custom("e".into()), 0)])
        });
        let o = order.clone();
        bus.on_passive(EventKind::Custom("e".into()), move |_| {
            o.borrow_mut().push("e-leaf".into());
        });
        let o = order.clone();
        bus.on_passive(EventKind::Custom("d".into()), move |_| {
            o.borrow_mut().push("d-leaf".into());
        });

        bus.publish(Event::new(EventKind::WorldChange, 1));
        assert_eq!(
            *order.borrow(),
            vec![
                "a:world-change",
                "c:world-change",
                "b-nested",
                "e-leaf",
                "d-leaf"
            ]
        );
    }

    #[test]
    fn depth_bound_records_failure_instead_of_recursing() {
        let mut bus = EventBus::new(3);
        // Handler that republishes its own kind forever.
        bus.on_reactive(EventKind::WorldChange, |e| {
            Ok(vec![Event::new(EventKind::WorldChange, e.tick)])
        });
        bus.publish(Event::new(EventKind::WorldChange, 1));
        assert_eq!(bus.failures().len(), 1);
        assert!(bus.failures()[0].reason.contains("depth bound"));
    }

    #[test]
    fn sink_receives_all_events_in_emission_order() {
        let mut bus = EventBus::default();
        let log = Rc::new(RefCell::new(MemoryEventLog::new()));
        bus.set_sink(log.clone());

        bus.on_reactive(EventKind::WorldChange, |e| {
            Ok(vec![
                Event::new(EventKind::CharacterAction, e.tick).with("who", "npc-1"),
            ])
        });
        bus.publish(Event::new(EventKind::WorldChange, 3).with("what", "storm"));
        bus.publish(Event::new(EventKind::TickBoundary, 3));

        let log = log.borrow();
        let kinds: Vec<&str> = log.records().iter().map(|r| r.kind.label()).collect();
        assert_eq!(kinds, vec!["world-change", "character-action", "tick-boundary"]);
        assert_eq!(log.records()[0].tick, 3);
        assert_eq!(log.records()[1].payload["who"], Value::Text("npc-1".into()));
    }

    #[test]
    fn kind_labels_round_trip() {
        for label in [
            "character-action",
            "world-change",
            "entity-added",
            "entity-removed",
            "injection-applied",
            "injection-rejected",
            "tick-boundary",
            "simulation-fatal",
            "storm-front",
        ] {
            assert_eq!(EventKind::parse(label).label(), label);
        }
        assert!(matches!(
            EventKind::parse("storm-front"),
            EventKind::Custom(_)
        ));
    }

    #[test]
    fn take_failures_clears_the_list() {
        let mut bus = EventBus::default();
        bus.on_reactive(EventKind::WorldChange, |_| Err(HandlerError("x".into())));
        bus.publish(Event::new(EventKind::WorldChange, 1));
        assert_eq!(bus.take_failures().len(), 1);
        assert!(bus.failures().is_empty());
    }
}
