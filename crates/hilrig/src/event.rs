//! Events and the fan-out bus.
//!
//! Recipients fire [`Event`]s; the [`EventBus`] hands each one to every
//! registered subscriber. While nobody is subscribed, events wait in a bounded
//! holding queue that the next registration drains, in fire order, before any
//! newer event can reach that subscriber.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::bridge::protocol::Address;

pub const DEFAULT_HOLDING_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    PlatformInit,
    PlatformReady,
    SlotInit,
    SlotReady,
    SlotBusy,
    UutInit,
    UutReady,
    UutBusy,
    TestInit,
    TestReady,
    TestStart,
    TestFatal,
    TestFinish,
    /// Operator input needed; carries `prompt`, `pass_label`, `fail_label`.
    TestInteract,
    ActionInit,
    ActionStart,
    ActionFinish,
    ActionFatal,
    /// Status bits changed; carries `status` and `flags`.
    Status,
    /// Handled condition worth showing the operator; carries `message`.
    UpdateStatus,
    /// Unexpected failure; carries `error` and `traceback`.
    Error,
    Destroy,
}

/// One notification. Built once, then shared read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            address: None,
            timestamp: Utc::now(),
            fields: Map::new(),
        }
    }

    pub fn at(mut self, address: &Address) -> Self {
        self.address = Some(address.clone());
        self
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// Delivery target for the bus.
pub trait EventSink: Send {
    /// Hand over one event. Returns false once the receiving side is gone,
    /// which unregisters the sink.
    fn deliver(&self, event: &Arc<Event>) -> bool;
}

impl EventSink for mpsc::UnboundedSender<Arc<Event>> {
    fn deliver(&self, event: &Arc<Event>) -> bool {
        self.send(Arc::clone(event)).is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct BusState {
    holding: VecDeque<Arc<Event>>,
    capacity: usize,
    subscribers: Vec<(SubscriberId, Box<dyn EventSink>)>,
    next_id: u64,
}

impl BusState {
    /// Keep an event for the next subscriber, dropping the oldest when full.
    fn hold(&mut self, event: Arc<Event>) {
        if self.holding.len() >= self.capacity {
            self.holding.pop_front();
            tracing::warn!(
                capacity = self.capacity,
                "Event holding queue full, dropping oldest event"
            );
        }
        self.holding.push_back(event);
    }
}

/// Cloneable handle to one shared bus.
#[derive(Clone)]
pub struct EventBus {
    state: Arc<Mutex<BusState>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("EventBus")
            .field("held", &state.holding.len())
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HOLDING_CAPACITY)
    }

    /// Bus whose holding queue keeps at most `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                holding: VecDeque::new(),
                capacity: capacity.max(1),
                subscribers: Vec::new(),
                next_id: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Event bus mutex poisoned - continuing with inner state");
                poisoned.into_inner()
            }
        }
    }

    /// Broadcast a freshly built event.
    pub fn fire(&self, event: Event) -> Arc<Event> {
        let event = Arc::new(event);
        self.publish(Arc::clone(&event));
        event
    }

    /// Broadcast an already shared event (e.g. one received from a server).
    pub fn publish(&self, event: Arc<Event>) {
        let mut state = self.lock();
        if state.subscribers.is_empty() {
            state.hold(event);
            return;
        }

        state.subscribers.retain(|(id, sink)| {
            let alive = sink.deliver(&event);
            if !alive {
                tracing::debug!(subscriber = %id, "Removing closed event subscriber");
            }
            alive
        });
        if state.subscribers.is_empty() {
            state.hold(event);
        }
    }

    /// Add a subscriber, first draining any held events into it.
    pub fn register(&self, sink: impl EventSink + 'static) -> SubscriberId {
        let mut state = self.lock();
        let id = SubscriberId(state.next_id);
        state.next_id += 1;

        let held = state.holding.len();
        let mut alive = true;
        while let Some(event) = state.holding.pop_front() {
            if !sink.deliver(&event) {
                state.holding.push_front(event);
                alive = false;
                break;
            }
        }
        if held > 0 {
            tracing::debug!(subscriber = %id, held, "Flushed held events to new subscriber");
        }

        if alive {
            state.subscribers.push((id, Box::new(sink)));
        }
        id
    }

    /// Convenience subscriber backed by an unbounded channel.
    pub fn subscribe(&self) -> (SubscriberId, mpsc::UnboundedReceiver<Arc<Event>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.register(tx), rx)
    }

    pub fn unregister(&self, id: SubscriberId) -> bool {
        let mut state = self.lock();
        let before = state.subscribers.len();
        state.subscribers.retain(|(sid, _)| *sid != id);
        state.subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn held_count(&self) -> usize {
        self.lock().holding.len()
    }
}
