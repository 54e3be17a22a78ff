//! Test execution engine: the addressable bench tree.
//!
//! Platform 1..* Slot, Slot 0..1 Uut, Uut 1..* Test, Test 1..* Action.
//!
//! [`Bench`] is the root context. It owns the [`Registry`] arena mapping every
//! live address to its node, the shared [`EventBus`], the device catalog and
//! instance cache, and the result sink. Nodes hold no reference back to the
//! bench; operations that need it take `&Bench`.

pub mod action;
pub mod device;
pub mod error;
pub mod platform;
pub mod sink;
pub mod slot;
pub mod spec;
pub mod status;
pub mod test;
pub mod uut;

use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::{Value, json};

use crate::bridge::protocol::{Address, RecipientType};
use crate::event::{DEFAULT_HOLDING_CAPACITY, Event, EventBus, EventKind};

pub use action::Action;
pub use device::{ActionReturn, Device, DeviceCatalog, DeviceClass, DeviceError, InstanceCache};
pub use error::{EngineError, SpecError};
pub use platform::Platform;
pub use sink::{JsonLinesSink, ResultRecord, ResultSink, TracingSink};
pub use slot::Slot;
pub use spec::{ActionSpec, InsertUut, PlatformLayout, PowerSwitch, SlotLayout, TestKindSpec, TestSpec};
pub use status::{Status, StatusCell};
pub use test::{Comparison, Test, TestKind};
pub use uut::Uut;

/// Lock a mutex, recovering the inner value if a previous holder panicked.
pub(crate) fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(what, "Mutex poisoned - continuing with inner state");
            mutex.clear_poison();
            poisoned.into_inner()
        }
    }
}

/// Serializes command execution on one recipient.
///
/// Not reentrant: handlers never re-acquire the lock of the node they run on.
/// Nested acquisition always goes parent → child (slot, uut, test, action).
#[derive(Debug, Default)]
pub struct RecipientLock(Mutex<()>);

impl RecipientLock {
    pub fn acquire(&self) -> MutexGuard<'_, ()> {
        lock_or_recover(&self.0, "recipient lock")
    }
}

/// State every node carries: address, lock, status and the bus it fires on.
#[derive(Debug)]
pub struct NodeCore {
    address: Address,
    lock: RecipientLock,
    status: StatusCell,
    events: EventBus,
}

impl NodeCore {
    pub fn new(address: Address, events: EventBus) -> Self {
        Self {
            address,
            lock: RecipientLock::default(),
            status: StatusCell::new(Status::INIT),
            events,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn lock(&self) -> &RecipientLock {
        &self.lock
    }

    pub fn status(&self) -> Status {
        self.status.get()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Event stamped with this node's address.
    pub fn event(&self, kind: EventKind) -> Event {
        Event::new(kind).at(&self.address)
    }

    pub fn fire(&self, event: Event) {
        self.events.fire(event);
    }

    /// Clear `off`, set `on`, and announce the new mask.
    pub fn fire_status(&self, on: Status, off: Status) -> Status {
        let status = self.status.update(on, off);
        self.fire(
            self.event(EventKind::Status)
                .with("status", status.bits())
                .with("flags", status.names()),
        );
        status
    }

    pub fn status_json(&self) -> Value {
        let status = self.status();
        json!({ "status": status.bits(), "flags": status.names() })
    }
}

/// Handle to any live node.
#[derive(Clone)]
pub enum Recipient {
    Platform(Arc<Platform>),
    Slot(Arc<Slot>),
    Uut(Arc<Uut>),
    Test(Arc<Test>),
    Action(Arc<Action>),
}

impl Recipient {
    pub fn kind(&self) -> RecipientType {
        match self {
            Recipient::Platform(_) => RecipientType::Platform,
            Recipient::Slot(_) => RecipientType::Slot,
            Recipient::Uut(_) => RecipientType::Uut,
            Recipient::Test(_) => RecipientType::Test,
            Recipient::Action(_) => RecipientType::Action,
        }
    }

    pub fn core(&self) -> &NodeCore {
        match self {
            Recipient::Platform(n) => n.core(),
            Recipient::Slot(n) => n.core(),
            Recipient::Uut(n) => n.core(),
            Recipient::Test(n) => n.core(),
            Recipient::Action(n) => n.core(),
        }
    }
}

/// Arena of live nodes by address.
///
/// Written only when a node is built or destroyed. Lookups never touch any
/// node's recipient lock.
#[derive(Default)]
pub struct Registry {
    entries: DashMap<Address, Recipient>,
}

impl Registry {
    pub fn insert(&self, address: Address, recipient: Recipient) -> Result<(), SpecError> {
        match self.entries.entry(address) {
            Entry::Occupied(entry) => Err(SpecError::DuplicateAddress(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(recipient);
                Ok(())
            }
        }
    }

    pub fn get(&self, address: &Address) -> Option<Recipient> {
        self.entries.get(address).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, address: &Address) -> Option<Recipient> {
        self.entries.remove(address).map(|(_, recipient)| recipient)
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.entries.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

/// Root context of one bench.
pub struct Bench {
    platform: Arc<Platform>,
    registry: Registry,
    events: EventBus,
    catalog: DeviceCatalog,
    instances: InstanceCache,
    sink: Arc<dyn ResultSink>,
}

impl Bench {
    pub fn builder(name: impl Into<String>) -> BenchBuilder {
        BenchBuilder::new(name)
    }

    pub fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn catalog(&self) -> &DeviceCatalog {
        &self.catalog
    }

    pub fn instances(&self) -> &InstanceCache {
        &self.instances
    }

    pub fn sink(&self) -> &dyn ResultSink {
        self.sink.as_ref()
    }

    /// Remove every unit, slot and the platform itself, then drop cached devices.
    pub fn teardown(&self) {
        self.platform.teardown(self);
        if !self.registry.is_empty() {
            tracing::warn!(
                remaining = self.registry.len(),
                "Registry not empty after teardown, clearing"
            );
            self.registry.clear();
        }
        self.instances.clear();
        tracing::info!(platform = %self.platform.name(), "Bench torn down");
    }
}

pub struct BenchBuilder {
    name: String,
    layout: PlatformLayout,
    catalog: DeviceCatalog,
    sink: Option<Arc<dyn ResultSink>>,
    holding_capacity: usize,
}

impl BenchBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            layout: PlatformLayout::default(),
            catalog: DeviceCatalog::with_builtins(),
            sink: None,
            holding_capacity: DEFAULT_HOLDING_CAPACITY,
        }
    }

    pub fn with_layout(mut self, layout: PlatformLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_catalog(mut self, catalog: DeviceCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_holding_capacity(mut self, capacity: usize) -> Self {
        self.holding_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<Arc<Bench>, EngineError> {
        crate::router::validate_command_tables()?;
        if self.name.is_empty() {
            return Err(SpecError::InvalidLayout("platform name is empty".to_string()).into());
        }

        let events = EventBus::with_capacity(self.holding_capacity);
        let platform = Platform::new(&self.name, events.clone());
        let bench = Bench {
            platform: Arc::clone(&platform),
            registry: Registry::default(),
            events,
            catalog: self.catalog,
            instances: InstanceCache::default(),
            sink: self.sink.unwrap_or_else(|| Arc::new(TracingSink)),
        };
        bench.registry.insert(
            platform.core().address().clone(),
            Recipient::Platform(Arc::clone(&platform)),
        )?;
        platform.configure(&bench, &self.layout)?;

        tracing::info!(
            platform = %self.name,
            slots = self.layout.slots.len(),
            classes = ?bench.catalog.class_names(),
            "Bench ready"
        );
        Ok(Arc::new(bench))
    }
}
