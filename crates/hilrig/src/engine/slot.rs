//! Slot: one fixture position on the platform, holding at most one unit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value, json};

use super::spec::{InsertUut, PowerSwitch, SlotLayout};
use super::status::Status;
use super::uut::Uut;
use super::{Bench, EngineError, NodeCore, lock_or_recover};
use crate::bridge::protocol::{Address, CommandResponse, RecipientType};
use crate::event::{EventBus, EventKind};
use crate::router::{self, CommandTable, Commandable};

pub struct Slot {
    index: usize,
    label: String,
    power: Option<PowerSwitch>,
    core: NodeCore,
    uut: Mutex<Option<Arc<Uut>>>,
    /// Set once the platform drops this slot; a handler already queued on
    /// its lock must not seat a unit under the reused address.
    retired: AtomicBool,
}

impl Slot {
    pub(crate) fn new(
        platform: &Address,
        index: usize,
        layout: &SlotLayout,
        events: EventBus,
    ) -> Arc<Self> {
        let label = layout
            .label
            .clone()
            .unwrap_or_else(|| format!("slot-{index}"));
        let slot = Arc::new(Self {
            index,
            label,
            power: layout.power.clone(),
            core: NodeCore::new(platform.clone().slot(index), events),
            uut: Mutex::new(None),
            retired: AtomicBool::new(false),
        });
        slot.core
            .fire(slot.core.event(EventKind::SlotInit).with("label", slot.label.as_str()));
        slot.core.fire_status(Status::READY, Status::INIT);
        slot.core.fire(slot.core.event(EventKind::SlotReady));
        slot
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn core(&self) -> &NodeCore {
        &self.core
    }

    pub fn address(&self) -> &Address {
        self.core.address()
    }

    pub fn status(&self) -> Status {
        self.core.status()
    }

    pub fn uut(&self) -> Option<Arc<Uut>> {
        lock_or_recover(&self.uut, "slot uut").clone()
    }

    pub fn is_occupied(&self) -> bool {
        lock_or_recover(&self.uut, "slot uut").is_some()
    }

    /// Build and seat a unit. An occupied slot is left alone and reports
    /// "slot already populated" on the bus; that case returns `Ok(None)`.
    pub fn insert_uut(&self, bench: &Bench, req: InsertUut) -> Result<Option<Arc<Uut>>, EngineError> {
        if self.retired.load(Ordering::SeqCst) {
            return Err(EngineError::NotFound(format!(
                "slot {} was removed by a reconfigure",
                self.address()
            )));
        }
        let mut seated = lock_or_recover(&self.uut, "slot uut");
        if let Some(current) = seated.as_ref() {
            tracing::info!(slot = %self.address(), current = %current.serial(), requested = %req.serial, "Slot already populated");
            self.core.fire(
                self.core
                    .event(EventKind::UpdateStatus)
                    .with("message", "slot already populated")
                    .with("serial", current.serial()),
            );
            return Ok(None);
        }

        let uut = Uut::new(bench, self.address(), &req.serial, &req.suite)?;
        *seated = Some(Arc::clone(&uut));
        drop(seated);

        self.core.fire_status(Status::OCCUPIED, Status::NONE);
        self.core
            .fire(self.core.event(EventKind::SlotBusy).with("serial", req.serial.as_str()));
        tracing::info!(slot = %self.address(), serial = %req.serial, tests = req.suite.len(), "Unit inserted");
        Ok(Some(uut))
    }

    /// Tear down the seated unit, if any.
    pub fn remove_uut(&self, bench: &Bench) -> Option<String> {
        let uut = lock_or_recover(&self.uut, "slot uut").take()?;
        {
            let _guard = uut.core().lock().acquire();
            uut.deactivate(bench);
        }
        self.core.fire_status(Status::NONE, Status::OCCUPIED);
        self.core.fire(self.core.event(EventKind::SlotReady));
        tracing::info!(slot = %self.address(), serial = %uut.serial(), "Unit removed");
        Some(uut.serial().to_string())
    }

    /// Switch the slot supply through its relay, if it has one, and track POWER.
    pub fn set_power(&self, bench: &Bench, on: bool) -> Result<Status, EngineError> {
        if let Some(switch) = &self.power {
            let device = bench
                .instances()
                .get_or_create(
                    &power_key(&switch.instance),
                    &switch.class,
                    &switch.constructor_args,
                    bench.catalog(),
                )
                .map_err(|e| EngineError::device(&switch.instance, e))?;

            let mut kwargs = Map::new();
            kwargs.insert("channel".to_string(), Value::from(switch.channel));
            kwargs.insert("value".to_string(), Value::Bool(on));
            let ret = device
                .invoke(&switch.method, &kwargs)
                .map_err(|e| EngineError::device(&switch.instance, e))?;
            if let Some(ret) = ret
                && !ret.succeeded()
            {
                return Err(EngineError::device(
                    &switch.instance,
                    super::DeviceError::Failed(format!(
                        "{} returned exit status {}",
                        switch.method, ret.exit_status
                    )),
                ));
            }
        }

        let status = if on {
            self.core.fire_status(Status::POWER, Status::NONE)
        } else {
            self.core.fire_status(Status::NONE, Status::POWER)
        };
        tracing::debug!(slot = %self.address(), on, "Slot power switched");
        Ok(status)
    }

    pub(crate) fn destroy(&self, bench: &Bench) {
        self.retired.store(true, Ordering::SeqCst);
        bench.registry().remove(self.address());
        self.core.fire(self.core.event(EventKind::Destroy));
    }
}

/// Cache key for a power relay, kept apart from action names so destroying
/// an action never evicts a supply switch.
pub(crate) fn power_key(instance: &str) -> String {
    format!("power:{instance}")
}

fn get_uut(slot: &Arc<Slot>, _bench: &Bench, _data: Value) -> Result<CommandResponse, EngineError> {
    let info = slot.uut().map(|uut| {
        json!({
            "serial": uut.serial(),
            "address": uut.address(),
            "status": uut.status().bits(),
            "flags": uut.status().names(),
        })
    });
    Ok(CommandResponse::ok(info.unwrap_or(Value::Null)))
}

fn insert_uut(slot: &Arc<Slot>, bench: &Bench, data: Value) -> Result<CommandResponse, EngineError> {
    let req: InsertUut = serde_json::from_value(data)?;
    let inserted = slot.insert_uut(bench, req)?;
    Ok(CommandResponse::ok(Value::Bool(inserted.is_some())))
}

fn remove_uut(slot: &Arc<Slot>, bench: &Bench, _data: Value) -> Result<CommandResponse, EngineError> {
    let removed = slot.remove_uut(bench);
    Ok(CommandResponse::ok(removed.map(Value::String).unwrap_or(Value::Null)))
}

fn power_on(slot: &Arc<Slot>, bench: &Bench, _data: Value) -> Result<CommandResponse, EngineError> {
    slot.set_power(bench, true)?;
    Ok(CommandResponse::ok(Value::Bool(true)))
}

fn power_off(slot: &Arc<Slot>, bench: &Bench, _data: Value) -> Result<CommandResponse, EngineError> {
    slot.set_power(bench, false)?;
    Ok(CommandResponse::ok(Value::Bool(true)))
}

static COMMANDS: CommandTable<Slot> = CommandTable {
    sync: &[
        ("acknowledge", router::acknowledge::<Slot>),
        ("status", router::status::<Slot>),
        ("get_uut", get_uut),
    ],
    asynchronous: &[
        ("acknowledge", router::acknowledge_async::<Slot>),
        ("insert_uut", insert_uut),
        ("set_uut_serialnum", insert_uut),
        ("remove_uut", remove_uut),
        ("power_on", power_on),
        ("power_off", power_off),
    ],
};

impl Commandable for Slot {
    const KIND: RecipientType = RecipientType::Slot;

    fn commands() -> &'static CommandTable<Self> {
        &COMMANDS
    }

    fn core(&self) -> &NodeCore {
        &self.core
    }
}
