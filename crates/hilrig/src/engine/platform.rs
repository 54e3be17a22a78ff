//! Platform: root node of a bench, owning its slots.

use std::sync::{Arc, Mutex};

use serde_json::{Value, json};

use super::slot::Slot;
use super::spec::PlatformLayout;
use super::status::Status;
use super::{Bench, EngineError, NodeCore, Recipient, lock_or_recover};
use crate::bridge::protocol::{Address, CommandResponse, RecipientType};
use crate::event::{EventBus, EventKind};
use crate::router::{self, CommandTable, Commandable};

pub struct Platform {
    name: String,
    core: NodeCore,
    slots: Mutex<Vec<Arc<Slot>>>,
}

impl Platform {
    pub(crate) fn new(name: &str, events: EventBus) -> Arc<Self> {
        let platform = Arc::new(Self {
            name: name.to_string(),
            core: NodeCore::new(Address::platform(name), events),
            slots: Mutex::new(Vec::new()),
        });
        platform
            .core
            .fire(platform.core.event(EventKind::PlatformInit).with("name", name));
        platform
    }

    pub fn name(&self) -> &str {
        &self.name
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

    pub fn slots(&self) -> Vec<Arc<Slot>> {
        lock_or_recover(&self.slots, "platform slots").clone()
    }

    pub fn slot(&self, index: usize) -> Option<Arc<Slot>> {
        lock_or_recover(&self.slots, "platform slots")
            .get(index)
            .cloned()
    }

    /// Replace the slot layout. Refused while any slot holds a unit.
    ///
    /// Every current slot's lock is held from the occupancy check through
    /// its destruction, so an in-flight slot handler finishes first.
    pub fn configure(&self, bench: &Bench, layout: &PlatformLayout) -> Result<(), EngineError> {
        let mut slots = lock_or_recover(&self.slots, "platform slots");
        let current = slots.clone();
        let _guards: Vec<_> = current.iter().map(|s| s.core().lock().acquire()).collect();
        if let Some(busy) = current.iter().find(|s| s.is_occupied()) {
            return Err(EngineError::Busy(format!(
                "cannot reconfigure {}: slot {} is populated",
                self.name,
                busy.index()
            )));
        }

        for old in slots.drain(..).rev() {
            old.destroy(bench);
        }

        for (index, slot_layout) in layout.slots.iter().enumerate() {
            let slot = Slot::new(self.address(), index, slot_layout, self.core.events().clone());
            bench
                .registry()
                .insert(slot.address().clone(), Recipient::Slot(Arc::clone(&slot)))?;
            slots.push(slot);
        }

        self.core.fire_status(Status::READY, Status::INIT);
        self.core.fire(
            self.core
                .event(EventKind::PlatformReady)
                .with("slots", slots.len()),
        );
        tracing::debug!(platform = %self.name, slots = slots.len(), "Platform configured");
        Ok(())
    }

    /// Remove every unit and slot, last slot first, then the platform itself.
    pub(crate) fn teardown(&self, bench: &Bench) {
        let slots: Vec<Arc<Slot>> = lock_or_recover(&self.slots, "platform slots")
            .drain(..)
            .collect();
        for slot in slots.into_iter().rev() {
            let _guard = slot.core().lock().acquire();
            slot.remove_uut(bench);
            slot.destroy(bench);
        }
        bench.registry().remove(self.address());
        self.core.fire(self.core.event(EventKind::Destroy));
    }
}

fn list_slots(platform: &Arc<Platform>, _bench: &Bench, _data: Value) -> Result<CommandResponse, EngineError> {
    let slots: Vec<Value> = platform
        .slots()
        .iter()
        .map(|slot| {
            json!({
                "index": slot.index(),
                "label": slot.label(),
                "address": slot.address(),
                "serial": slot.uut().map(|u| u.serial().to_string()),
                "status": slot.status().bits(),
            })
        })
        .collect();
    Ok(CommandResponse::ok(Value::Array(slots)))
}

fn configure(platform: &Arc<Platform>, bench: &Bench, data: Value) -> Result<CommandResponse, EngineError> {
    let layout: PlatformLayout = serde_json::from_value(data)?;
    platform.configure(bench, &layout)?;
    Ok(CommandResponse::ok(Value::Bool(true)))
}

static COMMANDS: CommandTable<Platform> = CommandTable {
    sync: &[
        ("acknowledge", router::acknowledge::<Platform>),
        ("status", router::status::<Platform>),
        ("list_slots", list_slots),
    ],
    asynchronous: &[
        ("acknowledge", router::acknowledge_async::<Platform>),
        ("configure", configure),
    ],
};

impl Commandable for Platform {
    const KIND: RecipientType = RecipientType::Platform;

    fn commands() -> &'static CommandTable<Self> {
        &COMMANDS
    }

    fn core(&self) -> &NodeCore {
        &self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PlatformLayout;
    use crate::engine::spec::InsertUut;

    #[test]
    fn configure_replaces_empty_slots() {
        let bench = Bench::builder("rig")
            .with_layout(PlatformLayout::with_slots(4))
            .build()
            .unwrap();
        let platform = bench.platform();
        platform
            .configure(&bench, &PlatformLayout::with_slots(2))
            .unwrap();
        assert_eq!(platform.slots().len(), 2);
        assert!(!bench.registry().contains(&Address::platform("rig").slot(3)));
        assert!(platform.status().contains(Status::READY));
    }

    #[test]
    fn configure_refuses_while_populated() {
        let bench = Bench::builder("rig")
            .with_layout(PlatformLayout::with_slots(1))
            .build()
            .unwrap();
        let slot = bench.platform().slot(0).unwrap();
        slot.insert_uut(
            &bench,
            InsertUut {
                serial: "SN1".to_string(),
                suite: Vec::new(),
            },
        )
        .unwrap();

        let err = bench
            .platform()
            .configure(&bench, &PlatformLayout::with_slots(3))
            .unwrap_err();
        assert!(matches!(err, EngineError::Busy(_)));
        assert_eq!(bench.platform().slots().len(), 1);
    }

    fn seat(slot: &Slot, bench: &Bench, serial: &str) -> Result<Option<Arc<crate::engine::Uut>>, EngineError> {
        slot.insert_uut(
            bench,
            InsertUut {
                serial: serial.to_string(),
                suite: Vec::new(),
            },
        )
    }

    #[test]
    fn configure_waits_for_running_slot_handler() {
        let bench = Bench::builder("rig")
            .with_layout(PlatformLayout::with_slots(1))
            .build()
            .unwrap();
        let slot = bench.platform().slot(0).unwrap();

        // an insert_uut handler holds the slot lock
        let guard = slot.core().lock().acquire();
        let reconfigure = {
            let bench = Arc::clone(&bench);
            std::thread::spawn(move || {
                bench
                    .platform()
                    .configure(&bench, &PlatformLayout::with_slots(2))
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!reconfigure.is_finished());
        seat(&slot, &bench, "SN1").unwrap().unwrap();
        drop(guard);

        let err = reconfigure.join().unwrap().unwrap_err();
        assert!(matches!(err, EngineError::Busy(_)));
        assert_eq!(bench.platform().slots().len(), 1);
        assert!(bench.registry().contains(&Address::platform("rig").slot(0).uut("SN1")));
    }

    #[test]
    fn replaced_slot_refuses_units() {
        let bench = Bench::builder("rig")
            .with_layout(PlatformLayout::with_slots(1))
            .build()
            .unwrap();
        let stale = bench.platform().slot(0).unwrap();
        bench
            .platform()
            .configure(&bench, &PlatformLayout::with_slots(1))
            .unwrap();

        let err = seat(&stale, &bench, "SN1").unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
        assert!(!bench.registry().contains(&Address::platform("rig").slot(0).uut("SN1")));
        assert!(!bench.platform().slot(0).unwrap().is_occupied());
    }

    #[test]
    fn list_slots_reports_serials() {
        let bench = Bench::builder("rig")
            .with_layout(PlatformLayout::with_slots(2))
            .build()
            .unwrap();
        bench
            .platform()
            .slot(1)
            .unwrap()
            .insert_uut(
                &bench,
                InsertUut {
                    serial: "SN9".to_string(),
                    suite: Vec::new(),
                },
            )
            .unwrap();

        let resp = list_slots(bench.platform(), &bench, Value::Null).unwrap();
        let slots = resp.result.as_array().unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0]["serial"], Value::Null);
        assert_eq!(slots[1]["serial"], "SN9");
        assert_eq!(slots[1]["address"], json!(["rig", 1]));
    }
}
