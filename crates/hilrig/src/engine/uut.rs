//! Unit under test: one board seated in a slot, with its test suite.

use std::sync::{Arc, Mutex};

use serde::Deserialize;
use serde_json::{Value, json};

use super::spec::TestSpec;
use super::status::Status;
use super::test::Test;
use super::{Bench, EngineError, NodeCore, Recipient, lock_or_recover};
use crate::bridge::protocol::{Address, CommandResponse, RecipientType};
use crate::event::EventKind;
use crate::router::{self, CommandTable, Commandable};

#[derive(Debug)]
pub struct Uut {
    serial: String,
    core: NodeCore,
    tests: Mutex<Vec<Arc<Test>>>,
}

impl Uut {
    /// Validate the whole suite, then build the unit and its tests.
    ///
    /// On a partial build failure every node already created is destroyed
    /// again, so the registry never keeps half a unit.
    pub fn new(
        bench: &Bench,
        slot: &Address,
        serial: &str,
        suite: &[TestSpec],
    ) -> Result<Arc<Self>, EngineError> {
        if serial.is_empty() {
            return Err(EngineError::Unsupported("unit serial must not be empty".to_string()));
        }
        for spec in suite {
            spec.validate(bench.catalog())?;
        }

        let uut = Arc::new(Self {
            serial: serial.to_string(),
            core: NodeCore::new(slot.clone().uut(serial), bench.events().clone()),
            tests: Mutex::new(Vec::with_capacity(suite.len())),
        });
        bench
            .registry()
            .insert(uut.address().clone(), Recipient::Uut(Arc::clone(&uut)))?;
        uut.core
            .fire(uut.core.event(EventKind::UutInit).with("serial", serial));

        for (index, spec) in suite.iter().enumerate() {
            match Test::new(bench, uut.address(), index, spec) {
                Ok(test) => lock_or_recover(&uut.tests, "uut tests").push(test),
                Err(e) => {
                    tracing::warn!(serial, test = %spec.name, error = %e, "Unit build failed, unwinding");
                    uut.deactivate(bench);
                    return Err(e);
                }
            }
        }

        uut.core.fire_status(Status::READY, Status::INIT);
        uut.core.fire(uut.core.event(EventKind::UutReady));
        Ok(uut)
    }

    pub fn serial(&self) -> &str {
        &self.serial
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

    pub fn tests(&self) -> Vec<Arc<Test>> {
        lock_or_recover(&self.tests, "uut tests").clone()
    }

    pub fn test(&self, index: usize) -> Option<Arc<Test>> {
        lock_or_recover(&self.tests, "uut tests").get(index).cloned()
    }

    /// Run every test in order. Each test runs under its own recipient lock.
    pub fn run_tests(&self, bench: &Bench) -> Status {
        self.run(bench, self.tests())
    }

    pub fn run_test(&self, bench: &Bench, index: usize) -> Result<Status, EngineError> {
        let test = self.test(index).ok_or_else(|| {
            EngineError::NotFound(format!("test {index} on unit {}", self.serial))
        })?;
        Ok(self.run(bench, vec![test]))
    }

    fn run(&self, bench: &Bench, tests: Vec<Arc<Test>>) -> Status {
        self.core.fire_status(
            Status::RUNNING,
            Status::HAS_RUN | Status::FAIL | Status::BROKEN,
        );
        self.core
            .fire(self.core.event(EventKind::UutBusy).with("tests", tests.len()));

        let mut failed = Status::NONE;
        for test in &tests {
            let status = {
                let _guard = test.core().lock().acquire();
                test.run(bench)
            };
            failed |= status & (Status::FAIL | Status::BROKEN);
        }

        let status = self.core.fire_status(Status::HAS_RUN | failed, Status::RUNNING);
        self.core.fire(self.core.event(EventKind::UutReady));
        tracing::info!(serial = %self.serial, status = %status, "Unit run complete");
        status
    }

    /// Tear down last-first: every action, then every test, then this unit.
    pub(crate) fn deactivate(&self, bench: &Bench) {
        let tests: Vec<Arc<Test>> = lock_or_recover(&self.tests, "uut tests").drain(..).collect();
        for test in tests.iter().rev() {
            let _guard = test.core().lock().acquire();
            test.destroy_actions(bench);
        }
        for test in tests.iter().rev() {
            let _guard = test.core().lock().acquire();
            test.destroy(bench);
        }
        bench.registry().remove(self.address());
        self.core.fire(self.core.event(EventKind::Destroy));
    }
}

fn list_tests(uut: &Arc<Uut>, _bench: &Bench, _data: Value) -> Result<CommandResponse, EngineError> {
    let tests: Vec<Value> = uut
        .tests()
        .iter()
        .map(|test| {
            json!({
                "index": test.index(),
                "name": test.name(),
                "type": test.kind().as_str(),
                "address": test.address(),
                "status": test.status().bits(),
                "flags": test.status().names(),
            })
        })
        .collect();
    Ok(CommandResponse::ok(Value::Array(tests)))
}

fn run_tests(uut: &Arc<Uut>, bench: &Bench, _data: Value) -> Result<CommandResponse, EngineError> {
    let status = uut.run_tests(bench);
    Ok(CommandResponse::ok(Value::from(status.bits())))
}

#[derive(Deserialize)]
struct RunTest {
    index: usize,
}

fn run_test(uut: &Arc<Uut>, bench: &Bench, data: Value) -> Result<CommandResponse, EngineError> {
    let RunTest { index } = serde_json::from_value(data)?;
    let status = uut.run_test(bench, index)?;
    Ok(CommandResponse::ok(Value::from(status.bits())))
}

static COMMANDS: CommandTable<Uut> = CommandTable {
    sync: &[
        ("acknowledge", router::acknowledge::<Uut>),
        ("status", router::status::<Uut>),
        ("list_tests", list_tests),
    ],
    asynchronous: &[
        ("acknowledge", router::acknowledge_async::<Uut>),
        ("run_tests", run_tests),
        ("run_test", run_test),
    ],
};

impl Commandable for Uut {
    const KIND: RecipientType = RecipientType::Uut;

    fn commands() -> &'static CommandTable<Self> {
        &COMMANDS
    }

    fn core(&self) -> &NodeCore {
        &self.core
    }
}
