//! Action: one device method call inside a test.

use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

use super::device::ActionReturn;
use super::spec::ActionSpec;
use super::status::Status;
use super::test::Comparison;
use super::{Bench, EngineError, NodeCore, Recipient, lock_or_recover};
use crate::bridge::protocol::{Address, CommandResponse, RecipientType};
use crate::engine::sink::ResultRecord;
use crate::event::EventKind;
use crate::router::{self, CommandTable, Commandable};

#[derive(Debug)]
pub struct Action {
    name: String,
    index: usize,
    class: String,
    method: String,
    kwargs: Map<String, Value>,
    constructor_args: Map<String, Value>,
    allow_fail: bool,
    value_key: String,
    core: NodeCore,
    last: Mutex<Option<ActionReturn>>,
}

impl Action {
    pub(crate) fn new(
        bench: &Bench,
        test: &Address,
        index: usize,
        spec: &ActionSpec,
    ) -> Result<Arc<Self>, EngineError> {
        let action = Arc::new(Self {
            name: spec.name.clone(),
            index,
            class: spec.class.clone(),
            method: spec.method.clone(),
            kwargs: spec.kwargs.clone(),
            constructor_args: spec.constructor_args.clone(),
            allow_fail: spec.allow_fail,
            value_key: spec.value_key.clone(),
            core: NodeCore::new(test.clone().action(index), bench.events().clone()),
            last: Mutex::new(None),
        });
        bench
            .registry()
            .insert(action.address().clone(), Recipient::Action(Arc::clone(&action)))?;
        action.core.fire(
            action
                .core
                .event(EventKind::ActionInit)
                .with("name", action.name.as_str())
                .with("class", action.class.as_str())
                .with("method", action.method.as_str()),
        );
        action.core.fire_status(Status::READY, Status::INIT);
        Ok(action)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn method(&self) -> &str {
        &self.method
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

    pub fn last_return(&self) -> Option<ActionReturn> {
        lock_or_recover(&self.last, "action return").clone()
    }

    /// Invoke the device method. `value`, when given, is passed under the
    /// action's value key on top of its static kwargs.
    ///
    /// A nonzero exit status sets FAIL unless `allow_fail`; it is not an error.
    /// Device errors set BROKEN and are returned.
    pub fn call(&self, bench: &Bench, value: Option<Value>) -> Result<Option<ActionReturn>, EngineError> {
        self.core.fire(
            self.core
                .event(EventKind::ActionStart)
                .with("name", self.name.as_str())
                .with("method", self.method.as_str()),
        );
        self.core
            .fire_status(Status::RUNNING, Status::FAIL | Status::BROKEN);

        match self.invoke(bench, value) {
            Ok(ret) => {
                let failed = ret.as_ref().is_some_and(|r| !r.succeeded()) && !self.allow_fail;
                let fail = if failed { Status::FAIL } else { Status::NONE };
                self.core
                    .fire_status(Status::HAS_RUN | fail, Status::RUNNING);

                let (exit_status, output) = ret
                    .as_ref()
                    .map(|r| (r.exit_status.clone(), r.output.clone()))
                    .unwrap_or((Value::Null, Value::Null));
                self.core.fire(
                    self.core
                        .event(EventKind::ActionFinish)
                        .with("name", self.name.as_str())
                        .with("exit_status", exit_status)
                        .with("output", output),
                );
                *lock_or_recover(&self.last, "action return") = ret.clone();
                Ok(ret)
            }
            Err(e) => {
                self.core
                    .fire_status(Status::HAS_RUN | Status::BROKEN, Status::RUNNING);
                self.core.fire(
                    self.core
                        .event(EventKind::ActionFatal)
                        .with("name", self.name.as_str())
                        .with("error", e.to_string()),
                );
                *lock_or_recover(&self.last, "action return") = None;
                Err(e)
            }
        }
    }

    fn invoke(&self, bench: &Bench, value: Option<Value>) -> Result<Option<ActionReturn>, EngineError> {
        let device = bench
            .instances()
            .get_or_create(&self.name, &self.class, &self.constructor_args, bench.catalog())
            .map_err(|e| EngineError::device(&self.name, e))?;

        let ret = match value {
            Some(value) => {
                let mut kwargs = self.kwargs.clone();
                kwargs.insert(self.value_key.clone(), value);
                device.invoke(&self.method, &kwargs)
            }
            None => device.invoke(&self.method, &self.kwargs),
        };
        ret.map_err(|e| EngineError::device(&self.name, e))
    }

    pub fn record(&self, comparison: Option<&Comparison>) -> ResultRecord {
        let mut record =
            ResultRecord::new(RecipientType::Action, &self.name, self.address(), self.status());
        if let Some(ret) = self.last_return() {
            record.exit_status = Some(ret.exit_status);
            record.output = Some(ret.output);
        }
        if let Some(c) = comparison {
            record.expected = Some(c.expected.clone());
            record.actual = Some(c.actual.clone());
            record.tolerance = Some(c.tolerance);
        }
        record
    }

    /// Drop the cached device instance and leave the registry.
    pub(crate) fn destroy(&self, bench: &Bench) {
        if bench.instances().evict(&self.name) {
            tracing::debug!(action = %self.name, "Evicted device instance");
        }
        bench.registry().remove(self.address());
        self.core.fire(self.core.event(EventKind::Destroy));
    }
}

fn call(action: &Arc<Action>, bench: &Bench, data: Value) -> Result<CommandResponse, EngineError> {
    let value = (!data.is_null()).then_some(data);
    let ret = action.call(bench, value)?;
    bench.sink().record(&action.record(None));
    Ok(CommandResponse::ok(serde_json::to_value(ret)?))
}

static COMMANDS: CommandTable<Action> = CommandTable {
    sync: &[
        ("acknowledge", router::acknowledge::<Action>),
        ("status", router::status::<Action>),
    ],
    asynchronous: &[
        ("acknowledge", router::acknowledge_async::<Action>),
        ("call", call),
    ],
};

impl Commandable for Action {
    const KIND: RecipientType = RecipientType::Action;

    fn commands() -> &'static CommandTable<Self> {
        &COMMANDS
    }

    fn core(&self) -> &NodeCore {
        &self.core
    }
}
