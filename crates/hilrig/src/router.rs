//! Command routing: address lookup, per-type command tables, dispatch.
//!
//! Every recipient type declares two static tables, one for synchronous and
//! one for asynchronous commands. A synchronous command runs on the caller's
//! thread under the recipient lock and its `(result, message)` is the reply.
//! An asynchronous command is acknowledged immediately and runs on a worker
//! thread; whatever it produces reaches clients as events.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::bridge::protocol::{Address, Command, CommandResponse, RecipientType};
use crate::engine::error::error_chain;
use crate::engine::{Action, Bench, EngineError, NodeCore, Platform, Recipient, Slot, SpecError, Test, Uut};
use crate::event::{Event, EventKind};

/// Command implementation for recipients of type `N`.
pub type Handler<N> = fn(&Arc<N>, &Bench, Value) -> Result<CommandResponse, EngineError>;

/// Static command tables for one recipient type.
pub struct CommandTable<N: 'static> {
    pub sync: &'static [(&'static str, Handler<N>)],
    pub asynchronous: &'static [(&'static str, Handler<N>)],
}

impl<N> CommandTable<N> {
    pub fn find(&self, name: &str, synchronous: bool) -> Option<Handler<N>> {
        let table = if synchronous { self.sync } else { self.asynchronous };
        table.iter().find(|(n, _)| *n == name).map(|(_, h)| *h)
    }

    pub fn names(&self, synchronous: bool) -> Vec<&'static str> {
        let table = if synchronous { self.sync } else { self.asynchronous };
        table.iter().map(|(n, _)| *n).collect()
    }

    fn check_unique(&self, recipient: &'static str) -> Result<(), SpecError> {
        for table in [self.sync, self.asynchronous] {
            for (i, (name, _)) in table.iter().enumerate() {
                if table[..i].iter().any(|(seen, _)| seen == name) {
                    return Err(SpecError::DuplicateCommand { recipient, name: *name });
                }
            }
        }
        Ok(())
    }
}

/// A node type that accepts commands.
pub trait Commandable: Send + Sync + Sized + 'static {
    const KIND: RecipientType;

    fn commands() -> &'static CommandTable<Self>;

    fn core(&self) -> &NodeCore;
}

/// Liveness probe answered on the caller's thread.
pub fn acknowledge<N: Commandable>(
    node: &Arc<N>,
    _bench: &Bench,
    _data: Value,
) -> Result<CommandResponse, EngineError> {
    Ok(CommandResponse::ok(Value::Bool(true))
        .with_message(format!("{} {} acknowledged", N::KIND, node.core().address())))
}

pub fn status<N: Commandable>(
    node: &Arc<N>,
    _bench: &Bench,
    _data: Value,
) -> Result<CommandResponse, EngineError> {
    Ok(CommandResponse::ok(node.core().status_json()))
}

/// Liveness probe answered with an event from a worker.
pub fn acknowledge_async<N: Commandable>(
    node: &Arc<N>,
    _bench: &Bench,
    _data: Value,
) -> Result<CommandResponse, EngineError> {
    let core = node.core();
    core.fire(
        core.event(EventKind::UpdateStatus)
            .with("message", format!("{} acknowledged", N::KIND)),
    );
    Ok(CommandResponse::ok(Value::Bool(true)))
}

/// Reject duplicate command names before any bench is built.
pub fn validate_command_tables() -> Result<(), SpecError> {
    Platform::commands().check_unique(RecipientType::Platform.as_str())?;
    Slot::commands().check_unique(RecipientType::Slot.as_str())?;
    Uut::commands().check_unique(RecipientType::Uut.as_str())?;
    Test::commands().check_unique(RecipientType::Test.as_str())?;
    Action::commands().check_unique(RecipientType::Action.as_str())?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("recipient not found: {0}")]
    RecipientNotFound(Address),

    #[error("recipient at {address} is a {actual}, not a {requested}")]
    RecipientTypeMismatch {
        address: Address,
        requested: RecipientType,
        actual: RecipientType,
    },

    #[error("{recipient} has no {mode} command '{name}'")]
    UnknownCommand {
        recipient: RecipientType,
        name: String,
        mode: &'static str,
    },

    #[error("unsupported command form")]
    UnsupportedForm,

    #[error("failed to spawn command worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Routes commands into one bench.
#[derive(Clone)]
pub struct CommandRouter {
    bench: Arc<Bench>,
}

impl CommandRouter {
    pub fn new(bench: Arc<Bench>) -> Self {
        Self { bench }
    }

    pub fn bench(&self) -> &Arc<Bench> {
        &self.bench
    }

    /// Resolve and run one command. Never fails: routing and handler errors
    /// become a failure response plus an `Error` event.
    pub fn dispatch(&self, command: Command) -> CommandResponse {
        match self.route(&command) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    command = %command.name,
                    address = %command.address,
                    error = %e,
                    "Command rejected"
                );
                self.bench.events().fire(
                    Event::new(EventKind::Error)
                        .at(&command.address)
                        .with("command", command.name.as_str())
                        .with("error", e.to_string())
                        .with("traceback", error_chain(&e)),
                );
                CommandResponse::failure(e.to_string())
            }
        }
    }

    /// Answer a payload that is neither a control value nor a command.
    pub fn reject(&self, payload: &Value) -> CommandResponse {
        let e = DispatchError::UnsupportedForm;
        tracing::warn!(payload = %payload, "Unsupported request");
        self.bench.events().fire(
            Event::new(EventKind::Error)
                .with("error", e.to_string())
                .with("payload", payload.clone()),
        );
        CommandResponse::failure(e.to_string())
    }

    fn route(&self, command: &Command) -> Result<CommandResponse, DispatchError> {
        if command.address.depth() != command.recipient_type.address_depth() {
            return Err(DispatchError::RecipientNotFound(command.address.clone()));
        }
        let recipient = self
            .bench
            .registry()
            .get(&command.address)
            .ok_or_else(|| DispatchError::RecipientNotFound(command.address.clone()))?;
        if recipient.kind() != command.recipient_type {
            return Err(DispatchError::RecipientTypeMismatch {
                address: command.address.clone(),
                requested: command.recipient_type,
                actual: recipient.kind(),
            });
        }

        match recipient {
            Recipient::Platform(node) => self.run(node, command),
            Recipient::Slot(node) => self.run(node, command),
            Recipient::Uut(node) => self.run(node, command),
            Recipient::Test(node) => self.run(node, command),
            Recipient::Action(node) => self.run(node, command),
        }
    }

    fn run<N: Commandable>(&self, node: Arc<N>, command: &Command) -> Result<CommandResponse, DispatchError> {
        let handler = N::commands()
            .find(&command.name, command.synchronous)
            .ok_or_else(|| DispatchError::UnknownCommand {
                recipient: N::KIND,
                name: command.name.clone(),
                mode: if command.synchronous { "synchronous" } else { "asynchronous" },
            })?;

        if command.synchronous {
            tracing::debug!(command = %command.name, address = %command.address, "Running synchronous command");
            let _guard = node.core().lock().acquire();
            return Ok(match handler(&node, &self.bench, command.data.clone()) {
                Ok(response) => response,
                Err(e) => {
                    tracing::info!(command = %command.name, address = %command.address, error = %e, "Command failed");
                    CommandResponse::failure(e.to_string())
                }
            });
        }

        let bench = Arc::clone(&self.bench);
        let name = command.name.clone();
        let data = command.data.clone();
        std::thread::Builder::new()
            .name(format!("hilrig-{}-{}", N::KIND, command.name))
            .spawn(move || run_detached(node, bench, handler, &name, data))?;
        tracing::debug!(command = %command.name, address = %command.address, "Dispatched asynchronous command");
        Ok(CommandResponse::dispatched())
    }
}

/// Worker body for an asynchronous command. Errors and panics are reported
/// on the bus; the worker never takes the process down.
fn run_detached<N: Commandable>(node: Arc<N>, bench: Arc<Bench>, handler: Handler<N>, name: &str, data: Value) {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let _guard = node.core().lock().acquire();
        handler(&node, &bench, data)
    }));

    let core = node.core();
    let (error, traceback) = match outcome {
        Ok(Ok(response)) => {
            tracing::debug!(command = name, address = %core.address(), result = %response.result, "Asynchronous command finished");
            return;
        }
        Ok(Err(e)) => (e.to_string(), error_chain(&e)),
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            (format!("command panicked: {msg}"), msg)
        }
    };

    tracing::error!(command = name, address = %core.address(), error = %error, "Asynchronous command failed");
    core.fire(
        core.event(EventKind::Error)
            .with("command", name)
            .with("error", error)
            .with("traceback", traceback),
    );
}
