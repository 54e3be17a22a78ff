//! Wire protocol types for bench connections.
//!
//! Client → server: `"TERMINATE"`, `"DISCONNECT"`, or a command array
//! `[name, recipient_type, address, data, synchronous]`.
//!
//! Server → client: `{"RESPONSE": [result, message]}` or `{"EVENT": {...}}`.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::Event;

/// One component of an [`Address`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AddressPart {
    Index(u64),
    Name(String),
}

impl fmt::Display for AddressPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressPart::Index(i) => write!(f, "{i}"),
            AddressPart::Name(n) => f.write_str(n),
        }
    }
}

impl From<u64> for AddressPart {
    fn from(i: u64) -> Self {
        AddressPart::Index(i)
    }
}

impl From<usize> for AddressPart {
    fn from(i: usize) -> Self {
        AddressPart::Index(i as u64)
    }
}

impl From<&str> for AddressPart {
    fn from(s: &str) -> Self {
        AddressPart::Name(s.to_string())
    }
}

impl From<String> for AddressPart {
    fn from(s: String) -> Self {
        AddressPart::Name(s)
    }
}

/// Hierarchical path to one recipient: `[platform, slot, serial, test, action]`.
///
/// Depth identifies the level: a two-part address is always a slot, a
/// three-part address is always a UUT, and so on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(Vec<AddressPart>);

impl Address {
    pub fn platform(name: impl Into<String>) -> Self {
        Self(vec![AddressPart::Name(name.into())])
    }

    pub fn child(&self, part: impl Into<AddressPart>) -> Self {
        let mut parts = self.0.clone();
        parts.push(part.into());
        Self(parts)
    }

    pub fn slot(self, index: usize) -> Self {
        self.child(index)
    }

    pub fn uut(self, serial: impl Into<String>) -> Self {
        self.child(AddressPart::Name(serial.into()))
    }

    pub fn test(self, index: usize) -> Self {
        self.child(index)
    }

    pub fn action(self, index: usize) -> Self {
        self.child(index)
    }

    pub fn parent(&self) -> Option<Self> {
        if self.0.len() <= 1 {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn parts(&self) -> &[AddressPart] {
        &self.0
    }

    /// True if `self` is `other` or nested anywhere below it.
    pub fn starts_with(&self, other: &Address) -> bool {
        self.0.starts_with(&other.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{part}")?;
        }
        Ok(())
    }
}

/// Kind of object a command is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecipientType {
    Platform,
    Slot,
    Uut,
    Test,
    Action,
}

impl RecipientType {
    /// Number of address parts that identify a recipient of this type.
    pub fn address_depth(self) -> usize {
        match self {
            RecipientType::Platform => 1,
            RecipientType::Slot => 2,
            RecipientType::Uut => 3,
            RecipientType::Test => 4,
            RecipientType::Action => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecipientType::Platform => "platform",
            RecipientType::Slot => "slot",
            RecipientType::Uut => "uut",
            RecipientType::Test => "test",
            RecipientType::Action => "action",
        }
    }
}

impl fmt::Display for RecipientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type CommandTuple = (String, RecipientType, Address, Value, bool);

/// A named operation for one recipient.
///
/// Serialized as the five-element array `[name, recipient_type, address, data, synchronous]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "CommandTuple", into = "CommandTuple")]
pub struct Command {
    pub name: String,
    pub recipient_type: RecipientType,
    pub address: Address,
    pub data: Value,
    pub synchronous: bool,
}

impl Command {
    /// Synchronous command with no data.
    pub fn new(name: impl Into<String>, recipient_type: RecipientType, address: Address) -> Self {
        Self {
            name: name.into(),
            recipient_type,
            address,
            data: Value::Null,
            synchronous: true,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Dispatch on a worker; the reply is only an acknowledgement.
    pub fn asynchronous(mut self) -> Self {
        self.synchronous = false;
        self
    }
}

impl From<CommandTuple> for Command {
    fn from((name, recipient_type, address, data, synchronous): CommandTuple) -> Self {
        Self {
            name,
            recipient_type,
            address,
            data,
            synchronous,
        }
    }
}

impl From<Command> for CommandTuple {
    fn from(cmd: Command) -> Self {
        (
            cmd.name,
            cmd.recipient_type,
            cmd.address,
            cmd.data,
            cmd.synchronous,
        )
    }
}

/// Connection-level control values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlSignal {
    /// Stop the whole server after draining every client.
    Terminate,
    /// Drop only this connection.
    Disconnect,
}

/// Anything a client may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientRequest {
    Control(ControlSignal),
    Command(Command),
    /// Any other payload shape, the legacy three-element command included.
    Unsupported(Value),
}

/// `(result, message)` pair answering one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "(Value, String)", into = "(Value, String)")]
pub struct CommandResponse {
    pub result: Value,
    pub message: String,
}

impl CommandResponse {
    pub fn ok(result: Value) -> Self {
        Self {
            result,
            message: String::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            result: Value::Bool(false),
            message: message.into(),
        }
    }

    /// Reply to an asynchronous command accepted for dispatch.
    pub fn dispatched() -> Self {
        Self {
            result: Value::Null,
            message: "dispatched".to_string(),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.result == Value::Bool(false)
    }
}

impl From<(Value, String)> for CommandResponse {
    fn from((result, message): (Value, String)) -> Self {
        Self { result, message }
    }
}

impl From<CommandResponse> for (Value, String) {
    fn from(resp: CommandResponse) -> Self {
        (resp.result, resp.message)
    }
}

/// Anything the server may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    Response(CommandResponse),
    Event(Arc<Event>),
}
