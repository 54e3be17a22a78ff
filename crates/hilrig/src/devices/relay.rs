//! Relay module simulation: digital outputs wired back to digital inputs.

use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

use super::{arg, index_arg, unknown_method};
use crate::engine::{ActionReturn, Device, DeviceClass, DeviceError};

const CLASS: &str = "relay_module";
const DEFAULT_CHANNELS: usize = 8;

pub(super) fn class() -> DeviceClass {
    DeviceClass::new(
        CLASS,
        &["set_output", "get_output", "read_input", "reset"],
        |args| Ok(Arc::new(RelayModule::from_args(args)?) as Arc<dyn Device>),
    )
}

/// Shared line states. Outputs drive them; inputs sample them.
#[derive(Debug, Clone)]
pub struct LineBank {
    lines: Arc<Mutex<Vec<bool>>>,
}

impl LineBank {
    pub fn new(channels: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(vec![false; channels])),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<bool>> {
        match self.lines.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn get(&self, method: &str, channel: usize) -> Result<bool, DeviceError> {
        let lines = self.lock();
        lines
            .get(channel)
            .copied()
            .ok_or_else(|| out_of_range(method, channel, lines.len()))
    }

    fn set(&self, method: &str, channel: usize, on: bool) -> Result<(), DeviceError> {
        let mut lines = self.lock();
        let count = lines.len();
        let line = lines
            .get_mut(channel)
            .ok_or_else(|| out_of_range(method, channel, count))?;
        *line = on;
        Ok(())
    }
}

fn out_of_range(method: &str, channel: usize, count: usize) -> DeviceError {
    DeviceError::InvalidArgument {
        method: method.to_string(),
        reason: format!("channel {channel} out of range (0..{count})"),
    }
}

#[derive(Debug, Clone)]
pub struct DigitalOutputs {
    bank: LineBank,
}

impl DigitalOutputs {
    pub fn new(bank: LineBank) -> Self {
        Self { bank }
    }

    pub fn set(&self, channel: usize, on: bool) -> Result<(), DeviceError> {
        self.bank.set("set_output", channel, on)
    }

    pub fn get(&self, channel: usize) -> Result<bool, DeviceError> {
        self.bank.get("get_output", channel)
    }

    pub fn reset(&self) {
        self.bank.lock().iter_mut().for_each(|line| *line = false);
    }
}

#[derive(Debug, Clone)]
pub struct DigitalInputs {
    bank: LineBank,
}

impl DigitalInputs {
    pub fn new(bank: LineBank) -> Self {
        Self { bank }
    }

    pub fn read(&self, channel: usize) -> Result<bool, DeviceError> {
        self.bank.get("read_input", channel)
    }
}

/// Outputs and inputs on one line bank, so every input reads back the
/// output with the same channel number.
#[derive(Debug)]
pub struct RelayModule {
    name: String,
    outputs: DigitalOutputs,
    inputs: DigitalInputs,
}

impl RelayModule {
    pub fn new(name: impl Into<String>, channels: usize) -> Self {
        let bank = LineBank::new(channels);
        Self {
            name: name.into(),
            outputs: DigitalOutputs::new(bank.clone()),
            inputs: DigitalInputs::new(bank),
        }
    }

    fn from_args(args: &Map<String, Value>) -> Result<Self, DeviceError> {
        let channels = match args.get("channels") {
            None => DEFAULT_CHANNELS,
            Some(_) => index_arg(args, "new", "channels")?,
        };
        let name = args
            .get("instance_name")
            .and_then(Value::as_str)
            .unwrap_or(CLASS);
        Ok(Self::new(name, channels))
    }
}

/// Accepts booleans, numbers (nonzero is on) and the usual on/off words.
fn level(method: &str, value: &Value) -> Result<bool, DeviceError> {
    let on = match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|v| v != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "on" | "true" | "high" => Some(true),
            "0" | "off" | "false" | "low" => Some(false),
            _ => None,
        },
        _ => None,
    };
    on.ok_or_else(|| DeviceError::InvalidArgument {
        method: method.to_string(),
        reason: format!("not a logic level: {value}"),
    })
}

impl Device for RelayModule {
    fn invoke(&self, method: &str, kwargs: &Map<String, Value>) -> Result<Option<ActionReturn>, DeviceError> {
        match method {
            "set_output" => {
                let channel = index_arg(kwargs, method, "channel")?;
                let on = level(method, arg(kwargs, method, "value")?)?;
                self.outputs.set(channel, on)?;
                tracing::trace!(relay = %self.name, channel, on, "Output set");
                Ok(None)
            }
            "get_output" => {
                let channel = index_arg(kwargs, method, "channel")?;
                Ok(Some(ActionReturn::new(0, self.outputs.get(channel)?)))
            }
            "read_input" => {
                let channel = index_arg(kwargs, method, "channel")?;
                Ok(Some(ActionReturn::new(0, self.inputs.read(channel)?)))
            }
            "reset" => {
                self.outputs.reset();
                Ok(None)
            }
            _ => Err(unknown_method(CLASS, method)),
        }
    }
}
