//! Analog loopback: DAC writes visible to ADC reads on the same wire.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Map, Value};

use super::{f64_arg, unknown_method};
use crate::engine::{ActionReturn, Device, DeviceClass, DeviceError};

const CLASS: &str = "analog_loopback";

/// Each catalog gets its own set of wires, keyed by the writing instance.
pub(super) fn class() -> DeviceClass {
    let wires: Arc<DashMap<String, f64>> = Arc::new(DashMap::new());
    DeviceClass::new(CLASS, &["write", "read"], move |args| {
        Ok(Arc::new(AnalogLoopback::from_args(Arc::clone(&wires), args)?) as Arc<dyn Device>)
    })
}

/// Writes land on the wire named after this instance. Reads sample the
/// `source` wire (this instance's own by default) plus a fixed `offset`.
#[derive(Debug)]
pub struct AnalogLoopback {
    name: String,
    source: String,
    offset: f64,
    wires: Arc<DashMap<String, f64>>,
}

impl AnalogLoopback {
    fn from_args(wires: Arc<DashMap<String, f64>>, args: &Map<String, Value>) -> Result<Self, DeviceError> {
        let name = args
            .get("instance_name")
            .and_then(Value::as_str)
            .unwrap_or(CLASS)
            .to_string();
        let source = args
            .get("source")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| name.clone());
        let offset = match args.get("offset") {
            None => 0.0,
            Some(_) => f64_arg(args, "new", "offset")?,
        };
        Ok(Self {
            name,
            source,
            offset,
            wires,
        })
    }
}

impl Device for AnalogLoopback {
    fn invoke(&self, method: &str, kwargs: &Map<String, Value>) -> Result<Option<ActionReturn>, DeviceError> {
        match method {
            "write" => {
                let value = f64_arg(kwargs, method, "value")?;
                self.wires.insert(self.name.clone(), value);
                tracing::trace!(wire = %self.name, value, "Analog write");
                Ok(None)
            }
            "read" => {
                let level = self.wires.get(&self.source).map(|v| *v).unwrap_or(0.0);
                let reading = if self.offset == 0.0 { level } else { level + self.offset };
                Ok(Some(ActionReturn::new(0, reading)))
            }
            _ => Err(unknown_method(CLASS, method)),
        }
    }
}
