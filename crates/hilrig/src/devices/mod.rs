//! Reference device classes.
//!
//! These stand in for real instruments: a subprocess runner and two loopback
//! simulations. Bench deployments register their own classes next to them.

mod analog;
mod relay;
mod shell;

use serde_json::{Map, Value};

use crate::engine::{DeviceCatalog, DeviceError};

pub use analog::AnalogLoopback;
pub use relay::{DigitalInputs, DigitalOutputs, LineBank, RelayModule};
pub use shell::ShellCommand;

/// Add every reference class to `catalog`.
pub fn register_builtins(catalog: DeviceCatalog) -> DeviceCatalog {
    catalog
        .with_class(shell::class())
        .with_class(relay::class())
        .with_class(analog::class())
}

pub(crate) fn arg<'a>(kwargs: &'a Map<String, Value>, method: &str, key: &str) -> Result<&'a Value, DeviceError> {
    kwargs.get(key).ok_or_else(|| DeviceError::InvalidArgument {
        method: method.to_string(),
        reason: format!("missing '{key}'"),
    })
}

pub(crate) fn f64_arg(kwargs: &Map<String, Value>, method: &str, key: &str) -> Result<f64, DeviceError> {
    let value = arg(kwargs, method, key)?;
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| DeviceError::InvalidArgument {
        method: method.to_string(),
        reason: format!("'{key}' must be a number, got {value}"),
    })
}

pub(crate) fn index_arg(kwargs: &Map<String, Value>, method: &str, key: &str) -> Result<usize, DeviceError> {
    let value = arg(kwargs, method, key)?;
    value
        .as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| DeviceError::InvalidArgument {
            method: method.to_string(),
            reason: format!("'{key}' must be a non-negative integer, got {value}"),
        })
}

pub(crate) fn unknown_method(class: &str, method: &str) -> DeviceError {
    DeviceError::UnknownMethod {
        class: class.to_string(),
        method: method.to_string(),
    }
}
