use thiserror::Error;

use crate::bridge::protocol::Address;
use crate::engine::device::DeviceError;

/// A bench layout or test suite that cannot be loaded.
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("action '{action}' uses unknown device class '{class}'")]
    UnknownDeviceClass { action: String, class: String },

    #[error("action '{action}' calls '{method}', which device class '{class}' does not provide")]
    UnknownMethod {
        action: String,
        class: String,
        method: String,
    },

    #[error(
        "test '{test}': action '{action}' has {found} values but the test runs {expected} iterations"
    )]
    ValueListMismatch {
        test: String,
        action: String,
        expected: usize,
        found: usize,
    },

    #[error("test '{test}' needs at least one {role}")]
    MissingRole { test: String, role: &'static str },

    #[error("test '{test}': {reason}")]
    InvalidTest { test: String, reason: String },

    #[error("address {0} is already in use")]
    DuplicateAddress(Address),

    #[error("{recipient} command table lists '{name}' twice")]
    DuplicateCommand {
        recipient: &'static str,
        name: &'static str,
    },

    #[error("invalid bench layout: {0}")]
    InvalidLayout(String),
}

/// Failure while executing work on the bench.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error("device error in '{target}': {source}")]
    Device {
        target: String,
        #[source]
        source: DeviceError,
    },

    #[error("invalid command data: {0}")]
    InvalidData(#[from] serde_json::Error),

    #[error("unusable reading from '{action}': {reason}")]
    Reading { action: String, reason: String },

    #[error("{0}")]
    Busy(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Unsupported(String),
}

impl EngineError {
    pub fn device(target: impl Into<String>, source: DeviceError) -> Self {
        EngineError::Device {
            target: target.into(),
            source,
        }
    }
}

/// Render an error and its sources, outermost first.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str("\ncaused by: ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
