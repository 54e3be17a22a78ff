//! Device seam: what actions call into.
//!
//! The engine knows devices only by this shape: built from a keyword map that
//! contains `instance_name`, exposing named methods that take one keyword map
//! and return nothing or an `(exit_status, output)` pair.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::error::SpecError;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("unknown device class '{0}'")]
    UnknownClass(String),

    #[error("device '{class}' has no method '{method}'")]
    UnknownMethod { class: String, method: String },

    #[error("invalid argument to {method}: {reason}")]
    InvalidArgument { method: String, reason: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Failed(String),
}

/// Result of one device method call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionReturn {
    pub exit_status: Value,
    pub output: Value,
}

impl ActionReturn {
    pub fn new(exit_status: impl Into<Value>, output: impl Into<Value>) -> Self {
        Self {
            exit_status: exit_status.into(),
            output: output.into(),
        }
    }

    /// Exit status `0` and the string `"0"` count as success; anything else fails.
    pub fn succeeded(&self) -> bool {
        match &self.exit_status {
            Value::Number(n) => n.as_i64() == Some(0) || n.as_u64() == Some(0),
            Value::String(s) => s == "0",
            _ => false,
        }
    }
}

pub trait Device: Send + Sync {
    fn invoke(
        &self,
        method: &str,
        kwargs: &Map<String, Value>,
    ) -> Result<Option<ActionReturn>, DeviceError>;
}

type Constructor =
    Arc<dyn Fn(&Map<String, Value>) -> Result<Arc<dyn Device>, DeviceError> + Send + Sync>;

/// A constructible device type and the methods it answers to.
#[derive(Clone)]
pub struct DeviceClass {
    name: String,
    methods: Vec<String>,
    construct: Constructor,
}

impl fmt::Debug for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceClass")
            .field("name", &self.name)
            .field("methods", &self.methods)
            .finish_non_exhaustive()
    }
}

impl DeviceClass {
    pub fn new<F>(name: impl Into<String>, methods: &[&str], construct: F) -> Self
    where
        F: Fn(&Map<String, Value>) -> Result<Arc<dyn Device>, DeviceError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            methods: methods.iter().map(|m| m.to_string()).collect(),
            construct: Arc::new(construct),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == method)
    }
}

/// Device classes available to suites, by name.
#[derive(Debug, Clone, Default)]
pub struct DeviceCatalog {
    classes: HashMap<String, DeviceClass>,
}

impl DeviceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog holding the reference devices from [`crate::devices`].
    pub fn with_builtins() -> Self {
        crate::devices::register_builtins(Self::new())
    }

    pub fn with_class(mut self, class: DeviceClass) -> Self {
        self.register(class);
        self
    }

    pub fn register(&mut self, class: DeviceClass) {
        if let Some(previous) = self.classes.insert(class.name.clone(), class) {
            tracing::debug!(class = %previous.name, "Replaced device class");
        }
    }

    pub fn get(&self, class: &str) -> Option<&DeviceClass> {
        self.classes.get(class)
    }

    pub fn class_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.classes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Load-time check that an action's class and method exist.
    pub fn check(&self, action: &str, class: &str, method: &str) -> Result<(), SpecError> {
        let Some(entry) = self.classes.get(class) else {
            return Err(SpecError::UnknownDeviceClass {
                action: action.to_string(),
                class: class.to_string(),
            });
        };
        if !entry.has_method(method) {
            return Err(SpecError::UnknownMethod {
                action: action.to_string(),
                class: class.to_string(),
                method: method.to_string(),
            });
        }
        Ok(())
    }

    pub fn construct(
        &self,
        class: &str,
        args: &Map<String, Value>,
    ) -> Result<Arc<dyn Device>, DeviceError> {
        let entry = self
            .classes
            .get(class)
            .ok_or_else(|| DeviceError::UnknownClass(class.to_string()))?;
        (entry.construct)(args)
    }
}

/// Lazily built device singletons, keyed by instance name.
#[derive(Default)]
pub struct InstanceCache {
    instances: DashMap<String, Arc<dyn Device>>,
}

impl fmt::Debug for InstanceCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceCache")
            .field("len", &self.instances.len())
            .finish()
    }
}

impl InstanceCache {
    /// Cached instance for `key`, or a new one built with `instance_name = key`.
    pub fn get_or_create(
        &self,
        key: &str,
        class: &str,
        constructor_args: &Map<String, Value>,
        catalog: &DeviceCatalog,
    ) -> Result<Arc<dyn Device>, DeviceError> {
        if let Some(existing) = self.instances.get(key) {
            return Ok(Arc::clone(existing.value()));
        }

        let mut args = constructor_args.clone();
        args.insert("instance_name".to_string(), Value::String(key.to_string()));
        let device = catalog.construct(class, &args)?;
        tracing::debug!(instance = key, class, "Constructed device instance");

        // Another worker may have raced us here; first insert wins.
        let entry = self
            .instances
            .entry(key.to_string())
            .or_insert(device);
        Ok(Arc::clone(entry.value()))
    }

    pub fn evict(&self, key: &str) -> bool {
        self.instances.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.instances.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn clear(&self) {
        self.instances.clear();
    }
}
