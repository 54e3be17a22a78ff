//! Declarative bench layouts and test suites.
//!
//! Suites arrive as JSON (in an `insert_uut` command or a file) and are
//! checked against the [`DeviceCatalog`] before any node is built, so an
//! unknown class, unknown method or ragged value list fails at load.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::device::DeviceCatalog;
use super::error::SpecError;

fn default_true() -> bool {
    true
}

fn default_max_retry() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    100
}

fn default_value_key() -> String {
    "value".to_string()
}

fn default_pass_label() -> String {
    "Pass".to_string()
}

fn default_fail_label() -> String {
    "Fail".to_string()
}

fn default_power_method() -> String {
    "set_output".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformLayout {
    #[serde(default)]
    pub slots: Vec<SlotLayout>,
}

impl PlatformLayout {
    pub fn with_slots(count: usize) -> Self {
        Self {
            slots: vec![SlotLayout::default(); count],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlotLayout {
    #[serde(default)]
    pub label: Option<String>,
    /// Relay channel that switches this slot's supply.
    #[serde(default)]
    pub power: Option<PowerSwitch>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerSwitch {
    pub class: String,
    /// Instance cache key; slots sharing a module name share one instance.
    pub instance: String,
    pub channel: u32,
    #[serde(default = "default_power_method")]
    pub method: String,
    #[serde(default)]
    pub constructor_args: Map<String, Value>,
}

/// Data for a slot's `insert_uut` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertUut {
    pub serial: String,
    #[serde(default)]
    pub suite: Vec<TestSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSpec {
    pub name: String,
    #[serde(default)]
    pub shortdesc: String,
    #[serde(default)]
    pub refdes: String,
    #[serde(default = "default_true")]
    pub valid: bool,
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(flatten)]
    pub kind: TestKindSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TestKindSpec {
    Single {
        #[serde(default)]
        actions: Vec<ActionSpec>,
    },
    Expect {
        #[serde(default)]
        statechangers: Vec<ActionSpec>,
        #[serde(default)]
        statecheckers: Vec<ActionSpec>,
        /// Half-width of the accepted window around each expected value.
        #[serde(default)]
        tolerance: f64,
        /// Settle time in seconds between changers and checkers.
        #[serde(default)]
        timeout: Option<f64>,
    },
    Interact {
        prompt: String,
        #[serde(default = "default_pass_label")]
        pass_label: String,
        #[serde(default = "default_fail_label")]
        fail_label: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub name: String,
    pub class: String,
    pub method: String,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub constructor_args: Map<String, Value>,
    /// Nonzero exit status does not mark the action failed.
    #[serde(default)]
    pub allow_fail: bool,
    /// Key under which a per-call value is added to `kwargs`.
    #[serde(default = "default_value_key")]
    pub value_key: String,
    /// Per-iteration values (expect tests only). For checkers these are the expected readings.
    #[serde(default)]
    pub values: Vec<Value>,
}

impl TestSpec {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn actions(&self) -> Vec<&ActionSpec> {
        match &self.kind {
            TestKindSpec::Single { actions } => actions.iter().collect(),
            TestKindSpec::Expect {
                statechangers,
                statecheckers,
                ..
            } => statechangers.iter().chain(statecheckers).collect(),
            TestKindSpec::Interact { .. } => Vec::new(),
        }
    }

    /// Check the test against the catalog and its own internal consistency.
    pub fn validate(&self, catalog: &DeviceCatalog) -> Result<(), SpecError> {
        for action in self.actions() {
            catalog.check(&action.name, &action.class, &action.method)?;
        }

        if let TestKindSpec::Expect {
            statechangers,
            statecheckers,
            tolerance,
            timeout,
        } = &self.kind
        {
            let Some(first) = statecheckers.first() else {
                return Err(SpecError::MissingRole {
                    test: self.name.clone(),
                    role: "statechecker",
                });
            };
            let iterations = first.values.len();
            for action in statecheckers.iter().chain(statechangers) {
                if action.values.len() != iterations {
                    return Err(SpecError::ValueListMismatch {
                        test: self.name.clone(),
                        action: action.name.clone(),
                        expected: iterations,
                        found: action.values.len(),
                    });
                }
            }
            if !tolerance.is_finite() || *tolerance < 0.0 {
                return Err(SpecError::InvalidTest {
                    test: self.name.clone(),
                    reason: format!("tolerance must be a non-negative number, got {tolerance}"),
                });
            }
            if let Some(t) = timeout
                && (!t.is_finite() || *t < 0.0)
            {
                return Err(SpecError::InvalidTest {
                    test: self.name.clone(),
                    reason: format!("timeout must be a non-negative number of seconds, got {t}"),
                });
            }
        }
        Ok(())
    }
}
