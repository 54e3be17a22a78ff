//! Subprocess runner.

use std::process::Command;
use std::sync::Arc;

use serde_json::{Map, Value};

use super::{arg, unknown_method};
use crate::engine::{ActionReturn, Device, DeviceClass, DeviceError};

const CLASS: &str = "shell";

pub(super) fn class() -> DeviceClass {
    DeviceClass::new(CLASS, &["run"], |args| {
        Ok(Arc::new(ShellCommand::from_args(args)) as Arc<dyn Device>)
    })
}

/// Runs `program` with `args`, returning its exit code and trimmed stdout.
///
/// A `value` kwarg is appended as the final argument. The constructor may
/// pin a `program` and a working directory (`cwd`).
#[derive(Debug, Default)]
pub struct ShellCommand {
    program: Option<String>,
    cwd: Option<String>,
}

impl ShellCommand {
    fn from_args(args: &Map<String, Value>) -> Self {
        let text = |key: &str| args.get(key).and_then(Value::as_str).map(str::to_string);
        Self {
            program: text("program"),
            cwd: text("cwd"),
        }
    }

    fn run(&self, kwargs: &Map<String, Value>) -> Result<ActionReturn, DeviceError> {
        let program = match (kwargs.get("program"), &self.program) {
            (Some(_), _) => text_arg(arg(kwargs, "run", "program")?)?,
            (None, Some(program)) => program.clone(),
            (None, None) => {
                return Err(DeviceError::InvalidArgument {
                    method: "run".to_string(),
                    reason: "missing 'program'".to_string(),
                });
            }
        };

        let mut command = Command::new(&program);
        if let Some(args) = kwargs.get("args") {
            let Value::Array(args) = args else {
                return Err(DeviceError::InvalidArgument {
                    method: "run".to_string(),
                    reason: "'args' must be a list".to_string(),
                });
            };
            for a in args {
                command.arg(text_arg(a)?);
            }
        }
        if let Some(value) = kwargs.get("value") {
            command.arg(text_arg(value)?);
        }
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        tracing::debug!(program = %program, "Running subprocess");
        let output = command.output()?;
        // killed by a signal
        let code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if code != 0 {
            tracing::debug!(
                program = %program,
                code,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "Subprocess exited nonzero"
            );
        }
        Ok(ActionReturn::new(code, stdout))
    }
}

fn text_arg(value: &Value) -> Result<String, DeviceError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(DeviceError::InvalidArgument {
            method: "run".to_string(),
            reason: format!("cannot pass {other} as an argument"),
        }),
    }
}

impl Device for ShellCommand {
    fn invoke(&self, method: &str, kwargs: &Map<String, Value>) -> Result<Option<ActionReturn>, DeviceError> {
        match method {
            "run" => self.run(kwargs).map(Some),
            _ => Err(unknown_method(CLASS, method)),
        }
    }
}
