//! hilrig-server: serve one bench layout over TCP.

pub mod error;

use std::path::{Path, PathBuf};

use hilrig::config::DEFAULT_PORT;
use hilrig::{PlatformLayout, ServerConfig};
use serde::Deserialize;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::error::{CliError, Result};

pub const USAGE: &str = "\
Usage: hilrig-server [--host <addr>] [--port <port>] [--layout <file>] [--results <file>]

Options:
  --host <addr>      Listen address [env: HILRIG_HOST] [default: 127.0.0.1]
  --port <port>      Listen port [env: HILRIG_PORT] [default: 5555]
  --layout <file>    Bench layout (JSON) [default: one slot named 'bench']
  --results <file>   Append result records to this file as JSON lines";

/// Bench layout file: platform name plus its slots.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BenchFile {
    pub name: String,
    #[serde(flatten)]
    pub layout: PlatformLayout,
}

impl Default for BenchFile {
    fn default() -> Self {
        Self {
            name: "bench".to_string(),
            layout: PlatformLayout::with_slots(1),
        }
    }
}

impl BenchFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| CliError::LayoutRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| CliError::LayoutFormat {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    pub config: ServerConfig,
    pub layout: Option<PathBuf>,
    pub results: Option<PathBuf>,
}

/// Parse command-line flags. `env` supplies `HILRIG_HOST` and `HILRIG_PORT`,
/// which flags override.
pub fn parse_args(args: &[String], env: impl Fn(&str) -> Option<String>) -> Result<Options> {
    let mut host = env("HILRIG_HOST");
    let mut port = env("HILRIG_PORT");
    let mut layout = None;
    let mut results = None;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        let flag = args[i].as_str();
        let mut value = || {
            i += 1;
            args.get(i)
                .cloned()
                .ok_or_else(|| CliError::Usage(format!("{flag} requires a value")))
        };
        match flag {
            "--host" => host = Some(value()?),
            "--port" => port = Some(value()?),
            "--layout" => layout = Some(PathBuf::from(value()?)),
            "--results" => results = Some(PathBuf::from(value()?)),
            "--help" | "-h" => return Err(CliError::Help),
            other => return Err(CliError::Usage(format!("unexpected argument: {other}"))),
        }
        i += 1;
    }

    let mut config = ServerConfig::default();
    if let Some(host) = host {
        config = config.with_host(host);
    }
    let port = match port {
        Some(value) => value
            .parse()
            .map_err(|source| CliError::InvalidPort { value, source })?,
        None => DEFAULT_PORT,
    };
    Ok(Options {
        config: config.with_port(port),
        layout,
        results,
    })
}

/// Install the global subscriber. `RUST_LOG` wins; otherwise `HILRIG_LOG`
/// picks the level for this project's crates. `LOG_FORMAT=json` switches to
/// JSON lines. Everything goes to stderr.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("HILRIG_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        let filter_str = format!(
            "hilrig={level},hilrig_server={level},hilrig::wire=off",
            level = base_level
        );

        EnvFilter::new(filter_str)
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
