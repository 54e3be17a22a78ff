//! Result persistence seam.
//!
//! After each test or action completes, its attributes go to a [`ResultSink`].
//! Storage is the sink's business.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::status::Status;
use crate::bridge::protocol::{Address, RecipientType};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRecord {
    pub kind: RecipientType,
    pub name: String,
    pub address: Address,
    pub status: Status,
    pub flags: Vec<&'static str>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

impl ResultRecord {
    pub fn new(kind: RecipientType, name: &str, address: &Address, status: Status) -> Self {
        Self {
            kind,
            name: name.to_string(),
            address: address.clone(),
            status,
            flags: status.names(),
            timestamp: Utc::now(),
            exit_status: None,
            output: None,
            expected: None,
            actual: None,
            tolerance: None,
            attempts: None,
        }
    }

    pub fn passed(&self) -> bool {
        !self.status.intersects(Status::FAIL | Status::BROKEN)
    }
}

pub trait ResultSink: Send + Sync {
    fn record(&self, record: &ResultRecord);
}

/// Default sink: one structured log line per result.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ResultSink for TracingSink {
    fn record(&self, record: &ResultRecord) {
        tracing::info!(
            target: "hilrig::results",
            kind = %record.kind,
            name = %record.name,
            address = %record.address,
            status = %record.status,
            passed = record.passed(),
            "Result recorded"
        );
    }
}

/// Appends one JSON document per line.
pub struct JsonLinesSink<W> {
    writer: Mutex<W>,
}

impl JsonLinesSink<BufWriter<File>> {
    pub fn append_to(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        match self.writer.into_inner() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_record(&self, record: &ResultRecord) -> io::Result<()> {
        let mut writer = match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Result sink mutex poisoned - continuing");
                poisoned.into_inner()
            }
        };
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }
}

impl<W: Write + Send> ResultSink for JsonLinesSink<W> {
    fn record(&self, record: &ResultRecord) {
        if let Err(e) = self.write_record(record) {
            tracing::error!(error = %e, name = %record.name, "Failed to persist result");
        }
    }
}
