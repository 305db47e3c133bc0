//! Delta events for external integrations.
//!
//! Events are emitted as JSON lines to stdout or a configured file.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::engine::PassReport;
use crate::error::{Error, Result};

pub const EVENT_SCHEMA_VERSION: &str = "tally.event.v1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDestination {
    Stdout,
    File(PathBuf),
}

impl EventDestination {
    pub fn parse(raw: Option<&str>) -> Option<Self> {
        raw.and_then(|value| {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return None;
            }
            if trimmed == "-" {
                return Some(EventDestination::Stdout);
            }
            Some(EventDestination::File(PathBuf::from(trimmed)))
        })
    }

    pub fn open(&self) -> Result<EventSink> {
        match self {
            EventDestination::Stdout => Ok(EventSink::stdout()),
            EventDestination::File(path) => EventSink::file(path),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    EntityAdded,
    EntityChanged,
    PassCompleted,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub schema_version: &'static str,
    pub event: EventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Event {
    pub fn new(event: EventKind, pass_id: Option<String>) -> Self {
        Self {
            schema_version: EVENT_SCHEMA_VERSION,
            event,
            timestamp: Utc::now(),
            pass_id,
            data: None,
        }
    }

    /// Attach a serializable payload to the event.
    pub fn with_data<T: Serialize>(mut self, data: T) -> Result<Self> {
        self.data = Some(serde_json::to_value(data)?);
        Ok(self)
    }
}

#[derive(Serialize)]
struct PassSummary<'a> {
    messages: usize,
    added: usize,
    changed: usize,
    failed: &'a [String],
    consumer_failures: usize,
}

/// Events for one pass: one per added or changed entity, then a summary.
pub fn pass_events(report: &PassReport) -> Result<Vec<Event>> {
    let pass_id = Some(report.pass_id.clone());
    let mut events = Vec::with_capacity(report.added.len() + report.changed.len() + 1);
    for entity in &report.added {
        events.push(Event::new(EventKind::EntityAdded, pass_id.clone()).with_data(entity)?);
    }
    for entity in &report.changed {
        events.push(Event::new(EventKind::EntityChanged, pass_id.clone()).with_data(entity)?);
    }
    events.push(
        Event::new(EventKind::PassCompleted, pass_id).with_data(PassSummary {
            messages: report.messages,
            added: report.added.len(),
            changed: report.changed.len(),
            failed: &report.failed,
            consumer_failures: report.consumer_failures,
        })?,
    );
    Ok(events)
}

/// Event sink that writes JSONL output to a destination.
pub struct EventSink {
    writer: Box<dyn Write + Send>,
}

impl EventSink {
    pub fn stdout() -> Self {
        Self {
            writer: Box::new(std::io::stdout()),
        }
    }

    /// Emit events to a file, creating it if necessary.
    pub fn file(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            writer: Box::new(file),
        })
    }

    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self { writer }
    }

    /// Write a single event as JSONL.
    pub fn emit(&mut self, event: &Event) -> Result<()> {
        let serialized = serde_json::to_vec(event)?;
        self.writer.write_all(&serialized)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush().map_err(Error::Io)?;
        Ok(())
    }

    pub fn emit_pass(&mut self, report: &PassReport) -> Result<()> {
        for event in pass_events(report)? {
            self.emit(&event)?;
        }
        Ok(())
    }
}
