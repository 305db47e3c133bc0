//! Transcript sources.
//!
//! A transcript is the ordered list of chat messages that every extraction
//! pass reads. Sources hand out immutable snapshots; a [`ChangeSignature`]
//! lets the poll path decide cheaply whether anything moved.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[serde(rename = "self", alias = "user")]
    Me,
    #[default]
    #[serde(alias = "assistant")]
    Other,
}

impl Role {
    fn tag(self) -> u8 {
        match self {
            Role::Me => b's',
            Role::Other => b'o',
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub index: usize,
    pub text: String,
    pub role: Role,
}

impl Message {
    pub fn new(index: usize, role: Role, text: impl Into<String>) -> Self {
        Self {
            index,
            text: text.into(),
            role,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeSignature {
    pub hash: String,
    pub message_count: usize,
}

/// An immutable, cheaply clonable view of the transcript.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    messages: Arc<Vec<Message>>,
}

impl Transcript {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages: Arc::new(messages),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn signature(&self) -> ChangeSignature {
        let mut hasher = Sha256::new();
        for message in self.messages.iter() {
            hasher.update((message.index as u64).to_le_bytes());
            hasher.update([message.role.tag()]);
            hasher.update(message.text.as_bytes());
            hasher.update([0u8]);
        }
        ChangeSignature {
            hash: hex::encode(hasher.finalize()),
            message_count: self.messages.len(),
        }
    }
}

/// Read-only accessor over the host's transcript.
///
/// `snapshot` may block (file IO); the engine calls it off the async
/// executor.
pub trait TranscriptSource: Send + Sync {
    fn snapshot(&self) -> Result<Transcript>;

    fn signature(&self) -> Result<ChangeSignature> {
        Ok(self.snapshot()?.signature())
    }

    /// Human-readable origin used in logs.
    fn describe(&self) -> String;
}

/// In-memory transcript fed directly by a host.
#[derive(Debug, Clone)]
pub struct MemoryTranscript {
    inner: Arc<RwLock<MemoryInner>>,
}

#[derive(Debug)]
struct MemoryInner {
    ready: bool,
    messages: Vec<Message>,
}

impl Default for MemoryTranscript {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTranscript {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(MemoryInner {
                ready: true,
                messages: Vec::new(),
            })),
        }
    }

    /// A source whose host accessor has not attached yet.
    pub fn unavailable() -> Self {
        let source = Self::new();
        source.set_ready(false);
        source
    }

    pub fn set_ready(&self, ready: bool) {
        self.write().ready = ready;
    }

    /// Append a message and return its index.
    pub fn push(&self, role: Role, text: impl Into<String>) -> usize {
        let mut inner = self.write();
        let index = inner.messages.last().map(|m| m.index + 1).unwrap_or(0);
        inner.messages.push(Message::new(index, role, text));
        index
    }

    /// Re-render messages from `messages[0].index` onward, as a host does
    /// after a partial redraw.
    pub fn replay(&self, messages: Vec<Message>) {
        let Some(first) = messages.first().map(|m| m.index) else {
            return;
        };
        let mut inner = self.write();
        inner.messages.retain(|m| m.index < first);
        inner.messages.extend(messages);
    }

    fn read(&self) -> RwLockReadGuard<'_, MemoryInner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryInner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl TranscriptSource for MemoryTranscript {
    fn snapshot(&self) -> Result<Transcript> {
        let inner = self.read();
        if !inner.ready {
            return Err(Error::SourceUnavailable(
                "host transcript accessor not ready".to_string(),
            ));
        }
        Ok(Transcript::new(inner.messages.clone()))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Transcript stored as JSONL, one message per line.
#[derive(Debug, Clone)]
pub struct JsonlTranscript {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct TranscriptLine {
    text: String,
    #[serde(default)]
    role: Role,
    #[serde(default)]
    index: Option<usize>,
}

impl JsonlTranscript {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TranscriptSource for JsonlTranscript {
    fn snapshot(&self) -> Result<Transcript> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::SourceUnavailable(format!(
                    "{} does not exist",
                    self.path.display()
                )));
            }
            Err(err) => return Err(Error::Io(err)),
        };
        parse_jsonl(&content)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Parse JSONL transcript content.
///
/// A line without `index` takes its ordinal among message lines. When an
/// index repeats (a re-render), the later line replaces the earlier one.
pub fn parse_jsonl(content: &str) -> Result<Transcript> {
    let mut by_index = BTreeMap::new();
    let mut ordinal = 0usize;
    for (line_no, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let parsed: TranscriptLine =
            serde_json::from_str(trimmed).map_err(|err| Error::MalformedTranscript {
                line: line_no + 1,
                reason: err.to_string(),
            })?;
        let index = parsed.index.unwrap_or(ordinal);
        ordinal += 1;
        by_index.insert(index, Message::new(index, parsed.role, parsed.text));
    }
    Ok(Transcript::new(by_index.into_values().collect()))
}
