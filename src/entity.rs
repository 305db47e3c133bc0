//! Entity data model.
//!
//! Extractors emit [`Candidate`]s (one observation each); the reconciler
//! folds them into canonical [`Entity`] records.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Task,
    InventoryItem,
    Contact,
    PointsEvent,
    RedEnvelope,
    Avatar,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Task,
        EntityKind::InventoryItem,
        EntityKind::Contact,
        EntityKind::PointsEvent,
        EntityKind::RedEnvelope,
        EntityKind::Avatar,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Task => "task",
            EntityKind::InventoryItem => "inventory_item",
            EntityKind::Contact => "contact",
            EntityKind::PointsEvent => "points_event",
            EntityKind::RedEnvelope => "red_envelope",
            EntityKind::Avatar => "avatar",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "unknown entity kind '{s}' (expected task|inventory_item|contact|points_event|red_envelope|avatar)"
                ))
            })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Available,
    Accepted,
    Completed,
}

impl TaskStatus {
    pub fn rank(self) -> u8 {
        match self {
            TaskStatus::Available => 1,
            TaskStatus::Accepted => 2,
            TaskStatus::Completed => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContactStatus {
    Requested,
    Added,
}

impl ContactStatus {
    pub fn rank(self) -> u8 {
        match self {
            ContactStatus::Requested => 1,
            ContactStatus::Added => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    Sent,
    Opened,
}

impl EnvelopeStatus {
    pub fn rank(self) -> u8 {
        match self {
            EnvelopeStatus::Sent => 1,
            EnvelopeStatus::Opened => 2,
        }
    }
}

/// Inventory bucket. Derived from the counters, never promoted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Held,
    Used,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PointsDirection {
    Earned,
    Spent,
}

/// Where in the transcript an observation was made.
///
/// `ordinal` numbers repeated occurrences of the same event inside one
/// message, so two identical lines never share a position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    pub message: usize,
    pub ordinal: usize,
}

impl Position {
    pub fn new(message: usize, ordinal: usize) -> Self {
        Self { message, ordinal }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Observation {
    Task {
        status: TaskStatus,
    },
    ItemAcquired {
        quantity: i64,
    },
    ItemUsed {
        quantity: i64,
    },
    Contact {
        status: ContactStatus,
    },
    Points {
        amount: i64,
        direction: PointsDirection,
        source: String,
    },
    RedEnvelope {
        status: EnvelopeStatus,
    },
    Avatar,
}

impl Observation {
    pub fn kind(&self) -> EntityKind {
        match self {
            Observation::Task { .. } => EntityKind::Task,
            Observation::ItemAcquired { .. } | Observation::ItemUsed { .. } => {
                EntityKind::InventoryItem
            }
            Observation::Contact { .. } => EntityKind::Contact,
            Observation::Points { .. } => EntityKind::PointsEvent,
            Observation::RedEnvelope { .. } => EntityKind::RedEnvelope,
            Observation::Avatar => EntityKind::Avatar,
        }
    }

    /// Quantity-bearing observations accumulate instead of overwriting.
    pub fn is_quantity(&self) -> bool {
        matches!(
            self,
            Observation::ItemAcquired { .. }
                | Observation::ItemUsed { .. }
                | Observation::Points { .. }
        )
    }

    /// Stable content fragment used in occurrence fingerprints.
    pub fn content_key(&self) -> String {
        match self {
            Observation::Task { status } => format!("task:{status:?}"),
            Observation::ItemAcquired { quantity } => format!("acquired:{quantity}"),
            Observation::ItemUsed { quantity } => format!("used:{quantity}"),
            Observation::Contact { status } => format!("contact:{status:?}"),
            Observation::Points {
                amount,
                direction,
                source,
            } => format!("points:{direction:?}:{amount}:{source}"),
            Observation::RedEnvelope { status } => format!("envelope:{status:?}"),
            Observation::Avatar => "avatar".to_string(),
        }
    }
}

/// One extractor match before reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Candidate {
    pub id: String,
    pub observation: Observation,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub payload: BTreeMap<String, String>,
    pub position: Position,
}

impl Candidate {
    pub fn new(id: impl Into<String>, observation: Observation, position: Position) -> Self {
        Self {
            id: id.into(),
            observation,
            payload: BTreeMap::new(),
            position,
        }
    }

    /// Attach a payload field; blank values and placeholders are skipped.
    pub fn with_field(mut self, key: &str, value: Option<&str>) -> Self {
        if let Some(value) = value.map(str::trim).filter(|v| !is_placeholder(v)) {
            self.payload.insert(key.to_string(), value.to_string());
        }
        self
    }

    pub fn kind(&self) -> EntityKind {
        self.observation.kind()
    }

    /// Fingerprint of this occurrence: id, content and position.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}:{}:{}@{}.{}",
            self.kind(),
            self.id,
            self.observation.content_key(),
            self.position.message,
            self.position.ordinal
        )
    }
}

/// Placeholder tokens that stand for "no value" in structured tags.
pub fn is_placeholder(value: &str) -> bool {
    matches!(value.trim(), "" | "..." | "…" | "……" | "-")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityState {
    Task {
        status: TaskStatus,
    },
    InventoryItem {
        status: ItemStatus,
        count: i64,
        used_quantity: i64,
        acquired: i64,
    },
    Contact {
        status: ContactStatus,
    },
    PointsEvent {
        amount: i64,
        direction: PointsDirection,
        source: String,
    },
    RedEnvelope {
        status: EnvelopeStatus,
    },
    Avatar,
}

impl EntityState {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityState::Task { .. } => EntityKind::Task,
            EntityState::InventoryItem { .. } => EntityKind::InventoryItem,
            EntityState::Contact { .. } => EntityKind::Contact,
            EntityState::PointsEvent { .. } => EntityKind::PointsEvent,
            EntityState::RedEnvelope { .. } => EntityKind::RedEnvelope,
            EntityState::Avatar => EntityKind::Avatar,
        }
    }

    /// Priority of the current status for kinds with forward-only status.
    pub fn status_rank(&self) -> Option<u8> {
        match self {
            EntityState::Task { status } => Some(status.rank()),
            EntityState::Contact { status } => Some(status.rank()),
            EntityState::RedEnvelope { status } => Some(status.rank()),
            EntityState::Avatar => Some(1),
            EntityState::InventoryItem { .. } | EntityState::PointsEvent { .. } => None,
        }
    }

    pub fn status_label(&self) -> &'static str {
        match self {
            EntityState::Task { status } => match status {
                TaskStatus::Available => "available",
                TaskStatus::Accepted => "accepted",
                TaskStatus::Completed => "completed",
            },
            EntityState::InventoryItem { status, .. } => match status {
                ItemStatus::Held => "held",
                ItemStatus::Used => "used",
            },
            EntityState::Contact { status } => match status {
                ContactStatus::Requested => "requested",
                ContactStatus::Added => "added",
            },
            EntityState::PointsEvent { direction, .. } => match direction {
                PointsDirection::Earned => "earned",
                PointsDirection::Spent => "spent",
            },
            EntityState::RedEnvelope { status } => match status {
                EnvelopeStatus::Sent => "sent",
                EnvelopeStatus::Opened => "opened",
            },
            EntityState::Avatar => "set",
        }
    }
}

/// Canonical record for one `(kind, id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entity {
    pub id: String,
    #[serde(flatten)]
    pub state: EntityState,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub payload: BTreeMap<String, String>,
    pub first_seen_at: usize,
    pub last_seen_at: usize,
    /// Fingerprints of quantity occurrences already folded in.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub applied: BTreeSet<String>,
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        self.state.kind()
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.kind(), self.id.clone())
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).map(String::as_str)
    }
}

/// Canonical identity of an entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityKey {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}
