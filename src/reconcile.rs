//! Reconciliation of extractor candidates into canonical state.
//!
//! Status-bearing kinds only move forward (`rank(new) > rank(current)`).
//! Quantity-bearing kinds accumulate, and each occurrence is folded in at
//! most once per entity, keyed by its fingerprint. Together these make a
//! rescan of an unchanged transcript a no-op.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::entity::{
    Candidate, Entity, EntityKey, EntityKind, EntityState, ItemStatus, Observation,
    PointsDirection,
};

/// Single source of truth: one record per `(kind, id)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "Vec<Entity>", into = "Vec<Entity>")]
pub struct CanonicalState {
    entities: BTreeMap<EntityKey, Entity>,
    /// Points event ids found by the latest complete points extraction.
    /// `None` until a pass narrows it; every points event counts then.
    live_points: Option<BTreeSet<String>>,
}

impl From<Vec<Entity>> for CanonicalState {
    fn from(entities: Vec<Entity>) -> Self {
        Self {
            entities: entities
                .into_iter()
                .map(|entity| (entity.key(), entity))
                .collect(),
            live_points: None,
        }
    }
}

impl From<CanonicalState> for Vec<Entity> {
    fn from(state: CanonicalState) -> Self {
        state.entities.into_values().collect()
    }
}

/// Keys touched by one merge.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Delta {
    pub added: BTreeSet<EntityKey>,
    pub changed: BTreeSet<EntityKey>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.changed.len()
    }

    pub fn kinds(&self) -> BTreeSet<EntityKind> {
        self.added
            .iter()
            .chain(self.changed.iter())
            .map(|key| key.kind)
            .collect()
    }

    /// Added and changed keys of one kind, in key order.
    pub fn keys_for(&self, kind: EntityKind) -> Vec<&EntityKey> {
        let mut keys: Vec<&EntityKey> = self
            .added
            .iter()
            .chain(self.changed.iter())
            .filter(|key| key.kind == kind)
            .collect();
        keys.sort();
        keys
    }
}

#[derive(Debug, Clone)]
pub struct Merged {
    pub state: CanonicalState,
    pub delta: Delta,
}

/// Merge `candidates` into `state`, returning the new state and its delta.
pub fn merge(mut state: CanonicalState, candidates: &[Candidate]) -> Merged {
    let delta = state.apply(candidates);
    Merged { state, delta }
}

impl CanonicalState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, kind: EntityKind, id: &str) -> Option<&Entity> {
        self.entities.get(&EntityKey::new(kind, id))
    }

    pub fn get_key(&self, key: &EntityKey) -> Option<&Entity> {
        self.entities.get(key)
    }

    /// Snapshot of one kind, ordered by id.
    pub fn entities(&self, kind: EntityKind) -> Vec<Entity> {
        self.entities
            .values()
            .filter(|entity| entity.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn counts(&self) -> BTreeMap<EntityKind, usize> {
        let mut counts = BTreeMap::new();
        for entity in self.entities.values() {
            *counts.entry(entity.kind()).or_insert(0) += 1;
        }
        counts
    }

    /// `sum(earned) - sum(spent)` over the live points events.
    ///
    /// Events an edit removed from the transcript keep their records but
    /// stop counting once a pass has replaced the live set.
    pub fn points_balance(&self) -> i64 {
        self.entities
            .values()
            .filter(|entity| self.is_live_points(&entity.id))
            .filter_map(|entity| match &entity.state {
                EntityState::PointsEvent {
                    amount, direction, ..
                } => Some(match direction {
                    PointsDirection::Earned => *amount,
                    PointsDirection::Spent => -*amount,
                }),
                _ => None,
            })
            .sum()
    }

    /// Replace the live points set with the ids from one complete points
    /// extraction. Returns how many known events dropped out of it.
    pub fn retain_live_points<I>(&mut self, ids: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let live: BTreeSet<String> = ids.into_iter().collect();
        let superseded = self
            .entities
            .values()
            .filter(|entity| entity.kind() == EntityKind::PointsEvent)
            .filter(|entity| self.is_live_points(&entity.id) && !live.contains(&entity.id))
            .count();
        if superseded > 0 {
            tracing::debug!(superseded, "points events no longer in transcript");
        }
        self.live_points = Some(live);
        superseded
    }

    pub fn is_live_points(&self, id: &str) -> bool {
        self.live_points
            .as_ref()
            .map_or(true, |live| live.contains(id))
    }

    /// Fold candidates in order and report what was added or changed.
    pub fn apply(&mut self, candidates: &[Candidate]) -> Delta {
        let mut delta = Delta::default();
        for candidate in candidates {
            let key = EntityKey::new(candidate.kind(), candidate.id.clone());
            match self.entities.get_mut(&key) {
                None => {
                    let entity = create_entity(candidate);
                    tracing::trace!(entity = %key, "entity created");
                    self.entities.insert(key.clone(), entity);
                    delta.added.insert(key);
                }
                Some(entity) => {
                    if update_entity(entity, candidate) && !delta.added.contains(&key) {
                        tracing::trace!(entity = %key, "entity changed");
                        delta.changed.insert(key);
                    }
                }
            }
        }
        delta
    }
}

fn create_entity(candidate: &Candidate) -> Entity {
    let mut applied = BTreeSet::new();
    if candidate.observation.is_quantity() {
        applied.insert(candidate.fingerprint());
    }

    let state = match &candidate.observation {
        Observation::Task { status } => EntityState::Task { status: *status },
        Observation::ItemAcquired { quantity } => item_state(*quantity, 0),
        Observation::ItemUsed { quantity } => item_state(0, *quantity),
        Observation::Contact { status } => EntityState::Contact { status: *status },
        Observation::Points {
            amount,
            direction,
            source,
        } => EntityState::PointsEvent {
            amount: *amount,
            direction: *direction,
            source: source.clone(),
        },
        Observation::RedEnvelope { status } => EntityState::RedEnvelope { status: *status },
        Observation::Avatar => EntityState::Avatar,
    };

    Entity {
        id: candidate.id.clone(),
        state,
        payload: candidate.payload.clone(),
        first_seen_at: candidate.position.message,
        last_seen_at: candidate.position.message,
        applied,
    }
}

/// Returns true when status, payload or quantities changed.
fn update_entity(entity: &mut Entity, candidate: &Candidate) -> bool {
    let message = candidate.position.message;
    entity.first_seen_at = entity.first_seen_at.min(message);
    entity.last_seen_at = entity.last_seen_at.max(message);

    if candidate.observation.is_quantity() {
        if !entity.applied.insert(candidate.fingerprint()) {
            return false;
        }
        accumulate(&mut entity.state, &candidate.observation);
        fill_missing(&mut entity.payload, &candidate.payload);
        return true;
    }

    let current = entity.state.status_rank().unwrap_or(0);
    let next = observation_rank(&candidate.observation).unwrap_or(0);
    if next > current {
        if let Some(state) = promoted_state(&candidate.observation) {
            entity.state = state;
        }
        for (key, value) in &candidate.payload {
            entity.payload.insert(key.clone(), value.clone());
        }
        true
    } else {
        fill_missing(&mut entity.payload, &candidate.payload)
    }
}

fn accumulate(state: &mut EntityState, observation: &Observation) {
    if let EntityState::InventoryItem {
        used_quantity,
        acquired,
        ..
    } = state
    {
        let (acquired_total, used_total) = match observation {
            Observation::ItemAcquired { quantity } => (*acquired + quantity, *used_quantity),
            Observation::ItemUsed { quantity } => (*acquired, *used_quantity + quantity),
            _ => return,
        };
        *state = item_state(acquired_total, used_total);
    }
    // A points event is a single occurrence; a second fingerprint for the
    // same id only records that it was seen.
}

fn item_state(acquired: i64, used_quantity: i64) -> EntityState {
    let count = (acquired - used_quantity).max(0);
    let status = if count == 0 && used_quantity > 0 {
        ItemStatus::Used
    } else {
        ItemStatus::Held
    };
    EntityState::InventoryItem {
        status,
        count,
        used_quantity,
        acquired,
    }
}

fn observation_rank(observation: &Observation) -> Option<u8> {
    match observation {
        Observation::Task { status } => Some(status.rank()),
        Observation::Contact { status } => Some(status.rank()),
        Observation::RedEnvelope { status } => Some(status.rank()),
        Observation::Avatar => Some(1),
        _ => None,
    }
}

fn promoted_state(observation: &Observation) -> Option<EntityState> {
    match observation {
        Observation::Task { status } => Some(EntityState::Task { status: *status }),
        Observation::Contact { status } => Some(EntityState::Contact { status: *status }),
        Observation::RedEnvelope { status } => Some(EntityState::RedEnvelope { status: *status }),
        _ => None,
    }
}

fn fill_missing(payload: &mut BTreeMap<String, String>, incoming: &BTreeMap<String, String>) -> bool {
    let mut filled = false;
    for (key, value) in incoming {
        if !payload.contains_key(key) {
            payload.insert(key.clone(), value.clone());
            filled = true;
        }
    }
    filled
}
