//! tally - incremental transcript extraction and reconciliation
//!
//! Watches an ever-growing, replay-prone chat transcript and re-derives
//! structured entities from fixed pattern matches. Derivation is
//! deterministic and idempotent: rerunning a pass over an unchanged
//! transcript leaves canonical state byte-identical.
//!
//! # Core Concepts
//!
//! - **Transcript**: ordered messages read through a [`TranscriptSource`]
//! - **Candidate**: one extractor observation before reconciliation
//! - **Canonical state**: one [`Entity`] per `(kind, id)`, the single source
//!   of truth
//! - **Pass**: sample → extract → reconcile → cache → notify
//!
//! # Module Organization
//!
//! - `transcript`: transcript sources and change signatures
//! - `detector`: push/poll change sources behind a debounce gate
//! - `extract`: extractor registry and built-in chat matchers
//! - `entity`: entity kinds, statuses, candidates and records
//! - `reconcile`: merge of candidates into canonical state
//! - `cache`: time-bounded store of raw extraction output
//! - `notifier`: delta fan-out to consumers and legacy refreshers
//! - `engine`: the facade that runs passes
//! - `config`: configuration loading from `.tally.toml`
//! - `error`: error types and result aliases
//! - `events`, `output`, `cli`: the command-line surface

pub mod cache;
pub mod cli;
pub mod config;
pub mod detector;
pub mod engine;
pub mod entity;
pub mod error;
pub mod events;
pub mod extract;
pub mod notifier;
pub mod output;
pub mod reconcile;
pub mod transcript;

pub use engine::{Engine, EngineHandle, PassReport, Stats};
pub use entity::{Candidate, Entity, EntityKind};
pub use error::{Error, Result};
pub use reconcile::{CanonicalState, Delta};
pub use transcript::{MemoryTranscript, TranscriptSource};
