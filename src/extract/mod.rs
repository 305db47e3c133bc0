//! Extractor registry.
//!
//! Each extractor maps a transcript snapshot to candidates of one entity
//! kind. Extractors must be pure functions of the snapshot; the reconciler
//! relies on that for idempotence.

use std::sync::Arc;

use serde::Serialize;

use crate::entity::{Candidate, EntityKind};
use crate::error::{Error, Result};
use crate::transcript::Transcript;

pub mod matchers;

pub trait Extractor: Send + Sync {
    /// The single kind this extractor produces.
    fn kind(&self) -> EntityKind;

    fn extract(&self, transcript: &Transcript) -> Result<Vec<Candidate>>;
}

/// Adapter that turns a closure into an [`Extractor`].
pub struct FnExtractor<F> {
    kind: EntityKind,
    f: F,
}

impl<F> FnExtractor<F>
where
    F: Fn(&Transcript) -> Result<Vec<Candidate>> + Send + Sync,
{
    pub fn new(kind: EntityKind, f: F) -> Self {
        Self { kind, f }
    }
}

impl<F> Extractor for FnExtractor<F>
where
    F: Fn(&Transcript) -> Result<Vec<Candidate>> + Send + Sync,
{
    fn kind(&self) -> EntityKind {
        self.kind
    }

    fn extract(&self, transcript: &Transcript) -> Result<Vec<Candidate>> {
        (self.f)(transcript)
    }
}

/// Output of one extractor for one pass.
#[derive(Debug, Clone, Serialize)]
pub struct PatternResult {
    pub pattern_key: String,
    pub kind: EntityKind,
    pub candidates: Vec<Candidate>,
    /// True when the extractor failed and `candidates` is empty by fallback.
    pub failed: bool,
}

#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    entries: Vec<(String, Arc<dyn Extractor>)>,
}

impl std::fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractorRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in chat matchers.
    pub fn with_builtin() -> Result<Self> {
        let mut registry = Self::new();
        matchers::register_builtin(&mut registry)?;
        Ok(registry)
    }

    /// Register an extractor. Re-registering a key replaces it in place.
    pub fn register(&mut self, pattern_key: impl Into<String>, extractor: impl Extractor + 'static) {
        let pattern_key = pattern_key.into();
        let extractor: Arc<dyn Extractor> = Arc::new(extractor);
        match self.entries.iter_mut().find(|(key, _)| *key == pattern_key) {
            Some(entry) => entry.1 = extractor,
            None => self.entries.push((pattern_key, extractor)),
        }
    }

    pub fn register_fn<F>(&mut self, pattern_key: impl Into<String>, kind: EntityKind, f: F)
    where
        F: Fn(&Transcript) -> Result<Vec<Candidate>> + Send + Sync + 'static,
    {
        self.register(pattern_key, FnExtractor::new(kind, f));
    }

    pub fn keys(&self) -> Vec<&str> {
        self.entries.iter().map(|(key, _)| key.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run every extractor over `transcript`, in registration order.
    ///
    /// Extractors run concurrently on the blocking pool. A failing or
    /// panicking extractor yields an empty, `failed` result for its key and
    /// never affects the others.
    pub async fn run_all(&self, transcript: &Transcript) -> Vec<PatternResult> {
        let handles: Vec<_> = self
            .entries
            .iter()
            .map(|(key, extractor)| {
                let extractor = Arc::clone(extractor);
                let kind = extractor.kind();
                let snapshot = transcript.clone();
                let handle = tokio::task::spawn_blocking(move || extractor.extract(&snapshot));
                (key.clone(), kind, handle)
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (pattern_key, kind, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_err) => Err(Error::ExtractionFailure {
                    key: pattern_key.clone(),
                    reason: join_err.to_string(),
                }),
            };

            match outcome {
                Ok(candidates) => {
                    let total = candidates.len();
                    let candidates: Vec<Candidate> = candidates
                        .into_iter()
                        .filter(|candidate| candidate.kind() == kind)
                        .collect();
                    if candidates.len() != total {
                        tracing::warn!(
                            pattern_key = %pattern_key,
                            expected = %kind,
                            dropped = total - candidates.len(),
                            "extractor produced candidates of another kind"
                        );
                    }
                    tracing::debug!(pattern_key = %pattern_key, candidates = candidates.len(), "extractor finished");
                    results.push(PatternResult {
                        pattern_key,
                        kind,
                        candidates,
                        failed: false,
                    });
                }
                Err(err) => {
                    let err = match err {
                        err @ Error::ExtractionFailure { .. } => err,
                        other => Error::ExtractionFailure {
                            key: pattern_key.clone(),
                            reason: other.to_string(),
                        },
                    };
                    tracing::warn!(pattern_key = %pattern_key, error = %err, "extractor failed; skipping");
                    results.push(PatternResult {
                        pattern_key,
                        kind,
                        candidates: Vec::new(),
                        failed: true,
                    });
                }
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Observation, Position, TaskStatus};
    use crate::transcript::{Message, Role};

    fn transcript() -> Transcript {
        Transcript::new(vec![Message::new(0, Role::Other, "[查看任务|1|Sweep|5]")])
    }

    fn fixed_task(id: &'static str) -> impl Fn(&Transcript) -> Result<Vec<Candidate>> + Send + Sync {
        move |_| {
            Ok(vec![Candidate::new(
                id,
                Observation::Task {
                    status: TaskStatus::Available,
                },
                Position::new(0, 0),
            )])
        }
    }

    #[tokio::test]
    async fn failures_are_isolated() {
        let mut registry = ExtractorRegistry::new();
        registry.register_fn("first", EntityKind::Task, fixed_task("a"));
        registry.register_fn("broken", EntityKind::Task, |_| {
            Err(Error::InvalidArgument("boom".to_string()))
        });
        registry.register_fn("panics", EntityKind::Task, |_| -> Result<Vec<Candidate>> {
            panic!("matcher exploded")
        });
        registry.register_fn("last", EntityKind::Task, fixed_task("b"));

        let results = registry.run_all(&transcript()).await;
        let keys: Vec<_> = results.iter().map(|r| r.pattern_key.as_str()).collect();
        assert_eq!(keys, vec!["first", "broken", "panics", "last"]);
        assert!(!results[0].failed);
        assert!(results[1].failed && results[1].candidates.is_empty());
        assert!(results[2].failed && results[2].candidates.is_empty());
        assert_eq!(results[3].candidates[0].id, "b");
    }

    #[tokio::test]
    async fn foreign_kinds_are_dropped() {
        let mut registry = ExtractorRegistry::new();
        registry.register_fn("contacts", EntityKind::Contact, fixed_task("a"));
        let results = registry.run_all(&transcript()).await;
        assert!(!results[0].failed);
        assert!(results[0].candidates.is_empty());
    }

    #[test]
    fn register_replaces_existing_key() {
        let mut registry = ExtractorRegistry::new();
        registry.register_fn("tasks", EntityKind::Task, fixed_task("a"));
        registry.register_fn("other", EntityKind::Task, fixed_task("b"));
        registry.register_fn("tasks", EntityKind::Task, fixed_task("c"));
        assert_eq!(registry.keys(), vec!["tasks", "other"]);
    }

    #[tokio::test]
    async fn builtin_registry_is_deterministic() {
        let registry = ExtractorRegistry::with_builtin().expect("builtin");
        assert_eq!(
            registry.keys(),
            vec!["tasks", "inventory", "contacts", "points", "red_envelopes", "avatars"]
        );
        let first = registry.run_all(&transcript()).await;
        let second = registry.run_all(&transcript()).await;
        assert_eq!(first[0].candidates, second[0].candidates);
        assert_eq!(first[0].candidates.len(), 1);
    }
}
