//! Delta fan-out to consumers.
//!
//! Primary consumers are registered per entity kind and receive the delta's
//! entities of that kind. Legacy consumers only expose a zero-argument
//! refresh; they are tagged with a capability name and the kinds they
//! follow, and run after the primary handlers. Every call is isolated: a
//! failure is logged and skipped for that delta only.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;

use crate::entity::{Entity, EntityKind};
use crate::error::Error;
use crate::reconcile::{CanonicalState, Delta};

/// Handler for one kind's delta entities.
pub type ConsumerFn = dyn Fn(&[Entity]) -> anyhow::Result<()> + Send + Sync;

/// Legacy zero-argument refresh capability.
pub trait Refresh: Send + Sync {
    fn refresh(&self) -> anyhow::Result<()>;
}

impl<F> Refresh for F
where
    F: Fn() -> anyhow::Result<()> + Send + Sync,
{
    fn refresh(&self) -> anyhow::Result<()> {
        self()
    }
}

struct Consumer {
    name: String,
    kind: EntityKind,
    handler: Arc<ConsumerFn>,
}

struct Fallback {
    capability: String,
    /// Empty means every kind.
    kinds: Vec<EntityKind>,
    refresher: Arc<dyn Refresh>,
}

impl Fallback {
    fn follows(&self, kind: EntityKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }
}

/// What one `notify` call did.
#[derive(Debug, Default, Serialize)]
pub struct NotifyReport {
    pub delivered: usize,
    pub refreshed: usize,
    #[serde(skip)]
    pub failures: Vec<Error>,
}

#[derive(Default)]
pub struct Notifier {
    consumers: Vec<Consumer>,
    fallbacks: Vec<Fallback>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("consumers", &self.consumers.len())
            .field(
                "fallbacks",
                &self
                    .fallbacks
                    .iter()
                    .map(|fallback| fallback.capability.as_str())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_consumer<F>(&mut self, kind: EntityKind, handler: F)
    where
        F: Fn(&[Entity]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = format!("{kind}#{}", self.consumers.len());
        self.register_named_consumer(name, kind, handler);
    }

    pub fn register_named_consumer<F>(&mut self, name: impl Into<String>, kind: EntityKind, handler: F)
    where
        F: Fn(&[Entity]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.consumers.push(Consumer {
            name: name.into(),
            kind,
            handler: Arc::new(handler),
        });
    }

    /// Register a legacy refresher. A capability registered twice keeps only
    /// the latest refresher.
    pub fn register_fallback(
        &mut self,
        capability: impl Into<String>,
        kinds: &[EntityKind],
        refresher: Arc<dyn Refresh>,
    ) {
        let capability = capability.into();
        self.fallbacks.retain(|fallback| fallback.capability != capability);
        self.fallbacks.push(Fallback {
            capability,
            kinds: kinds.to_vec(),
            refresher,
        });
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn fallback_capabilities(&self) -> Vec<&str> {
        self.fallbacks
            .iter()
            .map(|fallback| fallback.capability.as_str())
            .collect()
    }

    /// Deliver `delta` using entity records from `state`.
    pub fn notify(&self, delta: &Delta, state: &CanonicalState) -> NotifyReport {
        let mut report = NotifyReport::default();
        if delta.is_empty() {
            return report;
        }

        let kinds = delta.kinds();
        for kind in &kinds {
            let entities: Vec<Entity> = delta
                .keys_for(*kind)
                .into_iter()
                .filter_map(|key| state.get_key(key).cloned())
                .collect();
            if entities.is_empty() {
                continue;
            }

            for consumer in self.consumers.iter().filter(|c| c.kind == *kind) {
                match isolated(|| (consumer.handler)(&entities)) {
                    Ok(()) => report.delivered += 1,
                    Err(err) => {
                        let err = Error::ConsumerFailure {
                            consumer: consumer.name.clone(),
                            reason: format!("{err:#}"),
                        };
                        tracing::warn!(kind = %kind, error = %err, "consumer failed; skipping");
                        report.failures.push(err);
                    }
                }
            }
        }

        for fallback in &self.fallbacks {
            if !kinds.iter().any(|kind| fallback.follows(*kind)) {
                continue;
            }
            match isolated(|| fallback.refresher.refresh()) {
                Ok(()) => report.refreshed += 1,
                Err(err) => {
                    let err = Error::ConsumerFailure {
                        consumer: fallback.capability.clone(),
                        reason: format!("{err:#}"),
                    };
                    tracing::warn!(error = %err, "legacy refresh failed; skipping");
                    report.failures.push(err);
                }
            }
        }

        report
    }
}

/// Run one consumer call, turning a panic into an error.
fn isolated(call: impl FnOnce() -> anyhow::Result<()>) -> anyhow::Result<()> {
    catch_unwind(AssertUnwindSafe(call))
        .unwrap_or_else(|panic| Err(anyhow::anyhow!("panicked: {}", panic_message(&*panic))))
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

// =============================================================================
// Legacy discovery shim
// =============================================================================

/// Host-side directory of legacy consumer objects, looked up by name.
pub trait LegacyLookup {
    /// Return the object's refresh capability, if it exposes one.
    fn lookup(&self, name: &str) -> Option<Arc<dyn Refresh>>;
}

impl LegacyLookup for HashMap<String, Arc<dyn Refresh>> {
    fn lookup(&self, name: &str) -> Option<Arc<dyn Refresh>> {
        self.get(name).cloned()
    }
}

/// Legacy consumer names and the kinds each one displays.
pub const LEGACY_CONSUMERS: &[(&str, &[EntityKind])] = &[
    ("task_app", &[EntityKind::Task]),
    ("backpack_app", &[EntityKind::InventoryItem]),
    ("shop_app", &[EntityKind::InventoryItem, EntityKind::PointsEvent]),
    (
        "messages_app",
        &[EntityKind::Contact, EntityKind::RedEnvelope, EntityKind::Avatar],
    ),
    ("points_app", &[EntityKind::PointsEvent]),
];

/// One-time name-based discovery: every name the lookup resolves becomes
/// an explicit fallback registration. Returns the number registered.
pub fn discover_legacy(
    notifier: &mut Notifier,
    lookup: &dyn LegacyLookup,
    names: &[(&str, &[EntityKind])],
) -> usize {
    let mut registered = 0;
    for (name, kinds) in names {
        match lookup.lookup(name) {
            Some(refresher) => {
                tracing::debug!(capability = name, "legacy consumer discovered");
                notifier.register_fallback(*name, kinds, refresher);
                registered += 1;
            }
            None => tracing::trace!(capability = name, "legacy consumer not present"),
        }
    }
    registered
}
