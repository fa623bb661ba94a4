//! Steward reconciliation engine: the uniform manager protocol, the type-tag
//! registry, and the convergence pass (observe, match, plan, apply).

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use steward_core::{Bag, Item, Labels, Lifecycle, Observable, OwnerRef, ResourceError};

fn default_call_timeout() -> Duration {
    let ms = std::env::var("STEWARD_CALL_TIMEOUT_MS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(30_000);
    Duration::from_millis(ms)
}

/// Uniform protocol every backend implements, one impl per resource family.
#[async_trait::async_trait]
pub trait ResourceManager: Send + Sync {
    /// Tag of the items this manager owns.
    fn type_tag(&self) -> &'static str;

    /// Build the query descriptors needed to re-fetch current state for the
    /// items of this manager's type already present in `bag`. Pure, no I/O.
    fn observables_from_objects(&self, bag: &Bag, labels: &Labels) -> Vec<Observable>;

    /// Fetch current real-world state for each observable. A resource absent
    /// in the backend is omitted from the result, never an error. Any other
    /// fetch failure aborts the batch.
    async fn observe(&self, observables: &[Observable]) -> Result<Bag, ResourceError>;

    /// True iff any caller-managed field differs. Server-populated fields
    /// must not participate. Pure, no I/O.
    fn spec_differs(&self, expected: &Item, observed: &Item) -> bool;

    /// Create a not-yet-existing resource. An "already exists" response is
    /// collapsed to success; convergence is spec_differs-driven.
    async fn create(&self, item: &Item) -> Result<(), ResourceError>;

    /// Patch-style update carrying only managed fields, preserving state
    /// owned by other actors.
    async fn update(&self, item: &Item) -> Result<(), ResourceError>;

    /// Remove the resource. Deleting an already-absent resource is success.
    async fn delete(&self, item: &Item) -> Result<(), ResourceError>;
}

/// Immutable type-tag to manager mapping, built once at startup and injected
/// into the engine. Safe for concurrent reads.
pub struct ManagerRegistry {
    managers: BTreeMap<&'static str, Arc<dyn ResourceManager>>,
}

#[derive(Default)]
pub struct RegistryBuilder {
    managers: BTreeMap<&'static str, Arc<dyn ResourceManager>>,
}

impl RegistryBuilder {
    pub fn register(mut self, manager: Arc<dyn ResourceManager>) -> Self {
        self.managers.insert(manager.type_tag(), manager);
        self
    }

    pub fn build(self) -> ManagerRegistry {
        ManagerRegistry { managers: self.managers }
    }
}

impl ManagerRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn get(&self, type_tag: &str) -> Option<&Arc<dyn ResourceManager>> {
        self.managers.get(type_tag)
    }

    pub fn contains(&self, type_tag: &str) -> bool {
        self.managers.contains_key(type_tag)
    }

    pub fn type_tags(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.managers.keys().copied()
    }
}

/// Verb the engine was executing when an item failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Observe,
    Create,
    Update,
    Delete,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verb::Observe => "observe",
            Verb::Create => "create",
            Verb::Update => "update",
            Verb::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// One item's failure, tagged with its type and natural key.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{verb} {type_tag}/{name}: {error}")]
pub struct ItemFailure {
    pub type_tag: &'static str,
    pub name: String,
    pub verb: Verb,
    pub error: ResourceError,
}

impl ItemFailure {
    fn new(type_tag: &'static str, name: impl Into<String>, verb: Verb, error: ResourceError) -> Self {
        Self { type_tag, name: name.into(), verb, error }
    }
}

/// Aggregate of every per-item failure in one pass.
#[derive(Debug, Clone)]
pub struct AggregateError {
    pub failures: Vec<ItemFailure>,
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reconcile: {} item(s) failed: ", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

/// Outcome of one pass. `reconciled` reflects exactly what exists after the
/// pass (successful creates/updates plus unchanged matches), not what was
/// attempted. Partial success is explicit.
#[derive(Debug)]
pub struct ReconcileOutput {
    pub reconciled: Bag,
    pub failures: Vec<ItemFailure>,
}

impl ReconcileOutput {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn err(&self) -> Option<AggregateError> {
        if self.failures.is_empty() {
            None
        } else {
            Some(AggregateError { failures: self.failures.clone() })
        }
    }
}

/// Entry point the custom-resource layer implements, one per resource kind.
pub trait ComponentSpec: Send + Sync {
    /// Desired-state bag for one instance. The owner reference is threaded
    /// into each managed item's payload here, never inferred by the engine.
    fn expected_resources(&self, owner: &OwnerRef, labels: &Labels) -> anyhow::Result<Bag>;

    /// Query descriptors for the pass. Defaults to asking each registered
    /// manager to derive them from the expected bag.
    fn observables(
        &self,
        registry: &ManagerRegistry,
        labels: &Labels,
        expected: &Bag,
    ) -> Vec<Observable> {
        derive_observables(registry, expected, labels)
    }
}

/// Derive observables from an expected bag via each registered manager.
pub fn derive_observables(
    registry: &ManagerRegistry,
    expected: &Bag,
    labels: &Labels,
) -> Vec<Observable> {
    let mut out = Vec::new();
    for tag in expected.type_tags() {
        if let Some(manager) = registry.get(tag) {
            out.extend(manager.observables_from_objects(expected, labels));
        }
    }
    out
}

/// Drives one expected bag toward observed reality. One pass is sequential;
/// passes for different instances run in parallel sharing only the registry.
pub struct Engine {
    registry: Arc<ManagerRegistry>,
    call_timeout: Duration,
}

impl Engine {
    pub fn new(registry: Arc<ManagerRegistry>) -> Self {
        Self { registry, call_timeout: default_call_timeout() }
    }

    /// Deadline applied to every manager call so one slow backend cannot
    /// stall the pass beyond the caller's budget.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, ResourceError>>,
    ) -> Result<T, ResourceError> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(ResourceError::Transient(format!(
                "manager call exceeded {}ms deadline",
                self.call_timeout.as_millis()
            ))),
        }
    }

    /// Full pass from a component spec: build expected resources and
    /// observables, then converge.
    pub async fn reconcile_component(
        &self,
        spec: &dyn ComponentSpec,
        owner: &OwnerRef,
        labels: &Labels,
    ) -> anyhow::Result<ReconcileOutput> {
        let expected = spec.expected_resources(owner, labels)?;
        let observables = spec.observables(&self.registry, labels, &expected);
        Ok(self.reconcile_with(&expected, &observables).await)
    }

    /// Converge with observables derived from the expected bag.
    pub async fn reconcile(&self, expected: &Bag, labels: &Labels) -> ReconcileOutput {
        let observables = derive_observables(&self.registry, expected, labels);
        self.reconcile_with(expected, &observables).await
    }

    /// Converge an expected bag against pre-built observables.
    pub async fn reconcile_with(
        &self,
        expected: &Bag,
        observables: &[Observable],
    ) -> ReconcileOutput {
        let t0 = Instant::now();
        counter!("reconcile_attempts", 1u64);

        let mut failures: Vec<ItemFailure> = Vec::new();
        let mut reconciled = Bag::new();

        // Types to cover: expected bag order first, then observable-only
        // types (so orphans of a fully-removed type are still collected).
        let mut tags = expected.type_tags();
        for o in observables {
            if !tags.contains(&o.type_tag) {
                tags.push(o.type_tag);
            }
        }

        // Phase 1: observe every type. A hard failure marks that type
        // skipped; other types proceed.
        let mut observed_by_type: BTreeMap<&'static str, Bag> = BTreeMap::new();
        let mut failed_types: BTreeSet<&'static str> = BTreeSet::new();
        for &tag in &tags {
            let Some(manager) = self.registry.get(tag) else {
                for item in expected.by_type(tag) {
                    failures.push(ItemFailure::new(
                        tag,
                        item.name(),
                        Verb::Observe,
                        ResourceError::Invalid(format!("no manager registered for type {tag}")),
                    ));
                }
                failed_types.insert(tag);
                continue;
            };
            let batch: Vec<Observable> =
                observables.iter().filter(|o| o.type_tag == tag).cloned().collect();
            match self.bounded(manager.observe(&batch)).await {
                Ok(bag) => {
                    debug!(type_tag = tag, observed = bag.len(), "observed");
                    observed_by_type.insert(tag, bag);
                }
                Err(error) => {
                    warn!(type_tag = tag, error = %error, "observe failed; skipping type");
                    failures.push(ItemFailure::new(tag, "*", Verb::Observe, error));
                    failed_types.insert(tag);
                }
            }
        }

        // Phases 2-4a: match expected to observed per type, apply creates
        // and updates in bag insertion order, collect orphan deletes.
        let empty = Bag::new();
        let mut creates = 0u64;
        let mut updates = 0u64;
        let mut deletes = 0u64;
        let mut pending_deletes: Vec<Item> = Vec::new();

        for &tag in &tags {
            if failed_types.contains(tag) {
                continue;
            }
            let Some(manager) = self.registry.get(tag) else { continue };
            let observed = observed_by_type.get(tag).unwrap_or(&empty);
            let mut matched = vec![false; observed.len()];

            for item in expected.by_type(tag) {
                if failed_types.contains(tag) {
                    break;
                }
                let found = observed.items().iter().enumerate().find_map(|(idx, o)| {
                    (!matched[idx] && o.obj.is_same_as(item.obj.as_ref())).then_some(idx)
                });
                if let Some(idx) = found {
                    matched[idx] = true;
                }

                if item.lifecycle == Lifecycle::Referenced {
                    // Read-only input: carried into the reconciled bag when
                    // it exists, never written.
                    if let Some(idx) = found {
                        reconciled.add(observed.items()[idx].clone());
                    }
                    continue;
                }

                match found {
                    None => {
                        debug!(type_tag = tag, name = %item.name(), "creating");
                        match self.bounded(manager.create(item)).await {
                            Ok(()) => {
                                counter!("reconcile_creates", 1u64);
                                creates += 1;
                                reconciled.add(item.clone());
                            }
                            Err(error) => {
                                self.record_failure(
                                    &mut failures,
                                    &mut failed_types,
                                    tag,
                                    item.name(),
                                    Verb::Create,
                                    error,
                                );
                            }
                        }
                    }
                    Some(idx) => {
                        let current = &observed.items()[idx];
                        if manager.spec_differs(item, current) {
                            debug!(type_tag = tag, name = %item.name(), "updating");
                            match self.bounded(manager.update(item)).await {
                                Ok(()) => {
                                    counter!("reconcile_updates", 1u64);
                                    updates += 1;
                                    reconciled.add(item.clone());
                                }
                                Err(error) => {
                                    self.record_failure(
                                        &mut failures,
                                        &mut failed_types,
                                        tag,
                                        item.name(),
                                        Verb::Update,
                                        error,
                                    );
                                }
                            }
                        } else {
                            reconciled.add(current.clone());
                        }
                    }
                }
            }

            if failed_types.contains(tag) {
                continue;
            }
            // Phase 3: unmatched observed Managed items are orphans.
            // Referenced items are never deleted.
            for (idx, o) in observed.items().iter().enumerate() {
                if !matched[idx] && o.lifecycle == Lifecycle::Managed {
                    pending_deletes.push(o.clone());
                }
            }
        }

        // Phase 4b: orphan deletes run after the desired set is in place, so
        // a resource is never removed before its replacement exists.
        for item in pending_deletes {
            if failed_types.contains(item.type_tag) {
                continue;
            }
            let Some(manager) = self.registry.get(item.type_tag) else { continue };
            debug!(type_tag = item.type_tag, name = %item.name(), "deleting orphan");
            match self.bounded(manager.delete(&item)).await {
                Ok(()) => {
                    counter!("reconcile_deletes", 1u64);
                    deletes += 1;
                }
                Err(error) => {
                    let tag = item.type_tag;
                    self.record_failure(
                        &mut failures,
                        &mut failed_types,
                        tag,
                        item.name(),
                        Verb::Delete,
                        error,
                    );
                }
            }
        }

        if !failures.is_empty() {
            counter!("reconcile_item_errors", failures.len() as u64);
        }
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(
            expected = expected.len(),
            reconciled = reconciled.len(),
            creates,
            updates,
            deletes,
            failures = failures.len(),
            "reconcile pass done"
        );

        ReconcileOutput { reconciled, failures }
    }

    fn record_failure(
        &self,
        failures: &mut Vec<ItemFailure>,
        failed_types: &mut BTreeSet<&'static str>,
        type_tag: &'static str,
        name: String,
        verb: Verb,
        error: ResourceError,
    ) {
        warn!(type_tag, name = %name, verb = %verb, error = %error, "item failed");
        // NotAuthorized short-circuits the rest of this type only; other
        // errors are recorded and the pass continues.
        if matches!(error, ResourceError::NotAuthorized(_)) {
            failed_types.insert(type_tag);
        }
        failures.push(ItemFailure::new(type_tag, name, verb, error));
    }
}
