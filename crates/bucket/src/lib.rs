//! Steward storage-bucket backend. The provider API sits behind the
//! [`BucketService`] trait; bucket identity and the managed-field diff follow
//! the provider's bucket model (name-keyed, location compared
//! case-insensitively).

#![forbid(unsafe_code)]

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use steward_core::{
    Bag, Item, Labels, Observable, ObservableSpec, ResourceError, ResourceObject,
};
use steward_engine::ResourceManager;

/// Type tag owned by this backend.
pub const TYPE: &str = "bucket";

static LABEL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new("[^a-z0-9_-]+").expect("static label pattern")
});

/// Sanitize one string to the provider's label charset: lowercase
/// alphanumerics, `-` and `_`, max 63 chars.
pub fn compliant_label_string(s: &str) -> String {
    let mut out = LABEL_RE.replace_all(&s.to_lowercase(), "-").into_owned();
    out.truncate(63);
    out
}

pub fn compliant_label_map(labels: &Labels) -> Labels {
    labels
        .iter()
        .map(|(k, v)| (compliant_label_string(k), compliant_label_string(v)))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketAcl {
    pub entity: String,
    pub role: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleRule {
    pub action: String,
    pub age_days: Option<i64>,
}

/// One storage bucket. `created` and `etag` are server-populated and never
/// participate in identity or the managed-field diff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub name: String,
    pub project: String,
    pub location: String,
    pub storage_class: String,
    pub labels: Labels,
    pub acl: Vec<BucketAcl>,
    pub versioning: bool,
    pub lifecycle: Vec<LifecycleRule>,
    pub created: Option<String>,
    pub etag: Option<String>,
}

impl Bucket {
    pub fn new(project: impl Into<String>, name: impl Into<String>) -> Self {
        Self { project: project.into(), name: name.into(), ..Self::default() }
    }
}

impl ResourceObject for Bucket {
    fn as_any(&self) -> &dyn Any {
        self
    }

    /// Natural key: the bucket name (globally unique at the provider).
    fn is_same_as(&self, other: &dyn ResourceObject) -> bool {
        other
            .as_any()
            .downcast_ref::<Bucket>()
            .map(|o| o.name == self.name)
            .unwrap_or(false)
    }

    fn name(&self) -> String {
        format!("bucket/{}/{}/{}", self.project, self.location, self.name)
    }
}

/// Query descriptor: one bucket fetched by name.
#[derive(Debug, Clone)]
pub struct BucketObservable {
    pub name: String,
    pub project: String,
    pub labels: Labels,
}

impl ObservableSpec for BucketObservable {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Provider verbs the manager needs, 1:1 with remote calls. `insert` returns
/// false when the bucket already existed, which the manager collapses to
/// success (convergence is spec_differs-driven).
#[async_trait::async_trait]
pub trait BucketService: Send + Sync {
    async fn get(&self, name: &str) -> Result<Bucket, ResourceError>;
    async fn insert(&self, project: &str, bucket: &Bucket) -> Result<bool, ResourceError>;
    async fn patch(&self, bucket: &Bucket) -> Result<(), ResourceError>;
    async fn delete(&self, name: &str) -> Result<(), ResourceError>;
}

/// Storage-bucket resource manager.
pub struct BucketManager {
    name: String,
    service: Arc<dyn BucketService>,
}

impl BucketManager {
    pub fn new(name: impl Into<String>, service: Arc<dyn BucketService>) -> Self {
        Self { name: name.into(), service }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn item_bucket<'a>(&self, item: &'a Item) -> Result<&'a Bucket, ResourceError> {
        item.downcast::<Bucket>().ok_or_else(|| {
            ResourceError::Invalid(format!("item {} does not carry a bucket payload", item.name()))
        })
    }
}

#[async_trait::async_trait]
impl ResourceManager for BucketManager {
    fn type_tag(&self) -> &'static str {
        TYPE
    }

    fn observables_from_objects(&self, bag: &Bag, labels: &Labels) -> Vec<Observable> {
        let labels = compliant_label_map(labels);
        bag.by_type(TYPE)
            .filter_map(|item| item.downcast::<Bucket>())
            .map(|b| {
                Observable::new(
                    TYPE,
                    Arc::new(BucketObservable {
                        name: b.name.clone(),
                        project: b.project.clone(),
                        labels: labels.clone(),
                    }),
                )
            })
            .collect()
    }

    async fn observe(&self, observables: &[Observable]) -> Result<Bag, ResourceError> {
        let mut out = Bag::new();
        for observable in observables {
            let Some(spec) = observable.downcast::<BucketObservable>() else { continue };
            match self.service.get(&spec.name).await {
                Ok(bucket) => out.add(Item::managed(TYPE, Arc::new(bucket))),
                // Absence is not an error; anything else aborts the batch.
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }

    /// Field-explicit diff over the managed subset only. Server-populated
    /// fields (created, etag) are excluded; location compares
    /// case-insensitively.
    fn spec_differs(&self, expected: &Item, observed: &Item) -> bool {
        let (Some(e), Some(o)) = (expected.downcast::<Bucket>(), observed.downcast::<Bucket>())
        else {
            return false;
        };
        e.acl != o.acl
            || e.labels != o.labels
            || e.lifecycle != o.lifecycle
            || !e.location.eq_ignore_ascii_case(&o.location)
            || e.name != o.name
            || e.storage_class != o.storage_class
            || e.versioning != o.versioning
    }

    async fn create(&self, item: &Item) -> Result<(), ResourceError> {
        let bucket = self.item_bucket(item)?;
        let created = self.service.insert(&bucket.project, bucket).await?;
        if !created {
            debug!(name = %item.name(), "already exists");
        }
        Ok(())
    }

    async fn update(&self, item: &Item) -> Result<(), ResourceError> {
        let bucket = self.item_bucket(item)?;
        self.service.patch(bucket).await
    }

    async fn delete(&self, item: &Item) -> Result<(), ResourceError> {
        let bucket = self.item_bucket(item)?;
        match self.service.delete(&bucket.name).await {
            // Deleting an already-absent bucket is success.
            Err(err) if err.is_not_found() => Ok(()),
            other => other,
        }
    }
}

/// In-memory [`BucketService`] for tests and local development. Records every
/// verb it serves and supports per-bucket error injection.
#[derive(Default)]
pub struct MemoryBucketService {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    buckets: BTreeMap<String, Bucket>,
    inject: BTreeMap<String, ResourceError>,
    calls: Vec<String>,
}

impl MemoryBucketService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a bucket as if it already existed at the provider.
    pub fn seed(&self, mut bucket: Bucket) {
        bucket.created.get_or_insert_with(|| "2020-01-01T00:00:00Z".to_string());
        let mut state = self.lock();
        state.buckets.insert(bucket.name.clone(), bucket);
    }

    /// Make every verb against `name` fail with `error`.
    pub fn inject_error(&self, name: &str, error: ResourceError) {
        self.lock().inject.insert(name.to_string(), error);
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().buckets.contains_key(name)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_injected(state: &MemoryState, name: &str) -> Result<(), ResourceError> {
        match state.inject.get(name) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl BucketService for MemoryBucketService {
    async fn get(&self, name: &str) -> Result<Bucket, ResourceError> {
        let mut state = self.lock();
        state.calls.push(format!("get {name}"));
        Self::check_injected(&state, name)?;
        state
            .buckets
            .get(name)
            .cloned()
            .ok_or_else(|| ResourceError::NotFound(format!("bucket {name}")))
    }

    async fn insert(&self, _project: &str, bucket: &Bucket) -> Result<bool, ResourceError> {
        let mut state = self.lock();
        state.calls.push(format!("insert {}", bucket.name));
        Self::check_injected(&state, &bucket.name)?;
        if state.buckets.contains_key(&bucket.name) {
            return Ok(false);
        }
        let mut stored = bucket.clone();
        stored.created = Some("2020-01-01T00:00:00Z".to_string());
        stored.etag = Some("1".to_string());
        state.buckets.insert(stored.name.clone(), stored);
        Ok(true)
    }

    async fn patch(&self, bucket: &Bucket) -> Result<(), ResourceError> {
        let mut state = self.lock();
        state.calls.push(format!("patch {}", bucket.name));
        Self::check_injected(&state, &bucket.name)?;
        match state.buckets.get_mut(&bucket.name) {
            Some(existing) => {
                let (created, etag) = (existing.created.clone(), existing.etag.clone());
                *existing = bucket.clone();
                existing.created = created;
                existing.etag = etag.map(|e| format!("{e}+"));
                Ok(())
            }
            None => Err(ResourceError::NotFound(format!("bucket {}", bucket.name))),
        }
    }

    async fn delete(&self, name: &str) -> Result<(), ResourceError> {
        let mut state = self.lock();
        state.calls.push(format!("delete {name}"));
        Self::check_injected(&state, name)?;
        match state.buckets.remove(name) {
            Some(_) => Ok(()),
            None => Err(ResourceError::NotFound(format!("bucket {name}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compliant_labels_lowercase_and_squash() {
        assert_eq!(compliant_label_string("My App/Frontend"), "my-app-frontend");
        let mut labels = Labels::new();
        labels.insert("App.Name".into(), "Demo CR".into());
        let out = compliant_label_map(&labels);
        assert_eq!(out.get("app-name").map(String::as_str), Some("demo-cr"));
    }

    #[test]
    fn identity_is_name_only() {
        let a = Bucket::new("p1", "logs");
        let mut b = Bucket::new("p2", "logs");
        b.etag = Some("9".into());
        assert!(a.is_same_as(&b));
        assert!(!a.is_same_as(&Bucket::new("p1", "other")));
    }

    #[test]
    fn diff_excludes_server_fields_and_location_case() {
        let manager = BucketManager::new("t", Arc::new(MemoryBucketService::new()));
        let mut expected = Bucket::new("p", "logs");
        expected.location = "US".into();
        let mut observed = expected.clone();
        observed.location = "us".into();
        observed.created = Some("2021-06-01T00:00:00Z".into());
        observed.etag = Some("3".into());

        let e = Item::managed(TYPE, Arc::new(expected.clone()));
        let o = Item::managed(TYPE, Arc::new(observed.clone()));
        assert!(!manager.spec_differs(&e, &o));

        observed.storage_class = "NEARLINE".into();
        let o = Item::managed(TYPE, Arc::new(observed));
        assert!(manager.spec_differs(&e, &o));
    }
}
