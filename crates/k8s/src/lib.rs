//! Steward cluster-native backend: observes, diffs, and writes arbitrary
//! cluster objects through `kube::Api<DynamicObject>`.

#![forbid(unsafe_code)]

use std::any::Any;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject},
    Client,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as Json;
use tracing::debug;

use steward_core::{
    Bag, Item, Labels, Observable, ObservableSpec, OwnerRef, ResourceError, ResourceObject,
};
use steward_engine::ResourceManager;

/// Type tag owned by this backend.
pub const TYPE: &str = "k8s";

static LABEL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new("[^A-Za-z0-9_.-]+").expect("static label pattern")
});

/// Sanitize one string to the cluster's label charset (alphanumerics plus
/// `-`, `_`, `.`, max 63 chars, alphanumeric at both ends).
pub fn compliant_label_string(s: &str) -> String {
    let mut out = LABEL_RE.replace_all(s, "-").into_owned();
    out.truncate(63);
    let trimmed: &str = out.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    trimmed.to_string()
}

pub fn compliant_label_map(labels: &Labels) -> Labels {
    labels
        .iter()
        .map(|(k, v)| (compliant_label_string(k), compliant_label_string(v)))
        .collect()
}

/// Payload owned by the k8s manager: one dynamic object plus the API
/// coordinates needed to reach it.
#[derive(Debug, Clone)]
pub struct KubeObject {
    pub resource: ApiResource,
    pub namespaced: bool,
    pub obj: DynamicObject,
}

impl KubeObject {
    pub fn new(resource: ApiResource, namespaced: bool, obj: DynamicObject) -> Self {
        Self { resource, namespaced, obj }
    }

    /// Thread the owning custom-resource instance into the object metadata.
    pub fn with_owner(mut self, owner: &OwnerRef) -> Self {
        let reference = OwnerReference {
            api_version: owner.api_version.clone(),
            kind: owner.kind.clone(),
            name: owner.name.clone(),
            uid: owner.uid.clone(),
            controller: Some(owner.controller),
            block_owner_deletion: None,
        };
        self.obj
            .metadata
            .owner_references
            .get_or_insert_with(Vec::new)
            .push(reference);
        self
    }

    fn gvk_key(&self) -> String {
        if self.resource.group.is_empty() {
            format!("{}/{}", self.resource.version, self.resource.kind)
        } else {
            format!("{}/{}/{}", self.resource.group, self.resource.version, self.resource.kind)
        }
    }

    fn object_name(&self) -> String {
        self.obj.metadata.name.clone().unwrap_or_default()
    }

    fn namespace(&self) -> Option<String> {
        self.obj.metadata.namespace.clone()
    }
}

impl ResourceObject for KubeObject {
    fn as_any(&self) -> &dyn Any {
        self
    }

    /// Natural key: group/version/kind + namespace + name. Server-populated
    /// fields never participate.
    fn is_same_as(&self, other: &dyn ResourceObject) -> bool {
        let Some(o) = other.as_any().downcast_ref::<KubeObject>() else {
            return false;
        };
        self.gvk_key() == o.gvk_key()
            && self.namespace() == o.namespace()
            && self.object_name() == o.object_name()
    }

    fn name(&self) -> String {
        format!(
            "{}/{}/{}",
            self.gvk_key(),
            self.namespace().unwrap_or_else(|| "-".to_string()),
            self.object_name()
        )
    }
}

/// Query descriptor: one GVK listed by label selector.
#[derive(Debug, Clone)]
pub struct KubeObservable {
    pub resource: ApiResource,
    pub namespaced: bool,
    pub namespace: Option<String>,
    pub labels: Labels,
}

impl ObservableSpec for KubeObservable {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Cluster-object resource manager.
pub struct KubeManager {
    client: Client,
    field_manager: String,
}

impl KubeManager {
    pub fn new(client: Client) -> Self {
        Self { client, field_manager: "steward".to_string() }
    }

    /// Field-manager name recorded against server-side apply writes.
    pub fn with_field_manager(mut self, name: impl Into<String>) -> Self {
        self.field_manager = name.into();
        self
    }

    fn api_for(
        &self,
        resource: &ApiResource,
        namespaced: bool,
        namespace: Option<&str>,
    ) -> Result<Api<DynamicObject>, ResourceError> {
        if namespaced {
            match namespace {
                Some(ns) => Ok(Api::namespaced_with(self.client.clone(), ns, resource)),
                None => Err(ResourceError::Invalid(format!(
                    "namespace required for namespaced kind {}",
                    resource.kind
                ))),
            }
        } else {
            Ok(Api::all_with(self.client.clone(), resource))
        }
    }

    fn item_object<'a>(&self, item: &'a Item) -> Result<&'a KubeObject, ResourceError> {
        item.downcast::<KubeObject>().ok_or_else(|| {
            ResourceError::Invalid(format!("item {} does not carry a k8s payload", item.name()))
        })
    }

    /// Full expected document for server-side apply: apiVersion/kind filled
    /// from the API coordinates, server-populated fields stripped.
    fn ssa_payload(&self, object: &KubeObject) -> Result<Json, ResourceError> {
        let mut v = serde_json::to_value(&object.obj)
            .map_err(|e| ResourceError::Invalid(format!("serializing {}: {e}", object.name())))?;
        if let Some(map) = v.as_object_mut() {
            map.insert("apiVersion".into(), Json::String(object.resource.api_version.clone()));
            map.insert("kind".into(), Json::String(object.resource.kind.clone()));
        }
        Ok(managed_view(v))
    }
}

#[async_trait::async_trait]
impl ResourceManager for KubeManager {
    fn type_tag(&self) -> &'static str {
        TYPE
    }

    fn observables_from_objects(&self, bag: &Bag, labels: &Labels) -> Vec<Observable> {
        let labels = compliant_label_map(labels);
        let mut out: Vec<Observable> = Vec::new();
        let mut seen: Vec<(String, Option<String>)> = Vec::new();
        for item in bag.by_type(TYPE) {
            let Some(obj) = item.downcast::<KubeObject>() else { continue };
            let key = (obj.gvk_key(), obj.namespace());
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);
            out.push(Observable::new(
                TYPE,
                Arc::new(KubeObservable {
                    resource: obj.resource.clone(),
                    namespaced: obj.namespaced,
                    namespace: obj.namespace(),
                    labels: labels.clone(),
                }),
            ));
        }
        out
    }

    async fn observe(&self, observables: &[Observable]) -> Result<Bag, ResourceError> {
        let mut out = Bag::new();
        for observable in observables {
            let Some(spec) = observable.downcast::<KubeObservable>() else { continue };
            let api = self.api_for(&spec.resource, spec.namespaced, spec.namespace.as_deref())?;
            let lp = ListParams::default().labels(&selector(&spec.labels));
            let list = match api.list(&lp).await {
                Ok(list) => list,
                Err(err) => {
                    let mapped = map_kube_err(err, &spec.resource.kind);
                    // Absence is not an error; anything else aborts the batch.
                    if mapped.is_not_found() {
                        continue;
                    }
                    return Err(mapped);
                }
            };
            debug!(kind = %spec.resource.kind, count = list.items.len(), "listed");
            for obj in list.items {
                out.add(Item::managed(
                    TYPE,
                    Arc::new(KubeObject::new(spec.resource.clone(), spec.namespaced, obj)),
                ));
            }
        }
        Ok(out)
    }

    fn spec_differs(&self, expected: &Item, observed: &Item) -> bool {
        let (Some(e), Some(o)) = (expected.downcast::<KubeObject>(), observed.downcast::<KubeObject>())
        else {
            return false;
        };
        let ev = managed_view(serde_json::to_value(&e.obj).unwrap_or(Json::Null));
        let ov = managed_view(serde_json::to_value(&o.obj).unwrap_or(Json::Null));
        subset_differs(&ev, &ov)
    }

    async fn create(&self, item: &Item) -> Result<(), ResourceError> {
        let object = self.item_object(item)?;
        let api = self.api_for(&object.resource, object.namespaced, object.namespace().as_deref())?;
        match api.create(&PostParams::default(), &object.obj).await {
            Ok(_) => Ok(()),
            // Already-exists collapses to success: convergence is
            // spec_differs-driven and a drifted object is patched next pass.
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(name = %item.name(), "already exists");
                Ok(())
            }
            Err(err) => Err(map_kube_err(err, &item.name())),
        }
    }

    async fn update(&self, item: &Item) -> Result<(), ResourceError> {
        let object = self.item_object(item)?;
        let api = self.api_for(&object.resource, object.namespaced, object.namespace().as_deref())?;
        let payload = self.ssa_payload(object)?;
        let pp = PatchParams::apply(&self.field_manager);
        api.patch(&object.object_name(), &pp, &Patch::Apply(&payload))
            .await
            .map(|_| ())
            .map_err(|err| map_kube_err(err, &item.name()))
    }

    async fn delete(&self, item: &Item) -> Result<(), ResourceError> {
        let object = self.item_object(item)?;
        let api = self.api_for(&object.resource, object.namespaced, object.namespace().as_deref())?;
        match api.delete(&object.object_name(), &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            // Deleting an already-absent resource is success.
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(err) => Err(map_kube_err(err, &item.name())),
        }
    }
}

fn selector(labels: &Labels) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Project a document down to the caller-managed subset: status and
/// server-populated metadata are stripped.
pub fn managed_view(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
            obj.remove("resourceVersion");
            obj.remove("generation");
            obj.remove("creationTimestamp");
            obj.remove("uid");
            obj.remove("selfLink");
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// True iff any field present in `expected` is missing or different in
/// `observed`. Fields only in `observed` (server defaults) are ignored, so a
/// freshly-applied object compares clean on the next pass.
pub fn subset_differs(expected: &Json, observed: &Json) -> bool {
    match (expected, observed) {
        (Json::Object(eo), Json::Object(oo)) => eo.iter().any(|(k, ev)| match oo.get(k) {
            Some(ov) => subset_differs(ev, ov),
            None => !ev.is_null(),
        }),
        (e, o) => e != o,
    }
}

fn map_kube_err(err: kube::Error, what: &str) -> ResourceError {
    match err {
        kube::Error::Api(ae) => match ae.code {
            404 => ResourceError::NotFound(format!("{what}: {}", ae.message)),
            401 | 403 => ResourceError::NotAuthorized(format!("{what}: {}", ae.message)),
            408 | 429 => ResourceError::Transient(format!("{what}: {}", ae.message)),
            code if code >= 500 => ResourceError::Transient(format!("{what}: {}", ae.message)),
            _ => ResourceError::Invalid(format!("{what}: {}", ae.message)),
        },
        other => ResourceError::Transient(format!("{what}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::{ErrorResponse, GroupVersionKind};

    fn cm_resource() -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind {
            group: String::new(),
            version: "v1".into(),
            kind: "ConfigMap".into(),
        })
    }

    fn cm(name: &str, ns: &str, data: Json) -> KubeObject {
        let ar = cm_resource();
        let mut obj = DynamicObject::new(name, &ar).within(ns);
        obj.data = serde_json::json!({ "data": data });
        KubeObject::new(ar, true, obj)
    }

    #[test]
    fn managed_view_prunes_server_fields() {
        let v = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "x",
                "managedFields": [{}],
                "resourceVersion": "12",
                "generation": 3,
                "creationTimestamp": "2020-01-01T00:00:00Z",
                "uid": "abc",
                "labels": { "app": "x" }
            },
            "status": { "ready": true },
            "data": { "k": "v" }
        });
        let pruned = managed_view(v);
        let meta = pruned.get("metadata").unwrap().as_object().unwrap();
        assert!(!meta.contains_key("managedFields"));
        assert!(!meta.contains_key("resourceVersion"));
        assert!(!meta.contains_key("uid"));
        assert!(meta.contains_key("labels"));
        assert!(!pruned.as_object().unwrap().contains_key("status"));
    }

    #[test]
    fn subset_ignores_server_added_fields() {
        let expected = serde_json::json!({ "spec": { "replicas": 2 } });
        let observed = serde_json::json!({ "spec": { "replicas": 2, "strategy": "RollingUpdate" } });
        assert!(!subset_differs(&expected, &observed));
    }

    #[test]
    fn subset_flags_changed_and_missing_managed_fields() {
        let expected = serde_json::json!({ "spec": { "replicas": 2 }, "data": { "k": "v" } });
        let drifted = serde_json::json!({ "spec": { "replicas": 3 }, "data": { "k": "v" } });
        let missing = serde_json::json!({ "spec": { "replicas": 2 } });
        assert!(subset_differs(&expected, &drifted));
        assert!(subset_differs(&expected, &missing));
    }

    #[test]
    fn identity_ignores_server_populated_fields() {
        let a = cm("app-cm", "ns", serde_json::json!({ "k": "v" }));
        let mut b = cm("app-cm", "ns", serde_json::json!({ "k": "other" }));
        b.obj.metadata.resource_version = Some("99".into());
        assert!(a.is_same_as(&b));

        let c = cm("other-cm", "ns", serde_json::json!({}));
        assert!(!a.is_same_as(&c));
    }

    #[test]
    fn same_key_different_metadata_is_not_a_spec_diff() {
        let manager_free_diff = |e: &KubeObject, o: &KubeObject| {
            let ev = managed_view(serde_json::to_value(&e.obj).unwrap());
            let ov = managed_view(serde_json::to_value(&o.obj).unwrap());
            subset_differs(&ev, &ov)
        };
        let expected = cm("app-cm", "ns", serde_json::json!({ "k": "v" }));
        let mut observed = cm("app-cm", "ns", serde_json::json!({ "k": "v" }));
        observed.obj.metadata.resource_version = Some("42".into());
        observed.obj.metadata.uid = Some("u-1".into());
        assert!(!manager_free_diff(&expected, &observed));
    }

    #[test]
    fn compliant_labels() {
        assert_eq!(compliant_label_string("My App/Frontend"), "My-App-Frontend");
        assert_eq!(compliant_label_string("-edge-"), "edge");
        let long = "a".repeat(80);
        assert_eq!(compliant_label_string(&long).len(), 63);
    }

    #[test]
    fn error_mapping_follows_status_codes() {
        let api_err = |code: u16| {
            kube::Error::Api(ErrorResponse {
                status: "Failure".into(),
                message: "m".into(),
                reason: "r".into(),
                code,
            })
        };
        assert!(map_kube_err(api_err(404), "x").is_not_found());
        assert!(matches!(map_kube_err(api_err(403), "x"), ResourceError::NotAuthorized(_)));
        assert!(matches!(map_kube_err(api_err(503), "x"), ResourceError::Transient(_)));
        assert!(matches!(map_kube_err(api_err(429), "x"), ResourceError::Transient(_)));
        assert!(matches!(map_kube_err(api_err(422), "x"), ResourceError::Invalid(_)));
    }

    #[test]
    fn owner_ref_threaded_into_metadata() {
        let owner = OwnerRef {
            api_version: "foo.example.com/v1alpha1".into(),
            kind: "Foo".into(),
            name: "demo".into(),
            uid: "u-1".into(),
            controller: true,
        };
        let obj = cm("demo-cm", "ns", serde_json::json!({})).with_owner(&owner);
        let refs = obj.obj.metadata.owner_references.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "demo");
        assert_eq!(refs[0].controller, Some(true));
    }
}
