//! Steward core types: resource items, bags, observables, and the error
//! taxonomy shared by every backend manager.

#![forbid(unsafe_code)]

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Label map used as selector input and applied as metadata. BTreeMap keeps
/// iteration deterministic across passes.
pub type Labels = BTreeMap<String, String>;

/// Lifecycle of an item relative to the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Lifecycle {
    /// Created/updated/deleted by the engine.
    Managed,
    /// Read-only input; never written or garbage-collected.
    Referenced,
}

/// Type-erased payload of an [`Item`]. Each backend manager owns exactly one
/// implementing type and downcasts through `as_any`.
pub trait ResourceObject: Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;

    /// Natural-key identity: true iff `other` refers to the same real-world
    /// resource. Server-populated fields must not participate.
    fn is_same_as(&self, other: &dyn ResourceObject) -> bool;

    /// Human-readable key for logs and error messages.
    fn name(&self) -> String;
}

/// One managed or referenced external resource.
#[derive(Debug, Clone)]
pub struct Item {
    /// Tag identifying which manager owns this item.
    pub type_tag: &'static str,
    pub lifecycle: Lifecycle,
    pub obj: Arc<dyn ResourceObject>,
}

impl Item {
    pub fn managed(type_tag: &'static str, obj: Arc<dyn ResourceObject>) -> Self {
        Self { type_tag, lifecycle: Lifecycle::Managed, obj }
    }

    pub fn referenced(type_tag: &'static str, obj: Arc<dyn ResourceObject>) -> Self {
        Self { type_tag, lifecycle: Lifecycle::Referenced, obj }
    }

    /// Downcast the payload to the owning manager's concrete type.
    pub fn downcast<T: ResourceObject>(&self) -> Option<&T> {
        self.obj.as_any().downcast_ref::<T>()
    }

    pub fn name(&self) -> String {
        self.obj.name()
    }
}

/// Ordered collection of items, constructed fresh per reconciliation pass.
/// Not keyed: multiple items may share a type tag.
#[derive(Debug, Clone, Default)]
pub struct Bag {
    items: SmallVec<[Item; 8]>,
}

impl Bag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, item: Item) {
        self.items.push(item);
    }

    pub fn extend<I: IntoIterator<Item = Item>>(&mut self, items: I) {
        self.items.extend(items);
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// Items of one type tag, in insertion order.
    pub fn by_type<'a>(&'a self, type_tag: &'a str) -> impl Iterator<Item = &'a Item> + 'a {
        self.items.iter().filter(move |i| i.type_tag == type_tag)
    }

    /// Distinct type tags, first-seen order.
    pub fn type_tags(&self) -> Vec<&'static str> {
        let mut tags: Vec<&'static str> = Vec::new();
        for item in &self.items {
            if !tags.contains(&item.type_tag) {
                tags.push(item.type_tag);
            }
        }
        tags
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl FromIterator<Item> for Bag {
    fn from_iter<I: IntoIterator<Item = Item>>(iter: I) -> Self {
        Self { items: iter.into_iter().collect() }
    }
}

impl IntoIterator for Bag {
    type Item = Item;
    type IntoIter = smallvec::IntoIter<[Item; 8]>;
    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

/// Backend-specific query payload of an [`Observable`].
pub trait ObservableSpec: Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
}

/// Query descriptor used to fetch the current state of one resource family
/// before reconciliation. Produced once per pass, consumed once by observe.
#[derive(Debug, Clone)]
pub struct Observable {
    pub type_tag: &'static str,
    pub spec: Arc<dyn ObservableSpec>,
}

impl Observable {
    pub fn new(type_tag: &'static str, spec: Arc<dyn ObservableSpec>) -> Self {
        Self { type_tag, spec }
    }

    pub fn downcast<T: ObservableSpec>(&self) -> Option<&T> {
        self.spec.as_any().downcast_ref::<T>()
    }
}

/// Identifies the custom-resource instance that causally owns a managed
/// item. Threaded by the caller into each created item's metadata at
/// construction time; the engine never infers ownership.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct OwnerRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    pub controller: bool,
}

/// Error taxonomy every manager maps its backend failures onto.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum ResourceError {
    /// The resource does not exist. Non-fatal during observe.
    #[error("not found: {0}")]
    NotFound(String),
    /// Fatal for the affected type; surfaced to the caller.
    #[error("not authorized: {0}")]
    NotAuthorized(String),
    /// Network/5xx class failure; the caller may retry the whole pass.
    #[error("transient: {0}")]
    Transient(String),
    /// Payload rejected by the backend; requires spec correction.
    #[error("invalid: {0}")]
    Invalid(String),
}

impl ResourceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ResourceError::NotFound(_))
    }

    /// Hard errors short-circuit remaining work for the affected type.
    pub fn is_hard(&self) -> bool {
        matches!(self, ResourceError::NotAuthorized(_) | ResourceError::Invalid(_))
    }
}
