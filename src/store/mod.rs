//! In-memory property-graph store.
//!
//! The store keeps typed, versioned entities and directed typed relations
//! behind a single [`parking_lot::RwLock`]. All mutating operations run
//! under the write lock, which gives the linearisable single-entity updates
//! and the atomic insert-or-match the scheduler's witness guard depends on.
//!
//! Entity IDs are assigned per kind, starting at 1. An entity's `version`
//! starts at 1 and is bumped on every stored mutation and whenever the
//! entity gains a new parent relation (it is the marked child endpoint of
//! that relation).
//!
//! The `alive` flag is the process-wide cancellation token: the observer
//! clears it on shutdown, workers observe it between jobs. Queries keep
//! working on a terminated store so the observer can watch workers wind
//! down.

pub mod mapper;
pub mod query;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::transport::{Entity, Relation, CHANGE_MARKER};

pub use query::{Query, QueryResult};

/// Errors surfaced by store operations.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    /// A referenced entity does not exist.
    #[error("entity not found: {kind}:{id}")]
    #[diagnostic(code(reflexgraph::store::entity_not_found))]
    EntityNotFound { kind: String, id: i64 },

    /// A filter used an operator outside the supported set.
    #[error("unknown filter operator: {op}")]
    #[diagnostic(
        code(reflexgraph::store::unknown_operator),
        help("supported operators: ==, !=, <, >, <=, >=, contains")
    )]
    UnknownOperator { op: String },

    /// An entity is missing a property an operation relies on.
    #[error("entity {kind}:{id} is missing property {key}")]
    #[diagnostic(code(reflexgraph::store::missing_property))]
    MissingProperty { kind: String, id: i64, key: String },

    /// JSON (de)serialisation of a job payload failed.
    #[error(transparent)]
    #[diagnostic(code(reflexgraph::store::serde_json))]
    Serde(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Default)]
pub(super) struct StoredEntity {
    pub(super) value: String,
    pub(super) context: String,
    pub(super) version: u32,
    pub(super) properties: FxHashMap<String, String>,
}

/// One directed edge endpoint as seen from the other side.
#[derive(Clone, Debug, Default)]
pub(super) struct Edge {
    pub(super) kind: String,
    pub(super) id: i64,
    pub(super) context: String,
    pub(super) properties: FxHashMap<String, String>,
}

#[derive(Default)]
pub(super) struct Inner {
    /// kind -> id -> entity; BTreeMap keeps per-kind enumeration id-ordered.
    pub(super) entities: FxHashMap<String, BTreeMap<i64, StoredEntity>>,
    pub(super) next_id: FxHashMap<String, i64>,
    pub(super) children: FxHashMap<(String, i64), Vec<Edge>>,
    pub(super) parents: FxHashMap<(String, i64), Vec<Edge>>,
}

impl Inner {

    pub(super) fn shallow(&self, kind: &str, id: i64) -> Option<Entity> {
        let stored = self.entities.get(kind)?.get(&id)?;
        Some(Entity {
            kind: kind.to_string(),
            id,
            value: stored.value.clone(),
            context: stored.context.clone(),
            version: stored.version,
            properties: stored.properties.clone(),
            children: Vec::new(),
            parents: Vec::new(),
        })
    }
}

/// Shared handle onto the property graph. Cheap to clone.
#[derive(Clone)]
pub struct GraphStore {
    pub(super) inner: Arc<RwLock<Inner>>,
    alive: Arc<AtomicBool>,
}

impl Default for GraphStore {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Whether the store is still accepting work.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Clear the alive flag. Workers and the observer react on their next
    /// poll; queries keep working.
    pub fn terminate(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// Create a new entity, returning its assigned id. The change-marker
    /// key is stripped from the stored property set.
    pub fn create_entity(
        &self,
        kind: &str,
        value: &str,
        context: &str,
        properties: &FxHashMap<String, String>,
    ) -> i64 {
        let mut inner = self.inner.write();
        let next = inner.next_id.entry(kind.to_string()).or_insert(0);
        *next += 1;
        let id = *next;
        let mut props = properties.clone();
        props.remove(CHANGE_MARKER);
        inner.entities.entry(kind.to_string()).or_default().insert(
            id,
            StoredEntity {
                value: value.to_string(),
                context: context.to_string(),
                version: 1,
                properties: props,
            },
        );
        id
    }

    /// A detached copy of one entity without its relations.
    #[must_use]
    pub fn get(&self, kind: &str, id: i64) -> Option<Entity> {
        self.inner.read().shallow(kind, id)
    }

    /// Smallest-id entity of the given kind with the given value.
    #[must_use]
    pub fn match_by_value(&self, kind: &str, value: &str) -> Option<i64> {
        let inner = self.inner.read();
        inner
            .entities
            .get(kind)?
            .iter()
            .find(|(_, e)| e.value == value)
            .map(|(id, _)| *id)
    }

    /// Merge a value and property set into an existing entity.
    ///
    /// Returns the sorted list of changed field keys (`"Value"` for the
    /// value field, bare keys for properties). The version is bumped only
    /// when something actually changed. An empty inbound value means
    /// "unspecified" and never overwrites.
    pub fn merge(
        &self,
        kind: &str,
        id: i64,
        value: Option<&str>,
        properties: &FxHashMap<String, String>,
    ) -> Result<Vec<String>, StoreError> {
        let mut inner = self.inner.write();
        let stored = inner
            .entities
            .get_mut(kind)
            .and_then(|m| m.get_mut(&id))
            .ok_or_else(|| StoreError::EntityNotFound {
                kind: kind.to_string(),
                id,
            })?;
        let mut changed = Vec::new();
        if let Some(v) = value {
            if !v.is_empty() && stored.value != v {
                stored.value = v.to_string();
                changed.push("Value".to_string());
            }
        }
        for (k, v) in properties {
            if k == CHANGE_MARKER {
                continue;
            }
            if stored.properties.get(k).map(String::as_str) != Some(v.as_str()) {
                stored.properties.insert(k.clone(), v.clone());
                changed.push(k.clone());
            }
        }
        if !changed.is_empty() {
            stored.version += 1;
            changed.sort();
        }
        Ok(changed)
    }

    /// Overwrite a single property, bumping the version.
    pub fn set_property(
        &self,
        kind: &str,
        id: i64,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let stored = inner
            .entities
            .get_mut(kind)
            .and_then(|m| m.get_mut(&id))
            .ok_or_else(|| StoreError::EntityNotFound {
                kind: kind.to_string(),
                id,
            })?;
        stored.properties.insert(key.to_string(), value.to_string());
        stored.version += 1;
        Ok(())
    }

    /// Atomically replace a property value if it currently equals
    /// `expected`. Returns whether the swap happened. This is the job-claim
    /// primitive.
    pub fn compare_and_set_property(
        &self,
        kind: &str,
        id: i64,
        key: &str,
        expected: &str,
        value: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        let stored = inner
            .entities
            .get_mut(kind)
            .and_then(|m| m.get_mut(&id))
            .ok_or_else(|| StoreError::EntityNotFound {
                kind: kind.to_string(),
                id,
            })?;
        if stored.properties.get(key).map(String::as_str) != Some(expected) {
            return Ok(false);
        }
        stored.properties.insert(key.to_string(), value.to_string());
        stored.version += 1;
        Ok(true)
    }

    /// Create a directed relation. Duplicate edges are ignored. Linking is
    /// version-neutral: only the mapper decides when a new edge counts as a
    /// data delta for the child endpoint (see [`Self::bump_version`]).
    ///
    /// Returns whether a relation was created.
    pub fn link(
        &self,
        parent: (&str, i64),
        child: (&str, i64),
        context: &str,
        properties: &FxHashMap<String, String>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        for (kind, id) in [parent, child] {
            if inner.entities.get(kind).map_or(true, |m| !m.contains_key(&id)) {
                return Err(StoreError::EntityNotFound {
                    kind: kind.to_string(),
                    id,
                });
            }
        }
        let pkey = (parent.0.to_string(), parent.1);
        let exists = inner
            .children
            .get(&pkey)
            .is_some_and(|edges| edges.iter().any(|e| e.kind == child.0 && e.id == child.1));
        if exists {
            return Ok(false);
        }
        let mut props = properties.clone();
        props.remove(CHANGE_MARKER);
        inner.children.entry(pkey).or_default().push(Edge {
            kind: child.0.to_string(),
            id: child.1,
            context: context.to_string(),
            properties: props.clone(),
        });
        inner
            .parents
            .entry((child.0.to_string(), child.1))
            .or_default()
            .push(Edge {
                kind: parent.0.to_string(),
                id: parent.1,
                context: context.to_string(),
                properties: props,
            });
        Ok(true)
    }

    /// Advance an entity's revision counter. Used by the mapper when a new
    /// relation makes the child endpoint part of a data delta.
    pub fn bump_version(&self, kind: &str, id: i64) {
        let mut inner = self.inner.write();
        if let Some(e) = inner.entities.get_mut(kind).and_then(|m| m.get_mut(&id)) {
            e.version += 1;
        }
    }

    /// Remove a directed relation. Returns whether one existed.
    pub fn unlink(&self, parent: (&str, i64), child: (&str, i64)) -> bool {
        let mut inner = self.inner.write();
        let pkey = (parent.0.to_string(), parent.1);
        let mut removed = false;
        if let Some(edges) = inner.children.get_mut(&pkey) {
            let before = edges.len();
            edges.retain(|e| !(e.kind == child.0 && e.id == child.1));
            removed = edges.len() != before;
        }
        if let Some(edges) = inner.parents.get_mut(&(child.0.to_string(), child.1)) {
            edges.retain(|e| !(e.kind == parent.0 && e.id == parent.1));
        }
        removed
    }

    /// Remove an entity together with all relations touching it.
    pub fn remove_entity(&self, kind: &str, id: i64) {
        let mut inner = self.inner.write();
        if let Some(m) = inner.entities.get_mut(kind) {
            m.remove(&id);
        }
        let key = (kind.to_string(), id);
        let child_edges = inner.children.remove(&key).unwrap_or_default();
        for edge in child_edges {
            if let Some(edges) = inner.parents.get_mut(&(edge.kind.clone(), edge.id)) {
                edges.retain(|e| !(e.kind == kind && e.id == id));
            }
        }
        let parent_edges = inner.parents.remove(&key).unwrap_or_default();
        for edge in parent_edges {
            if let Some(edges) = inner.children.get_mut(&(edge.kind.clone(), edge.id)) {
                edges.retain(|e| !(e.kind == kind && e.id == id));
            }
        }
    }

    /// A detached copy of one entity with every descendant expanded.
    /// Cycles are cut by a visited set.
    #[must_use]
    pub fn subtree(&self, kind: &str, id: i64) -> Option<Entity> {
        let inner = self.inner.read();
        let mut visited = FxHashSet::default();
        expand(&inner, kind, id, &mut visited)
    }
}

fn expand(
    inner: &Inner,
    kind: &str,
    id: i64,
    visited: &mut FxHashSet<(String, i64)>,
) -> Option<Entity> {
    if !visited.insert((kind.to_string(), id)) {
        return None;
    }
    let mut node = inner.shallow(kind, id)?;
    if let Some(edges) = inner.children.get(&(kind.to_string(), id)) {
        for edge in edges {
            if let Some(child) = expand(inner, &edge.kind, edge.id, visited) {
                node.children.push(Relation {
                    context: edge.context.clone(),
                    properties: edge.properties.clone(),
                    target: child,
                });
            }
        }
    }
    Some(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> FxHashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn ids_are_assigned_per_kind() {
        let store = GraphStore::new();
        assert_eq!(store.create_entity("Alpha", "a", "Data", &props(&[])), 1);
        assert_eq!(store.create_entity("Alpha", "b", "Data", &props(&[])), 2);
        assert_eq!(store.create_entity("Beta", "c", "Data", &props(&[])), 1);
    }

    #[test]
    fn merge_reports_changed_keys_and_bumps_version() {
        let store = GraphStore::new();
        let id = store.create_entity("Alpha", "a", "Data", &props(&[("X", "1")]));
        assert_eq!(store.get("Alpha", id).unwrap().version, 1);

        let changed = store
            .merge("Alpha", id, Some("a"), &props(&[("X", "1")]))
            .unwrap();
        assert!(changed.is_empty());
        assert_eq!(store.get("Alpha", id).unwrap().version, 1);

        let changed = store
            .merge("Alpha", id, Some("b"), &props(&[("X", "2"), ("Y", "3")]))
            .unwrap();
        assert_eq!(changed, vec!["Value", "X", "Y"]);
        let e = store.get("Alpha", id).unwrap();
        assert_eq!(e.version, 2);
        assert_eq!(e.value, "b");
    }

    #[test]
    fn link_is_idempotent_and_version_neutral() {
        let store = GraphStore::new();
        let p = store.create_entity("Bucket", "b", "Data", &props(&[]));
        let c = store.create_entity("Item", "i", "Data", &props(&[]));
        assert!(store.link(("Bucket", p), ("Item", c), "Data", &props(&[])).unwrap());
        assert!(!store.link(("Bucket", p), ("Item", c), "Data", &props(&[])).unwrap());
        assert_eq!(store.get("Item", c).unwrap().version, 1);
    }

    #[test]
    fn unlink_removes_the_edge() {
        let store = GraphStore::new();
        let p = store.create_entity("Bucket", "b", "Data", &props(&[]));
        let c = store.create_entity("Item", "i", "Data", &props(&[]));
        store.link(("Bucket", p), ("Item", c), "Data", &props(&[])).unwrap();
        assert!(store.unlink(("Bucket", p), ("Item", c)));
        assert!(!store.unlink(("Bucket", p), ("Item", c)));
        assert!(store.subtree("Bucket", p).unwrap().children.is_empty());
    }

    #[test]
    fn compare_and_set_property_is_single_winner() {
        let store = GraphStore::new();
        let id = store.create_entity("Job", "j", "System", &props(&[("State", "Open")]));
        assert!(store
            .compare_and_set_property("Job", id, "State", "Open", "Assigned")
            .unwrap());
        assert!(!store
            .compare_and_set_property("Job", id, "State", "Open", "Assigned")
            .unwrap());
        assert_eq!(
            store.get("Job", id).unwrap().properties.get("State").unwrap(),
            "Assigned"
        );
    }

    #[test]
    fn subtree_expands_descendants() {
        let store = GraphStore::new();
        let a = store.create_entity("A", "a", "Data", &props(&[]));
        let b = store.create_entity("B", "b", "Data", &props(&[]));
        let c = store.create_entity("C", "c", "Data", &props(&[]));
        store.link(("A", a), ("B", b), "Data", &props(&[])).unwrap();
        store.link(("B", b), ("C", c), "Data", &props(&[])).unwrap();
        let tree = store.subtree("A", a).unwrap();
        assert_eq!(tree.children[0].target.kind, "B");
        assert_eq!(tree.children[0].target.children[0].target.kind, "C");
    }

    #[test]
    fn remove_entity_detaches_relations() {
        let store = GraphStore::new();
        let a = store.create_entity("A", "a", "Data", &props(&[]));
        let b = store.create_entity("B", "b", "Data", &props(&[]));
        store.link(("A", a), ("B", b), "Data", &props(&[])).unwrap();
        store.remove_entity("B", b);
        let tree = store.subtree("A", a).unwrap();
        assert!(tree.children.is_empty());
    }
}
