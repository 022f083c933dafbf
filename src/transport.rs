//! Transport representation of graph data.
//!
//! Everything that crosses the store boundary — user payloads, mapper
//! results, query results, job inputs — travels as an [`Entity`] tree.
//! A transport tree is a detached, owned copy: mutating it never touches
//! the store, and cloning it yields a fully independent sub-graph.
//!
//! # ID sentinels
//!
//! Inbound transport nodes use negative IDs to select mapper behaviour:
//!
//! - [`ID_CREATE`]: create a new entity
//! - [`ID_MATCH_OR_CREATE`]: match an existing entity by `(kind, value)`,
//!   create one if none exists (this is also the semantics of `id = 0`,
//!   the common "I don't know the id" case)
//! - [`ID_FORCE_CREATE`]: always create, even if an identical entity exists
//!
//! # Change markers
//!
//! The mapper annotates the copy it returns with a change marker under the
//! [`CHANGE_MARKER`] property key: the empty string for newly created
//! entities and relations, a comma-separated list of changed field keys for
//! updates. Markers exist only on mapper output; they are never persisted,
//! so query results are always marker-free.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Mapper directive: create a new entity.
pub const ID_CREATE: i64 = -1;
/// Mapper directive: match by `(kind, value)`, else create.
pub const ID_MATCH_OR_CREATE: i64 = -2;
/// Mapper directive: create unconditionally.
pub const ID_FORCE_CREATE: i64 = -3;

/// Property key carrying the change marker on mapper output.
pub const CHANGE_MARKER: &str = "Changed";

/// Context stamped on registration-time entities.
pub const CONTEXT_SYSTEM: &str = "System";
/// Context stamped on user payload entities.
pub const CONTEXT_DATA: &str = "Data";

/// A typed node of a transport sub-graph.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub kind: String,
    pub id: i64,
    pub value: String,
    pub context: String,
    /// Store-maintained revision counter; 0 on unmapped inbound data.
    pub version: u32,
    pub properties: FxHashMap<String, String>,
    pub children: Vec<Relation>,
    pub parents: Vec<Relation>,
}

/// A directed relation hanging off an [`Entity`].
///
/// The direction is implied by the containing collection: entries of
/// [`Entity::children`] point at targets below the owner, entries of
/// [`Entity::parents`] at targets above it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub context: String,
    pub properties: FxHashMap<String, String>,
    pub target: Entity,
}

impl Entity {
    /// A bare entity of the given kind with match-or-create semantics.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: ID_MATCH_OR_CREATE,
            ..Default::default()
        }
    }

    /// Builder-style value assignment.
    #[must_use]
    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = value.into();
        self
    }

    /// Builder-style ID assignment.
    #[must_use]
    pub fn with_id(mut self, id: i64) -> Self {
        self.id = id;
        self
    }

    /// Builder-style context assignment.
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    /// Builder-style property assignment.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Builder-style child attachment (bare relation).
    #[must_use]
    pub fn with_child(mut self, child: Entity) -> Self {
        self.children.push(Relation {
            target: child,
            ..Default::default()
        });
        self
    }

    /// The change marker, if the mapper attached one to this node.
    #[must_use]
    pub fn marker(&self) -> Option<&str> {
        self.properties.get(CHANGE_MARKER).map(String::as_str)
    }

    /// Pre-order walk over this node, its children and its parents.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Entity)) {
        f(self);
        for rel in &self.children {
            rel.target.walk(f);
        }
        for rel in &self.parents {
            rel.target.walk(f);
        }
    }

    /// Whether `(kind, id)` occurs anywhere in this sub-graph.
    #[must_use]
    pub fn contains(&self, kind: &str, id: i64) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if e.kind == kind && e.id == id {
                found = true;
            }
        });
        found
    }

    /// First pre-order occurrence of a stored entity of the given kind.
    #[must_use]
    pub fn first_of_kind(&self, kind: &str) -> Option<&Entity> {
        let mut found: Option<&Entity> = None;
        self.walk(&mut |e| {
            if found.is_none() && e.kind == kind && e.id > 0 {
                found = Some(e);
            }
        });
        found
    }
}

impl Relation {
    /// The change marker, if the mapper attached one to this relation.
    #[must_use]
    pub fn marker(&self) -> Option<&str> {
        self.properties.get(CHANGE_MARKER).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_assembles_tree() {
        let e = Entity::new("Alpha")
            .with_value("a1")
            .with_property("Transport", "secure")
            .with_child(Entity::new("Beta").with_value("b1"));
        assert_eq!(e.kind, "Alpha");
        assert_eq!(e.id, ID_MATCH_OR_CREATE);
        assert_eq!(e.children.len(), 1);
        assert_eq!(e.children[0].target.value, "b1");
    }

    #[test]
    fn walk_visits_children_and_parents() {
        let mut e = Entity::new("A").with_child(Entity::new("B"));
        e.parents.push(Relation {
            target: Entity::new("C"),
            ..Default::default()
        });
        let mut kinds = Vec::new();
        e.walk(&mut |n| kinds.push(n.kind.clone()));
        assert_eq!(kinds, vec!["A", "B", "C"]);
    }

    #[test]
    fn contains_needs_matching_id() {
        let e = Entity::new("A").with_id(3).with_child(Entity::new("B").with_id(7));
        assert!(e.contains("B", 7));
        assert!(!e.contains("B", 8));
    }

    #[test]
    fn first_of_kind_skips_unmapped_nodes() {
        let e = Entity::new("A")
            .with_child(Entity::new("B"))
            .with_child(Entity::new("B").with_id(4));
        assert_eq!(e.first_of_kind("B").map(|b| b.id), Some(4));
    }
}
