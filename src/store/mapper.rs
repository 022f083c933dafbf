//! The tagging mapper.
//!
//! [`Mapper::map_with_context`] merges an inbound transport sub-graph into
//! the store and returns a detached copy in which every created or updated
//! node carries a change marker: the empty string for newly created
//! entities and relations, a comma-separated (sorted) list of changed field
//! keys for updates. Nothing changed means no marker — re-applying an
//! identical payload yields an unmarked copy.
//!
//! Markers live only on the returned copy; the store itself stays
//! marker-free.

use rustc_hash::FxHashMap;
use tracing::{error, warn};

use crate::transport::{Entity, Relation, CHANGE_MARKER, CONTEXT_DATA, ID_MATCH_OR_CREATE};

use super::GraphStore;

/// Merges transport data into a [`GraphStore`] and tags the deltas.
#[derive(Clone)]
pub struct Mapper {
    store: GraphStore,
}

impl Mapper {
    #[must_use]
    pub fn new(store: GraphStore) -> Self {
        Self { store }
    }

    /// Merge with the default `"Data"` context.
    pub fn map(&self, entity: &Entity) -> Entity {
        self.map_with_context(entity, CONTEXT_DATA)
    }

    /// Merge a sub-graph, stamping `context` on nodes that do not carry
    /// their own, and return the tagged copy.
    pub fn map_with_context(&self, entity: &Entity, context: &str) -> Entity {
        self.map_node(entity, context)
    }

    fn map_node(&self, e: &Entity, ctx: &str) -> Entity {
        let node_ctx = if e.context.is_empty() { ctx } else { e.context.as_str() };
        let (id, created) = self.resolve(e, node_ctx);

        let marker = if created {
            Some(String::new())
        } else {
            match self.store.merge(&e.kind, id, Some(&e.value), &e.properties) {
                Ok(changed) if !changed.is_empty() => Some(changed.join(",")),
                Ok(_) => None,
                Err(err) => {
                    error!(kind = %e.kind, id, %err, "mapper merge failed");
                    None
                }
            }
        };

        let mut children = Vec::with_capacity(e.children.len());
        for rel in &e.children {
            let mut child = self.map_node(&rel.target, ctx);
            let rel_ctx = if rel.context.is_empty() { ctx } else { rel.context.as_str() };
            let mut rel_props = rel.properties.clone();
            rel_props.remove(CHANGE_MARKER);
            match self
                .store
                .link((&e.kind, id), (&child.kind, child.id), rel_ctx, &rel_props)
            {
                Ok(true) => {
                    // new edge: mark the relation and advance the child
                    // endpoint, which is the delta-bearing side
                    rel_props.insert(CHANGE_MARKER.to_string(), String::new());
                    self.store.bump_version(&child.kind, child.id);
                    if let Some(current) = self.store.get(&child.kind, child.id) {
                        child.version = current.version;
                    }
                }
                Ok(false) => {}
                Err(err) => {
                    error!(parent = %e.kind, child = %child.kind, %err, "mapper link failed");
                }
            }
            children.push(Relation {
                context: rel_ctx.to_string(),
                properties: rel_props,
                target: child,
            });
        }

        let mut parents = Vec::with_capacity(e.parents.len());
        for rel in &e.parents {
            let parent = self.map_node(&rel.target, ctx);
            let rel_ctx = if rel.context.is_empty() { ctx } else { rel.context.as_str() };
            let mut rel_props = rel.properties.clone();
            rel_props.remove(CHANGE_MARKER);
            match self
                .store
                .link((&parent.kind, parent.id), (&e.kind, id), rel_ctx, &rel_props)
            {
                Ok(true) => {
                    rel_props.insert(CHANGE_MARKER.to_string(), String::new());
                    self.store.bump_version(&e.kind, id);
                }
                Ok(false) => {}
                Err(err) => {
                    error!(parent = %parent.kind, child = %e.kind, %err, "mapper link failed");
                }
            }
            parents.push(Relation {
                context: rel_ctx.to_string(),
                properties: rel_props,
                target: parent,
            });
        }

        let mut node = self
            .store
            .get(&e.kind, id)
            .unwrap_or_else(|| Entity::new(&e.kind).with_id(id));
        if let Some(marker) = marker {
            node.properties.insert(CHANGE_MARKER.to_string(), marker);
        }
        node.children = children;
        node.parents = parents;
        node
    }

    /// Resolve an inbound node to a stored entity id per its ID sentinel.
    /// Returns `(id, created)`.
    fn resolve(&self, e: &Entity, ctx: &str) -> (i64, bool) {
        let props = strip_marker(&e.properties);
        if e.id > 0 {
            if self.store.get(&e.kind, e.id).is_some() {
                return (e.id, false);
            }
            warn!(kind = %e.kind, id = e.id, "mapped id not found, creating fresh entity");
            return (self.store.create_entity(&e.kind, &e.value, ctx, &props), true);
        }
        if e.id == 0 || e.id == ID_MATCH_OR_CREATE {
            if let Some(id) = self.store.match_by_value(&e.kind, &e.value) {
                return (id, false);
            }
        }
        // ID_CREATE, ID_FORCE_CREATE, or no match
        (self.store.create_entity(&e.kind, &e.value, ctx, &props), true)
    }
}

fn strip_marker(props: &FxHashMap<String, String>) -> FxHashMap<String, String> {
    let mut out = props.clone();
    out.remove(CHANGE_MARKER);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ID_FORCE_CREATE;

    fn setup() -> (GraphStore, Mapper) {
        let store = GraphStore::new();
        let mapper = Mapper::new(store.clone());
        (store, mapper)
    }

    #[test]
    fn create_tags_empty_marker() {
        let (_, mapper) = setup();
        let mapped = mapper.map(&Entity::new("Alpha").with_value("a1"));
        assert!(mapped.id > 0);
        assert_eq!(mapped.marker(), Some(""));
        assert_eq!(mapped.context, "Data");
    }

    #[test]
    fn identical_remap_matches_without_marker() {
        let (_, mapper) = setup();
        let first = mapper.map(&Entity::new("Alpha").with_value("a1"));
        let second = mapper.map(&Entity::new("Alpha").with_value("a1"));
        assert_eq!(first.id, second.id);
        assert_eq!(second.marker(), None);
        assert_eq!(second.version, first.version);
    }

    #[test]
    fn update_lists_changed_keys() {
        let (_, mapper) = setup();
        let first = mapper.map(&Entity::new("Delta").with_value("protoX").with_property("Transport", "plain"));
        let second = mapper.map(
            &Entity::new("Delta")
                .with_id(first.id)
                .with_property("Transport", "secure")
                .with_property("Tag", "x"),
        );
        assert_eq!(second.marker(), Some("Tag,Transport"));
        assert_eq!(second.version, first.version + 1);
    }

    #[test]
    fn new_relation_marks_the_relation_only() {
        let (_, mapper) = setup();
        let bucket = mapper.map(&Entity::new("Bucket").with_value("B-1"));
        let mapped = mapper.map(
            &Entity::new("Bucket")
                .with_id(bucket.id)
                .with_child(Entity::new("Item").with_value("I-1")),
        );
        assert_eq!(mapped.marker(), None);
        assert_eq!(mapped.children[0].marker(), Some(""));
        assert_eq!(mapped.children[0].target.marker(), Some(""));
        // created at 1, bumped by the new edge
        assert_eq!(mapped.children[0].target.version, 2);

        // remapping the same edge leaves everything unmarked
        let again = mapper.map(
            &Entity::new("Bucket")
                .with_id(bucket.id)
                .with_child(Entity::new("Item").with_value("I-1")),
        );
        assert_eq!(again.children[0].marker(), None);
        assert_eq!(again.children[0].target.marker(), None);
    }

    #[test]
    fn markers_are_never_persisted() {
        let (store, mapper) = setup();
        let mapped = mapper.map(&Entity::new("Alpha").with_value("a1"));
        let stored = store.get("Alpha", mapped.id).unwrap();
        assert!(!stored.properties.contains_key(CHANGE_MARKER));
    }

    #[test]
    fn force_create_duplicates() {
        let (_, mapper) = setup();
        let first = mapper.map(&Entity::new("Job").with_id(ID_FORCE_CREATE).with_value("j"));
        let second = mapper.map(&Entity::new("Job").with_id(ID_FORCE_CREATE).with_value("j"));
        assert_ne!(first.id, second.id);
        assert_eq!(second.marker(), Some(""));
    }

    #[test]
    fn parent_relations_are_merged() {
        let (store, mapper) = setup();
        let mut child = Entity::new("Structure").with_value("Beta");
        child.parents.push(Relation {
            target: Entity::new("Structure").with_value("Alpha"),
            ..Default::default()
        });
        let mapped = mapper.map_with_context(&child, "System");
        assert_eq!(mapped.parents.len(), 1);
        let parent = &mapped.parents[0].target;
        let tree = store.subtree("Structure", parent.id).unwrap();
        assert_eq!(tree.children[0].target.value, "Beta");
    }
}
