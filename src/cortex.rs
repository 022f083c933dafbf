//! Action registry.
//!
//! Actions are registered by name; dispatch is a plain map lookup from
//! name to constructor. An action exposes exactly two capabilities: its
//! dependency configuration and an execute entry point — there is no
//! inheritance surface beyond that.
//!
//! Registration maps the action's configuration sub-graph into the store
//! and maintains two reverse indexes so the scheduler can discover
//! candidate actions in O(1) per change tag:
//!
//! - `DependencyEntityLookup`: entity kind -> dependencies mentioning it
//! - `DependencyRelationLookup`: `"ParentKind-ChildKind"` -> dependencies
//!
//! Re-registering a name removes the previous configuration sub-graph and
//! returns the old dependency ids so the caller can invalidate the
//! compiled-pattern cache.

use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use tracing::debug;

use crate::store::{mapper::Mapper, GraphStore, StoreError};
use crate::transport::{Entity, Relation, CONTEXT_SYSTEM, ID_MATCH_OR_CREATE};

/// Errors an action's `execute` may surface to its worker.
#[derive(Debug, Error, Diagnostic)]
pub enum ActionError {
    /// The job input is missing data the action needs.
    #[error("missing expected input: {what}")]
    #[diagnostic(
        code(reflexgraph::action::missing_input),
        help("Check the dependency pattern against what the action reads.")
    )]
    MissingInput { what: &'static str },

    /// Domain-level failure.
    #[error("action failed: {0}")]
    #[diagnostic(code(reflexgraph::action::failed))]
    Failed(String),

    /// JSON (de)serialisation error while handling the input payload.
    #[error(transparent)]
    #[diagnostic(code(reflexgraph::action::serde_json))]
    Serde(#[from] serde_json::Error),
}

/// A registered unit of computation.
///
/// `config` returns the `Action` sub-graph built with
/// [`crate::config::ActionConfig`]; `execute` runs on one concrete,
/// demultiplexed input and may return output sub-graphs that re-enter the
/// mapper, closing the reactive loop.
#[async_trait]
pub trait Action: Send + Sync {
    fn config(&self) -> Entity;

    async fn execute(
        &self,
        input: Entity,
        dependency: &str,
        context: &str,
        job_id: i64,
    ) -> Result<Vec<Entity>, ActionError>;
}

/// Constructor registered per action name.
pub type ActionFactory = Arc<dyn Fn() -> Box<dyn Action> + Send + Sync>;

/// Errors surfaced by the registry.
#[derive(Debug, Error, Diagnostic)]
pub enum CortexError {
    #[error("unknown action: {name}")]
    #[diagnostic(code(reflexgraph::cortex::unknown_action))]
    UnknownAction { name: String },

    #[error("action config for {name} carries no dependency")]
    #[diagnostic(
        code(reflexgraph::cortex::empty_config),
        help("Add at least one dependency via ActionConfig::dependency.")
    )]
    EmptyConfig { name: String },

    #[error(transparent)]
    #[diagnostic(code(reflexgraph::cortex::store))]
    Store(#[from] StoreError),
}

#[derive(Default)]
struct CortexInner {
    factories: FxHashMap<String, ActionFactory>,
    /// Mapped configuration trees with store-assigned ids, per action.
    configs: FxHashMap<String, Entity>,
}

/// The action registry, shared between scheduler and workers.
pub struct Cortex {
    store: GraphStore,
    mapper: Mapper,
    inner: RwLock<CortexInner>,
}

impl Cortex {
    #[must_use]
    pub fn new(store: GraphStore, mapper: Mapper) -> Self {
        Self {
            store,
            mapper,
            inner: RwLock::new(CortexInner::default()),
        }
    }

    /// Register (or re-register) an action.
    ///
    /// Maps the configuration into the store and refreshes the reverse
    /// indexes. Returns the dependency ids of a previous registration so
    /// the caller can invalidate compiled patterns; empty on first
    /// registration.
    pub fn register(&self, name: &str, factory: ActionFactory) -> Result<Vec<i64>, CortexError> {
        let config = factory().config();
        let previous = {
            let inner = self.inner.read();
            inner.configs.get(name).cloned()
        };
        let mut stale_dep_ids = Vec::new();
        if let Some(old) = previous {
            stale_dep_ids = dependency_ids(&old);
            self.remove_config(&old);
        }

        let mapped = self.mapper.map_with_context(&config, CONTEXT_SYSTEM);
        let deps: Vec<&Entity> = mapped
            .children
            .iter()
            .map(|r| &r.target)
            .filter(|e| e.kind == "Dependency")
            .collect();
        if deps.is_empty() {
            return Err(CortexError::EmptyConfig {
                name: name.to_string(),
            });
        }
        for dep in &deps {
            self.index_dependency(dep)?;
        }
        debug!(action = name, dependencies = deps.len(), "action registered");

        let mut inner = self.inner.write();
        inner.factories.insert(name.to_string(), factory);
        inner.configs.insert(name.to_string(), mapped);
        Ok(stale_dep_ids)
    }

    /// Instantiate a registered action.
    pub fn action(&self, name: &str) -> Result<Box<dyn Action>, CortexError> {
        let inner = self.inner.read();
        let factory = inner
            .factories
            .get(name)
            .ok_or_else(|| CortexError::UnknownAction {
                name: name.to_string(),
            })?;
        Ok(factory())
    }

    /// The mapped `Dependency` sub-graph of a registered action, by name.
    #[must_use]
    pub fn dependency(&self, action: &str, dependency: &str) -> Option<Entity> {
        let inner = self.inner.read();
        let config = inner.configs.get(action)?;
        config
            .children
            .iter()
            .map(|r| &r.target)
            .find(|e| e.kind == "Dependency" && e.value == dependency)
            .cloned()
    }

    /// Names of all registered actions, unordered.
    #[must_use]
    pub fn action_names(&self) -> Vec<String> {
        self.inner.read().factories.keys().cloned().collect()
    }

    /// Build both reverse indexes for one mapped dependency tree.
    fn index_dependency(&self, dependency: &Entity) -> Result<(), CortexError> {
        let Some(root) = dependency.children.first().map(|r| &r.target) else {
            return Ok(());
        };
        let mut kinds = Vec::new();
        let mut signatures = Vec::new();
        let mut seen_kinds = FxHashSet::default();
        let mut seen_sigs = FxHashSet::default();
        collect_structure_index(root, &mut kinds, &mut signatures, &mut seen_kinds, &mut seen_sigs);

        for kind in kinds {
            self.map_lookup("DependencyEntityLookup", &kind, dependency.id);
        }
        for signature in signatures {
            self.map_lookup("DependencyRelationLookup", &signature, dependency.id);
        }
        Ok(())
    }

    fn map_lookup(&self, lookup_kind: &str, value: &str, dep_id: i64) {
        let mut lookup = Entity {
            kind: lookup_kind.to_string(),
            id: ID_MATCH_OR_CREATE,
            value: value.to_string(),
            context: CONTEXT_SYSTEM.to_string(),
            ..Default::default()
        };
        lookup.children.push(Relation {
            context: CONTEXT_SYSTEM.to_string(),
            target: Entity {
                kind: "Dependency".to_string(),
                id: dep_id,
                ..Default::default()
            },
            ..Default::default()
        });
        self.mapper.map_with_context(&lookup, CONTEXT_SYSTEM);
    }

    /// Remove a previously mapped configuration sub-graph from the store.
    fn remove_config(&self, config: &Entity) {
        let mut targets = Vec::new();
        config.walk(&mut |e| {
            if e.id > 0
                && matches!(e.kind.as_str(), "Action" | "Category" | "Dependency" | "Structure")
            {
                targets.push((e.kind.clone(), e.id));
            }
        });
        for (kind, id) in targets {
            self.store.remove_entity(&kind, id);
        }
    }
}

fn dependency_ids(config: &Entity) -> Vec<i64> {
    config
        .children
        .iter()
        .map(|r| &r.target)
        .filter(|e| e.kind == "Dependency")
        .map(|e| e.id)
        .collect()
}

/// Collect entity kinds and parent-child relation signatures from a mapped
/// structure tree, deduplicated in encounter order.
fn collect_structure_index(
    node: &Entity,
    kinds: &mut Vec<String>,
    signatures: &mut Vec<String>,
    seen_kinds: &mut FxHashSet<String>,
    seen_sigs: &mut FxHashSet<String>,
) {
    if seen_kinds.insert(node.value.clone()) {
        kinds.push(node.value.clone());
    }
    for rel in &node.children {
        let signature = format!("{}-{}", node.value, rel.target.value);
        if seen_sigs.insert(signature.clone()) {
            signatures.push(signature);
        }
        collect_structure_index(&rel.target, kinds, signatures, seen_kinds, seen_sigs);
    }
    for rel in &node.parents {
        let signature = format!("{}-{}", rel.target.value, node.value);
        if seen_sigs.insert(signature.clone()) {
            signatures.push(signature);
        }
        collect_structure_index(&rel.target, kinds, signatures, seen_kinds, seen_sigs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ActionConfig, Mode, Priority, Structure};
    use crate::store::Query;

    struct Noop;

    #[async_trait]
    impl Action for Noop {
        fn config(&self) -> Entity {
            ActionConfig::new("noop")
                .category("test")
                .dependency(
                    "chain",
                    Structure::new("Alpha").child(
                        Structure::new("Beta").priority(Priority::Primary).mode(Mode::Match),
                    ),
                )
                .build()
        }

        async fn execute(
            &self,
            _input: Entity,
            _dependency: &str,
            _context: &str,
            _job_id: i64,
        ) -> Result<Vec<Entity>, ActionError> {
            Ok(Vec::new())
        }
    }

    fn setup() -> (GraphStore, Cortex) {
        let store = GraphStore::new();
        let mapper = Mapper::new(store.clone());
        let cortex = Cortex::new(store.clone(), mapper);
        (store, cortex)
    }

    fn factory() -> ActionFactory {
        Arc::new(|| Box::new(Noop))
    }

    #[test]
    fn register_maps_config_and_lookups() {
        let (store, cortex) = setup();
        let stale = cortex.register("noop", factory()).unwrap();
        assert!(stale.is_empty());

        let lookups = store
            .query(
                &Query::read("DependencyEntityLookup")
                    .match_("Value", "==", "Beta")
                    .to(Query::read("Dependency")),
            )
            .unwrap();
        assert_eq!(lookups.amount, 1);
        assert_eq!(lookups.entities[0].children[0].target.value, "chain");

        let relations = store
            .query(&Query::read("DependencyRelationLookup").match_("Value", "==", "Alpha-Beta"))
            .unwrap();
        assert_eq!(relations.amount, 1);
    }

    #[test]
    fn dependency_returns_mapped_tree() {
        let (_, cortex) = setup();
        cortex.register("noop", factory()).unwrap();
        let dep = cortex.dependency("noop", "chain").unwrap();
        assert!(dep.id > 0);
        assert_eq!(dep.children[0].target.value, "Alpha");
        assert_eq!(dep.children[0].target.children[0].target.value, "Beta");
        assert!(cortex.dependency("noop", "missing").is_none());
    }

    #[test]
    fn reregistration_returns_stale_dependency_ids() {
        let (store, cortex) = setup();
        cortex.register("noop", factory()).unwrap();
        let old_dep = cortex.dependency("noop", "chain").unwrap();
        let stale = cortex.register("noop", factory()).unwrap();
        assert_eq!(stale, vec![old_dep.id]);
        // old dependency entity is gone from the store
        assert!(store.get("Dependency", old_dep.id).is_none());
        assert!(cortex.dependency("noop", "chain").is_some());
    }

    #[test]
    fn unknown_action_errors() {
        let (_, cortex) = setup();
        assert!(matches!(
            cortex.action("ghost"),
            Err(CortexError::UnknownAction { .. })
        ));
    }
}
