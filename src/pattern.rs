//! Pattern compiler and cache.
//!
//! Dependency trees live in the store as `Structure` entities; the
//! scheduler consults them constantly. [`PatternCache`] compiles each
//! `(action, dependency)` once into a [`PatternNode`] tree — alias, kind,
//! mode, priority, filters, normalised `Properties.<K>` filter keys and
//! deterministically ordered children — and memoises it keyed by
//! `action|depID`. Re-registration invalidates exactly one entry.
//!
//! Child ordering is canonical: aliased children sort before unaliased
//! ones, then by alias, then by kind, with the authoring index as the
//! final tie-break. Compilation is pure, so job fingerprints do not depend
//! on authoring order.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{trace, warn};

use crate::config::{Mode, Priority};
use crate::transport::Entity;

/// One named filter of a pattern node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterSpec {
    pub field: String,
    pub operator: String,
    pub value: String,
}

/// A compiled node of a dependency pattern.
#[derive(Clone, Debug, PartialEq)]
pub struct PatternNode {
    pub alias: String,
    pub kind: String,
    pub mode: Mode,
    pub priority: Priority,
    /// name -> filter triple, iteration-ordered by name.
    pub filters: BTreeMap<String, FilterSpec>,
    /// `Properties.<K>` filter fields by their bare key `K`, for cheap
    /// relevance checks against change-marker keys.
    pub normalized_filter_fields: BTreeMap<String, String>,
    pub children: Vec<PatternNode>,
}

impl PatternNode {
    /// Whether any node in this pattern requires the given entity kind.
    #[must_use]
    pub fn contains_kind(&self, kind: &str) -> bool {
        self.kind == kind || self.children.iter().any(|c| c.contains_kind(kind))
    }

    /// All filter fields of the pattern, raw and normalised, for the
    /// update-relevance check.
    #[must_use]
    pub fn filter_fields(&self) -> FxHashSet<String> {
        let mut fields = FxHashSet::default();
        self.collect_filter_fields(&mut fields);
        fields
    }

    fn collect_filter_fields(&self, fields: &mut FxHashSet<String>) {
        for spec in self.filters.values() {
            fields.insert(spec.field.clone());
        }
        for key in self.normalized_filter_fields.keys() {
            fields.insert(key.clone());
        }
        for child in &self.children {
            child.collect_filter_fields(fields);
        }
    }

    /// Kinds of all `Primary` nodes, pre-order.
    #[must_use]
    pub fn primary_kinds(&self) -> Vec<String> {
        let mut kinds = Vec::new();
        self.collect_primary_kinds(&mut kinds);
        kinds
    }

    fn collect_primary_kinds(&self, kinds: &mut Vec<String>) {
        if self.priority == Priority::Primary {
            kinds.push(self.kind.clone());
        }
        for child in &self.children {
            child.collect_primary_kinds(kinds);
        }
    }

    fn match_node_count(&self) -> usize {
        let own = usize::from(self.mode == Mode::Match);
        own + self.children.iter().map(PatternNode::match_node_count).sum::<usize>()
    }

    fn slot_labels(&self) -> Vec<&str> {
        self.children
            .iter()
            .map(|c| {
                if c.alias.is_empty() {
                    c.kind.as_str()
                } else {
                    c.alias.as_str()
                }
            })
            .collect()
    }

    fn has_duplicate_aliases(&self) -> bool {
        let mut seen = FxHashSet::default();
        for child in &self.children {
            if !child.alias.is_empty() && !seen.insert(child.alias.as_str()) {
                return true;
            }
        }
        self.children.iter().any(PatternNode::has_duplicate_aliases)
    }
}

/// Compile a dependency's `Structure` tree. Accepts either the
/// `Dependency` entity (whose single child is the root structure) or a
/// structure node directly.
#[must_use]
pub fn compile(dependency: &Entity) -> PatternNode {
    let root = if dependency.kind == "Dependency" && !dependency.children.is_empty() {
        &dependency.children[0].target
    } else {
        dependency
    };
    compile_node(root)
}

fn compile_node(node: &Entity) -> PatternNode {
    let mut filters: BTreeMap<String, FilterSpec> = BTreeMap::new();
    let mut normalized = BTreeMap::new();
    for (key, value) in &node.properties {
        let Some(rest) = key.strip_prefix("Filter.") else {
            continue;
        };
        let mut parts = rest.splitn(2, '.');
        let (Some(name), Some(part)) = (parts.next(), parts.next()) else {
            warn!(key = %key, "invalid filter key format, skipping");
            continue;
        };
        let spec = filters.entry(name.to_string()).or_insert_with(|| FilterSpec {
            field: String::new(),
            operator: String::new(),
            value: String::new(),
        });
        match part {
            "Field" => {
                spec.field = value.clone();
                if let Some(bare) = value.strip_prefix("Properties.") {
                    if !bare.is_empty() {
                        normalized.insert(bare.to_string(), value.clone());
                    }
                }
            }
            "Operator" => spec.operator = value.clone(),
            "Value" => spec.value = value.clone(),
            _ => warn!(key = %key, "invalid filter key format, skipping"),
        }
    }

    let mut ordered: Vec<(usize, &Entity)> = node
        .children
        .iter()
        .map(|r| &r.target)
        .enumerate()
        .collect();
    ordered.sort_by(|(ai, a), (bi, b)| {
        let aa = a.properties.get("Alias").map(String::as_str).unwrap_or("");
        let ba = b.properties.get("Alias").map(String::as_str).unwrap_or("");
        aa.is_empty()
            .cmp(&ba.is_empty())
            .then_with(|| aa.cmp(ba))
            .then_with(|| a.value.cmp(&b.value))
            .then_with(|| (*ai).cmp(bi))
    });

    PatternNode {
        alias: node
            .properties
            .get("Alias")
            .cloned()
            .unwrap_or_default(),
        kind: node.value.clone(),
        mode: Mode::parse(node.properties.get("Mode").map(String::as_str).unwrap_or("")),
        priority: Priority::parse(
            node.properties.get("Type").map(String::as_str).unwrap_or(""),
        ),
        filters,
        normalized_filter_fields: normalized,
        children: ordered.into_iter().map(|(_, c)| compile_node(c)).collect(),
    }
}

#[derive(Default)]
struct CacheInner {
    compiled: FxHashMap<String, Arc<PatternNode>>,
    summarized: FxHashSet<String>,
    hits: u64,
    misses: u64,
}

/// Memoised compiled patterns, shared across concurrent scheduler calls.
#[derive(Default)]
pub struct PatternCache {
    inner: Mutex<CacheInner>,
}

impl PatternCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the compiled pattern for `(action, dependency)`, compiling and
    /// caching it on first use.
    pub fn get_or_compile(&self, action: &str, dependency: &Entity) -> Arc<PatternNode> {
        let key = format!("{action}|{}", dependency.id);
        let mut inner = self.inner.lock();
        if let Some(compiled) = inner.compiled.get(&key).cloned() {
            inner.hits += 1;
            trace!(
                key = %key,
                hits = inner.hits,
                misses = inner.misses,
                "PATTERN cache hit"
            );
            return compiled;
        }
        inner.misses += 1;
        trace!(
            key = %key,
            hits = inner.hits,
            misses = inner.misses,
            "PATTERN cache miss"
        );
        let compiled = Arc::new(compile(dependency));
        if compiled.has_duplicate_aliases() {
            warn!(key = %key, "PATTERN duplicate alias among same-kind siblings");
        }
        if inner.summarized.insert(key.clone()) {
            trace!(
                key = %key,
                root = %compiled.kind,
                slots = ?compiled.slot_labels(),
                match_nodes = compiled.match_node_count(),
                "PATTERN summary"
            );
        }
        inner.compiled.insert(key, Arc::clone(&compiled));
        compiled
    }

    /// Drop the cache entry for exactly one `(action, dependency)`.
    pub fn invalidate(&self, action: &str, dep_id: i64) {
        let key = format!("{action}|{dep_id}");
        let mut inner = self.inner.lock();
        inner.compiled.remove(&key);
        inner.summarized.remove(&key);
        trace!(key = %key, "PATTERN invalidated");
    }
}
