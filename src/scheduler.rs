//! The scheduling engine.
//!
//! [`Scheduler::run`] is a pure function of a tagged change batch, the
//! store, and the action registry: it derives exactly the newly
//! satisfiable `(action, dependency, input)` combinations and persists one
//! job per combination. Several guards keep the stream precise:
//!
//! - **relevance**: an update-only delta must touch at least one filter
//!   field of the candidate dependency;
//! - **anchor containment**: the constructed input must contain the anchor
//!   entity that motivated it;
//! - **strict causality**: the input must contain at least one entity that
//!   actually changed in this batch;
//! - **witness idempotency**: at most one job per `(action, dependency,
//!   anchor, input-fingerprint)` tuple, ever.
//!
//! Every rejected combination leaves a trace line (`RELEVANCE`,
//! `CAUSALITY`, `WITNESS`), so a missing job is always explainable.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{error, trace, warn};

use crate::config::Mode;
use crate::cortex::Cortex;
use crate::demux;
use crate::job;
use crate::pattern::{PatternCache, PatternNode};
use crate::store::{mapper::Mapper, GraphStore, Query};
use crate::transport::Entity;
use crate::witness::WitnessGuard;

/// The delta-aware scheduler. Cheap to share behind an [`Arc`]; all
/// interior state is the compiled-pattern cache.
pub struct Scheduler {
    store: GraphStore,
    patterns: PatternCache,
    witness: WitnessGuard,
    match_across_contexts: bool,
    job_signal: Option<flume::Sender<()>>,
}

impl Scheduler {
    #[must_use]
    pub fn new(store: GraphStore, mapper: Mapper) -> Self {
        Self {
            witness: WitnessGuard::new(store.clone(), mapper),
            store,
            patterns: PatternCache::new(),
            match_across_contexts: true,
            job_signal: None,
        }
    }

    /// Wire a wake-up channel towards the worker pool; a unit is sent per
    /// created job, best effort.
    #[must_use]
    pub fn with_job_signal(mut self, signal: flume::Sender<()>) -> Self {
        self.job_signal = Some(signal);
        self
    }

    /// Whether synthesised queries may match entities from other contexts
    /// than the anchor's. Defaults to `true`.
    #[must_use]
    pub fn match_across_contexts(mut self, allowed: bool) -> Self {
        self.match_across_contexts = allowed;
        self
    }

    /// Drop the compiled pattern for `(action, dep_id)` after
    /// re-registration.
    pub fn invalidate_pattern(&self, action: &str, dep_id: i64) {
        self.patterns.invalidate(action, dep_id);
    }

    /// Compiled pattern of a registered dependency, for tests and
    /// diagnostics only.
    #[must_use]
    pub fn debug_compiled_pattern(
        &self,
        cortex: &Cortex,
        action: &str,
        dependency: &str,
    ) -> Option<Arc<PatternNode>> {
        let dep = cortex.dependency(action, dependency)?;
        Some(self.patterns.get_or_compile(action, &dep))
    }

    /// Analyse one tagged batch and schedule every newly satisfiable
    /// combination.
    pub fn run(&self, batch: &Entity, cortex: &Cortex) {
        trace!(root = %batch.kind, id = batch.id, "SCHED RUN begin");

        let relation_structures = collect_relation_structures(batch);
        let marked_kinds = collect_marked_kinds(batch);

        let mut candidates: Vec<(String, String)> = Vec::new();
        for kind in &marked_kinds {
            for pair in self.actions_by_lookup("DependencyEntityLookup", kind) {
                push_unique(&mut candidates, pair);
            }
        }
        for (signature, _) in &relation_structures {
            for pair in self.actions_by_lookup("DependencyRelationLookup", signature) {
                push_unique(&mut candidates, pair);
            }
        }
        if candidates.is_empty() {
            trace!("SCHED candidates=[]");
            return;
        }
        trace!(candidates = ?candidates
            .iter()
            .map(|(a, d)| format!("{a}:{d}"))
            .collect::<Vec<_>>(), "SCHED candidates");

        let updated = collect_updated(batch, &relation_structures);
        let batch_marker = batch.marker().unwrap_or("").to_string();

        let mut anchors = collect_anchors(batch);
        for (_, child) in &relation_structures {
            anchors.push(child.clone());
        }
        trace!(anchors = anchors.len(), "SCHED anchors");
        if anchors.is_empty() {
            // overlay-only path: treat the batch root as the single anchor
            anchors.push(batch.clone());
        }

        for anchor in &anchors {
            self.process_anchor(anchor, &candidates, &updated, &batch_marker, cortex);
        }
    }

    fn process_anchor(
        &self,
        anchor: &Entity,
        candidates: &[(String, String)],
        updated: &FxHashSet<(String, i64)>,
        batch_marker: &str,
        cortex: &Cortex,
    ) {
        let pinned = collect_pinned(anchor);
        for (action_name, dep_name) in candidates {
            let Some(dep) = cortex.dependency(action_name, dep_name) else {
                warn!(action = %action_name, dependency = %dep_name, "candidate without registered dependency, skipping");
                continue;
            };
            let pattern = self.patterns.get_or_compile(action_name, &dep);
            if !pattern.contains_kind(&anchor.kind) {
                continue;
            }
            // update-only deltas must touch a filter-relevant field
            if !batch_marker.is_empty() && !has_relevant_filter(&pattern, batch_marker) {
                trace!(
                    action = %action_name,
                    dependency = %dep_name,
                    "SCHED RELEVANCE matched_key=none (skip)"
                );
                continue;
            }
            let inputs = self.build_inputs(&pattern, &pinned, &anchor.context);
            for input in inputs {
                if !input.contains(&anchor.kind, anchor.id) {
                    trace!(
                        action = %action_name,
                        dependency = %dep_name,
                        "SCHED ANCHOR not contained (skip)"
                    );
                    continue;
                }
                if !contains_updated(&input, updated) {
                    trace!(
                        action = %action_name,
                        dependency = %dep_name,
                        contains_updated = false,
                        "SCHED CAUSALITY"
                    );
                    continue;
                }
                trace!(
                    action = %action_name,
                    dependency = %dep_name,
                    contains_updated = true,
                    "SCHED CAUSALITY"
                );
                if self
                    .witness
                    .is_duplicate(action_name, dep_name, &input, &pattern)
                {
                    trace!(
                        action = %action_name,
                        dependency = %dep_name,
                        "SCHED JOB skip duplicate by Memory witness"
                    );
                    continue;
                }
                match job::create(&self.store, action_name, dep_name, &input) {
                    Ok(job_id) => {
                        trace!(
                            job = job_id,
                            action = %action_name,
                            dependency = %dep_name,
                            "SCHED JOB create"
                        );
                        if let Some(signal) = &self.job_signal {
                            let _ = signal.try_send(());
                        }
                    }
                    Err(err) => {
                        error!(
                            action = %action_name,
                            dependency = %dep_name,
                            %err,
                            "job creation failed"
                        );
                    }
                }
            }
        }
    }

    /// Run the synthesised query for a pattern and demultiplex every
    /// matched sub-graph into concrete input candidates.
    fn build_inputs(
        &self,
        pattern: &PatternNode,
        pinned: &FxHashMap<String, i64>,
        anchor_context: &str,
    ) -> Vec<Entity> {
        let query = self.build_query(pattern, pinned, anchor_context);
        let result = match self.store.query(&query) {
            Ok(result) => result,
            Err(err) => {
                error!(%err, "synthesised query failed, abandoning candidate");
                return Vec::new();
            }
        };
        let mut inputs = Vec::new();
        for matched in &result.entities {
            inputs.extend(demux::demultiplex(matched));
        }
        inputs
    }

    /// Mirror the dependency tree as a store query: `Read` per node, an ID
    /// pin where the batch supplies a concrete entity, `Match` filters in
    /// `Match` mode, `to` descent per child.
    fn build_query(
        &self,
        node: &PatternNode,
        pinned: &FxHashMap<String, i64>,
        anchor_context: &str,
    ) -> Query {
        let mut query = Query::read(&node.kind);
        if let Some(&id) = pinned.get(&node.kind) {
            query = query.match_("ID", "==", id.to_string());
        }
        if node.mode == Mode::Match {
            for spec in node.filters.values() {
                query = query.match_(&spec.field, &spec.operator, &spec.value);
            }
        }
        if !self.match_across_contexts && !anchor_context.is_empty() {
            query = query.match_("Context", "==", anchor_context);
        }
        for child in &node.children {
            query = query.to(self.build_query(child, pinned, anchor_context));
        }
        query
    }

    /// Candidate `(action, dependency)` pairs registered under one reverse
    /// index value.
    fn actions_by_lookup(&self, lookup_kind: &str, value: &str) -> Vec<(String, String)> {
        let query = Query::read(lookup_kind)
            .match_("Value", "==", value)
            .to(Query::read("Dependency").from(Query::read("Action")));
        let result = match self.store.query(&query) {
            Ok(result) => result,
            Err(err) => {
                error!(lookup = lookup_kind, value, %err, "lookup query failed");
                return Vec::new();
            }
        };
        let mut pairs = Vec::new();
        if let Some(lookup) = result.entities.first() {
            for dep_rel in &lookup.children {
                let dependency = &dep_rel.target;
                for action_rel in &dependency.parents {
                    pairs.push((action_rel.target.value.clone(), dependency.value.clone()));
                }
            }
        }
        pairs
    }
}

fn push_unique(pairs: &mut Vec<(String, String)>, pair: (String, String)) {
    if !pairs.contains(&pair) {
        pairs.push(pair);
    }
}

/// Signatures and child endpoints of relations newly created in this
/// batch, deduplicated by signature in encounter order.
fn collect_relation_structures(batch: &Entity) -> Vec<(String, Entity)> {
    let mut seen = FxHashSet::default();
    let mut found = Vec::new();
    collect_relation_structures_into(batch, &mut seen, &mut found);
    found
}

fn collect_relation_structures_into(
    entity: &Entity,
    seen: &mut FxHashSet<String>,
    found: &mut Vec<(String, Entity)>,
) {
    for rel in &entity.children {
        if rel.marker() == Some("") {
            let signature = format!("{}-{}", entity.kind, rel.target.kind);
            if seen.insert(signature.clone()) {
                found.push((signature, rel.target.clone()));
            }
        }
        collect_relation_structures_into(&rel.target, seen, found);
    }
}

/// Kinds of change-marked entities, first-encounter order, children-only
/// descent.
fn collect_marked_kinds(batch: &Entity) -> Vec<String> {
    let mut seen = FxHashSet::default();
    let mut kinds = Vec::new();
    collect_marked_kinds_into(batch, &mut seen, &mut kinds);
    kinds
}

fn collect_marked_kinds_into(
    entity: &Entity,
    seen: &mut FxHashSet<String>,
    kinds: &mut Vec<String>,
) {
    if entity.marker().is_some() && seen.insert(entity.kind.clone()) {
        kinds.push(entity.kind.clone());
    }
    for rel in &entity.children {
        collect_marked_kinds_into(&rel.target, seen, kinds);
    }
}

/// The first change-marked entity per kind within a sub-graph, as query
/// pins. Later same-kind occurrences are deliberately skipped; they get
/// their turn as anchors of their own.
fn collect_pinned(entity: &Entity) -> FxHashMap<String, i64> {
    let mut pinned = FxHashMap::default();
    collect_pinned_into(entity, &mut pinned);
    pinned
}

fn collect_pinned_into(entity: &Entity, pinned: &mut FxHashMap<String, i64>) {
    if entity.marker().is_some() && entity.id > 0 {
        pinned.entry(entity.kind.clone()).or_insert(entity.id);
    }
    for rel in &entity.children {
        collect_pinned_into(&rel.target, pinned);
    }
}

/// Change-marked entities anywhere in the batch (children and parents) —
/// the per-batch anchor set.
fn collect_anchors(batch: &Entity) -> Vec<Entity> {
    let mut anchors = Vec::new();
    batch.walk(&mut |e| {
        if e.marker().is_some() {
            anchors.push(e.clone());
        }
    });
    anchors
}

/// `(kind, id)` of everything updated or created in this batch; relation
/// creation contributes the child endpoint only, so siblings under a
/// shared parent never cross-trigger.
fn collect_updated(
    batch: &Entity,
    relation_structures: &[(String, Entity)],
) -> FxHashSet<(String, i64)> {
    let mut updated = FxHashSet::default();
    collect_updated_into(batch, &mut updated);
    for (_, child) in relation_structures {
        updated.insert((child.kind.clone(), child.id));
    }
    updated
}

fn collect_updated_into(entity: &Entity, updated: &mut FxHashSet<(String, i64)>) {
    if entity.marker().is_some() {
        updated.insert((entity.kind.clone(), entity.id));
    }
    for rel in &entity.children {
        collect_updated_into(&rel.target, updated);
    }
}

/// Whether a constructed input touches the batch's updated set
/// (children-only descent, mirroring input construction).
fn contains_updated(input: &Entity, updated: &FxHashSet<(String, i64)>) -> bool {
    if updated.contains(&(input.kind.clone(), input.id)) {
        return true;
    }
    input
        .children
        .iter()
        .any(|rel| contains_updated(&rel.target, updated))
}

/// Whether any updated key appears among the pattern's filter fields, raw
/// or normalised from `Properties.<K>`.
fn has_relevant_filter(pattern: &PatternNode, updated_keys: &str) -> bool {
    let fields = pattern.filter_fields();
    for key in updated_keys.split(',') {
        let key = key.trim();
        if !key.is_empty() && fields.contains(key) {
            trace!(matched_key = key, "SCHED RELEVANCE");
            return true;
        }
    }
    false
}
