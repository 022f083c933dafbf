//! Demultiplexer: Cartesian expansion of matched sub-graphs.
//!
//! A query result may carry several candidate children of the same kind
//! under one node. Each job must see exactly one candidate per slot, so the
//! scheduler expands the result into the Cartesian product across kind
//! groups, recursively. Every emitted sub-graph is a deep copy — mutating
//! one output never affects a sibling output. This independence is a
//! correctness requirement of the job model, not a style choice.

use rustc_hash::FxHashMap;

use crate::transport::{Entity, Relation};

/// Expand `entity` into independent single-candidate-per-slot sub-graphs.
///
/// For N child kinds with |C_i| candidates each the output holds
/// ∏|C_i| combinations, in deterministic order: kind groups in first
/// encounter order, the first group varying slowest.
#[must_use]
pub fn demultiplex(entity: &Entity) -> Vec<Entity> {
    if entity.children.is_empty() {
        return vec![entity.clone()];
    }

    // group child relations by target kind, preserving encounter order
    let mut group_index: FxHashMap<&str, usize> = FxHashMap::default();
    let mut groups: Vec<Vec<&Relation>> = Vec::new();
    for rel in &entity.children {
        match group_index.get(rel.target.kind.as_str()) {
            Some(&idx) => groups[idx].push(rel),
            None => {
                group_index.insert(rel.target.kind.as_str(), groups.len());
                groups.push(vec![rel]);
            }
        }
    }

    // demultiplex every candidate of every group, keeping its relation
    // context/properties alongside
    let mut variants_per_group: Vec<Vec<Relation>> = Vec::with_capacity(groups.len());
    for group in &groups {
        let mut variants = Vec::new();
        for rel in group {
            for target in demultiplex(&rel.target) {
                variants.push(Relation {
                    context: rel.context.clone(),
                    properties: rel.properties.clone(),
                    target,
                });
            }
        }
        variants_per_group.push(variants);
    }

    recombinations(&variants_per_group)
        .into_iter()
        .map(|combo| Entity {
            kind: entity.kind.clone(),
            id: entity.id,
            value: entity.value.clone(),
            context: entity.context.clone(),
            version: entity.version,
            properties: entity.properties.clone(),
            children: combo.into_iter().cloned().collect(),
            parents: entity.parents.clone(),
        })
        .collect()
}

/// All combinations picking one element per row, first row varying slowest.
fn recombinations<'a>(rows: &'a [Vec<Relation>]) -> Vec<Vec<&'a Relation>> {
    let Some((first, rest)) = rows.split_first() else {
        return Vec::new();
    };
    let tail = recombinations(rest);
    let mut result = Vec::new();
    if tail.is_empty() {
        for rel in first {
            result.push(vec![rel]);
        }
        return result;
    }
    for rel in first {
        for combo in &tail {
            let mut entry = Vec::with_capacity(1 + combo.len());
            entry.push(rel);
            entry.extend(combo.iter().copied());
            result.push(entry);
        }
    }
    result
}
