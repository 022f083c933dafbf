//! Witness layer: graph-native at-most-once scheduling.
//!
//! For every would-be job the scheduler derives a deterministic anchor, a
//! canonical signature of the concrete input, and a SHA-1 digest. A
//! `Memory` entity carrying the digest is mapped with match-or-create
//! semantics; only the call that actually created it may schedule. The
//! store's atomic insert-or-match makes this race-free without any global
//! lock — contention shards by digest value.
//!
//! The canonical serialisation is ordering-insensitive (sorted property
//! pairs, sorted child serialisations) and includes entity versions, so a
//! re-created relation produces a fresh fingerprint while untouched
//! combinations stay suppressed.

use sha1::{Digest, Sha1};
use tracing::trace;

use crate::pattern::PatternNode;
use crate::store::{mapper::Mapper, GraphStore};
use crate::transport::{Entity, CHANGE_MARKER, CONTEXT_SYSTEM, ID_MATCH_OR_CREATE};

/// Deterministic anchor of a constructed input: the first pre-order
/// occurrence of a `Primary`-kind entity; else the input root when it is a
/// stored entity; else the lexicographically smallest `(kind, id)` among
/// stored participants.
#[must_use]
pub fn select_anchor(input: &Entity, pattern: &PatternNode) -> (String, i64) {
    for primary in pattern.primary_kinds() {
        if let Some(hit) = input.first_of_kind(&primary) {
            return (hit.kind.clone(), hit.id);
        }
    }
    if input.id > 0 {
        return (input.kind.clone(), input.id);
    }
    let mut best: Option<(String, i64)> = None;
    input.walk(&mut |e| {
        if e.id > 0 {
            let candidate = (e.kind.clone(), e.id);
            if best.as_ref().map_or(true, |b| candidate < *b) {
                best = Some(candidate);
            }
        }
    });
    best.unwrap_or_else(|| (input.kind.clone(), input.id))
}

/// Stable, ordering-insensitive serialisation of an input sub-graph.
#[must_use]
pub fn canonical_serialize(entity: &Entity) -> String {
    let mut props: Vec<(&str, &str)> = entity
        .properties
        .iter()
        .filter(|(k, _)| *k != CHANGE_MARKER)
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    props.sort_unstable();
    let props: Vec<String> = props.iter().map(|(k, v)| format!("{k}={v}")).collect();

    let mut children: Vec<String> = entity
        .children
        .iter()
        .map(|rel| {
            let mut rel_props: Vec<(&str, &str)> = rel
                .properties
                .iter()
                .filter(|(k, _)| *k != CHANGE_MARKER)
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            rel_props.sort_unstable();
            let rel_props: Vec<String> =
                rel_props.iter().map(|(k, v)| format!("{k}={v}")).collect();
            format!("({};{})", rel_props.join(";"), canonical_serialize(&rel.target))
        })
        .collect();
    children.sort_unstable();

    format!(
        "{}:{}:{}:{}{{{}}}[{}]",
        entity.kind,
        entity.id,
        entity.version,
        entity.value,
        props.join(";"),
        children.join(",")
    )
}

/// The full witness signature string for one `(action, dependency, anchor,
/// input)` tuple.
#[must_use]
pub fn signature(action: &str, dependency: &str, anchor: &(String, i64), input: &Entity) -> String {
    format!(
        "{action}|{dependency}|{}:{}|{}",
        anchor.0,
        anchor.1,
        canonical_serialize(input)
    )
}

/// Lower-hex SHA-1 of a signature string.
#[must_use]
pub fn digest(signature: &str) -> String {
    hex::encode(Sha1::digest(signature.as_bytes()))
}

/// Idempotency guard backed by `Memory` entities.
#[derive(Clone)]
pub struct WitnessGuard {
    store: GraphStore,
    mapper: Mapper,
}

impl WitnessGuard {
    #[must_use]
    pub fn new(store: GraphStore, mapper: Mapper) -> Self {
        Self { store, mapper }
    }

    /// Returns `true` when a witness for this tuple already exists. On
    /// first sight the witness is recorded and linked to its anchor.
    pub fn is_duplicate(
        &self,
        action: &str,
        dependency: &str,
        input: &Entity,
        pattern: &PatternNode,
    ) -> bool {
        let anchor = select_anchor(input, pattern);
        let digest = digest(&signature(action, dependency, &anchor, input));
        let context = format!("Exec:{action}:{dependency}");

        let memory = self.mapper.map_with_context(
            &Entity {
                kind: "Memory".to_string(),
                id: ID_MATCH_OR_CREATE,
                value: digest.clone(),
                context: context.clone(),
                ..Default::default()
            },
            CONTEXT_SYSTEM,
        );

        if memory.marker().is_some() {
            // freshly recorded: tie it to the anchor for locality
            if anchor.1 > 0 && memory.id > 0 {
                let _ = self.store.link(
                    (&anchor.0, anchor.1),
                    ("Memory", memory.id),
                    CONTEXT_SYSTEM,
                    &Default::default(),
                );
            }
            trace!(%context, value = %digest, "SCHED WITNESS created");
            false
        } else {
            trace!(%context, value = %digest, "SCHED WITNESS exists");
            true
        }
    }
}
