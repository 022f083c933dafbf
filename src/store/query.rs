//! Query surface of the graph store.
//!
//! A [`Query`] is a small tree mirroring the shape of the data it wants
//! back: a verb plus kind at each node, `match_` filters, and `to` /
//! `from` sub-queries descending into children and parents. `to` and
//! `from` are structural inner joins: a base entity only survives when
//! every sub-query finds at least one match, and the matches are attached
//! to the returned transport copy.
//!
//! Supported filter fields: `ID`, `Value`, `Context` and `Properties.<K>`.
//! Supported operators: `==`, `!=`, `<`, `>`, `<=`, `>=` (numeric when
//! both sides parse as numbers, lexicographic otherwise) and `contains`.

use crate::transport::{Entity, Relation};

use super::{GraphStore, Inner, StoreError, StoredEntity};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Verb {
    Read,
    Find,
    Link,
    Unlink,
}

#[derive(Clone, Debug)]
struct Filter {
    field: String,
    op: String,
    value: String,
}

/// Composable query over the store. Build with the verb constructors,
/// refine with [`match_`](Self::match_), descend with [`to`](Self::to) and
/// [`from`](Self::from), run with [`GraphStore::query`].
#[derive(Clone, Debug)]
pub struct Query {
    verb: Verb,
    kind: String,
    filters: Vec<Filter>,
    to: Vec<Query>,
    from: Vec<Query>,
}

impl Query {
    fn with_verb(verb: Verb, kind: impl Into<String>) -> Self {
        Self {
            verb,
            kind: kind.into(),
            filters: Vec::new(),
            to: Vec::new(),
            from: Vec::new(),
        }
    }

    /// Select entities of a kind, returning full transport copies.
    #[must_use]
    pub fn read(kind: impl Into<String>) -> Self {
        Self::with_verb(Verb::Read, kind)
    }

    /// Select entities of a kind for addressing (link targets).
    #[must_use]
    pub fn find(kind: impl Into<String>) -> Self {
        Self::with_verb(Verb::Find, kind)
    }

    /// Create relations from matched entities to the targets of the
    /// attached `to` sub-queries.
    #[must_use]
    pub fn link(kind: impl Into<String>) -> Self {
        Self::with_verb(Verb::Link, kind)
    }

    /// Remove relations from matched entities to the targets of the
    /// attached `to` sub-queries.
    #[must_use]
    pub fn unlink(kind: impl Into<String>) -> Self {
        Self::with_verb(Verb::Unlink, kind)
    }

    /// Add a filter on `ID`, `Value`, `Context` or `Properties.<K>`.
    #[must_use]
    pub fn match_(
        mut self,
        field: impl Into<String>,
        op: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op: op.into(),
            value: value.into(),
        });
        self
    }

    /// Require and attach matching children.
    #[must_use]
    pub fn to(mut self, sub: Query) -> Self {
        self.to.push(sub);
        self
    }

    /// Require and attach matching parents.
    #[must_use]
    pub fn from(mut self, sub: Query) -> Self {
        self.from.push(sub);
        self
    }
}

/// Result of a query execution: detached transport trees shaped like the
/// query, id-ordered within the base kind.
#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    pub amount: usize,
    pub entities: Vec<Entity>,
}

impl GraphStore {
    /// Execute a query. Read/Find return matching transport trees;
    /// Link/Unlink mutate relations and report the affected edge count in
    /// `amount`.
    pub fn query(&self, q: &Query) -> Result<QueryResult, StoreError> {
        match q.verb {
            Verb::Read | Verb::Find => {
                let inner = self.inner.read();
                let entities = resolve_base(&inner, q)?;
                Ok(QueryResult {
                    amount: entities.len(),
                    entities,
                })
            }
            Verb::Link | Verb::Unlink => {
                let (sources, targets) = {
                    let inner = self.inner.read();
                    let sources = base_matches(&inner, q)?;
                    let mut targets = Vec::new();
                    for sub in &q.to {
                        targets.extend(base_matches(&inner, sub)?);
                    }
                    (sources, targets)
                };
                let mut affected = 0;
                for &(ref pk, pid) in &sources {
                    for &(ref ck, cid) in &targets {
                        let changed = if q.verb == Verb::Link {
                            self.link((pk.as_str(), pid), (ck.as_str(), cid), "", &Default::default())?
                        } else {
                            self.unlink((pk.as_str(), pid), (ck.as_str(), cid))
                        };
                        if changed {
                            affected += 1;
                        }
                    }
                }
                Ok(QueryResult {
                    amount: affected,
                    entities: Vec::new(),
                })
            }
        }
    }
}

/// `(kind, id)` pairs of entities passing a query's own filters.
fn base_matches(inner: &Inner, q: &Query) -> Result<Vec<(String, i64)>, StoreError> {
    let mut out = Vec::new();
    if let Some(by_id) = inner.entities.get(&q.kind) {
        for (&id, stored) in by_id {
            if passes(id, stored, &q.filters)? {
                out.push((q.kind.clone(), id));
            }
        }
    }
    Ok(out)
}

fn resolve_base(inner: &Inner, q: &Query) -> Result<Vec<Entity>, StoreError> {
    let mut out = Vec::new();
    if let Some(by_id) = inner.entities.get(&q.kind) {
        for (&id, stored) in by_id {
            if !passes(id, stored, &q.filters)? {
                continue;
            }
            if let Some(node) = resolve_joins(inner, q, id)? {
                out.push(node);
            }
        }
    }
    Ok(out)
}

/// Resolve the `to`/`from` joins for one already-filtered base entity.
/// Returns `None` when any sub-query finds no match (inner join).
fn resolve_joins(inner: &Inner, q: &Query, id: i64) -> Result<Option<Entity>, StoreError> {
    let mut node = match inner.shallow(&q.kind, id) {
        Some(n) => n,
        None => return Ok(None),
    };
    let key = (q.kind.clone(), id);
    for sub in &q.to {
        let mut matched = Vec::new();
        if let Some(edges) = inner.children.get(&key) {
            for edge in edges {
                if edge.kind != sub.kind {
                    continue;
                }
                let stored = match inner.entities.get(&edge.kind).and_then(|m| m.get(&edge.id)) {
                    Some(s) => s,
                    None => continue,
                };
                if !passes(edge.id, stored, &sub.filters)? {
                    continue;
                }
                if let Some(child) = resolve_joins(inner, sub, edge.id)? {
                    matched.push(Relation {
                        context: edge.context.clone(),
                        properties: edge.properties.clone(),
                        target: child,
                    });
                }
            }
        }
        if matched.is_empty() {
            return Ok(None);
        }
        node.children.extend(matched);
    }
    for sub in &q.from {
        let mut matched = Vec::new();
        if let Some(edges) = inner.parents.get(&key) {
            for edge in edges {
                if edge.kind != sub.kind {
                    continue;
                }
                let stored = match inner.entities.get(&edge.kind).and_then(|m| m.get(&edge.id)) {
                    Some(s) => s,
                    None => continue,
                };
                if !passes(edge.id, stored, &sub.filters)? {
                    continue;
                }
                if let Some(parent) = resolve_joins(inner, sub, edge.id)? {
                    matched.push(Relation {
                        context: edge.context.clone(),
                        properties: edge.properties.clone(),
                        target: parent,
                    });
                }
            }
        }
        if matched.is_empty() {
            return Ok(None);
        }
        node.parents.extend(matched);
    }
    Ok(Some(node))
}

fn passes(id: i64, stored: &StoredEntity, filters: &[Filter]) -> Result<bool, StoreError> {
    for f in filters {
        let lhs = match f.field.as_str() {
            "ID" => Some(id.to_string()),
            "Value" => Some(stored.value.clone()),
            "Context" => Some(stored.context.clone()),
            other => match other.strip_prefix("Properties.") {
                Some(key) => stored.properties.get(key).cloned(),
                None => None,
            },
        };
        match lhs {
            None => return Ok(false),
            Some(lhs) => {
                if !compare(&lhs, &f.op, &f.value)? {
                    return Ok(false);
                }
            }
        }
    }
    Ok(true)
}

fn compare(lhs: &str, op: &str, rhs: &str) -> Result<bool, StoreError> {
    let numeric = lhs.parse::<f64>().ok().zip(rhs.parse::<f64>().ok());
    let ordering = match numeric {
        Some((l, r)) => l.partial_cmp(&r),
        None => Some(lhs.cmp(rhs)),
    };
    let ord = match ordering {
        Some(o) => o,
        None => return Ok(false),
    };
    match op {
        "==" => Ok(ord.is_eq()),
        "!=" => Ok(!ord.is_eq()),
        "<" => Ok(ord.is_lt()),
        ">" => Ok(ord.is_gt()),
        "<=" => Ok(ord.is_le()),
        ">=" => Ok(ord.is_ge()),
        "contains" => Ok(lhs.contains(rhs)),
        other => Err(StoreError::UnknownOperator {
            op: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;

    fn props(pairs: &[(&str, &str)]) -> FxHashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn seeded() -> (GraphStore, i64, i64, i64) {
        let store = GraphStore::new();
        let a = store.create_entity("Alpha", "a1", "Data", &props(&[("Transport", "secure")]));
        let b1 = store.create_entity("Beta", "b1", "Data", &props(&[]));
        let b2 = store.create_entity("Beta", "b2", "Data", &props(&[]));
        store.link(("Alpha", a), ("Beta", b1), "Data", &props(&[])).unwrap();
        store.link(("Alpha", a), ("Beta", b2), "Data", &props(&[])).unwrap();
        (store, a, b1, b2)
    }

    #[test]
    fn read_filters_on_value_and_properties() {
        let (store, _, _, _) = seeded();
        let res = store
            .query(&Query::read("Alpha").match_("Value", "==", "a1"))
            .unwrap();
        assert_eq!(res.amount, 1);
        let res = store
            .query(&Query::read("Alpha").match_("Properties.Transport", "==", "plain"))
            .unwrap();
        assert_eq!(res.amount, 0);
        let res = store
            .query(&Query::read("Alpha").match_("Properties.Transport", "contains", "sec"))
            .unwrap();
        assert_eq!(res.amount, 1);
    }

    #[test]
    fn to_attaches_all_matching_children() {
        let (store, _, _, _) = seeded();
        let res = store
            .query(&Query::read("Alpha").to(Query::read("Beta")))
            .unwrap();
        assert_eq!(res.amount, 1);
        assert_eq!(res.entities[0].children.len(), 2);
    }

    #[test]
    fn to_is_an_inner_join() {
        let (store, _, _, _) = seeded();
        let res = store
            .query(&Query::read("Alpha").to(Query::read("Gamma")))
            .unwrap();
        assert_eq!(res.amount, 0);
    }

    #[test]
    fn to_with_id_pin_attaches_one_child() {
        let (store, _, _, b2) = seeded();
        let res = store
            .query(&Query::read("Alpha").to(Query::read("Beta").match_("ID", "==", b2.to_string())))
            .unwrap();
        assert_eq!(res.entities[0].children.len(), 1);
        assert_eq!(res.entities[0].children[0].target.id, b2);
    }

    #[test]
    fn from_attaches_parents() {
        let (store, a, _, _) = seeded();
        let res = store
            .query(&Query::read("Beta").from(Query::read("Alpha")))
            .unwrap();
        assert_eq!(res.amount, 2);
        assert_eq!(res.entities[0].parents[0].target.id, a);
    }

    #[test]
    fn link_and_unlink_by_query() {
        let store = GraphStore::new();
        let g = store.create_entity("Gamma", "g", "Data", &props(&[]));
        let m = store.create_entity("Memory", "digest", "System", &props(&[]));
        let res = store
            .query(
                &Query::link("Gamma")
                    .match_("ID", "==", g.to_string())
                    .to(Query::find("Memory").match_("ID", "==", m.to_string())),
            )
            .unwrap();
        assert_eq!(res.amount, 1);
        // duplicate link is a no-op
        let res = store
            .query(
                &Query::link("Gamma")
                    .match_("ID", "==", g.to_string())
                    .to(Query::find("Memory").match_("ID", "==", m.to_string())),
            )
            .unwrap();
        assert_eq!(res.amount, 0);
        let res = store
            .query(
                &Query::unlink("Gamma")
                    .match_("ID", "==", g.to_string())
                    .to(Query::find("Memory").match_("ID", "==", m.to_string())),
            )
            .unwrap();
        assert_eq!(res.amount, 1);
    }

    #[test]
    fn unknown_operator_is_an_error() {
        let (store, _, _, _) = seeded();
        let err = store
            .query(&Query::read("Alpha").match_("Value", "=~", "a1"))
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownOperator { .. }));
    }

    #[test]
    fn numeric_comparison_when_both_sides_parse() {
        let store = GraphStore::new();
        store.create_entity("N", "9", "Data", &props(&[]));
        store.create_entity("N", "10", "Data", &props(&[]));
        let res = store
            .query(&Query::read("N").match_("Value", ">", "9"))
            .unwrap();
        assert_eq!(res.amount, 1);
        assert_eq!(res.entities[0].value, "10");
    }
}
