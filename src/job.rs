//! Job lifecycle.
//!
//! A job is a `Job` entity: action name, dependency name, state, the
//! concrete demultiplexed input as canonical JSON, and a creation
//! timestamp. The entity is additionally linked to the input's root for
//! graph traceability. Workers claim jobs with an atomic `Open` →
//! `Assigned` compare-and-set; completed jobs are kept or pruned per the
//! history setting.

use chrono::Utc;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::store::{GraphStore, Query, QueryResult, StoreError};
use crate::transport::{Entity, CONTEXT_SYSTEM};

pub const STATE_OPEN: &str = "Open";
pub const STATE_ASSIGNED: &str = "Assigned";
pub const STATE_DONE: &str = "Done";
pub const STATE_FAILED: &str = "Failed";

/// Persist a new `Open` job for `(action, dependency, input)`.
pub fn create(
    store: &GraphStore,
    action: &str,
    dependency: &str,
    input: &Entity,
) -> Result<i64, StoreError> {
    let payload = serde_json::to_string(input)?;
    let mut properties = FxHashMap::default();
    properties.insert("Action".to_string(), action.to_string());
    properties.insert("Requirement".to_string(), dependency.to_string());
    properties.insert("State".to_string(), STATE_OPEN.to_string());
    properties.insert("Input".to_string(), payload);
    properties.insert("Created".to_string(), Utc::now().to_rfc3339());
    let id = store.create_entity(
        "Job",
        &format!("{action}:{dependency}"),
        CONTEXT_SYSTEM,
        &properties,
    );
    if input.id > 0 {
        let _ = store.link(("Job", id), (&input.kind, input.id), CONTEXT_SYSTEM, &Default::default());
    }
    trace!(job = id, action, dependency, "SCHED JOB persisted");
    Ok(id)
}

/// All jobs still waiting for a worker.
pub fn open_jobs(store: &GraphStore) -> Result<QueryResult, StoreError> {
    store.query(&Query::read("Job").match_("Properties.State", "==", STATE_OPEN))
}

/// Jobs not yet finished (`Open` or `Assigned`) — the observer's notion of
/// outstanding work.
pub fn unfinished_jobs(store: &GraphStore) -> Result<usize, StoreError> {
    let open = store
        .query(&Query::read("Job").match_("Properties.State", "==", STATE_OPEN))?
        .amount;
    let assigned = store
        .query(&Query::read("Job").match_("Properties.State", "==", STATE_ASSIGNED))?
        .amount;
    Ok(open + assigned)
}

/// Try to claim a job. Exactly one concurrent caller wins.
pub fn claim(store: &GraphStore, job_id: i64) -> Result<bool, StoreError> {
    store.compare_and_set_property("Job", job_id, "State", STATE_OPEN, STATE_ASSIGNED)
}

/// Decode the concrete input sub-graph a job was created with.
pub fn decode_input(job: &Entity) -> Result<Entity, StoreError> {
    let payload = job
        .properties
        .get("Input")
        .ok_or_else(|| StoreError::MissingProperty {
            kind: job.kind.clone(),
            id: job.id,
            key: "Input".to_string(),
        })?;
    Ok(serde_json::from_str(payload)?)
}

/// Mark a job done, or prune it entirely when history is disabled.
pub fn complete(store: &GraphStore, job_id: i64, history: bool) -> Result<(), StoreError> {
    if history {
        store.set_property("Job", job_id, "State", STATE_DONE)?;
        store.set_property("Job", job_id, "Finished", &Utc::now().to_rfc3339())?;
    } else {
        store.remove_entity("Job", job_id);
    }
    Ok(())
}

/// Mark a job failed. Failed jobs are never pruned; their witness keeps
/// them from being re-derived until explicit invalidation.
pub fn fail(store: &GraphStore, job_id: i64) -> Result<(), StoreError> {
    store.set_property("Job", job_id, "State", STATE_FAILED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_persists_payload_and_link() {
        let store = GraphStore::new();
        let alpha = store.create_entity("Alpha", "a1", "Data", &Default::default());
        let input = store.get("Alpha", alpha).unwrap();
        let job_id = create(&store, "act", "alpha", &input).unwrap();

        let job = store.get("Job", job_id).unwrap();
        assert_eq!(job.properties.get("State").unwrap(), STATE_OPEN);
        assert_eq!(job.properties.get("Action").unwrap(), "act");
        assert_eq!(decode_input(&job).unwrap(), input);

        let tree = store.subtree("Job", job_id).unwrap();
        assert_eq!(tree.children[0].target.kind, "Alpha");
    }

    #[test]
    fn claim_is_exclusive() {
        let store = GraphStore::new();
        let alpha = store.create_entity("Alpha", "a1", "Data", &Default::default());
        let input = store.get("Alpha", alpha).unwrap();
        let job_id = create(&store, "act", "alpha", &input).unwrap();
        assert!(claim(&store, job_id).unwrap());
        assert!(!claim(&store, job_id).unwrap());
        assert_eq!(open_jobs(&store).unwrap().amount, 0);
        assert_eq!(unfinished_jobs(&store).unwrap(), 1);
    }

    #[test]
    fn complete_respects_history_setting() {
        let store = GraphStore::new();
        let alpha = store.create_entity("Alpha", "a1", "Data", &Default::default());
        let input = store.get("Alpha", alpha).unwrap();

        let kept = create(&store, "act", "alpha", &input).unwrap();
        complete(&store, kept, true).unwrap();
        assert_eq!(
            store.get("Job", kept).unwrap().properties.get("State").unwrap(),
            STATE_DONE
        );

        let pruned = create(&store, "act", "alpha", &input).unwrap();
        complete(&store, pruned, false).unwrap();
        assert!(store.get("Job", pruned).is_none());
    }
}
