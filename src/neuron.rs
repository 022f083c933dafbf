//! Worker pool ("neurons").
//!
//! Each neuron is a Tokio task paired with a `Neuron` descriptor entity in
//! the store. The loop: claim an open job (atomic `Open` → `Assigned`),
//! execute the action on the job's input, feed every output sub-graph back
//! through the mapper and the scheduler — closing the reactive loop — and
//! go back to searching. State transitions bump the descriptor's version;
//! that monotonic churn is what the observer watches for progress.
//!
//! Neurons are woken by the scheduler's job signal and fall back to a
//! 10 ms poll so no job can be stranded by a lost signal.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::cortex::Cortex;
use crate::job;
use crate::scheduler::Scheduler;
use crate::store::{mapper::Mapper, GraphStore};
use crate::transport::{Entity, CONTEXT_SYSTEM};

pub const STATE_SEARCHING: &str = "Searching";
pub const STATE_WORKING: &str = "Working";
pub const STATE_DEAD: &str = "Dead";

struct Neuron {
    entity_id: i64,
    store: GraphStore,
    mapper: Mapper,
    scheduler: Arc<Scheduler>,
    cortex: Arc<Cortex>,
    signal: flume::Receiver<()>,
    history: bool,
}

/// Spawn `count` workers. Their descriptor entities exist before this
/// returns, so an observer created afterwards sees the full pool.
pub fn spawn(
    count: usize,
    ident: &str,
    store: GraphStore,
    mapper: Mapper,
    scheduler: Arc<Scheduler>,
    cortex: Arc<Cortex>,
    signal: flume::Receiver<()>,
    history: bool,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::with_capacity(count);
    for index in 0..count {
        let mut properties = rustc_hash::FxHashMap::default();
        properties.insert("State".to_string(), STATE_SEARCHING.to_string());
        let entity_id = store.create_entity(
            "Neuron",
            &format!("{ident}-{index}"),
            CONTEXT_SYSTEM,
            &properties,
        );
        let neuron = Neuron {
            entity_id,
            store: store.clone(),
            mapper: mapper.clone(),
            scheduler: Arc::clone(&scheduler),
            cortex: Arc::clone(&cortex),
            signal: signal.clone(),
            history,
        };
        handles.push(tokio::spawn(neuron.run()));
    }
    handles
}

impl Neuron {
    async fn run(self) {
        loop {
            if !self.store.is_alive() {
                self.set_state(STATE_DEAD);
                break;
            }
            match self.claim_next() {
                Some(job_entity) => {
                    self.set_state(STATE_WORKING);
                    self.process(job_entity).await;
                    self.set_state(STATE_SEARCHING);
                }
                None => {
                    let _ = tokio::time::timeout(
                        Duration::from_millis(10),
                        self.signal.recv_async(),
                    )
                    .await;
                }
            }
        }
        debug!(neuron = self.entity_id, "neuron exited");
    }

    fn set_state(&self, state: &str) {
        if let Err(err) = self.store.set_property("Neuron", self.entity_id, "State", state) {
            error!(neuron = self.entity_id, %err, "neuron state update failed");
        }
    }

    /// Claim the lowest-id open job, if any.
    fn claim_next(&self) -> Option<Entity> {
        let jobs = match job::open_jobs(&self.store) {
            Ok(jobs) => jobs,
            Err(err) => {
                error!(%err, "open-job query failed");
                return None;
            }
        };
        for candidate in jobs.entities {
            match job::claim(&self.store, candidate.id) {
                Ok(true) => return Some(candidate),
                Ok(false) => continue,
                Err(err) => {
                    error!(job = candidate.id, %err, "job claim failed");
                }
            }
        }
        None
    }

    async fn process(&self, job_entity: Entity) {
        let job_id = job_entity.id;
        let (Some(action_name), Some(dependency)) = (
            job_entity.properties.get("Action").cloned(),
            job_entity.properties.get("Requirement").cloned(),
        ) else {
            error!(job = job_id, "job entity without action/requirement");
            let _ = job::fail(&self.store, job_id);
            return;
        };
        let input = match job::decode_input(&job_entity) {
            Ok(input) => input,
            Err(err) => {
                error!(job = job_id, %err, "job input decode failed");
                let _ = job::fail(&self.store, job_id);
                return;
            }
        };
        let action = match self.cortex.action(&action_name) {
            Ok(action) => action,
            Err(err) => {
                error!(job = job_id, %err, "job references unknown action");
                let _ = job::fail(&self.store, job_id);
                return;
            }
        };

        let context = input.context.clone();
        match action.execute(input, &dependency, &context, job_id).await {
            Ok(outputs) => {
                for output in outputs {
                    let tagged = self.mapper.map(&output);
                    self.scheduler.run(&tagged, &self.cortex);
                }
                if let Err(err) = job::complete(&self.store, job_id, self.history) {
                    error!(job = job_id, %err, "job completion failed");
                }
            }
            Err(err) => {
                error!(job = job_id, action = %action_name, %err, "action execution failed");
                let _ = job::fail(&self.store, job_id);
            }
        }
    }
}
