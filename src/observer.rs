//! Observer: quiescence detection and shutdown.
//!
//! The observer polls the store every 100 ms. The fixed point is reached
//! when there are no unfinished jobs, every worker reports `Searching`,
//! and no worker's descriptor version has advanced for five consecutive
//! ticks. Any progress resets the counter. On quiescence an optional end
//! callback receives the store handle; in lethal mode the store is
//! terminated first and the observer waits for every worker to reach
//! `Dead`.
//!
//! A tick function can be registered for periodic instrumentation; it
//! fires every `tick_rate` polling iterations.

use std::time::Duration;

use tracing::{debug, info};

use crate::job;
use crate::neuron::{STATE_DEAD, STATE_SEARCHING};
use crate::store::{GraphStore, Query};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEAD_WAIT: Duration = Duration::from_millis(10);
const QUIESCENT_TICKS: u32 = 5;

/// End-of-run callback, invoked once with the store handle.
pub type EndCallback = Box<dyn FnOnce(&GraphStore) + Send>;
/// Periodic instrumentation hook.
pub type TickFunction = Box<dyn Fn(&GraphStore) + Send>;

struct Tracker {
    id: i64,
    version: u32,
}

/// Single-purpose loop driving the system to a graceful stop.
pub struct Observer {
    store: GraphStore,
    runner_amount: usize,
    trackers: Vec<Tracker>,
    inactive_increment: u32,
    lethal: bool,
    callback: Option<EndCallback>,
    tick_function: Option<TickFunction>,
    tick_rate: u32,
}

impl Observer {
    /// Snapshot the current worker versions and prepare the loop.
    /// `lethal` decides whether quiescence terminates the store.
    #[must_use]
    pub fn new(
        store: GraphStore,
        runner_amount: usize,
        callback: EndCallback,
        lethal: bool,
    ) -> Self {
        info!("creating observer");
        let trackers = match store.query(&Query::read("Neuron")) {
            Ok(result) => result
                .entities
                .iter()
                .map(|e| Tracker {
                    id: e.id,
                    version: e.version,
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        Self {
            store,
            runner_amount,
            trackers,
            inactive_increment: 0,
            lethal,
            callback: Some(callback),
            tick_function: None,
            tick_rate: 25,
        }
    }

    pub fn register_tick_function(&mut self, tick: TickFunction) {
        self.tick_function = Some(tick);
    }

    pub fn set_tick_rate(&mut self, tick_rate: u32) {
        self.tick_rate = tick_rate.max(1);
    }

    /// Block until the fixed point (or external termination), then run the
    /// endgame.
    pub async fn run(mut self) {
        let mut iteration = 0;
        while !self.reached_endgame() {
            iteration += 1;
            if iteration == self.tick_rate {
                if let Some(tick) = &self.tick_function {
                    tick(&self.store);
                }
                iteration = 0;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        self.endgame().await;
        info!("observer finished, system is quiescent");
    }

    fn reached_endgame(&mut self) -> bool {
        // external termination stops the loop immediately
        if !self.store.is_alive() {
            return true;
        }
        let searching = match self
            .store
            .query(&Query::read("Neuron").match_("Properties.State", "==", STATE_SEARCHING))
        {
            Ok(result) => result,
            Err(_) => return false,
        };
        let unfinished = job::unfinished_jobs(&self.store).unwrap_or(usize::MAX);
        debug!(
            searching = searching.amount,
            total = self.runner_amount,
            unfinished,
            "observer tick"
        );
        if unfinished != 0 || searching.amount != self.runner_amount {
            self.inactive_increment = 0;
            return false;
        }
        let mut changed_version = false;
        for worker in &searching.entities {
            for tracker in &mut self.trackers {
                if tracker.id == worker.id && tracker.version != worker.version {
                    tracker.version = worker.version;
                    changed_version = true;
                }
            }
        }
        if changed_version {
            self.inactive_increment = 0;
            return false;
        }
        if self.inactive_increment > QUIESCENT_TICKS {
            return true;
        }
        self.inactive_increment += 1;
        false
    }

    async fn endgame(&mut self) {
        info!("executing endgame");
        if self.lethal {
            self.store.terminate();
            while !self.all_neurons_dead() {
                tokio::time::sleep(DEAD_WAIT).await;
            }
        }
        if let Some(callback) = self.callback.take() {
            callback(&self.store);
        }
    }

    fn all_neurons_dead(&self) -> bool {
        self.store
            .query(&Query::read("Neuron").match_("Properties.State", "==", STATE_DEAD))
            .map(|result| result.amount == self.runner_amount)
            .unwrap_or(false)
    }
}
