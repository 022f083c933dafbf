#![allow(dead_code)]

pub mod actions;

#[allow(unused_imports)]
pub use actions::*;

use std::sync::Arc;

use reflexgraph::cortex::{ActionFactory, Cortex};
use reflexgraph::scheduler::Scheduler;
use reflexgraph::store::{mapper::Mapper, GraphStore, Query};
use reflexgraph::transport::Entity;

/// One fresh kernel-shaped fixture per test: store, mapper, registry and a
/// scheduler, with the given actions registered under their config names.
pub struct Harness {
    pub store: GraphStore,
    pub mapper: Mapper,
    pub cortex: Cortex,
    pub scheduler: Scheduler,
}

pub fn setup(factories: &[ActionFactory]) -> Harness {
    let store = GraphStore::new();
    let mapper = Mapper::new(store.clone());
    let cortex = Cortex::new(store.clone(), mapper.clone());
    for factory in factories {
        let name = factory().config().value;
        cortex
            .register(&name, Arc::clone(factory))
            .expect("action registration");
    }
    let scheduler = Scheduler::new(store.clone(), mapper.clone());
    Harness {
        store,
        mapper,
        cortex,
        scheduler,
    }
}

impl Harness {
    /// Map data without scheduling (test seeding).
    pub fn seed(&self, data: &Entity) -> Entity {
        self.mapper.map(data)
    }

    /// Map data and run the scheduler on the tagged batch.
    pub fn feed(&self, data: &Entity) -> Entity {
        let tagged = self.mapper.map(data);
        self.scheduler.run(&tagged, &self.cortex);
        tagged
    }

    pub fn job_count(&self) -> usize {
        self.store
            .query(&Query::read("Job"))
            .expect("job query")
            .amount
    }

    pub fn find_id(&self, kind: &str, value: &str) -> i64 {
        let result = self
            .store
            .query(&Query::read(kind).match_("Value", "==", value))
            .expect("lookup query");
        assert!(result.amount > 0, "no {kind} with value {value}");
        result.entities[0].id
    }
}
