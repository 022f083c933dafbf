//! The batch-learning façade.
//!
//! [`Kernel`] wires the store, mapper, scheduler, registry and worker pool
//! together behind a small surface: register actions, start the workers,
//! feed data, hand out an observer. The scheduler stays a synchronous
//! call on whatever task feeds the data; only workers and the observer run
//! as Tokio tasks.

use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;

use crate::cortex::{ActionFactory, Cortex, CortexError};
use crate::neuron;
use crate::observer::{EndCallback, Observer};
use crate::scheduler::Scheduler;
use crate::store::{mapper::Mapper, GraphStore};
use crate::telemetry::{self, LogLevel, Verbosity};
use crate::transport::Entity;

/// Initialisation settings of a kernel.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Worker count; 0 means one per logical CPU.
    pub neuron_amount: usize,
    /// Instance name, used for worker descriptor values.
    pub ident: String,
    pub log_level: LogLevel,
    pub verbosity: Verbosity,
    /// Keep completed `Job` entities for inspection.
    pub history: bool,
    /// Allow synthesised queries to match entities across contexts.
    pub match_across_contexts: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            neuron_amount: 0,
            ident: "reflexgraph".to_string(),
            log_level: LogLevel::default(),
            verbosity: Verbosity::default(),
            history: false,
            match_across_contexts: true,
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum KernelError {
    #[error("worker pool already started")]
    #[diagnostic(code(reflexgraph::kernel::already_started))]
    AlreadyStarted,

    #[error(transparent)]
    #[diagnostic(code(reflexgraph::kernel::cortex))]
    Cortex(#[from] CortexError),
}

/// A fully wired reasoning kernel.
pub struct Kernel {
    settings: Settings,
    store: GraphStore,
    mapper: Mapper,
    cortex: Arc<Cortex>,
    scheduler: Arc<Scheduler>,
    job_signal: flume::Receiver<()>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Kernel {
    #[must_use]
    pub fn new(mut settings: Settings) -> Self {
        if settings.neuron_amount == 0 {
            settings.neuron_amount = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
        }
        telemetry::init(settings.log_level, settings.verbosity);

        let store = GraphStore::new();
        let mapper = Mapper::new(store.clone());
        let cortex = Arc::new(Cortex::new(store.clone(), mapper.clone()));
        let (signal_tx, signal_rx) = flume::unbounded();
        let scheduler = Arc::new(
            Scheduler::new(store.clone(), mapper.clone())
                .with_job_signal(signal_tx)
                .match_across_contexts(settings.match_across_contexts),
        );
        Self {
            settings,
            store,
            mapper,
            cortex,
            scheduler,
            job_signal: signal_rx,
            handles: Vec::new(),
        }
    }

    /// Register (or re-register) an action; stale compiled patterns are
    /// invalidated.
    pub fn register_action(&self, name: &str, factory: ActionFactory) -> Result<(), KernelError> {
        let stale = self.cortex.register(name, factory)?;
        for dep_id in stale {
            self.scheduler.invalidate_pattern(name, dep_id);
        }
        Ok(())
    }

    /// Spawn the worker pool. Must run inside a Tokio runtime.
    pub fn start(&mut self) -> Result<(), KernelError> {
        if !self.handles.is_empty() {
            return Err(KernelError::AlreadyStarted);
        }
        self.handles = neuron::spawn(
            self.settings.neuron_amount,
            &self.settings.ident,
            self.store.clone(),
            self.mapper.clone(),
            Arc::clone(&self.scheduler),
            Arc::clone(&self.cortex),
            self.job_signal.clone(),
            self.settings.history,
        );
        Ok(())
    }

    /// Merge data into the graph without scheduling.
    pub fn learn(&self, data: &Entity) -> Entity {
        self.mapper.map(data)
    }

    /// Merge data and schedule everything the delta newly satisfies.
    pub fn learn_and_schedule(&self, data: &Entity) -> Entity {
        let tagged = self.mapper.map(data);
        self.scheduler.run(&tagged, &self.cortex);
        tagged
    }

    /// An observer over this kernel's store and worker pool.
    #[must_use]
    pub fn observer(&self, callback: EndCallback, lethal: bool) -> Observer {
        Observer::new(
            self.store.clone(),
            self.settings.neuron_amount,
            callback,
            lethal,
        )
    }

    #[must_use]
    pub fn store(&self) -> GraphStore {
        self.store.clone()
    }

    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn cortex(&self) -> &Cortex {
        &self.cortex
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}
