//! ```text
//! payload ──► Mapper ──► tagged batch ──► Scheduler ─┬─► Jobs (store)
//!               ▲                          │         │
//!               │                          ├─► PatternCache
//!               │                          ├─► Demultiplexer
//!               │                          └─► WitnessGuard (Memory)
//!               │
//!  Neurons ◄────┴── outputs re-enter the mapper, closing the loop
//!     │
//!     └─► Observer detects quiescence and drives shutdown
//! ```
//!
//! Reflexgraph is a reactive dependency scheduler over a typed property
//! graph: actions declare dependency patterns, incremental updates enter a
//! tagging mapper, and the scheduler turns each delta into exactly the set
//! of newly satisfiable jobs — causally new, demultiplexed into
//! independent inputs, and deduplicated by graph-native witnesses. A
//! worker pool executes the jobs until the observer sees the fixed point.

pub mod config;
pub mod cortex;
pub mod demux;
pub mod job;
pub mod kernel;
pub mod neuron;
pub mod observer;
pub mod pattern;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod transport;
pub mod witness;
