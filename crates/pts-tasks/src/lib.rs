//! # pts-tasks
//!
//! The Package Tracking System task engine: a plug-in registry of
//! data-processing tasks connected by a producer/consumer event graph,
//! topologically scheduled, persistently check-pointed and resumable after
//! a crash.

pub mod dag;
pub mod events;
pub mod job;
pub mod registry;
pub mod state;

pub use dag::{Dag, DagError};
pub use events::Event;
pub use job::{continue_incomplete_jobs, run_task, Job};
pub use registry::{
    global_registry, init_global_registry, Task, TaskContext, TaskDefinition, TaskRegistry,
};
pub use state::JobState;
