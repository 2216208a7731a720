//! The cycle state machine and its scheduler.

pub mod cycle;
pub mod scheduler;

pub use cycle::{
    CycleConfig, CycleDeps, CycleOrchestrator, CycleReport, CycleStage, RetryPolicy,
};
pub use scheduler::spawn_cycle_loop;
