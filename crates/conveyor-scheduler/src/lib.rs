//! Run scheduling and job execution for Conveyor.
//!
//! The [`Scheduler`] walks the job dependency graph, runs ready jobs
//! concurrently up to a limit, and rolls their statuses up into a run
//! result. Each job is driven by the [`JobRunner`], which sequences steps
//! inside an ephemeral workspace.

pub mod runner;
pub mod scheduler;

pub use runner::{JobRunner, RunContext};
pub use scheduler::{RunEvent, RunReport, Scheduler};
