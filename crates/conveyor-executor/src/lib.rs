//! Step execution backends for Conveyor.
//!
//! Provides executor implementations for running pipeline steps. The local
//! process executor is the default; it is the only place in the system that
//! spawns OS processes.

pub mod local;

pub use conveyor_core::executor::{ExecOutcome, ExecSpec, StepExecutor};
pub use local::LocalProcessExecutor;
