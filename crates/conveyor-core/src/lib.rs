//! Core domain types and traits for the Conveyor CI orchestrator.
//!
//! This crate contains:
//! - Run identifiers and common types
//! - Pipeline, job, and step definitions
//! - Run and job status types
//! - The step executor trait (process boundary)
//! - The cache store trait, cache keys, and cache entries
//! - The trigger evaluator

pub mod cache;
pub mod error;
pub mod executor;
pub mod id;
pub mod pipeline;
pub mod run;
pub mod trigger;

pub use error::{Error, Result};
pub use id::RunId;
