//! KDL configuration parsing for Conveyor.
//!
//! This crate handles:
//! - Pipeline definitions (conveyor.kdl)
//! - Job graph validation (unknown references, cycles)
//! - Variable interpolation

pub mod error;
pub mod interpolate;
pub mod pipeline;

pub use error::{ConfigError, ConfigResult};
pub use interpolate::RunVars;
pub use pipeline::parse_pipeline;
