//! Configuration parsing and validation errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid KDL: {0}")]
    Syntax(#[from] kdl::KdlError),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("duplicate job '{0}'")]
    DuplicateJob(String),

    #[error("job '{job}' depends on unknown job '{dependency}'")]
    UnknownDependency { job: String, dependency: String },

    #[error("job '{job}' references unknown cache '{cache}'")]
    UnknownCache { job: String, cache: String },

    #[error("dependency cycle: {0}")]
    DependencyCycle(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
