//! Pipeline, job, and step definitions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// A CI pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline name (e.g., "my-service").
    pub name: String,
    /// Repository URL used by checkout steps.
    pub repository: Option<String>,
    /// Triggers that can start this pipeline.
    pub triggers: Vec<Trigger>,
    /// Jobs, in definition order.
    pub jobs: Vec<JobConfig>,
    /// Named cache configurations referenced by cache steps.
    pub caches: Vec<CacheConfig>,
    /// Global environment variables.
    pub env: HashMap<String, String>,
}

impl Pipeline {
    /// Look up a job by name.
    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|j| j.name == name)
    }

    /// Look up a cache configuration by name.
    pub fn cache(&self, name: &str) -> Option<&CacheConfig> {
        self.caches.iter().find(|c| c.name == name)
    }
}

/// What triggers a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Trigger {
    /// Triggered on push to matching branches.
    Push { branches: Vec<String> },
    /// Triggered on pull request. Matches any target branch unless
    /// `branches` restricts it.
    PullRequest { branches: Option<Vec<String>> },
}

/// A named unit of work containing ordered steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Job name.
    pub name: String,
    /// Dependencies (other job names).
    pub needs: Vec<String>,
    /// Ordered steps.
    pub steps: Vec<Step>,
    /// Job-level environment variables, layered over the pipeline env.
    pub env: HashMap<String, String>,
}

/// A single action within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Step {
    /// Clone the triggering ref into the job workspace.
    Checkout,
    /// Restore a named cache into the workspace. A miss is not a failure.
    CacheRestore { cache: String },
    /// Save the named cache's paths from the workspace. Best-effort.
    CacheSave { cache: String },
    /// Run an external command in the workspace.
    Run {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        timeout: Option<Duration>,
    },
}

impl Step {
    /// Short kind name for logs and events.
    pub fn kind(&self) -> &'static str {
        match self {
            Step::Checkout => "checkout",
            Step::CacheRestore { .. } => "cache-restore",
            Step::CacheSave { .. } => "cache-save",
            Step::Run { .. } => "run",
        }
    }

    /// Cache steps never fail their job; everything else can.
    pub fn is_cache_op(&self) -> bool {
        matches!(self, Step::CacheRestore { .. } | Step::CacheSave { .. })
    }
}

/// A named cache: which paths to capture and how to derive the key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache name.
    pub name: String,
    /// Workspace-relative paths to cache.
    pub paths: Vec<String>,
    /// Key template; `${hash}` expands to the input file digest.
    pub key: String,
    /// Workspace-relative files hashed into the key (e.g., a lockfile).
    pub inputs: Vec<String>,
}
