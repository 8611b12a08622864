//! Variable interpolation for pipeline configurations.
//!
//! Supports variables like:
//! - `${ref}` - Ref the run was triggered for
//! - `${event}` - Trigger kind (push, pull_request)
//! - `${run.id}` - Run ID
//! - `${pipeline.name}` - Pipeline name
//! - `${env.VAR_NAME}` - Environment variable from the pipeline env
//!
//! Unknown variables are left untouched. In particular `${hash}` in cache
//! key templates survives interpolation and is resolved by the job runner
//! from the cache's input files.

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;

static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}").unwrap()
});

/// Variables available for interpolation during one run.
#[derive(Debug, Clone, Default)]
pub struct RunVars {
    /// Ref the run was triggered for.
    pub r#ref: String,
    /// Trigger kind.
    pub event: String,
    /// Run ID as a string.
    pub run_id: String,
    /// Pipeline name.
    pub pipeline_name: String,
    /// Pipeline-level environment, addressable as `${env.NAME}`.
    pub env: HashMap<String, String>,
}

impl RunVars {
    fn resolve(&self, name: &str) -> Option<String> {
        match name {
            "ref" => Some(self.r#ref.clone()),
            "event" => Some(self.event.clone()),
            "run.id" => Some(self.run_id.clone()),
            "pipeline.name" => Some(self.pipeline_name.clone()),
            _ => name
                .strip_prefix("env.")
                .and_then(|key| self.env.get(key).cloned()),
        }
    }

    /// Interpolate variables in a string. Unknown variables pass through.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &Captures| {
                let name = &caps[1];
                self.resolve(name).unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    /// Interpolate every value in a map.
    pub fn interpolate_map(&self, map: &HashMap<String, String>) -> HashMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.interpolate(v)))
            .collect()
    }

    /// Interpolate every element of a list.
    pub fn interpolate_vec(&self, items: &[String]) -> Vec<String> {
        items.iter().map(|s| self.interpolate(s)).collect()
    }
}
