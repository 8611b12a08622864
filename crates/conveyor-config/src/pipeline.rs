//! Pipeline configuration parsing.

use crate::{ConfigError, ConfigResult};
use conveyor_core::pipeline::{CacheConfig, JobConfig, Pipeline, Step, Trigger};
use kdl::{KdlDocument, KdlNode};
use std::collections::HashMap;
use std::time::Duration;

/// Parse a pipeline configuration from KDL text.
pub fn parse_pipeline(kdl: &str) -> ConfigResult<Pipeline> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = String::new();
    let mut repository = None;
    let mut triggers = Vec::new();
    let mut jobs: Vec<JobConfig> = Vec::new();
    let mut caches = Vec::new();
    let mut env = HashMap::new();

    for node in doc.nodes() {
        match node.name().value() {
            "pipeline" => {
                name = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?;
            }
            "repository" => {
                repository = get_first_string_arg(node);
            }
            "on" => {
                triggers.push(parse_trigger(node)?);
            }
            "job" => {
                jobs.push(parse_job(node)?);
            }
            "cache" => {
                caches.push(parse_cache(node)?);
            }
            "env" => {
                parse_env_block(node, &mut env);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    if name.is_empty() {
        return Err(ConfigError::MissingField("pipeline name".to_string()));
    }

    let pipeline = Pipeline {
        name,
        repository,
        triggers,
        jobs,
        caches,
        env,
    };

    validate(&pipeline)?;

    Ok(pipeline)
}

/// Validate the job graph and cross-references.
fn validate(pipeline: &Pipeline) -> ConfigResult<()> {
    // Unique job names
    let mut seen = Vec::new();
    for job in &pipeline.jobs {
        if seen.contains(&job.name.as_str()) {
            return Err(ConfigError::DuplicateJob(job.name.clone()));
        }
        seen.push(job.name.as_str());
    }

    // Dependency references resolve
    for job in &pipeline.jobs {
        for dep in &job.needs {
            if pipeline.job(dep).is_none() {
                return Err(ConfigError::UnknownDependency {
                    job: job.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    // Cache references resolve
    for job in &pipeline.jobs {
        for step in &job.steps {
            let cache_ref = match step {
                Step::CacheRestore { cache } | Step::CacheSave { cache } => Some(cache),
                _ => None,
            };
            if let Some(cache) = cache_ref {
                if pipeline.cache(cache).is_none() {
                    return Err(ConfigError::UnknownCache {
                        job: job.name.clone(),
                        cache: cache.clone(),
                    });
                }
            }
        }
    }

    // No dependency cycles
    if let Err(cycle) = detect_cycle(&pipeline.jobs) {
        return Err(ConfigError::DependencyCycle(cycle));
    }

    Ok(())
}

fn parse_trigger(node: &KdlNode) -> ConfigResult<Trigger> {
    let trigger_type = get_first_string_arg(node).unwrap_or_default();

    match trigger_type.as_str() {
        "push" => {
            let branches = get_string_list_prop(node, "branches");
            if branches.is_empty() {
                return Err(ConfigError::MissingField(
                    "branches for push trigger".to_string(),
                ));
            }
            Ok(Trigger::Push { branches })
        }
        "pull_request" => {
            let branches = get_string_list_prop(node, "branches");
            Ok(Trigger::PullRequest {
                branches: if branches.is_empty() {
                    None
                } else {
                    Some(branches)
                },
            })
        }
        _ => Err(ConfigError::InvalidValue {
            field: "trigger type".to_string(),
            message: format!("unknown trigger type: {}", trigger_type),
        }),
    }
}

fn parse_job(node: &KdlNode) -> ConfigResult<JobConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("job name".to_string()))?;

    let needs = get_string_list_prop(node, "needs");

    let mut steps = Vec::new();
    let mut env = HashMap::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "step" => {
                    steps.push(parse_step(child, &name)?);
                }
                "env" => {
                    parse_env_block(child, &mut env);
                }
                _ => {}
            }
        }
    }

    if steps.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "steps for job '{}'",
            name
        )));
    }

    Ok(JobConfig {
        name,
        needs,
        steps,
        env,
    })
}

fn parse_step(node: &KdlNode, job: &str) -> ConfigResult<Step> {
    let kind = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField(format!("step kind in job '{}'", job)))?;

    match kind.as_str() {
        "checkout" => Ok(Step::Checkout),
        "cache-restore" => {
            let cache = get_string_prop(node, "cache").ok_or_else(|| {
                ConfigError::MissingField(format!("cache for cache-restore in job '{}'", job))
            })?;
            Ok(Step::CacheRestore { cache })
        }
        "cache-save" => {
            let cache = get_string_prop(node, "cache").ok_or_else(|| {
                ConfigError::MissingField(format!("cache for cache-save in job '{}'", job))
            })?;
            Ok(Step::CacheSave { cache })
        }
        "run" => {
            let timeout = match get_int_prop(node, "timeout") {
                Some(secs) if secs > 0 => Some(Duration::from_secs(secs as u64)),
                Some(secs) => {
                    return Err(ConfigError::InvalidValue {
                        field: "timeout".to_string(),
                        message: format!("must be a positive number of seconds, got {}", secs),
                    });
                }
                None => None,
            };

            let mut command = Vec::new();
            let mut env = HashMap::new();

            if let Some(children) = node.children() {
                for child in children.nodes() {
                    match child.name().value() {
                        "command" => {
                            command = get_all_string_args(child);
                        }
                        "env" => {
                            parse_env_block(child, &mut env);
                        }
                        _ => {}
                    }
                }
            }

            let mut parts = command.into_iter();
            let program = parts.next().ok_or_else(|| {
                ConfigError::MissingField(format!("command for run step in job '{}'", job))
            })?;

            Ok(Step::Run {
                command: program,
                args: parts.collect(),
                env,
                timeout,
            })
        }
        other => Err(ConfigError::InvalidValue {
            field: "step kind".to_string(),
            message: format!("unknown step kind: {}", other),
        }),
    }
}

fn parse_cache(node: &KdlNode) -> ConfigResult<CacheConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("cache name".to_string()))?;

    let mut paths = Vec::new();
    let mut key = String::new();
    let mut inputs = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "path" => {
                    if let Some(p) = get_first_string_arg(child) {
                        paths.push(p);
                    }
                }
                "key" => {
                    key = get_first_string_arg(child).unwrap_or_default();
                }
                "input" => {
                    if let Some(i) = get_first_string_arg(child) {
                        inputs.push(i);
                    }
                }
                _ => {}
            }
        }
    }

    if key.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "key for cache '{}'",
            name
        )));
    }
    if paths.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "paths for cache '{}'",
            name
        )));
    }

    Ok(CacheConfig {
        name,
        paths,
        key,
        inputs,
    })
}

fn parse_env_block(node: &KdlNode, env: &mut HashMap<String, String>) {
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let key = child.name().value().to_string();
            if let Some(val) = get_first_string_arg(child) {
                env.insert(key, val);
            }
        }
    }
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_int_prop(node: &KdlNode, name: &str) -> Option<i128> {
    node.get(name).and_then(|v| v.as_integer())
}

fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let mut result = Vec::new();

    // Collect repeated attributes like needs="a" needs="b"
    for entry in node.entries() {
        if let Some(entry_name) = entry.name() {
            if entry_name.value() == name {
                if let Some(s) = entry.value().as_string() {
                    result.push(s.to_string());
                }
            }
        }
    }

    if !result.is_empty() {
        return result;
    }

    // Check children for block syntax
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == name {
                return get_all_string_args(child);
            }
        }
    }

    Vec::new()
}

/// Detect cycles in the job dependency graph using DFS.
fn detect_cycle(jobs: &[JobConfig]) -> Result<(), String> {
    let mut visited = HashMap::new();
    let mut rec_stack = HashMap::new();

    let job_map: HashMap<&str, &JobConfig> = jobs.iter().map(|j| (j.name.as_str(), j)).collect();

    for job in jobs {
        if !visited.contains_key(job.name.as_str()) {
            if let Some(cycle) = dfs_detect_cycle(&job.name, &job_map, &mut visited, &mut rec_stack)
            {
                return Err(cycle);
            }
        }
    }
    Ok(())
}

fn dfs_detect_cycle<'a>(
    node: &'a str,
    job_map: &'a HashMap<&'a str, &'a JobConfig>,
    visited: &mut HashMap<&'a str, bool>,
    rec_stack: &mut HashMap<&'a str, bool>,
) -> Option<String> {
    visited.insert(node, true);
    rec_stack.insert(node, true);

    if let Some(job) = job_map.get(node) {
        for dep in &job.needs {
            let dep_str: &'a str = dep.as_str();
            if !visited.contains_key(dep_str) {
                if let Some(cycle) = dfs_detect_cycle(dep_str, job_map, visited, rec_stack) {
                    return Some(cycle);
                }
            } else if rec_stack.get(dep_str).copied().unwrap_or(false) {
                return Some(format!("{} -> {}", node, dep));
            }
        }
    }

    rec_stack.insert(node, false);
    None
}
