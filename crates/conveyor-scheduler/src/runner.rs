//! Job runner - executes one job's steps strictly in order.

use bytes::Bytes;
use conveyor_config::RunVars;
use conveyor_core::cache::{CacheEntry, CacheKey, CacheStore};
use conveyor_core::executor::{ExecSpec, StepExecutor};
use conveyor_core::pipeline::{CacheConfig, JobConfig, Step};
use conveyor_core::run::JobStatus;
use conveyor_core::{Error, Result};
use std::collections::HashMap;
use std::path::{Component, Path};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::scheduler::RunEvent;

/// Per-run context shared by every job.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Repository URL for checkout steps.
    pub repository: Option<String>,
    /// Ref checkout steps clone.
    pub checkout_ref: String,
    /// Pipeline-level environment.
    pub env: HashMap<String, String>,
    /// Named caches referenced by cache steps.
    pub caches: HashMap<String, CacheConfig>,
    /// Variables for `${...}` interpolation.
    pub vars: RunVars,
}

/// Executes a job's steps in order inside an ephemeral workspace.
///
/// The workspace is a temp directory torn down when the job terminates,
/// on every exit path. The first failing non-cache step stops the job;
/// cache step errors are logged and swallowed.
pub struct JobRunner {
    executor: Arc<dyn StepExecutor>,
    cache: Arc<dyn CacheStore>,
    ctx: RunContext,
}

impl JobRunner {
    pub fn new(
        executor: Arc<dyn StepExecutor>,
        cache: Arc<dyn CacheStore>,
        ctx: RunContext,
    ) -> Self {
        Self {
            executor,
            cache,
            ctx,
        }
    }

    /// Run every step of `job`, reporting the terminal status.
    ///
    /// Cancellation is observed at each step boundary; an in-flight
    /// checkout or run-command is additionally raced against the signal
    /// and terminated.
    pub async fn run_job(
        &self,
        job: &JobConfig,
        cancel: watch::Receiver<bool>,
        events: &mpsc::Sender<RunEvent>,
    ) -> JobStatus {
        let workspace = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                return JobStatus::Failed {
                    message: format!("failed to create workspace: {}", e),
                };
            }
        };

        // Cache keys are derived once per job and shared between the
        // restore and save steps of the same cache.
        let mut keys: HashMap<String, CacheKey> = HashMap::new();

        for step in &job.steps {
            if *cancel.borrow() {
                info!(job = %job.name, "job cancelled at step boundary");
                return JobStatus::Cancelled;
            }

            let _ = events
                .send(RunEvent::StepStarted {
                    job: job.name.clone(),
                    step: step.kind(),
                })
                .await;

            let result = self
                .run_step(job, step, workspace.path(), &mut keys, &cancel)
                .await;

            let success = result.is_ok();
            let _ = events
                .send(RunEvent::StepFinished {
                    job: job.name.clone(),
                    step: step.kind(),
                    success,
                })
                .await;

            match result {
                Ok(()) => {}
                Err(Error::Cancelled) => {
                    info!(job = %job.name, step = step.kind(), "job cancelled mid-step");
                    return JobStatus::Cancelled;
                }
                Err(e) if step.is_cache_op() => {
                    // Cache trouble never fails the job.
                    warn!(job = %job.name, step = step.kind(), error = %e, "cache step error ignored");
                }
                Err(e) => {
                    return JobStatus::Failed {
                        message: format!("{} step failed: {}", step.kind(), e),
                    };
                }
            }
        }

        JobStatus::Succeeded
    }

    async fn run_step(
        &self,
        job: &JobConfig,
        step: &Step,
        workspace: &Path,
        keys: &mut HashMap<String, CacheKey>,
        cancel: &watch::Receiver<bool>,
    ) -> Result<()> {
        match step {
            Step::Checkout => self.checkout(workspace, cancel).await,
            Step::CacheRestore { cache } => self.cache_restore(cache, workspace, keys).await,
            Step::CacheSave { cache } => self.cache_save(cache, workspace, keys).await,
            Step::Run {
                command,
                args,
                env,
                timeout,
            } => {
                self.run_command(job, command, args, env, *timeout, workspace, cancel)
                    .await
            }
        }
    }

    async fn checkout(&self, workspace: &Path, cancel: &watch::Receiver<bool>) -> Result<()> {
        let repository = self
            .ctx
            .repository
            .as_deref()
            .ok_or_else(|| Error::Workspace("no repository configured for checkout".to_string()))?;

        // Git needs PATH for its subcommands and HOME for its config; the
        // rest of the orchestrator environment stays out of the clone.
        let mut env = HashMap::from([("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())]);
        for var in ["PATH", "HOME"] {
            if let Ok(value) = std::env::var(var) {
                env.insert(var.to_string(), value);
            }
        }

        let spec = ExecSpec::new("git", workspace)
            .args([
                "clone",
                "--depth",
                "1",
                "--branch",
                &self.ctx.checkout_ref,
                repository,
                ".",
            ])
            .env(env);

        info!(repository, r#ref = %self.ctx.checkout_ref, "checking out");

        let outcome = tokio::select! {
            _ = cancelled(cancel.clone()) => return Err(Error::Cancelled),
            result = self.executor.execute(spec) => {
                result.map_err(|e| Error::Workspace(format!("clone failed: {}", e)))?
            }
        };

        if outcome.success() {
            Ok(())
        } else {
            Err(Error::Workspace(format!(
                "clone exited with {:?}: {}",
                outcome.exit_code,
                last_line(&outcome.stderr)
            )))
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_command(
        &self,
        job: &JobConfig,
        command: &str,
        args: &[String],
        step_env: &HashMap<String, String>,
        timeout: Option<std::time::Duration>,
        workspace: &Path,
        cancel: &watch::Receiver<bool>,
    ) -> Result<()> {
        // pipeline env, then job env, then step env; later layers win.
        let mut env = self.ctx.env.clone();
        env.extend(job.env.clone());
        env.extend(step_env.clone());
        let env = self.ctx.vars.interpolate_map(&env);

        let program = self.ctx.vars.interpolate(command);
        let args = self.ctx.vars.interpolate_vec(args);

        let spec = ExecSpec::new(program.clone(), workspace)
            .args(args)
            .env(env)
            .timeout(timeout);

        let outcome = tokio::select! {
            _ = cancelled(cancel.clone()) => return Err(Error::Cancelled),
            result = self.executor.execute(spec) => result?,
        };

        if outcome.success() {
            Ok(())
        } else {
            Err(Error::ExecutionFailed(format!(
                "'{}' exited with {:?}: {}",
                program,
                outcome.exit_code,
                last_line(&outcome.stderr)
            )))
        }
    }

    async fn cache_restore(
        &self,
        cache: &str,
        workspace: &Path,
        keys: &mut HashMap<String, CacheKey>,
    ) -> Result<()> {
        let config = self.cache_config(cache)?;
        let key = self.cache_key(&config, workspace, keys).await?;

        match self.cache.get(&key).await {
            Ok(Some(entry)) => {
                info!(cache, key = %key, files = entry.files.len(), "cache hit");
                let workspace = workspace.to_path_buf();
                tokio::task::spawn_blocking(move || materialize(&entry, &workspace))
                    .await
                    .map_err(|e| Error::Cache(format!("cache restore task failed: {}", e)))?
            }
            Ok(None) => {
                debug!(cache, key = %key, "cache miss");
                Ok(())
            }
            // A restore error is indistinguishable from a miss.
            Err(e) => {
                warn!(cache, key = %key, error = %e, "cache restore error, continuing without cache");
                Ok(())
            }
        }
    }

    async fn cache_save(
        &self,
        cache: &str,
        workspace: &Path,
        keys: &mut HashMap<String, CacheKey>,
    ) -> Result<()> {
        let config = self.cache_config(cache)?;
        let key = self.cache_key(&config, workspace, keys).await?;

        match self.cache.contains(&key).await {
            Ok(true) => {
                debug!(cache, key = %key, "cache key already stored, skipping save");
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => {
                warn!(cache, key = %key, error = %e, "cache probe failed, skipping save");
                return Ok(());
            }
        }

        let paths = config.paths.clone();
        let dir = workspace.to_path_buf();
        let entry = tokio::task::spawn_blocking(move || collect(&paths, &dir))
            .await
            .map_err(|e| Error::Cache(format!("cache collect task failed: {}", e)))??;
        if entry.is_empty() {
            debug!(cache, key = %key, "nothing to cache");
            return Ok(());
        }

        match self.cache.put(&key, entry).await {
            Ok(()) => {
                info!(cache, key = %key, "cache entry saved");
                Ok(())
            }
            Err(e) => {
                warn!(cache, key = %key, error = %e, "cache save failed, continuing");
                Ok(())
            }
        }
    }

    fn cache_config(&self, name: &str) -> Result<CacheConfig> {
        self.ctx
            .caches
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Cache(format!("unknown cache '{}'", name)))
    }

    async fn cache_key(
        &self,
        config: &CacheConfig,
        workspace: &Path,
        keys: &mut HashMap<String, CacheKey>,
    ) -> Result<CacheKey> {
        if let Some(key) = keys.get(&config.name) {
            return Ok(key.clone());
        }

        let template = self.ctx.vars.interpolate(&config.key);
        let name = config.name.clone();
        let inputs = config.inputs.clone();
        let workspace = workspace.to_path_buf();
        let key = tokio::task::spawn_blocking(move || {
            let mut contents = Vec::new();
            for input in &inputs {
                match std::fs::read(workspace.join(input)) {
                    Ok(bytes) => contents.push(bytes),
                    Err(e) => {
                        debug!(cache = %name, input = %input, error = %e, "cache input unreadable, skipping");
                    }
                }
            }
            CacheKey::derive(&template, contents.iter().map(|b| b.as_slice()))
        })
        .await
        .map_err(|e| Error::Cache(format!("cache key task failed: {}", e)))?;

        keys.insert(config.name.clone(), key.clone());
        Ok(key)
    }
}

/// Resolves when the cancellation flag becomes true. Never resolves if the
/// sender goes away without signalling.
pub(crate) async fn cancelled(mut rx: watch::Receiver<bool>) {
    if rx.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn last_line(text: &str) -> &str {
    text.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("")
}

/// Write a cache entry's files into the workspace.
fn materialize(entry: &CacheEntry, workspace: &Path) -> Result<()> {
    for (rel, contents) in &entry.files {
        // Entries are produced by `collect` below, but never let a stored
        // path escape the workspace.
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::Cache(format!(
                "cache entry path escapes workspace: {}",
                rel.display()
            )));
        }

        let target = workspace.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Cache(format!("restore failed: {}", e)))?;
        }
        std::fs::write(&target, contents)
            .map_err(|e| Error::Cache(format!("restore failed: {}", e)))?;
    }
    Ok(())
}

/// Capture the configured paths from the workspace into a cache entry.
/// Absent paths are skipped.
fn collect(paths: &[String], workspace: &Path) -> Result<CacheEntry> {
    let mut entry = CacheEntry::new();
    for path in paths {
        let absolute = workspace.join(path);
        if absolute.is_file() {
            let contents = std::fs::read(&absolute)
                .map_err(|e| Error::Cache(format!("collect failed: {}", e)))?;
            entry.insert(path, Bytes::from(contents));
        } else if absolute.is_dir() {
            collect_dir(workspace, &absolute, &mut entry)?;
        } else {
            debug!(path, "cache path absent, skipping");
        }
    }
    Ok(entry)
}

fn collect_dir(workspace: &Path, dir: &Path, entry: &mut CacheEntry) -> Result<()> {
    let read_dir =
        std::fs::read_dir(dir).map_err(|e| Error::Cache(format!("collect failed: {}", e)))?;
    for item in read_dir {
        let item = item.map_err(|e| Error::Cache(format!("collect failed: {}", e)))?;
        let path = item.path();
        if path.is_dir() {
            collect_dir(workspace, &path, entry)?;
        } else {
            let rel = path
                .strip_prefix(workspace)
                .map_err(|e| Error::Cache(format!("collect failed: {}", e)))?
                .to_path_buf();
            let contents =
                std::fs::read(&path).map_err(|e| Error::Cache(format!("collect failed: {}", e)))?;
            entry.insert(rel, Bytes::from(contents));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conveyor_cache::MemoryCacheStore;
    use conveyor_core::executor::ExecOutcome;
    use conveyor_executor::LocalProcessExecutor;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records every invocation; programs named "fail" exit non-zero.
    struct ScriptedExecutor {
        invocations: Mutex<Vec<ExecSpec>>,
    }

    impl ScriptedExecutor {
        fn new() -> Self {
            Self {
                invocations: Mutex::new(Vec::new()),
            }
        }

        fn programs(&self) -> Vec<String> {
            self.invocations
                .lock()
                .unwrap()
                .iter()
                .map(|s| s.program.clone())
                .collect()
        }
    }

    #[async_trait]
    impl StepExecutor for ScriptedExecutor {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn execute(&self, spec: ExecSpec) -> Result<ExecOutcome> {
            let exit_code = if spec.program == "fail" { Some(1) } else { Some(0) };
            self.invocations.lock().unwrap().push(spec);
            Ok(ExecOutcome {
                exit_code,
                stdout: String::new(),
                stderr: String::new(),
                elapsed: Duration::from_millis(1),
            })
        }
    }

    /// Cache store whose every operation errors.
    struct BrokenCacheStore;

    #[async_trait]
    impl CacheStore for BrokenCacheStore {
        async fn get(&self, _key: &CacheKey) -> Result<Option<CacheEntry>> {
            Err(Error::Cache("storage unavailable".to_string()))
        }

        async fn put(&self, _key: &CacheKey, _entry: CacheEntry) -> Result<()> {
            Err(Error::Cache("storage unavailable".to_string()))
        }

        async fn contains(&self, _key: &CacheKey) -> Result<bool> {
            Ok(false)
        }
    }

    fn context() -> RunContext {
        RunContext {
            repository: None,
            checkout_ref: "master".to_string(),
            env: HashMap::new(),
            caches: HashMap::new(),
            vars: RunVars::default(),
        }
    }

    fn run_step_job(name: &str, programs: &[&str]) -> JobConfig {
        JobConfig {
            name: name.to_string(),
            needs: Vec::new(),
            steps: programs
                .iter()
                .map(|p| Step::Run {
                    command: p.to_string(),
                    args: Vec::new(),
                    env: HashMap::new(),
                    timeout: None,
                })
                .collect(),
            env: HashMap::new(),
        }
    }

    fn channels() -> (mpsc::Sender<RunEvent>, watch::Receiver<bool>) {
        let (tx, _rx) = mpsc::channel(16);
        // Dropping the sender is fine: a closed, never-signalled channel
        // reads as "not cancelled" forever.
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        (tx, cancel_rx)
    }

    #[tokio::test]
    async fn first_failing_step_short_circuits() {
        let executor = Arc::new(ScriptedExecutor::new());
        let runner = JobRunner::new(
            executor.clone(),
            Arc::new(MemoryCacheStore::new()),
            context(),
        );
        let job = run_step_job("test", &["first", "fail", "never"]);
        let (tx, cancel) = channels();

        let status = runner.run_job(&job, cancel, &tx).await;

        assert!(matches!(status, JobStatus::Failed { .. }));
        assert_eq!(executor.programs(), vec!["first", "fail"]);
    }

    #[tokio::test]
    async fn all_steps_succeed() {
        let executor = Arc::new(ScriptedExecutor::new());
        let runner = JobRunner::new(
            executor.clone(),
            Arc::new(MemoryCacheStore::new()),
            context(),
        );
        let job = run_step_job("test", &["a", "b", "c"]);
        let (tx, cancel) = channels();

        let status = runner.run_job(&job, cancel, &tx).await;

        assert_eq!(status, JobStatus::Succeeded);
        assert_eq!(executor.programs(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn checkout_invokes_git_clone() {
        let executor = Arc::new(ScriptedExecutor::new());
        let mut ctx = context();
        ctx.repository = Some("https://example.com/repo.git".to_string());
        ctx.checkout_ref = "feature/x".to_string();
        let runner = JobRunner::new(executor.clone(), Arc::new(MemoryCacheStore::new()), ctx);

        let job = JobConfig {
            name: "co".to_string(),
            needs: Vec::new(),
            steps: vec![Step::Checkout],
            env: HashMap::new(),
        };
        let (tx, cancel) = channels();

        let status = runner.run_job(&job, cancel, &tx).await;

        assert_eq!(status, JobStatus::Succeeded);
        let invocations = executor.invocations.lock().unwrap();
        assert_eq!(invocations[0].program, "git");
        assert!(invocations[0].args.contains(&"clone".to_string()));
        assert!(invocations[0].args.contains(&"feature/x".to_string()));
    }

    #[tokio::test]
    async fn checkout_without_repository_fails_job() {
        let executor = Arc::new(ScriptedExecutor::new());
        let runner = JobRunner::new(
            executor.clone(),
            Arc::new(MemoryCacheStore::new()),
            context(),
        );
        let job = JobConfig {
            name: "co".to_string(),
            needs: Vec::new(),
            steps: vec![Step::Checkout],
            env: HashMap::new(),
        };
        let (tx, cancel) = channels();

        let status = runner.run_job(&job, cancel, &tx).await;

        assert!(matches!(status, JobStatus::Failed { .. }));
        assert!(executor.programs().is_empty());
    }

    #[tokio::test]
    async fn broken_cache_store_never_fails_the_job() {
        let executor = Arc::new(ScriptedExecutor::new());
        let mut ctx = context();
        ctx.caches.insert(
            "cargo".to_string(),
            CacheConfig {
                name: "cargo".to_string(),
                paths: vec!["target".to_string()],
                key: "cargo-${hash}".to_string(),
                inputs: Vec::new(),
            },
        );
        let runner = JobRunner::new(executor.clone(), Arc::new(BrokenCacheStore), ctx);

        let job = JobConfig {
            name: "test".to_string(),
            needs: Vec::new(),
            steps: vec![
                Step::CacheRestore {
                    cache: "cargo".to_string(),
                },
                Step::Run {
                    command: "build".to_string(),
                    args: Vec::new(),
                    env: HashMap::new(),
                    timeout: None,
                },
                Step::CacheSave {
                    cache: "cargo".to_string(),
                },
            ],
            env: HashMap::new(),
        };
        let (tx, cancel) = channels();

        let status = runner.run_job(&job, cancel, &tx).await;

        assert_eq!(status, JobStatus::Succeeded);
        assert_eq!(executor.programs(), vec!["build"]);
    }

    #[tokio::test]
    async fn cache_round_trip_between_jobs() {
        let store = Arc::new(MemoryCacheStore::new());
        let executor = Arc::new(LocalProcessExecutor::new());
        let mut ctx = context();
        ctx.caches.insert(
            "artifacts".to_string(),
            CacheConfig {
                name: "artifacts".to_string(),
                paths: vec!["target".to_string()],
                key: "artifacts-v1".to_string(),
                inputs: Vec::new(),
            },
        );
        let runner = JobRunner::new(executor, store, ctx);
        let (tx, cancel) = channels();

        let producer = JobConfig {
            name: "producer".to_string(),
            needs: Vec::new(),
            steps: vec![
                Step::Run {
                    command: "/bin/sh".to_string(),
                    args: vec![
                        "-c".to_string(),
                        "mkdir -p target && echo artifact > target/out.txt".to_string(),
                    ],
                    env: HashMap::new(),
                    timeout: None,
                },
                Step::CacheSave {
                    cache: "artifacts".to_string(),
                },
            ],
            env: HashMap::new(),
        };
        assert_eq!(
            runner.run_job(&producer, cancel.clone(), &tx).await,
            JobStatus::Succeeded
        );

        // Separate workspace; the file can only come from the cache.
        let consumer = JobConfig {
            name: "consumer".to_string(),
            needs: Vec::new(),
            steps: vec![
                Step::CacheRestore {
                    cache: "artifacts".to_string(),
                },
                Step::Run {
                    command: "/bin/sh".to_string(),
                    args: vec!["-c".to_string(), "grep artifact target/out.txt".to_string()],
                    env: HashMap::new(),
                    timeout: None,
                },
            ],
            env: HashMap::new(),
        };
        assert_eq!(
            runner.run_job(&consumer, cancel, &tx).await,
            JobStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn cache_key_hashes_workspace_inputs() {
        let store = Arc::new(MemoryCacheStore::new());
        let executor = Arc::new(LocalProcessExecutor::new());
        let mut ctx = context();
        ctx.caches.insert(
            "deps".to_string(),
            CacheConfig {
                name: "deps".to_string(),
                paths: vec!["vendor".to_string()],
                key: "deps-${hash}".to_string(),
                inputs: vec!["lock.txt".to_string()],
            },
        );
        let runner = JobRunner::new(executor, store.clone(), ctx);
        let (tx, cancel) = channels();

        let job = JobConfig {
            name: "vendor".to_string(),
            needs: Vec::new(),
            steps: vec![
                Step::Run {
                    command: "/bin/sh".to_string(),
                    args: vec![
                        "-c".to_string(),
                        "printf abc > lock.txt && mkdir vendor && printf x > vendor/f".to_string(),
                    ],
                    env: HashMap::new(),
                    timeout: None,
                },
                Step::CacheSave {
                    cache: "deps".to_string(),
                },
            ],
            env: HashMap::new(),
        };
        assert_eq!(runner.run_job(&job, cancel, &tx).await, JobStatus::Succeeded);

        // The stored key embeds the digest of the lockfile contents.
        let expected = CacheKey::derive("deps-${hash}", [b"abc".as_slice()]);
        assert!(store.contains(&expected).await.unwrap());
    }

    #[tokio::test]
    async fn env_layers_pipeline_then_job_then_step() {
        let executor = Arc::new(LocalProcessExecutor::new());
        let mut ctx = context();
        ctx.env.insert("A".to_string(), "pipeline".to_string());
        ctx.env.insert("B".to_string(), "pipeline".to_string());
        let runner = JobRunner::new(executor, Arc::new(MemoryCacheStore::new()), ctx);
        let (tx, cancel) = channels();

        let job = JobConfig {
            name: "env".to_string(),
            needs: Vec::new(),
            steps: vec![Step::Run {
                command: "/bin/sh".to_string(),
                args: vec![
                    "-c".to_string(),
                    "test \"$A\" = step && test \"$B\" = job".to_string(),
                ],
                env: HashMap::from([("A".to_string(), "step".to_string())]),
                timeout: None,
            }],
            env: HashMap::from([
                ("A".to_string(), "job".to_string()),
                ("B".to_string(), "job".to_string()),
            ]),
        };

        assert_eq!(runner.run_job(&job, cancel, &tx).await, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn cancelled_before_first_step() {
        let executor = Arc::new(ScriptedExecutor::new());
        let runner = JobRunner::new(
            executor.clone(),
            Arc::new(MemoryCacheStore::new()),
            context(),
        );
        let job = run_step_job("test", &["never"]);
        let (tx, _rx) = mpsc::channel(16);
        let (cancel_tx, cancel_rx) = watch::channel(true);

        let status = runner.run_job(&job, cancel_rx, &tx).await;
        drop(cancel_tx);

        assert_eq!(status, JobStatus::Cancelled);
        assert!(executor.programs().is_empty());
    }
}
