//! Run scheduler - executes the job graph with dependency and
//! concurrency constraints.

use conveyor_core::Error;
use conveyor_core::pipeline::{JobConfig, Pipeline};
use conveyor_core::run::{JobStatus, RunStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::runner::{JobRunner, cancelled};

/// Event emitted during run execution.
#[derive(Debug, Clone)]
pub enum RunEvent {
    JobStarted {
        job: String,
    },
    StepStarted {
        job: String,
        step: &'static str,
    },
    StepFinished {
        job: String,
        step: &'static str,
        success: bool,
    },
    JobFinished {
        job: String,
        status: JobStatus,
    },
    RunFinished {
        status: RunStatus,
    },
}

/// Final result of a run.
#[derive(Debug)]
pub struct RunReport {
    pub status: RunStatus,
    pub jobs: HashMap<String, JobStatus>,
}

/// Executes a pipeline's job graph.
///
/// A job becomes ready when all of its dependencies are terminal and
/// successful; at most `concurrency` jobs are in flight at once. A job
/// whose dependency failed, was skipped, or was cancelled is marked
/// skipped without executing any step. Graph validity (no cycles, no
/// unknown references) is the config layer's job; the scheduler assumes
/// a valid DAG.
pub struct Scheduler {
    runner: Arc<JobRunner>,
    concurrency: usize,
}

impl Scheduler {
    pub fn new(runner: Arc<JobRunner>, concurrency: usize) -> Self {
        Self {
            runner,
            concurrency: concurrency.max(1),
        }
    }

    /// Execute the pipeline, returning a channel of events and a handle to
    /// the final report. Cancelling via the watch channel stops pending
    /// jobs immediately and in-flight jobs at their next step boundary.
    pub fn execute(
        &self,
        pipeline: &Pipeline,
        cancel: watch::Receiver<bool>,
    ) -> (
        mpsc::Receiver<RunEvent>,
        tokio::task::JoinHandle<RunReport>,
    ) {
        let (tx, rx) = mpsc::channel(100);
        let runner = self.runner.clone();
        let jobs = pipeline.jobs.clone();
        let concurrency = self.concurrency;

        let handle = tokio::spawn(async move {
            Self::execute_inner(runner, jobs, concurrency, cancel, tx).await
        });

        (rx, handle)
    }

    async fn execute_inner(
        runner: Arc<JobRunner>,
        jobs: Vec<JobConfig>,
        concurrency: usize,
        cancel: watch::Receiver<bool>,
        tx: mpsc::Sender<RunEvent>,
    ) -> RunReport {
        let mut states: HashMap<String, JobStatus> = jobs
            .iter()
            .map(|j| (j.name.clone(), JobStatus::Pending))
            .collect();

        let mut in_flight: JoinSet<(String, JobStatus)> = JoinSet::new();
        let mut cancel_seen = *cancel.borrow();

        loop {
            settle_unrunnable(&jobs, &mut states, cancel_seen, &tx).await;

            if !cancel_seen {
                // Launch ready jobs up to the concurrency limit.
                for job in &jobs {
                    if in_flight.len() >= concurrency {
                        break;
                    }
                    if states[&job.name] != JobStatus::Pending || !deps_succeeded(job, &states) {
                        continue;
                    }

                    states.insert(job.name.clone(), JobStatus::Running);
                    let _ = tx
                        .send(RunEvent::JobStarted {
                            job: job.name.clone(),
                        })
                        .await;
                    info!(job = %job.name, "job started");

                    let runner = runner.clone();
                    let job = job.clone();
                    let job_cancel = cancel.clone();
                    let job_tx = tx.clone();
                    in_flight.spawn(async move {
                        let status = runner.run_job(&job, job_cancel, &job_tx).await;
                        (job.name, status)
                    });
                }
            }

            if states.values().all(|s| s.is_terminal()) && in_flight.is_empty() {
                break;
            }

            if in_flight.is_empty() {
                // No job can run and none is running: with a validated DAG
                // this is unreachable, but never hang a run on it.
                for (name, state) in states.iter_mut() {
                    if !state.is_terminal() {
                        let err = Error::Invariant(format!("job '{}' never became ready", name));
                        error!(job = %name, error = %err, "scheduler stuck with nothing in flight");
                        *state = JobStatus::Skipped {
                            reason: err.to_string(),
                        };
                    }
                }
                break;
            }

            let joined = if cancel_seen {
                in_flight.join_next().await
            } else {
                tokio::select! {
                    joined = in_flight.join_next() => joined,
                    _ = cancelled(cancel.clone()) => {
                        info!("run cancelled, stopping pending jobs");
                        cancel_seen = true;
                        continue;
                    }
                }
            };

            if let Some(result) = joined {
                match result {
                    Ok((name, status)) => {
                        info!(job = %name, ?status, "job finished");
                        let _ = tx
                            .send(RunEvent::JobFinished {
                                job: name.clone(),
                                status: status.clone(),
                            })
                            .await;
                        states.insert(name, status);
                    }
                    Err(e) => {
                        // A panicked job task fails the run, not the process.
                        error!(error = %e, "job task panicked");
                    }
                }
            }
        }

        let status = if cancel_seen {
            RunStatus::Cancelled
        } else if states.values().all(|s| s.is_success()) {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };

        let _ = tx.send(RunEvent::RunFinished { status }).await;

        RunReport {
            status,
            jobs: states,
        }
    }
}

fn deps_succeeded(job: &JobConfig, states: &HashMap<String, JobStatus>) -> bool {
    job.needs
        .iter()
        .all(|dep| states.get(dep).map(|s| s.is_success()).unwrap_or(false))
}

/// Mark jobs that can never run: dependents of non-successful terminal jobs
/// become skipped, and on cancellation every still-pending job becomes
/// cancelled. Loops to a fixpoint so skips cascade through the graph.
async fn settle_unrunnable(
    jobs: &[JobConfig],
    states: &mut HashMap<String, JobStatus>,
    cancel_seen: bool,
    tx: &mpsc::Sender<RunEvent>,
) {
    loop {
        let mut changed = false;

        for job in jobs {
            if states[&job.name] != JobStatus::Pending {
                continue;
            }

            let new_status = if cancel_seen {
                Some(JobStatus::Cancelled)
            } else {
                let failed_deps: Vec<&str> = job
                    .needs
                    .iter()
                    .filter(|dep| {
                        states
                            .get(dep.as_str())
                            .map(|s| s.is_terminal() && !s.is_success())
                            .unwrap_or(false)
                    })
                    .map(|s| s.as_str())
                    .collect();

                if failed_deps.is_empty() {
                    None
                } else {
                    info!(job = %job.name, ?failed_deps, "skipping job, dependencies did not succeed");
                    Some(JobStatus::Skipped {
                        reason: format!("dependencies did not succeed: {}", failed_deps.join(", ")),
                    })
                }
            };

            if let Some(status) = new_status {
                let _ = tx
                    .send(RunEvent::JobFinished {
                        job: job.name.clone(),
                        status: status.clone(),
                    })
                    .await;
                states.insert(job.name.clone(), status);
                changed = true;
            }
        }

        if !changed {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RunContext;
    use async_trait::async_trait;
    use conveyor_cache::MemoryCacheStore;
    use conveyor_config::RunVars;
    use conveyor_core::Result;
    use conveyor_core::executor::{ExecOutcome, ExecSpec, StepExecutor};
    use conveyor_core::pipeline::Step;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Executor that records invocations and tracks how many run at once.
    /// Programs named "fail" exit non-zero; every invocation takes `delay`.
    struct CountingExecutor {
        invocations: Mutex<Vec<String>>,
        current: AtomicUsize,
        max_concurrent: AtomicUsize,
        delay: Duration,
    }

    impl CountingExecutor {
        fn new(delay: Duration) -> Self {
            Self {
                invocations: Mutex::new(Vec::new()),
                current: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
                delay,
            }
        }

        fn programs(&self) -> Vec<String> {
            self.invocations.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StepExecutor for CountingExecutor {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn execute(&self, spec: ExecSpec) -> Result<ExecOutcome> {
            self.invocations.lock().unwrap().push(spec.program.clone());

            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.current.fetch_sub(1, Ordering::SeqCst);

            Ok(ExecOutcome {
                exit_code: if spec.program == "fail" { Some(1) } else { Some(0) },
                stdout: String::new(),
                stderr: String::new(),
                elapsed: self.delay,
            })
        }
    }

    fn job(name: &str, needs: &[&str], program: &str) -> JobConfig {
        JobConfig {
            name: name.to_string(),
            needs: needs.iter().map(|s| s.to_string()).collect(),
            steps: vec![Step::Run {
                command: program.to_string(),
                args: Vec::new(),
                env: HashMap::new(),
                timeout: None,
            }],
            env: HashMap::new(),
        }
    }

    fn pipeline(jobs: Vec<JobConfig>) -> Pipeline {
        Pipeline {
            name: "test".to_string(),
            repository: None,
            triggers: Vec::new(),
            jobs,
            caches: Vec::new(),
            env: HashMap::new(),
        }
    }

    fn scheduler(executor: Arc<CountingExecutor>, concurrency: usize) -> Scheduler {
        let runner = JobRunner::new(
            executor,
            Arc::new(MemoryCacheStore::new()),
            RunContext {
                repository: None,
                checkout_ref: "master".to_string(),
                env: HashMap::new(),
                caches: HashMap::new(),
                vars: RunVars::default(),
            },
        );
        Scheduler::new(Arc::new(runner), concurrency)
    }

    async fn run(
        sched: &Scheduler,
        pipeline: &Pipeline,
    ) -> (RunReport, watch::Sender<bool>) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (rx, handle) = sched.execute(pipeline, cancel_rx);
        drop(rx);
        (handle.await.unwrap(), cancel_tx)
    }

    #[tokio::test]
    async fn independent_jobs_all_succeed() {
        let executor = Arc::new(CountingExecutor::new(Duration::from_millis(5)));
        let sched = scheduler(executor.clone(), 4);
        let p = pipeline(vec![
            job("fmt", &[], "fmt"),
            job("lint", &[], "lint"),
            job("doc", &[], "doc"),
            job("test", &[], "test"),
        ]);

        let (report, _cancel) = run(&sched, &p).await;

        assert_eq!(report.status, RunStatus::Succeeded);
        assert!(report.jobs.values().all(|s| s.is_success()));
        assert_eq!(executor.programs().len(), 4);
    }

    #[tokio::test]
    async fn one_failure_fails_the_run_but_not_siblings() {
        let executor = Arc::new(CountingExecutor::new(Duration::from_millis(5)));
        let sched = scheduler(executor.clone(), 4);
        let p = pipeline(vec![
            job("fmt", &[], "fmt"),
            job("lint", &[], "fail"),
            job("doc", &[], "doc"),
            job("test", &[], "test"),
        ]);

        let (report, _cancel) = run(&sched, &p).await;

        assert_eq!(report.status, RunStatus::Failed);
        assert!(report.jobs["fmt"].is_success());
        assert!(matches!(report.jobs["lint"], JobStatus::Failed { .. }));
        assert!(report.jobs["doc"].is_success());
        assert!(report.jobs["test"].is_success());
    }

    #[tokio::test]
    async fn failed_dependency_skips_dependents_without_executing() {
        let executor = Arc::new(CountingExecutor::new(Duration::from_millis(1)));
        let sched = scheduler(executor.clone(), 4);
        let p = pipeline(vec![
            job("a", &[], "fail"),
            job("b", &["a"], "b-program"),
            job("c", &["b"], "c-program"),
        ]);

        let (report, _cancel) = run(&sched, &p).await;

        assert_eq!(report.status, RunStatus::Failed);
        assert!(matches!(report.jobs["a"], JobStatus::Failed { .. }));
        assert!(matches!(report.jobs["b"], JobStatus::Skipped { .. }));
        assert!(matches!(report.jobs["c"], JobStatus::Skipped { .. }));
        // Skipped jobs produce no side effects.
        assert_eq!(executor.programs(), vec!["fail"]);
    }

    #[tokio::test]
    async fn dependencies_complete_before_dependents_start() {
        let executor = Arc::new(CountingExecutor::new(Duration::from_millis(5)));
        let sched = scheduler(executor.clone(), 4);
        let p = pipeline(vec![
            job("deploy", &["build"], "deploy"),
            job("build", &["test"], "build"),
            job("test", &[], "test"),
        ]);

        let (report, _cancel) = run(&sched, &p).await;

        assert_eq!(report.status, RunStatus::Succeeded);
        let order = executor.programs();
        let pos = |p: &str| order.iter().position(|x| x == p).unwrap();
        assert!(pos("test") < pos("build"));
        assert!(pos("build") < pos("deploy"));
    }

    #[tokio::test]
    async fn concurrency_limit_is_respected() {
        let executor = Arc::new(CountingExecutor::new(Duration::from_millis(30)));
        let sched = scheduler(executor.clone(), 2);
        let p = pipeline(
            (0..6)
                .map(|i| job(&format!("job-{}", i), &[], "work"))
                .collect(),
        );

        let (report, _cancel) = run(&sched, &p).await;

        assert_eq!(report.status, RunStatus::Succeeded);
        assert!(executor.max_concurrent.load(Ordering::SeqCst) <= 2);
        assert_eq!(executor.programs().len(), 6);
    }

    #[tokio::test]
    async fn unresolvable_dependency_settles_instead_of_hanging() {
        let executor = Arc::new(CountingExecutor::new(Duration::from_millis(1)));
        let sched = scheduler(executor.clone(), 2);
        // Refers to a job the graph does not contain; config validation
        // rejects this, but the scheduler must not hang on it either.
        let p = pipeline(vec![job("orphan", &["ghost"], "never")]);

        let (report, _cancel) = run(&sched, &p).await;

        assert_eq!(report.status, RunStatus::Failed);
        let JobStatus::Skipped { reason } = &report.jobs["orphan"] else {
            panic!("expected orphan to be skipped");
        };
        assert!(reason.contains("invariant violated"));
        assert!(executor.programs().is_empty());
    }

    #[tokio::test]
    async fn every_job_reaches_exactly_one_terminal_status() {
        let executor = Arc::new(CountingExecutor::new(Duration::from_millis(1)));
        let sched = scheduler(executor, 2);
        let p = pipeline(vec![
            job("a", &[], "a"),
            job("b", &["a"], "fail"),
            job("c", &["b"], "c"),
            job("d", &[], "d"),
        ]);

        let (report, _cancel) = run(&sched, &p).await;

        assert_eq!(report.jobs.len(), 4);
        assert!(report.jobs.values().all(|s| s.is_terminal()));
    }

    #[tokio::test]
    async fn cancellation_stops_pending_and_in_flight_jobs() {
        let executor = Arc::new(CountingExecutor::new(Duration::from_millis(200)));
        let sched = scheduler(executor.clone(), 1);
        let p = pipeline(vec![
            job("first", &[], "first"),
            job("second", &[], "second"),
            job("third", &[], "third"),
        ]);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (rx, handle) = sched.execute(&p, cancel_rx);
        drop(rx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_tx.send(true).unwrap();

        let report = handle.await.unwrap();

        assert_eq!(report.status, RunStatus::Cancelled);
        assert!(report.jobs.values().all(|s| s.is_terminal()));
        assert!(!report.jobs.values().any(|s| s.is_success()));
        assert_eq!(report.jobs["first"], JobStatus::Cancelled);
        // Only the first job ever reached the executor with concurrency 1.
        assert_eq!(executor.programs(), vec!["first"]);
    }

    #[tokio::test]
    async fn events_reflect_job_lifecycle() {
        let executor = Arc::new(CountingExecutor::new(Duration::from_millis(1)));
        let sched = scheduler(executor, 2);
        let p = pipeline(vec![job("only", &[], "only")]);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (mut rx, handle) = sched.execute(&p, cancel_rx);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        let report = handle.await.unwrap();
        drop(cancel_tx);

        assert_eq!(report.status, RunStatus::Succeeded);
        assert!(matches!(events.first(), Some(RunEvent::JobStarted { job }) if job == "only"));
        assert!(matches!(events.last(), Some(RunEvent::RunFinished { status }) if *status == RunStatus::Succeeded));
        assert!(events.iter().any(|e| matches!(e, RunEvent::JobFinished { job, status } if job == "only" && status.is_success())));
    }
}
