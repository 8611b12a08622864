//! Pipeline execution command.

use anyhow::{Context, Result};
use conveyor_cache::FsCacheStore;
use conveyor_config::RunVars;
use conveyor_core::pipeline::Step;
use conveyor_core::run::{JobStatus, Run, RunStatus};
use conveyor_core::trigger::{self, TriggerEvent};
use conveyor_executor::LocalProcessExecutor;
use conveyor_scheduler::{JobRunner, RunContext, RunEvent, Scheduler};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

use crate::EventKind;

pub struct RunArgs {
    pub config: String,
    pub event: EventKind,
    pub r#ref: String,
    pub source_ref: Option<String>,
    pub concurrency: usize,
    pub repo: Option<String>,
    pub cache_dir: PathBuf,
}

/// Execute the pipeline for an event. Returns the process exit code.
pub async fn run(args: RunArgs) -> Result<i32> {
    let content = match std::fs::read_to_string(&args.config) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("Failed to read {}: {}", args.config, e);
            return Ok(2);
        }
    };

    let mut pipeline = match conveyor_config::parse_pipeline(&content) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return Ok(2);
        }
    };

    if let Some(repo) = args.repo {
        pipeline.repository = Some(repo);
    }

    let event = match args.event {
        EventKind::Push => TriggerEvent::Push {
            r#ref: args.r#ref.clone(),
        },
        EventKind::PullRequest => TriggerEvent::PullRequest {
            target_ref: args.r#ref.clone(),
            source_ref: args.source_ref.clone(),
        },
    };

    if !trigger::matches(&event, &pipeline.triggers) {
        println!(
            "No trigger matched {} on '{}', nothing to do",
            event.kind(),
            args.r#ref
        );
        return Ok(0);
    }

    // A checkout step without a repository can never succeed; reject it
    // before any job starts.
    let needs_checkout = pipeline
        .jobs
        .iter()
        .any(|j| j.steps.iter().any(|s| matches!(s, Step::Checkout)));
    if needs_checkout && pipeline.repository.is_none() {
        eprintln!("Configuration error: checkout steps require a repository (or --repo)");
        return Ok(2);
    }

    let mut run = Run::new(pipeline.name.clone(), event.clone());
    run.status = RunStatus::Running;
    run.started_at = Some(chrono::Utc::now());

    println!("Running pipeline '{}' (run {})", pipeline.name, run.id);
    println!(
        "Event: {} on '{}', {} job(s), concurrency {}",
        event.kind(),
        args.r#ref,
        pipeline.jobs.len(),
        args.concurrency
    );

    let vars = RunVars {
        r#ref: args.r#ref.clone(),
        event: event.kind().to_string(),
        run_id: run.id.to_string(),
        pipeline_name: pipeline.name.clone(),
        env: pipeline.env.clone(),
    };

    let ctx = RunContext {
        repository: pipeline.repository.clone(),
        checkout_ref: event.checkout_ref().to_string(),
        env: pipeline.env.clone(),
        caches: pipeline
            .caches
            .iter()
            .map(|c| (c.name.clone(), c.clone()))
            .collect(),
        vars,
    };

    let cache = Arc::new(
        FsCacheStore::new(&args.cache_dir)
            .with_context(|| format!("failed to open cache store at {:?}", args.cache_dir))?,
    );
    let runner = Arc::new(JobRunner::new(Arc::new(LocalProcessExecutor::new()), cache, ctx));
    let scheduler = Scheduler::new(runner, args.concurrency);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            let _ = cancel_tx.send(true);
        }
    });

    let (mut rx, handle) = scheduler.execute(&pipeline, cancel_rx);

    while let Some(event) = rx.recv().await {
        match event {
            RunEvent::JobStarted { job } => {
                println!("> Job '{}' started", job);
            }
            RunEvent::StepStarted { .. } => {}
            RunEvent::StepFinished { job, step, success } => {
                let marker = if success { "ok" } else { "failed" };
                println!("  [{}] {} {}", job, step, marker);
            }
            RunEvent::JobFinished { job, status } => match status {
                JobStatus::Succeeded => println!("+ Job '{}' succeeded", job),
                JobStatus::Failed { message } => println!("x Job '{}' failed: {}", job, message),
                JobStatus::Skipped { reason } => println!("- Job '{}' skipped: {}", job, reason),
                JobStatus::Cancelled => println!("- Job '{}' cancelled", job),
                _ => {}
            },
            RunEvent::RunFinished { .. } => {}
        }
    }

    let report = handle.await.context("run execution task failed")?;

    run.status = report.status;
    run.finished_at = Some(chrono::Utc::now());

    println!("\n--- Job Summary ---");
    let mut names: Vec<_> = report.jobs.keys().collect();
    names.sort();
    for name in names {
        let status = match &report.jobs[name] {
            JobStatus::Succeeded => "succeeded".to_string(),
            JobStatus::Failed { message } => format!("failed: {}", message),
            JobStatus::Skipped { reason } => format!("skipped: {}", reason),
            JobStatus::Cancelled => "cancelled".to_string(),
            other => format!("{:?}", other),
        };
        println!("  {} - {}", name, status);
    }

    let elapsed = run
        .finished_at
        .zip(run.started_at)
        .map(|(end, start)| end - start)
        .map(|d| format!("{}.{:03}s", d.num_seconds(), d.num_milliseconds() % 1000))
        .unwrap_or_default();

    match report.status {
        RunStatus::Succeeded => {
            println!("\nRun succeeded in {}", elapsed);
            Ok(0)
        }
        RunStatus::Cancelled => {
            println!("\nRun cancelled after {}", elapsed);
            Ok(1)
        }
        _ => {
            println!("\nRun failed in {}", elapsed);
            Ok(1)
        }
    }
}
