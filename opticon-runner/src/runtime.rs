use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use opticon_core::{ChangeKind, EnvironmentName, Settings};
use opticon_sync::pipeline::{self, Plan, ReconcileContext, ReconcileReport};
use opticon_sync::EnvironmentLock;

use crate::error::{io_err, RunnerError};
use crate::factory::{DefaultFactory, EnvironmentFactory};

/// How one environment's run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    NoDrift,
    Applied,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub environment: EnvironmentName,
    pub outcome: Outcome,
    pub counts: BTreeMap<ChangeKind, usize>,
    pub applied: usize,
    pub pushed: bool,
    pub recovered: bool,
    pub attempts: u32,
    pub duration_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunSummary {
    fn failed(environment: EnvironmentName, attempts: u32, started: Instant, err: &RunnerError) -> Self {
        Self {
            environment,
            outcome: Outcome::Failed,
            counts: BTreeMap::new(),
            applied: 0,
            pushed: false,
            recovered: false,
            attempts,
            duration_ms: started.elapsed().as_millis(),
            error: Some(err.to_string()),
        }
    }

    fn from_report(report: ReconcileReport, attempts: u32, started: Instant) -> Self {
        let outcome = if report.cancelled {
            Outcome::Cancelled
        } else if report.is_no_drift() {
            Outcome::NoDrift
        } else {
            Outcome::Applied
        };
        Self {
            environment: report.environment,
            outcome,
            counts: report.counts,
            applied: report.applied,
            pushed: report.pushed,
            recovered: report.recovered,
            attempts,
            duration_ms: started.elapsed().as_millis(),
            error: None,
        }
    }
}

/// Reconcile every configured environment and block until all are done.
pub fn start_blocking(home: &Path) -> Result<Vec<RunSummary>, RunnerError> {
    init_tracing();
    let settings = Settings::load_at(home)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;

    let home = home.to_path_buf();
    runtime.block_on(async move {
        let cancel = Arc::new(AtomicBool::new(false));
        let signal_handle = spawn_signal_handler(Arc::clone(&cancel));
        let result = run(home, Arc::new(settings), Arc::new(DefaultFactory), cancel).await;
        signal_handle.abort();
        result
    })
}

/// One task per environment; a failure in one does not stop the others.
///
/// Summaries come back in settings order.
pub async fn run(
    home: PathBuf,
    settings: Arc<Settings>,
    factory: Arc<dyn EnvironmentFactory>,
    cancel: Arc<AtomicBool>,
) -> Result<Vec<RunSummary>, RunnerError> {
    let mut handles = Vec::with_capacity(settings.environments.len());
    for environment in &settings.environments {
        let name = environment.name.clone();
        let home = home.clone();
        let settings = Arc::clone(&settings);
        let factory = Arc::clone(&factory);
        let cancel = Arc::clone(&cancel);
        let handle = tokio::spawn(async move {
            let started = Instant::now();
            match ReconcileContext::new(home, (*settings).clone(), &name) {
                Ok(ctx) => reconcile_environment(ctx.with_cancel(cancel), factory).await,
                Err(err) => RunSummary::failed(name, 0, started, &RunnerError::from(err)),
            }
        });
        handles.push((environment.name.clone(), handle));
    }

    let mut summaries = Vec::with_capacity(handles.len());
    for (name, handle) in handles {
        let summary = handle_join(&name, handle.await)?;
        log_summary(&summary);
        summaries.push(summary);
    }
    Ok(summaries)
}

/// Lock, recover, plan + stage under timeout and retries, then replay once.
async fn reconcile_environment(
    ctx: ReconcileContext,
    factory: Arc<dyn EnvironmentFactory>,
) -> RunSummary {
    let started = Instant::now();
    let name = ctx.name().clone();
    let mut attempts = 0;
    match reconcile_phases(ctx, factory, &mut attempts).await {
        Ok(report) => RunSummary::from_report(report, attempts, started),
        Err(err) => {
            tracing::error!(environment = %name, attempts, error = %err, "reconcile failed");
            RunSummary::failed(name, attempts, started, &err)
        }
    }
}

async fn reconcile_phases(
    ctx: ReconcileContext,
    factory: Arc<dyn EnvironmentFactory>,
    attempts: &mut u32,
) -> Result<ReconcileReport, RunnerError> {
    let started = std::time::Instant::now();
    let name = ctx.name().clone();

    // Held until this function returns, across every phase.
    let lock = {
        let home = ctx.home.clone();
        let name = name.clone();
        blocking("lock", move || {
            EnvironmentLock::acquire(&home, &name).map_err(RunnerError::from)
        })
        .await?
    };

    let recovered = {
        let ctx = ctx.clone();
        let factory = Arc::clone(&factory);
        blocking("recover", move || {
            let source = factory.source(&ctx)?;
            source.check_connection().map_err(opticon_sync::SyncError::from)?;
            let vcs = factory.vcs(&ctx)?;
            let mut catalog = factory.catalog(&ctx)?;
            let tree = vcs.working_tree_path().to_path_buf();
            Ok(pipeline::recover_pending(&ctx, &tree, catalog.as_mut())?.is_some())
        })
        .await?
    };

    let (plan, staged) = plan_and_stage(&ctx, &factory, attempts).await?;
    let Some(staged) = staged else {
        tracing::info!(environment = %name, "no drift");
        drop(lock);
        return Ok(ReconcileReport::no_drift(name, recovered, started));
    };

    if cancelled(&ctx) {
        tracing::info!(environment = %name, "cancelled before replay");
        let mut report = ReconcileReport::no_drift(name, recovered, started);
        report.cancelled = true;
        return Ok(report);
    }

    let replay = {
        let ctx = ctx.clone();
        let factory = Arc::clone(&factory);
        blocking("replay", move || {
            let mut vcs = factory.vcs(&ctx)?;
            let mut catalog = factory.catalog(&ctx)?;
            Ok(pipeline::apply(
                &ctx,
                plan,
                &staged,
                vcs.as_mut(),
                catalog.as_mut(),
            )?)
        })
        .await?
    };
    drop(lock);
    Ok(ReconcileReport::from_replay(replay, recovered, started))
}

/// Retryable phase: each attempt stages into its own directory.
async fn plan_and_stage(
    ctx: &ReconcileContext,
    factory: &Arc<dyn EnvironmentFactory>,
    attempts: &mut u32,
) -> Result<(Plan, Option<PathBuf>), RunnerError> {
    let limit = ctx.settings.retrieve_attempts.max(1);
    let timeout = ctx.settings.retrieve_timeout();

    loop {
        *attempts += 1;
        let attempt = *attempts;
        let task_ctx = ctx.clone();
        let task_factory = Arc::clone(factory);
        let handle = tokio::task::spawn_blocking(move || -> Result<_, RunnerError> {
            let source = task_factory.source(&task_ctx)?;
            let catalog = task_factory.catalog(&task_ctx)?;
            let plan = pipeline::plan(&task_ctx, source.as_ref(), catalog.as_ref())?;
            if plan.is_no_drift() {
                return Ok((plan, None));
            }
            let staged = pipeline::stage(&task_ctx, source.as_ref(), &plan, attempt)?;
            Ok((plan, Some(staged)))
        });

        let result = match tokio::time::timeout(timeout, handle).await {
            Ok(joined) => handle_join("plan", joined).and_then(|r| r),
            Err(_) => Err(RunnerError::Timeout {
                environment: ctx.name().clone(),
                after: timeout,
            }),
        };

        match result {
            Ok(planned) => return Ok(planned),
            Err(err) if err.is_retryable() && attempt < limit && !cancelled(ctx) => {
                let backoff = Duration::from_millis(250 * u64::from(attempt));
                tracing::warn!(
                    environment = %ctx.name(),
                    attempt,
                    limit,
                    error = %err,
                    "retrieval failed, retrying",
                );
                tokio::time::sleep(backoff).await;
            }
            Err(err) => return Err(err),
        }
    }
}

fn cancelled(ctx: &ReconcileContext) -> bool {
    ctx.cancel
        .as_ref()
        .map(|c| c.load(Ordering::SeqCst))
        .unwrap_or(false)
}

async fn blocking<T, F>(task: &str, f: F) -> Result<T, RunnerError>
where
    F: FnOnce() -> Result<T, RunnerError> + Send + 'static,
    T: Send + 'static,
{
    handle_join(task, tokio::task::spawn_blocking(f).await)?
}

fn spawn_signal_handler(cancel: Arc<AtomicBool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("received ctrl-c, stopping after the current change");
                cancel.store(true, Ordering::SeqCst);
            }
            Err(err) => tracing::warn!("ctrl-c handler failed: {err}"),
        }
    })
}

fn log_summary(summary: &RunSummary) {
    let json = serde_json::to_string(summary).unwrap_or_default();
    tracing::info!(
        environment = %summary.environment,
        outcome = ?summary.outcome,
        applied = summary.applied,
        pushed = summary.pushed,
        summary = %json,
        "environment finished",
    );
}

fn handle_join<T>(
    task: impl std::fmt::Display,
    result: Result<T, tokio::task::JoinError>,
) -> Result<T, RunnerError> {
    result.map_err(|err| RunnerError::Join {
        task: task.to_string(),
        message: err.to_string(),
    })
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(false);
    // OPTICON_LOG_FORMAT=json for machine-readable output.
    let _ = match std::env::var("OPTICON_LOG_FORMAT").as_deref() {
        Ok("json") => builder.json().try_init(),
        _ => builder.try_init(),
    };
}
