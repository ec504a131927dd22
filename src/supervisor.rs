//! Batch supervision.
//!
//! The `Supervisor` holds the canonical list of runners for one batch, feeds
//! them through a fixed-size worker pool, and owns the single shutdown path
//! (`shutdown_all`) that every exit route goes through.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::errors::RunnerError;
use crate::output::OutputMultiplexer;
use crate::process::{BatchPlan, CommandSpec, RunnerState};
use crate::runner::{ProcessRunner, RunOutcome};
use crate::signals::ShutdownSignal;

/// Number of commands allowed to run at the same time.
pub const POOL_SIZE: usize = 4;

const SHUTDOWN_NOTICE: &str = "Shutting down...";

/// Owns the runners of one batch and the single path that shuts them down.
pub struct Supervisor {
    runners: Vec<Arc<ProcessRunner>>,
    pre_hook: Option<Arc<ProcessRunner>>,
    output: Arc<OutputMultiplexer>,
    pool_size: usize,
    shutdown_requested: AtomicBool,
}

/// Result of one batch runner.
#[derive(Debug)]
pub struct WorkerReport {
    /// Position of the command in the batch.
    pub index: usize,
    pub prefix: String,
    pub result: Result<RunOutcome, RunnerError>,
}

#[derive(Debug)]
pub struct BatchSummary {
    /// Reports in batch order. Workers aborted after the grace period have none.
    pub reports: Vec<WorkerReport>,
    pub interrupted: Option<ShutdownSignal>,
}

impl WorkerReport {
    /// A clean exit or a cancellation before start.
    pub fn succeeded(&self) -> bool {
        matches!(
            self.result,
            Ok(RunOutcome::Exited { code: Some(0) }) | Ok(RunOutcome::Cancelled)
        )
    }
}

impl BatchSummary {
    /// Reports of runners that failed to start or exited unsuccessfully.
    pub fn failed(&self) -> impl Iterator<Item = &WorkerReport> {
        self.reports.iter().filter(|report| !report.succeeded())
    }

    pub fn failures(&self) -> usize {
        self.failed().count()
    }
}

impl Supervisor {
    /// Wraps each spec in an idle runner. `pool_size` is clamped to at least one.
    pub fn new(
        commands: Vec<CommandSpec>,
        pre_hook: Option<CommandSpec>,
        output: Arc<OutputMultiplexer>,
        pool_size: usize,
    ) -> Self {
        Self {
            runners: commands
                .into_iter()
                .map(|spec| Arc::new(ProcessRunner::new(spec)))
                .collect(),
            pre_hook: pre_hook.map(|spec| Arc::new(ProcessRunner::new(spec))),
            output,
            pool_size: pool_size.max(1),
            shutdown_requested: AtomicBool::new(false),
        }
    }

    pub fn from_plan(plan: BatchPlan, output: Arc<OutputMultiplexer>) -> Self {
        Self::new(plan.commands, plan.pre_hook, output, POOL_SIZE)
    }

    /// Batch runners in input order.
    #[cfg(test)]
    pub fn runners(&self) -> &[Arc<ProcessRunner>] {
        &self.runners
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Submits the batch without waiting for it.
    ///
    /// The pool opens only after the pre-hook has exited and its output has been
    /// drained, so no batch command starts before it.
    pub fn run(&self) -> Batch {
        if self.is_shutdown_requested() {
            debug!("batch submitted after shutdown, every runner will be cancelled");
        }
        let gate = Arc::new(Semaphore::new(0));

        let pre_hook = match &self.pre_hook {
            Some(hook) => {
                let hook = Arc::clone(hook);
                let output = Arc::clone(&self.output);
                let gate = Arc::clone(&gate);
                let permits = self.pool_size;
                Some(tokio::spawn(async move {
                    let _open = OpenGate { gate, permits };
                    run_pre_hook(&hook, &output).await;
                }))
            }
            None => {
                gate.add_permits(self.pool_size);
                None
            }
        };

        let mut workers = JoinSet::new();
        for (index, runner) in self.runners.iter().enumerate() {
            workers.spawn(run_worker(
                index,
                Arc::clone(runner),
                Arc::clone(&self.output),
                Arc::clone(&gate),
            ));
        }

        Batch {
            workers,
            pre_hook,
            reports: Vec::new(),
        }
    }

    /// Destroys every runner. Only the first call does anything.
    ///
    /// Destroys are issued in order (pre-hook first, then the batch in input
    /// order) without waiting on each other. The shutdown notice is printed only
    /// when at least one runner is still idle or running; a batch that already
    /// finished on its own shuts down silently. Returns whether this call
    /// performed the shutdown.
    pub fn shutdown_all(&self) -> bool {
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            return false;
        }
        let live = self
            .all_runners()
            .any(|runner| runner.state() != RunnerState::Done);
        if live {
            self.output.notice(SHUTDOWN_NOTICE);
        }
        for runner in self.all_runners() {
            runner.destroy();
        }
        true
    }

    fn all_runners(&self) -> impl Iterator<Item = &Arc<ProcessRunner>> {
        self.pre_hook.iter().chain(self.runners.iter())
    }
}

/// Opens the worker pool when dropped, whether the pre-hook task finished,
/// panicked or was aborted.
struct OpenGate {
    gate: Arc<Semaphore>,
    permits: usize,
}

impl Drop for OpenGate {
    fn drop(&mut self) {
        self.gate.add_permits(self.permits);
    }
}

/// Calls `shutdown_all` when dropped, whatever the exit path.
struct ShutdownGuard<'a>(&'a Supervisor);

impl Drop for ShutdownGuard<'_> {
    fn drop(&mut self) {
        self.0.shutdown_all();
    }
}

/// Handle to a submitted batch.
pub struct Batch {
    workers: JoinSet<WorkerReport>,
    pre_hook: Option<JoinHandle<()>>,
    reports: Vec<WorkerReport>,
}

impl Batch {
    /// Waits for every worker. Cancel-safe: progress made before cancellation is kept.
    pub async fn wait(&mut self) {
        if let Some(hook) = self.pre_hook.as_mut() {
            if let Err(err) = hook.await {
                warn!(error = %err, "pre-hook task failed");
            }
            self.pre_hook = None;
        }
        while let Some(joined) = self.workers.join_next().await {
            match joined {
                Ok(report) => self.reports.push(report),
                Err(err) => warn!(error = %err, "worker task failed"),
            }
        }
    }

    /// Cancels workers that are still running. Their children are killed on drop.
    pub fn abort(&mut self) {
        if let Some(hook) = self.pre_hook.take() {
            hook.abort();
        }
        self.workers.abort_all();
    }

    pub fn into_summary(mut self, interrupted: Option<ShutdownSignal>) -> BatchSummary {
        self.reports.sort_by_key(|report| report.index);
        BatchSummary {
            reports: self.reports,
            interrupted,
        }
    }
}

/// Runs the batch until it completes or `shutdown` resolves.
///
/// On shutdown every runner is destroyed and workers get `grace` to report back
/// before being aborted.
pub async fn run_until_shutdown<S>(
    supervisor: &Supervisor,
    shutdown: S,
    grace: Duration,
) -> BatchSummary
where
    S: Future<Output = ShutdownSignal>,
{
    let _guard = ShutdownGuard(supervisor);
    let mut batch = supervisor.run();
    tokio::pin!(shutdown);

    let interrupted = tokio::select! {
        _ = batch.wait() => None,
        signal = &mut shutdown => Some(signal),
    };

    if let Some(signal) = interrupted {
        info!(signal = signal.label(), "shutdown requested");
        supervisor.shutdown_all();
        if tokio::time::timeout(grace, batch.wait()).await.is_err() {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "workers still running after grace period, aborting"
            );
            batch.abort();
        }
    }

    batch.into_summary(interrupted)
}

async fn run_pre_hook(hook: &ProcessRunner, output: &OutputMultiplexer) {
    match hook.run(output).await {
        Ok(RunOutcome::Exited { code }) => info!(code = ?code, "pre-hook finished"),
        Ok(RunOutcome::Cancelled) => info!("pre-hook cancelled"),
        Err(err) => {
            warn!(error = %err, "pre-hook failed, continuing with batch");
            output.notice(&format!("WARNING pre-hook failed: {err}"));
        }
    }
}

async fn run_worker(
    index: usize,
    runner: Arc<ProcessRunner>,
    output: Arc<OutputMultiplexer>,
    gate: Arc<Semaphore>,
) -> WorkerReport {
    let spec = runner.spec();
    let result = match gate.acquire().await {
        Ok(_permit) => runner.run(&output).await,
        Err(_) => Ok(RunOutcome::Cancelled),
    };
    if let Err(err) = &result {
        warn!(index, prefix = %spec.prefix, error = %err, "runner failed");
        output.write(spec.color, &spec.prefix, &format!("ERROR {err}"));
    }
    WorkerReport {
        index,
        prefix: spec.prefix.clone(),
        result,
    }
}
