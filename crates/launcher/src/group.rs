//! Process groups: run one worker per rank and fail as a unit
//!
//! A group succeeds only when every worker succeeds. The first worker
//! failure aborts the remaining workers and is returned as the group's
//! failure, so the retry supervisor always relaunches the whole set.

use std::any::Any;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use runtime_core::{Collective, Error, LocalGroup, Rank, Result, SingleProcess, WorkerContext};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::worker::WorkerFn;

/// Lines of worker stderr kept for the failure report
pub const DEFAULT_STDERR_TAIL_LINES: usize = 20;

/// Spawns a set of workers and waits for all of them
#[async_trait]
pub trait ProcessGroup: Send + Sync {
    /// Run every worker of this node; any single failure fails the group
    async fn run(&self, workers: Vec<WorkerContext>) -> Result<()>;

    /// Run the only worker of a single-process job
    async fn run_inline(&self, worker: WorkerContext) -> Result<()> {
        self.run(vec![worker]).await
    }
}

/// Wait for every task, aborting the rest on the first failure
async fn join_all(mut tasks: JoinSet<Result<()>>) -> Result<()> {
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.unwrap_or_else(|e| {
            Err(Error::Internal {
                message: format!("Worker supervision task failed: {}", e),
            })
        });

        if let Err(e) = outcome {
            warn!(error = %e, remaining = tasks.len(), "Worker failed, tearing down group");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
            return Err(e);
        }
    }
    Ok(())
}

// ============================================================================
// OS processes
// ============================================================================

/// Runs each worker as a child process with its topology in the environment
#[derive(Debug, Clone)]
pub struct CommandGroup {
    program: OsString,
    args: Vec<OsString>,
    stderr_tail_lines: usize,
}

impl CommandGroup {
    pub fn new<P, I, A>(program: P, args: I) -> Self
    where
        P: Into<OsString>,
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            stderr_tail_lines: DEFAULT_STDERR_TAIL_LINES,
        }
    }

    pub fn with_stderr_tail_lines(mut self, lines: usize) -> Self {
        self.stderr_tail_lines = lines;
        self
    }

    /// Spawn one worker and wait for it, keeping the tail of its stderr
    async fn run_worker(
        program: OsString,
        args: Vec<OsString>,
        ctx: WorkerContext,
        tail_lines: usize,
    ) -> Result<()> {
        let rank = ctx.rank;
        let mut child = Command::new(&program)
            .args(&args)
            .envs(ctx.to_env())
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::SpawnFailed {
                rank,
                message: format!("{}: {}", program.to_string_lossy(), e),
            })?;

        debug!(rank, pid = ?child.id(), "Worker started");

        let mut tail = VecDeque::with_capacity(tail_lines);
        if let Some(stderr) = child.stderr.take() {
            let mut segments = BufReader::new(stderr).split(b'\n');
            loop {
                let segment = match segments.next_segment().await {
                    Ok(Some(segment)) => segment,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(rank, error = %e, "Stopped reading worker stderr");
                        break;
                    }
                };
                // Workers may write arbitrary bytes; keep whatever is readable.
                let line = String::from_utf8_lossy(&segment);
                let line = line.trim_end_matches('\r').to_string();
                debug!(rank, line = %line, "worker stderr");
                if tail_lines > 0 {
                    if tail.len() == tail_lines {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
        }

        let status = child.wait().await?;
        if status.success() {
            debug!(rank, "Worker exited cleanly");
            return Ok(());
        }

        let stderr_tail = Vec::from(tail).join("\n");
        error!(rank, %status, "Worker exited with failure");
        Err(Error::WorkerFailed {
            rank,
            status: status.to_string(),
            stderr_tail,
        })
    }
}

#[async_trait]
impl ProcessGroup for CommandGroup {
    async fn run(&self, workers: Vec<WorkerContext>) -> Result<()> {
        info!(
            program = %self.program.to_string_lossy(),
            workers = workers.len(),
            "Spawning worker processes"
        );

        let mut tasks = JoinSet::new();
        for ctx in workers {
            tasks.spawn(Self::run_worker(
                self.program.clone(),
                self.args.clone(),
                ctx,
                self.stderr_tail_lines,
            ));
        }
        join_all(tasks).await
    }
}

// ============================================================================
// Tokio tasks
// ============================================================================

/// Runs each worker as a Tokio task sharing one in-memory barrier
pub struct TaskGroup<W> {
    worker: Arc<W>,
}

impl<W: WorkerFn> TaskGroup<W> {
    pub fn new(worker: W) -> Self {
        Self {
            worker: Arc::new(worker),
        }
    }

    /// Run one worker on its own task so a panic is reported with its rank
    async fn run_task(
        worker: Arc<W>,
        ctx: WorkerContext,
        collective: Arc<dyn Collective>,
    ) -> Result<()> {
        let rank = ctx.rank;
        let handle = AbortOnDrop(tokio::spawn(async move { worker.run(ctx, collective).await }));
        handle.join(rank).await
    }
}

#[async_trait]
impl<W: WorkerFn> ProcessGroup for TaskGroup<W> {
    async fn run(&self, mut workers: Vec<WorkerContext>) -> Result<()> {
        workers.sort_by_key(|ctx| ctx.rank);
        let world_size = workers.len() as u32;
        for (expected, ctx) in workers.iter().enumerate() {
            if ctx.rank != expected as Rank || ctx.world_size != world_size {
                return Err(Error::invalid_config(format!(
                    "task group needs the whole job on this node: got rank {} of world size {} among {} workers",
                    ctx.rank, ctx.world_size, world_size
                )));
            }
        }

        info!(workers = world_size, "Starting worker tasks");

        let members = LocalGroup::new(world_size);
        let mut tasks = JoinSet::new();
        for (ctx, member) in workers.into_iter().zip(members) {
            tasks.spawn(Self::run_task(self.worker.clone(), ctx, Arc::new(member)));
        }
        join_all(tasks).await
    }

    async fn run_inline(&self, worker: WorkerContext) -> Result<()> {
        Self::run_task(self.worker.clone(), worker, Arc::new(SingleProcess)).await
    }
}

/// Aborts the wrapped task when dropped, so tearing down a group stops its workers
struct AbortOnDrop(JoinHandle<Result<()>>);

impl AbortOnDrop {
    async fn join(mut self, rank: Rank) -> Result<()> {
        match (&mut self.0).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                error!(rank, %message, "Worker panicked");
                Err(Error::WorkerPanicked { rank, message })
            }
            Err(e) => Err(Error::Internal {
                message: format!("Worker rank {} was cancelled: {}", rank, e),
            }),
        }
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
