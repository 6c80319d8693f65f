//! End-to-end training simulation
//!
//! Simulates distributed training jobs with:
//! - Multiple ranks checkpointing through one leader
//! - A transient infrastructure fault mid-run
//! - Whole-group relaunch and resume from the latest checkpoint
//! - Fatal faults and graceful termination

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use checkpoint::{BincodeCodec, CheckpointManager, CheckpointManagerConfig};
use launcher::{Launcher, TaskGroup, WorkerFn};
use runtime_core::{
    Collective, Error, GracefulTerminator, LaunchConfig, RetryConfig, Step, WorkerContext,
};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

const TOTAL_STEPS: Step = 10;
const CHECKPOINT_EVERY: Step = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TrainState {
    step: Step,
    updates: u64,
    weights: Vec<f32>,
}

impl TrainState {
    fn initial() -> Self {
        Self {
            step: 0,
            updates: 0,
            weights: vec![0.0; 16],
        }
    }

    fn train_step(&mut self) {
        self.step += 1;
        self.updates += 1;
        for w in &mut self.weights {
            *w += 0.5;
        }
    }
}

type Manager = CheckpointManager<BincodeCodec<TrainState>>;

async fn open_manager(root: &Path, collective: Arc<dyn Collective>) -> runtime_core::Result<Manager> {
    let config = CheckpointManagerConfig {
        root: root.to_path_buf(),
        ..CheckpointManagerConfig::default()
    };
    CheckpointManager::open(config, BincodeCodec::new(), collective).await
}

fn launch_config(units: u32, max_retries: u32) -> LaunchConfig {
    LaunchConfig {
        units_per_node: units,
        retry: RetryConfig {
            max_retries,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        },
        ..LaunchConfig::default()
    }
}

/// A training loop that resumes from the latest checkpoint and can inject one fault
struct Trainer {
    root: PathBuf,
    /// (rank, step) at which to fail once, and the failure text
    fault: Option<(u32, Step, &'static str)>,
    fault_fired: AtomicBool,
    /// (attempt, rank, resumed-from step)
    resumes: Mutex<Vec<(u32, u32, Step)>>,
}

impl Trainer {
    fn new(root: &Path, fault: Option<(u32, Step, &'static str)>) -> Self {
        Self {
            root: root.to_path_buf(),
            fault,
            fault_fired: AtomicBool::new(false),
            resumes: Mutex::new(Vec::new()),
        }
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[tokio::test]
async fn test_transient_fault_resumes_from_latest_checkpoint() -> Result<()> {
    init_logging();
    let temp_dir = TempDir::new()?;
    let trainer = Arc::new(Trainer::new(
        temp_dir.path(),
        Some((0, 5, "NCCL error: connection reset by peer")),
    ));

    let launcher = Launcher::new(launch_config(2, 3), GracefulTerminator::new())?;
    let group = TaskGroup::new(SharedTrainer(trainer.clone()));
    launcher.launch(&group).await?;

    let resumes = trainer.resumes.lock().unwrap().clone();
    let first: Vec<_> = resumes.iter().filter(|(a, _, _)| *a == 0).collect();
    let second: Vec<_> = resumes.iter().filter(|(a, _, _)| *a == 1).collect();
    assert_eq!(first.len(), 2);
    assert!(first.iter().all(|(_, _, step)| *step == 0));
    assert_eq!(second.len(), 2);
    assert!(second.iter().all(|(_, _, step)| *step == 4));

    let manager = open_manager(temp_dir.path(), Arc::new(runtime_core::SingleProcess)).await?;
    let (record, state) = manager.load_latest().await?.expect("final checkpoint");
    assert_eq!(record.step, TOTAL_STEPS);
    assert_eq!(state.step, TOTAL_STEPS);
    assert_eq!(state.updates, TOTAL_STEPS);
    assert!(state.weights.iter().all(|w| *w == 5.0));

    let steps: Vec<_> = manager
        .list_checkpoints()
        .await?
        .iter()
        .map(|r| r.step)
        .collect();
    assert_eq!(steps, vec![2, 4, 6, 8, 10]);
    Ok(())
}

#[tokio::test]
async fn test_fatal_fault_is_not_retried() -> Result<()> {
    init_logging();
    let temp_dir = TempDir::new()?;
    let trainer = Arc::new(Trainer::new(
        temp_dir.path(),
        Some((1, 3, "ValueError: expected 3 channels, got 4")),
    ));

    let launcher = Launcher::new(launch_config(2, 3), GracefulTerminator::new())?;
    let group = TaskGroup::new(SharedTrainer(trainer.clone()));
    let err = launcher.launch(&group).await.unwrap_err();

    assert!(err.to_string().contains("ValueError"));
    let attempts: Vec<_> = trainer
        .resumes
        .lock()
        .unwrap()
        .iter()
        .map(|(attempt, _, _)| *attempt)
        .collect();
    assert!(attempts.iter().all(|a| *a == 0));
    Ok(())
}

#[tokio::test]
async fn test_single_unit_job_runs_inline() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let trainer = Arc::new(Trainer::new(temp_dir.path(), None));

    let launcher = Launcher::new(launch_config(1, 0), GracefulTerminator::new())?;
    launcher
        .launch(&TaskGroup::new(SharedTrainer(trainer.clone())))
        .await?;

    assert_eq!(*trainer.resumes.lock().unwrap(), vec![(0, 0, 0)]);
    let manager = open_manager(temp_dir.path(), Arc::new(runtime_core::SingleProcess)).await?;
    let latest = manager.latest_checkpoint().await?.expect("latest");
    assert_eq!(latest.step, TOTAL_STEPS);
    Ok(())
}

#[tokio::test]
async fn test_termination_stops_job() -> Result<()> {
    let terminator = GracefulTerminator::new();
    let launcher = Launcher::new(launch_config(2, 3), terminator.clone())?;
    let started = Arc::new(AtomicU32::new(0));

    let group = TaskGroup::new({
        let started = started.clone();
        move |_ctx: WorkerContext, collective: Arc<dyn Collective>| {
            let started = started.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                if collective.is_leader() {
                    // Stuck waiting on a peer that never shows up.
                    std::future::pending::<()>().await;
                }
                Ok::<_, Error>(())
            }
        }
    });

    let trigger = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        terminator.trigger();
    });

    let err = tokio::time::timeout(Duration::from_secs(5), launcher.launch(&group))
        .await?
        .unwrap_err();
    trigger.await?;

    assert!(matches!(err, Error::Terminated));
    assert_eq!(started.load(Ordering::SeqCst), 2);
    Ok(())
}

/// Cloneable handle so the test keeps access to the trainer's records
struct SharedTrainer(Arc<Trainer>);

#[async_trait::async_trait]
impl WorkerFn for SharedTrainer {
    async fn run(&self, ctx: WorkerContext, collective: Arc<dyn Collective>) -> runtime_core::Result<()> {
        let trainer = &self.0;
        let manager = open_manager(&trainer.root, collective.clone()).await?;

        let mut state = match manager.load_latest().await? {
            Some((_, state)) => state,
            None => TrainState::initial(),
        };
        trainer
            .resumes
            .lock()
            .unwrap()
            .push((ctx.attempt, ctx.rank, state.step));
        collective.barrier().await?;

        while state.step < TOTAL_STEPS {
            state.train_step();
            tokio::task::yield_now().await;

            if let Some((rank, step, message)) = trainer.fault {
                if ctx.rank == rank
                    && state.step == step
                    && !trainer.fault_fired.swap(true, Ordering::SeqCst)
                {
                    return Err(Error::Internal {
                        message: message.to_string(),
                    });
                }
            }

            if state.step % CHECKPOINT_EVERY == 0 {
                manager
                    .save(state.step, &state, Some(1.0 / state.step as f64), collective.is_leader())
                    .await?;
            }
        }
        Ok(())
    }
}
