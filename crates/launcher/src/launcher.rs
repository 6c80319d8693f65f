//! Launch coordinator
//!
//! Every attempt gets a fresh run id and a fresh set of worker contexts;
//! nothing from a torn-down group is reused.

use runtime_core::{Error, GracefulTerminator, LaunchConfig, Result, WorkerContext};
use supervisor::{FaultClassifier, RetryPolicy, RetrySupervisor, SupervisorError};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::group::ProcessGroup;

/// Assigns ranks and runs a job's process group under the retry supervisor
#[derive(Debug, Clone)]
pub struct Launcher {
    config: LaunchConfig,
    supervisor: RetrySupervisor,
}

impl Launcher {
    /// Create a launcher; the retry policy comes from `config.retry`
    pub fn new(config: LaunchConfig, terminator: GracefulTerminator) -> Result<Self> {
        config.validate()?;
        let policy = RetryPolicy::try_from(&config.retry)?;
        Ok(Self {
            supervisor: RetrySupervisor::new(policy, terminator),
            config,
        })
    }

    pub fn with_classifier(mut self, classifier: FaultClassifier) -> Self {
        self.supervisor = self.supervisor.with_classifier(classifier);
        self
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    pub fn world_size(&self) -> u32 {
        self.config.world_size()
    }

    /// Contexts for the workers of this node, ordered by local rank
    pub fn worker_contexts(&self, run_id: &str, attempt: u32) -> Vec<WorkerContext> {
        let config = &self.config;
        let world_size = config.world_size();
        (0..config.units_per_node)
            .map(|local_rank| WorkerContext {
                rank: config.node_rank * config.units_per_node + local_rank,
                local_rank,
                world_size,
                local_world_size: config.units_per_node,
                coordinator_address: config.coordinator_address.clone(),
                coordinator_port: config.coordinator_port,
                backend: config.backend.clone(),
                run_id: run_id.to_string(),
                attempt,
            })
            .collect()
    }

    /// Run the job to completion, relaunching the whole group on transient failure.
    ///
    /// Returns [`Error::Terminated`] when a shutdown is requested; the
    /// running group is torn down rather than waited for.
    #[instrument(skip(self, group), fields(world_size = self.world_size()))]
    pub async fn launch<G>(&self, group: &G) -> Result<()>
    where
        G: ProcessGroup + ?Sized,
    {
        let terminator = self.supervisor.terminator().clone();
        let mut attempt: u32 = 0;

        let outcome = self
            .supervisor
            .run(|| {
                let run_id = Uuid::new_v4().to_string();
                let workers = self.worker_contexts(&run_id, attempt);
                info!(attempt, %run_id, workers = workers.len(), "Launching process group");
                attempt += 1;

                let terminator = terminator.clone();
                let inline = self.world_size() == 1;
                async move {
                    let run = async {
                        if !inline {
                            return group.run(workers).await;
                        }
                        match workers.into_iter().next() {
                            Some(worker) => group.run_inline(worker).await,
                            None => Err(Error::invalid_config("no workers to launch")),
                        }
                    };
                    tokio::select! {
                        outcome = run => outcome,
                        _ = terminator.terminated() => Err(Error::Terminated),
                    }
                }
            })
            .await;

        match outcome {
            Ok(()) => {
                info!("Job completed");
                Ok(())
            }
            Err(SupervisorError::Terminated { .. }) => Err(Error::Terminated),
            Err(SupervisorError::Fatal { error, .. })
            | Err(SupervisorError::Exhausted { error, .. }) => Err(error),
        }
    }
}
