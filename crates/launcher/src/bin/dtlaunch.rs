//! dtlaunch - fault-tolerant launcher for distributed training jobs
//!
//! ## Commands
//! - `run` - launch a worker program on every compute unit of this node,
//!   relaunching the whole group on transient failures
//! - `audit` - check every checkpoint directory under a root
//! - `latest` - print the latest valid checkpoint record as JSON

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use checkpoint::{CheckpointManager, CheckpointManagerConfig, RawCodec};
use clap::{Args, Parser, Subcommand};
use launcher::{CommandGroup, Launcher};
use runtime_core::{telemetry, Error, GracefulTerminator, RuntimeConfig, SingleProcess};
use supervisor::FaultClassifier;
use tracing::{error, info, warn};

const DEFAULT_LOG_FILTER: &str = "dtlaunch=info,launcher=info,supervisor=info,checkpoint=info";

/// Fault-tolerant launcher for distributed training jobs
#[derive(Parser, Debug)]
#[command(name = "dtlaunch")]
#[command(about = "Launch and supervise distributed training workers", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Launch a worker program under the retry supervisor
    Run(RunArgs),

    /// Validate every checkpoint directory under a root
    Audit {
        /// Checkpoint root directory
        #[arg(short, long, default_value = "./checkpoints")]
        root: PathBuf,
    },

    /// Print the latest valid checkpoint
    Latest {
        /// Checkpoint root directory
        #[arg(short, long, default_value = "./checkpoints")]
        root: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// JSON runtime configuration; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of nodes in the job
    #[arg(long)]
    nodes: Option<u32>,

    /// Compute units (workers) per node
    #[arg(long)]
    units_per_node: Option<u32>,

    /// Rank of this node
    #[arg(long)]
    node_rank: Option<u32>,

    /// Rendezvous address shared by all workers
    #[arg(long)]
    master_addr: Option<String>,

    /// Rendezvous port shared by all workers
    #[arg(long)]
    master_port: Option<u16>,

    /// Relaunches allowed after the first attempt
    #[arg(long)]
    max_retries: Option<u32>,

    /// Delay before the first relaunch, in milliseconds
    #[arg(long)]
    base_backoff_ms: Option<u64>,

    /// Upper bound on the relaunch delay, in milliseconds
    #[arg(long)]
    max_backoff_ms: Option<u64>,

    /// Communication backend name passed to the workers
    #[arg(long)]
    backend: Option<String>,

    /// Worker program followed by its arguments
    #[arg(last = true, required = true, num_args = 1..)]
    command: Vec<String>,
}

impl RunArgs {
    fn runtime_config(&self) -> Result<RuntimeConfig> {
        let mut config = match &self.config {
            Some(path) => RuntimeConfig::from_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => RuntimeConfig::default(),
        };

        let launch = &mut config.launch;
        if let Some(nodes) = self.nodes {
            launch.node_count = nodes;
        }
        if let Some(units) = self.units_per_node {
            launch.units_per_node = units;
        }
        if let Some(rank) = self.node_rank {
            launch.node_rank = rank;
        }
        if let Some(addr) = &self.master_addr {
            launch.coordinator_address = addr.clone();
        }
        if let Some(port) = self.master_port {
            launch.coordinator_port = port;
        }
        if let Some(retries) = self.max_retries {
            launch.retry.max_retries = retries;
        }
        if let Some(ms) = self.base_backoff_ms {
            launch.retry.base_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = self.max_backoff_ms {
            launch.retry.max_backoff = Duration::from_millis(ms);
        }
        if self.backend.is_some() {
            launch.backend = self.backend.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    telemetry::init_tracing(DEFAULT_LOG_FILTER);

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Audit { root } => audit(root).await,
        Commands::Latest { root } => latest(root).await,
    }
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    let config = args.runtime_config()?;
    let terminator = GracefulTerminator::global().clone();
    terminator.install()?;

    let (program, program_args) = match args.command.split_first() {
        Some(split) => split,
        None => bail!("no worker program given"),
    };

    info!(
        nodes = config.launch.node_count,
        units_per_node = config.launch.units_per_node,
        node_rank = config.launch.node_rank,
        world_size = config.launch.world_size(),
        max_retries = config.launch.retry.max_retries,
        "Starting job"
    );

    let launcher = Launcher::new(config.launch.clone(), terminator)?
        .with_classifier(FaultClassifier::from(&config.fault));
    let group = CommandGroup::new(program, program_args);

    match launcher.launch(&group).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(Error::Terminated) => {
            warn!("Job terminated by shutdown signal");
            Ok(ExitCode::from(130))
        }
        Err(e) => {
            error!(error = %e, "Job failed");
            Err(e.into())
        }
    }
}

async fn open_manager(root: PathBuf) -> Result<CheckpointManager> {
    let config = CheckpointManagerConfig {
        root,
        ..CheckpointManagerConfig::default()
    };
    let manager = CheckpointManager::open(config, RawCodec, Arc::new(SingleProcess)).await?;
    Ok(manager)
}

async fn audit(root: PathBuf) -> Result<ExitCode> {
    let manager = open_manager(root).await?;
    let reports = manager.validate_all().await?;

    let mut bad = 0usize;
    for report in &reports {
        if report.ok {
            println!("ok    {}", report.location.display());
        } else {
            bad += 1;
            println!(
                "FAIL  {}  ({})",
                report.location.display(),
                report.reason.as_deref().unwrap_or("unknown")
            );
        }
    }
    println!("{} checkpoint(s), {} invalid", reports.len(), bad);

    Ok(if bad == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn latest(root: PathBuf) -> Result<ExitCode> {
    let manager = open_manager(root).await?;
    match manager.latest_checkpoint().await? {
        Some(record) => {
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(ExitCode::SUCCESS)
        }
        None => {
            eprintln!("no valid checkpoint under {}", manager.root().display());
            Ok(ExitCode::FAILURE)
        }
    }
}
