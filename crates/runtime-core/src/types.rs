//! Core type definitions for the fault-tolerant training runtime

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Training step counter
pub type Step = u64;

/// Global or local process rank
pub type Rank = u32;

/// Environment variables carrying the worker topology
pub mod env {
    pub const RANK: &str = "RANK";
    pub const WORLD_SIZE: &str = "WORLD_SIZE";
    pub const LOCAL_RANK: &str = "LOCAL_RANK";
    pub const LOCAL_WORLD_SIZE: &str = "LOCAL_WORLD_SIZE";
    pub const MASTER_ADDR: &str = "MASTER_ADDR";
    pub const MASTER_PORT: &str = "MASTER_PORT";
    pub const BACKEND: &str = "DTR_BACKEND";
    pub const RUN_ID: &str = "DTR_RUN_ID";
    pub const LAUNCH_ATTEMPT: &str = "DTR_LAUNCH_ATTEMPT";
}

/// Topology parameters handed to a single worker process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerContext {
    /// Global rank (`node_rank * units_per_node + local_rank`)
    pub rank: Rank,

    /// Rank within this node
    pub local_rank: Rank,

    /// Total number of workers in the job
    pub world_size: u32,

    /// Number of workers on this node
    pub local_world_size: u32,

    /// Rendezvous address of the collective layer
    pub coordinator_address: String,

    /// Rendezvous port of the collective layer
    pub coordinator_port: u16,

    /// Optional communication backend selector
    pub backend: Option<String>,

    /// Identifier shared by every worker of one launch attempt
    pub run_id: String,

    /// Zero-based launch attempt counter
    pub attempt: u32,
}

impl WorkerContext {
    /// Returns true for the designated writer process
    pub fn is_leader(&self) -> bool {
        self.rank == 0
    }

    /// Environment variables to inject into a spawned worker
    pub fn to_env(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            (env::RANK, self.rank.to_string()),
            (env::WORLD_SIZE, self.world_size.to_string()),
            (env::LOCAL_RANK, self.local_rank.to_string()),
            (env::LOCAL_WORLD_SIZE, self.local_world_size.to_string()),
            (env::MASTER_ADDR, self.coordinator_address.clone()),
            (env::MASTER_PORT, self.coordinator_port.to_string()),
            (env::RUN_ID, self.run_id.clone()),
            (env::LAUNCH_ATTEMPT, self.attempt.to_string()),
        ];
        if let Some(backend) = &self.backend {
            vars.push((env::BACKEND, backend.clone()));
        }
        vars
    }

    /// Rebuild the context inside a worker from its environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Rebuild the context from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key).ok_or_else(|| Error::invalid_config(format!("{} is not set", key)))
        };
        let parse = |key: &str| -> Result<u32> {
            required(key)?
                .parse()
                .map_err(|e| Error::invalid_config(format!("{} is not a number: {}", key, e)))
        };

        let coordinator_port = required(env::MASTER_PORT)?
            .parse()
            .map_err(|e| Error::invalid_config(format!("{} is not a port: {}", env::MASTER_PORT, e)))?;

        Ok(Self {
            rank: parse(env::RANK)?,
            local_rank: parse(env::LOCAL_RANK)?,
            world_size: parse(env::WORLD_SIZE)?,
            local_world_size: parse(env::LOCAL_WORLD_SIZE)?,
            coordinator_address: required(env::MASTER_ADDR)?,
            coordinator_port,
            backend: lookup(env::BACKEND),
            run_id: lookup(env::RUN_ID).unwrap_or_default(),
            attempt: lookup(env::LAUNCH_ATTEMPT)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        })
    }
}
