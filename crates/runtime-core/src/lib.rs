//! Runtime Core - Foundation for the fault-tolerant training launcher
//!
//! Provides core types, error handling, configuration, the graceful
//! termination latch and the collective-communication seam shared by the
//! checkpoint, supervisor and launcher crates.

pub mod collective;
pub mod config;
pub mod error;
pub mod shutdown;
pub mod telemetry;
pub mod types;

pub use collective::{Collective, LocalGroup, SingleProcess};
pub use config::{CheckpointConfig, FaultConfig, LaunchConfig, RetryConfig, RuntimeConfig};
pub use error::{Error, Result};
pub use shutdown::GracefulTerminator;
pub use types::*;
