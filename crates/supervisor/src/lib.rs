//! Supervisor - fault-tolerant retry loop for distributed training jobs
//!
//! - [`FaultClassifier`] decides whether a failure is worth retrying
//! - [`RetryPolicy`] computes capped exponential backoff
//! - [`RetrySupervisor`] drives attempts, sleeps, and honours the
//!   [`GracefulTerminator`](runtime_core::GracefulTerminator)
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use supervisor::{RetryPolicy, RetrySupervisor};
//! use runtime_core::{Error, GracefulTerminator};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryPolicy::new(3, Duration::from_secs(10), Duration::from_secs(300))?;
//! let supervisor = RetrySupervisor::new(policy, GracefulTerminator::global().clone());
//!
//! supervisor
//!     .run(|| async { Ok::<_, Error>(()) })
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod fault;
mod policy;
mod retry;

pub use fault::{FaultClass, FaultClassifier};
pub use policy::RetryPolicy;
pub use retry::{run_with_retries, RetrySupervisor, SupervisorError};
