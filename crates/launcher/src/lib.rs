//! Launcher - starts a distributed training job under the retry supervisor
//!
//! [`Launcher::launch`] assigns ranks, hands the worker set to a
//! [`ProcessGroup`], and relaunches the whole group from scratch whenever a
//! transient failure tears it down. Resuming from the latest checkpoint is
//! the entrypoint's job.

pub mod group;
pub mod launcher;
pub mod worker;

pub use group::{CommandGroup, ProcessGroup, TaskGroup};
pub use launcher::Launcher;
pub use worker::WorkerFn;
