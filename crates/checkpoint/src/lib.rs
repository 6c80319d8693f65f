//! Checkpoint management for fault-tolerant training
//!
//! Owns one checkpoint root directory: a `manifest.json` index plus one
//! `step_<N>` directory per snapshot. Only the leader process writes; every
//! write goes through a `*.tmp` sibling and an atomic rename.

pub mod artifact;
pub mod codec;
pub mod manager;
pub mod manifest;

pub use artifact::{CheckpointMeta, DirCheck, META_FILE, STATE_FILE};
pub use codec::{BincodeCodec, RawCodec, StateCodec};
pub use manager::{CheckpointManager, CheckpointManagerConfig, LoadOutcome, ValidationReport};
pub use manifest::{CheckpointRecord, Manifest, MANIFEST_FILE};
