//! Manifest model: the persisted index of known checkpoints

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use runtime_core::Step;
use serde::{Deserialize, Serialize};

use crate::artifact::{unix_seconds, CheckpointMeta};

/// Manifest file name inside the checkpoint root
pub const MANIFEST_FILE: &str = "manifest.json";

/// One snapshot attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Training step at checkpoint
    pub step: Step,

    /// Checkpoint directory
    #[serde(rename = "path")]
    pub location: PathBuf,

    /// Training metric (loss) at checkpoint, if reported
    #[serde(rename = "loss", default)]
    pub metric: Option<f64>,

    /// When the record was written
    #[serde(rename = "timestamp", default, with = "unix_seconds")]
    pub created_at: DateTime<Utc>,

    /// False once the save failed or a later load proved the artifact corrupt
    #[serde(rename = "ok", default = "default_valid")]
    pub valid: bool,
}

fn default_valid() -> bool {
    true
}

impl CheckpointRecord {
    /// Build a valid record from a checkpoint's metadata file
    pub fn from_meta(meta: &CheckpointMeta, location: PathBuf) -> Self {
        Self {
            step: meta.step,
            location,
            metric: meta.loss,
            created_at: meta.timestamp,
            valid: true,
        }
    }
}

/// Persisted manifest: `{latest, checkpoints: [...]}`
///
/// Invariant: `latest_valid_step`, when set, names a record in `history`
/// whose `valid` flag is true.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "latest", default)]
    pub latest_valid_step: Option<Step>,

    /// Records in insertion order, oldest first
    #[serde(rename = "checkpoints", default)]
    pub history: Vec<CheckpointRecord>,
}

impl Manifest {
    /// Append a record, keep only the newest `limit` entries, and advance
    /// `latest` only when the record is valid
    pub fn record(&mut self, record: CheckpointRecord, limit: usize) {
        let step = record.step;
        let valid = record.valid;
        self.history.push(record);

        if self.history.len() > limit {
            let excess = self.history.len() - limit;
            self.history.drain(..excess);
        }

        if valid {
            self.latest_valid_step = Some(step);
        } else {
            self.repair_latest();
        }
    }

    /// Flag every record for `step` invalid and move `latest` off it.
    ///
    /// Returns false when the manifest has no record for `step`.
    pub fn invalidate(&mut self, step: Step) -> bool {
        let mut found = false;
        for record in self.history.iter_mut().filter(|r| r.step == step) {
            record.valid = false;
            found = true;
        }
        self.repair_latest();
        found
    }

    /// Most recent record for `step`
    pub fn find(&self, step: Step) -> Option<&CheckpointRecord> {
        self.history.iter().rev().find(|r| r.step == step)
    }

    /// Record referenced by `latest`
    pub fn latest_record(&self) -> Option<&CheckpointRecord> {
        self.latest_valid_step.and_then(|step| self.find(step))
    }

    /// True when the newest record for `step` is flagged invalid
    pub fn is_marked_invalid(&self, step: Step) -> bool {
        self.find(step).map(|r| !r.valid).unwrap_or(false)
    }

    /// Re-establish the `latest` invariant after history changed
    fn repair_latest(&mut self) {
        let still_valid = self
            .latest_record()
            .map(|r| r.valid)
            .unwrap_or(false);
        if !still_valid {
            self.latest_valid_step = self.history.iter().rev().find(|r| r.valid).map(|r| r.step);
        }
    }
}
