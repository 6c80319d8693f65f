//! Checkpoint manifest manager
//!
//! Every process of a job opens a manager on the same root. Only the leader
//! writes; followers wait at the job barrier inside [`CheckpointManager::save`]
//! so nobody moves past a checkpoint before its outcome is in the manifest.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use runtime_core::{CheckpointConfig, Collective, Error, Result, Step};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::artifact::{
    self, decode_state_file, encode_state_file, inspect_dir, parse_step_dir_name, step_dir_name,
    tmp_sibling, write_json_atomic, write_synced, CheckpointMeta, DirCheck, META_FILE, STATE_FILE,
};
use crate::codec::{RawCodec, StateCodec};
use crate::manifest::{CheckpointRecord, Manifest, MANIFEST_FILE};

/// Checkpoint manager configuration
#[derive(Debug, Clone)]
pub struct CheckpointManagerConfig {
    /// Root directory for the manifest and checkpoint directories
    pub root: PathBuf,

    /// Number of manifest records to keep
    pub history_limit: usize,
}

impl Default for CheckpointManagerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./checkpoints"),
            history_limit: 20,
        }
    }
}

impl From<&CheckpointConfig> for CheckpointManagerConfig {
    fn from(config: &CheckpointConfig) -> Self {
        Self {
            root: config.root.clone(),
            history_limit: config.history_limit,
        }
    }
}

/// Result of reading a checkpoint's primary state artifact
#[derive(Debug)]
pub enum LoadOutcome<T> {
    Loaded(T),
    CorruptArtifact { reason: String },
}

impl<T> LoadOutcome<T> {
    pub fn is_loaded(&self) -> bool {
        matches!(self, LoadOutcome::Loaded(_))
    }

    /// Convert into a `Result`, reporting corruption as [`Error::CheckpointCorrupted`]
    pub fn into_result(self, location: &Path) -> Result<T> {
        match self {
            LoadOutcome::Loaded(state) => Ok(state),
            LoadOutcome::CorruptArtifact { reason } => Err(Error::CheckpointCorrupted {
                location: location.to_path_buf(),
                reason,
            }),
        }
    }
}

/// One line of the offline audit report
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    pub step: Step,
    pub location: PathBuf,
    pub ok: bool,
    pub reason: Option<String>,
}

/// Checkpoint manifest manager for one checkpoint root
pub struct CheckpointManager<C: StateCodec = RawCodec> {
    root: PathBuf,
    manifest_path: PathBuf,
    history_limit: usize,
    codec: C,
    collective: Arc<dyn Collective>,

    /// Serializes read-modify-write cycles on the manifest within this process
    manifest_lock: Mutex<()>,
}

impl<C: StateCodec> CheckpointManager<C> {
    /// Open (creating if needed) a checkpoint root
    pub async fn open(
        config: CheckpointManagerConfig,
        codec: C,
        collective: Arc<dyn Collective>,
    ) -> Result<Self> {
        if config.history_limit == 0 {
            return Err(Error::invalid_config("history_limit must be at least 1"));
        }

        fs::create_dir_all(&config.root).await.map_err(|e| Error::Internal {
            message: format!(
                "Failed to create checkpoint root {}: {}",
                config.root.display(),
                e
            ),
        })?;

        let manifest_path = config.root.join(MANIFEST_FILE);
        Ok(Self {
            root: config.root,
            manifest_path,
            history_limit: config.history_limit,
            codec,
            collective,
            manifest_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Final directory for a step
    pub fn checkpoint_dir(&self, step: Step) -> PathBuf {
        self.root.join(step_dir_name(step))
    }

    /// Persist `state` as the checkpoint for `step`.
    ///
    /// Followers (`is_leader == false`) touch nothing on disk, wait at the
    /// barrier and return `None`. The leader writes into `step_<N>.tmp`,
    /// renames it to `step_<N>`, records the outcome in the manifest and only
    /// then enters the barrier, so the barrier releases on success and on
    /// failure alike.
    #[instrument(skip(self, state), fields(rank = self.collective.rank()))]
    pub async fn save(
        &self,
        step: Step,
        state: &C::State,
        metric: Option<f64>,
        is_leader: bool,
    ) -> Result<Option<PathBuf>> {
        if !is_leader {
            debug!(step, "Follower waiting for leader checkpoint");
            self.collective.barrier().await?;
            return Ok(None);
        }

        let outcome = match self.write_checkpoint(step, state, metric).await {
            Ok(location) => {
                let record = CheckpointRecord {
                    step,
                    location: location.clone(),
                    metric,
                    created_at: Utc::now(),
                    valid: true,
                };
                self.append_record(record).await.map(|_| location)
            }
            Err(e) => {
                error!(step, error = %e, "Checkpoint write failed");
                let record = CheckpointRecord {
                    step,
                    location: self.checkpoint_dir(step),
                    metric,
                    created_at: Utc::now(),
                    valid: false,
                };
                if let Err(record_err) = self.append_record(record).await {
                    warn!(step, error = %record_err, "Failed to record failed checkpoint");
                }
                Err(Error::CheckpointWriteFailed {
                    step,
                    message: e.to_string(),
                })
            }
        };

        self.collective.barrier().await?;

        let location = outcome?;
        info!(step, path = %location.display(), "Checkpoint committed");
        Ok(Some(location))
    }

    /// Write state and metadata into a temp directory and rename it into place
    async fn write_checkpoint(
        &self,
        step: Step,
        state: &C::State,
        metric: Option<f64>,
    ) -> Result<PathBuf> {
        let start = std::time::Instant::now();
        let final_dir = self.checkpoint_dir(step);
        let temp_dir = tmp_sibling(&final_dir);

        let payload = self.codec.encode(state)?;
        let framed = encode_state_file(step, &payload);

        if fs::metadata(&temp_dir).await.is_ok() {
            warn!(path = %temp_dir.display(), "Removing leftover temp checkpoint directory");
            fs::remove_dir_all(&temp_dir).await?;
        }
        fs::create_dir_all(&temp_dir).await?;
        write_synced(&temp_dir.join(STATE_FILE), &framed).await?;

        let meta = CheckpointMeta {
            step,
            loss: metric,
            timestamp: Utc::now(),
            rank: Some(self.collective.rank()),
        };
        write_json_atomic(&temp_dir.join(META_FILE), &meta).await?;

        if fs::metadata(&final_dir).await.is_ok() {
            warn!(path = %final_dir.display(), "Replacing existing checkpoint directory");
            fs::remove_dir_all(&final_dir).await?;
        }
        fs::rename(&temp_dir, &final_dir).await?;
        artifact::sync_dir(&self.root).await;

        let elapsed = start.elapsed();
        info!(
            step,
            size_bytes = framed.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Checkpoint written"
        );

        Ok(final_dir)
    }

    /// Manifest records in insertion order (oldest first), at most `history_limit`
    pub async fn list_checkpoints(&self) -> Result<Vec<CheckpointRecord>> {
        Ok(self.read_manifest().await.history)
    }

    /// Latest checkpoint that passes the on-disk validity check.
    ///
    /// The manifest pointer is trusted only after re-verification; otherwise
    /// the root is scanned for `step_<N>` directories, newest first.
    pub async fn latest_checkpoint(&self) -> Result<Option<CheckpointRecord>> {
        let manifest = self.read_manifest().await;

        if let Some(step) = manifest.latest_valid_step {
            let record = match manifest.find(step) {
                Some(record) => record.clone(),
                None => CheckpointRecord {
                    step,
                    location: self.checkpoint_dir(step),
                    metric: None,
                    created_at: Utc::now(),
                    valid: true,
                },
            };

            if record.valid {
                match inspect_dir(&record.location, Some(step)).await {
                    DirCheck::Valid(_) => return Ok(Some(record)),
                    DirCheck::Invalid(reason) => {
                        warn!(step, reason = %reason, "Manifest latest failed verification, scanning root");
                    }
                }
            }
        }

        for (step, path) in self.scan_step_dirs().await? {
            if manifest.is_marked_invalid(step) {
                debug!(step, "Skipping checkpoint marked invalid in manifest");
                continue;
            }
            match inspect_dir(&path, Some(step)).await {
                DirCheck::Valid(meta) => {
                    info!(step, path = %path.display(), "Recovered latest checkpoint from directory scan");
                    return Ok(Some(CheckpointRecord::from_meta(&meta, path)));
                }
                DirCheck::Invalid(reason) => {
                    debug!(step, reason = %reason, "Skipping invalid checkpoint directory");
                }
            }
        }

        Ok(None)
    }

    /// Audit every `step_<N>` directory on disk, independent of the manifest
    pub async fn validate_all(&self) -> Result<Vec<ValidationReport>> {
        let mut reports = Vec::new();
        for (step, location) in self.scan_step_dirs().await? {
            let check = inspect_dir(&location, Some(step)).await;
            reports.push(ValidationReport {
                step,
                ok: check.is_valid(),
                reason: check.reason().map(str::to_string),
                location,
            });
        }
        Ok(reports)
    }

    /// Register a checkpoint directory populated by another mechanism.
    ///
    /// Writes only the metadata file and the manifest entry; the directory's
    /// other contents are left alone. Leader only.
    pub async fn record_external(
        &self,
        step: Step,
        location: impl Into<PathBuf>,
        metric: Option<f64>,
    ) -> Result<CheckpointRecord> {
        let location = location.into();
        fs::create_dir_all(&location).await?;

        let meta = CheckpointMeta {
            step,
            loss: metric,
            timestamp: Utc::now(),
            rank: Some(self.collective.rank()),
        };
        write_json_atomic(&location.join(META_FILE), &meta).await?;

        let record = CheckpointRecord::from_meta(&meta, location);
        self.append_record(record.clone()).await?;

        info!(step, path = %record.location.display(), "External checkpoint recorded");
        Ok(record)
    }

    /// Read and decode the primary state artifact at `location`.
    ///
    /// Never fails: unreadable or undecodable artifacts come back as
    /// [`LoadOutcome::CorruptArtifact`].
    pub async fn load(&self, location: &Path) -> LoadOutcome<C::State> {
        let expected_step = location
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_step_dir_name);

        let data = match fs::read(location.join(STATE_FILE)).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return LoadOutcome::CorruptArtifact {
                    reason: "missing state file".to_string(),
                }
            }
            Err(e) => {
                return LoadOutcome::CorruptArtifact {
                    reason: format!("unreadable state file: {}", e),
                }
            }
        };

        let payload = match decode_state_file(data, expected_step) {
            Ok(payload) => payload,
            Err(e) => {
                return LoadOutcome::CorruptArtifact {
                    reason: e.to_string(),
                }
            }
        };

        match self.codec.decode(payload) {
            Ok(state) => LoadOutcome::Loaded(state),
            Err(e) => LoadOutcome::CorruptArtifact {
                reason: e.to_string(),
            },
        }
    }

    /// Flag `step` invalid in the manifest.
    ///
    /// Steps unknown to the manifest get an invalid record appended so the
    /// fallback scan skips them too. Returns true if a record already existed.
    pub async fn invalidate(&self, step: Step) -> Result<bool> {
        let _guard = self.manifest_lock.lock().await;
        let mut manifest = self.read_manifest().await;

        let found = manifest.invalidate(step);
        if !found {
            manifest.record(
                CheckpointRecord {
                    step,
                    location: self.checkpoint_dir(step),
                    metric: None,
                    created_at: Utc::now(),
                    valid: false,
                },
                self.history_limit,
            );
        }

        self.write_manifest(&manifest).await?;
        warn!(step, latest = ?manifest.latest_valid_step, "Checkpoint marked invalid");
        Ok(found)
    }

    /// Latest checkpoint together with its decoded state.
    ///
    /// A corrupt artifact is marked invalid and reported as "nothing usable";
    /// the next-older checkpoint is not tried within the same call.
    pub async fn load_latest(&self) -> Result<Option<(CheckpointRecord, C::State)>> {
        let Some(record) = self.latest_checkpoint().await? else {
            return Ok(None);
        };

        match self.load(&record.location).await {
            LoadOutcome::Loaded(state) => {
                info!(step = record.step, "Loaded checkpoint");
                Ok(Some((record, state)))
            }
            LoadOutcome::CorruptArtifact { reason } => {
                warn!(
                    step = record.step,
                    path = %record.location.display(),
                    reason = %reason,
                    "Checkpoint failed to load"
                );
                self.invalidate(record.step).await?;
                Ok(None)
            }
        }
    }

    /// `(step, path)` for every `step_<N>` directory in the root, newest first
    async fn scan_step_dirs(&self) -> Result<Vec<(Step, PathBuf)>> {
        let mut candidates = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(step) = name.to_str().and_then(parse_step_dir_name) {
                candidates.push((step, entry.path()));
            }
        }

        candidates.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(candidates)
    }

    async fn append_record(&self, record: CheckpointRecord) -> Result<()> {
        let _guard = self.manifest_lock.lock().await;
        let mut manifest = self.read_manifest().await;
        manifest.record(record, self.history_limit);
        self.write_manifest(&manifest).await
    }

    /// Current manifest; a missing or unreadable file reads as empty
    async fn read_manifest(&self) -> Manifest {
        let raw = match fs::read(&self.manifest_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Manifest::default(),
            Err(e) => {
                warn!(path = %self.manifest_path.display(), error = %e, "Manifest unreadable, treating as empty");
                return Manifest::default();
            }
        };

        match serde_json::from_slice(&raw) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(path = %self.manifest_path.display(), error = %e, "Manifest corrupt, treating as empty");
                Manifest::default()
            }
        }
    }

    async fn write_manifest(&self, manifest: &Manifest) -> Result<()> {
        write_json_atomic(&self.manifest_path, manifest).await?;
        artifact::sync_dir(&self.root).await;
        Ok(())
    }
}

/// Thread-safe handle to checkpoint manager
pub type CheckpointManagerHandle<C = RawCodec> = Arc<CheckpointManager<C>>;
