//! On-disk checkpoint artifacts
//!
//! A checkpoint directory `step_<8 digits>/` holds the primary state file
//! (`state.bin`) and a metadata file (`meta.json`). Every file and directory
//! is produced under a `*.tmp` sibling name and renamed into place.

use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use runtime_core::{Rank, Result, Step};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Primary state artifact file name
pub const STATE_FILE: &str = "state.bin";

/// Metadata file name
pub const META_FILE: &str = "meta.json";

/// Suffix of in-flight files and directories
pub const TMP_SUFFIX: &str = ".tmp";

/// Magic bytes for state files
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"CKPT";

/// State file format version
pub const CHECKPOINT_VERSION: u32 = 1;

/// magic (4) + version (4) + step (8) + payload length (8)
const HEADER_LEN: usize = 24;

/// Directory name for a step, zero padded to eight digits
pub fn step_dir_name(step: Step) -> String {
    format!("step_{:08}", step)
}

/// Parse a `step_<digits>` directory name; anything else (including temp
/// directories) yields `None`
pub fn parse_step_dir_name(name: &str) -> Option<Step> {
    let digits = name.strip_prefix("step_")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// The `*.tmp` sibling of a file or directory
pub fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(TMP_SUFFIX);
    path.with_file_name(name)
}

/// Contents of `meta.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub step: Step,

    #[serde(default)]
    pub loss: Option<f64>,

    #[serde(default, with = "unix_seconds")]
    pub timestamp: DateTime<Utc>,

    /// Global rank of the process that wrote the checkpoint
    #[serde(default)]
    pub rank: Option<Rank>,
}

/// Why a state file could not be decoded
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("state file shorter than header ({0} bytes)")]
    TooShort(usize),

    #[error("invalid checkpoint magic")]
    BadMagic,

    #[error("unsupported state format version {0}")]
    UnsupportedVersion(u32),

    #[error("state file is for step {actual}, expected {expected}")]
    StepMismatch { expected: Step, actual: Step },

    #[error("payload truncated: header declares {declared} bytes, found {found}")]
    Truncated { declared: u64, found: u64 },
}

/// Frame a codec payload as a state file
pub fn encode_state_file(step: Step, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&CHECKPOINT_MAGIC);
    buf.extend_from_slice(&CHECKPOINT_VERSION.to_le_bytes());
    buf.extend_from_slice(&step.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Strip and check the state file header, returning the codec payload
pub fn decode_state_file(data: Bytes, expected_step: Option<Step>) -> std::result::Result<Bytes, FrameError> {
    if data.len() < HEADER_LEN {
        return Err(FrameError::TooShort(data.len()));
    }
    if data[0..4] != CHECKPOINT_MAGIC {
        return Err(FrameError::BadMagic);
    }

    let word = |range: std::ops::Range<usize>| -> [u8; 8] {
        let mut out = [0u8; 8];
        out.copy_from_slice(&data[range]);
        out
    };

    let mut version = [0u8; 4];
    version.copy_from_slice(&data[4..8]);
    let version = u32::from_le_bytes(version);
    if version != CHECKPOINT_VERSION {
        return Err(FrameError::UnsupportedVersion(version));
    }

    let step = u64::from_le_bytes(word(8..16));
    if let Some(expected) = expected_step {
        if expected != step {
            return Err(FrameError::StepMismatch {
                expected,
                actual: step,
            });
        }
    }

    let declared = u64::from_le_bytes(word(16..24));
    let found = (data.len() - HEADER_LEN) as u64;
    if declared != found {
        return Err(FrameError::Truncated { declared, found });
    }

    Ok(data.slice(HEADER_LEN..))
}

/// Write a file and flush it to disk
pub async fn write_synced(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(data).await?;
    file.sync_all().await
}

/// Serialize `value` as pretty JSON to `path` via a `*.tmp` sibling and rename
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    let temp_path = tmp_sibling(path);
    write_synced(&temp_path, &data).await?;
    fs::rename(&temp_path, path).await?;
    Ok(())
}

/// Flush a directory entry table so a preceding rename survives power loss
pub async fn sync_dir(path: &Path) {
    #[cfg(unix)]
    {
        let result = match File::open(path).await {
            Ok(dir) => dir.sync_all().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            debug!(path = %path.display(), error = %e, "Directory sync skipped");
        }
    }

    #[cfg(not(unix))]
    let _ = path;
}

/// Outcome of the structural validity check on a checkpoint directory
#[derive(Debug, Clone, PartialEq)]
pub enum DirCheck {
    Valid(CheckpointMeta),
    Invalid(String),
}

impl DirCheck {
    pub fn is_valid(&self) -> bool {
        matches!(self, DirCheck::Valid(_))
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            DirCheck::Valid(_) => None,
            DirCheck::Invalid(reason) => Some(reason),
        }
    }
}

/// Structural validity check.
///
/// The directory must exist and hold a readable metadata file whose step
/// matches `expected_step` (when given), plus either the primary state file
/// or at least one other entry. The second form accepts snapshots written by
/// external checkpointing libraries that use their own file names.
pub async fn inspect_dir(path: &Path, expected_step: Option<Step>) -> DirCheck {
    match fs::metadata(path).await {
        Ok(m) if m.is_dir() => {}
        Ok(_) => return DirCheck::Invalid("not a directory".to_string()),
        Err(_) => return DirCheck::Invalid("checkpoint directory missing".to_string()),
    }

    let raw = match fs::read(path.join(META_FILE)).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return DirCheck::Invalid("missing metadata file".to_string())
        }
        Err(e) => return DirCheck::Invalid(format!("unreadable metadata file: {}", e)),
    };
    let meta: CheckpointMeta = match serde_json::from_slice(&raw) {
        Ok(meta) => meta,
        Err(e) => return DirCheck::Invalid(format!("corrupt metadata file: {}", e)),
    };
    if let Some(expected) = expected_step {
        if meta.step != expected {
            return DirCheck::Invalid(format!(
                "metadata step {} does not match expected step {}",
                meta.step, expected
            ));
        }
    }

    let has_state = fs::metadata(path.join(STATE_FILE))
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);
    if has_state || has_other_entries(path).await {
        DirCheck::Valid(meta)
    } else {
        DirCheck::Invalid("missing state artifact".to_string())
    }
}

async fn has_other_entries(path: &Path) -> bool {
    let Ok(mut entries) = fs::read_dir(path).await else {
        return false;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name != META_FILE && !name.ends_with(TMP_SUFFIX) {
            return true;
        }
    }
    false
}

/// `DateTime<Utc>` as fractional Unix seconds
pub(crate) mod unix_seconds {
    use chrono::{DateTime, Utc};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(time: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(time.timestamp_micros() as f64 / 1_000_000.0)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() {
            return Err(D::Error::custom("timestamp is not finite"));
        }
        DateTime::from_timestamp_micros((secs * 1_000_000.0).round() as i64)
            .ok_or_else(|| D::Error::custom(format!("timestamp {} out of range", secs)))
    }
}
