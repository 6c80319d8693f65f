//! Checkpoint recovery after partial failures
//!
//! Each test leaves the checkpoint root in a state a crash could produce and
//! reopens it with a fresh manager, the way a relaunched job would.

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use checkpoint::{CheckpointManager, CheckpointManagerConfig, RawCodec, MANIFEST_FILE};
use runtime_core::{Collective, LocalGroup, SingleProcess};
use tempfile::TempDir;

async fn open(temp_dir: &TempDir) -> Result<CheckpointManager> {
    let config = CheckpointManagerConfig {
        root: temp_dir.path().to_path_buf(),
        ..CheckpointManagerConfig::default()
    };
    Ok(CheckpointManager::open(config, RawCodec, Arc::new(SingleProcess)).await?)
}

fn blob(step: u64) -> Bytes {
    Bytes::from(format!("model-state-{}", step).repeat(64))
}

#[tokio::test]
async fn test_relaunch_sees_checkpoints_of_previous_run() -> Result<()> {
    let temp_dir = TempDir::new()?;
    {
        let manager = open(&temp_dir).await?;
        for step in [100, 200, 300] {
            manager.save(step, &blob(step), Some(3.0 - step as f64 / 100.0), true).await?;
        }
    }

    let manager = open(&temp_dir).await?;
    let (record, state) = manager.load_latest().await?.expect("checkpoint");
    assert_eq!(record.step, 300);
    assert_eq!(record.metric, Some(0.0));
    assert_eq!(state, blob(300));
    Ok(())
}

#[tokio::test]
async fn test_crash_before_rename_is_invisible() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let manager = open(&temp_dir).await?;
    manager.save(1, &blob(1), None, true).await?;

    // A save of step 2 that died after writing its files but before the rename.
    let partial = temp_dir.path().join("step_00000002.tmp");
    tokio::fs::create_dir_all(&partial).await?;
    tokio::fs::write(partial.join("state.bin"), b"half written").await?;
    tokio::fs::write(partial.join("meta.json"), br#"{"step": 2}"#).await?;

    let manager = open(&temp_dir).await?;
    assert_eq!(manager.latest_checkpoint().await?.map(|r| r.step), Some(1));
    assert!(manager.validate_all().await?.iter().all(|r| r.step == 1));

    // The retried save replaces the leftover cleanly.
    let location = manager.save(2, &blob(2), None, true).await?.expect("leader location");
    assert!(!partial.exists());
    assert_eq!(manager.latest_checkpoint().await?.map(|r| r.step), Some(2));
    assert_eq!(manager.load(&location).await.into_result(&location)?, blob(2));
    Ok(())
}

#[tokio::test]
async fn test_lost_manifest_is_rebuilt_from_scan() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let manager = open(&temp_dir).await?;
    for step in 1..=4 {
        manager.save(step, &blob(step), None, true).await?;
    }
    tokio::fs::remove_file(temp_dir.path().join(MANIFEST_FILE)).await?;

    let manager = open(&temp_dir).await?;
    assert!(manager.list_checkpoints().await?.is_empty());
    let latest = manager.latest_checkpoint().await?.expect("scan finds step 4");
    assert_eq!(latest.step, 4);
    Ok(())
}

#[tokio::test]
async fn test_corrupt_latest_falls_back_on_next_launch() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let manager = open(&temp_dir).await?;
    for step in [7, 8] {
        manager.save(step, &blob(step), None, true).await?;
    }
    let step8 = manager.checkpoint_dir(8);
    tokio::fs::write(step8.join("state.bin"), b"garbage").await?;

    // First relaunch: the corrupt artifact is detected and marked invalid.
    assert!(manager.load_latest().await?.is_none());
    let records = manager.list_checkpoints().await?;
    assert!(records.iter().any(|r| r.step == 8 && !r.valid));

    // Second relaunch resumes from step 7.
    let manager = open(&temp_dir).await?;
    let (record, state) = manager.load_latest().await?.expect("step 7");
    assert_eq!(record.step, 7);
    assert_eq!(state, blob(7));
    Ok(())
}

#[tokio::test]
async fn test_all_ranks_agree_on_latest_after_save() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let members = LocalGroup::new(4);

    let mut handles = Vec::new();
    for member in members {
        let root = temp_dir.path().to_path_buf();
        handles.push(tokio::spawn(async move {
            let collective: Arc<dyn Collective> = Arc::new(member);
            let manager = CheckpointManager::open(
                CheckpointManagerConfig {
                    root,
                    ..CheckpointManagerConfig::default()
                },
                RawCodec,
                collective.clone(),
            )
            .await?;

            let mut seen = Vec::new();
            for step in [10, 20, 30] {
                let location = manager
                    .save(step, &blob(step), None, collective.is_leader())
                    .await?;
                assert_eq!(location.is_some(), collective.is_leader());
                seen.push(manager.latest_checkpoint().await?.map(|r| r.step));
                // Keep the leader from writing the next step while others still read.
                collective.barrier().await?;
            }
            Ok::<_, runtime_core::Error>(seen)
        }));
    }

    for handle in handles {
        let seen = handle.await??;
        assert_eq!(seen, vec![Some(10), Some(20), Some(30)]);
    }
    Ok(())
}

#[tokio::test]
async fn test_external_checkpoint_is_resumable() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let manager = open(&temp_dir).await?;
    manager.save(50, &blob(50), None, true).await?;

    // A sharded writer produced step 60 without the primary state file.
    let external = manager.checkpoint_dir(60);
    tokio::fs::create_dir_all(&external).await?;
    tokio::fs::write(external.join("shard_0_of_2.distcp"), b"shard0").await?;
    tokio::fs::write(external.join("shard_1_of_2.distcp"), b"shard1").await?;

    let record = manager.record_external(60, &external, Some(0.25)).await?;
    assert!(record.valid);

    let manager = open(&temp_dir).await?;
    let latest = manager.latest_checkpoint().await?.expect("external checkpoint");
    assert_eq!(latest.step, 60);
    assert_eq!(latest.location, external);
    assert!(external.join("shard_1_of_2.distcp").exists());
    Ok(())
}
