//! Launching real worker processes
#![cfg(unix)]

use std::time::Duration;

use anyhow::Result;
use launcher::{CommandGroup, Launcher};
use runtime_core::{Error, GracefulTerminator, LaunchConfig, RetryConfig};
use tempfile::TempDir;

fn config(units: u32, max_retries: u32) -> LaunchConfig {
    LaunchConfig {
        units_per_node: units,
        coordinator_port: 29511,
        retry: RetryConfig {
            max_retries,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
        },
        ..LaunchConfig::default()
    }
}

fn sh(script: String) -> CommandGroup {
    CommandGroup::new("sh", ["-c".to_string(), script])
}

#[tokio::test]
async fn test_transient_process_failure_is_relaunched() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let marker = temp_dir.path().join("first-attempt-done");

    // Rank 1 fails with an NCCL error on the first launch only.
    let script = format!(
        r#"if [ "$RANK" = 1 ] && [ "$DTR_LAUNCH_ATTEMPT" = 0 ]; then
             touch {marker}; echo "NCCL error: remote process exited" >&2; exit 1
           fi
           echo "$RANK $WORLD_SIZE $MASTER_PORT" > {dir}/rank-$RANK-attempt-$DTR_LAUNCH_ATTEMPT"#,
        marker = marker.display(),
        dir = temp_dir.path().display(),
    );

    let launcher = Launcher::new(config(2, 2), GracefulTerminator::new())?;
    launcher.launch(&sh(script)).await?;

    assert!(marker.exists());
    for rank in 0..2 {
        let line = tokio::fs::read_to_string(
            temp_dir.path().join(format!("rank-{}-attempt-1", rank)),
        )
        .await?;
        assert_eq!(line.trim(), format!("{} 2 29511", rank));
    }
    Ok(())
}

#[tokio::test]
async fn test_fatal_process_failure_surfaces_stderr() -> Result<()> {
    let script = r#"echo "Traceback (most recent call last):" >&2
                    echo "ZeroDivisionError: division by zero" >&2
                    exit 1"#
        .to_string();

    let launcher = Launcher::new(config(1, 3), GracefulTerminator::new())?;
    match launcher.launch(&sh(script)).await {
        Err(Error::WorkerFailed {
            rank, stderr_tail, ..
        }) => {
            assert_eq!(rank, 0);
            assert!(stderr_tail.ends_with("ZeroDivisionError: division by zero"));
        }
        other => panic!("expected WorkerFailed, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_persistent_transient_failure_exhausts_retries() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let script = format!(
        r#"touch {}/attempt-$DTR_LAUNCH_ATTEMPT; echo "Connection reset by peer" >&2; exit 1"#,
        temp_dir.path().display()
    );

    let launcher = Launcher::new(config(1, 2), GracefulTerminator::new())?;
    let err = launcher.launch(&sh(script)).await.unwrap_err();
    assert!(err.to_string().contains("Connection reset by peer"));

    for attempt in 0..3 {
        assert!(temp_dir.path().join(format!("attempt-{}", attempt)).exists());
    }
    assert!(!temp_dir.path().join("attempt-3").exists());
    Ok(())
}
