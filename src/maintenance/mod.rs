use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use anyhow::{Context, Result};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::AppState;

const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Delete `path` (file or directory) after `delay`, without blocking the caller.
pub fn schedule_removal(path: PathBuf, delay: Duration) {
    tokio::spawn(async move {
        sleep(delay).await;
        if remove_path(&path).await {
            debug!(path = %path.display(), "temporary file removed");
        }
    });
}

/// Periodic safety net for files whose delayed removal never ran, e.g. across a restart.
pub fn spawn(state: AppState) {
    tokio::spawn(async move {
        loop {
            if let Err(err) = run_sweep(&state).await {
                error!(?err, "retention sweep failed");
            }
            sleep(SWEEP_INTERVAL).await;
        }
    });
}

async fn run_sweep(state: &AppState) -> Result<()> {
    let settings = state.settings();
    let retention = settings.file_retention;

    let mut removed = 0_usize;
    removed += sweep_directory(&settings.uploads_dir(), retention).await?;
    removed += sweep_directory(&settings.downloads_dir(), retention).await?;

    let tracker_retention = chrono::Duration::from_std(retention.max(SWEEP_INTERVAL))
        .context("retention period out of range")?;
    let pruned = state.tracker().prune_finished(tracker_retention).await;

    if removed > 0 || pruned > 0 {
        info!(removed, pruned, "retention sweep completed");
    }
    Ok(())
}

/// Remove direct children of `root` last modified more than `retention` ago.
async fn sweep_directory(root: &Path, retention: Duration) -> Result<usize> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to list {}", root.display()));
        }
    };

    let now = SystemTime::now();
    let mut removed = 0_usize;

    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed to read {}", root.display()))?
    {
        let modified = match entry.metadata().await.and_then(|meta| meta.modified()) {
            Ok(modified) => modified,
            Err(err) => {
                warn!(?err, path = %entry.path().display(), "failed to stat entry");
                continue;
            }
        };
        let age = now.duration_since(modified).unwrap_or_default();
        if age >= retention && remove_path(&entry.path()).await {
            removed += 1;
        }
    }

    Ok(removed)
}

async fn remove_path(path: &Path) -> bool {
    let result = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(()) => true,
        Err(err) if err.kind() == ErrorKind::NotFound => true,
        Err(err) => {
            warn!(?err, path = %path.display(), "failed to remove temporary file");
            false
        }
    }
}
