//! Temp-file-then-rename writes shared by the snapshot store and the page archive.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Write `bytes` to a fresh hidden temp file in `dir` and sync it to disk.
/// Nothing is left behind on failure.
pub(crate) async fn stage(dir: &Path, bytes: &[u8]) -> io::Result<PathBuf> {
    let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
    match write_synced(&temp_path, bytes).await {
        Ok(()) => Ok(temp_path),
        Err(err) => {
            discard(&temp_path).await;
            Err(err)
        }
    }
}

/// Move a staged file onto `target`. The staged file is removed if the rename fails.
pub(crate) async fn commit(staged: &Path, target: &Path) -> io::Result<()> {
    if let Err(err) = fs::rename(staged, target).await {
        discard(staged).await;
        return Err(err);
    }
    Ok(())
}

pub(crate) async fn discard(path: &Path) {
    let _ = fs::remove_file(path).await;
}

async fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}
