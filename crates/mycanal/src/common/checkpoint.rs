//! Durable JSON records
//!
//! Small state files (replication coordinates) are written atomically: the
//! record goes to a sibling temp file, is fsynced, then renamed over the
//! target, so a crash leaves either the old or the new record, never a
//! truncated one.

use crate::common::{CanalError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Atomically replace `path` with the JSON encoding of `value`.
pub async fn save_json<T: Serialize>(path: &Path, value: &T, fsync: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    let json = serde_json::to_vec_pretty(value)?;
    let temp_path = path.with_extension("tmp");

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)
        .await?;
    file.write_all(&json).await?;
    if fsync {
        file.sync_all().await?;
    }
    drop(file);

    fs::rename(&temp_path, path).await?;
    debug!("Saved state file {}", path.display());
    Ok(())
}

/// Load a JSON record, returning `None` when the file does not exist.
pub async fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match fs::read(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CanalError::Io(e)),
    };
    if contents.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&contents)?))
}
