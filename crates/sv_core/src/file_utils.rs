//! Async file helpers.
//!
//! All writes that replace an existing file go through [`write_atomic`]:
//! the bytes land in a temp file in the same directory and are renamed
//! over the target, so a crash mid-write leaves the previous,
//! fully-committed file intact.

use std::path::Path;

use rand::Rng;
use tokio::fs;

use crate::{IntoIoError, IoError};

pub async fn read_bytes(path: impl AsRef<Path>) -> Result<Vec<u8>, IoError> {
    let path = path.as_ref();
    fs::read(path).await.path(path)
}

pub async fn read_to_string(path: impl AsRef<Path>) -> Result<String, IoError> {
    let path = path.as_ref();
    fs::read_to_string(path).await.path(path)
}

/// Write `bytes` to `path` crash-safely.
///
/// The rename is atomic only within one filesystem, which is why the
/// temp file must live next to the target rather than in the system
/// temp dir.
pub async fn write_atomic(path: impl AsRef<Path>, bytes: &[u8]) -> Result<(), IoError> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await.path(parent)?;
        }
    }

    let suffix: u32 = rand::thread_rng().gen();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_owned());
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp{suffix:08x}"));

    fs::write(&tmp_path, bytes).await.path(&tmp_path)?;
    if let Err(error) = fs::rename(&tmp_path, path).await {
        // Don't leave the temp file lying around on failure.
        let _ = fs::remove_file(&tmp_path).await;
        return Err(IoError {
            error,
            path: path.to_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_atomic_creates_parents_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        write_atomic(&path, b"first").await.unwrap();
        assert_eq!(read_bytes(&path).await.unwrap(), b"first");

        write_atomic(&path, b"second").await.unwrap();
        assert_eq!(read_bytes(&path).await.unwrap(), b"second");

        // No temp files left behind
        let mut entries = fs::read_dir(path.parent().unwrap()).await.unwrap();
        let mut count = 0;
        while let Some(entry) = entries.next_entry().await.unwrap() {
            assert_eq!(entry.file_name(), "state.json");
            count += 1;
        }
        assert_eq!(count, 1);
    }
}
