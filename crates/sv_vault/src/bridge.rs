//! Seam to the host application's local session store.
//!
//! The host exposes exactly one active session at a time; everything
//! above this trait assumes `write_state` replaces it atomically.

use std::path::PathBuf;

use async_trait::async_trait;
use sv_core::{file_utils, IoError};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Io(#[from] IoError),

    #[error("host state bridge: {0}")]
    Other(String),
}

#[async_trait]
pub trait HostStateBridge: Send + Sync {
    /// Read the host's current serialized session, byte-for-byte.
    async fn read_state(&self) -> Result<Vec<u8>, BridgeError>;

    /// Replace the host's session. Must be atomic: a crashed write
    /// leaves the previous session intact.
    async fn write_state(&self, bytes: &[u8]) -> Result<(), BridgeError>;
}

/// Bridge for hosts that keep their session in a single file.
pub struct FileStateBridge {
    path: PathBuf,
}

impl FileStateBridge {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl HostStateBridge for FileStateBridge {
    async fn read_state(&self) -> Result<Vec<u8>, BridgeError> {
        Ok(file_utils::read_bytes(&self.path).await?)
    }

    async fn write_state(&self, bytes: &[u8]) -> Result<(), BridgeError> {
        Ok(file_utils::write_atomic(&self.path, bytes).await?)
    }
}
