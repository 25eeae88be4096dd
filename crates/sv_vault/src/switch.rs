//! Orchestration of account-switch operations.
//!
//! The host exposes one active session shared across all identities,
//! so every operation that reads or writes it happens under the single
//! switch-lock. Lock conflicts are returned immediately rather than
//! queued; a queued switch could apply state the user no longer wants.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use sv_core::{err, file_utils, info, pt, IoError};
use tokio::sync::Mutex;

use crate::account::{Account, AccountParseError, AccountStore};
use crate::backup::{self, BackupError};
use crate::bridge::{BridgeError, HostStateBridge};
use crate::session::{ModelMap, SessionApi, SessionError, TokenRefreshCoordinator};

#[derive(Debug, thiserror::Error)]
pub enum SwitchError {
    #[error("no account found for {0}")]
    NotFound(String),

    /// The switch-lock is held by another operation. Safe to retry.
    #[error("another switch operation is in progress")]
    Conflict,

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Account(#[from] AccountParseError),

    #[error(transparent)]
    Io(#[from] IoError),
}

/// Where the controller currently is in a switch operation.
///
/// `Failed` is terminal for that invocation; the next operation starts
/// over from `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SwitchState {
    #[default]
    Idle,
    Capturing,
    Persisted,
    Restoring,
    Validating,
    Failed,
}

/// A per-identity capture file on disk.
#[derive(Debug, Clone)]
pub struct CaptureEntry {
    pub identity: String,
    pub path: PathBuf,
}

/// Owns the switch-lock, the account registry and the capture
/// directory; everything the UI calls goes through here.
pub struct SwitchController {
    switch_lock: Mutex<()>,
    state: StdMutex<SwitchState>,
    store: StdMutex<AccountStore>,
    refresher: TokenRefreshCoordinator,
    bridge: Arc<dyn HostStateBridge>,
    captures_dir: PathBuf,
}

impl SwitchController {
    pub fn new(
        bridge: Arc<dyn HostStateBridge>,
        api: Arc<dyn SessionApi>,
        captures_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            switch_lock: Mutex::new(()),
            state: StdMutex::new(SwitchState::Idle),
            store: StdMutex::new(AccountStore::new()),
            refresher: TokenRefreshCoordinator::new(api),
            bridge,
            captures_dir: captures_dir.into(),
        }
    }

    /// Controller keeping its capture files under the shared vault
    /// data directory.
    #[must_use]
    pub fn with_default_dir(bridge: Arc<dyn HostStateBridge>, api: Arc<dyn SessionApi>) -> Self {
        Self::new(bridge, api, sv_core::VAULT_DIR.join("captures"))
    }

    #[must_use]
    pub fn captures_dir(&self) -> &Path {
        &self.captures_dir
    }

    fn set_state(&self, state: SwitchState) {
        *self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = state;
    }

    #[must_use]
    pub fn state(&self) -> SwitchState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_store<T>(&self, f: impl FnOnce(&mut AccountStore) -> T) -> T {
        f(&mut self.store.lock().unwrap_or_else(PoisonError::into_inner))
    }

    #[must_use]
    pub fn accounts(&self) -> Vec<Account> {
        self.with_store(|store| store.list())
    }

    #[must_use]
    pub fn account(&self, email: &str) -> Option<Account> {
        self.with_store(|store| store.get(email))
    }

    pub fn remove_account(&self, email: &str) -> Option<Account> {
        self.with_store(|store| store.remove(email))
    }

    /// Cached model listing from the identity's last valid session.
    #[must_use]
    pub fn models_for(&self, email: &str) -> Option<ModelMap> {
        self.refresher.models_for(email)
    }

    fn capture_path(&self, email: &str) -> PathBuf {
        self.captures_dir
            .join(format!("{}.json", sanitize_file_stem(email)))
    }

    /// Snapshot the host's current session as `email`'s account.
    ///
    /// The capture file on disk is plaintext raw state; encryption is
    /// opt-in via [`Self::export`].
    pub async fn capture(&self, email: &str) -> Result<Account, SwitchError> {
        let Ok(_guard) = self.switch_lock.try_lock() else {
            return Err(SwitchError::Conflict);
        };
        let result = self.capture_locked(email).await;
        self.set_state(if result.is_ok() {
            SwitchState::Idle
        } else {
            SwitchState::Failed
        });
        result
    }

    async fn capture_locked(&self, email: &str) -> Result<Account, SwitchError> {
        self.set_state(SwitchState::Capturing);
        info!("Capturing host session for {email}");

        let raw_state = self.bridge.read_state().await?;
        let account = Account::from_raw_state(email, raw_state)?;

        // Registry only learns about the account once its capture file
        // is committed; a failed write leaves no half-captured entry.
        let path = self.capture_path(email);
        file_utils::write_atomic(&path, &account.raw_state).await?;
        self.set_state(SwitchState::Persisted);
        pt!("Captured {} bytes to {path:?}", account.raw_state.len());

        self.with_store(|store| store.put(account.clone()));
        Ok(account)
    }

    /// Make `email`'s session valid and write it into the host.
    ///
    /// `active_identity` is the identity the host is currently signed
    /// in as; refreshing that one is skipped (see
    /// [`TokenRefreshCoordinator::ensure_valid_session`]).
    pub async fn restore(
        &self,
        email: &str,
        active_identity: Option<&str>,
    ) -> Result<(), SwitchError> {
        let Ok(_guard) = self.switch_lock.try_lock() else {
            return Err(SwitchError::Conflict);
        };
        let result = self.restore_locked(email, active_identity).await;
        self.set_state(if result.is_ok() {
            SwitchState::Idle
        } else {
            SwitchState::Failed
        });
        result
    }

    async fn restore_locked(
        &self,
        email: &str,
        active_identity: Option<&str>,
    ) -> Result<(), SwitchError> {
        self.set_state(SwitchState::Restoring);
        info!("Restoring host session for {email}");

        let account = self
            .account(email)
            .ok_or_else(|| SwitchError::NotFound(email.to_owned()))?;

        self.set_state(SwitchState::Validating);
        let account = self
            .refresher
            .ensure_valid_session(account, active_identity)
            .await?;
        self.with_store(|store| store.put(account.clone()));

        self.bridge.write_state(&account.raw_state).await?;
        pt!("Host session now belongs to {email}");
        Ok(())
    }

    /// Refresh `email`'s session in the background without touching
    /// host state; no switch-lock involved.
    pub async fn ensure_valid_session(
        &self,
        email: &str,
        active_identity: Option<&str>,
    ) -> Result<Account, SwitchError> {
        let account = self
            .account(email)
            .ok_or_else(|| SwitchError::NotFound(email.to_owned()))?;
        let account = self
            .refresher
            .ensure_valid_session(account, active_identity)
            .await?;
        self.with_store(|store| store.put(account.clone()));
        Ok(account)
    }

    /// Write a password-protected backup of `email`'s raw state.
    pub async fn export(
        &self,
        email: &str,
        password: &str,
        path: impl AsRef<Path>,
    ) -> Result<(), SwitchError> {
        let account = self
            .account(email)
            .ok_or_else(|| SwitchError::NotFound(email.to_owned()))?;

        let envelope = backup::encode(&account.raw_state, password)?;
        file_utils::write_atomic(path.as_ref(), envelope.to_json()?.as_bytes()).await?;
        info!("Exported sealed backup for {email}");
        Ok(())
    }

    /// Import a backup file (sealed or legacy) and register the
    /// account. A decode failure registers nothing.
    pub async fn import(
        &self,
        path: impl AsRef<Path>,
        password: &str,
    ) -> Result<Account, SwitchError> {
        let text = file_utils::read_to_string(path.as_ref()).await?;
        self.import_text(&text, password)
    }

    pub fn import_text(&self, text: &str, password: &str) -> Result<Account, SwitchError> {
        let raw_state = backup::decode(text, password)?;
        let account = Account::from_imported_state(raw_state)?;
        info!("Imported backup for {}", account.email);
        self.with_store(|store| store.put(account.clone()));
        Ok(account)
    }

    /// Enumerate per-identity capture files, skipping anything
    /// unreadable or corrupt with a warning.
    pub async fn list_captures(&self) -> Result<Vec<CaptureEntry>, SwitchError> {
        use sv_core::IntoIoError;

        let mut entries = Vec::new();
        if !self.captures_dir.exists() {
            return Ok(entries);
        }

        let mut dir = tokio::fs::read_dir(&self.captures_dir)
            .await
            .path(&self.captures_dir)?;
        while let Some(entry) = dir.next_entry().await.path(&self.captures_dir)? {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }
            let Some(identity) = path.file_stem().and_then(|n| n.to_str()) else {
                continue;
            };

            match tokio::fs::read(&path).await {
                Ok(bytes) if serde_json::from_slice::<serde_json::Value>(&bytes).is_ok() => {
                    entries.push(CaptureEntry {
                        identity: identity.to_owned(),
                        path,
                    });
                }
                Ok(_) => {
                    err!("Skipping corrupt capture file {path:?}");
                }
                Err(error) => {
                    err!("Skipping unreadable capture file {path:?}: {error}");
                }
            }
        }
        Ok(entries)
    }

    /// Load a previously captured session back into the registry.
    pub async fn load_capture(&self, email: &str) -> Result<Account, SwitchError> {
        let path = self.capture_path(email);
        let raw_state = file_utils::read_bytes(&path).await?;
        let account = Account::from_raw_state(email, raw_state)?;
        self.with_store(|store| store.put(account.clone()));
        Ok(account)
    }

    /// Delete one identity's capture file. Returns whether it existed.
    pub async fn delete_capture(&self, email: &str) -> Result<bool, SwitchError> {
        use sv_core::IntoIoError;

        let path = self.capture_path(email);
        if !path.exists() {
            return Ok(false);
        }
        tokio::fs::remove_file(&path).await.path(&path)?;
        info!("Deleted capture for {email}");
        Ok(true)
    }

    /// Delete every capture file. Returns how many were removed.
    pub async fn clear_captures(&self) -> Result<usize, SwitchError> {
        use sv_core::IntoIoError;

        let mut deleted = 0;
        for entry in self.list_captures().await? {
            tokio::fs::remove_file(&entry.path).await.path(&entry.path)?;
            deleted += 1;
        }
        info!("Cleared {deleted} capture files");
        Ok(deleted)
    }
}

/// Identities become file stems; anything outside a safe set is
/// replaced so emails can't traverse directories.
fn sanitize_file_stem(identity: &str) -> String {
    identity
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '@') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
