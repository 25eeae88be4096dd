//! # Shared plumbing for SwitchVault
//!
//! This crate contains the pieces every other crate leans on:
//! - Logging macros ([`info!`], [`pt!`], [`err!`]) with automatic
//!   redaction of tokens, emails and home directories
//! - IO/JSON errors that carry their context ([`IoError`], [`JsonError`])
//! - Async file helpers, including crash-safe atomic writes
//! - A shared HTTP client ([`struct@CLIENT`])
//!
//! **Not recommended to use in your own projects!**

use std::path::PathBuf;
use std::sync::LazyLock;

pub mod error;
pub mod file_utils;
pub mod print;

pub use error::{IntoIoError, IntoJsonError, IoError, JsonError};

/// Shared HTTP client for all network operations.
///
/// Building a `reqwest::Client` is expensive (TLS setup), so one
/// instance is reused everywhere.
pub static CLIENT: LazyLock<reqwest::Client> = LazyLock::new(reqwest::Client::new);

/// Directory where SwitchVault keeps its data
/// (per-identity capture files, logs).
///
/// Lives in the platform data dir, falling back to the
/// current directory if that can't be found.
pub static VAULT_DIR: LazyLock<PathBuf> = LazyLock::new(|| {
    dirs::data_dir()
        .map_or_else(|| PathBuf::from("."), |n| n.join("SwitchVault"))
});
