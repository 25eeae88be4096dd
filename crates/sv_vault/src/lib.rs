//! # Credential vault for multi-account host switching
//!
//! Lets a user hold several authenticated identities for a single host
//! application and switch between them without re-authenticating, by
//! capturing and restoring the host's local session state per identity.
//!
//! The moving parts, leaves first:
//! - [`backup`] — encrypts/decrypts a raw session blob into a portable,
//!   versioned envelope (plus read-only legacy-format support)
//! - [`account`] — the account model and the in-memory registry
//! - [`session`] — decides whether a session is usable and performs at
//!   most one OAuth refresh if not, without racing the host's own
//!   refresh
//! - [`switch`] — serializes capture/restore against the single shared
//!   host session, with crash-safe on-disk artifacts
//! - [`bridge`] — the seam to the host's local session store
//!
//! Nothing in here is fatal to the process; every failure is scoped to
//! the single operation that hit it.

pub mod account;
pub mod backup;
pub mod bridge;
pub mod session;
pub mod switch;

pub use account::{Account, AccountParseError, AccountStore, AuthTokens, TokenState};
pub use backup::{BackupEnvelope, BackupError, SealedEnvelope};
pub use bridge::{BridgeError, FileStateBridge, HostStateBridge};
pub use session::{
    ModelMap, RestSessionApi, SessionApi, SessionError, SessionInfo, TokenGrant,
    TokenRefreshCoordinator,
};
pub use switch::{CaptureEntry, SwitchController, SwitchError, SwitchState};
