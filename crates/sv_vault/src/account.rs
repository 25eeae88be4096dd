//! Account data model and the in-memory registry.
//!
//! `raw_state` is the host application's own serialized session. The
//! vault treats it as opaque apart from pulling out the token fields
//! and project id it needs; the host owns the format.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;
use sv_core::{IntoJsonError, JsonError};

/// Whether a token is known-good.
///
/// The upstream provider exposes no reliable TTL in this flow, so
/// expiry is never tracked by timestamp. The only transitions are call
/// outcomes: a successful session-init probe sets `Valid`; everything
/// starts out (and stays) `UnknownMaybeExpired` until proven otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenState {
    Valid,
    #[default]
    UnknownMaybeExpired,
}

#[derive(Clone)]
pub struct AuthTokens {
    pub access_token: String,
    /// Token presented to the OAuth refresh grant. Taken from the host
    /// state's `refresh_token` field, falling back to `id_token` for
    /// states that predate it.
    pub refresh_handle: String,
    pub id_token: Option<String>,
}

// Token material must never leak through Debug output.
impl fmt::Debug for AuthTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthTokens")
            .field("access_token", &preview(&self.access_token))
            .field("refresh_handle", &preview(&self.refresh_handle))
            .field("id_token", &self.id_token.as_deref().map(preview))
            .finish()
    }
}

fn preview(token: &str) -> String {
    if token.len() <= 8 {
        "<redacted>".to_owned()
    } else {
        let head: String = token.chars().take(8).collect();
        format!("{head}...")
    }
}

#[derive(Debug, Clone)]
pub struct Account {
    /// Identity key. At most one account per email in a store.
    pub email: String,
    pub auth: AuthTokens,
    pub project_id: Option<String>,
    /// The host's serialized session, byte-for-byte.
    pub raw_state: Vec<u8>,
    pub token_state: TokenState,
}

#[derive(Debug, thiserror::Error)]
pub enum AccountParseError {
    #[error(transparent)]
    Json(#[from] JsonError),

    #[error("host session state has no {0} field")]
    MissingField(&'static str),

    #[error("host session state has neither refresh_token nor id_token")]
    MissingRefreshHandle,
}

/// Look up `keys` at the top level and inside the usual nesting spots.
fn find_string(value: &Value, keys: &[&str]) -> Option<String> {
    for scope in [
        Some(value),
        value.get("auth"),
        value.get("tokens"),
        value.get("context"),
    ]
    .into_iter()
    .flatten()
    {
        for key in keys {
            if let Some(found) = scope.get(key).and_then(Value::as_str) {
                return Some(found.to_owned());
            }
        }
    }
    None
}

fn parse_state(raw_state: &[u8]) -> Result<Value, AccountParseError> {
    let text = String::from_utf8_lossy(raw_state).into_owned();
    Ok(serde_json::from_str::<Value>(&text).json(text)?)
}

impl Account {
    /// Build an account for `email` out of the host's serialized
    /// session. Only the token fields and project id are interpreted.
    pub fn from_raw_state(
        email: impl Into<String>,
        raw_state: Vec<u8>,
    ) -> Result<Self, AccountParseError> {
        let value = parse_state(&raw_state)?;

        let access_token = find_string(&value, &["access_token", "accessToken"])
            .ok_or(AccountParseError::MissingField("access_token"))?;
        let id_token = find_string(&value, &["id_token", "idToken"]);
        let refresh_handle = find_string(&value, &["refresh_token", "refreshToken"])
            .or_else(|| id_token.clone())
            .ok_or(AccountParseError::MissingRefreshHandle)?;
        let project_id = find_string(
            &value,
            &["project_id", "projectId", "cloudaicompanionProject"],
        );

        Ok(Self {
            email: email.into(),
            auth: AuthTokens {
                access_token,
                refresh_handle,
                id_token,
            },
            project_id,
            raw_state,
            token_state: TokenState::UnknownMaybeExpired,
        })
    }

    /// Build an account from an imported backup, taking the identity
    /// from the state itself.
    pub fn from_imported_state(raw_state: Vec<u8>) -> Result<Self, AccountParseError> {
        let value = parse_state(&raw_state)?;
        let email = find_string(&value, &["email", "userEmail", "user_email"])
            .ok_or(AccountParseError::MissingField("email"))?;
        Self::from_raw_state(email, raw_state)
    }

    /// Replace the access token in memory, keeping `raw_state` and
    /// `auth` mutually consistent. Nothing is written to disk; a
    /// refreshed token only survives a restart if the user explicitly
    /// captures or exports again.
    pub fn set_access_token(&mut self, token: &str) {
        self.auth.access_token = token.to_owned();

        let Ok(mut value) = parse_state(&self.raw_state) else {
            return;
        };
        patch_string(&mut value, &["access_token", "accessToken"], token);
        if let Ok(bytes) = serde_json::to_vec(&value) {
            self.raw_state = bytes;
        }
    }
}

/// Overwrite `keys` wherever they already exist in the state; never
/// invents fields the host didn't write.
fn patch_string(value: &mut Value, keys: &[&str], new: &str) {
    let Value::Object(map) = value else {
        return;
    };
    for nested in ["auth", "tokens"] {
        if let Some(inner) = map.get_mut(nested) {
            for key in keys {
                if let Some(slot) = inner.get_mut(*key) {
                    if slot.is_string() {
                        *slot = Value::String(new.to_owned());
                    }
                }
            }
        }
    }
    for key in keys {
        if let Some(slot) = map.get_mut(*key) {
            if slot.is_string() {
                *slot = Value::String(new.to_owned());
            }
        }
    }
}

/// In-memory registry of known accounts, keyed by email.
///
/// Owned by whoever orchestrates switching and passed by reference;
/// deliberately not process-wide state. No file or network I/O here.
#[derive(Debug, Default)]
pub struct AccountStore {
    accounts: HashMap<String, Account>,
}

impl AccountStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace by email.
    pub fn put(&mut self, account: Account) {
        self.accounts.insert(account.email.clone(), account);
    }

    #[must_use]
    pub fn get(&self, email: &str) -> Option<Account> {
        self.accounts.get(email).cloned()
    }

    /// Snapshot of all accounts at call time. No ordering guarantee.
    #[must_use]
    pub fn list(&self) -> Vec<Account> {
        self.accounts.values().cloned().collect()
    }

    pub fn remove(&mut self, email: &str) -> Option<Account> {
        self.accounts.remove(email)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> Vec<u8> {
        serde_json::json!({
            "email": "alice@example.com",
            "auth": {
                "access_token": "ya29.a0abcdefghijklmnop",
                "refresh_token": "1//refresh-handle-value",
                "id_token": "eyJhbGciOi.id-token-value"
            },
            "context": { "project_id": "projects/12345" },
            "window_layout": { "left": 3 }
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn parses_tokens_and_project() {
        let account = Account::from_raw_state("alice@example.com", sample_state()).unwrap();
        assert_eq!(account.auth.access_token, "ya29.a0abcdefghijklmnop");
        assert_eq!(account.auth.refresh_handle, "1//refresh-handle-value");
        assert_eq!(account.project_id.as_deref(), Some("projects/12345"));
        assert_eq!(account.token_state, TokenState::UnknownMaybeExpired);
    }

    #[test]
    fn id_token_is_fallback_refresh_handle_only() {
        let state = serde_json::json!({
            "access_token": "tok",
            "id_token": "only-id-token"
        })
        .to_string()
        .into_bytes();
        let account = Account::from_raw_state("a@b.co", state).unwrap();
        assert_eq!(account.auth.refresh_handle, "only-id-token");
    }

    #[test]
    fn missing_tokens_is_an_error() {
        let state = serde_json::json!({ "access_token": "tok" })
            .to_string()
            .into_bytes();
        assert!(matches!(
            Account::from_raw_state("a@b.co", state),
            Err(AccountParseError::MissingRefreshHandle)
        ));
    }

    #[test]
    fn imported_state_supplies_identity() {
        let account = Account::from_imported_state(sample_state()).unwrap();
        assert_eq!(account.email, "alice@example.com");
    }

    #[test]
    fn set_access_token_patches_raw_state() {
        let mut account = Account::from_raw_state("alice@example.com", sample_state()).unwrap();
        account.set_access_token("ya29.new-token-after-refresh");

        // In-memory auth and raw_state stay consistent
        let reparsed = Account::from_raw_state("alice@example.com", account.raw_state.clone())
            .unwrap();
        assert_eq!(reparsed.auth.access_token, "ya29.new-token-after-refresh");
        // Unrelated host fields untouched
        let value: Value = serde_json::from_slice(&account.raw_state).unwrap();
        assert_eq!(value["window_layout"]["left"], 3);
    }

    #[test]
    fn debug_output_redacts_tokens() {
        let account = Account::from_raw_state("alice@example.com", sample_state()).unwrap();
        let debug = format!("{:?}", account.auth);
        assert!(!debug.contains("ya29.a0abcdefghijklmnop"));
        assert!(!debug.contains("1//refresh-handle-value"));
    }

    #[test]
    fn store_is_unique_per_email() {
        let mut store = AccountStore::new();
        let account = Account::from_raw_state("alice@example.com", sample_state()).unwrap();
        store.put(account.clone());
        store.put(account);
        assert_eq!(store.len(), 1);

        assert!(store.get("alice@example.com").is_some());
        assert!(store.get("bob@example.com").is_none());

        store.remove("alice@example.com");
        assert!(store.is_empty());
    }
}
