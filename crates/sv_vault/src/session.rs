//! Token validity probing and OAuth refresh coordination.
//!
//! Expiry is detected reactively: the session-init probe doubles as the
//! validity check and as the source of the project id. At most one
//! refresh attempt is made per call, and refreshes for the identity the
//! host is actively using are skipped entirely, because the host may be
//! refreshing the same handle itself and upstream handles can be
//! single-use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::Value;
use sv_core::{err, pt, IntoJsonError, JsonError, CLIENT};
use tokio::sync::Mutex;

use crate::account::{Account, TokenState};

const SESSION_INIT_URL: &str = "https://cloudcode-pa.googleapis.com/v1internal:loadCodeAssist";
const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const MODEL_LIST_URL: &str = "https://cloudcode-pa.googleapis.com/v1internal:fetchAvailableModels";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The endpoint rejected our credentials (401/403, `invalid_grant`,
    /// or an `{"error": …}` body).
    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] JsonError),

    /// Session is valid but carries no project id, so the dependent
    /// model lookup can't be keyed.
    #[error("session is valid but has no project id for model listing")]
    Aggregation,

    #[error("account has no refresh handle; sign in again on the host and re-capture")]
    MissingRefreshHandle,
}

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub project_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
}

/// Model id → descriptor. Descriptors stay opaque to the vault.
pub type ModelMap = HashMap<String, Value>;

/// The two REST endpoints the vault depends on, plus the dependent
/// model lookup. A trait seam so tests can count calls.
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// Lightweight probe: validates `access_token` and returns the
    /// project id on success.
    async fn init_session(&self, access_token: &str) -> Result<SessionInfo, SessionError>;

    /// RFC 6749 `refresh_token` grant.
    async fn refresh_access_token(&self, refresh_handle: &str) -> Result<TokenGrant, SessionError>;

    async fn list_models(
        &self,
        access_token: &str,
        project_id: &str,
    ) -> Result<ModelMap, SessionError>;
}

/// Production [`SessionApi`] over the shared HTTP client.
pub struct RestSessionApi {
    client_id: String,
    client_secret: Option<String>,
    ide_type: String,
}

impl RestSessionApi {
    #[must_use]
    pub fn new(client_id: impl Into<String>, client_secret: Option<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret,
            ide_type: "IDE_UNSPECIFIED".to_owned(),
        }
    }

    #[must_use]
    pub fn with_ide_type(mut self, ide_type: impl Into<String>) -> Self {
        self.ide_type = ide_type.into();
        self
    }
}

fn error_message(body: &Value) -> Option<String> {
    let error = body.get("error")?;
    Some(
        error
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| error.to_string(), str::to_owned),
    )
}

#[async_trait]
impl SessionApi for RestSessionApi {
    async fn init_session(&self, access_token: &str) -> Result<SessionInfo, SessionError> {
        let response = CLIENT
            .post(SESSION_INIT_URL)
            .bearer_auth(access_token)
            .json(&serde_json::json!({ "metadata": { "ideType": self.ide_type } }))
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        // Auth failures may carry a non-JSON body; don't let that turn
        // into a parse error.
        if status == 401 || status == 403 {
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|body| error_message(&body))
                .unwrap_or_else(|| format!("status {status}"));
            return Err(SessionError::Auth(message));
        }

        let body = serde_json::from_str::<Value>(&text).json(text)?;
        if let Some(message) = error_message(&body) {
            return Err(SessionError::Auth(message));
        }

        Ok(SessionInfo {
            project_id: body
                .get("cloudaicompanionProject")
                .and_then(Value::as_str)
                .map(str::to_owned),
        })
    }

    async fn refresh_access_token(&self, refresh_handle: &str) -> Result<TokenGrant, SessionError> {
        let mut params = vec![
            ("client_id", self.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_handle),
        ];
        if let Some(secret) = &self.client_secret {
            params.push(("client_secret", secret.as_str()));
        }

        let response = CLIENT
            .post(OAUTH_TOKEN_URL)
            .form(&params)
            .header("Accept", "application/json")
            .send()
            .await?;

        let text = response.text().await?;
        let body = serde_json::from_str::<Value>(&text).json(text)?;

        if let Some(error) = body.get("error") {
            let code = error.as_str().unwrap_or("unknown");
            let description = body
                .get("error_description")
                .and_then(Value::as_str)
                .unwrap_or(code);
            return Err(SessionError::Auth(format!("{code}: {description}")));
        }

        let access_token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| SessionError::Auth("no access_token in grant response".to_owned()))?;

        Ok(TokenGrant {
            access_token: access_token.to_owned(),
        })
    }

    async fn list_models(
        &self,
        access_token: &str,
        project_id: &str,
    ) -> Result<ModelMap, SessionError> {
        let response = CLIENT
            .post(MODEL_LIST_URL)
            .bearer_auth(access_token)
            .json(&serde_json::json!({ "project": project_id }))
            .send()
            .await?;

        let text = response.text().await?;
        let body = serde_json::from_str::<Value>(&text).json(text)?;

        if let Some(message) = error_message(&body) {
            return Err(SessionError::Auth(message));
        }

        // Some deployments nest the map under "models".
        let map = body.get("models").unwrap_or(&body);
        match map.as_object() {
            Some(object) => Ok(object
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()),
            None => Ok(ModelMap::new()),
        }
    }
}

/// Decides whether an account's session is usable and performs at most
/// one refresh attempt if not. Calls for the same identity are
/// serialized; different identities proceed in parallel.
pub struct TokenRefreshCoordinator {
    api: Arc<dyn SessionApi>,
    identity_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    model_cache: StdMutex<HashMap<String, ModelMap>>,
}

impl TokenRefreshCoordinator {
    #[must_use]
    pub fn new(api: Arc<dyn SessionApi>) -> Self {
        Self {
            api,
            identity_locks: StdMutex::new(HashMap::new()),
            model_cache: StdMutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, email: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .identity_locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        locks
            .entry(email.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Cached model listing from the account's last valid session.
    #[must_use]
    pub fn models_for(&self, email: &str) -> Option<ModelMap> {
        self.model_cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(email)
            .cloned()
    }

    /// Make `account`'s session usable, refreshing once at most.
    ///
    /// If the probe fails with an auth error while `account` is the
    /// identity the host itself is using (`active_identity`), this is a
    /// deliberate no-op: refreshing would race the host's own refresh
    /// and can invalidate a single-use handle. The account comes back
    /// unchanged, not as an error.
    pub async fn ensure_valid_session(
        &self,
        mut account: Account,
        active_identity: Option<&str>,
    ) -> Result<Account, SessionError> {
        let identity_lock = self.lock_for(&account.email);
        let _serialized = identity_lock.lock().await;

        match self.api.init_session(&account.auth.access_token).await {
            Ok(info) => {
                return self.finish_valid_session(account, info).await;
            }
            Err(SessionError::Auth(reason)) => {
                if active_identity == Some(account.email.as_str()) {
                    pt!(
                        "Session for {} rejected while active on the host; leaving it alone",
                        account.email
                    );
                    return Ok(account);
                }
                pt!("Session for {} rejected ({reason}); refreshing", account.email);
            }
            Err(other) => return Err(other),
        }

        if account.auth.refresh_handle.is_empty() {
            return Err(SessionError::MissingRefreshHandle);
        }

        // One refresh attempt, then one re-probe. No automatic retries.
        let grant = self
            .api
            .refresh_access_token(&account.auth.refresh_handle)
            .await?;
        account.set_access_token(&grant.access_token);

        let info = self.api.init_session(&account.auth.access_token).await?;
        self.finish_valid_session(account, info).await
    }

    async fn finish_valid_session(
        &self,
        mut account: Account,
        info: SessionInfo,
    ) -> Result<Account, SessionError> {
        account.token_state = TokenState::Valid;
        if info.project_id.is_some() {
            account.project_id = info.project_id;
        }

        let Some(project_id) = account.project_id.clone() else {
            return Err(SessionError::Aggregation);
        };

        // The model listing is cache enrichment; the session is valid
        // whether or not it succeeds.
        match self
            .api
            .list_models(&account.auth.access_token, &project_id)
            .await
        {
            Ok(models) => {
                self.model_cache
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .insert(account.email.clone(), models);
            }
            Err(error) => {
                err!("Model listing for {} failed: {error}", account.email);
            }
        }

        Ok(account)
    }
}
