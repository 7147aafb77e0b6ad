//! End-user credential access with de-duplicated refresh.
//!
//! Several tasks (heartbeat, poller, setup) can discover an expired user
//! token at the same moment. At most one refresh request is in flight;
//! the others await its shared result. The slot is cleared once the
//! refresh resolves so a later expiry starts a fresh one.

use std::path::PathBuf;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::{self, Credentials};
use crate::error::RelayError;

#[derive(Debug, Clone)]
enum RefreshError {
    Auth(String),
    Transient(String),
}

type RefreshFuture = Shared<BoxFuture<'static, Result<Credentials, RefreshError>>>;

/// Shared handle to the user's cloud identity.
pub struct AuthSession {
    dir: PathBuf,
    refresh_url: String,
    http: reqwest::Client,
    inflight: Mutex<Option<RefreshFuture>>,
}

impl AuthSession {
    pub fn new(dir: PathBuf, base_url: &str) -> Self {
        Self {
            dir,
            refresh_url: format!("{}/v1/auth/refresh", base_url.trim_end_matches('/')),
            http: reqwest::Client::new(),
            inflight: Mutex::new(None),
        }
    }

    /// A currently-valid end-user bearer token, refreshing if necessary.
    pub async fn user_token(&self) -> Result<String, RelayError> {
        let creds = config::load_credentials(&self.dir)
            .map_err(|e| RelayError::NotConfigured(e.to_string()))?
            .ok_or(RelayError::NotAuthenticated)?;

        if !creds.is_expired() {
            return Ok(creds.id_token);
        }

        debug!("user token expired, refreshing");
        let refreshed = self.refresh(creds.refresh_token).await?;
        Ok(refreshed.id_token)
    }

    /// Run (or join) the single in-flight refresh.
    async fn refresh(&self, refresh_token: String) -> Result<Credentials, RelayError> {
        let fut = {
            let mut slot = self.inflight.lock().await;
            match slot.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let fut = do_refresh(
                        self.http.clone(),
                        self.refresh_url.clone(),
                        self.dir.clone(),
                        refresh_token,
                    )
                    .boxed()
                    .shared();
                    *slot = Some(fut.clone());
                    fut
                }
            }
        };

        let result = fut.clone().await;

        // Clear the slot, but only if it still holds our future — a newer
        // refresh may already be underway.
        {
            let mut slot = self.inflight.lock().await;
            if slot.as_ref().is_some_and(|f| Shared::ptr_eq(f, &fut)) {
                *slot = None;
            }
        }

        result.map_err(|e| match e {
            RefreshError::Auth(_) => RelayError::NotAuthenticated,
            RefreshError::Transient(msg) => RelayError::Transient(msg),
        })
    }
}

async fn do_refresh(
    http: reqwest::Client,
    url: String,
    dir: PathBuf,
    refresh_token: String,
) -> Result<Credentials, RefreshError> {
    let resp = http
        .post(&url)
        .json(&serde_json::json!({ "refreshToken": refresh_token }))
        .send()
        .await
        .map_err(|e| RefreshError::Transient(format!("refresh request failed: {e}")))?;

    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(RefreshError::Auth(format!("refresh rejected: {status}")));
    }
    if !status.is_success() {
        return Err(RefreshError::Transient(format!("refresh failed: {status}")));
    }

    let creds: Credentials = resp
        .json()
        .await
        .map_err(|e| RefreshError::Transient(format!("bad refresh response: {e}")))?;

    // Persist so the companion CLI sees the rotated token too.
    let path = dir.join(config::CREDENTIALS_FILE);
    if let Ok(content) = serde_json::to_string_pretty(&creds) {
        if std::fs::write(&path, content).is_ok() {
            let _ = config::restrict_permissions(&path);
        }
    }

    Ok(creds)
}

/// Cheap shared wrapper so every subsystem sees the same in-flight slot.
pub type SharedAuth = Arc<AuthSession>;
