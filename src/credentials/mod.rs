//! Credential Provider: the boundary between this crate and wherever
//! account secrets actually live. The sync core never writes or encrypts
//! secrets itself — it only asks for a usable token/password on demand
//! and caches what it's handed back.

mod oauth2;
mod password;

pub use oauth2::{build_xoauth2_response, OAuth2Config, OAuth2TokenProvider};
pub use password::StaticPasswordProvider;

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Tag identifying how a secret should be presented on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretType {
    /// Plain IMAP password, used with LOGIN.
    Password,
    /// OAuth2 bearer token, used with XOAUTH2.
    Token,
    /// Secret is managed entirely outside this process (e.g. a service
    /// that performs auth on our behalf); never returned as bytes.
    External,
}

/// A credential ready to authenticate an IMAP connection.
#[derive(Clone)]
pub enum Credential {
    Password(String),
    AccessToken {
        value: String,
        expires_at: chrono::DateTime<chrono::Utc>,
    },
}

impl Credential {
    pub fn secret_type(&self) -> SecretType {
        match self {
            Credential::Password(_) => SecretType::Password,
            Credential::AccessToken { .. } => SecretType::Token,
        }
    }
}

/// Implemented by anything that can hand the sync core a usable
/// credential for an account. `force_refresh` asks the implementation to
/// discard any cached value and fetch a new one (used after the server
/// rejects the cached credential).
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_token(&self, account_id: &str, force_refresh: bool) -> Result<Credential>;
}

/// Wraps a `CredentialProvider` with an in-memory cache honoring each
/// credential's expiry minus a safety margin, so callers can invoke
/// `get_token` freely without hammering the upstream token endpoint.
pub struct CachingCredentialProvider<P: CredentialProvider> {
    inner: P,
    cached: Mutex<Option<(Credential, Instant)>>,
}

impl<P: CredentialProvider> CachingCredentialProvider<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            cached: Mutex::new(None),
        }
    }
}

#[async_trait]
impl<P: CredentialProvider> CredentialProvider for CachingCredentialProvider<P> {
    async fn get_token(&self, account_id: &str, force_refresh: bool) -> Result<Credential> {
        let mut slot = self.cached.lock().await;

        if !force_refresh
            && let Some((cred, fetched_at)) = slot.as_ref()
        {
            let still_fresh = match cred {
                Credential::Password(_) => true,
                Credential::AccessToken { expires_at, .. } => {
                    let margin = Duration::from_secs(
                        crate::constants::OAUTH_EXPIRY_SAFETY_MARGIN_SECS.max(0) as u64,
                    );
                    let now = chrono::Utc::now();
                    *expires_at > now + chrono::Duration::from_std(margin).unwrap_or_default()
                }
            };
            if still_fresh {
                let _ = fetched_at;
                return Ok(cred.clone());
            }
        }

        let fresh = self.inner.get_token(account_id, force_refresh).await?;
        *slot = Some((fresh.clone(), Instant::now()));
        Ok(fresh)
    }
}

/// Classifies a provider token-endpoint failure into the two buckets the
/// sync engine cares about: permanent (re-auth required) vs transient
/// (retry later). Grounded on the original `invalid_grant` handling in
/// the upstream Google OAuth2 auth handler.
pub fn classify_oauth_error(account_id: &str, error_code: Option<&str>, detail: &str) -> SyncError {
    match error_code {
        Some("invalid_grant") | Some("unauthorized_client") => {
            SyncError::OAuthInvalidGrant(account_id.to_string(), detail.to_string())
        }
        _ => SyncError::OAuthTransient(account_id.to_string(), detail.to_string()),
    }
}
