//! OAuth2 refresh-token exchange, adapted from the teacher's browser-based
//! installed-app flow: the consent/authorization-code dance is a
//! provisioning-time concern outside this crate, so only the
//! refresh-token-for-access-token HTTP exchange survives here.

use super::{classify_oauth_error, Credential, CredentialProvider};
use crate::error::Result;
use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct OAuth2Config {
    pub account_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    pub token_url: String,
}

pub struct OAuth2TokenProvider {
    config: OAuth2Config,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: String,
}

impl OAuth2TokenProvider {
    pub fn new(config: OAuth2Config) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Gmail's token endpoint, used when no override is configured.
    pub fn google_token_url() -> String {
        "https://www.googleapis.com/oauth2/v4/token".to_string()
    }
}

#[async_trait]
impl CredentialProvider for OAuth2TokenProvider {
    async fn get_token(&self, account_id: &str, _force_refresh: bool) -> Result<Credential> {
        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("refresh_token", self.config.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];

        let response = self
            .http
            .post(&self.config.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| classify_oauth_error(account_id, None, &e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| classify_oauth_error(account_id, None, &e.to_string()))?;

        if !status.is_success() {
            let (code, detail) = match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(err) => (Some(err.error), err.error_description),
                Err(_) => (None, body),
            };
            return Err(classify_oauth_error(account_id, code.as_deref(), &detail));
        }

        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| classify_oauth_error(account_id, None, &format!("malformed token response: {e}")))?;

        let expires_at = chrono::Utc::now() + chrono::Duration::seconds(parsed.expires_in);

        Ok(Credential::AccessToken {
            value: parsed.access_token,
            expires_at,
        })
    }
}

/// Builds the SASL initial response for XOAUTH2 (RFC 7628). Returned as
/// the raw (pre-base64) layout; `async-imap`'s `AUTHENTICATE` machinery
/// base64-encodes whatever `Authenticator::process` returns, the same
/// division of labor the corpus's other IMAP clients rely on.
pub fn build_xoauth2_response(user: &str, access_token: &str) -> String {
    format!("user={user}\x01auth=Bearer {access_token}\x01\x01")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xoauth2_response_matches_rfc_7628_layout() {
        let s = build_xoauth2_response("me@example.com", "tok123");
        assert_eq!(s, "user=me@example.com\x01auth=Bearer tok123\x01\x01");
    }
}
