//! Password-based credential provider, backed by the OS keyring where
//! available. Grounded on the teacher's `keyring` dependency, trimmed down
//! to the single responsibility the Credential Provider contract needs:
//! hand back a usable secret on demand.

use super::{Credential, CredentialProvider};
use crate::error::{Result, SyncError};
use async_trait::async_trait;

const SERVICE_NAME: &str = "imap-sync-core";

pub struct StaticPasswordProvider {
    /// Fallback used when no keyring entry exists yet (e.g. the password
    /// was supplied directly in account config rather than provisioned
    /// via the OS keyring).
    fallback: Option<String>,
}

impl StaticPasswordProvider {
    pub fn new(fallback: Option<String>) -> Self {
        Self { fallback }
    }

    fn read_keyring(&self, account_id: &str) -> Option<String> {
        let entry = keyring::Entry::new(SERVICE_NAME, account_id).ok()?;
        entry.get_password().ok()
    }
}

#[async_trait]
impl CredentialProvider for StaticPasswordProvider {
    async fn get_token(&self, account_id: &str, _force_refresh: bool) -> Result<Credential> {
        if let Some(password) = self.read_keyring(account_id) {
            return Ok(Credential::Password(password));
        }
        if let Some(password) = &self.fallback {
            return Ok(Credential::Password(password.clone()));
        }
        Err(SyncError::InvalidCredentials(account_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn falls_back_to_configured_password_when_no_keyring_entry() {
        let provider = StaticPasswordProvider::new(Some("hunter2".to_string()));
        let cred = provider
            .get_token("nonexistent-account@example.com", false)
            .await
            .unwrap();
        match cred {
            Credential::Password(p) => assert_eq!(p, "hunter2"),
            _ => panic!("expected password credential"),
        }
    }

    #[tokio::test]
    async fn errors_when_no_secret_available() {
        let provider = StaticPasswordProvider::new(None);
        let err = provider
            .get_token("nonexistent-account@example.com", false)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidCredentials(_)));
    }
}
