//! Account Monitor (SPEC_FULL.md §4.7): one task per configured account
//! that resolves credentials, opens both connection pools, builds the
//! folder catalog, and supervises one Folder Sync Engine per syncable
//! folder in a `JoinSet` so a single folder's fatal error doesn't take
//! down its siblings.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::config::{AccountConfig, AuthMethod, Provider};
use crate::constants::FOLDER_POLL_INTERVAL_SECS;
use crate::credentials::{
    CachingCredentialProvider, CredentialProvider, OAuth2Config, OAuth2TokenProvider, StaticPasswordProvider,
};
use crate::error::Result;
use crate::mail::catalog::{build_catalog, sync_folders};
use crate::mail::crispin::{GenericCrispinClient, GmailCrispinClient, Mailbox};
use crate::mail::engine::FolderSyncEngine;
use crate::mail::imap::pool::{ConnectionPool, PoolKind, PooledConnection};
use crate::mail::types::AccountSyncState;
use crate::store::MessageStore;

fn build_credential_provider(config: &AccountConfig) -> Arc<dyn CredentialProvider> {
    match &config.auth {
        AuthMethod::Password { password } => {
            Arc::new(CachingCredentialProvider::new(StaticPasswordProvider::new(password.clone())))
                as Arc<dyn CredentialProvider>
        }
        AuthMethod::OAuth2 { client_id, client_secret, refresh_token, token_url } => {
            let token_url = token_url.clone().unwrap_or_else(OAuth2TokenProvider::google_token_url);
            Arc::new(CachingCredentialProvider::new(OAuth2TokenProvider::new(OAuth2Config {
                account_id: config.id.clone(),
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
                refresh_token: refresh_token.clone(),
                token_url,
            }))) as Arc<dyn CredentialProvider>
        }
    }
}

async fn build_mailbox(provider: Provider, account_id: String, conn: PooledConnection) -> Result<Box<dyn Mailbox>> {
    let mailbox: Box<dyn Mailbox> = match provider {
        Provider::Gmail => Box::new(GmailCrispinClient::new(account_id, conn).await?),
        Provider::Generic => Box::new(GenericCrispinClient::new(account_id, conn, true).await?),
    };
    Ok(mailbox)
}

/// Owns the lifecycle of one account: its pools, its folder catalog, and
/// the set of Folder Sync Engine tasks syncing it.
pub struct AccountMonitor {
    config: AccountConfig,
    store: Arc<dyn MessageStore>,
}

impl AccountMonitor {
    pub fn new(config: AccountConfig, store: Arc<dyn MessageStore>) -> Self {
        Self { config, store }
    }

    pub fn account_id(&self) -> &str {
        &self.config.id
    }

    /// Runs until every folder engine has stopped, which happens either
    /// because `shutdown` was triggered or because an account-fatal error
    /// (bad credentials, revoked OAuth2 grant) suspended the account.
    pub async fn run(&self, shutdown: Arc<Notify>) -> Result<()> {
        let span = tracing::info_span!("account_monitor", account_id = %self.config.id);
        self.run_inner(shutdown).instrument(span).await
    }

    async fn run_inner(&self, shutdown: Arc<Notify>) -> Result<()> {
        let credentials = build_credential_provider(&self.config);
        let readonly_pool = ConnectionPool::new(
            self.config.id.clone(),
            PoolKind::Readonly,
            self.config.imap.clone(),
            self.config.email.clone(),
            credentials.clone(),
            self.config.throttled,
        );
        // Provisioned per spec.md §4.3's two-pool requirement for
        // operator-initiated mutations (set_starred, set_unread,
        // draft/sent deletion); the Folder Sync Engine loop itself only
        // ever reads, so it's held here rather than handed to an engine.
        let _writable_pool = ConnectionPool::new(
            self.config.id.clone(),
            PoolKind::Writable,
            self.config.imap.clone(),
            self.config.email.clone(),
            credentials.clone(),
            self.config.throttled,
        );

        let raw_folders = {
            let conn = readonly_pool.acquire().await?;
            let mut mailbox = build_mailbox(self.config.provider, self.config.id.clone(), conn).await?;
            mailbox.list_folders().await?
        };

        let catalog = build_catalog(raw_folders, self.config.provider);
        for entry in &catalog {
            self.store.set_folder_role(&self.config.id, &entry.name, entry.role).await?;
        }

        let order = match sync_folders(&catalog, self.config.provider) {
            Ok(order) => order,
            Err(e) => {
                tracing::error!(error = %e, "folder catalog rejected account configuration");
                self.store.set_account_sync_state(&self.config.id, AccountSyncState::Invalid).await?;
                return Err(e);
            }
        };

        let excluded: HashSet<&str> = self.config.excluded_folders.iter().map(|s| s.as_str()).collect();
        let slow_refresh_interval = chrono::Duration::seconds(self.config.slow_refresh_interval_secs as i64);

        let mut tasks: JoinSet<(String, Result<()>)> = JoinSet::new();
        for folder_name in order.into_iter().filter(|f| !excluded.contains(f.as_str())) {
            let engine = Arc::new(FolderSyncEngine::new(
                self.config.id.clone(),
                folder_name.clone(),
                self.config.provider,
                readonly_pool.clone(),
                Duration::from_secs(FOLDER_POLL_INTERVAL_SECS),
                slow_refresh_interval,
            ));
            let store = self.store.clone();
            let shutdown = shutdown.clone();
            let name = folder_name.clone();
            tasks.spawn(async move {
                let result = engine.run(store.as_ref(), &shutdown).await;
                (name, result)
            });
        }

        loop {
            tokio::select! {
                res = tasks.join_next(), if !tasks.is_empty() => {
                    match res {
                        None => {}
                        Some(Ok((folder, Ok(())))) => {
                            tracing::info!(%folder, "folder sync engine stopped");
                        }
                        Some(Ok((folder, Err(e)))) if e.is_account_fatal() => {
                            tracing::error!(%folder, error = %e, "account-fatal error; suspending account");
                            self.store.set_account_sync_state(&self.config.id, AccountSyncState::Invalid).await?;
                            shutdown.notify_waiters();
                        }
                        Some(Ok((folder, Err(e)))) => {
                            tracing::error!(%folder, error = %e, "folder sync engine failed");
                        }
                        Some(Err(join_err)) => {
                            tracing::error!(error = %join_err, "folder sync task panicked");
                        }
                    }
                }
                _ = shutdown.notified() => {
                    tracing::info!("shutdown requested, waiting for folder engines to drain");
                }
            }

            if tasks.is_empty() {
                break;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImapEndpoint;

    fn sample_config() -> AccountConfig {
        AccountConfig {
            id: "acct".into(),
            email: "user@example.com".into(),
            provider: Provider::Generic,
            imap: ImapEndpoint { host: "imap.example.com".into(), port: 993, implicit_tls: true },
            auth: AuthMethod::Password { password: Some("hunter2".into()) },
            excluded_folders: vec!["Spam".into()],
            throttled: false,
            slow_refresh_interval_secs: 3600,
        }
    }

    #[test]
    fn password_auth_builds_a_credential_provider() {
        let provider = build_credential_provider(&sample_config());
        let _ = provider;
    }

    #[tokio::test]
    async fn oauth2_auth_builds_a_credential_provider() {
        let mut config = sample_config();
        config.auth = AuthMethod::OAuth2 {
            client_id: "id".into(),
            client_secret: "secret".into(),
            refresh_token: "refresh".into(),
            token_url: None,
        };
        let provider = build_credential_provider(&config);
        let _ = provider;
    }
}
