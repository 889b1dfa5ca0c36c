//! Account Registry (SPEC_FULL.md §2/§9): the binary's top-level handle
//! on every configured account. One `AccountMonitor` per account, all
//! sharing a single `tokio::sync::Notify` broadcast so `shutdown()` drains
//! every account in one call, mirroring the actor-handle/shutdown idiom
//! the teacher application uses for its IMAP actor.

use std::sync::Arc;

use tokio::task::JoinSet;

use crate::config::Config;
use crate::error::Result;
use crate::mail::monitor::AccountMonitor;
use crate::store::MessageStore;

/// Owns one `AccountMonitor` per configured account and the shared
/// shutdown signal all of them select on.
pub struct AccountRegistry {
    monitors: Vec<Arc<AccountMonitor>>,
    shutdown: Arc<tokio::sync::Notify>,
}

impl AccountRegistry {
    pub fn new(config: Config, store: Arc<dyn MessageStore>) -> Self {
        let monitors = config
            .accounts
            .into_iter()
            .map(|account| Arc::new(AccountMonitor::new(account, store.clone())))
            .collect();
        Self {
            monitors,
            shutdown: Arc::new(tokio::sync::Notify::new()),
        }
    }

    /// Spawns every account's monitor and waits for all of them to stop,
    /// which happens once `shutdown()` is called or every monitor has
    /// suspended its account on a fatal error.
    pub async fn run(&self) -> Result<()> {
        let mut tasks: JoinSet<(String, Result<()>)> = JoinSet::new();
        for monitor in &self.monitors {
            let monitor = monitor.clone();
            let shutdown = self.shutdown.clone();
            tasks.spawn(async move {
                let account_id = monitor.account_id().to_string();
                let result = monitor.run(shutdown).await;
                (account_id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((account_id, Ok(()))) => {
                    tracing::info!(%account_id, "account monitor stopped");
                }
                Ok((account_id, Err(e))) => {
                    tracing::error!(%account_id, error = %e, "account monitor exited with an error");
                }
                Err(join_err) => {
                    tracing::error!(error = %join_err, "account monitor task panicked");
                }
            }
        }

        Ok(())
    }

    /// Broadcasts shutdown to every account monitor; `run()` returns once
    /// they've all drained their in-flight folder syncs.
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccountConfig, AuthMethod, ImapEndpoint, Provider};
    use crate::store::InMemoryMessageStore;

    fn sample_config() -> Config {
        Config {
            accounts: vec![AccountConfig {
                id: "acct".into(),
                email: "user@example.com".into(),
                provider: Provider::Generic,
                imap: ImapEndpoint { host: "imap.example.com".into(), port: 993, implicit_tls: true },
                auth: AuthMethod::Password { password: Some("hunter2".into()) },
                excluded_folders: vec![],
                throttled: false,
                slow_refresh_interval_secs: 3600,
            }],
            log_level: None,
        }
    }

    #[test]
    fn builds_one_monitor_per_configured_account() {
        let store: Arc<dyn MessageStore> = Arc::new(InMemoryMessageStore::new());
        let registry = AccountRegistry::new(sample_config(), store);
        assert_eq!(registry.monitors.len(), 1);
    }
}
