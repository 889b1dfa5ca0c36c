//! Per-account IMAP connection pool.
//!
//! Grounded on `crispin.py`'s `CrispinConnectionPool`: a counting
//! semaphore bounds how many connections may be in flight, and a FIFO
//! queue of idle, already-authenticated sessions is drained before a new
//! connection is dialed. The teacher's own `mail/imap/pool.rs` is a bare
//! `Vec<ImapClient>` behind a `Mutex` with no fairness guarantee or
//! readonly/writable distinction; this keeps its general shape (an
//! `Arc`-shared pool object with borrow/return methods) while swapping in
//! `tokio::sync::Semaphore` for the fairness and timeout behavior the
//! spec requires.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};

use super::transport::{self, ImapSession};
use crate::config::ImapEndpoint;
use crate::constants::{
    DEFAULT_READONLY_POOL_SIZE, DEFAULT_WRITABLE_POOL_SIZE, POOL_ACQUIRE_TIMEOUT_SECS,
    THROTTLED_POOL_SIZE,
};
use crate::credentials::{Credential, CredentialProvider};
use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// Sized for fan-out read operations (SELECT-as-EXAMINE, FETCH,
    /// SEARCH, IDLE).
    Readonly,
    /// Sized to 1: STORE/EXPUNGE/APPEND/COPY against a selected mailbox
    /// must not race with another writer against the same mailbox.
    Writable,
}

struct Idle {
    session: ImapSession,
    /// Folder currently SELECTed/EXAMINEd on this session, if any, so the
    /// caller can skip a redundant re-select.
    selected_folder: Option<String>,
    /// Raw greeting line captured at dial time, so callers can sniff the
    /// server implementation (e.g. the SmarterMail CONDSTORE quirk)
    /// without a round trip.
    banner: String,
}

struct Inner {
    idle: Mutex<VecDeque<Idle>>,
    semaphore: Arc<Semaphore>,
}

/// A pool of connections for one (account, readonly|writable) pair.
/// Cheaply cloneable; every clone shares the same semaphore and idle
/// queue.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<Inner>,
    account_id: String,
    kind: PoolKind,
    endpoint: ImapEndpoint,
    username: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl ConnectionPool {
    pub fn new(
        account_id: String,
        kind: PoolKind,
        endpoint: ImapEndpoint,
        username: String,
        credentials: Arc<dyn CredentialProvider>,
        throttled: bool,
    ) -> Self {
        let size = match (kind, throttled) {
            (_, true) => THROTTLED_POOL_SIZE,
            (PoolKind::Readonly, false) => DEFAULT_READONLY_POOL_SIZE,
            (PoolKind::Writable, false) => DEFAULT_WRITABLE_POOL_SIZE,
        };

        Self {
            inner: Arc::new(Inner {
                idle: Mutex::new(VecDeque::with_capacity(size)),
                semaphore: Arc::new(Semaphore::new(size)),
            }),
            account_id,
            kind,
            endpoint,
            username,
            credentials,
        }
    }

    /// Acquire a connection, waiting (FIFO, via the semaphore's own
    /// fairness) up to `POOL_ACQUIRE_TIMEOUT_SECS` for a permit. Reuses
    /// an idle authenticated session if one is queued, otherwise dials a
    /// fresh connection.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let permit = tokio::time::timeout(
            Duration::from_secs(POOL_ACQUIRE_TIMEOUT_SECS),
            self.inner.semaphore.clone().acquire_owned(),
        )
        .await
        .map_err(|_| SyncError::PoolTimeout(self.account_id.clone(), self.kind == PoolKind::Readonly))?
        .map_err(|_| SyncError::ImapAbort("connection pool semaphore closed".into()))?;

        let idle = {
            let mut queue = self.inner.idle.lock().await;
            queue.pop_front()
        };

        let (session, selected_folder, banner) = match idle {
            Some(Idle { session, selected_folder, banner }) => (session, selected_folder, banner),
            None => {
                let credential = self.fetch_credential(false).await?;
                let connected = self.dial(&credential).await?;
                (connected.session, None, connected.banner)
            }
        };

        Ok(PooledConnection {
            pool: self.clone(),
            session: Some(session),
            selected_folder,
            banner,
            _permit: permit,
            discard: false,
        })
    }

    async fn fetch_credential(&self, force_refresh: bool) -> Result<Credential> {
        self.credentials
            .get_token(&self.account_id, force_refresh)
            .await
    }

    async fn dial(&self, credential: &Credential) -> Result<transport::Connected> {
        match transport::connect(&self.endpoint, &self.username, credential).await {
            Ok(connected) => Ok(connected),
            Err(SyncError::InvalidCredentials(_)) => {
                // One retry with a forced-refresh credential: the cached
                // token may simply have rotated underneath us.
                let fresh = self.fetch_credential(true).await?;
                transport::connect(&self.endpoint, &self.username, &fresh).await
            }
            Err(e) => Err(e),
        }
    }

    async fn release(&self, session: ImapSession, selected_folder: Option<String>, banner: String) {
        let mut queue = self.inner.idle.lock().await;
        queue.push_back(Idle {
            session,
            selected_folder,
            banner,
        });
    }
}

/// A borrowed connection. Dropping it without calling [`discard`] returns
/// the session to the pool's idle queue; `discard` is for the caller to
/// signal the connection is no longer usable (e.g. after an `ImapAbort` or
/// `ImapProtocol` error), so it isn't handed to the next waiter. Writable
/// connections are always logged out on drop and never recycled, regardless
/// of `discard` (spec.md §4.3 step 4: single-use).
pub struct PooledConnection {
    pool: ConnectionPool,
    session: Option<ImapSession>,
    selected_folder: Option<String>,
    banner: String,
    _permit: tokio::sync::OwnedSemaphorePermit,
    discard: bool,
}

impl PooledConnection {
    pub fn session_mut(&mut self) -> &mut ImapSession {
        self.session.as_mut().expect("session taken from a live PooledConnection")
    }

    pub fn selected_folder(&self) -> Option<&str> {
        self.selected_folder.as_deref()
    }

    pub fn note_selected_folder(&mut self, folder: impl Into<String>) {
        self.selected_folder = Some(folder.into());
    }

    /// The raw greeting line this session's server sent at connect time.
    pub fn banner(&self) -> &str {
        &self.banner
    }

    /// Mark this connection as unusable; it will be logged out and
    /// dropped rather than recycled when this guard is dropped.
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        // Writable connections are single-use per spec.md §4.3 step 4:
        // logged out and replaced with `None` on every drop, never
        // recycled into the idle queue, regardless of `discard`.
        if self.discard || self.pool.kind == PoolKind::Writable {
            tokio::spawn(async move {
                let mut session = session;
                let _ = session.logout().await;
            });
            return;
        }
        let pool = self.pool.clone();
        let selected_folder = self.selected_folder.take();
        let banner = std::mem::take(&mut self.banner);
        tokio::spawn(async move {
            pool.release(session, selected_folder, banner).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct AlwaysFail;

    #[async_trait]
    impl CredentialProvider for AlwaysFail {
        async fn get_token(&self, account_id: &str, _force_refresh: bool) -> Result<Credential> {
            Err(SyncError::InvalidCredentials(account_id.to_string()))
        }
    }

    #[tokio::test]
    async fn acquire_surfaces_credential_errors_without_hanging() {
        let pool = ConnectionPool::new(
            "acct".into(),
            PoolKind::Readonly,
            ImapEndpoint {
                host: "127.0.0.1".into(),
                port: 1,
                implicit_tls: true,
            },
            "user@example.com".into(),
            Arc::new(AlwaysFail),
            false,
        );

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidCredentials(_)));
    }

    /// Holds the pool's one permit open for the whole test, so `acquire`
    /// blocks on the semaphore itself rather than ever reaching
    /// credentials or dialing. Paused time lets the fixed
    /// `POOL_ACQUIRE_TIMEOUT_SECS` deadline elapse instantly.
    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_when_every_permit_is_held() {
        let pool = ConnectionPool::new(
            "acct".into(),
            PoolKind::Readonly,
            ImapEndpoint {
                host: "127.0.0.1".into(),
                port: 1,
                implicit_tls: true,
            },
            "user@example.com".into(),
            Arc::new(AlwaysFail),
            true,
        );

        let _held = pool.inner.semaphore.clone().acquire_owned().await.unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, SyncError::PoolTimeout(account, readonly) if account == "acct" && readonly));
    }

    #[test]
    fn throttled_accounts_get_a_single_connection_pool_regardless_of_kind() {
        let pool = ConnectionPool::new(
            "acct".into(),
            PoolKind::Readonly,
            ImapEndpoint {
                host: "localhost".into(),
                port: 993,
                implicit_tls: true,
            },
            "user@example.com".into(),
            Arc::new(AlwaysFail),
            true,
        );
        assert_eq!(pool.inner.semaphore.available_permits(), THROTTLED_POOL_SIZE);
    }
}
