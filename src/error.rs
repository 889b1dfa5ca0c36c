//! Unified error taxonomy for the sync core.
//!
//! Every leaf I/O failure eventually gets classified into one of these
//! variants so callers (the Folder Sync Engine, the Account Monitor) can
//! decide retry/abort/surface-to-operator behavior without string matching.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport-level failure: DNS, TCP, TLS handshake, read/write timeout.
    #[error("network error talking to {server}: {source}")]
    Network {
        server: String,
        #[source]
        source: std::io::Error,
    },

    /// The connection dropped mid-command in a way that makes the whole
    /// connection unusable; the caller must discard it rather than return
    /// it to the pool.
    #[error("IMAP connection aborted: {0}")]
    ImapAbort(String),

    /// The server returned a well-formed but unexpected response (BAD/NO
    /// where OK was required), or a response the parser can't make sense
    /// of. Per spec.md §4.2 the Pool discards the connection on this
    /// variant too rather than assuming the session is still healthy;
    /// some call sites pattern-match the message for a same-connection
    /// fallback (see `GenericCrispinClient::all_uids`) before the caller
    /// drops it.
    #[error("IMAP protocol error: {0}")]
    ImapProtocol(String),

    /// Plain-TCP connect succeeded but the server never advertised
    /// `STARTTLS` and the endpoint isn't configured for implicit TLS.
    /// Retrying won't change what the server advertises.
    #[error("server {0} does not support STARTTLS and no implicit-TLS endpoint is configured")]
    SSLNotSupported(String),

    /// SELECT/EXAMINE failed because the folder no longer exists server-side.
    #[error("folder '{0}' no longer exists")]
    FolderMissing(String),

    /// The server reported UIDVALIDITY changed since our last sync for this
    /// folder; every previously-recorded UID is now meaningless.
    #[error("UIDVALIDITY changed for folder '{0}': stored {stored}, server {server}")]
    UidInvalid {
        folder: String,
        stored: u32,
        server: u32,
    },

    /// Username/password rejected, or an OAuth2 token rejected outright.
    #[error("invalid credentials for account {0}")]
    InvalidCredentials(String),

    /// The provider requires an app-specific password (Gmail with 2FA and
    /// no OAuth2 configured, for example).
    #[error("account {0} requires an app-specific password")]
    AppPasswordRequired(String),

    /// OAuth2 refresh token was revoked or expired; re-authorization is
    /// required and retrying will never succeed.
    #[error("OAuth2 refresh failed permanently for account {0}: {reason}", reason = .1)]
    OAuthInvalidGrant(String, String),

    /// OAuth2 token endpoint returned a transient failure (network error,
    /// 5xx, rate limiting); retrying later may succeed.
    #[error("OAuth2 refresh failed transiently for account {0}: {reason}", reason = .1)]
    OAuthTransient(String, String),

    /// Gmail-specific account configuration is missing a required setting
    /// (most commonly: IMAP access is disabled, or the "All Mail" folder
    /// is not visible to this account).
    #[error("Gmail account {0} is missing a required setting: {1}")]
    GmailSettingError(String, String),

    /// A draft was deleted/replaced by the client between our read of its
    /// Gmail message-id and our delete attempt; the delete was aborted
    /// rather than risk deleting the wrong message.
    #[error("draft deletion conflict for account {0}, uid {1}")]
    DraftDeletionConflict(String, u32),

    /// A connection pool `acquire()` call did not get a permit within its
    /// deadline.
    #[error("timed out waiting for a pooled connection (account {0}, readonly={1})")]
    PoolTimeout(String, bool),

    /// Local persistence failure (SQLite I/O, constraint violation, etc.).
    #[error("store error: {0}")]
    Store(String),

    /// Anything else, wrapped rather than classified. Kept small and rare;
    /// if a particular `Other` starts recurring it belongs as its own
    /// variant above.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    /// Whether retrying the same operation later has any chance of success.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Network { .. }
                | SyncError::ImapAbort(_)
                | SyncError::OAuthTransient(_, _)
                | SyncError::PoolTimeout(_, _)
        )
    }

    /// Whether the failure means the whole account needs operator
    /// attention (bad credentials, revoked grant) rather than just a retry
    /// or a single folder's resync.
    pub fn is_account_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidCredentials(_)
                | SyncError::AppPasswordRequired(_)
                | SyncError::OAuthInvalidGrant(_, _)
                | SyncError::SSLNotSupported(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
