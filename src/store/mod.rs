//! Local persistence: the boundary between the sync engine and wherever
//! `Folder`/`ImapUid`/`Message` rows actually live. Mirrors the
//! `CredentialProvider` shape — a trait the engine is written against,
//! with a SQLite-backed implementation for production and an in-memory
//! one for tests.
//!
//! Schema/migrations are explicitly out of scope for this crate; each
//! implementation is free to lay out storage however it likes as long as
//! it round-trips the fields `spec.md` §3 and §6 name.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryMessageStore;
pub use sqlite::SqliteMessageStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::mail::types::{AccountSyncState, Flags, FolderRole, FolderSyncStatus, Message};

/// Everything the Folder Sync Engine and Account Monitor need from
/// durable storage, keyed by the caller's own `(account_id, folder_name)`
/// strings rather than the opaque integer ids in [`crate::mail::types`] —
/// those ids are an implementation detail of whichever `MessageStore` is
/// in use, not a cross-module contract.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Returns the folder's persisted sync status, creating a fresh
    /// (`Initial` phase, `uidvalidity = 0`) record on first sight.
    async fn folder_status(&self, account_id: &str, folder_name: &str) -> Result<FolderSyncStatus>;

    async fn save_folder_status(
        &self,
        account_id: &str,
        folder_name: &str,
        status: &FolderSyncStatus,
    ) -> Result<()>;

    async fn set_folder_role(&self, account_id: &str, folder_name: &str, role: FolderRole) -> Result<()>;

    /// Every locally-recorded UID for this folder, ascending.
    async fn local_uids(&self, account_id: &str, folder_name: &str) -> Result<Vec<u32>>;

    /// Deletes every `ImapUid` row for this folder (UID-invalidity resync).
    async fn purge_folder_uids(&self, account_id: &str, folder_name: &str) -> Result<()>;

    /// Deletes specific UIDs from a folder (slow-refresh expunge of
    /// transient UIDs, or an explicit `delete_uids`).
    async fn remove_uids(&self, account_id: &str, folder_name: &str, uids: &[u32]) -> Result<()>;

    async fn find_message_by_hash(&self, account_id: &str, hash: &str) -> Result<Option<Message>>;

    /// The message hash currently bound to `uid` in this folder, if any.
    /// Used by flag-only refreshes (CONDSTORE delta, full flag re-fetch)
    /// that carry no body and must not disturb the existing binding.
    async fn uid_message_hash(&self, account_id: &str, folder_name: &str, uid: u32) -> Result<Option<String>>;

    async fn insert_message(&self, account_id: &str, message: &Message) -> Result<()>;

    /// Binds `uid` in `folder_name` to the Message with body hash
    /// `message_hash`, inserting or overwriting the `ImapUid` row.
    #[allow(clippy::too_many_arguments)]
    async fn upsert_imap_uid(
        &self,
        account_id: &str,
        folder_name: &str,
        uid: u32,
        uidvalidity: u32,
        message_hash: &str,
        flags: Flags,
        labels: &[String],
        modseq: Option<u64>,
    ) -> Result<()>;

    async fn account_sync_state(&self, account_id: &str) -> Result<AccountSyncState>;
    async fn set_account_sync_state(&self, account_id: &str, state: AccountSyncState) -> Result<()>;
}
