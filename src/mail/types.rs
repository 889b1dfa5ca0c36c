//! Core data model: accounts, folders, messages, and the flag/label sum
//! types the sync engine moves between the wire and local storage.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque account identifier. Kept as a newtype over an integer (rather
/// than an `Arc<Account>` reference) so `Account`, `Namespace`, and
/// `Folder` can all point at each other by id without forming reference
/// cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub i64);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque folder identifier, scoped to a single account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FolderId(pub i64);

bitflags! {
    /// IMAP system flags, as stored locally. Matches RFC 3501 system flags;
    /// `\Recent` is deliberately omitted since it's session-scoped and
    /// meaningless to persist.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Flags: u16 {
        const SEEN = 0b0000_0001;
        const ANSWERED = 0b0000_0010;
        const FLAGGED = 0b0000_0100;
        const DELETED = 0b0000_1000;
        const DRAFT = 0b0001_0000;
    }
}

impl Flags {
    pub fn from_imap(flags: &[async_imap::types::Flag<'_>]) -> Self {
        let mut out = Flags::empty();
        for flag in flags {
            match flag {
                async_imap::types::Flag::Seen => out |= Flags::SEEN,
                async_imap::types::Flag::Answered => out |= Flags::ANSWERED,
                async_imap::types::Flag::Flagged => out |= Flags::FLAGGED,
                async_imap::types::Flag::Deleted => out |= Flags::DELETED,
                async_imap::types::Flag::Draft => out |= Flags::DRAFT,
                _ => {}
            }
        }
        out
    }

    /// Render as the space-separated atom list used in STORE commands,
    /// e.g. `(\Seen \Flagged)`.
    pub fn to_imap_store_list(self) -> String {
        let mut atoms = Vec::new();
        if self.contains(Flags::SEEN) {
            atoms.push("\\Seen");
        }
        if self.contains(Flags::ANSWERED) {
            atoms.push("\\Answered");
        }
        if self.contains(Flags::FLAGGED) {
            atoms.push("\\Flagged");
        }
        if self.contains(Flags::DELETED) {
            atoms.push("\\Deleted");
        }
        if self.contains(Flags::DRAFT) {
            atoms.push("\\Draft");
        }
        format!("({})", atoms.join(" "))
    }
}

/// Gmail's flag model: system flags plus a free-form label set and the
/// thread/message ids Gmail exposes via `X-GM-THRID`/`X-GM-MSGID`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GmailFlags {
    pub flags: Flags,
    pub labels: Vec<String>,
    pub g_thrid: Option<u64>,
    pub g_msgid: Option<u64>,
}

/// The flag/label representation actually fetched off the wire for one
/// UID. Generic providers only ever produce `Plain`; Gmail always
/// produces `Gmail`. Modeled as a sum type (rather than an
/// all-fields-optional struct) so callers can't accidentally read a
/// label off a non-Gmail account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchedFlags {
    Plain { flags: Flags, modseq: Option<u64> },
    Gmail { gmail: GmailFlags, modseq: Option<u64> },
}

impl FetchedFlags {
    pub fn modseq(&self) -> Option<u64> {
        match self {
            FetchedFlags::Plain { modseq, .. } => *modseq,
            FetchedFlags::Gmail { modseq, .. } => *modseq,
        }
    }

    pub fn flags(&self) -> Flags {
        match self {
            FetchedFlags::Plain { flags, .. } => *flags,
            FetchedFlags::Gmail { gmail, .. } => gmail.flags,
        }
    }
}

/// A message as fetched fresh off the wire, before it's been matched
/// against the local store for deduplication.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub uid: u32,
    pub flags: FetchedFlags,
    /// Full RFC 5322 message, capped at `MAX_MESSAGE_BODY_LENGTH`; bodies
    /// over the cap are recorded as `None` with `truncated: true`.
    pub body: Option<Vec<u8>>,
    pub truncated: bool,
    pub internaldate: Option<chrono::DateTime<chrono::Utc>>,
    pub size: u32,
}

/// A folder as listed by the server, before role assignment.
#[derive(Debug, Clone)]
pub struct RawFolder {
    pub name: String,
    pub delimiter: Option<char>,
    /// IMAP LIST attributes, e.g. `\Noselect`, `\HasChildren`, or a
    /// special-use attribute such as `\Sent`/`\All`.
    pub attributes: Vec<String>,
}

/// Account-level sync state. The core reads the rest of `Account` but
/// only ever mutates this field, plus the derived `folder_separator`/
/// `folder_prefix` the Folder Catalog computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountSyncState {
    Running,
    Stopped,
    /// Credentials rejected or an OAuth2 grant revoked; every child
    /// engine is suspended until the operator supplies a new credential.
    Invalid,
    Killed,
}

/// Canonical folder roles after catalog role assignment (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderRole {
    Inbox,
    All,
    Sent,
    Drafts,
    Trash,
    Spam,
    Archive,
    Important,
    Starred,
    /// No role could be determined; synced like any other folder but
    /// never used as a role-specific target (e.g. "where do sent mail
    /// copies land").
    None,
}

/// Current phase of a folder's sync state machine (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// Full historical backfill has not completed yet.
    Initial,
    /// Backfill complete; doing incremental IDLE/CONDSTORE polling.
    Poll,
    /// UIDVALIDITY changed; re-establishing the UID mapping before
    /// resuming polling.
    ResyncUids,
    /// Sync has been permanently disabled for this folder (e.g. excluded
    /// by config, or the folder was deleted server-side and never came
    /// back).
    Done,
}

/// Per-folder durable sync state (spec §3's Folder sync-status sub-record).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderSyncStatus {
    pub uidvalidity: u32,
    pub uidnext: u32,
    pub highestmodseq: Option<u64>,
    pub phase: SyncPhase,
    pub sync_should_run: bool,
    pub last_slow_refresh: Option<chrono::DateTime<chrono::Utc>>,
    /// Number of consecutive UIDVALIDITY-triggered resyncs since the last
    /// successful `poll` transition; bounded by
    /// [`crate::constants::MAX_UIDINVALID_RESYNCS`].
    pub uidinvalid_resync_count: u32,
}

impl Default for FolderSyncStatus {
    fn default() -> Self {
        Self {
            uidvalidity: 0,
            uidnext: 1,
            highestmodseq: None,
            phase: SyncPhase::Initial,
            sync_should_run: true,
            last_slow_refresh: None,
            uidinvalid_resync_count: 0,
        }
    }
}

/// A synced folder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    pub id: FolderId,
    pub account_id: AccountId,
    pub name: String,
    pub role: FolderRole,
    pub status: FolderSyncStatus,
}

/// The mapping from a server UID (scoped to a folder + UIDVALIDITY epoch)
/// to a locally-stored `Message`.
#[derive(Debug, Clone)]
pub struct ImapUid {
    pub folder_id: FolderId,
    pub uidvalidity: u32,
    pub uid: u32,
    pub message_hash: String,
    pub flags: Flags,
    pub labels: Vec<String>,
    pub modseq: Option<u64>,
}

/// A message, deduplicated by content hash across every folder in an
/// account. Two `ImapUid` rows (e.g. one in INBOX, one in All Mail) can
/// point at the same `Message`.
#[derive(Debug, Clone)]
pub struct Message {
    pub hash: String,
    pub account_id: AccountId,
    pub size: u32,
    pub truncated: bool,
    pub subject: String,
    pub from_addr: String,
    pub message_id: Option<String>,
    pub internaldate: Option<chrono::DateTime<chrono::Utc>>,
}

/// SHA-256 hash of a message body, used as the cross-folder dedup key.
/// Hashing the body (not the Message-Id header, which a hostile or buggy
/// sender can forge or omit) is what lets the same physical email synced
/// into both INBOX and All Mail collapse to one `Message` row.
pub fn content_hash(raw: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(raw);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_round_trip_through_store_list() {
        let f = Flags::SEEN | Flags::FLAGGED;
        assert_eq!(f.to_imap_store_list(), "(\\Seen \\Flagged)");
    }

    #[test]
    fn content_hash_is_stable_and_order_independent_of_flags() {
        let body = b"From: a@example.com\r\n\r\nhi";
        let h1 = content_hash(body);
        let h2 = content_hash(body);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn content_hash_differs_for_different_bodies() {
        assert_ne!(content_hash(b"one"), content_hash(b"two"));
    }
}
