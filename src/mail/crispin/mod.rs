//! The Crispin Client: a stateful wrapper around one IMAP session.
//!
//! IMAP is itself stateful (one selected mailbox per session, UIDs valid
//! only within that selection), so this layer owns the session, not the
//! other way around. `generic` is the CONDSTORE-if-available path every
//! provider gets; `gmail` layers Gmail's label/thread-id semantics on
//! top.

mod generic;
mod gmail;
mod parse;

pub use generic::GenericCrispinClient;
pub use gmail::GmailCrispinClient;
pub use parse::{parse_fetch_responses, parse_message_list, split_imap_list, FetchRecord};

use crate::error::SyncError;
use crate::mail::types::FetchedFlags;

/// Outcome of selecting a folder: the values the Folder Sync Engine needs
/// to detect UIDVALIDITY churn and decide whether CONDSTORE delta-fetch
/// is available this round.
#[derive(Debug, Clone)]
pub struct SelectedFolder {
    pub name: String,
    pub uidvalidity: u32,
    pub uidnext: u32,
    pub exists: u32,
    pub highestmodseq: Option<u64>,
}

/// A message fetched by UID, not yet reconciled against the local store.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub uid: u32,
    pub flags: FetchedFlags,
    pub body: Option<Vec<u8>>,
    pub truncated: bool,
    pub internaldate: Option<chrono::DateTime<chrono::Utc>>,
    pub size: u32,
}

/// Operations shared by the generic and Gmail Crispin clients, split out
/// as a trait so the Folder Sync Engine (and its tests) can run against
/// either a real IMAP-backed client or a fake.
#[async_trait::async_trait]
pub trait Mailbox: Send {
    async fn list_folders(&mut self) -> Result<Vec<crate::mail::types::RawFolder>, SyncError>;

    fn folder_separator(&self) -> char;
    fn folder_prefix(&self) -> &str;

    async fn select_folder(&mut self, name: &str, readonly: bool) -> Result<SelectedFolder, SyncError>;

    fn condstore_supported(&self) -> bool;
    fn idle_supported(&self) -> bool;

    async fn all_uids(&mut self) -> Result<Vec<u32>, SyncError>;
    async fn search_uids(&mut self, criteria: &str) -> Result<Vec<u32>, SyncError>;

    async fn uids(&mut self, uids: &[u32]) -> Result<Vec<FetchedMessage>, SyncError>;
    async fn flags(&mut self, uids: &[u32]) -> Result<Vec<(u32, FetchedFlags)>, SyncError>;
    async fn condstore_changed_flags(
        &mut self,
        modseq: u64,
    ) -> Result<Vec<(u32, FetchedFlags)>, SyncError>;

    async fn delete_uids(&mut self, uids: &[u32]) -> Result<(), SyncError>;
    async fn set_starred(&mut self, uids: &[u32], starred: bool) -> Result<(), SyncError>;
    async fn set_unread(&mut self, uids: &[u32], unread: bool) -> Result<(), SyncError>;
}

/// Message prefixes (case-insensitive, anchored at the start) that a
/// failed LOGIN/AUTHENTICATE's error text is checked against. Order
/// doesn't matter; first match wins.
const APP_PASSWORD_PREFIXES: &[&str] = &[
    "please using authorized code to login.",
    "authorized code is incorrect",
    "login fail. please using weixin token",
];

const INVALID_CREDENTIALS_PREFIXES: &[&str] = &[
    "[authenticationfailed]",
    "incorrect username or password",
    "invalid login or password",
    "login login error password error",
    "[auth] authentication failed.",
    "invalid login credentials",
    "[alert] please log in via your web browser",
    "login authentication failed",
    "authentication failed",
    "[alert] invalid credentials(failure)",
    "invalid email login",
    "failed: re-authentication failure",
    "invalid",
    "login incorrect",
    "login groupwise login failed",
    "login bad",
    "[authorizationfailed]",
    "incorrect password",
];

/// Classifies a server auth-failure message into the taxonomy's
/// `AppPasswordRequired` vs `InvalidCredentials` split, per the fixed
/// prefix lists RFC-adjacent providers are observed to use.
pub fn classify_auth_failure(account_id: &str, message: &str) -> SyncError {
    let lower = message.trim().to_lowercase();
    if APP_PASSWORD_PREFIXES.iter().any(|p| lower.starts_with(p)) {
        return SyncError::AppPasswordRequired(account_id.to_string());
    }
    if INVALID_CREDENTIALS_PREFIXES.iter().any(|p| lower.starts_with(p)) {
        return SyncError::InvalidCredentials(account_id.to_string());
    }
    SyncError::ImapProtocol(message.to_string())
}

/// Renders a UID list as the comma-joined sequence-set syntax IMAP
/// commands expect, e.g. `12,13,1024`.
pub(super) fn uid_sequence_set(uids: &[u32]) -> String {
    uids.iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

pub(super) fn attribute_to_string(attr: &async_imap::types::NameAttribute<'_>) -> String {
    use async_imap::types::NameAttribute;
    match attr {
        NameAttribute::NoSelect => "\\Noselect".to_string(),
        NameAttribute::NoInferiors => "\\Noinferiors".to_string(),
        NameAttribute::Marked => "\\Marked".to_string(),
        NameAttribute::Unmarked => "\\Unmarked".to_string(),
        NameAttribute::HasChildren => "\\HasChildren".to_string(),
        NameAttribute::HasNoChildren => "\\HasNoChildren".to_string(),
        NameAttribute::Custom(s) => s.to_string(),
    }
}

/// Folder-missing detection: several servers phrase "this mailbox does
/// not exist" differently; match the observed substrings rather than a
/// single fixed string.
pub fn is_folder_missing_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("nonexistent")
        || lower.contains("non-existent")
        || lower.contains("does not exist")
        || lower.contains("unknown mailbox")
        || lower.contains("access denied")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_invalid_credentials_prefixes() {
        let err = classify_auth_failure("acct", "[AUTHENTICATIONFAILED] Invalid credentials");
        assert!(matches!(err, SyncError::InvalidCredentials(_)));
    }

    #[test]
    fn classifies_app_password_prefixes() {
        let err = classify_auth_failure(
            "acct",
            "Please using authorized code to login. More info at...",
        );
        assert!(matches!(err, SyncError::AppPasswordRequired(_)));
    }

    #[test]
    fn unrecognized_message_is_protocol_error_not_silently_swallowed() {
        let err = classify_auth_failure("acct", "server is on fire");
        assert!(matches!(err, SyncError::ImapProtocol(_)));
    }

    #[test]
    fn folder_missing_detection_matches_observed_substrings() {
        assert!(is_folder_missing_message(
            "[NONEXISTENT] Unknown Mailbox: INBOX"
        ));
        assert!(is_folder_missing_message("Mailbox does not exist"));
        assert!(!is_folder_missing_message("OK selected"));
    }
}
