//! Integration tests for the multi-module Folder Sync Engine scenarios
//! (generic sync, Gmail cross-folder dedup, UID-invalidity resync,
//! folder-missing, oversized-body skip) that exercise `engine`, `dedup`,
//! and `store` together rather than any one module in isolation.

use std::collections::HashMap;

use async_trait::async_trait;
use imap_sync_core::error::Result;
use imap_sync_core::mail::crispin::{FetchedMessage, Mailbox, SelectedFolder};
use imap_sync_core::mail::engine::{initial_sync, poll, resync_uids, step, StepOutcome};
use imap_sync_core::mail::types::{
    content_hash, FetchedFlags, Flags, GmailFlags, RawFolder, SyncPhase,
};
use imap_sync_core::store::{InMemoryMessageStore, MessageStore};

const SLOW_REFRESH: chrono::Duration = chrono::Duration::hours(12);

/// A minimal in-memory `Mailbox` double: a fixed remote UID set, with a
/// few knobs tests flip between `step()` calls to simulate server-side
/// churn (UIDVALIDITY bump, a folder going away, an oversized message).
struct TestMailbox {
    uidvalidity: u32,
    uidnext: u32,
    messages: HashMap<u32, (Vec<u8>, FetchedFlags)>,
    oversized_uids: Vec<u32>,
    missing: bool,
}

impl TestMailbox {
    fn new(uidvalidity: u32, bodies: Vec<(u32, &'static [u8])>) -> Self {
        let uidnext = bodies.iter().map(|(u, _)| *u).max().unwrap_or(0) + 1;
        let mut messages = HashMap::new();
        for (uid, body) in bodies {
            messages.insert(
                uid,
                (
                    body.to_vec(),
                    FetchedFlags::Plain { flags: Flags::empty(), modseq: None },
                ),
            );
        }
        Self {
            uidvalidity,
            uidnext,
            messages,
            oversized_uids: Vec::new(),
            missing: false,
        }
    }

    fn with_gmail_flags(mut self, uid: u32, labels: &[&str]) -> Self {
        if let Some((_, flags)) = self.messages.get_mut(&uid) {
            *flags = FetchedFlags::Gmail {
                gmail: GmailFlags {
                    flags: Flags::empty(),
                    labels: labels.iter().map(|l| l.to_string()).collect(),
                    g_thrid: Some(uid as u64),
                    g_msgid: Some(uid as u64),
                },
                modseq: None,
            };
        }
        self
    }

    fn mark_oversized(mut self, uid: u32) -> Self {
        self.oversized_uids.push(uid);
        self
    }
}

#[async_trait]
impl Mailbox for TestMailbox {
    async fn list_folders(&mut self) -> Result<Vec<RawFolder>> {
        Ok(Vec::new())
    }

    fn folder_separator(&self) -> char {
        '/'
    }

    fn folder_prefix(&self) -> &str {
        ""
    }

    async fn select_folder(&mut self, name: &str, _readonly: bool) -> Result<SelectedFolder> {
        if self.missing {
            return Err(imap_sync_core::error::SyncError::FolderMissing(name.to_string()));
        }
        Ok(SelectedFolder {
            name: name.to_string(),
            uidvalidity: self.uidvalidity,
            uidnext: self.uidnext,
            exists: self.messages.len() as u32,
            highestmodseq: None,
        })
    }

    fn condstore_supported(&self) -> bool {
        false
    }

    fn idle_supported(&self) -> bool {
        false
    }

    async fn all_uids(&mut self) -> Result<Vec<u32>> {
        let mut uids: Vec<u32> = self.messages.keys().copied().collect();
        uids.extend(self.oversized_uids.iter().copied());
        uids.sort_unstable();
        uids.dedup();
        Ok(uids)
    }

    async fn search_uids(&mut self, _criteria: &str) -> Result<Vec<u32>> {
        self.all_uids().await
    }

    async fn uids(&mut self, uids: &[u32]) -> Result<Vec<FetchedMessage>> {
        // Mirrors the real Crispin clients: a UID whose RFC822.SIZE
        // exceeds MAX_MESSAGE_BODY_LENGTH is skipped entirely rather than
        // returned with a truncated body.
        Ok(uids
            .iter()
            .filter(|u| !self.oversized_uids.contains(u))
            .filter_map(|u| {
                self.messages.get(u).map(|(body, flags)| FetchedMessage {
                    uid: *u,
                    flags: flags.clone(),
                    body: Some(body.clone()),
                    truncated: false,
                    internaldate: None,
                    size: body.len() as u32,
                })
            })
            .collect())
    }

    async fn flags(&mut self, uids: &[u32]) -> Result<Vec<(u32, FetchedFlags)>> {
        Ok(uids
            .iter()
            .filter_map(|u| self.messages.get(u).map(|(_, f)| (*u, f.clone())))
            .collect())
    }

    async fn condstore_changed_flags(&mut self, _modseq: u64) -> Result<Vec<(u32, FetchedFlags)>> {
        Ok(Vec::new())
    }

    async fn delete_uids(&mut self, uids: &[u32]) -> Result<()> {
        for u in uids {
            self.messages.remove(u);
        }
        Ok(())
    }

    async fn set_starred(&mut self, _uids: &[u32], _starred: bool) -> Result<()> {
        Ok(())
    }

    async fn set_unread(&mut self, _uids: &[u32], _unread: bool) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn generic_initial_sync_matches_remote_search_all() {
    let store = InMemoryMessageStore::new();
    let mut mailbox = TestMailbox::new(1, vec![(1, b"one"), (2, b"two"), (3, b"three")]);

    let status = initial_sync(&mut mailbox, &store, "acct", "INBOX").await.unwrap();

    assert_eq!(status.phase, SyncPhase::Poll);
    let remote = mailbox.all_uids().await.unwrap();
    let local = store.local_uids("acct", "INBOX").await.unwrap();
    assert_eq!(local, remote);
}

/// spec.md §4.6 step 3 / §8: the same physical email synced into both
/// INBOX and All Mail collapses to one `Message` row, keyed by body hash.
#[tokio::test]
async fn gmail_cross_folder_dedup_collapses_shared_body_to_one_message() {
    let store = InMemoryMessageStore::new();

    let mut inbox = TestMailbox::new(1, vec![(10, b"shared body")])
        .with_gmail_flags(10, &["\\Inbox"]);
    initial_sync(&mut inbox, &store, "acct", "INBOX").await.unwrap();

    let mut all_mail = TestMailbox::new(1, vec![(55, b"shared body")])
        .with_gmail_flags(55, &["\\Important"]);
    initial_sync(&mut all_mail, &store, "acct", "[Gmail]/All Mail").await.unwrap();

    let hash = content_hash(b"shared body");
    let message = store.find_message_by_hash("acct", &hash).await.unwrap();
    assert!(message.is_some(), "expected one Message row for the shared body");

    // Both folders point at the same hash even though the UIDs differ.
    let inbox_hash = store.uid_message_hash("acct", "INBOX", 10).await.unwrap();
    let all_mail_hash = store
        .uid_message_hash("acct", "[Gmail]/All Mail", 55)
        .await
        .unwrap();
    assert_eq!(inbox_hash, Some(hash.clone()));
    assert_eq!(all_mail_hash, Some(hash));
}

/// First, a single UIDVALIDITY bump routes a live `step()` dispatch into
/// `ResyncUids`, which purges every `ImapUid` for the folder. Then,
/// `resync_uids` itself bounds how many consecutive times this can
/// happen: once `uidinvalid_resync_count` exceeds
/// `MAX_UIDINVALID_RESYNCS` the folder is marked `Done` rather than
/// resynced forever.
#[tokio::test]
async fn uid_invalidity_churn_is_bounded_by_max_resyncs() {
    let store = InMemoryMessageStore::new();
    let mut mailbox = TestMailbox::new(1, vec![(1, b"a"), (2, b"b")]);
    initial_sync(&mut mailbox, &store, "acct", "INBOX").await.unwrap();
    assert_eq!(store.local_uids("acct", "INBOX").await.unwrap(), vec![1, 2]);

    mailbox.uidvalidity = 2;
    let outcome = step(&mut mailbox, &store, "acct", "INBOX", SLOW_REFRESH).await.unwrap();
    assert!(matches!(outcome, StepOutcome::Continue));
    let status = store.folder_status("acct", "INBOX").await.unwrap();
    assert_eq!(status.phase, SyncPhase::ResyncUids);
    assert!(
        store.local_uids("acct", "INBOX").await.unwrap().is_empty(),
        "resync must purge every ImapUid for the folder"
    );

    let mut last_outcome = resync_uids(&store, "acct", "INBOX").await.unwrap();
    for _ in 0..imap_sync_core::constants::MAX_UIDINVALID_RESYNCS {
        last_outcome = resync_uids(&store, "acct", "INBOX").await.unwrap();
    }

    let status = store.folder_status("acct", "INBOX").await.unwrap();
    assert_eq!(status.phase, SyncPhase::Done);
    assert!(!status.sync_should_run);
    assert!(matches!(last_outcome, StepOutcome::Done(_)));
}

/// SELECT/EXAMINE failing because the folder no longer exists server-side
/// must surface as a terminal `StepOutcome::Done`, not a propagated error
/// that would crash the folder's supervising engine.
#[tokio::test]
async fn folder_missing_ends_the_engine_without_error() {
    let store = InMemoryMessageStore::new();
    let mut mailbox = TestMailbox::new(1, vec![(1, b"a")]);
    initial_sync(&mut mailbox, &store, "acct", "INBOX").await.unwrap();

    mailbox.missing = true;
    let outcome = step(&mut mailbox, &store, "acct", "INBOX", SLOW_REFRESH).await.unwrap();

    assert!(matches!(outcome, StepOutcome::Done(reason) if reason.contains("no longer exists")));
}

/// spec.md §4.6 scenario 6: a UID whose advertised size exceeds
/// `MAX_MESSAGE_BODY_LENGTH` is never fetched or persisted, and stays
/// skipped across subsequent polls rather than being retried forever.
#[tokio::test]
async fn oversized_body_is_skipped_and_stays_skipped_across_polls() {
    let store = InMemoryMessageStore::new();
    let mut mailbox = TestMailbox::new(1, vec![(1, b"small")]).mark_oversized(99);

    initial_sync(&mut mailbox, &store, "acct", "INBOX").await.unwrap();
    let local = store.local_uids("acct", "INBOX").await.unwrap();
    assert_eq!(local, vec![1]);

    poll(&mut mailbox, &store, "acct", "INBOX", SLOW_REFRESH).await.unwrap();
    let local_after_poll = store.local_uids("acct", "INBOX").await.unwrap();
    assert_eq!(local_after_poll, vec![1], "oversized UID 99 must remain unpersisted");
}
