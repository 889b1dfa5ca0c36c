//! Folder Sync Engine (spec.md §4.6): the `initial → poll → resync_uids`
//! state machine for one `(account, folder)`. The stepping logic is
//! written entirely against the [`Mailbox`] trait and [`MessageStore`],
//! never against a concrete IMAP type, so it can be driven by a fake in
//! tests exactly as it is by a real Crispin client in production —
//! mirroring the spec's design note that `MailsyncDone`/`UidInvalid`
//! become explicit result variants rather than exceptions.

use std::collections::HashSet;
use std::time::Duration;

use crate::config::Provider;
use crate::constants::{
    CONDSTORE_FLAGS_REFRESH_BATCH_SIZE, FLAG_SYNC_BATCH_SIZE, MAX_UIDINVALID_RESYNCS,
    RETRY_SLEEP_SECS,
};
use crate::error::{Result, SyncError};
use crate::mail::crispin::{FetchedMessage, GenericCrispinClient, GmailCrispinClient, Mailbox};
use crate::mail::dedup::reconcile_message;
use crate::mail::imap::pool::ConnectionPool;
use crate::mail::types::{FetchedFlags, Flags, FolderSyncStatus, SyncPhase};
use crate::store::MessageStore;

/// Outcome of one engine step, used by [`FolderSyncEngine::run`] to
/// decide whether to loop, sleep-and-retry, or stop for good.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Continue,
    /// `sync_should_run` was false at the start of this step.
    Stopped,
    /// Terminal: folder missing, or UID-invalidity churn exceeded
    /// `MAX_UIDINVALID_RESYNCS`. Carries the human-readable reason.
    Done(String),
}

fn split_flags(flags: &FetchedFlags) -> (Flags, Vec<String>) {
    match flags {
        FetchedFlags::Plain { flags, .. } => (*flags, Vec::new()),
        FetchedFlags::Gmail { gmail, .. } => (gmail.flags, gmail.labels.clone()),
    }
}

async fn persist_fetched(
    store: &dyn MessageStore,
    account_id: &str,
    folder_name: &str,
    uidvalidity: u32,
    message: &FetchedMessage,
) -> Result<()> {
    let hash = reconcile_message(store, account_id, message).await?;
    let (flags, labels) = split_flags(&message.flags);
    store
        .upsert_imap_uid(
            account_id,
            folder_name,
            message.uid,
            uidvalidity,
            &hash,
            flags,
            &labels,
            message.flags.modseq(),
        )
        .await
}

/// Initial sync: downloads every remote UID not already recorded
/// locally, deduplicating bodies across folders via [`reconcile_message`].
pub async fn initial_sync(
    mailbox: &mut dyn Mailbox,
    store: &dyn MessageStore,
    account_id: &str,
    folder_name: &str,
) -> Result<FolderSyncStatus> {
    let selected = mailbox.select_folder(folder_name, true).await?;

    let remote_uids = mailbox.all_uids().await?;
    let local: HashSet<u32> = store.local_uids(account_id, folder_name).await?.into_iter().collect();
    let missing: Vec<u32> = remote_uids.into_iter().filter(|u| !local.contains(u)).collect();

    for chunk in missing.chunks(FLAG_SYNC_BATCH_SIZE) {
        let fetched = mailbox.uids(chunk).await?;
        for message in &fetched {
            persist_fetched(store, account_id, folder_name, selected.uidvalidity, message).await?;
        }
    }

    let mut status = store.folder_status(account_id, folder_name).await?;
    status.uidvalidity = selected.uidvalidity;
    status.uidnext = selected.uidnext;
    status.highestmodseq = selected.highestmodseq;
    status.phase = SyncPhase::Poll;
    status.uidinvalid_resync_count = 0;
    store.save_folder_status(account_id, folder_name, &status).await?;
    Ok(status)
}

/// Incremental poll (spec.md §4.6 "Poll"): refreshes flags via CONDSTORE
/// delta when available, otherwise a full flag re-fetch; downloads any
/// new UIDs; and, once per `slow_refresh_interval`, expunges UIDs that
/// have quietly vanished from the server's UID set (transient UIDs IDLE
/// never told us about).
pub async fn poll(
    mailbox: &mut dyn Mailbox,
    store: &dyn MessageStore,
    account_id: &str,
    folder_name: &str,
    slow_refresh_interval: chrono::Duration,
) -> Result<FolderSyncStatus> {
    let mut status = store.folder_status(account_id, folder_name).await?;
    let selected = mailbox.select_folder(folder_name, true).await?;

    if status.uidvalidity != 0 && selected.uidvalidity != status.uidvalidity {
        return Err(SyncError::UidInvalid {
            folder: folder_name.to_string(),
            stored: status.uidvalidity,
            server: selected.uidvalidity,
        });
    }

    let use_condstore = mailbox.condstore_supported()
        && selected
            .highestmodseq
            .zip(status.highestmodseq)
            .map(|(server, stored)| server > stored)
            .unwrap_or(selected.highestmodseq.is_some() && status.highestmodseq.is_none());

    if use_condstore {
        let changed = mailbox
            .condstore_changed_flags(status.highestmodseq.unwrap_or(0))
            .await?;
        for chunk in changed.chunks(CONDSTORE_FLAGS_REFRESH_BATCH_SIZE) {
            for (uid, flags) in chunk {
                let Some(hash) = existing_hash(store, account_id, folder_name, *uid).await? else {
                    continue;
                };
                let (f, labels) = split_flags(flags);
                store
                    .upsert_imap_uid(
                        account_id,
                        folder_name,
                        *uid,
                        selected.uidvalidity,
                        &hash,
                        f,
                        &labels,
                        flags.modseq(),
                    )
                    .await?;
            }
        }
    } else {
        let local_uids = store.local_uids(account_id, folder_name).await?;
        if !local_uids.is_empty() {
            let refreshed = mailbox.flags(&local_uids).await?;
            for (uid, flags) in &refreshed {
                let Some(hash) = existing_hash(store, account_id, folder_name, *uid).await? else {
                    continue;
                };
                let (f, labels) = split_flags(flags);
                store
                    .upsert_imap_uid(
                        account_id,
                        folder_name,
                        *uid,
                        selected.uidvalidity,
                        &hash,
                        f,
                        &labels,
                        flags.modseq(),
                    )
                    .await?;
            }
        }
    }

    let remote_uids = mailbox.all_uids().await?;
    let local_before_new: HashSet<u32> =
        store.local_uids(account_id, folder_name).await?.into_iter().collect();
    let new_uids: Vec<u32> = remote_uids
        .iter()
        .copied()
        .filter(|u| !local_before_new.contains(u))
        .collect();
    for chunk in new_uids.chunks(FLAG_SYNC_BATCH_SIZE) {
        let fetched = mailbox.uids(chunk).await?;
        for message in &fetched {
            persist_fetched(store, account_id, folder_name, selected.uidvalidity, message).await?;
        }
    }

    let now = chrono::Utc::now();
    let due_for_slow_refresh = status
        .last_slow_refresh
        .map(|last| now - last >= slow_refresh_interval)
        .unwrap_or(true);
    if due_for_slow_refresh {
        let remote_set: HashSet<u32> = remote_uids.iter().copied().collect();
        let local_now = store.local_uids(account_id, folder_name).await?;
        let stale: Vec<u32> = local_now.into_iter().filter(|u| !remote_set.contains(u)).collect();
        if !stale.is_empty() {
            store.remove_uids(account_id, folder_name, &stale).await?;
        }
        status.last_slow_refresh = Some(now);
    }

    status.uidvalidity = selected.uidvalidity;
    status.uidnext = selected
        .uidnext
        .max(remote_uids.iter().copied().max().map(|m| m + 1).unwrap_or(selected.uidnext));
    status.highestmodseq = selected.highestmodseq.or(status.highestmodseq);
    store.save_folder_status(account_id, folder_name, &status).await?;
    Ok(status)
}

/// `condstore_changed_flags`/`flags` only return UID+flags, not a body;
/// the store's `upsert_imap_uid` needs a message hash, which for an
/// already-downloaded UID is whatever hash it's already bound to. A UID
/// with no prior binding can't happen here (new UIDs go through the
/// fetch-and-persist path instead), so it's skipped rather than written
/// with a bogus hash.
async fn existing_hash(
    store: &dyn MessageStore,
    account_id: &str,
    folder_name: &str,
    uid: u32,
) -> Result<Option<String>> {
    store.uid_message_hash(account_id, folder_name, uid).await
}

/// UID-invalidity recovery (spec.md §4.6): purges every `ImapUid` for
/// this folder and resets its phase to `Initial`, unless the per-folder
/// resync counter has exceeded `MAX_UIDINVALID_RESYNCS`, in which case
/// the folder is marked `Done` instead.
pub async fn resync_uids(
    store: &dyn MessageStore,
    account_id: &str,
    folder_name: &str,
) -> Result<StepOutcome> {
    store.purge_folder_uids(account_id, folder_name).await?;

    let mut status = store.folder_status(account_id, folder_name).await?;
    status.uidinvalid_resync_count += 1;

    if status.uidinvalid_resync_count > MAX_UIDINVALID_RESYNCS {
        status.phase = SyncPhase::Done;
        status.sync_should_run = false;
        store.save_folder_status(account_id, folder_name, &status).await?;
        return Ok(StepOutcome::Done(format!(
            "folder '{folder_name}' exceeded MAX_UIDINVALID_RESYNCS ({MAX_UIDINVALID_RESYNCS})"
        )));
    }

    status.phase = SyncPhase::Initial;
    status.uidvalidity = 0;
    store.save_folder_status(account_id, folder_name, &status).await?;
    Ok(StepOutcome::Continue)
}

/// Runs exactly one state-machine step against whatever phase is
/// currently persisted, translating `FolderMissing`/`UidInvalid` into
/// the appropriate `StepOutcome` rather than letting them propagate as
/// plain errors.
pub async fn step(
    mailbox: &mut dyn Mailbox,
    store: &dyn MessageStore,
    account_id: &str,
    folder_name: &str,
    slow_refresh_interval: chrono::Duration,
) -> Result<StepOutcome> {
    let status = store.folder_status(account_id, folder_name).await?;
    if !status.sync_should_run {
        return Ok(StepOutcome::Stopped);
    }

    let result = match status.phase {
        SyncPhase::Done => return Ok(StepOutcome::Done(format!("folder '{folder_name}' already done"))),
        SyncPhase::Initial => initial_sync(mailbox, store, account_id, folder_name).await,
        SyncPhase::Poll => poll(mailbox, store, account_id, folder_name, slow_refresh_interval).await,
        SyncPhase::ResyncUids => return resync_uids(store, account_id, folder_name).await,
    };

    match result {
        Ok(_) => Ok(StepOutcome::Continue),
        Err(SyncError::FolderMissing(name)) => Ok(StepOutcome::Done(format!("folder '{name}' no longer exists"))),
        Err(SyncError::UidInvalid { .. }) => {
            let mut status = store.folder_status(account_id, folder_name).await?;
            status.phase = SyncPhase::ResyncUids;
            store.save_folder_status(account_id, folder_name, &status).await?;
            Ok(StepOutcome::Continue)
        }
        Err(e) => Err(e),
    }
}

/// Owns the pool/store handles for one `(account, folder)` and drives
/// [`step`] in a supervised loop: retryable errors (`Network`,
/// `ImapAbort`, `PoolTimeout`) get the fixed `RETRY_SLEEP_SECS` backoff
/// the upstream `retry_crispin` helper uses; anything else propagates so
/// the Account Monitor can react (account-fatal errors stop every
/// sibling engine too).
pub struct FolderSyncEngine {
    account_id: String,
    folder_name: String,
    provider: Provider,
    pool: ConnectionPool,
    poll_interval: Duration,
    slow_refresh_interval: chrono::Duration,
}

impl FolderSyncEngine {
    pub fn new(
        account_id: String,
        folder_name: String,
        provider: Provider,
        pool: ConnectionPool,
        poll_interval: Duration,
        slow_refresh_interval: chrono::Duration,
    ) -> Self {
        Self {
            account_id,
            folder_name,
            provider,
            pool,
            poll_interval,
            slow_refresh_interval,
        }
    }

    async fn acquire_mailbox(&self) -> Result<Box<dyn Mailbox>> {
        let conn = self.pool.acquire().await?;
        let mailbox: Box<dyn Mailbox> = match self.provider {
            Provider::Gmail => Box::new(GmailCrispinClient::new(self.account_id.clone(), conn).await?),
            Provider::Generic => {
                Box::new(GenericCrispinClient::new(self.account_id.clone(), conn, true).await?)
            }
        };
        Ok(mailbox)
    }

    /// Runs until a terminal `StepOutcome` or `shutdown` fires.
    pub async fn run(&self, store: &dyn MessageStore, shutdown: &tokio::sync::Notify) -> Result<()> {
        loop {
            let outcome = async {
                let mut mailbox = self.acquire_mailbox().await?;
                step(
                    mailbox.as_mut(),
                    store,
                    &self.account_id,
                    &self.folder_name,
                    self.slow_refresh_interval,
                )
                .await
            }
            .await;

            match outcome {
                Ok(StepOutcome::Done(reason)) => {
                    tracing::info!(account_id = %self.account_id, folder = %self.folder_name, %reason, "folder sync done");
                    return Ok(());
                }
                Ok(StepOutcome::Stopped) => return Ok(()),
                Ok(StepOutcome::Continue) => {}
                Err(e) if e.is_retryable() => {
                    tracing::warn!(account_id = %self.account_id, folder = %self.folder_name, error = %e, "retrying after transient error");
                    tokio::time::sleep(Duration::from_secs(RETRY_SLEEP_SECS)).await;
                    continue;
                }
                Err(e) => return Err(e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.notified() => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::crispin::SelectedFolder;
    use crate::mail::types::RawFolder;
    use crate::store::InMemoryMessageStore;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// In-memory `Mailbox` double: a fixed remote UID set with bodies,
    /// plus mutable uidvalidity/highestmodseq so tests can simulate
    /// server-side churn between `step` calls.
    struct FakeMailbox {
        uidvalidity: u32,
        uidnext: u32,
        highestmodseq: Option<u64>,
        messages: HashMap<u32, (Vec<u8>, FetchedFlags)>,
        condstore: bool,
    }

    impl FakeMailbox {
        fn new(uidvalidity: u32, bodies: Vec<(u32, &'static [u8])>) -> Self {
            let mut messages = HashMap::new();
            for (uid, body) in &bodies {
                messages.insert(
                    *uid,
                    (
                        body.to_vec(),
                        FetchedFlags::Plain { flags: Flags::empty(), modseq: None },
                    ),
                );
            }
            let uidnext = bodies.iter().map(|(u, _)| *u).max().unwrap_or(0) + 1;
            Self {
                uidvalidity,
                uidnext,
                highestmodseq: None,
                messages,
                condstore: false,
            }
        }
    }

    #[async_trait]
    impl Mailbox for FakeMailbox {
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
            Ok(SelectedFolder {
                name: name.to_string(),
                uidvalidity: self.uidvalidity,
                uidnext: self.uidnext,
                exists: self.messages.len() as u32,
                highestmodseq: self.highestmodseq,
            })
        }
        fn condstore_supported(&self) -> bool {
            self.condstore
        }
        fn idle_supported(&self) -> bool {
            false
        }
        async fn all_uids(&mut self) -> Result<Vec<u32>> {
            let mut uids: Vec<u32> = self.messages.keys().copied().collect();
            uids.sort_unstable();
            Ok(uids)
        }
        async fn search_uids(&mut self, _criteria: &str) -> Result<Vec<u32>> {
            self.all_uids().await
        }
        async fn uids(&mut self, uids: &[u32]) -> Result<Vec<FetchedMessage>> {
            Ok(uids
                .iter()
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
    async fn initial_sync_downloads_every_remote_uid_once() {
        let store = InMemoryMessageStore::new();
        let mut mailbox = FakeMailbox::new(1, vec![(22, b"a"), (23, b"b"), (24, b"c")]);

        let status = initial_sync(&mut mailbox, &store, "acct", "INBOX").await.unwrap();
        assert_eq!(status.phase, SyncPhase::Poll);
        assert_eq!(status.uidnext, 25);
        assert_eq!(store.local_uids("acct", "INBOX").await.unwrap(), vec![22, 23, 24]);
    }

    #[tokio::test]
    async fn poll_detects_uid_invalidity_and_step_routes_to_resync() {
        let store = InMemoryMessageStore::new();
        let mut mailbox = FakeMailbox::new(1, vec![(22, b"a")]);
        initial_sync(&mut mailbox, &store, "acct", "INBOX").await.unwrap();

        mailbox.uidvalidity = 2;
        let outcome = step(&mut mailbox, &store, "acct", "INBOX", chrono::Duration::hours(12))
            .await
            .unwrap();
        assert!(matches!(outcome, StepOutcome::Continue));
        let status = store.folder_status("acct", "INBOX").await.unwrap();
        assert_eq!(status.phase, SyncPhase::ResyncUids);
    }

    #[tokio::test]
    async fn resync_marks_done_after_exceeding_max_retries() {
        let store = InMemoryMessageStore::new();
        let mut status = FolderSyncStatus::default();
        status.uidinvalid_resync_count = MAX_UIDINVALID_RESYNCS;
        store.save_folder_status("acct", "INBOX", &status).await.unwrap();

        let outcome = resync_uids(&store, "acct", "INBOX").await.unwrap();
        assert!(matches!(outcome, StepOutcome::Done(_)));
        let status = store.folder_status("acct", "INBOX").await.unwrap();
        assert_eq!(status.phase, SyncPhase::Done);
        assert!(!status.sync_should_run);
    }

    #[tokio::test]
    async fn poll_is_a_no_op_on_local_state_when_nothing_changed_remotely() {
        let store = InMemoryMessageStore::new();
        let mut mailbox = FakeMailbox::new(1, vec![(22, b"a"), (23, b"b")]);
        initial_sync(&mut mailbox, &store, "acct", "INBOX").await.unwrap();

        poll(&mut mailbox, &store, "acct", "INBOX", chrono::Duration::hours(12)).await.unwrap();
        let first = store.local_uids("acct", "INBOX").await.unwrap();
        poll(&mut mailbox, &store, "acct", "INBOX", chrono::Duration::hours(12)).await.unwrap();
        let second = store.local_uids("acct", "INBOX").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn poll_downloads_uids_that_appear_after_initial_sync() {
        let store = InMemoryMessageStore::new();
        let mut mailbox = FakeMailbox::new(1, vec![(22, b"a")]);
        initial_sync(&mut mailbox, &store, "acct", "INBOX").await.unwrap();

        mailbox.messages.insert(
            23,
            (b"new".to_vec(), FetchedFlags::Plain { flags: Flags::empty(), modseq: None }),
        );
        mailbox.uidnext = 24;
        poll(&mut mailbox, &store, "acct", "INBOX", chrono::Duration::hours(12)).await.unwrap();
        assert_eq!(store.local_uids("acct", "INBOX").await.unwrap(), vec![22, 23]);
    }

    #[tokio::test]
    async fn initial_sync_on_an_empty_folder_persists_nothing() {
        let store = InMemoryMessageStore::new();
        let mut mailbox = FakeMailbox::new(1, vec![]);
        initial_sync(&mut mailbox, &store, "acct", "INBOX").await.unwrap();
        assert!(store.local_uids("acct", "INBOX").await.unwrap().is_empty());
    }
}
