//! Generic (non-Gmail) Crispin client: CONDSTORE-if-available IMAP, no
//! label semantics.

use futures::StreamExt;

use super::parse::parse_message_list;
use super::{
    attribute_to_string, is_folder_missing_message, uid_sequence_set, FetchedMessage, Mailbox,
    SelectedFolder,
};
use crate::constants::MAX_MESSAGE_BODY_LENGTH;
use crate::error::{Result, SyncError};
use crate::mail::imap::pool::PooledConnection;
use crate::mail::types::{content_hash, FetchedFlags, Flags, RawFolder};

pub struct GenericCrispinClient {
    pub(crate) conn: PooledConnection,
    account_id: String,
    selected: Option<SelectedFolder>,
    separator: char,
    prefix: String,
    condstore: bool,
    idle: bool,
    readonly_pool: bool,
}

impl GenericCrispinClient {
    /// Wraps a freshly-acquired connection. Capabilities are probed once
    /// up front since they don't change within a session.
    pub async fn new(
        account_id: String,
        mut conn: PooledConnection,
        readonly_pool: bool,
    ) -> Result<Self> {
        let caps = match conn.session_mut().capabilities().await {
            Ok(caps) => caps,
            Err(e) => {
                conn.discard();
                return Err(SyncError::ImapProtocol(e.to_string()));
            }
        };

        let condstore = caps.has_str("CONDSTORE") || caps.has_str("QRESYNC");
        let idle = caps.has_str("IDLE");

        // NAMESPACE is never queried; see DESIGN.md's "Folder prefix /
        // NAMESPACE" entry for why a hardcoded empty prefix is the
        // deliberate choice here.
        Ok(Self {
            conn,
            account_id,
            selected: None,
            separator: '.',
            prefix: String::new(),
            condstore,
            idle,
            readonly_pool,
        })
    }

    fn account(&self) -> &str {
        &self.account_id
    }

    /// Mark the underlying connection unusable so the Pool logs it out
    /// instead of recycling it, then wrap `err` as an `ImapProtocol`.
    fn protocol_error(&mut self, err: impl std::fmt::Display) -> SyncError {
        self.conn.discard();
        SyncError::ImapProtocol(err.to_string())
    }

    /// Maps a `SELECT`/`EXAMINE` failure to `FolderMissing` when the
    /// server's message says so, otherwise to a generic protocol error
    /// (which also discards the connection: an unrecognized SELECT
    /// failure means we don't know what state the session is in).
    fn classify_select_error(&mut self, name: &str, err: async_imap::error::Error) -> SyncError {
        let message = err.to_string();
        if is_folder_missing_message(&message) {
            SyncError::FolderMissing(name.to_string())
        } else {
            self.conn.discard();
            SyncError::ImapProtocol(message)
        }
    }
}

#[async_trait::async_trait]
impl Mailbox for GenericCrispinClient {
    async fn list_folders(&mut self) -> Result<Vec<RawFolder>> {
        let session = self.conn.session_mut();
        let mut stream = match session.list(Some(""), Some("*")).await {
            Ok(s) => s,
            Err(e) => {
                self.conn.discard();
                return Err(SyncError::ImapProtocol(e.to_string()));
            }
        };

        let mut folders = Vec::new();
        let mut first_delimiter = None;
        let mut stream_error = None;

        while let Some(item) = stream.next().await {
            let name = match item {
                Ok(name) => name,
                Err(e) => {
                    stream_error = Some(e.to_string());
                    break;
                }
            };
            if name.name().is_empty() {
                continue;
            }
            if first_delimiter.is_none() {
                first_delimiter = name.delimiter().and_then(|d| d.chars().next());
            }
            let attributes = name
                .attributes()
                .iter()
                .map(attribute_to_string)
                .collect();
            folders.push(RawFolder {
                name: name.name().to_string(),
                delimiter: name.delimiter().and_then(|d| d.chars().next()),
                attributes,
            });
        }
        drop(stream);

        if let Some(msg) = stream_error {
            self.conn.discard();
            return Err(SyncError::ImapProtocol(msg));
        }

        self.separator = first_delimiter.unwrap_or('.');
        Ok(folders)
    }

    fn folder_separator(&self) -> char {
        self.separator
    }

    fn folder_prefix(&self) -> &str {
        &self.prefix
    }

    async fn select_folder(&mut self, name: &str, readonly: bool) -> Result<SelectedFolder> {
        let account = self.account().to_string();
        let session = self.conn.session_mut();

        let mailbox = if readonly {
            session.examine(name).await
        } else {
            session.select(name).await
        }
        .map_err(|e| self.classify_select_error(name, e))?;

        let uidvalidity = mailbox.uid_validity.unwrap_or(0);
        let uidnext = mailbox.uid_next.unwrap_or(1);
        let highestmodseq = mailbox.highest_mod_seq;

        let selected = SelectedFolder {
            name: name.to_string(),
            uidvalidity,
            uidnext,
            exists: mailbox.exists,
            highestmodseq,
        };

        tracing::debug!(account = %account, folder = %name, uidvalidity, uidnext, "selected folder");
        self.selected = Some(selected.clone());
        self.conn.note_selected_folder(name);
        Ok(selected)
    }

    fn condstore_supported(&self) -> bool {
        self.condstore
    }

    fn idle_supported(&self) -> bool {
        self.idle
    }

    async fn all_uids(&mut self) -> Result<Vec<u32>> {
        match self.search_uids("ALL").await {
            Ok(uids) => Ok(uids),
            Err(SyncError::ImapProtocol(msg)) if msg.to_lowercase().contains("wrong arguments") => {
                // Mail2World: rejects the parenthesised criteria form.
                self.raw_search_fallback("SEARCH ALL").await
            }
            Err(SyncError::ImapProtocol(msg)) if msg.to_lowercase().contains("internal error") => {
                // Oracle Beehive: UID SEARCH ALL occasionally errors out;
                // a plain sequence-range search recovers.
                self.raw_search_fallback("UID SEARCH 1:*").await
            }
            Err(e) => Err(e),
        }
    }

    async fn search_uids(&mut self, criteria: &str) -> Result<Vec<u32>> {
        let session = self.conn.session_mut();
        let mut uids: Vec<u32> = session
            .uid_search(criteria)
            .await
            .map_err(|e| self.protocol_error(e))?
            .into_iter()
            .collect();
        uids.sort_unstable();
        uids.dedup();
        Ok(uids)
    }

    async fn uids(&mut self, uids: &[u32]) -> Result<Vec<FetchedMessage>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let requested: std::collections::HashSet<u32> = uids.iter().copied().collect();
        let seq = uid_sequence_set(uids);

        let mut out = Vec::with_capacity(uids.len());
        let mut attempt = 0;
        loop {
            attempt += 1;
            let session = self.conn.session_mut();
            let mut stream = match session
                .uid_fetch(&seq, "(UID FLAGS INTERNALDATE RFC822.SIZE BODY.PEEK[])")
                .await
            {
                Ok(s) => s,
                Err(e) => {
                    self.conn.discard();
                    return Err(SyncError::ImapProtocol(e.to_string()));
                }
            };

            let mut batch = Vec::new();
            let mut ok = true;
            while let Some(item) = stream.next().await {
                match item {
                    Ok(fetch) => {
                        let Some(uid) = fetch.uid else { continue };
                        if !requested.contains(&uid) {
                            // Unsolicited FETCH for a UID we didn't ask
                            // for; discard it.
                            continue;
                        }
                        let size = fetch.size.unwrap_or(0);
                        if size as usize > MAX_MESSAGE_BODY_LENGTH {
                            tracing::warn!(uid, size, "skipping oversized message body");
                            continue;
                        }
                        let Some(body) = fetch.body() else {
                            tracing::warn!(uid, "FETCH response missing BODY[]; dropping");
                            continue;
                        };
                        let flag_vec: Vec<_> = fetch.flags().collect();
                        let flags = Flags::from_imap(&flag_vec);
                        let internaldate = fetch.internal_date().map(|d| d.with_timezone(&chrono::Utc));
                        batch.push(FetchedMessage {
                            uid,
                            flags: FetchedFlags::Plain { flags, modseq: None },
                            body: Some(body.to_vec()),
                            truncated: false,
                            internaldate,
                            size,
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, attempt, "FETCH stream error");
                        ok = false;
                    }
                }
            }
            drop(stream);

            if ok || attempt >= 3 {
                out.extend(batch);
                if !ok {
                    // Retries exhausted with the stream still unreliable;
                    // whatever is left unread on the wire makes this
                    // session unsafe to hand to the next pool waiter.
                    self.conn.discard();
                }
                break;
            }
        }

        Ok(out)
    }

    async fn flags(&mut self, uids: &[u32]) -> Result<Vec<(u32, FetchedFlags)>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        // Very long UID sets abort some servers; fetch from the minimum
        // UID to "*" and post-filter instead of sending the full list.
        let requested: std::collections::HashSet<u32> = uids.iter().copied().collect();
        let seq = if uids.len() > 100 {
            let min = *uids.iter().min().unwrap();
            format!("{min}:*")
        } else {
            uid_sequence_set(uids)
        };

        let session = self.conn.session_mut();
        let mut stream = match session.uid_fetch(&seq, "(UID FLAGS)").await {
            Ok(s) => s,
            Err(e) => {
                self.conn.discard();
                return Err(SyncError::ImapProtocol(e.to_string()));
            }
        };

        let mut out = Vec::new();
        let mut stream_error = None;
        while let Some(item) = stream.next().await {
            let fetch = match item {
                Ok(fetch) => fetch,
                Err(e) => {
                    stream_error = Some(e.to_string());
                    break;
                }
            };
            let Some(uid) = fetch.uid else { continue };
            if !requested.contains(&uid) {
                continue;
            }
            let flag_vec: Vec<_> = fetch.flags().collect();
            let flags = Flags::from_imap(&flag_vec);
            out.push((uid, FetchedFlags::Plain { flags, modseq: None }));
        }
        drop(stream);

        if let Some(msg) = stream_error {
            self.conn.discard();
            return Err(SyncError::ImapProtocol(msg));
        }
        Ok(out)
    }

    async fn condstore_changed_flags(&mut self, modseq: u64) -> Result<Vec<(u32, FetchedFlags)>> {
        let banner_wants_modseq = self.welcome_banner_is_smartermail();
        let query = if banner_wants_modseq {
            "(FLAGS MODSEQ)"
        } else {
            "(FLAGS)"
        };

        let session = self.conn.session_mut();
        let mut stream = match session
            .uid_fetch("1:*", format!("{query} (CHANGEDSINCE {modseq})"))
            .await
        {
            Ok(s) => s,
            Err(e) => {
                self.conn.discard();
                return Err(SyncError::ImapProtocol(e.to_string()));
            }
        };

        let mut out = Vec::new();
        let mut stream_error = None;
        while let Some(item) = stream.next().await {
            let fetch = match item {
                Ok(fetch) => fetch,
                Err(e) => {
                    stream_error = Some(e.to_string());
                    break;
                }
            };
            let Some(uid) = fetch.uid else { continue };
            let flag_vec: Vec<_> = fetch.flags().collect();
            let flags = Flags::from_imap(&flag_vec);
            out.push((
                uid,
                FetchedFlags::Plain {
                    flags,
                    modseq: fetch.modseq,
                },
            ));
        }
        drop(stream);

        if let Some(msg) = stream_error {
            self.conn.discard();
            return Err(SyncError::ImapProtocol(msg));
        }
        Ok(out)
    }

    async fn delete_uids(&mut self, uids: &[u32]) -> Result<()> {
        if uids.is_empty() {
            return Ok(());
        }
        let seq = uid_sequence_set(uids);
        let session = self.conn.session_mut();
        match session.uid_store(&seq, "+FLAGS (\\Deleted)").await {
            Ok(stream) => {
                stream.collect::<Vec<_>>().await;
            }
            Err(e) => {
                self.conn.discard();
                return Err(SyncError::ImapProtocol(e.to_string()));
            }
        }
        let session = self.conn.session_mut();
        match session.expunge().await {
            Ok(stream) => {
                stream.collect::<Vec<_>>().await;
            }
            Err(e) => {
                self.conn.discard();
                return Err(SyncError::ImapProtocol(e.to_string()));
            }
        }
        Ok(())
    }

    async fn set_starred(&mut self, uids: &[u32], starred: bool) -> Result<()> {
        self.store_flag(uids, "\\Flagged", starred).await
    }

    async fn set_unread(&mut self, uids: &[u32], unread: bool) -> Result<()> {
        // "unread" is the absence of \Seen.
        self.store_flag(uids, "\\Seen", !unread).await
    }
}

impl GenericCrispinClient {
    async fn store_flag(&mut self, uids: &[u32], flag: &str, add: bool) -> Result<()> {
        if uids.is_empty() {
            return Ok(());
        }
        let op = if add { "+FLAGS" } else { "-FLAGS" };
        for chunk in uids.chunks(crate::constants::FLAG_SYNC_BATCH_SIZE) {
            let seq = uid_sequence_set(chunk);
            let query = format!("{op} ({flag})");
            let session = self.conn.session_mut();
            match session.uid_store(&seq, &query).await {
                Ok(stream) => {
                    stream.collect::<Vec<_>>().await;
                }
                Err(e) => {
                    self.conn.discard();
                    return Err(SyncError::ImapProtocol(e.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Falls back to a raw `SEARCH`/`UID SEARCH` command and parses the
    /// untagged response with the regex-based `parse_message_list`
    /// rather than the crate's default parser, for servers whose replies
    /// the typed API chokes on.
    async fn raw_search_fallback(&mut self, command: &str) -> Result<Vec<u32>> {
        let session = self.conn.session_mut();
        let raw = session
            .run_command_and_read_response(command)
            .await
            .map_err(|e| self.protocol_error(e))?;
        Ok(parse_message_list(&[raw.as_slice()]))
    }

    fn welcome_banner_is_smartermail(&self) -> bool {
        banner_is_smartermail(self.conn.banner())
    }
}

/// SmarterMail's CONDSTORE implementation silently drops `MODSEQ` from a
/// `FETCH ... (FLAGS) (CHANGEDSINCE ...)` response unless it's explicitly
/// requested; the only signal we get is its welcome banner.
fn banner_is_smartermail(banner: &str) -> bool {
    banner.trim_end().ends_with("SmarterMail")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smartermail_banner_is_detected_regardless_of_trailing_whitespace() {
        assert!(banner_is_smartermail("* OK IMAP4rev1 SmarterMail\r\n"));
        assert!(banner_is_smartermail("* OK IMAP4rev1 SmarterMail"));
    }

    #[test]
    fn other_banners_are_not_mistaken_for_smartermail() {
        assert!(!banner_is_smartermail("* OK Dovecot ready."));
        assert!(!banner_is_smartermail("* OK Gimap ready for requests"));
    }
}

