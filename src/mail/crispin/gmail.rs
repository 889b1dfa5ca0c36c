//! Gmail Crispin client: labels via `X-GM-LABELS`, thread/message ids via
//! `X-GM-THRID`/`X-GM-MSGID`, and Gmail's copy-then-delete semantics for
//! the Drafts/Sent folders. Grounded on the upstream `GmailCrispinClient`.

use futures::StreamExt;
use std::collections::{HashMap, HashSet};

use super::parse::{parse_fetch_responses, parse_message_list, split_imap_list, FetchRecord};
use super::{attribute_to_string, is_folder_missing_message, uid_sequence_set, FetchedMessage, Mailbox, SelectedFolder};
use crate::constants::MAX_MESSAGE_BODY_LENGTH;
use crate::error::{Result, SyncError};
use crate::mail::imap::pool::PooledConnection;
use crate::mail::types::{FetchedFlags, Flags, GmailFlags, RawFolder};

pub struct GmailCrispinClient {
    pub(crate) conn: PooledConnection,
    account_id: String,
    selected: Option<SelectedFolder>,
    separator: char,
    prefix: String,
    condstore: bool,
    idle: bool,
}

impl GmailCrispinClient {
    pub async fn new(account_id: String, mut conn: PooledConnection) -> Result<Self> {
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
            separator: '/',
            prefix: String::new(),
            condstore,
            idle,
        })
    }

    /// Mark the underlying connection unusable so the Pool logs it out
    /// instead of recycling it, then wrap `err` as an `ImapProtocol`.
    fn protocol_error(&mut self, err: impl std::fmt::Display) -> SyncError {
        self.conn.discard();
        SyncError::ImapProtocol(err.to_string())
    }

    fn classify_select_error(&mut self, name: &str, err: async_imap::error::Error) -> SyncError {
        let message = err.to_string();
        if is_folder_missing_message(&message) {
            SyncError::FolderMissing(name.to_string())
        } else {
            self.conn.discard();
            SyncError::ImapProtocol(message)
        }
    }

    fn decode_label(raw: &str) -> String {
        utf7_imap::decode_utf7_imap(raw)
    }

    /// Issues a raw `UID FETCH` and parses the untagged response text
    /// ourselves. Needed for anything touching Gmail's non-standard
    /// `X-GM-*` items, which `async_imap`'s typed `Fetch` has no concept
    /// of.
    async fn raw_uid_fetch(&mut self, seq: &str, items: &str) -> Result<Vec<FetchRecord>> {
        let command = format!("UID FETCH {seq} ({items})");
        let session = self.conn.session_mut();
        let raw = session
            .run_command_and_read_response(&command)
            .await
            .map_err(|e| self.protocol_error(e))?;
        Ok(parse_fetch_responses(&raw))
    }

    /// X-GM-MSGID for each of `uids`, in the currently selected folder.
    pub async fn g_msgids(&mut self, uids: &[u32]) -> Result<HashMap<u32, u64>> {
        if uids.is_empty() {
            return Ok(HashMap::new());
        }
        let requested: HashSet<u32> = uids.iter().copied().collect();
        let seq = uid_sequence_set(uids);
        let records = self.raw_uid_fetch(&seq, "UID X-GM-MSGID").await?;

        let mut out = HashMap::new();
        for record in records {
            let Some(uid) = record.u32("UID") else { continue };
            if !requested.contains(&uid) {
                continue;
            }
            if let Some(msgid) = record.u64("X-GM-MSGID") {
                out.insert(uid, msgid);
            }
        }
        Ok(out)
    }

    /// All UIDs in the currently selected folder sharing `g_msgid`, most
    /// recent (highest UID) first.
    pub async fn g_msgid_to_uids(&mut self, g_msgid: u64) -> Result<Vec<u32>> {
        let criteria = format!("X-GM-MSGID {g_msgid}");
        let mut uids = self.uid_search_plain(&criteria).await?;
        uids.sort_unstable_by(|a, b| b.cmp(a));
        Ok(uids)
    }

    /// All UIDs in the currently selected folder sharing `g_thrid`, most
    /// recent first.
    pub async fn expand_thread(&mut self, g_thrid: u64) -> Result<Vec<u32>> {
        let criteria = format!("X-GM-THRID {g_thrid}");
        let mut uids = self.uid_search_plain(&criteria).await?;
        uids.sort_unstable_by(|a, b| b.cmp(a));
        Ok(uids)
    }

    pub async fn find_by_header(&mut self, header_name: &str, header_value: &str) -> Result<Vec<u32>> {
        let criteria = format!("HEADER {header_name} \"{header_value}\"");
        self.uid_search_plain(&criteria).await
    }

    async fn uid_search_plain(&mut self, criteria: &str) -> Result<Vec<u32>> {
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

    /// Searches by Gmail label, UTF-7 encoding and quoting the label the
    /// way the server expects. Plain ASCII labels without `*` go through
    /// the ordinary typed search; everything else needs a raw, quoted
    /// command because the typed search API doesn't quote for us and an
    /// unquoted label containing `*` confuses the Gmail parser.
    pub async fn search_by_label(&mut self, label: &str) -> Result<Vec<u32>> {
        let encoded = utf7_imap::encode_utf7_imap(label);
        if encoded == label && !label.contains('*') {
            let criteria = format!("X-GM-LABELS {label}");
            return self.uid_search_plain(&criteria).await;
        }

        let quoted = encoded.replace('\\', "\\\\").replace('"', "\\\"");
        let command = format!("UID SEARCH X-GM-LABELS \"{quoted}\"");
        let session = self.conn.session_mut();
        let raw = session
            .run_command_and_read_response(&command)
            .await
            .map_err(|e| self.protocol_error(e))?;
        Ok(parse_message_list(&[raw.as_slice()]))
    }

    /// Deletes a message from the Drafts label by `Message-Id` header,
    /// guarding against the race where Gmail briefly shows the sent copy
    /// and the draft as the same `X-GM-MSGID` before reconciling them.
    /// Leaves `trash_folder` selected on success. Returns `Ok(false)` if
    /// no matching draft was found.
    pub async fn delete_draft(
        &mut self,
        message_id_header: &str,
        drafts_folder: &str,
        sent_folder: &str,
        trash_folder: &str,
    ) -> Result<bool> {
        self.select_folder(sent_folder, false).await?;
        let sent_uids = self.find_by_header("Message-Id", message_id_header).await?;
        if sent_uids.is_empty() {
            return Err(SyncError::ImapProtocol(
                "couldn't find sent message in sent folder".into(),
            ));
        }
        let sent_msgids = self.g_msgids(&sent_uids).await?;
        let sent_msgid_values: HashSet<u64> = sent_msgids.values().copied().collect();
        if sent_msgid_values.len() != 1 {
            return Err(SyncError::ImapProtocol(
                "expected exactly one sent message-id match".into(),
            ));
        }
        let sent_msgid = *sent_msgid_values.iter().next().unwrap();

        self.select_folder(drafts_folder, false).await?;
        let draft_uids = self.find_by_header("Message-Id", message_id_header).await?;
        if draft_uids.is_empty() {
            return Ok(false);
        }

        self.remove_flags(&draft_uids, "\\Draft").await?;

        let draft_msgids = self.g_msgids(&draft_uids).await?;
        for msgid in draft_msgids.values() {
            if *msgid == sent_msgid {
                return Err(SyncError::DraftDeletionConflict(
                    self.account_id.clone(),
                    draft_uids[0],
                ));
            }
        }

        self.copy_uids(&draft_uids, trash_folder).await?;
        self.select_folder(trash_folder, false).await?;
        for msgid in draft_msgids.values() {
            let uids = self.g_msgid_to_uids(*msgid).await?;
            self.delete_uids(&uids).await?;
        }
        Ok(true)
    }

    /// Deletes a message from the Sent label by `Message-Id` header via
    /// copy-to-Trash-then-delete. Leaves `trash_folder` selected.
    pub async fn delete_sent_message(
        &mut self,
        message_id_header: &str,
        sent_folder: &str,
        trash_folder: &str,
    ) -> Result<bool> {
        self.select_folder(sent_folder, false).await?;
        let uids = self.find_by_header("Message-Id", message_id_header).await?;
        if uids.is_empty() {
            return Ok(false);
        }
        self.copy_uids(&uids, trash_folder).await?;
        self.select_folder(trash_folder, false).await?;
        self.delete_uids(&uids).await?;
        Ok(true)
    }

    async fn copy_uids(&mut self, uids: &[u32], dest: &str) -> Result<()> {
        let seq = uid_sequence_set(uids);
        let session = self.conn.session_mut();
        session
            .uid_copy(&seq, dest)
            .await
            .map_err(|e| self.protocol_error(e))?;
        Ok(())
    }

    async fn remove_flags(&mut self, uids: &[u32], flag: &str) -> Result<()> {
        let seq = uid_sequence_set(uids);
        let query = format!("-FLAGS ({flag})");
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
        Ok(())
    }
}

fn parse_flag_atoms(s: &str) -> Flags {
    let mut flags = Flags::empty();
    for atom in s.split_whitespace() {
        match atom {
            "\\Seen" => flags |= Flags::SEEN,
            "\\Answered" => flags |= Flags::ANSWERED,
            "\\Flagged" => flags |= Flags::FLAGGED,
            "\\Deleted" => flags |= Flags::DELETED,
            "\\Draft" => flags |= Flags::DRAFT,
            _ => {}
        }
    }
    flags
}

fn gmail_labels_of(record: &FetchRecord) -> Vec<String> {
    record
        .list_text("X-GM-LABELS")
        .map(|inner| {
            split_imap_list(inner)
                .into_iter()
                .map(|raw_label| GmailCrispinClient::decode_label(raw_label.trim_matches('"')))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_internaldate(record: &FetchRecord) -> Option<chrono::DateTime<chrono::Utc>> {
    let raw = record.atom("INTERNALDATE")?;
    chrono::DateTime::parse_from_str(raw, "%d-%b-%Y %H:%M:%S %z")
        .ok()
        .map(|d| d.with_timezone(&chrono::Utc))
}

#[async_trait::async_trait]
impl Mailbox for GmailCrispinClient {
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
            let attributes = name.attributes().iter().map(attribute_to_string).collect();
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

        self.separator = first_delimiter.unwrap_or('/');
        Ok(folders)
    }

    fn folder_separator(&self) -> char {
        self.separator
    }

    fn folder_prefix(&self) -> &str {
        &self.prefix
    }

    async fn select_folder(&mut self, name: &str, readonly: bool) -> Result<SelectedFolder> {
        let session = self.conn.session_mut();
        let mailbox = if readonly {
            session.examine(name).await
        } else {
            session.select(name).await
        }
        .map_err(|e| self.classify_select_error(name, e))?;

        let selected = SelectedFolder {
            name: name.to_string(),
            uidvalidity: mailbox.uid_validity.unwrap_or(0),
            uidnext: mailbox.uid_next.unwrap_or(1),
            exists: mailbox.exists,
            highestmodseq: mailbox.highest_mod_seq,
        };
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
        self.uid_search_plain("ALL").await
    }

    async fn search_uids(&mut self, criteria: &str) -> Result<Vec<u32>> {
        self.uid_search_plain(criteria).await
    }

    async fn uids(&mut self, uids: &[u32]) -> Result<Vec<FetchedMessage>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let requested: HashSet<u32> = uids.iter().copied().collect();
        let seq = uid_sequence_set(uids);
        let records = self
            .raw_uid_fetch(
                &seq,
                "UID FLAGS INTERNALDATE RFC822.SIZE BODY.PEEK[] X-GM-THRID X-GM-MSGID X-GM-LABELS",
            )
            .await?;

        let mut out = Vec::with_capacity(uids.len());
        for record in records {
            let Some(uid) = record.u32("UID") else { continue };
            if !requested.contains(&uid) {
                continue;
            }
            let size = record.u32("RFC822.SIZE").unwrap_or(0);
            if size as usize > MAX_MESSAGE_BODY_LENGTH {
                tracing::warn!(uid, size, "skipping oversized message body");
                continue;
            }
            let Some(body) = record.bytes("BODY[]") else {
                tracing::warn!(uid, "FETCH response missing BODY[]; dropping");
                continue;
            };
            let gmail = GmailFlags {
                flags: record.atom("FLAGS").map(parse_flag_atoms).unwrap_or_default(),
                labels: gmail_labels_of(&record),
                g_thrid: record.u64("X-GM-THRID"),
                g_msgid: record.u64("X-GM-MSGID"),
            };
            out.push(FetchedMessage {
                uid,
                flags: FetchedFlags::Gmail { gmail, modseq: None },
                body: Some(body.to_vec()),
                truncated: false,
                internaldate: parse_internaldate(&record),
                size,
            });
        }
        Ok(out)
    }

    async fn flags(&mut self, uids: &[u32]) -> Result<Vec<(u32, FetchedFlags)>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let requested: HashSet<u32> = uids.iter().copied().collect();
        let seq = uid_sequence_set(uids);
        let records = self.raw_uid_fetch(&seq, "UID FLAGS X-GM-LABELS").await?;

        let mut out = Vec::new();
        for record in records {
            let Some(uid) = record.u32("UID") else { continue };
            if !requested.contains(&uid) {
                continue;
            }
            let gmail = GmailFlags {
                flags: record.atom("FLAGS").map(parse_flag_atoms).unwrap_or_default(),
                labels: gmail_labels_of(&record),
                g_thrid: None,
                g_msgid: None,
            };
            out.push((uid, FetchedFlags::Gmail { gmail, modseq: None }));
        }
        Ok(out)
    }

    async fn condstore_changed_flags(&mut self, modseq: u64) -> Result<Vec<(u32, FetchedFlags)>> {
        let items = "UID FLAGS X-GM-LABELS MODSEQ";
        let command = format!("UID FETCH 1:* ({items}) (CHANGEDSINCE {modseq})");
        let session = self.conn.session_mut();
        let raw = session
            .run_command_and_read_response(&command)
            .await
            .map_err(|e| self.protocol_error(e))?;
        let records = parse_fetch_responses(&raw);

        let mut out = Vec::new();
        let mut incomplete = Vec::new();
        for record in records {
            let Some(uid) = record.u32("UID") else { continue };
            let Some(flags_atom) = record.atom("FLAGS") else {
                incomplete.push(uid);
                continue;
            };
            let gmail = GmailFlags {
                flags: parse_flag_atoms(flags_atom),
                labels: gmail_labels_of(&record),
                g_thrid: None,
                g_msgid: None,
            };
            out.push((
                uid,
                FetchedFlags::Gmail {
                    gmail,
                    modseq: record.u64("MODSEQ"),
                },
            ));
        }

        // Some servers occasionally omit FLAGS/X-GM-LABELS on an
        // unsolicited CHANGEDSINCE response; re-fetch those UIDs
        // individually rather than silently dropping them.
        for uid in incomplete {
            if let Ok(rows) = self.flags(&[uid]).await {
                out.extend(rows);
            }
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
        let op = if starred { "+FLAGS" } else { "-FLAGS" };
        let seq = uid_sequence_set(uids);
        let query = format!("{op} (\\Flagged)");
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
        Ok(())
    }

    async fn set_unread(&mut self, uids: &[u32], unread: bool) -> Result<()> {
        let op = if unread { "-FLAGS" } else { "+FLAGS" };
        let seq = uid_sequence_set(uids);
        let query = format!("{op} (\\Seen)");
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
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flag_atoms_into_bitflags() {
        assert_eq!(parse_flag_atoms("\\Seen \\Flagged"), Flags::SEEN | Flags::FLAGGED);
        assert_eq!(parse_flag_atoms(""), Flags::empty());
    }

    #[test]
    fn label_quoting_escapes_backslash_and_quote() {
        let encoded = "a\\b\"c";
        let quoted = encoded.replace('\\', "\\\\").replace('"', "\\\"");
        assert_eq!(quoted, "a\\\\b\\\"c");
    }

    #[test]
    fn gmail_labels_decoded_from_fetch_record() {
        let raw = b"* 1 FETCH (UID 1 X-GM-LABELS (\"\\\\Important\" \"Some Label\"))\r\n";
        let records = parse_fetch_responses(raw);
        let labels = gmail_labels_of(&records[0]);
        assert_eq!(labels, vec!["\\Important", "Some Label"]);
    }
}
