//! Cross-folder message deduplication (spec.md §4.6 step 3, invariant
//! in §8: two `ImapUid`s with equal `SHA-256(body)` share one `Message`).
//! Factored out of the Folder Sync Engine so the lookup-or-create
//! decision is independently testable against a fake store.

use mail_parser::MessageParser;

use crate::error::Result;
use crate::mail::crispin::FetchedMessage;
use crate::mail::types::{content_hash, AccountId, Message};
use crate::store::MessageStore;

/// Pulls subject/from/message-id out of a full RFC 5322 body, for the
/// summary fields `Message` carries alongside its content hash. A
/// truncated or unparseable body yields empty/absent metadata rather
/// than an error; the hash (not these fields) is the dedup key.
fn extract_headers(body: &[u8]) -> (String, String, Option<String>) {
    let Some(parsed) = MessageParser::default().parse(body) else {
        return (String::new(), String::new(), None);
    };

    let subject = parsed.subject().unwrap_or_default().to_string();
    let from_addr = parsed
        .from()
        .and_then(|addrs| addrs.first())
        .and_then(|addr| addr.address())
        .unwrap_or_default()
        .to_string();
    let message_id = parsed.message_id().map(|id| id.to_string());

    (subject, from_addr, message_id)
}

/// Looks up the `Message` row for `fetched`'s body hash, creating one if
/// this is the first time this account has seen that exact body. Returns
/// the hash either way, since the caller (the Engine) needs it to bind
/// the new `ImapUid`.
pub async fn reconcile_message(
    store: &dyn MessageStore,
    account_id: &str,
    fetched: &FetchedMessage,
) -> Result<String> {
    let body = fetched.body.as_deref().unwrap_or(&[]);
    let hash = content_hash(body);

    if store.find_message_by_hash(account_id, &hash).await?.is_some() {
        return Ok(hash);
    }

    let (subject, from_addr, message_id) = extract_headers(body);
    let message = Message {
        hash: hash.clone(),
        account_id: AccountId(0),
        size: fetched.size,
        truncated: fetched.truncated,
        subject,
        from_addr,
        message_id,
        internaldate: fetched.internaldate,
    };
    store.insert_message(account_id, &message).await?;
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::types::{FetchedFlags, Flags};
    use crate::store::InMemoryMessageStore;

    fn fetched(body: &[u8]) -> FetchedMessage {
        FetchedMessage {
            uid: 22,
            flags: FetchedFlags::Plain { flags: Flags::empty(), modseq: None },
            body: Some(body.to_vec()),
            truncated: false,
            internaldate: None,
            size: body.len() as u32,
        }
    }

    #[tokio::test]
    async fn same_body_in_two_folders_reconciles_to_one_message_hash() {
        let store = InMemoryMessageStore::new();
        let a = reconcile_message(&store, "acct", &fetched(b"hello world")).await.unwrap();
        let b = reconcile_message(&store, "acct", &fetched(b"hello world")).await.unwrap();
        assert_eq!(a, b);
        assert!(store.find_message_by_hash("acct", &a).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn distinct_bodies_get_distinct_hashes() {
        let store = InMemoryMessageStore::new();
        let a = reconcile_message(&store, "acct", &fetched(b"one")).await.unwrap();
        let b = reconcile_message(&store, "acct", &fetched(b"two")).await.unwrap();
        assert_ne!(a, b);
    }
}
