//! `HashMap`-backed `MessageStore` for tests: no I/O, no schema, just
//! enough bookkeeping to assert on the invariants in `spec.md` §8.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::MessageStore;
use crate::error::Result;
use crate::mail::types::{AccountSyncState, Flags, FolderRole, FolderSyncStatus, Message};

#[derive(Default)]
struct State {
    folder_status: HashMap<(String, String), FolderSyncStatus>,
    folder_role: HashMap<(String, String), FolderRole>,
    uids: HashMap<(String, String), HashMap<u32, String>>,
    messages: HashMap<(String, String), Message>,
    account_state: HashMap<String, AccountSyncState>,
}

#[derive(Default)]
pub struct InMemoryMessageStore {
    state: Mutex<State>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn folder_status(&self, account_id: &str, folder_name: &str) -> Result<FolderSyncStatus> {
        let mut state = self.state.lock().unwrap();
        Ok(state
            .folder_status
            .entry((account_id.to_string(), folder_name.to_string()))
            .or_default()
            .clone())
    }

    async fn save_folder_status(
        &self,
        account_id: &str,
        folder_name: &str,
        status: &FolderSyncStatus,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .folder_status
            .insert((account_id.to_string(), folder_name.to_string()), status.clone());
        Ok(())
    }

    async fn set_folder_role(&self, account_id: &str, folder_name: &str, role: FolderRole) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .folder_role
            .insert((account_id.to_string(), folder_name.to_string()), role);
        Ok(())
    }

    async fn local_uids(&self, account_id: &str, folder_name: &str) -> Result<Vec<u32>> {
        let state = self.state.lock().unwrap();
        let mut uids: Vec<u32> = state
            .uids
            .get(&(account_id.to_string(), folder_name.to_string()))
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn purge_folder_uids(&self, account_id: &str, folder_name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .uids
            .remove(&(account_id.to_string(), folder_name.to_string()));
        Ok(())
    }

    async fn remove_uids(&self, account_id: &str, folder_name: &str, uids: &[u32]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(map) = state
            .uids
            .get_mut(&(account_id.to_string(), folder_name.to_string()))
        {
            for uid in uids {
                map.remove(uid);
            }
        }
        Ok(())
    }

    async fn find_message_by_hash(&self, account_id: &str, hash: &str) -> Result<Option<Message>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .messages
            .get(&(account_id.to_string(), hash.to_string()))
            .cloned())
    }

    async fn uid_message_hash(&self, account_id: &str, folder_name: &str, uid: u32) -> Result<Option<String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .uids
            .get(&(account_id.to_string(), folder_name.to_string()))
            .and_then(|m| m.get(&uid))
            .cloned())
    }

    async fn insert_message(&self, account_id: &str, message: &Message) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .messages
            .insert((account_id.to_string(), message.hash.clone()), message.clone());
        Ok(())
    }

    async fn upsert_imap_uid(
        &self,
        account_id: &str,
        folder_name: &str,
        uid: u32,
        _uidvalidity: u32,
        message_hash: &str,
        _flags: Flags,
        _labels: &[String],
        _modseq: Option<u64>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .uids
            .entry((account_id.to_string(), folder_name.to_string()))
            .or_default()
            .insert(uid, message_hash.to_string());
        Ok(())
    }

    async fn account_sync_state(&self, account_id: &str) -> Result<AccountSyncState> {
        let state = self.state.lock().unwrap();
        Ok(state
            .account_state
            .get(account_id)
            .copied()
            .unwrap_or(AccountSyncState::Running))
    }

    async fn set_account_sync_state(&self, account_id: &str, new_state: AccountSyncState) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.account_state.insert(account_id.to_string(), new_state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::types::AccountId;

    fn sample_message(hash: &str) -> Message {
        Message {
            hash: hash.to_string(),
            account_id: AccountId(1),
            size: 10,
            truncated: false,
            subject: String::new(),
            from_addr: String::new(),
            message_id: None,
            internaldate: None,
        }
    }

    #[tokio::test]
    async fn dedups_uids_bound_to_the_same_message_hash() {
        let store = InMemoryMessageStore::new();
        store.insert_message("acct", &sample_message("abc")).await.unwrap();
        store
            .upsert_imap_uid("acct", "INBOX", 1, 1, "abc", Flags::empty(), &[], None)
            .await
            .unwrap();
        store
            .upsert_imap_uid("acct", "[Gmail]/Trash", 1, 1, "abc", Flags::empty(), &[], None)
            .await
            .unwrap();

        let found = store.find_message_by_hash("acct", "abc").await.unwrap();
        assert!(found.is_some());
        assert_eq!(store.local_uids("acct", "INBOX").await.unwrap(), vec![1]);
        assert_eq!(store.local_uids("acct", "[Gmail]/Trash").await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn purge_folder_uids_clears_only_that_folder() {
        let store = InMemoryMessageStore::new();
        store
            .upsert_imap_uid("acct", "INBOX", 1, 1, "abc", Flags::empty(), &[], None)
            .await
            .unwrap();
        store
            .upsert_imap_uid("acct", "Sent", 2, 1, "def", Flags::empty(), &[], None)
            .await
            .unwrap();

        store.purge_folder_uids("acct", "INBOX").await.unwrap();
        assert!(store.local_uids("acct", "INBOX").await.unwrap().is_empty());
        assert_eq!(store.local_uids("acct", "Sent").await.unwrap(), vec![2]);
    }
}
