//! Storage contracts for accounts and contacts.
//!
//! The protocol core does not own a database. The host application (Room on
//! Android, SQLite elsewhere) MUST implement [`AccountStore`] and
//! [`ContactStore`]; the in-memory implementations here back the test suite
//! and document the expected semantics.
//!
//! Two semantics matter beyond plain upsert/get:
//!
//! 1. **Per-key write serialization.** The router takes one transition at a
//!    time per record key; a store only needs each individual write to be
//!    atomic.
//! 2. **Commit-ordered events.** Subscribers observe state changes in the
//!    order the writes were committed. The in-memory stores publish on a
//!    broadcast channel while still holding the write lock, which gives that
//!    ordering for free.
//!
//! Schema hint for a SQL-backed host:
//! ```sql
//! CREATE TABLE IF NOT EXISTS account (
//!   requested_member_id TEXT PRIMARY KEY,
//!   member_id           TEXT NOT NULL,
//!   status              TEXT NOT NULL,
//!   is_current          INTEGER NOT NULL DEFAULT 0,
//!   data                BLOB NOT NULL
//! );
//! CREATE TABLE IF NOT EXISTS contact (
//!   owner_member_id       TEXT NOT NULL,
//!   counterpart_member_id TEXT NOT NULL,
//!   status                TEXT NOT NULL,
//!   data                  BLOB NOT NULL,
//!   PRIMARY KEY (owner_member_id, counterpart_member_id),
//!   FOREIGN KEY (owner_member_id) REFERENCES account(member_id) ON DELETE CASCADE
//! );
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

use crate::accounts::Account;
use crate::contacts::Contact;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(String),
    #[error("No record for key: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Capacity of the event channels. Slow subscribers that fall further behind
/// than this observe a `Lagged` error from the broadcast receiver.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Change notifications from an [`AccountStore`], in commit order.
#[derive(Debug, Clone)]
pub enum AccountEvent {
    Updated(Account),
    Deleted { requested_member_id: String },
}

/// Change notifications from a [`ContactStore`], in commit order.
#[derive(Debug, Clone)]
pub enum ContactEvent {
    Updated(Contact),
    /// The pairing-completed notification record.
    PairingCompleted {
        owner_member_id: String,
        counterpart_member_id: String,
    },
    DeletedAllFor { owner_member_id: String },
}

/// Account persistence contract. Keyed by `requested_member_id`.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn upsert(&self, account: Account) -> Result<()>;

    async fn get(&self, requested_member_id: &str) -> Result<Option<Account>>;

    /// The single account with `is_current = true`, if any.
    async fn get_current(&self) -> Result<Option<Account>>;

    /// Flip `is_current` to the given account, clearing every other flag in
    /// the same committed write. Fails with [`StorageError::NotFound`] if the
    /// account does not exist.
    async fn make_current(&self, requested_member_id: &str) -> Result<()>;

    async fn all(&self) -> Result<Vec<Account>>;

    async fn delete(&self, requested_member_id: &str) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<AccountEvent>;
}

/// Contact persistence contract. Unique per (owner, counterpart) pair.
#[async_trait]
pub trait ContactStore: Send + Sync {
    async fn upsert(&self, contact: Contact) -> Result<()>;

    async fn get(&self, owner_member_id: &str, counterpart_member_id: &str)
        -> Result<Option<Contact>>;

    async fn all_for(&self, owner_member_id: &str) -> Result<Vec<Contact>>;

    /// Cascade deletion when the owning account is destroyed.
    async fn delete_all_for(&self, owner_member_id: &str) -> Result<()>;

    /// Record the pairing-completed notification event for a contact.
    async fn record_pairing_completed(
        &self,
        owner_member_id: &str,
        counterpart_member_id: &str,
    ) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<ContactEvent>;
}

// ---------------------------------------------------------------------------
// In-memory reference implementations
// ---------------------------------------------------------------------------

pub struct MemoryAccountStore {
    accounts: Mutex<HashMap<String, Account>>,
    events: broadcast::Sender<AccountEvent>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            accounts: Mutex::new(HashMap::new()),
            events,
        }
    }
}

impl Default for MemoryAccountStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn upsert(&self, account: Account) -> Result<()> {
        let mut accounts = self.accounts.lock().await;
        accounts.insert(account.requested_member_id.clone(), account.clone());
        let _ = self.events.send(AccountEvent::Updated(account));
        Ok(())
    }

    async fn get(&self, requested_member_id: &str) -> Result<Option<Account>> {
        Ok(self.accounts.lock().await.get(requested_member_id).cloned())
    }

    async fn get_current(&self) -> Result<Option<Account>> {
        Ok(self
            .accounts
            .lock()
            .await
            .values()
            .find(|a| a.is_current)
            .cloned())
    }

    async fn make_current(&self, requested_member_id: &str) -> Result<()> {
        let mut accounts = self.accounts.lock().await;
        if !accounts.contains_key(requested_member_id) {
            return Err(StorageError::NotFound(requested_member_id.to_string()));
        }
        for account in accounts.values_mut() {
            account.is_current = account.requested_member_id == requested_member_id;
        }
        let updated = accounts[requested_member_id].clone();
        let _ = self.events.send(AccountEvent::Updated(updated));
        Ok(())
    }

    async fn all(&self) -> Result<Vec<Account>> {
        Ok(self.accounts.lock().await.values().cloned().collect())
    }

    async fn delete(&self, requested_member_id: &str) -> Result<()> {
        let mut accounts = self.accounts.lock().await;
        if accounts.remove(requested_member_id).is_some() {
            let _ = self.events.send(AccountEvent::Deleted {
                requested_member_id: requested_member_id.to_string(),
            });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<AccountEvent> {
        self.events.subscribe()
    }
}

pub struct MemoryContactStore {
    contacts: Mutex<HashMap<(String, String), Contact>>,
    events: broadcast::Sender<ContactEvent>,
}

impl MemoryContactStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            contacts: Mutex::new(HashMap::new()),
            events,
        }
    }
}

impl Default for MemoryContactStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContactStore for MemoryContactStore {
    async fn upsert(&self, contact: Contact) -> Result<()> {
        let mut contacts = self.contacts.lock().await;
        let key = (
            contact.owner_member_id.clone(),
            contact.counterpart_member_id.clone(),
        );
        contacts.insert(key, contact.clone());
        let _ = self.events.send(ContactEvent::Updated(contact));
        Ok(())
    }

    async fn get(
        &self,
        owner_member_id: &str,
        counterpart_member_id: &str,
    ) -> Result<Option<Contact>> {
        let key = (owner_member_id.to_string(), counterpart_member_id.to_string());
        Ok(self.contacts.lock().await.get(&key).cloned())
    }

    async fn all_for(&self, owner_member_id: &str) -> Result<Vec<Contact>> {
        Ok(self
            .contacts
            .lock()
            .await
            .values()
            .filter(|c| c.owner_member_id == owner_member_id)
            .cloned()
            .collect())
    }

    async fn delete_all_for(&self, owner_member_id: &str) -> Result<()> {
        let mut contacts = self.contacts.lock().await;
        contacts.retain(|(owner, _), _| owner != owner_member_id);
        let _ = self.events.send(ContactEvent::DeletedAllFor {
            owner_member_id: owner_member_id.to_string(),
        });
        Ok(())
    }

    async fn record_pairing_completed(
        &self,
        owner_member_id: &str,
        counterpart_member_id: &str,
    ) -> Result<()> {
        // Holding the write lock while publishing keeps events in commit order.
        let _contacts = self.contacts.lock().await;
        let _ = self.events.send(ContactEvent::PairingCompleted {
            owner_member_id: owner_member_id.to_string(),
            counterpart_member_id: counterpart_member_id.to_string(),
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ContactEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountStatus;
    use crate::contacts::ContactPairingStatus;

    #[tokio::test]
    async fn test_account_upsert_and_get() {
        let store = MemoryAccountStore::new();
        let account = Account::new("alice", "example.com", "en-GB", vec![0u8; 32]);
        store.upsert(account.clone()).await.unwrap();

        let loaded = store.get("alice@example.com").await.unwrap().unwrap();
        assert_eq!(loaded.member_id, "alice@example.com");
        assert_eq!(loaded.status, AccountStatus::Unregistered);
        assert!(store.get("bob@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_make_current_is_exclusive() {
        let store = MemoryAccountStore::new();
        let mut alice = Account::new("alice", "example.com", "en-GB", vec![0u8; 32]);
        alice.is_current = true;
        let bob = Account::new("bob", "example.com", "en-GB", vec![0u8; 32]);
        store.upsert(alice).await.unwrap();
        store.upsert(bob).await.unwrap();

        store.make_current("bob@example.com").await.unwrap();

        let current: Vec<_> = store
            .all()
            .await
            .unwrap()
            .into_iter()
            .filter(|a| a.is_current)
            .collect();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].requested_member_id, "bob@example.com");
    }

    #[tokio::test]
    async fn test_make_current_unknown_account() {
        let store = MemoryAccountStore::new();
        assert!(matches!(
            store.make_current("ghost@example.com").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_contact_events_in_commit_order() {
        let store = MemoryContactStore::new();
        let mut events = store.subscribe();

        let mut contact = Contact::new("alice@example.com", "bob@example.com", None);
        contact.status = ContactPairingStatus::RequestSent;
        store.upsert(contact.clone()).await.unwrap();
        contact.status = ContactPairingStatus::Match;
        store.upsert(contact.clone()).await.unwrap();
        store
            .record_pairing_completed("alice@example.com", "bob@example.com")
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            ContactEvent::Updated(c) => assert_eq!(c.status, ContactPairingStatus::RequestSent),
            other => panic!("unexpected event: {other:?}"),
        }
        match events.recv().await.unwrap() {
            ContactEvent::Updated(c) => assert_eq!(c.status, ContactPairingStatus::Match),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(
            events.recv().await.unwrap(),
            ContactEvent::PairingCompleted { .. }
        ));
    }

    #[tokio::test]
    async fn test_delete_all_for_cascade() {
        let store = MemoryContactStore::new();
        store
            .upsert(Contact::new("alice@example.com", "bob@example.com", None))
            .await
            .unwrap();
        store
            .upsert(Contact::new("alice@example.com", "carol@example.com", None))
            .await
            .unwrap();
        store
            .upsert(Contact::new("dave@example.com", "bob@example.com", None))
            .await
            .unwrap();

        store.delete_all_for("alice@example.com").await.unwrap();

        assert!(store.all_for("alice@example.com").await.unwrap().is_empty());
        assert_eq!(store.all_for("dave@example.com").await.unwrap().len(), 1);
    }
}
