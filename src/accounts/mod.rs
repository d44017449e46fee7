//! Account model and the registration state machine.
//!
//! An account moves `Unregistered -> Requested -> Completed`, with
//! `Requested -> Failed` when the server's response is rejected (e.g. its
//! membership bundle fails verification). The absence of a stored row is the
//! canonical `Unregistered` state; the variant exists so the transition
//! table is total.

use std::sync::Arc;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroize;

use crate::identity::{verify_bundle_now, BundleError, VerifiedMember, LETRO_ORG_OID};
use crate::protocol::codec::{self, CodecError};
use crate::protocol::message::{AccountCreationRequest, AccountCreationResponse, Message};
use crate::storage::{AccountStore, ContactStore, StorageError};
use crate::transport::{GatewayError, MessageGateway};

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("Registration already requested for {0}")]
    AlreadyRequested(String),
    #[error("No pending account matches {0}")]
    AccountNotFound(String),
    #[error(transparent)]
    Identity(#[from] BundleError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

pub type Result<T> = std::result::Result<T, RegistrationError>;

/// Registration status of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AccountStatus {
    #[default]
    Unregistered,
    Requested,
    Completed,
    Failed,
}

impl AccountStatus {
    /// The allowed-transition table. Everything not listed is forbidden.
    pub fn can_transition_to(self, next: AccountStatus) -> bool {
        matches!(
            (self, next),
            (AccountStatus::Unregistered, AccountStatus::Requested)
                | (AccountStatus::Requested, AccountStatus::Completed)
                | (AccountStatus::Requested, AccountStatus::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Unregistered => "UNREGISTERED",
            AccountStatus::Requested => "REQUESTED",
            AccountStatus::Completed => "COMPLETED",
            AccountStatus::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "REQUESTED" => AccountStatus::Requested,
            "COMPLETED" => AccountStatus::Completed,
            "FAILED" => AccountStatus::Failed,
            _ => AccountStatus::Unregistered,
        }
    }
}

/// A persisted account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// The member id as originally requested (`username@domain`). Store key;
    /// responses are matched against this.
    pub requested_member_id: String,
    /// The effective member id. Equals the requested id until a response
    /// assigns a different one.
    pub member_id: String,
    pub requested_username: String,
    pub domain: String,
    pub locale: String,
    pub status: AccountStatus,
    /// At most one account across the store has this set.
    pub is_current: bool,
    pub created_at: i64,
    /// Ed25519 secret seed (32 bytes). Zeroized on drop.
    pub signing_key_seed: Vec<u8>,
}

impl Account {
    pub fn new(username: &str, domain: &str, locale: &str, signing_key_seed: Vec<u8>) -> Self {
        use chrono::Utc;

        let requested_member_id = format!("{username}@{domain}");
        Self {
            requested_member_id: requested_member_id.clone(),
            member_id: requested_member_id,
            requested_username: username.to_string(),
            domain: domain.to_string(),
            locale: locale.to_string(),
            status: AccountStatus::Unregistered,
            is_current: false,
            created_at: Utc::now().timestamp(),
            signing_key_seed,
        }
    }

    /// The account's Ed25519 public key, derived from the stored seed.
    pub fn public_key(&self) -> Option<[u8; 32]> {
        let seed: [u8; 32] = self.signing_key_seed.clone().try_into().ok()?;
        Some(SigningKey::from_bytes(&seed).verifying_key().to_bytes())
    }

    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl Drop for Account {
    fn drop(&mut self) {
        self.signing_key_seed.zeroize();
    }
}

/// Drives accounts through the registration handshake.
pub struct RegistrationManager<S, C, G> {
    accounts: Arc<S>,
    contacts: Arc<C>,
    gateway: Arc<G>,
    /// Endpoint id of the well-known registration server.
    registration_endpoint_id: String,
}

impl<S, C, G> RegistrationManager<S, C, G>
where
    S: AccountStore,
    C: ContactStore,
    G: MessageGateway,
{
    pub fn new(
        accounts: Arc<S>,
        contacts: Arc<C>,
        gateway: Arc<G>,
        registration_endpoint_id: String,
    ) -> Self {
        Self {
            accounts,
            contacts,
            gateway,
            registration_endpoint_id,
        }
    }

    /// Request a new account `username@domain`.
    ///
    /// Persists the account as `Requested` before emitting the
    /// account-creation request. Fails with
    /// [`RegistrationError::AlreadyRequested`] when an account for that id
    /// already exists in any status other than `Unregistered`.
    pub async fn request_registration(
        &self,
        username: &str,
        domain: &str,
        locale: &str,
    ) -> Result<Account> {
        let requested_member_id = format!("{username}@{domain}");
        if let Some(existing) = self.accounts.get(&requested_member_id).await? {
            if existing.status != AccountStatus::Unregistered {
                return Err(RegistrationError::AlreadyRequested(requested_member_id));
            }
        }

        let signing_key = SigningKey::generate(&mut OsRng);
        let member_public_key = signing_key.verifying_key().to_bytes();

        let mut account = Account::new(username, domain, locale, signing_key.to_bytes().to_vec());
        account.status = AccountStatus::Requested;
        // The first account becomes current.
        account.is_current = self.accounts.get_current().await?.is_none();

        // Encode before persisting so an unencodable username leaves no row.
        let payload = codec::encode(&Message::AccountCreationRequest(AccountCreationRequest {
            requested_username: username.to_string(),
            domain: domain.to_string(),
            locale: locale.to_string(),
            member_public_key,
        }))?;

        self.accounts.upsert(account.clone()).await?;
        self.gateway
            .send(
                &self.registration_endpoint_id,
                crate::protocol::CONTENT_TYPE_ACCOUNT_CREATION_REQUEST,
                &payload,
            )
            .await?;

        log::info!("Account creation requested for {requested_member_id}");
        Ok(account)
    }

    /// Apply an account-creation response from the registration server.
    ///
    /// Idempotent: a duplicate response for an already-`Completed` account is
    /// a no-op. Fails with [`RegistrationError::AccountNotFound`] when no
    /// pending account matches.
    pub async fn handle_response(&self, response: &AccountCreationResponse) -> Result<()> {
        let mut account = self
            .accounts
            .get(&response.requested_member_id)
            .await?
            .ok_or_else(|| {
                RegistrationError::AccountNotFound(response.requested_member_id.clone())
            })?;

        match account.status {
            AccountStatus::Requested => {
                account.member_id = response.assigned_member_id.clone();
                account.status = AccountStatus::Completed;
                self.accounts.upsert(account).await?;
                log::info!(
                    "Account {} completed as {}",
                    response.requested_member_id,
                    response.assigned_member_id
                );
                Ok(())
            }
            AccountStatus::Completed => {
                if account.member_id == response.assigned_member_id {
                    log::debug!(
                        "Duplicate account-creation response for {} ignored",
                        response.requested_member_id
                    );
                } else {
                    log::warn!(
                        "Account-creation response for {} assigns {} but {} is already recorded",
                        response.requested_member_id,
                        response.assigned_member_id,
                        account.member_id
                    );
                }
                Ok(())
            }
            AccountStatus::Failed => {
                log::debug!(
                    "Account-creation response for failed account {} discarded",
                    response.requested_member_id
                );
                Ok(())
            }
            AccountStatus::Unregistered => Err(RegistrationError::AccountNotFound(
                response.requested_member_id.clone(),
            )),
        }
    }

    /// Verify the membership bundle the registration server issues for a
    /// newly created account.
    ///
    /// The bundle must verify against the Letro organization OID at the
    /// current instant and attest the account's effective member id. A
    /// rejected bundle fails the pending registration and surfaces the
    /// verification error to the caller.
    pub async fn verify_registration_bundle(
        &self,
        requested_member_id: &str,
        bundle_bytes: &[u8],
    ) -> Result<VerifiedMember> {
        let account = self
            .accounts
            .get(requested_member_id)
            .await?
            .ok_or_else(|| RegistrationError::AccountNotFound(requested_member_id.to_string()))?;

        let verified = match verify_bundle_now(bundle_bytes, LETRO_ORG_OID) {
            Ok(member) if member.member_id == account.member_id => member,
            Ok(member) => {
                log::warn!(
                    "Membership bundle for {} attests {} instead",
                    account.member_id,
                    member.member_id
                );
                self.fail_registration(requested_member_id).await?;
                return Err(BundleError::InvalidBundle("member id mismatch").into());
            }
            Err(error) => {
                self.fail_registration(requested_member_id).await?;
                return Err(error.into());
            }
        };

        log::info!("Membership of {} verified", account.member_id);
        Ok(verified)
    }

    /// Mark a pending registration as failed (e.g. the server response's
    /// membership bundle was rejected by the identity verifier).
    pub async fn fail_registration(&self, requested_member_id: &str) -> Result<()> {
        let mut account = self
            .accounts
            .get(requested_member_id)
            .await?
            .ok_or_else(|| RegistrationError::AccountNotFound(requested_member_id.to_string()))?;

        if account.status.can_transition_to(AccountStatus::Failed) {
            account.status = AccountStatus::Failed;
            self.accounts.upsert(account).await?;
            log::warn!("Registration of {requested_member_id} failed");
        } else {
            log::debug!(
                "fail_registration on {} in status {} ignored",
                requested_member_id,
                account.status.as_str()
            );
        }
        Ok(())
    }

    /// Flip the single `is_current` flag to the given account.
    pub async fn make_current(&self, requested_member_id: &str) -> Result<()> {
        self.accounts.make_current(requested_member_id).await?;
        Ok(())
    }

    /// Destroy an account and cascade to its contacts.
    pub async fn delete_account(&self, requested_member_id: &str) -> Result<()> {
        let Some(account) = self.accounts.get(requested_member_id).await? else {
            log::debug!("delete_account: no account for {requested_member_id}");
            return Ok(());
        };
        self.contacts.delete_all_for(&account.member_id).await?;
        self.accounts.delete(requested_member_id).await?;
        log::info!("Account {requested_member_id} deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CONTENT_TYPE_ACCOUNT_CREATION_REQUEST;
    use crate::storage::{MemoryAccountStore, MemoryContactStore};
    use crate::transport::MockGateway;

    fn manager() -> (
        RegistrationManager<MemoryAccountStore, MemoryContactStore, MockGateway>,
        Arc<MemoryAccountStore>,
        Arc<MockGateway>,
    ) {
        let accounts = Arc::new(MemoryAccountStore::new());
        let contacts = Arc::new(MemoryContactStore::new());
        let gateway = Arc::new(MockGateway::new());
        let manager = RegistrationManager::new(
            accounts.clone(),
            contacts.clone(),
            gateway.clone(),
            "registration-server".to_string(),
        );
        (manager, accounts, gateway)
    }

    #[test]
    fn test_status_transition_table() {
        use AccountStatus::*;
        assert!(Unregistered.can_transition_to(Requested));
        assert!(Requested.can_transition_to(Completed));
        assert!(Requested.can_transition_to(Failed));

        assert!(!Unregistered.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Requested));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Completed));
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            AccountStatus::Unregistered,
            AccountStatus::Requested,
            AccountStatus::Completed,
            AccountStatus::Failed,
        ] {
            assert_eq!(AccountStatus::from_str(status.as_str()), status);
        }
    }

    #[tokio::test]
    async fn test_request_persists_then_emits() {
        let (manager, accounts, gateway) = manager();

        let account = manager
            .request_registration("alice", "example.com", "en-GB")
            .await
            .unwrap();
        assert_eq!(account.status, AccountStatus::Requested);
        assert!(account.is_current);

        let stored = accounts.get("alice@example.com").await.unwrap().unwrap();
        assert_eq!(stored.status, AccountStatus::Requested);

        let sent = gateway.take_sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].endpoint_id, "registration-server");
        assert_eq!(sent[0].content_type, CONTENT_TYPE_ACCOUNT_CREATION_REQUEST);

        let decoded = codec::decode(&sent[0].content_type, &sent[0].payload).unwrap();
        match decoded {
            Message::AccountCreationRequest(req) => {
                assert_eq!(req.requested_username, "alice");
                assert_eq!(req.domain, "example.com");
                assert_eq!(req.member_public_key, account.public_key().unwrap());
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_second_request_is_rejected() {
        let (manager, _, _) = manager();
        manager
            .request_registration("alice", "example.com", "en-GB")
            .await
            .unwrap();

        let err = manager
            .request_registration("alice", "example.com", "en-GB")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistrationError::AlreadyRequested(_)));
    }

    #[tokio::test]
    async fn test_response_completes_account() {
        let (manager, accounts, _) = manager();
        manager
            .request_registration("alice", "example.com", "en-GB")
            .await
            .unwrap();

        manager
            .handle_response(&AccountCreationResponse {
                requested_member_id: "alice@example.com".into(),
                assigned_member_id: "alice2@example.com".into(),
            })
            .await
            .unwrap();

        let account = accounts.get("alice@example.com").await.unwrap().unwrap();
        assert_eq!(account.status, AccountStatus::Completed);
        assert_eq!(account.member_id, "alice2@example.com");
    }

    #[tokio::test]
    async fn test_duplicate_response_is_noop() {
        let (manager, accounts, _) = manager();
        manager
            .request_registration("alice", "example.com", "en-GB")
            .await
            .unwrap();

        let response = AccountCreationResponse {
            requested_member_id: "alice@example.com".into(),
            assigned_member_id: "alice2@example.com".into(),
        };
        manager.handle_response(&response).await.unwrap();
        manager.handle_response(&response).await.unwrap();

        let account = accounts.get("alice@example.com").await.unwrap().unwrap();
        assert_eq!(account.status, AccountStatus::Completed);
        assert_eq!(account.member_id, "alice2@example.com");
    }

    #[tokio::test]
    async fn test_response_without_pending_account() {
        let (manager, _, _) = manager();
        let err = manager
            .handle_response(&AccountCreationResponse {
                requested_member_id: "ghost@example.com".into(),
                assigned_member_id: "ghost@example.com".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RegistrationError::AccountNotFound(_)));
    }

    #[tokio::test]
    async fn test_fail_registration() {
        let (manager, accounts, _) = manager();
        manager
            .request_registration("alice", "example.com", "en-GB")
            .await
            .unwrap();

        manager.fail_registration("alice@example.com").await.unwrap();
        let account = accounts.get("alice@example.com").await.unwrap().unwrap();
        assert_eq!(account.status, AccountStatus::Failed);

        // A late response for the failed account is discarded, not applied.
        manager
            .handle_response(&AccountCreationResponse {
                requested_member_id: "alice@example.com".into(),
                assigned_member_id: "alice2@example.com".into(),
            })
            .await
            .unwrap();
        let account = accounts.get("alice@example.com").await.unwrap().unwrap();
        assert_eq!(account.status, AccountStatus::Failed);
    }

    #[tokio::test]
    async fn test_registration_bundle_verifies_assigned_member() {
        use crate::identity::{MemberIdBundle, LETRO_ORG_OID};
        use ed25519_dalek::SigningKey;
        use rand::rngs::OsRng;

        let (manager, _, _) = manager();
        manager
            .request_registration("alice", "example.com", "en-GB")
            .await
            .unwrap();
        manager
            .handle_response(&AccountCreationResponse {
                requested_member_id: "alice@example.com".into(),
                assigned_member_id: "alice2@example.com".into(),
            })
            .await
            .unwrap();

        let org = SigningKey::generate(&mut OsRng);
        let member = SigningKey::generate(&mut OsRng);
        let now = chrono::Utc::now().timestamp();
        let bundle = MemberIdBundle::issue(
            &org,
            &member,
            LETRO_ORG_OID,
            "alice2@example.com",
            now - 60,
            now + 3600,
        );

        let verified = manager
            .verify_registration_bundle("alice@example.com", &bundle.serialize().unwrap())
            .await
            .unwrap();
        assert_eq!(verified.member_id, "alice2@example.com");
    }

    #[tokio::test]
    async fn test_rejected_bundle_fails_pending_registration() {
        use crate::identity::{MemberIdBundle, LETRO_ORG_OID};
        use ed25519_dalek::SigningKey;
        use rand::rngs::OsRng;

        let (manager, accounts, _) = manager();
        manager
            .request_registration("alice", "example.com", "en-GB")
            .await
            .unwrap();

        // Bundle rooted at a foreign organization tree.
        let org = SigningKey::generate(&mut OsRng);
        let member = SigningKey::generate(&mut OsRng);
        let now = chrono::Utc::now().timestamp();
        let bundle = MemberIdBundle::issue(
            &org,
            &member,
            "1.2.3.4",
            "alice@example.com",
            now - 60,
            now + 3600,
        );

        let err = manager
            .verify_registration_bundle("alice@example.com", &bundle.serialize().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistrationError::Identity(_)));

        let account = accounts.get("alice@example.com").await.unwrap().unwrap();
        assert_eq!(account.status, AccountStatus::Failed);
    }

    #[tokio::test]
    async fn test_only_first_account_is_current() {
        let (manager, _, _) = manager();
        let alice = manager
            .request_registration("alice", "example.com", "en-GB")
            .await
            .unwrap();
        let bob = manager
            .request_registration("bob", "example.com", "en-GB")
            .await
            .unwrap();
        assert!(alice.is_current);
        assert!(!bob.is_current);
    }

    #[tokio::test]
    async fn test_delete_account_cascades_contacts() {
        let accounts = Arc::new(MemoryAccountStore::new());
        let contacts = Arc::new(MemoryContactStore::new());
        let gateway = Arc::new(MockGateway::new());
        let manager = RegistrationManager::new(
            accounts.clone(),
            contacts.clone(),
            gateway,
            "registration-server".to_string(),
        );

        manager
            .request_registration("alice", "example.com", "en-GB")
            .await
            .unwrap();
        contacts
            .upsert(crate::contacts::Contact::new(
                "alice@example.com",
                "bob@example.com",
                None,
            ))
            .await
            .unwrap();

        manager.delete_account("alice@example.com").await.unwrap();

        assert!(accounts.get("alice@example.com").await.unwrap().is_none());
        assert!(contacts.all_for("alice@example.com").await.unwrap().is_empty());
    }
}
