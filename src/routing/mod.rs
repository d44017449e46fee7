//! Inbound message routing.
//!
//! The router is the single entry point for bytes delivered by the gateway:
//! decode by declared content type, dispatch to exactly one state machine,
//! and fail closed. Nothing that comes in over the wire can make `route`
//! return an error — malformed payloads, unknown tags, and handler failures
//! are logged and the message is dropped, leaving persisted state untouched.
//!
//! Transitions are serialized per record key: one in-flight transition per
//! (owner, counterpart) contact and per pending registration at a time. The
//! key lock is released before any outbound send completes its round trip —
//! emission is fire-and-forget once the new state is committed.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::accounts::{Account, RegistrationManager};
use crate::contacts::{EndpointAuthorization, PairingManager};
use crate::protocol::codec::{self, CodecError};
use crate::protocol::message::Message;
use crate::storage::{AccountStore, ContactStore};
use crate::transport::MessageGateway;

/// Dispatches inbound messages to the registration and pairing engines.
pub struct MessageRouter<S, C, G> {
    accounts: Arc<S>,
    registration: RegistrationManager<S, C, G>,
    pairing: PairingManager<C, G>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<S, C, G> MessageRouter<S, C, G>
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
        pairing_endpoint_id: String,
    ) -> Self {
        let registration = RegistrationManager::new(
            accounts.clone(),
            contacts.clone(),
            gateway.clone(),
            registration_endpoint_id,
        );
        let pairing = PairingManager::new(contacts, gateway, pairing_endpoint_id);
        Self {
            accounts,
            registration,
            pairing,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn registration(&self) -> &RegistrationManager<S, C, G> {
        &self.registration
    }

    pub fn pairing(&self) -> &PairingManager<C, G> {
        &self.pairing
    }

    /// Process one inbound `(content type, payload)` pair from the gateway.
    ///
    /// Never returns an error: decoding failures and handler failures are
    /// logged and the message is discarded. Unknown content types are
    /// discarded silently at debug level so future message kinds never crash
    /// an old client.
    pub async fn route(&self, content_type: &str, payload: &[u8]) {
        let message = match codec::decode(content_type, payload) {
            Ok(message) => message,
            Err(CodecError::UnknownContentType(tag)) => {
                log::debug!("Unknown content type {tag} discarded");
                return;
            }
            Err(error) => {
                log::warn!("Undecodable {content_type} message discarded: {error}");
                return;
            }
        };

        match message {
            Message::AccountCreationResponse(response) => {
                let key = format!("account:{}", response.requested_member_id);
                let _guard = self.lock_for(key).await;
                if let Err(error) = self.registration.handle_response(&response).await {
                    log::warn!(
                        "Account-creation response for {} dropped: {error}",
                        response.requested_member_id
                    );
                }
            }
            Message::AccountCreationRequest(_) => {
                // Server-side kind; a client should never receive one.
                log::warn!("Inbound account-creation request discarded");
            }
            Message::PairingRequest(request) => {
                let Some(owner) = self.current_account().await else {
                    return;
                };
                let key = contact_key(&owner.member_id, &request.requester_member_id);
                let _guard = self.lock_for(key).await;
                if let Err(error) = self.pairing.handle_request(&owner, &request).await {
                    log::warn!(
                        "Pairing request from {} dropped: {error}",
                        request.requester_member_id
                    );
                }
            }
            Message::PairingMatch(m) => {
                let Some(owner) = self.current_account().await else {
                    return;
                };
                let key = contact_key(&owner.member_id, &m.target_member_id);
                let _guard = self.lock_for(key).await;
                if let Err(error) = self.pairing.handle_match(&owner, &m).await {
                    log::warn!("Pairing match from {} dropped: {error}", m.target_member_id);
                }
            }
            Message::PairingAuthorization(authorization) => {
                let Some(owner) = self.current_account().await else {
                    return;
                };
                // Peek at the issuer for the lock key; the handler re-checks
                // the payload in full.
                let key = match EndpointAuthorization::deserialize(&authorization.payload) {
                    Ok(auth) => contact_key(&owner.member_id, &auth.issuer_member_id),
                    Err(_) => format!("contact:{}:", owner.member_id),
                };
                let _guard = self.lock_for(key).await;
                if let Err(error) = self.pairing.handle_authorization(&owner, &authorization).await
                {
                    log::warn!("Pairing authorization dropped: {error}");
                }
            }
        }
    }

    async fn current_account(&self) -> Option<Account> {
        match self.accounts.get_current().await {
            Ok(Some(account)) => Some(account),
            Ok(None) => {
                log::warn!("Inbound pairing message discarded: no current account");
                None
            }
            Err(error) => {
                log::warn!("Inbound message discarded: account lookup failed: {error}");
                None
            }
        }
    }

    async fn lock_for(&self, key: String) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        lock.lock_owned().await
    }
}

fn contact_key(owner: &str, counterpart: &str) -> String {
    format!("contact:{owner}:{counterpart}")
}
