//! Contact model and the pairing state machine.
//!
//! A contact moves `Unpaired -> RequestSent -> Match -> AuthorizationSent ->
//! Complete` on the requester side and `Unpaired -> Match -> Complete` on the
//! responder side. Status only ever moves forward; every transition is
//! checked against the allowed-transition table before it is persisted.
//!
//! The engine is purely reactive: it persists a transition, then emits the
//! outbound message the handshake calls for. Malformed or out-of-order
//! messages are logged and dropped without touching the stored status;
//! transport retry is the gateway's concern.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use lru::LruCache;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use thiserror::Error;
use zeroize::Zeroize;

use crate::accounts::Account;
use crate::protocol::codec::{self, CodecError};
use crate::protocol::message::{Message, PairingAuthorization, PairingMatch, PairingRequest};
use crate::protocol::{CONTENT_TYPE_PAIRING_AUTH, CONTENT_TYPE_PAIRING_MATCH};
use crate::storage::{ContactStore, StorageError};
use crate::transport::{endpoint_id_for_key, Endpoint, GatewayError, MessageGateway};

#[derive(Error, Debug)]
pub enum PairingError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

pub type Result<T> = std::result::Result<T, PairingError>;

/// Pairing status of a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ContactPairingStatus {
    #[default]
    Unpaired,
    RequestSent,
    Match,
    AuthorizationSent,
    Complete,
}

impl ContactPairingStatus {
    /// The allowed-transition table. `Unpaired -> Match` is the responder
    /// path (a request was received, not sent); everything else is strictly
    /// sequential and nothing moves backward.
    pub fn can_transition_to(self, next: ContactPairingStatus) -> bool {
        use ContactPairingStatus::*;
        matches!(
            (self, next),
            (Unpaired, RequestSent)
                | (Unpaired, Match)
                | (RequestSent, Match)
                | (Match, AuthorizationSent)
                | (Match, Complete)
                | (AuthorizationSent, Complete)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == ContactPairingStatus::Complete
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContactPairingStatus::Unpaired => "UNPAIRED",
            ContactPairingStatus::RequestSent => "REQUEST_SENT",
            ContactPairingStatus::Match => "MATCH",
            ContactPairingStatus::AuthorizationSent => "AUTHORIZATION_SENT",
            ContactPairingStatus::Complete => "COMPLETE",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "REQUEST_SENT" => ContactPairingStatus::RequestSent,
            "MATCH" => ContactPairingStatus::Match,
            "AUTHORIZATION_SENT" => ContactPairingStatus::AuthorizationSent,
            "COMPLETE" => ContactPairingStatus::Complete,
            _ => ContactPairingStatus::Unpaired,
        }
    }
}

/// A persisted contact relationship, unique per (owner, counterpart).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub owner_member_id: String,
    pub counterpart_member_id: String,
    pub alias: Option<String>,
    /// Secret seed of the endpoint minted for this pairing. Zeroized on drop.
    pub own_endpoint_key_seed: Option<Vec<u8>>,
    pub counterpart_endpoint_id: Option<String>,
    pub counterpart_endpoint_public_key: Option<[u8; 32]>,
    pub status: ContactPairingStatus,
    pub created_at: i64,
}

impl Contact {
    pub fn new(owner_member_id: &str, counterpart_member_id: &str, alias: Option<String>) -> Self {
        use chrono::Utc;

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_member_id: owner_member_id.to_string(),
            counterpart_member_id: counterpart_member_id.to_string(),
            alias,
            own_endpoint_key_seed: None,
            counterpart_endpoint_id: None,
            counterpart_endpoint_public_key: None,
            status: ContactPairingStatus::Unpaired,
            created_at: Utc::now().timestamp(),
        }
    }

    /// Rebuild the endpoint minted for this pairing, if one exists.
    pub fn own_endpoint(&self) -> Option<Endpoint> {
        let seed: [u8; 32] = self.own_endpoint_key_seed.clone()?.try_into().ok()?;
        Some(Endpoint::from_seed(seed))
    }

    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl Drop for Contact {
    fn drop(&mut self) {
        if let Some(seed) = self.own_endpoint_key_seed.as_mut() {
            seed.zeroize();
        }
    }
}

/// The opaque payload of a pairing-authorization message: the issuer hands
/// the peer a signed statement that the peer's endpoint key is authorized to
/// message the issuer's endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointAuthorization {
    pub issuer_member_id: String,
    pub issuer_endpoint_id: String,
    pub peer_endpoint_public_key: [u8; 32],
    pub issued_at: i64,
    #[serde(with = "BigArray")]
    pub signature: [u8; 64],
}

impl EndpointAuthorization {
    pub fn serialize(&self) -> std::result::Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn deserialize(data: &[u8]) -> std::result::Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    pub fn serialize_for_signing(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(self.issuer_member_id.as_bytes());
        data.push(0);
        data.extend_from_slice(self.issuer_endpoint_id.as_bytes());
        data.push(0);
        data.extend_from_slice(&self.peer_endpoint_public_key);
        data.extend_from_slice(&self.issued_at.to_le_bytes());
        data
    }

    /// Issue an authorization signed by `endpoint`'s key.
    pub fn issue(
        endpoint: &Endpoint,
        issuer_member_id: &str,
        peer_endpoint_public_key: [u8; 32],
    ) -> Self {
        use chrono::Utc;

        let mut auth = Self {
            issuer_member_id: issuer_member_id.to_string(),
            issuer_endpoint_id: endpoint.id.clone(),
            peer_endpoint_public_key,
            issued_at: Utc::now().timestamp(),
            signature: [0u8; 64],
        };
        auth.signature = endpoint.sign(&auth.serialize_for_signing());
        auth
    }

    /// Verify the signature against the issuer's endpoint public key.
    pub fn verify(&self, issuer_public_key: &[u8; 32]) -> bool {
        use ed25519_dalek::{Signature, Verifier, VerifyingKey};

        let Ok(key) = VerifyingKey::from_bytes(issuer_public_key) else {
            return false;
        };
        let signature = Signature::from_bytes(&self.signature);
        key.verify(&self.serialize_for_signing(), &signature).is_ok()
    }
}

// ---------------------------------------------------------------------------
// Redelivery / anomaly cache
// ---------------------------------------------------------------------------

type DeliveryKey = (String, String);

/// LRU of the last payload hash seen per completed contact.
/// Capacity: 4,096 entries (most recently active contacts).
static PAYLOAD_CACHE: Lazy<StdMutex<LruCache<DeliveryKey, [u8; 32]>>> = Lazy::new(|| {
    let capacity = NonZeroUsize::new(4_096).unwrap();
    StdMutex::new(LruCache::new(capacity))
});

enum Redelivery {
    First,
    Duplicate,
    Divergent,
}

/// Record a delivery for a (owner, counterpart) pair and classify it against
/// the previously recorded payload hash.
fn note_delivery(owner: &str, counterpart: &str, payload: &[u8]) -> Redelivery {
    let mut cache = PAYLOAD_CACHE.lock().unwrap();
    let key = (owner.to_string(), counterpart.to_string());
    let hash = *blake3::hash(payload).as_bytes();

    let seen = cache.peek(&key).copied();
    match seen {
        Some(seen) if seen == hash => Redelivery::Duplicate,
        Some(_) => Redelivery::Divergent,
        None => {
            cache.put(key, hash);
            Redelivery::First
        }
    }
}

/// Handle a message addressed to an already-`Complete` contact: byte-identical
/// redeliveries are ignored at debug level, divergent payloads are logged as
/// anomalies. Never an error, never a status change.
fn note_completed_delivery(owner: &str, counterpart: &str, payload: &[u8]) {
    match note_delivery(owner, counterpart, payload) {
        Redelivery::Duplicate | Redelivery::First => {
            log::debug!("Redelivery for completed contact {owner} <-> {counterpart} ignored");
        }
        Redelivery::Divergent => {
            log::warn!(
                "Divergent payload for completed contact {owner} <-> {counterpart} (anomaly)"
            );
        }
    }
}

#[cfg(test)]
pub(crate) fn clear_payload_cache() {
    PAYLOAD_CACHE.lock().unwrap().clear();
}

// ---------------------------------------------------------------------------
// Pairing engine
// ---------------------------------------------------------------------------

/// Drives contacts through the pairing handshake.
pub struct PairingManager<C, G> {
    contacts: Arc<C>,
    gateway: Arc<G>,
    /// Endpoint id of the well-known pairing broker that forwards requests
    /// to members we hold no endpoint for yet.
    pairing_endpoint_id: String,
}

impl<C, G> PairingManager<C, G>
where
    C: ContactStore,
    G: MessageGateway,
{
    pub fn new(contacts: Arc<C>, gateway: Arc<G>, pairing_endpoint_id: String) -> Self {
        Self {
            contacts,
            gateway,
            pairing_endpoint_id,
        }
    }

    /// Advance a contact's status through the transition table. Returns false
    /// (and logs) when the transition is not allowed.
    fn advance(contact: &mut Contact, next: ContactPairingStatus) -> bool {
        if contact.status.can_transition_to(next) {
            contact.status = next;
            true
        } else {
            log::warn!(
                "Illegal pairing transition {} -> {} for {} <-> {} refused",
                contact.status.as_str(),
                next.as_str(),
                contact.owner_member_id,
                contact.counterpart_member_id
            );
            false
        }
    }

    /// Start pairing with another member.
    ///
    /// Persists the contact as `RequestSent`, then emits a pairing request
    /// via the broker. Re-requesting an in-flight pairing is an idempotent
    /// no-op returning the stored contact.
    pub async fn request_pairing(
        &self,
        owner: &Account,
        counterpart_member_id: &str,
        alias: Option<String>,
    ) -> Result<Contact> {
        let existing = self
            .contacts
            .get(&owner.member_id, counterpart_member_id)
            .await?;
        if let Some(contact) = existing {
            if contact.status != ContactPairingStatus::Unpaired {
                log::debug!(
                    "Pairing with {counterpart_member_id} already {}; request ignored",
                    contact.status.as_str()
                );
                return Ok(contact);
            }
            return self.send_request(owner, contact).await;
        }

        let contact = Contact::new(&owner.member_id, counterpart_member_id, alias);
        self.send_request(owner, contact).await
    }

    async fn send_request(&self, owner: &Account, mut contact: Contact) -> Result<Contact> {
        let endpoint = self.gateway.register_endpoint().await?;
        contact.own_endpoint_key_seed = Some(endpoint.seed().to_vec());
        if !Self::advance(&mut contact, ContactPairingStatus::RequestSent) {
            return Ok(contact);
        }
        self.contacts.upsert(contact.clone()).await?;

        let payload = codec::encode(&Message::PairingRequest(PairingRequest {
            requester_member_id: owner.member_id.clone(),
            target_member_id: contact.counterpart_member_id.clone(),
            requester_endpoint_public_key: endpoint.public_key,
        }))?;
        self.gateway
            .send(
                &self.pairing_endpoint_id,
                crate::protocol::CONTENT_TYPE_PAIRING_REQUEST,
                &payload,
            )
            .await?;

        log::info!(
            "Pairing requested: {} -> {}",
            owner.member_id,
            contact.counterpart_member_id
        );
        Ok(contact)
    }

    /// Apply an inbound pairing request.
    ///
    /// First contact (absent or `Unpaired` record) and the crossed-request
    /// case (`RequestSent` for the same counterpart) both resolve to `Match`
    /// and answer with a pairing match — the deterministic tie-break for
    /// simultaneous mutual requests.
    pub async fn handle_request(&self, owner: &Account, request: &PairingRequest) -> Result<()> {
        if request.target_member_id != owner.member_id {
            log::warn!(
                "Pairing request for {} delivered to {}; discarded",
                request.target_member_id,
                owner.member_id
            );
            return Ok(());
        }

        let counterpart = &request.requester_member_id;
        let contact = self.contacts.get(&owner.member_id, counterpart).await?;

        let mut contact = match contact {
            None => Contact::new(&owner.member_id, counterpart, None),
            Some(c) => match c.status {
                ContactPairingStatus::Unpaired | ContactPairingStatus::RequestSent => c,
                ContactPairingStatus::Match | ContactPairingStatus::AuthorizationSent => {
                    log::debug!(
                        "Duplicate pairing request from {counterpart} in {} ignored",
                        c.status.as_str()
                    );
                    return Ok(());
                }
                ContactPairingStatus::Complete => {
                    let payload = codec::encode(&Message::PairingRequest(request.clone()))?;
                    note_completed_delivery(&owner.member_id, counterpart, &payload);
                    return Ok(());
                }
            },
        };

        // Reuse the endpoint from our own outstanding request when the
        // requests crossed in transit; mint one otherwise.
        let endpoint = match contact.own_endpoint() {
            Some(endpoint) => endpoint,
            None => {
                let endpoint = self.gateway.register_endpoint().await?;
                contact.own_endpoint_key_seed = Some(endpoint.seed().to_vec());
                endpoint
            }
        };

        let peer_endpoint_id = endpoint_id_for_key(&request.requester_endpoint_public_key);
        contact.counterpart_endpoint_id = Some(peer_endpoint_id.clone());
        contact.counterpart_endpoint_public_key = Some(request.requester_endpoint_public_key);
        if !Self::advance(&mut contact, ContactPairingStatus::Match) {
            return Ok(());
        }
        self.contacts.upsert(contact.clone()).await?;

        let payload = codec::encode(&Message::PairingMatch(PairingMatch {
            requester_member_id: counterpart.clone(),
            target_member_id: owner.member_id.clone(),
            endpoint_id: endpoint.id.clone(),
            endpoint_public_key: endpoint.public_key,
        }))?;
        self.gateway
            .send(&peer_endpoint_id, CONTENT_TYPE_PAIRING_MATCH, &payload)
            .await?;

        log::info!(
            "Pairing match sent: {} -> {}",
            owner.member_id,
            counterpart
        );
        Ok(())
    }

    /// Apply an inbound pairing match.
    ///
    /// Records the counterpart's endpoint, then hands it an authorization for
    /// our endpoint.
    pub async fn handle_match(&self, owner: &Account, m: &PairingMatch) -> Result<()> {
        if m.requester_member_id != owner.member_id {
            log::warn!(
                "Pairing match for {} delivered to {}; discarded",
                m.requester_member_id,
                owner.member_id
            );
            return Ok(());
        }
        if endpoint_id_for_key(&m.endpoint_public_key) != m.endpoint_id {
            log::warn!(
                "Pairing match from {} carries an endpoint id not derived from its key; discarded",
                m.target_member_id
            );
            return Ok(());
        }

        let counterpart = &m.target_member_id;
        let Some(mut contact) = self.contacts.get(&owner.member_id, counterpart).await? else {
            log::warn!("Pairing match from unknown counterpart {counterpart} discarded");
            return Ok(());
        };

        match contact.status {
            // RequestSent is the ordinary case; Match means the requests
            // crossed in transit and both sides already answered with a
            // match, so each proceeds to authorize the other.
            ContactPairingStatus::RequestSent | ContactPairingStatus::Match => {}
            ContactPairingStatus::AuthorizationSent => {
                log::debug!(
                    "Duplicate pairing match from {counterpart} in {} ignored",
                    contact.status.as_str()
                );
                return Ok(());
            }
            ContactPairingStatus::Complete => {
                let payload = codec::encode(&Message::PairingMatch(m.clone()))?;
                note_completed_delivery(&owner.member_id, counterpart, &payload);
                return Ok(());
            }
            ContactPairingStatus::Unpaired => {
                log::warn!("Out-of-order pairing match from {counterpart} discarded");
                return Ok(());
            }
        }

        let Some(endpoint) = contact.own_endpoint() else {
            log::warn!(
                "Contact {} <-> {counterpart} has no endpoint key; match discarded",
                owner.member_id
            );
            return Ok(());
        };

        contact.counterpart_endpoint_id = Some(m.endpoint_id.clone());
        contact.counterpart_endpoint_public_key = Some(m.endpoint_public_key);
        if contact.status == ContactPairingStatus::RequestSent
            && !Self::advance(&mut contact, ContactPairingStatus::Match)
        {
            return Ok(());
        }
        self.contacts.upsert(contact.clone()).await?;

        let authorization =
            EndpointAuthorization::issue(&endpoint, &owner.member_id, m.endpoint_public_key);
        let payload = authorization
            .serialize()
            .map_err(|_| CodecError::MalformedMessage("unencodable authorization"))?;
        self.gateway
            .send(&m.endpoint_id, CONTENT_TYPE_PAIRING_AUTH, &payload)
            .await?;

        if Self::advance(&mut contact, ContactPairingStatus::AuthorizationSent) {
            self.contacts.upsert(contact.clone()).await?;
        }

        log::info!(
            "Pairing authorization sent: {} -> {}",
            owner.member_id,
            counterpart
        );
        Ok(())
    }

    /// Apply an inbound pairing authorization.
    ///
    /// Completes the contact on either side. The responder (still in `Match`)
    /// also answers with a reciprocal authorization so the initiator can
    /// complete its own record.
    pub async fn handle_authorization(
        &self,
        owner: &Account,
        authorization: &PairingAuthorization,
    ) -> Result<()> {
        let Ok(auth) = EndpointAuthorization::deserialize(&authorization.payload) else {
            log::warn!("Malformed pairing authorization discarded");
            return Ok(());
        };

        let counterpart = &auth.issuer_member_id;
        let Some(mut contact) = self.contacts.get(&owner.member_id, counterpart).await? else {
            log::warn!("Pairing authorization from unknown counterpart {counterpart} discarded");
            return Ok(());
        };

        let reciprocate = match contact.status {
            ContactPairingStatus::Match => true,
            ContactPairingStatus::AuthorizationSent => false,
            ContactPairingStatus::Complete => {
                note_completed_delivery(&owner.member_id, counterpart, &authorization.payload);
                return Ok(());
            }
            ContactPairingStatus::Unpaired | ContactPairingStatus::RequestSent => {
                log::warn!("Out-of-order pairing authorization from {counterpart} discarded");
                return Ok(());
            }
        };

        if let Some(issuer_key) = contact.counterpart_endpoint_public_key {
            if !auth.verify(&issuer_key) {
                log::warn!(
                    "Pairing authorization from {counterpart} failed signature verification"
                );
                return Ok(());
            }
        }
        if let Some(recorded) = contact.counterpart_endpoint_id.as_deref() {
            if recorded != auth.issuer_endpoint_id {
                log::warn!(
                    "Pairing authorization from {counterpart} names endpoint {} but {} is recorded",
                    auth.issuer_endpoint_id,
                    recorded
                );
                return Ok(());
            }
        }

        if !Self::advance(&mut contact, ContactPairingStatus::Complete) {
            return Ok(());
        }
        self.contacts.upsert(contact.clone()).await?;
        self.contacts
            .record_pairing_completed(&owner.member_id, counterpart)
            .await?;
        // Seed the redelivery cache with the completing payload.
        note_delivery(&owner.member_id, counterpart, &authorization.payload);

        log::info!("Pairing complete: {} <-> {}", owner.member_id, counterpart);

        if reciprocate {
            let (Some(endpoint), Some(peer_key), Some(peer_endpoint_id)) = (
                contact.own_endpoint(),
                contact.counterpart_endpoint_public_key,
                contact.counterpart_endpoint_id.clone(),
            ) else {
                log::warn!(
                    "Contact {} <-> {counterpart} missing endpoint material; no reciprocal \
                     authorization sent",
                    owner.member_id
                );
                return Ok(());
            };
            let reciprocal = EndpointAuthorization::issue(&endpoint, &owner.member_id, peer_key);
            let payload = reciprocal
                .serialize()
                .map_err(|_| CodecError::MalformedMessage("unencodable authorization"))?;
            self.gateway
                .send(&peer_endpoint_id, CONTENT_TYPE_PAIRING_AUTH, &payload)
                .await?;
            log::debug!(
                "Reciprocal authorization sent: {} -> {}",
                owner.member_id,
                counterpart
            );
        }
        Ok(())
    }
}
