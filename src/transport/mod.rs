//! Transport boundary to the Awala message gateway.
//!
//! Everything in this module is **transport-agnostic** — the protocol core
//! never opens a socket. The host application implements [`MessageGateway`]
//! on top of whatever Awala binding it ships with; the core only needs two
//! capabilities: registering first-party endpoints and handing the gateway
//! an outbound service message. Delivery, retry, and store-and-forward
//! semantics all belong to the gateway.

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use thiserror::Error;
use zeroize::Zeroize;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Endpoint registration failed: {0}")]
    RegistrationFailed(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Derive the addressable endpoint id for an endpoint public key.
///
/// Endpoint ids are the first 16 bytes of the BLAKE3 hash of the public key,
/// hex-encoded. Any party holding the key can derive the id, so pairing
/// messages only ever carry the key.
pub fn endpoint_id_for_key(public_key: &[u8; 32]) -> String {
    let hash = blake3::hash(public_key);
    hex::encode(&hash.as_bytes()[..16])
}

/// A first-party endpoint: the transport-level identity the gateway routes
/// peer-to-peer messages to. One endpoint is minted per contact pairing.
pub struct Endpoint {
    /// Addressable id, derived from the public key hash.
    pub id: String,
    /// Ed25519 public key (32 bytes).
    pub public_key: [u8; 32],
    /// Ed25519 secret seed (32 bytes). Zeroized on drop.
    private_key: [u8; 32],
}

impl Endpoint {
    /// Mint a fresh endpoint with a random keypair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self::from_seed(signing_key.to_bytes())
    }

    /// Rebuild an endpoint from a stored 32-byte secret seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        let public_key = signing_key.verifying_key().to_bytes();
        Self {
            id: endpoint_id_for_key(&public_key),
            public_key,
            private_key: seed,
        }
    }

    /// Sign data with this endpoint's key.
    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        let signing_key = SigningKey::from_bytes(&self.private_key);
        signing_key.sign(data).to_bytes()
    }

    /// Expose the secret seed for persistence alongside the owning record.
    pub fn seed(&self) -> [u8; 32] {
        self.private_key
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Endpoint({})", self.id)
    }
}

/// Gateway contract the host application implements.
///
/// Outbound sends are fire-and-forget from the protocol core's perspective:
/// once the gateway accepts the message, delivery and retry are its concern.
#[async_trait]
pub trait MessageGateway: Send + Sync {
    /// Register a fresh first-party endpoint with the gateway.
    async fn register_endpoint(&self) -> Result<Endpoint>;

    /// Queue an outbound service message for the given peer endpoint.
    async fn send(&self, endpoint_id: &str, content_type: &str, payload: &[u8]) -> Result<()>;
}

/// An outbound message captured by [`MockGateway`].
#[derive(Clone, Debug)]
pub struct OutboundMessage {
    pub endpoint_id: String,
    pub content_type: String,
    pub payload: Vec<u8>,
}

/// In-memory gateway double: records every send and mints real endpoints.
/// Backs the test suite; also useful for host-side integration harnesses.
pub struct MockGateway {
    outbox: tokio::sync::Mutex<Vec<OutboundMessage>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            outbox: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of every message sent so far.
    pub async fn sent(&self) -> Vec<OutboundMessage> {
        self.outbox.lock().await.clone()
    }

    /// Drain the outbox, returning the messages in send order.
    pub async fn take_sent(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut *self.outbox.lock().await)
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageGateway for MockGateway {
    async fn register_endpoint(&self) -> Result<Endpoint> {
        Ok(Endpoint::generate())
    }

    async fn send(&self, endpoint_id: &str, content_type: &str, payload: &[u8]) -> Result<()> {
        self.outbox.lock().await.push(OutboundMessage {
            endpoint_id: endpoint_id.to_string(),
            content_type: content_type.to_string(),
            payload: payload.to_vec(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_id_is_deterministic() {
        let endpoint = Endpoint::generate();
        assert_eq!(endpoint.id, endpoint_id_for_key(&endpoint.public_key));
        assert_eq!(endpoint.id.len(), 32); // 16 bytes hex-encoded
    }

    #[test]
    fn test_endpoint_rebuild_from_seed() {
        let endpoint = Endpoint::generate();
        let rebuilt = Endpoint::from_seed(endpoint.seed());
        assert_eq!(endpoint.id, rebuilt.id);
        assert_eq!(endpoint.public_key, rebuilt.public_key);
    }

    #[test]
    fn test_endpoint_signature_verifies() {
        use ed25519_dalek::{Signature, Verifier, VerifyingKey};

        let endpoint = Endpoint::generate();
        let data = b"authorization payload";
        let signature = endpoint.sign(data);

        let verifying_key = VerifyingKey::from_bytes(&endpoint.public_key).unwrap();
        let sig = Signature::from_bytes(&signature);
        assert!(verifying_key.verify(data, &sig).is_ok());
    }

    #[tokio::test]
    async fn test_mock_gateway_records_sends() {
        let gateway = MockGateway::new();
        gateway.send("peer-1", "application/test", b"hello").await.unwrap();
        gateway.send("peer-2", "application/test", b"world").await.unwrap();

        let sent = gateway.take_sent().await;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].endpoint_id, "peer-1");
        assert_eq!(sent[1].payload, b"world");
        assert!(gateway.sent().await.is_empty());
    }
}
