//! # Letro Protocol
//!
//! **Account registration and contact pairing over the Awala endpoint network.**
//!
//! Letro Protocol is the transport- and storage-agnostic core of the Letro
//! messenger: the multi-step, asynchronous handshake by which an account is
//! registered with a VeraId organization and two accounts become mutually
//! trusted contacts. It runs over an unreliable, store-and-forward gateway —
//! every inbound message may arrive late, duplicated, or out of order, and
//! the state machines here absorb all of that without ever corrupting a
//! persisted record.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use letro_protocol::routing::MessageRouter;
//! use letro_protocol::storage::{MemoryAccountStore, MemoryContactStore};
//! use letro_protocol::transport::MockGateway;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let accounts = Arc::new(MemoryAccountStore::new());
//! let contacts = Arc::new(MemoryContactStore::new());
//! let gateway = Arc::new(MockGateway::new());
//!
//! let router = MessageRouter::new(
//!     accounts,
//!     contacts,
//!     gateway,
//!     "registration-server".to_string(),
//!     "pairing-broker".to_string(),
//! );
//!
//! // Kick off a registration; inbound gateway messages go through `route`.
//! let account = router
//!     .registration()
//!     .request_registration("alice", "example.com", "en-GB")
//!     .await
//!     .unwrap();
//! assert_eq!(account.member_id, "alice@example.com");
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`identity`] | VeraId membership bundles and their verification |
//! | [`protocol`] | Wire message kinds and the codec |
//! | [`accounts`] | Account model and the registration state machine |
//! | [`contacts`] | Contact model and the pairing state machine |
//! | [`routing`] | Inbound dispatch, fail-closed discards, per-key serialization |
//! | [`storage`] | Account/contact store contracts the host implements |
//! | [`transport`] | Gateway contract, endpoints, and the mock gateway |

// ── Public modules ──────────────────────────────────────────────────────────

/// VeraId membership bundles and their verification.
pub mod identity;

/// Wire message kinds and the codec.
pub mod protocol;

/// Account model and the registration state machine.
pub mod accounts;

/// Contact model and the pairing state machine.
pub mod contacts;

/// Inbound message routing.
pub mod routing;

/// Storage contracts for accounts and contacts.
pub mod storage;

/// Transport boundary to the Awala message gateway.
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────────

pub use accounts::{Account, AccountStatus, RegistrationError, RegistrationManager};

pub use contacts::{
    Contact, ContactPairingStatus, EndpointAuthorization, PairingError, PairingManager,
};

pub use identity::{verify_bundle, verify_bundle_now, BundleError, MemberIdBundle,
    VerifiedMember, LETRO_ORG_OID};

pub use protocol::{decode, encode, CodecError, Message};

pub use routing::MessageRouter;

pub use storage::{
    AccountEvent, AccountStore, ContactEvent, ContactStore, MemoryAccountStore,
    MemoryContactStore, StorageError,
};

pub use transport::{
    endpoint_id_for_key, Endpoint, GatewayError, MessageGateway, MockGateway, OutboundMessage,
};

// ── Library metadata ────────────────────────────────────────────────────────

/// Letro Protocol version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the library version string.
pub fn version() -> &'static str {
    VERSION
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
        assert!(version().contains('.'));
    }
}
