//! Wire message kinds and their codec.
//!
//! Every pairing/registration message travels as a `(content type, payload)`
//! pair through the gateway. Text kinds use comma-joined UTF-8 fields with
//! base64 for embedded key material; the pairing authorization carries an
//! opaque binary payload produced by the pairing engine.

pub mod codec;
pub mod message;

pub use codec::{decode, encode, CodecError};
pub use message::{
    AccountCreationRequest, AccountCreationResponse, Message, PairingAuthorization, PairingMatch,
    PairingRequest, CONTENT_TYPE_ACCOUNT_CREATION_REQUEST,
    CONTENT_TYPE_ACCOUNT_CREATION_RESPONSE, CONTENT_TYPE_PAIRING_AUTH,
    CONTENT_TYPE_PAIRING_MATCH, CONTENT_TYPE_PAIRING_REQUEST,
};
