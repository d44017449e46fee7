/// Content type tag for an account-creation request (client → server).
pub const CONTENT_TYPE_ACCOUNT_CREATION_REQUEST: &str =
    "application/vnd.letro.account-creation-request";
/// Content type tag for an account-creation response (server → client).
pub const CONTENT_TYPE_ACCOUNT_CREATION_RESPONSE: &str =
    "application/vnd.letro.account-creation-response";
/// Content type tag for a contact pairing request.
pub const CONTENT_TYPE_PAIRING_REQUEST: &str = "application/vnd.letro.pairing-request";
/// Content type tag for a contact pairing match.
pub const CONTENT_TYPE_PAIRING_MATCH: &str = "application/vnd.letro.pairing-match";
/// Content type tag for a contact pairing authorization.
pub const CONTENT_TYPE_PAIRING_AUTH: &str = "application/vnd.letro.pairing-auth";

/// Ask the registration server to create `requested_username@domain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountCreationRequest {
    pub requested_username: String,
    pub domain: String,
    pub locale: String,
    pub member_public_key: [u8; 32],
}

/// The server's answer: the id actually assigned. May differ from the
/// requested one when the requested username was taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountCreationResponse {
    pub requested_member_id: String,
    pub assigned_member_id: String,
}

/// First leg of the pairing handshake: the requester introduces itself and
/// the endpoint key it minted for this contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingRequest {
    pub requester_member_id: String,
    pub target_member_id: String,
    pub requester_endpoint_public_key: [u8; 32],
}

/// Second leg: the target accepts and discloses its own endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingMatch {
    pub requester_member_id: String,
    pub target_member_id: String,
    pub endpoint_id: String,
    pub endpoint_public_key: [u8; 32],
}

/// Final leg: an opaque authorization payload minted by the pairing engine.
/// The codec passes the bytes through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingAuthorization {
    pub payload: Vec<u8>,
}

/// A decoded wire message of any kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    AccountCreationRequest(AccountCreationRequest),
    AccountCreationResponse(AccountCreationResponse),
    PairingRequest(PairingRequest),
    PairingMatch(PairingMatch),
    PairingAuthorization(PairingAuthorization),
}

impl Message {
    /// The content type tag this message travels under.
    pub fn content_type(&self) -> &'static str {
        match self {
            Message::AccountCreationRequest(_) => CONTENT_TYPE_ACCOUNT_CREATION_REQUEST,
            Message::AccountCreationResponse(_) => CONTENT_TYPE_ACCOUNT_CREATION_RESPONSE,
            Message::PairingRequest(_) => CONTENT_TYPE_PAIRING_REQUEST,
            Message::PairingMatch(_) => CONTENT_TYPE_PAIRING_MATCH,
            Message::PairingAuthorization(_) => CONTENT_TYPE_PAIRING_AUTH,
        }
    }
}
