use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;

use super::message::*;

/// Field delimiter for text message kinds.
const DELIMITER: char = ',';

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Malformed message: {0}")]
    MalformedMessage(&'static str),
    #[error("Unknown content type: {0}")]
    UnknownContentType(String),
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Encode a message into its wire payload.
///
/// Fails with [`CodecError::MalformedMessage`] if a text field contains the
/// delimiter — an ambiguous wire form is never emitted.
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    match message {
        Message::AccountCreationRequest(m) => join_fields(&[
            &m.requested_username,
            &m.domain,
            &m.locale,
            &BASE64.encode(m.member_public_key),
        ]),
        Message::AccountCreationResponse(m) => {
            join_fields(&[&m.requested_member_id, &m.assigned_member_id])
        }
        Message::PairingRequest(m) => join_fields(&[
            &m.requester_member_id,
            &m.target_member_id,
            &BASE64.encode(m.requester_endpoint_public_key),
        ]),
        Message::PairingMatch(m) => join_fields(&[
            &m.requester_member_id,
            &m.target_member_id,
            &m.endpoint_id,
            &BASE64.encode(m.endpoint_public_key),
        ]),
        Message::PairingAuthorization(m) => Ok(m.payload.clone()),
    }
}

/// Decode a wire payload declared under `content_type`.
///
/// Total over well-formed input for a known tag; fails with
/// [`CodecError::MalformedMessage`] on missing fields, bad UTF-8, or bad
/// base64, and [`CodecError::UnknownContentType`] for unrecognized tags.
/// Pure transform — no network access, no stored-state mutation.
pub fn decode(content_type: &str, payload: &[u8]) -> Result<Message> {
    match content_type {
        CONTENT_TYPE_ACCOUNT_CREATION_REQUEST => {
            let fields = split_fields(payload, 4)?;
            Ok(Message::AccountCreationRequest(AccountCreationRequest {
                requested_username: fields[0].clone(),
                domain: fields[1].clone(),
                locale: fields[2].clone(),
                member_public_key: decode_key(&fields[3])?,
            }))
        }
        CONTENT_TYPE_ACCOUNT_CREATION_RESPONSE => {
            let fields = split_fields(payload, 2)?;
            Ok(Message::AccountCreationResponse(AccountCreationResponse {
                requested_member_id: fields[0].clone(),
                assigned_member_id: fields[1].clone(),
            }))
        }
        CONTENT_TYPE_PAIRING_REQUEST => {
            let fields = split_fields(payload, 3)?;
            Ok(Message::PairingRequest(PairingRequest {
                requester_member_id: fields[0].clone(),
                target_member_id: fields[1].clone(),
                requester_endpoint_public_key: decode_key(&fields[2])?,
            }))
        }
        CONTENT_TYPE_PAIRING_MATCH => {
            let fields = split_fields(payload, 4)?;
            Ok(Message::PairingMatch(PairingMatch {
                requester_member_id: fields[0].clone(),
                target_member_id: fields[1].clone(),
                endpoint_id: fields[2].clone(),
                endpoint_public_key: decode_key(&fields[3])?,
            }))
        }
        CONTENT_TYPE_PAIRING_AUTH => Ok(Message::PairingAuthorization(PairingAuthorization {
            payload: payload.to_vec(),
        })),
        other => Err(CodecError::UnknownContentType(other.to_string())),
    }
}

fn join_fields(fields: &[&str]) -> Result<Vec<u8>> {
    for field in fields {
        if field.contains(DELIMITER) {
            return Err(CodecError::MalformedMessage("field contains delimiter"));
        }
        if field.is_empty() {
            return Err(CodecError::MalformedMessage("empty field"));
        }
    }
    Ok(fields.join(&DELIMITER.to_string()).into_bytes())
}

fn split_fields(payload: &[u8], expected: usize) -> Result<Vec<String>> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| CodecError::MalformedMessage("payload is not UTF-8"))?;
    let fields: Vec<String> = text.split(DELIMITER).map(str::to_string).collect();
    if fields.len() != expected {
        return Err(CodecError::MalformedMessage("wrong field count"));
    }
    if fields.iter().any(String::is_empty) {
        return Err(CodecError::MalformedMessage("empty field"));
    }
    Ok(fields)
}

fn decode_key(field: &str) -> Result<[u8; 32]> {
    let bytes = BASE64
        .decode(field)
        .map_err(|_| CodecError::MalformedMessage("bad base64 key"))?;
    bytes
        .try_into()
        .map_err(|_| CodecError::MalformedMessage("wrong key length"))
}
