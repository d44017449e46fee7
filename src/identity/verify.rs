use chrono::Utc;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use thiserror::Error;

use super::bundle::MemberIdBundle;

#[derive(Error, Debug)]
pub enum BundleError {
    #[error("Malformed membership bundle")]
    MalformedBundle,
    #[error("Invalid membership bundle: {0}")]
    InvalidBundle(&'static str),
}

pub type Result<T> = std::result::Result<T, BundleError>;

/// The identity a bundle proves, once verification has succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedMember {
    pub member_id: String,
    pub org_oid: String,
    pub public_key: [u8; 32],
}

/// Verify a serialized membership bundle at a given instant.
///
/// Checks, in order: deserialization, organization OID, validity window,
/// the organization's attestation signature, and the member's proof of
/// possession. Pure — no I/O, no stored-state mutation.
///
/// # Arguments
/// * `bundle_bytes` - bincode-serialized [`MemberIdBundle`]
/// * `org_oid` - OID the bundle must be rooted at
/// * `at` - instant to validate the window against (Unix seconds)
pub fn verify_bundle(bundle_bytes: &[u8], org_oid: &str, at: i64) -> Result<VerifiedMember> {
    let bundle =
        MemberIdBundle::deserialize(bundle_bytes).map_err(|_| BundleError::MalformedBundle)?;

    if bundle.org_oid != org_oid {
        return Err(BundleError::InvalidBundle("organization OID mismatch"));
    }
    if at < bundle.not_before {
        return Err(BundleError::InvalidBundle("bundle not yet valid"));
    }
    if at > bundle.not_after {
        return Err(BundleError::InvalidBundle("bundle expired"));
    }

    let org_key = VerifyingKey::from_bytes(&bundle.org_public_key)
        .map_err(|_| BundleError::InvalidBundle("invalid organization key"))?;
    let attestation = Signature::from_bytes(&bundle.org_attestation);
    org_key
        .verify(&bundle.attestation_bytes(), &attestation)
        .map_err(|_| BundleError::InvalidBundle("organization attestation failed"))?;

    let member_key = VerifyingKey::from_bytes(&bundle.member_public_key)
        .map_err(|_| BundleError::InvalidBundle("invalid member key"))?;
    let proof = Signature::from_bytes(&bundle.member_proof);
    member_key
        .verify(&bundle.proof_bytes(), &proof)
        .map_err(|_| BundleError::InvalidBundle("member proof failed"))?;

    Ok(VerifiedMember {
        member_id: bundle.member_id,
        org_oid: bundle.org_oid,
        public_key: bundle.member_public_key,
    })
}

/// [`verify_bundle`] against the current instant.
pub fn verify_bundle_now(bundle_bytes: &[u8], org_oid: &str) -> Result<VerifiedMember> {
    verify_bundle(bundle_bytes, org_oid, Utc::now().timestamp())
}
