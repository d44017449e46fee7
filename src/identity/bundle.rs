use ed25519_dalek::{Signer, SigningKey};
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

/// Object identifier of the Letro organization tree. Bundles presented to
/// this app must be rooted here; any other OID is rejected outright.
pub const LETRO_ORG_OID: &str = "1.3.6.1.4.1.58708.1.0";

/// A signed VeraId membership bundle.
///
/// The organization attests to the (member id, member key) binding for a
/// point-in-time validity window, and the member proves possession of the
/// attested key by countersigning the attestation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberIdBundle {
    /// Dotted-decimal OID of the issuing organization tree.
    pub org_oid: String,
    /// Member id, e.g. `alice@example.com`.
    pub member_id: String,
    /// Member's Ed25519 public key.
    pub member_public_key: [u8; 32],
    /// Organization's Ed25519 public key.
    pub org_public_key: [u8; 32],
    /// Validity window start (Unix seconds, inclusive).
    pub not_before: i64,
    /// Validity window end (Unix seconds, inclusive).
    pub not_after: i64,
    /// Organization signature over [`Self::attestation_bytes`].
    #[serde(with = "BigArray")]
    pub org_attestation: [u8; 64],
    /// Member signature over [`Self::proof_bytes`].
    #[serde(with = "BigArray")]
    pub member_proof: [u8; 64],
}

impl MemberIdBundle {
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    /// Bytes the organization signs: the member binding and validity window.
    pub fn attestation_bytes(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(self.org_oid.as_bytes());
        data.push(0);
        data.extend_from_slice(self.member_id.as_bytes());
        data.push(0);
        data.extend_from_slice(&self.member_public_key);
        data.extend_from_slice(&self.not_before.to_le_bytes());
        data.extend_from_slice(&self.not_after.to_le_bytes());
        data
    }

    /// Bytes the member countersigns: the attestation plus the org signature,
    /// binding the proof of possession to this exact attestation.
    pub fn proof_bytes(&self) -> Vec<u8> {
        let mut data = self.attestation_bytes();
        data.extend_from_slice(&self.org_attestation);
        data
    }

    /// Issue a fully signed bundle. Used by the registration server side and
    /// by the test suite; client-side code only ever verifies.
    pub fn issue(
        org_key: &SigningKey,
        member_key: &SigningKey,
        org_oid: &str,
        member_id: &str,
        not_before: i64,
        not_after: i64,
    ) -> Self {
        let mut bundle = Self {
            org_oid: org_oid.to_string(),
            member_id: member_id.to_string(),
            member_public_key: member_key.verifying_key().to_bytes(),
            org_public_key: org_key.verifying_key().to_bytes(),
            not_before,
            not_after,
            org_attestation: [0u8; 64],
            member_proof: [0u8; 64],
        };
        bundle.org_attestation = org_key.sign(&bundle.attestation_bytes()).to_bytes();
        bundle.member_proof = member_key.sign(&bundle.proof_bytes()).to_bytes();
        bundle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn fixed_keys() -> (SigningKey, SigningKey) {
        let org = SigningKey::from_bytes(&hex!(
            "9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60"
        ));
        let member = SigningKey::from_bytes(&hex!(
            "4ccd089b28ff96da9db6c346ec114e0f5b8a319f35aba624da8cf6ed4fb8a6fb"
        ));
        (org, member)
    }

    #[test]
    fn test_bundle_roundtrip() {
        let (org, member) = fixed_keys();
        let bundle =
            MemberIdBundle::issue(&org, &member, LETRO_ORG_OID, "alice@example.com", 0, 1000);

        let serialized = bundle.serialize().unwrap();
        let deserialized = MemberIdBundle::deserialize(&serialized).unwrap();
        assert_eq!(bundle, deserialized);
    }

    #[test]
    fn test_attestation_bytes_bind_every_field() {
        let (org, member) = fixed_keys();
        let a = MemberIdBundle::issue(&org, &member, LETRO_ORG_OID, "alice@example.com", 0, 1000);
        let b = MemberIdBundle::issue(&org, &member, LETRO_ORG_OID, "alice@example.com", 0, 1001);
        assert_ne!(a.attestation_bytes(), b.attestation_bytes());
        assert_ne!(a.org_attestation, b.org_attestation);
    }
}
