//! VeraId membership bundles and their verification.
//!
//! A membership bundle is a signed, self-contained proof that an organization
//! vouches for a member id within a validity window. Verification is pure:
//! no network access, no stored state.

pub mod bundle;
pub mod verify;

pub use bundle::{MemberIdBundle, LETRO_ORG_OID};
pub use verify::{verify_bundle, verify_bundle_now, BundleError, VerifiedMember};
