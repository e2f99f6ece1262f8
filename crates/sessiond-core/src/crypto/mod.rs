//! Signing and verification primitives.
//!
//! The policy logic treats cryptography as opaque: a public key is a
//! well-formed Ed25519 verifying-key blob, a signature either verifies
//! under a blob or it does not, and private keys are only reachable
//! through the [`keystore`] abstraction.

pub mod keystore;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

/// Length of a public-key blob in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Length of a stored secret key in bytes.
pub const SECRET_KEY_LEN: usize = 32;

/// True if `blob` parses as a well-formed public key.
#[must_use]
pub fn check_public_key_blob(blob: &[u8]) -> bool {
    VerifyingKey::try_from(blob).is_ok()
}

/// Verifies `signature` over `data` under the public key `key_blob`.
///
/// Any malformed input is a verification failure, never a panic.
#[must_use]
pub fn verify_signature(key_blob: &[u8], data: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = VerifyingKey::try_from(key_blob) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(data, &sig).is_ok()
}

/// Signs `data`, returning the detached signature bytes.
#[must_use]
pub fn sign(key: &SigningKey, data: &[u8]) -> Vec<u8> {
    key.sign(data).to_bytes().to_vec()
}

/// Public-key blob of a signing key.
#[must_use]
pub fn public_key_blob(key: &SigningKey) -> Vec<u8> {
    key.verifying_key().to_bytes().to_vec()
}

/// Generates a fresh signing key from the thread CSPRNG.
#[must_use]
pub fn generate_signing_key() -> SigningKey {
    let mut rng = rand::thread_rng();
    SigningKey::generate(&mut rng)
}
