//! PKCE (RFC 7636) and random protocol values.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use sha2::{Digest, Sha256};

/// PKCE verifier and its S256 challenge.
#[derive(Clone)]
pub struct PkceChallenge {
    pub verifier: String,
    pub challenge: String,
}

impl PkceChallenge {
    /// Fresh verifier from 32 random bytes (43 base64url characters).
    pub fn generate() -> Self {
        let verifier = random_token();
        let challenge = s256(&verifier);
        Self {
            verifier,
            challenge,
        }
    }

    pub const METHOD: &'static str = "S256";
}

/// BASE64URL(SHA256(verifier)) without padding.
pub fn s256(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// 256-bit random value, base64url encoded. Used for state and nonce.
pub fn random_token() -> String {
    let bytes: [u8; 32] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}
