//! Cluster token generation and verification.
//!
//! The cleartext token is shown to the operator once; only its SHA-256 hex
//! digest is ever stored.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

const TOKEN_BYTES: usize = 20;

/// Generates a fresh cleartext token (40 hex characters).
#[must_use]
pub fn generate_token() -> String {
    let bytes: [u8; TOKEN_BYTES] = rand::random();
    hex::encode(bytes)
}

/// SHA-256 hex digest of a cleartext token.
#[must_use]
pub fn hash_token(cleartext: &str) -> String {
    hex::encode(Sha256::digest(cleartext.as_bytes()))
}

/// Compares the digest of `cleartext` against `stored_digest` in constant time.
///
/// An empty stored digest never matches.
#[must_use]
pub fn verify_token(cleartext: &str, stored_digest: &str) -> bool {
    if stored_digest.is_empty() {
        return false;
    }
    let presented = hash_token(cleartext);
    presented.as_bytes().ct_eq(stored_digest.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_forty_hex_chars_and_unique() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 40);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn known_digest() {
        assert_eq!(
            hash_token("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn verify_accepts_only_the_matching_token() {
        let token = generate_token();
        let digest = hash_token(&token);
        assert!(verify_token(&token, &digest));
        assert!(!verify_token("wrong", &digest));
        assert!(!verify_token(&token, ""));
    }

    #[test]
    fn rotated_token_invalidates_the_old_one() {
        let old = generate_token();
        let new = generate_token();
        let digest = hash_token(&new);
        assert!(!verify_token(&old, &digest));
        assert!(verify_token(&new, &digest));
    }
}
