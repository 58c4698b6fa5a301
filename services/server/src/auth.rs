//! Password verifiers.
//!
//! A verifier is `salt || SHA-256(salt || password)` with a 16-byte random
//! salt. Verification recomputes the digest and compares without an early
//! exit, so timing does not leak how much of the digest matched.

use rand::RngCore;
use sha2::{Digest, Sha256};

const SALT_LEN: usize = 16;
const DIGEST_LEN: usize = 32;

/// Produce a fresh verifier for `password`.
pub fn hash_password(password: &str) -> Vec<u8> {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let mut verifier = Vec::with_capacity(SALT_LEN + DIGEST_LEN);
    verifier.extend_from_slice(&salt);
    verifier.extend_from_slice(&digest(&salt, password));
    verifier
}

/// True iff `candidate` matches the password behind `verifier`.
/// Malformed verifiers never match.
pub fn verify_password(verifier: &[u8], candidate: &str) -> bool {
    if verifier.len() != SALT_LEN + DIGEST_LEN {
        return false;
    }
    let (salt, stored) = verifier.split_at(SALT_LEN);
    constant_time_eq(stored, &digest(salt, candidate))
}

fn digest(salt: &[u8], password: &str) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correct_password_verifies() {
        let verifier = hash_password("hunter2");
        assert!(verify_password(&verifier, "hunter2"));
    }

    #[test]
    fn wrong_password_is_rejected() {
        let verifier = hash_password("hunter2");
        assert!(!verify_password(&verifier, "hunter3"));
        assert!(!verify_password(&verifier, ""));
    }

    #[test]
    fn salts_differ_between_verifiers() {
        let a = hash_password("same");
        let b = hash_password("same");
        assert_ne!(a, b, "two verifiers for one password must not collide");
        assert!(verify_password(&a, "same"));
        assert!(verify_password(&b, "same"));
    }

    #[test]
    fn malformed_verifier_never_matches() {
        assert!(!verify_password(&[], "anything"));
        assert!(!verify_password(&[0u8; 10], "anything"));
    }
}
