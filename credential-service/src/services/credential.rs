//! Hashing and verification of secrets.
//!
//! Passwords go through Argon2 (slow, salted). Opaque tokens that we
//! generate ourselves (session ids, remember-me tokens, OAuth codes and
//! tokens, client secrets) are high entropy, so a single SHA-256 is enough
//! and keeps them indexable.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use subtle::ConstantTimeEq;

use crate::utils::{hash_password, verify_password, Password, PasswordHashString};

use super::AuthError;

/// Number of leading characters of a token kept in clear for lookup.
pub const TOKEN_PREFIX_LEN: usize = 8;

pub fn hash(secret: &Password) -> Result<PasswordHashString, AuthError> {
    Ok(hash_password(secret)?)
}

pub fn verify(secret: &Password, digest: &PasswordHashString) -> bool {
    verify_password(secret, digest)
}

/// Burn roughly the same time as a real verification. Used when there is no
/// user to verify against so response timing does not reveal that.
pub fn verify_dummy(secret: &Password) {
    static DUMMY: OnceLock<Option<PasswordHashString>> = OnceLock::new();
    let dummy = DUMMY.get_or_init(|| hash_password(&Password::new("dummy-password")).ok());
    if let Some(digest) = dummy {
        let _ = verify_password(secret, digest);
    }
}

/// Fast deterministic digest for generated tokens (hex SHA-256).
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// `byte_length` random bytes, base64url without padding.
pub fn generate_secure_token(byte_length: usize) -> String {
    let mut bytes = vec![0u8; byte_length];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn token_prefix(token: &str) -> String {
    token.chars().take(TOKEN_PREFIX_LEN).collect()
}

pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
