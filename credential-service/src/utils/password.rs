use argon2::password_hash::{rand_core::OsRng, PasswordHash, SaltString};
use argon2::{Algorithm, Argon2, Params, PasswordHasher, PasswordVerifier, Version};
use std::fmt;

/// Plaintext secret as received from a caller. Never printed.
#[derive(Clone)]
pub struct Password(String);

impl Password {
    pub fn new(password: impl Into<String>) -> Self {
        Self(password.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password([REDACTED])")
    }
}

/// Stored digest in PHC string form (`$argon2id$v=19$...`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordHashString(String);

impl PasswordHashString {
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

// Argon2id v0x13 with the crate's recommended cost. Verification reads the
// parameters back out of the PHC string, so older digests keep working.
fn hasher() -> Argon2<'static> {
    Argon2::new(Algorithm::Argon2id, Version::V0x13, Params::default())
}

pub fn hash_password(password: &Password) -> Result<PasswordHashString, anyhow::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let digest = hasher()
        .hash_password(password.bytes(), &salt)
        .map_err(|err| anyhow::anyhow!("argon2 hashing failed: {err}"))?;
    Ok(PasswordHashString(digest.to_string()))
}

/// `false` for a wrong secret and for a digest that does not parse. The
/// latter is logged so an operator can find the corrupt row.
pub fn verify_password(password: &Password, password_hash: &PasswordHashString) -> bool {
    match PasswordHash::new(password_hash.as_str()) {
        Ok(parsed) => hasher().verify_password(password.bytes(), &parsed).is_ok(),
        Err(err) => {
            tracing::error!(error = %err, "Unparseable password digest");
            false
        }
    }
}
