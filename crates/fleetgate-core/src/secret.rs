//! Secret hashing and verification using Argon2id.
//!
//! The legacy system compared secrets verbatim; here only PHC-format
//! hashes are stored and the comparison goes through Argon2. The
//! authenticate contract is unchanged.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHasher, PasswordVerifier};

use crate::{CoreError, CoreResult};

/// Hash a secret into a PHC-format string for storage.
pub fn hash_secret(secret: &str) -> CoreResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| CoreError::Internal(format!("secret hashing failed: {e}")))
}

/// Verify a plaintext secret against a stored PHC-format hash.
///
/// Returns `Ok(false)` on mismatch; `Err` only when the stored hash is
/// malformed.
pub fn verify_secret(secret: &str, hash: &str) -> CoreResult<bool> {
    let parsed = argon2::PasswordHash::new(hash)
        .map_err(|e| CoreError::Internal(format!("malformed secret hash: {e}")))?;

    match Argon2::default().verify_password(secret.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(CoreError::Internal(format!("verify error: {e}"))),
    }
}
