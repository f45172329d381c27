//! Cryptographic utilities.
//!
//! Password hashing lives in [`password`]. This module also provides the
//! random material used for salts, refresh tokens, CSRF tokens and the
//! application secret, plus the at-rest digest used for refresh tokens.

pub mod password;

pub use password::{DecodedHash, HashError, HashParams, PasswordHasher};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::{rngs::OsRng, TryRngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// The operating system RNG could not be read.
#[derive(Debug, thiserror::Error)]
#[error("failed to read from the operating system RNG: {0}")]
pub struct EntropyError(String);

/// Fill a fresh buffer of `len` bytes from the OS RNG.
pub fn random_bytes(len: usize) -> Result<Vec<u8>, EntropyError> {
    let mut buf = vec![0u8; len];
    OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|e| EntropyError(e.to_string()))?;
    Ok(buf)
}

/// Generate `len` random bytes encoded as unpadded URL-safe base64.
///
/// URL-safe output keeps the value usable as a cookie value and header value
/// without further escaping.
pub fn random_token(len: usize) -> Result<String, EntropyError> {
    Ok(URL_SAFE_NO_PAD.encode(random_bytes(len)?))
}

/// Hash a token for storage
pub fn sha256_hex(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compare two byte strings without short-circuiting on the first mismatch.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_token_is_url_safe() {
        let token = random_token(64).unwrap();
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        // 64 bytes -> ceil(64 * 4 / 3) characters without padding
        assert_eq!(token.len(), 86);
    }

    #[test]
    fn test_random_tokens_differ() {
        let a = random_token(32).unwrap();
        let b = random_token(32).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_sha256_hex_is_stable() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"same", b"same"));
        assert!(!constant_time_eq(b"same", b"diff"));
        assert!(!constant_time_eq(b"short", b"longer value"));
        assert!(!constant_time_eq(b"", b"x"));
    }
}
