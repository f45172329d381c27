//! Argon2id password hashing with self-describing encoded hashes.
//!
//! Encoded format (six `$`-separated segments, the first one empty):
//!
//! ```text
//! $argon2id$v=19$m=65536,t=1,p=4$<base64 salt>$<base64 derived key>
//! ```
//!
//! Every parameter needed to re-derive the key travels with the hash, so
//! hashes created under older defaults keep verifying after the defaults change.

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
use serde::Deserialize;
use thiserror::Error;

use super::{constant_time_eq, random_bytes, EntropyError};

const ALGORITHM_TAG: &str = "argon2id";
const ARGON2_VERSION: u32 = 0x13;
const HASH_SEGMENTS: usize = 6;

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HashParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Number of passes
    pub iterations: u32,
    /// Degree of parallelism (lanes)
    pub parallelism: u32,
    /// Salt length in bytes
    pub salt_length: u32,
    /// Derived key length in bytes
    pub key_length: u32,
}

impl Default for HashParams {
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 1,
            parallelism: 4,
            salt_length: 16,
            key_length: 32,
        }
    }
}

#[derive(Debug, Error)]
pub enum HashError {
    #[error("encoded hash has {0} segments, expected {HASH_SEGMENTS}")]
    SegmentCount(usize),
    #[error("unsupported hash algorithm {0:?}")]
    Algorithm(String),
    #[error("incompatible argon2 version {0:?}")]
    IncompatibleVersion(String),
    #[error("malformed parameter block {0:?}")]
    Parameters(String),
    #[error("malformed base64 in encoded hash: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("argon2 rejected the input: {0}")]
    Argon2(String),
    #[error(transparent)]
    Entropy(#[from] EntropyError),
}

/// The pieces of an encoded hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedHash {
    pub params: HashParams,
    pub salt: Vec<u8>,
    pub key: Vec<u8>,
}

/// Hashes new secrets with a fixed parameter set and verifies any
/// well-formed encoded hash regardless of the parameters it was created with.
#[derive(Debug, Clone, Default)]
pub struct PasswordHasher {
    params: HashParams,
}

impl PasswordHasher {
    pub fn new(params: HashParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &HashParams {
        &self.params
    }

    /// Hash a secret under a fresh random salt and return the encoded form.
    pub fn hash(&self, secret: &str) -> Result<String, HashError> {
        let salt = random_bytes(self.params.salt_length as usize)?;
        let key = hash_with_salt(secret, &self.params, &salt)?;
        Ok(encode(&self.params, &salt, &key))
    }

    /// Check a secret against an encoded hash.
    ///
    /// `Ok(false)` means the secret is wrong. A malformed hash is an `Err`, so
    /// corrupted data is never reported as a bad password.
    pub fn verify(&self, secret: &str, encoded: &str) -> Result<bool, HashError> {
        let decoded = decode(encoded)?;
        let candidate = hash_with_salt(secret, &decoded.params, &decoded.salt)?;
        Ok(constant_time_eq(&candidate, &decoded.key))
    }

    /// Do the work of [`verify`](Self::verify) when there is no stored hash,
    /// so an unknown account answers as slowly as a wrong password.
    /// Never matches.
    pub fn verify_missing(&self, secret: &str) -> Result<bool, HashError> {
        let salt = vec![0u8; self.params.salt_length as usize];
        std::hint::black_box(hash_with_salt(secret, &self.params, &salt)?);
        Ok(false)
    }
}

/// Derive the raw Argon2id key for `secret` under the given parameters and salt.
pub fn hash_with_salt(
    secret: &str,
    params: &HashParams,
    salt: &[u8],
) -> Result<Vec<u8>, HashError> {
    let argon_params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(params.key_length as usize),
    )
    .map_err(|e| HashError::Argon2(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut key = vec![0u8; params.key_length as usize];
    argon2
        .hash_password_into(secret.as_bytes(), salt, &mut key)
        .map_err(|e| HashError::Argon2(e.to_string()))?;
    Ok(key)
}

fn encode(params: &HashParams, salt: &[u8], key: &[u8]) -> String {
    format!(
        "${}$v={}$m={},t={},p={}${}${}",
        ALGORITHM_TAG,
        ARGON2_VERSION,
        params.memory_kib,
        params.iterations,
        params.parallelism,
        STANDARD_NO_PAD.encode(salt),
        STANDARD_NO_PAD.encode(key),
    )
}

/// Split an encoded hash into parameters, salt and derived key.
pub fn decode(encoded: &str) -> Result<DecodedHash, HashError> {
    let segments: Vec<&str> = encoded.split('$').collect();
    if segments.len() != HASH_SEGMENTS || !segments[0].is_empty() {
        return Err(HashError::SegmentCount(segments.len()));
    }

    if segments[1] != ALGORITHM_TAG {
        return Err(HashError::Algorithm(segments[1].to_string()));
    }

    let version = segments[2]
        .strip_prefix("v=")
        .and_then(|v| v.parse::<u32>().ok());
    if version != Some(ARGON2_VERSION) {
        return Err(HashError::IncompatibleVersion(segments[2].to_string()));
    }

    let (memory_kib, iterations, parallelism) = parse_cost_block(segments[3])
        .ok_or_else(|| HashError::Parameters(segments[3].to_string()))?;

    let salt = STANDARD_NO_PAD.decode(segments[4])?;
    let key = STANDARD_NO_PAD.decode(segments[5])?;

    Ok(DecodedHash {
        params: HashParams {
            memory_kib,
            iterations,
            parallelism,
            salt_length: salt.len() as u32,
            key_length: key.len() as u32,
        },
        salt,
        key,
    })
}

/// Parse `m=<u32>,t=<u32>,p=<u32>`
fn parse_cost_block(block: &str) -> Option<(u32, u32, u32)> {
    let mut parts = block.split(',');
    let m = parts.next()?.strip_prefix("m=")?.parse().ok()?;
    let t = parts.next()?.strip_prefix("t=")?.parse().ok()?;
    let p = parts.next()?.strip_prefix("p=")?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((m, t, p))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Cheap parameters so the tests stay fast.
    fn test_params() -> HashParams {
        HashParams {
            memory_kib: 256,
            iterations: 1,
            parallelism: 1,
            salt_length: 16,
            key_length: 32,
        }
    }

    #[test]
    fn test_hash_then_verify() {
        let hasher = PasswordHasher::new(test_params());
        let encoded = hasher.hash("correct horse battery staple").unwrap();

        assert!(encoded.starts_with("$argon2id$v=19$m=256,t=1,p=1$"));
        assert!(hasher.verify("correct horse battery staple", &encoded).unwrap());
    }

    #[test]
    fn test_wrong_password_does_not_verify() {
        let hasher = PasswordHasher::new(test_params());
        let encoded = hasher.hash("hunter2").unwrap();
        assert!(!hasher.verify("hunter3", &encoded).unwrap());
        assert!(!hasher.verify("", &encoded).unwrap());
    }

    #[test]
    fn test_same_password_gets_different_salts() {
        let hasher = PasswordHasher::new(test_params());
        let a = hasher.hash("same").unwrap();
        let b = hasher.hash("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_decode_recovers_params_and_salt_length() {
        let params = HashParams {
            salt_length: 24,
            key_length: 48,
            ..test_params()
        };
        let encoded = PasswordHasher::new(params).hash("secret").unwrap();

        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.params, params);
        assert_eq!(decoded.salt.len(), 24);
        assert_eq!(decoded.key.len(), 48);
    }

    #[test]
    fn test_decoded_key_matches_fresh_derivation() {
        let encoded = PasswordHasher::new(test_params()).hash("secret").unwrap();
        let decoded = decode(&encoded).unwrap();

        let again = hash_with_salt("secret", &decoded.params, &decoded.salt).unwrap();
        assert_eq!(again, decoded.key);
    }

    #[test]
    fn test_old_parameters_still_verify() {
        let old = PasswordHasher::new(HashParams {
            memory_kib: 128,
            iterations: 2,
            ..test_params()
        });
        let encoded = old.hash("legacy").unwrap();

        let current = PasswordHasher::new(test_params());
        assert!(current.verify("legacy", &encoded).unwrap());
    }

    #[test]
    fn test_decode_rejects_wrong_segment_count() {
        let err = decode("$argon2id$v=19$m=256,t=1,p=1$c2FsdA").unwrap_err();
        assert!(matches!(err, HashError::SegmentCount(5)));

        let err = decode("plaintext-password").unwrap_err();
        assert!(matches!(err, HashError::SegmentCount(1)));
    }

    #[test]
    fn test_decode_rejects_unknown_version() {
        let encoded = PasswordHasher::new(test_params()).hash("secret").unwrap();
        let tampered = encoded.replace("v=19", "v=16");
        assert!(matches!(
            decode(&tampered).unwrap_err(),
            HashError::IncompatibleVersion(_)
        ));
    }

    #[test]
    fn test_decode_rejects_bad_parameter_block() {
        let encoded = PasswordHasher::new(test_params()).hash("secret").unwrap();
        let tampered = encoded.replace("m=256,t=1,p=1", "m=256;t=1;p=1");
        assert!(matches!(
            decode(&tampered).unwrap_err(),
            HashError::Parameters(_)
        ));
    }

    #[test]
    fn test_verify_missing_derives_and_never_matches() {
        let hasher = PasswordHasher::new(test_params());
        assert!(!hasher.verify_missing("hunter2").unwrap());
        assert!(!hasher.verify_missing("").unwrap());

        // The key derivation really runs: parameters argon2 refuses surface here
        let broken = PasswordHasher::new(HashParams {
            memory_kib: 1,
            ..test_params()
        });
        assert!(matches!(
            broken.verify_missing("hunter2").unwrap_err(),
            HashError::Argon2(_)
        ));
    }

    #[test]
    fn test_verify_reports_corruption_as_error() {
        let hasher = PasswordHasher::new(test_params());
        assert!(hasher.verify("anything", "$argon2id$v=19$m=256,t=1,p=1$!!!$!!!").is_err());
    }
}
