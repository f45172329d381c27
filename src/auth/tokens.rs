//! Access, refresh and CSRF token issuance.
//!
//! Access tokens are HS256 JWTs carrying `sub`, `role`, `iat` and `exp`, with
//! the signing key id in the `kid` header. Refresh tokens are
//! `<user uuid>$<random>`; only a SHA-256 digest of the random half is stored.
//! CSRF tokens are plain random strings checked with a double-submit cookie.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    decode, decode_header, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header,
    Validation,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use super::{Identity, Role};
use crate::config::AuthConfig;
use crate::crypto::{self, EntropyError};

/// Random bytes behind refresh and CSRF tokens
const TOKEN_ENTROPY_BYTES: usize = 64;
const REFRESH_SEPARATOR: char = '$';

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("token key id does not match the active signing key")]
    KeyIdMismatch,
    #[error("token signature is invalid")]
    BadSignature,
    #[error("token has expired")]
    Expired,
    #[error("token subject is not a user id")]
    InvalidSubject,
    #[error("failed to sign token: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),
    #[error(transparent)]
    Entropy(#[from] EntropyError),
}

/// Claims carried by an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone)]
pub struct IssuedAccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct IssuedRefreshToken {
    pub token: RefreshToken,
    /// Digest persisted in the refresh session row
    pub hash: String,
    pub expires_at: DateTime<Utc>,
    pub ttl: Duration,
}

/// Everything handed to a client at login or refresh.
#[derive(Debug, Clone)]
pub struct SessionTokens {
    pub access: IssuedAccessToken,
    pub refresh: IssuedRefreshToken,
    pub csrf: String,
}

/// A parsed refresh token.
#[derive(Clone, PartialEq, Eq)]
pub struct RefreshToken {
    pub user_id: Uuid,
    secret: String,
}

impl RefreshToken {
    /// Split `<uuid>$<secret>`.
    pub fn parse(raw: &str) -> Result<Self, TokenError> {
        let (user, secret) = raw
            .split_once(REFRESH_SEPARATOR)
            .ok_or_else(|| TokenError::Malformed("missing refresh token separator".into()))?;
        if secret.is_empty() {
            return Err(TokenError::Malformed("empty refresh token secret".into()));
        }
        let user_id = Uuid::parse_str(user).map_err(|_| TokenError::InvalidSubject)?;
        Ok(Self {
            user_id,
            secret: secret.to_string(),
        })
    }

    /// Digest of the random half, as stored at rest.
    pub fn hash(&self) -> String {
        crypto::sha256_hex(&self.secret)
    }
}

impl fmt::Display for RefreshToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.user_id, REFRESH_SEPARATOR, self.secret)
    }
}

// Never print the secret half.
impl fmt::Debug for RefreshToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshToken")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

/// Issues and validates tokens under a single HMAC key.
#[derive(Clone)]
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    key_id: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("key_id", &self.key_id)
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    pub fn new(
        secret: &[u8],
        key_id: impl Into<String>,
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            key_id: key_id.into(),
            access_ttl,
            refresh_ttl,
        }
    }

    pub fn from_config(secret: &[u8], config: &AuthConfig) -> Self {
        Self::new(
            secret,
            config.key_id.clone(),
            Duration::minutes(config.access_token_minutes),
            Duration::days(config.refresh_token_days),
        )
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    pub fn issue_access_token(
        &self,
        user_id: Uuid,
        role: Role,
        issued_at: DateTime<Utc>,
    ) -> Result<IssuedAccessToken, TokenError> {
        let expires_at = issued_at + self.access_ttl;
        let claims = AccessClaims {
            sub: user_id.to_string(),
            role,
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        };

        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(self.key_id.clone());

        let token = encode(&header, &claims, &self.encoding).map_err(TokenError::Signing)?;
        Ok(IssuedAccessToken {
            token,
            expires_at,
            ttl: self.access_ttl,
        })
    }

    pub fn issue_refresh_token(
        &self,
        user_id: Uuid,
        issued_at: DateTime<Utc>,
    ) -> Result<IssuedRefreshToken, TokenError> {
        let token = RefreshToken {
            user_id,
            secret: crypto::random_token(TOKEN_ENTROPY_BYTES)?,
        };
        let hash = token.hash();
        Ok(IssuedRefreshToken {
            token,
            hash,
            expires_at: issued_at + self.refresh_ttl,
            ttl: self.refresh_ttl,
        })
    }

    pub fn issue_csrf_token(&self) -> Result<String, TokenError> {
        Ok(crypto::random_token(TOKEN_ENTROPY_BYTES)?)
    }

    /// Issue a fresh access, refresh and CSRF triple.
    pub fn issue_session(
        &self,
        user_id: Uuid,
        role: Role,
        issued_at: DateTime<Utc>,
    ) -> Result<SessionTokens, TokenError> {
        Ok(SessionTokens {
            access: self.issue_access_token(user_id, role, issued_at)?,
            refresh: self.issue_refresh_token(user_id, issued_at)?,
            csrf: self.issue_csrf_token()?,
        })
    }

    /// Validate an access token and return the identity it carries.
    ///
    /// Checks run in order: header parse, key id, signature, expiry (no
    /// leeway), subject.
    pub fn validate_access(&self, token: &str) -> Result<Identity, TokenError> {
        let header = decode_header(token).map_err(|e| TokenError::Malformed(e.to_string()))?;
        if header.kid.as_deref() != Some(self.key_id.as_str()) {
            return Err(TokenError::KeyIdMismatch);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let data = decode::<AccessClaims>(token, &self.decoding, &validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::InvalidSignature => TokenError::BadSignature,
                _ => TokenError::Malformed(e.to_string()),
            }
        })?;

        let user_id = Uuid::parse_str(&data.claims.sub).map_err(|_| TokenError::InvalidSubject)?;
        Ok(Identity {
            user_id,
            role: data.claims.role,
            claims: data.claims,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-secret-with-enough-length-for-hs256";

    fn issuer() -> TokenIssuer {
        TokenIssuer::new(SECRET, "1", Duration::minutes(30), Duration::days(14))
    }

    #[test]
    fn test_access_token_validates() {
        let issuer = issuer();
        let user_id = Uuid::new_v4();
        let now = Utc::now();

        let issued = issuer.issue_access_token(user_id, Role::Admin, now).unwrap();
        assert_eq!(issued.expires_at, now + Duration::minutes(30));

        let identity = issuer.validate_access(&issued.token).unwrap();
        assert_eq!(identity.user_id, user_id);
        assert_eq!(identity.role, Role::Admin);
        assert_eq!(identity.claims.iat, now.timestamp());
        assert_eq!(identity.claims.exp - identity.claims.iat, 30 * 60);
    }

    #[test]
    fn test_expired_access_token() {
        let issuer = issuer();
        let issued_at = Utc::now() - Duration::hours(2);
        let issued = issuer
            .issue_access_token(Uuid::new_v4(), Role::User, issued_at)
            .unwrap();

        assert!(matches!(
            issuer.validate_access(&issued.token),
            Err(TokenError::Expired)
        ));
    }

    #[test]
    fn test_key_id_mismatch() {
        let issued = TokenIssuer::new(SECRET, "2", Duration::minutes(30), Duration::days(14))
            .issue_access_token(Uuid::new_v4(), Role::User, Utc::now())
            .unwrap();

        assert!(matches!(
            issuer().validate_access(&issued.token),
            Err(TokenError::KeyIdMismatch)
        ));
    }

    #[test]
    fn test_missing_key_id() {
        let now = Utc::now();
        let claims = AccessClaims {
            sub: Uuid::new_v4().to_string(),
            role: Role::User,
            iat: now.timestamp(),
            exp: (now + Duration::minutes(5)).timestamp(),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();

        assert!(matches!(
            issuer().validate_access(&token),
            Err(TokenError::KeyIdMismatch)
        ));
    }

    #[test]
    fn test_bad_signature() {
        let forged = TokenIssuer::new(b"another-secret", "1", Duration::minutes(30), Duration::days(14))
            .issue_access_token(Uuid::new_v4(), Role::Admin, Utc::now())
            .unwrap();

        assert!(matches!(
            issuer().validate_access(&forged.token),
            Err(TokenError::BadSignature)
        ));
    }

    #[test]
    fn test_bad_signature_checked_before_expiry() {
        let forged = TokenIssuer::new(b"another-secret", "1", Duration::minutes(30), Duration::days(14))
            .issue_access_token(Uuid::new_v4(), Role::User, Utc::now() - Duration::hours(3))
            .unwrap();

        assert!(matches!(
            issuer().validate_access(&forged.token),
            Err(TokenError::BadSignature)
        ));
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            issuer().validate_access("not-a-jwt"),
            Err(TokenError::Malformed(_))
        ));
        assert!(matches!(
            issuer().validate_access(""),
            Err(TokenError::Malformed(_))
        ));
    }

    #[test]
    fn test_non_uuid_subject() {
        let now = Utc::now();
        let claims = AccessClaims {
            sub: "admin".to_string(),
            role: Role::Admin,
            iat: now.timestamp(),
            exp: (now + Duration::minutes(5)).timestamp(),
        };
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("1".to_string());
        let token = encode(&header, &claims, &EncodingKey::from_secret(SECRET)).unwrap();

        assert!(matches!(
            issuer().validate_access(&token),
            Err(TokenError::InvalidSubject)
        ));
    }

    #[test]
    fn test_refresh_token_format_and_hash() {
        let user_id = Uuid::new_v4();
        let now = Utc::now();
        let issued = issuer().issue_refresh_token(user_id, now).unwrap();

        let raw = issued.token.to_string();
        let (prefix, secret) = raw.split_once('$').unwrap();
        assert_eq!(prefix, user_id.to_string());
        assert_eq!(secret.len(), 86);
        assert_eq!(issued.hash, crypto::sha256_hex(secret));
        assert_eq!(issued.expires_at, now + Duration::days(14));

        let parsed = RefreshToken::parse(&raw).unwrap();
        assert_eq!(parsed.user_id, user_id);
        assert_eq!(parsed.hash(), issued.hash);
    }

    #[test]
    fn test_refresh_token_parse_rejects_garbage() {
        assert!(matches!(
            RefreshToken::parse("no-separator"),
            Err(TokenError::Malformed(_))
        ));
        assert!(matches!(
            RefreshToken::parse("not-a-uuid$abc"),
            Err(TokenError::InvalidSubject)
        ));
        let empty_secret = format!("{}$", Uuid::new_v4());
        assert!(matches!(
            RefreshToken::parse(&empty_secret),
            Err(TokenError::Malformed(_))
        ));
    }

    #[test]
    fn test_refresh_token_debug_hides_secret() {
        let issued = issuer().issue_refresh_token(Uuid::new_v4(), Utc::now()).unwrap();
        let raw = issued.token.to_string();
        let secret = raw.split_once('$').unwrap().1;
        assert!(!format!("{:?}", issued.token).contains(secret));
    }

    #[test]
    fn test_session_tokens_are_fresh() {
        let issuer = issuer();
        let user_id = Uuid::new_v4();
        let a = issuer.issue_session(user_id, Role::User, Utc::now()).unwrap();
        let b = issuer.issue_session(user_id, Role::User, Utc::now()).unwrap();
        assert_ne!(a.csrf, b.csrf);
        assert_ne!(a.refresh.hash, b.refresh.hash);
    }
}
