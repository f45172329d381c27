//! User and refresh-session models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::auth::Role;
use crate::db::{parse_timestamp, StoreError};

#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: String,
    pub email: String,
    pub password_hash: String,
    pub role: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&row.id)?,
            role: row
                .role
                .parse()
                .map_err(|e| StoreError::Corrupt(format!("user {}: {}", row.id, e)))?,
            created_at: parse_timestamp(&row.created_at)?,
            email: row.email,
            password_hash: row.password_hash,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct RefreshSessionRow {
    pub user_id: String,
    pub token_hash: String,
    pub expires_at: String,
}

/// The single live refresh token of a user, stored as a digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshSession {
    pub user_id: Uuid,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
}

impl RefreshSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

impl TryFrom<RefreshSessionRow> for RefreshSession {
    type Error = StoreError;

    fn try_from(row: RefreshSessionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            user_id: parse_uuid(&row.user_id)?,
            expires_at: parse_timestamp(&row.expires_at)?,
            token_hash: row.token_hash,
        })
    }
}

#[derive(Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

/// Body returned by login and refresh alongside the cookies.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: i64,
    pub token_type: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub id: Uuid,
    pub role: Role,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserIdsResponse {
    pub ids: Vec<Uuid>,
}

pub(crate) fn parse_uuid(value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|_| StoreError::Corrupt(format!("bad uuid {:?}", value)))
}
