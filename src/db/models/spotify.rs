//! Stored Spotify OAuth grants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::user::parse_uuid;
use crate::db::{parse_timestamp, StoreError};

#[derive(Debug, Clone, FromRow)]
pub struct SpotifyTokenRow {
    pub user_id: String,
    pub spotify_user_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub scope: String,
    pub expires_at: String,
}

#[derive(Clone, PartialEq, Eq)]
pub struct SpotifyToken {
    pub user_id: Uuid,
    pub spotify_user_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub scope: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for SpotifyToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpotifyToken")
            .field("user_id", &self.user_id)
            .field("spotify_user_id", &self.spotify_user_id)
            .field("scope", &self.scope)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl TryFrom<SpotifyTokenRow> for SpotifyToken {
    type Error = StoreError;

    fn try_from(row: SpotifyTokenRow) -> Result<Self, Self::Error> {
        Ok(Self {
            user_id: parse_uuid(&row.user_id)?,
            expires_at: parse_timestamp(&row.expires_at)?,
            spotify_user_id: row.spotify_user_id,
            access_token: row.access_token,
            refresh_token: row.refresh_token,
            token_type: row.token_type,
            scope: row.scope,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct TokenExchangeRequest {
    pub code: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SpotifyStatusResponse {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spotify_user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Public OAuth settings the frontend needs to start the authorization flow.
#[derive(Debug, Serialize, Deserialize)]
pub struct SpotifyOAuthConfig {
    pub response_type: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: String,
}

/// Body of every per-user maintenance call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UserIdRequest {
    pub user_id: Uuid,
}
