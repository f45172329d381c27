//! Generated playlists.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::track::RankedTrack;
use super::user::parse_uuid;
use crate::db::{parse_timestamp, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaylistKind {
    Weekly,
    Monthly,
    Custom,
}

impl PlaylistKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaylistKind::Weekly => "weekly",
            PlaylistKind::Monthly => "monthly",
            PlaylistKind::Custom => "custom",
        }
    }
}

impl fmt::Display for PlaylistKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlaylistKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "weekly" => Ok(PlaylistKind::Weekly),
            "monthly" => Ok(PlaylistKind::Monthly),
            "custom" => Ok(PlaylistKind::Custom),
            other => Err(format!("unknown playlist type {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct PlaylistRow {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub playlist_type: String,
    pub spotify_id: Option<String>,
    pub spotify_url: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Playlist {
    pub id: Uuid,
    #[serde(skip)]
    pub user_id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PlaylistKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spotify_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spotify_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<PlaylistRow> for Playlist {
    type Error = StoreError;

    fn try_from(row: PlaylistRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&row.id)?,
            user_id: parse_uuid(&row.user_id)?,
            kind: row.playlist_type.parse().map_err(StoreError::Corrupt)?,
            created_at: parse_timestamp(&row.created_at)?,
            name: row.name,
            spotify_id: row.spotify_id,
            spotify_url: row.spotify_url,
        })
    }
}

/// Calendar date as sent over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateParts {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

impl DateParts {
    pub fn to_date(self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, self.day)
    }
}

impl From<NaiveDate> for DateParts {
    fn from(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
            day: date.day(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePlaylistRequest {
    pub user_id: Uuid,
    #[serde(rename = "type")]
    pub kind: PlaylistKind,
    pub start_date: DateParts,
    /// Required for custom playlists, exclusive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateParts>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreatePlaylistResponse {
    pub id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PlaylistsResponse {
    pub playlists: Vec<Playlist>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PlaylistDetail {
    #[serde(flatten)]
    pub playlist: Playlist,
    pub tracks: Vec<RankedTrack>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PublishPlaylistRequest {
    pub user_id: Uuid,
    pub playlist_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishPlaylistResponse {
    pub id: String,
    pub url: String,
}

/// `"oct 7, 2024"`
pub fn playlist_name(start: NaiveDate) -> String {
    format!(
        "{} {}, {}",
        start.format("%b").to_string().to_lowercase(),
        start.day(),
        start.year()
    )
}
