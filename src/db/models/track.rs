//! Tracks and listening history.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::db::StoreError;

#[derive(Debug, Clone, FromRow)]
pub struct TrackRow {
    pub id: String,
    pub name: String,
    pub href: String,
    /// JSON array of artist names
    pub artists: String,
    pub image_url: Option<String>,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub name: String,
    pub href: String,
    pub artists: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub uri: String,
}

impl TryFrom<TrackRow> for Track {
    type Error = StoreError;

    fn try_from(row: TrackRow) -> Result<Self, Self::Error> {
        let artists = serde_json::from_str(&row.artists)
            .map_err(|e| StoreError::Corrupt(format!("track {} artists: {}", row.id, e)))?;
        Ok(Self {
            id: row.id,
            name: row.name,
            href: row.href,
            artists,
            image_url: row.image_url,
            uri: row.uri,
        })
    }
}

/// A track with its play count over some range.
#[derive(Debug, Clone, FromRow)]
pub struct RankedTrackRow {
    pub id: String,
    pub name: String,
    pub href: String,
    pub artists: String,
    pub image_url: Option<String>,
    pub uri: String,
    pub plays: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedTrack {
    #[serde(flatten)]
    pub track: Track,
    pub plays: i64,
}

impl TryFrom<RankedTrackRow> for RankedTrack {
    type Error = StoreError;

    fn try_from(row: RankedTrackRow) -> Result<Self, Self::Error> {
        let plays = row.plays;
        let track = Track::try_from(TrackRow {
            id: row.id,
            name: row.name,
            href: row.href,
            artists: row.artists,
            image_url: row.image_url,
            uri: row.uri,
        })?;
        Ok(Self { track, plays })
    }
}

#[derive(Debug, Deserialize)]
pub struct TopTracksQuery {
    /// Unix seconds, defaults to 24 hours before `end`
    pub start: Option<i64>,
    /// Unix seconds, defaults to now
    pub end: Option<i64>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TopTracksResponse {
    pub tracks: Vec<RankedTrack>,
}
