use axum::{
    extract::{rejection::QueryRejection, Query, State},
    Json,
};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use super::error::ApiError;
use crate::auth::Identity;
use crate::db::{music, TopTracksQuery, TopTracksResponse};
use crate::AppState;

const DEFAULT_WINDOW_HOURS: i64 = 24;
const DEFAULT_LIMIT: u32 = 50;
const MAX_LIMIT: u32 = 1000;

fn from_unix(secs: i64, field: &str) -> Result<DateTime<Utc>, ApiError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| ApiError::bad_request(format!("{} is out of range", field)))
}

/// The caller's most played tracks between `start` and `end` (unix seconds).
pub async fn top_tracks(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    query: Result<Query<TopTracksQuery>, QueryRejection>,
) -> Result<Json<TopTracksResponse>, ApiError> {
    let Query(query) = query?;

    let end = match query.end {
        Some(secs) => from_unix(secs, "end")?,
        None => Utc::now(),
    };
    let start = match query.start {
        Some(secs) => from_unix(secs, "start")?,
        None => end
            .checked_sub_signed(Duration::hours(DEFAULT_WINDOW_HOURS))
            .ok_or_else(|| ApiError::bad_request("end is out of range"))?,
    };
    if end < start {
        return Err(ApiError::bad_request("end must not be before start"));
    }

    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(ApiError::bad_request(format!(
            "limit must be between 1 and {}",
            MAX_LIMIT
        )));
    }

    let tracks = music::top_tracks(&state.db, identity.user_id, start, end, Some(limit)).await?;
    Ok(Json(TopTracksResponse { tracks }))
}
