//! Playlist generation from listening history.

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Datelike, Days, Months, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use uuid::Uuid;

use super::auth::ensure_may_act_for;
use super::error::{ApiError, ErrorCode};
use crate::auth::Identity;
use crate::db::{
    music, playlist_name, CreatePlaylistRequest, CreatePlaylistResponse, DateParts,
    PlaylistDetail, PlaylistKind, PlaylistsResponse,
};
use crate::engine::scheduler::resolve_local;
use crate::AppState;

/// Spotify accepts at most this many tracks per add request
const PLAYLIST_TRACK_LIMIT: u32 = 100;

/// Calendar range `[start, end)` a playlist covers.
pub(crate) fn playlist_period(
    kind: PlaylistKind,
    start: NaiveDate,
    end: Option<NaiveDate>,
) -> Result<(NaiveDate, NaiveDate), ApiError> {
    match kind {
        PlaylistKind::Weekly => {
            let end = start
                .checked_add_days(Days::new(7))
                .ok_or_else(|| ApiError::bad_request("start_date is out of range"))?;
            Ok((start, end))
        }
        PlaylistKind::Monthly => {
            let first = start.with_day(1).unwrap_or(start);
            let next = first
                .checked_add_months(Months::new(1))
                .ok_or_else(|| ApiError::bad_request("start_date is out of range"))?;
            Ok((first, next))
        }
        PlaylistKind::Custom => {
            let end = end.ok_or_else(|| {
                ApiError::bad_request("end_date is required for custom playlists")
            })?;
            if end <= start {
                return Err(ApiError::bad_request("end_date must be after start_date"));
            }
            Ok((start, end))
        }
    }
}

fn local_midnight(tz: &Tz, date: NaiveDate) -> Result<DateTime<Utc>, ApiError> {
    resolve_local(tz, date.and_time(NaiveTime::MIN))
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| ApiError::bad_request(format!("{} is out of range", date)))
}

fn parse_date(parts: DateParts, field: &str) -> Result<NaiveDate, ApiError> {
    parts
        .to_date()
        .ok_or_else(|| ApiError::bad_request(format!("{} is not a valid date", field)))
}

/// Build a playlist of the user's most played tracks for a period.
pub async fn create_playlist(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    payload: Result<Json<CreatePlaylistRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreatePlaylistResponse>), ApiError> {
    let Json(request) = payload?;
    ensure_may_act_for(&identity, request.user_id)?;

    let start = parse_date(request.start_date, "start_date")?;
    let end = request
        .end_date
        .map(|d| parse_date(d, "end_date"))
        .transpose()?;
    let (from, until) = playlist_period(request.kind, start, end)?;

    let tracks = music::top_tracks(
        &state.db,
        request.user_id,
        local_midnight(&state.timezone, from)?,
        local_midnight(&state.timezone, until)?,
        Some(PLAYLIST_TRACK_LIMIT),
    )
    .await?;
    if tracks.is_empty() {
        tracing::debug!(
            user_id = %request.user_id,
            kind = %request.kind,
            from = %from,
            "No tracks listened in period"
        );
        return Err(ErrorCode::NoTracksListened.into());
    }

    let name = playlist_name(from);
    let playlist =
        music::create_playlist(&state.db, request.user_id, &name, request.kind, &tracks).await?;

    tracing::info!(
        user_id = %request.user_id,
        playlist_id = %playlist.id,
        kind = %request.kind,
        tracks = tracks.len(),
        "Created playlist"
    );
    Ok((
        StatusCode::CREATED,
        Json(CreatePlaylistResponse { id: playlist.id }),
    ))
}

/// The caller's playlists, newest first
pub async fn list_playlists(
    State(state): State<Arc<AppState>>,
    identity: Identity,
) -> Result<Json<PlaylistsResponse>, ApiError> {
    let playlists = music::user_playlists(&state.db, identity.user_id).await?;
    Ok(Json(PlaylistsResponse { playlists }))
}

pub async fn get_playlist(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<PlaylistDetail>, ApiError> {
    let Path(id) = id?;
    let playlist = music::user_playlist(&state.db, identity.user_id, id)
        .await?
        .ok_or_else(|| ApiError::not_found("Playlist not found"))?;
    let tracks = music::playlist_tracks(&state.db, playlist.id).await?;
    Ok(Json(PlaylistDetail { playlist, tracks }))
}
