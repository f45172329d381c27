//! Spotify OAuth and integration endpoints.

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use chrono::{Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use super::auth::ensure_may_act_for;
use super::error::{ApiError, ErrorCode};
use crate::auth::Identity;
use crate::db::{
    music, PublishPlaylistRequest, PublishPlaylistResponse, SpotifyOAuthConfig,
    SpotifyStatusResponse, SpotifyToken, TokenExchangeRequest, UserIdRequest,
};
use crate::spotify::Grant;
use crate::AppState;

/// Access tokens this close to expiry are refreshed before use
const REFRESH_MARGIN_SECS: i64 = 60;

async fn connected_token(state: &AppState, user_id: Uuid) -> Result<SpotifyToken, ApiError> {
    music::spotify_token(&state.db, user_id)
        .await?
        .ok_or_else(|| ErrorCode::NoSpotifyIntegration.into())
}

/// Refresh `token` with Spotify and store the result.
async fn refresh_grant(state: &AppState, token: SpotifyToken) -> Result<SpotifyToken, ApiError> {
    let grant = state.spotify.refresh(&token.refresh_token).await?;
    let refreshed = apply_grant(token, grant)?;
    music::upsert_spotify_token(&state.db, &refreshed).await?;
    tracing::debug!(user_id = %refreshed.user_id, "Refreshed Spotify token");
    Ok(refreshed)
}

fn apply_grant(token: SpotifyToken, grant: Grant) -> anyhow::Result<SpotifyToken> {
    Ok(SpotifyToken {
        expires_at: grant.expires_at(Utc::now())?,
        refresh_token: grant.refresh_token.unwrap_or(token.refresh_token),
        access_token: grant.access_token,
        token_type: grant.token_type,
        scope: grant.scope,
        ..token
    })
}

/// The user's Spotify grant, refreshed first when it is about to expire.
async fn usable_token(state: &AppState, user_id: Uuid) -> Result<SpotifyToken, ApiError> {
    let token = connected_token(state, user_id).await?;
    if token.expires_at - Utc::now() > Duration::seconds(REFRESH_MARGIN_SECS) {
        return Ok(token);
    }
    refresh_grant(state, token).await
}

/// Public settings for starting the authorization flow
pub async fn oauth_config(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SpotifyOAuthConfig>, ApiError> {
    state
        .spotify
        .oauth_config()
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Spotify integration is not configured"))
}

/// Exchange an authorization code and connect Spotify to the caller's account.
pub async fn exchange_token(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    payload: Result<Json<TokenExchangeRequest>, JsonRejection>,
) -> Result<Json<SpotifyStatusResponse>, ApiError> {
    let Json(request) = payload?;

    let grant = state.spotify.exchange_code(&request.code).await.map_err(|e| {
        tracing::warn!(user_id = %identity.user_id, error = %format!("{:#}", e), "Spotify code exchange failed");
        ApiError::bad_request("Spotify rejected the authorization code")
    })?;
    let spotify_user_id = state.spotify.current_user_id(&grant.access_token).await?;
    let refresh_token = grant
        .refresh_token
        .clone()
        .context("Spotify did not return a refresh token")?;

    let token = SpotifyToken {
        user_id: identity.user_id,
        spotify_user_id,
        access_token: grant.access_token.clone(),
        refresh_token,
        token_type: grant.token_type.clone(),
        scope: grant.scope.clone(),
        expires_at: grant.expires_at(Utc::now())?,
    };
    music::upsert_spotify_token(&state.db, &token).await?;

    tracing::info!(
        user_id = %identity.user_id,
        spotify_user_id = %token.spotify_user_id,
        "Connected Spotify account"
    );
    Ok(Json(SpotifyStatusResponse {
        connected: true,
        spotify_user_id: Some(token.spotify_user_id),
        expires_at: Some(token.expires_at),
    }))
}

/// Refresh a user's Spotify token. Elevated callers only.
pub async fn refresh_token(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<UserIdRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(request) = payload?;
    let token = connected_token(&state, request.user_id).await?;
    refresh_grant(&state, token).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn status(
    State(state): State<Arc<AppState>>,
    identity: Identity,
) -> Result<Json<SpotifyStatusResponse>, ApiError> {
    let token = music::spotify_token(&state.db, identity.user_id).await?;
    Ok(Json(SpotifyStatusResponse {
        connected: token.is_some(),
        spotify_user_id: token.as_ref().map(|t| t.spotify_user_id.clone()),
        expires_at: token.as_ref().map(|t| t.expires_at),
    }))
}

/// Pull the user's recently played tracks into the listening history.
pub async fn sync_tracks(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    payload: Result<Json<UserIdRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(request) = payload?;
    ensure_may_act_for(&identity, request.user_id)?;

    let token = usable_token(&state, request.user_id).await?;
    let plays: Vec<_> = state
        .spotify
        .recently_played(&token.access_token)
        .await?
        .into_iter()
        .map(|play| (play.track, play.played_at))
        .collect();

    let recorded = music::record_plays(&state.db, request.user_id, &plays).await?;
    tracing::debug!(
        user_id = %request.user_id,
        fetched = plays.len(),
        recorded,
        "Synced Spotify listening history"
    );
    Ok(StatusCode::NO_CONTENT)
}

/// Create a stored playlist on the user's Spotify account.
///
/// Publishing is idempotent: a playlist already on Spotify returns its
/// existing id and url with `200`.
pub async fn publish_playlist(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    payload: Result<Json<PublishPlaylistRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<PublishPlaylistResponse>), ApiError> {
    let Json(request) = payload?;
    ensure_may_act_for(&identity, request.user_id)?;

    let playlist = music::user_playlist(&state.db, request.user_id, request.playlist_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Playlist not found"))?;
    if let (Some(id), Some(url)) = (playlist.spotify_id, playlist.spotify_url) {
        return Ok((StatusCode::OK, Json(PublishPlaylistResponse { id, url })));
    }

    let token = usable_token(&state, request.user_id).await?;
    let uris: Vec<String> = music::playlist_tracks(&state.db, playlist.id)
        .await?
        .into_iter()
        .map(|entry| entry.track.uri)
        .collect();

    let created = state
        .spotify
        .create_playlist(&token.access_token, &token.spotify_user_id, &playlist.name)
        .await?;
    state
        .spotify
        .add_tracks(&token.access_token, &created.id, &uris)
        .await?;
    music::set_playlist_spotify(&state.db, playlist.id, &created.id, &created.url).await?;

    tracing::info!(
        user_id = %request.user_id,
        playlist_id = %playlist.id,
        spotify_id = %created.id,
        tracks = uris.len(),
        "Published playlist to Spotify"
    );
    Ok((
        StatusCode::CREATED,
        Json(PublishPlaylistResponse {
            id: created.id,
            url: created.url,
        }),
    ))
}
