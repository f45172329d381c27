//! [`MarsApi`] over HTTP, used by the scheduled sweeps to call this service.

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum_extra::extract::cookie::Cookie;
use reqwest::{
    header::{COOKIE, SET_COOKIE},
    RequestBuilder, Response, StatusCode,
};
use serde::Serialize;
use uuid::Uuid;

use super::sweep::{MarsApi, ServiceSession, UnitOutcome};
use crate::api::error::{ErrorCode, ErrorResponse};
use crate::auth::cookies::{ACCESS_COOKIE, CSRF_COOKIE, CSRF_HEADER};
use crate::config::secrets::ServiceCredentials;
use crate::db::{
    CreatePlaylistRequest, CreatePlaylistResponse, LoginRequest, PublishPlaylistRequest,
    UserIdRequest, UserIdsResponse,
};
use crate::http::{RetryClient, RetryPolicy};

#[derive(Debug, Clone)]
pub struct HttpMarsApi {
    http: RetryClient,
    base_url: String,
}

impl HttpMarsApi {
    pub fn new(base_url: &str, retries: u32) -> Result<Self> {
        let http = RetryClient::new(RetryPolicy::with_max_retries(retries))
            .context("Failed to build API client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder, session: &ServiceSession) -> RequestBuilder {
        request
            .header(
                COOKIE,
                format!(
                    "{}={}; {}={}",
                    ACCESS_COOKIE, session.access_token, CSRF_COOKIE, session.csrf_token
                ),
            )
            .header(CSRF_HEADER, &session.csrf_token)
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        session: &ServiceSession,
        path: &str,
        body: &T,
    ) -> Result<Response> {
        let request = self.authorized(self.http.post(&self.url(path)), session).json(body);
        self.http
            .send(request)
            .await
            .with_context(|| format!("Failed to reach {}", path))
    }
}

/// Stable error code of a failed response, if the body carries one.
fn error_code(body: &str) -> Option<String> {
    serde_json::from_str::<ErrorResponse>(body)
        .ok()
        .map(|e| e.code)
}

async fn failure(response: Response, what: &str) -> anyhow::Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    anyhow::anyhow!("{} failed: {} - {}", what, status, body)
}

/// Success, or a skip when the user has no Spotify connection.
async fn unit_outcome(response: Response, what: &str) -> Result<UnitOutcome> {
    let status = response.status();
    if status.is_success() {
        return Ok(UnitOutcome::Done);
    }

    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::NOT_FOUND
        && error_code(&body).as_deref() == Some(ErrorCode::NoSpotifyIntegration.as_str())
    {
        return Ok(UnitOutcome::Skipped);
    }
    anyhow::bail!("{} failed: {} - {}", what, status, body)
}

#[async_trait]
impl MarsApi for HttpMarsApi {
    async fn login(&self, credentials: &ServiceCredentials) -> Result<ServiceSession> {
        let request = self.http.post(&self.url("/api/login")).json(&LoginRequest {
            email: credentials.email.clone(),
            password: credentials.password.clone(),
        });
        let response = self
            .http
            .send(request)
            .await
            .context("Failed to reach login endpoint")?;
        if !response.status().is_success() {
            return Err(failure(response, "Login").await);
        }

        let mut access_token = None;
        let mut csrf_token = None;
        for value in response.headers().get_all(SET_COOKIE) {
            let Ok(raw) = value.to_str() else { continue };
            let Ok(cookie) = Cookie::parse_encoded(raw.to_string()) else {
                continue;
            };
            match cookie.name() {
                ACCESS_COOKIE => access_token = Some(cookie.value().to_string()),
                CSRF_COOKIE => csrf_token = Some(cookie.value().to_string()),
                _ => {}
            }
        }

        Ok(ServiceSession {
            access_token: access_token.context("Login response set no access cookie")?,
            csrf_token: csrf_token.context("Login response set no CSRF cookie")?,
        })
    }

    async fn list_users(&self, session: &ServiceSession, limit: u32) -> Result<Vec<Uuid>> {
        let request = self
            .authorized(self.http.get(&self.url("/api/users")), session)
            .query(&[("limit", limit)]);
        let response = self
            .http
            .send(request)
            .await
            .context("Failed to reach users endpoint")?;
        if !response.status().is_success() {
            return Err(failure(response, "Listing users").await);
        }

        let users: UserIdsResponse = response
            .json()
            .await
            .context("Failed to parse user list")?;
        Ok(users.ids)
    }

    async fn refresh_spotify_token(
        &self,
        session: &ServiceSession,
        user_id: Uuid,
    ) -> Result<UnitOutcome> {
        let response = self
            .post(
                session,
                "/api/oauth/spotify/token/refresh",
                &UserIdRequest { user_id },
            )
            .await?;
        unit_outcome(response, "Spotify token refresh").await
    }

    async fn sync_spotify_tracks(
        &self,
        session: &ServiceSession,
        user_id: Uuid,
    ) -> Result<UnitOutcome> {
        let response = self
            .post(
                session,
                "/api/integrations/spotify/tracks/sync",
                &UserIdRequest { user_id },
            )
            .await?;
        unit_outcome(response, "Track sync").await
    }

    async fn create_playlist(
        &self,
        session: &ServiceSession,
        request: &CreatePlaylistRequest,
    ) -> Result<Option<Uuid>> {
        let response = self.post(session, "/api/playlists", request).await?;
        match response.status() {
            StatusCode::CREATED | StatusCode::OK => {
                let created: CreatePlaylistResponse = response
                    .json()
                    .await
                    .context("Failed to parse created playlist")?;
                Ok(Some(created.id))
            }
            StatusCode::CONFLICT => Ok(None),
            _ => Err(failure(response, "Playlist creation").await),
        }
    }

    async fn publish_playlist(
        &self,
        session: &ServiceSession,
        request: &PublishPlaylistRequest,
    ) -> Result<UnitOutcome> {
        let response = self
            .post(session, "/api/integrations/spotify/playlist", request)
            .await?;
        unit_outcome(response, "Playlist publish").await
    }
}
