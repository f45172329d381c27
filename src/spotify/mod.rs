//! Spotify Web API client.
//!
//! Covers the OAuth authorization-code grant and the handful of endpoints the
//! service needs: the current profile, recently played tracks, and playlist
//! creation. Transient failures are retried by [`RetryClient`].

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::config::SpotifyConfig;
use crate::db::{SpotifyOAuthConfig, Track};
use crate::http::{RetryClient, RetryPolicy};

/// Scopes requested during authorization.
pub const SCOPES: &str = "user-read-private user-read-email user-library-read user-top-read \
user-read-recently-played playlist-modify-public playlist-modify-private ugc-image-upload";

/// Spotify caps the recently-played window at 50 items.
const RECENTLY_PLAYED_LIMIT: u32 = 50;

/// Tokens returned by the accounts service.
#[derive(Clone, Deserialize)]
pub struct Grant {
    pub access_token: String,
    pub token_type: String,
    #[serde(default)]
    pub scope: String,
    pub expires_in: i64,
    /// Absent on refresh when Spotify keeps the previous refresh token
    pub refresh_token: Option<String>,
}

impl Grant {
    /// When the access token stops working, counted from `issued_at`.
    pub fn expires_at(&self, issued_at: DateTime<Utc>) -> Result<DateTime<Utc>> {
        Duration::try_seconds(self.expires_in)
            .and_then(|ttl| issued_at.checked_add_signed(ttl))
            .with_context(|| format!("Spotify returned an unusable expires_in of {}", self.expires_in))
    }
}

impl std::fmt::Debug for Grant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Grant")
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .field("expires_in", &self.expires_in)
            .finish_non_exhaustive()
    }
}

/// One entry of the listening history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Play {
    pub track: Track,
    pub played_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedPlaylist {
    pub id: String,
    pub url: String,
}

// Wire types

#[derive(Deserialize)]
struct Profile {
    id: String,
}

#[derive(Deserialize)]
struct ExternalUrls {
    #[serde(default)]
    spotify: String,
}

#[derive(Deserialize)]
struct Image {
    url: String,
}

#[derive(Deserialize)]
struct Album {
    #[serde(default)]
    images: Vec<Image>,
}

#[derive(Deserialize)]
struct Artist {
    name: String,
}

#[derive(Deserialize)]
struct TrackObject {
    id: String,
    name: String,
    uri: String,
    album: Album,
    #[serde(default)]
    artists: Vec<Artist>,
    external_urls: ExternalUrls,
}

#[derive(Deserialize)]
struct PlayHistory {
    track: TrackObject,
    played_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RecentlyPlayed {
    #[serde(default)]
    items: Vec<PlayHistory>,
}

#[derive(Serialize)]
struct NewPlaylist<'a> {
    name: &'a str,
    public: bool,
    collaborative: bool,
    description: &'a str,
}

#[derive(Deserialize)]
struct PlaylistObject {
    id: String,
    external_urls: ExternalUrls,
}

#[derive(Serialize)]
struct AddTracks<'a> {
    uris: &'a [String],
    position: u32,
}

impl From<PlayHistory> for Play {
    fn from(item: PlayHistory) -> Self {
        let t = item.track;
        Play {
            track: Track {
                image_url: t.album.images.into_iter().next().map(|i| i.url),
                artists: t.artists.into_iter().map(|a| a.name).collect(),
                href: t.external_urls.spotify,
                id: t.id,
                name: t.name,
                uri: t.uri,
            },
            played_at: item.played_at,
        }
    }
}

async fn check(response: Response, expected: StatusCode, what: &str) -> Result<Response> {
    let status = response.status();
    if status != expected {
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("Spotify {} failed: {} - {}", what, status, body);
    }
    Ok(response)
}

#[derive(Debug, Clone)]
pub struct SpotifyClient {
    http: RetryClient,
    client_id: Option<String>,
    client_secret: Option<String>,
    redirect_uri: Option<String>,
    accounts_url: String,
    api_url: String,
}

impl SpotifyClient {
    pub fn new(config: &SpotifyConfig) -> Result<Self> {
        let http = RetryClient::new(RetryPolicy::with_max_retries(config.http_retries))
            .context("Failed to build Spotify HTTP client")?;
        Ok(Self::with_http(config, http))
    }

    pub fn with_http(config: &SpotifyConfig, http: RetryClient) -> Self {
        Self {
            http,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.clone(),
            accounts_url: config.accounts_url.trim_end_matches('/').to_string(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
        }
    }

    /// Settings the browser needs to send the user to Spotify's consent page.
    /// `None` until a client id and redirect uri are configured.
    pub fn oauth_config(&self) -> Option<SpotifyOAuthConfig> {
        Some(SpotifyOAuthConfig {
            response_type: "code".to_string(),
            client_id: self.client_id.clone()?,
            redirect_uri: self.redirect_uri.clone()?,
            scope: SCOPES.to_string(),
        })
    }

    fn client_credentials(&self) -> Result<(&str, &str)> {
        match (self.client_id.as_deref(), self.client_secret.as_deref()) {
            (Some(id), Some(secret)) => Ok((id, secret)),
            _ => anyhow::bail!("Spotify client credentials are not configured"),
        }
    }

    async fn token_request(&self, form: &[(&str, &str)], what: &str) -> Result<Grant> {
        let (client_id, client_secret) = self.client_credentials()?;
        let request = self
            .http
            .post(&format!("{}/api/token", self.accounts_url))
            .basic_auth(client_id, Some(client_secret))
            .form(form);

        let response = self
            .http
            .send(request)
            .await
            .with_context(|| format!("Failed to reach Spotify for {}", what))?;
        let response = check(response, StatusCode::OK, what).await?;
        response
            .json()
            .await
            .with_context(|| format!("Failed to parse Spotify {} response", what))
    }

    /// Trade an authorization code for tokens.
    pub async fn exchange_code(&self, code: &str) -> Result<Grant> {
        let redirect_uri = self
            .redirect_uri
            .as_deref()
            .context("Spotify redirect uri is not configured")?;
        self.token_request(
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
            ],
            "token exchange",
        )
        .await
    }

    /// Get a new access token. When Spotify does not rotate the refresh token
    /// the old one is carried over, so the returned grant always has one.
    pub async fn refresh(&self, refresh_token: &str) -> Result<Grant> {
        let mut grant = self
            .token_request(
                &[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token),
                ],
                "token refresh",
            )
            .await?;
        if grant.refresh_token.as_deref().map_or(true, str::is_empty) {
            grant.refresh_token = Some(refresh_token.to_string());
        }
        Ok(grant)
    }

    async fn send_api(
        &self,
        request: RequestBuilder,
        access_token: &str,
        expected: StatusCode,
        what: &str,
    ) -> Result<Response> {
        let response = self
            .http
            .send(request.bearer_auth(access_token))
            .await
            .with_context(|| format!("Failed to reach Spotify for {}", what))?;
        check(response, expected, what).await
    }

    pub async fn current_user_id(&self, access_token: &str) -> Result<String> {
        let request = self.http.get(&format!("{}/v1/me", self.api_url));
        let profile: Profile = self
            .send_api(request, access_token, StatusCode::OK, "profile lookup")
            .await?
            .json()
            .await
            .context("Failed to parse Spotify profile")?;
        Ok(profile.id)
    }

    /// The most recent plays, newest first.
    pub async fn recently_played(&self, access_token: &str) -> Result<Vec<Play>> {
        let request = self.http.get(&format!(
            "{}/v1/me/player/recently-played?limit={}",
            self.api_url, RECENTLY_PLAYED_LIMIT
        ));
        let history: RecentlyPlayed = self
            .send_api(request, access_token, StatusCode::OK, "recently played")
            .await?
            .json()
            .await
            .context("Failed to parse Spotify listening history")?;
        Ok(history.items.into_iter().map(Play::from).collect())
    }

    pub async fn create_playlist(
        &self,
        access_token: &str,
        spotify_user_id: &str,
        name: &str,
    ) -> Result<CreatedPlaylist> {
        let request = self
            .http
            .post(&format!("{}/v1/users/{}/playlists", self.api_url, spotify_user_id))
            .json(&NewPlaylist {
                name,
                public: true,
                collaborative: false,
                description: "",
            });
        let playlist: PlaylistObject = self
            .send_api(request, access_token, StatusCode::CREATED, "playlist creation")
            .await?
            .json()
            .await
            .context("Failed to parse Spotify playlist")?;
        Ok(CreatedPlaylist {
            id: playlist.id,
            url: playlist.external_urls.spotify,
        })
    }

    /// Insert `uris` at the top of the playlist, keeping their order.
    pub async fn add_tracks(
        &self,
        access_token: &str,
        playlist_id: &str,
        uris: &[String],
    ) -> Result<()> {
        if uris.is_empty() {
            return Ok(());
        }
        let request = self
            .http
            .post(&format!("{}/v1/playlists/{}/tracks", self.api_url, playlist_id))
            .json(&AddTracks { uris, position: 0 });
        self.send_api(request, access_token, StatusCode::CREATED, "adding tracks")
            .await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oauth_config_requires_client_settings() {
        let client = SpotifyClient::new(&SpotifyConfig::default()).unwrap();
        assert!(client.oauth_config().is_none());

        let config = SpotifyConfig {
            client_id: Some("abc".to_string()),
            redirect_uri: Some("http://localhost/cb".to_string()),
            ..SpotifyConfig::default()
        };
        let oauth = SpotifyClient::new(&config).unwrap().oauth_config().unwrap();
        assert_eq!(oauth.response_type, "code");
        assert_eq!(oauth.client_id, "abc");
        assert!(oauth.scope.contains("user-read-recently-played"));
        assert!(oauth.scope.contains("playlist-modify-private"));
    }

    fn grant(expires_in: i64) -> Grant {
        Grant {
            access_token: "access".to_string(),
            token_type: "Bearer".to_string(),
            scope: String::new(),
            expires_in,
            refresh_token: None,
        }
    }

    #[test]
    fn test_grant_expiry() {
        let issued_at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(
            grant(3600).expires_at(issued_at).unwrap(),
            issued_at + Duration::hours(1)
        );

        let err = grant(i64::MAX).expires_at(issued_at).unwrap_err();
        assert!(err.to_string().contains("expires_in"));
        assert!(grant(i64::MAX / 1000).expires_at(issued_at).is_err());
    }

    #[tokio::test]
    async fn test_exchange_code() {
        let (config, log) = mock::serve().await;
        let client = SpotifyClient::new(&config).unwrap();

        let grant = client.exchange_code("good-code").await.unwrap();
        assert_eq!(grant.access_token, "spotify-access");
        assert_eq!(grant.refresh_token.as_deref(), Some("spotify-refresh"));

        let log = log.lock();
        assert_eq!(
            log.token_forms[0]["redirect_uri"],
            "http://localhost:3000/callback"
        );
    }

    #[tokio::test]
    async fn test_exchange_rejected_code_is_an_error() {
        let (config, _log) = mock::serve().await;
        let client = SpotifyClient::new(&config).unwrap();

        let err = client.exchange_code("stale-code").await.unwrap_err();
        assert!(err.to_string().contains("400"));
    }

    #[tokio::test]
    async fn test_refresh_keeps_previous_refresh_token() {
        let (config, _log) = mock::serve().await;
        let client = SpotifyClient::new(&config).unwrap();

        let grant = client.refresh("long-lived").await.unwrap();
        assert_eq!(grant.refresh_token.as_deref(), Some("long-lived"));
    }

    #[tokio::test]
    async fn test_recently_played_maps_tracks() {
        let (config, _log) = mock::serve().await;
        let client = SpotifyClient::new(&config).unwrap();

        let plays = client.recently_played("spotify-access").await.unwrap();
        assert_eq!(plays.len(), 3);
        let first = &plays[0].track;
        assert_eq!(first.id, "t1");
        assert_eq!(first.artists, vec!["Artist".to_string()]);
        assert_eq!(first.image_url.as_deref(), Some("https://i.scdn.co/t1"));
        assert_eq!(first.href, "https://open.spotify.com/track/t1");
        assert_eq!(first.uri, "spotify:track:t1");

        assert!(client.recently_played("wrong").await.is_err());
    }

    #[tokio::test]
    async fn test_create_playlist_and_add_tracks() {
        let (config, log) = mock::serve().await;
        let client = SpotifyClient::new(&config).unwrap();

        let created = client
            .create_playlist("spotify-access", "spotify-user", "oct 4, 2024")
            .await
            .unwrap();
        assert_eq!(created.id, "sp-playlist");

        let uris = vec!["spotify:track:t1".to_string(), "spotify:track:t2".to_string()];
        client
            .add_tracks("spotify-access", &created.id, &uris)
            .await
            .unwrap();

        let log = log.lock();
        let (user, body) = &log.created_playlists[0];
        assert_eq!(user, "spotify-user");
        assert_eq!(body["name"], "oct 4, 2024");
        assert_eq!(body["public"], true);
        let (playlist, body) = &log.added_tracks[0];
        assert_eq!(playlist, "sp-playlist");
        assert_eq!(body["uris"][1], "spotify:track:t2");
        assert_eq!(body["position"], 0);
    }
}
