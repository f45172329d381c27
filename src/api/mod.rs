pub mod auth;
pub mod error;
pub mod middleware;
mod playlists;
mod spotify;
mod tracks;
mod users;

pub use error::{ApiError, ErrorCode};

use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use crate::AppState;

/// What a route demands of the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    Public,
    /// Any valid access token
    Authenticated,
    /// An `admin` or `service` access token
    Elevated,
}

/// Security requirement of a path. Paths not listed, including unknown ones,
/// need an access token.
pub fn route_security(path: &str) -> Security {
    match path {
        "/health"
        | "/api/health"
        | "/api/login"
        | "/api/auth/refresh"
        | "/api/oauth/spotify/config.json" => Security::Public,
        "/api/oauth/spotify/token/refresh" | "/api/users" => Security::Elevated,
        _ => Security::Authenticated,
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        // Session
        .route("/login", post(auth::login))
        .route("/logout", post(auth::logout))
        .route("/auth/refresh", post(auth::refresh))
        .route("/auth/verify", get(auth::verify))
        // Users
        .route("/users", get(users::list_user_ids))
        // Spotify OAuth
        .route("/oauth/spotify/config.json", get(spotify::oauth_config))
        .route("/oauth/spotify/token", post(spotify::exchange_token))
        .route("/oauth/spotify/token/refresh", post(spotify::refresh_token))
        .route("/spotify/status", get(spotify::status))
        // Spotify integration
        .route("/integrations/spotify/tracks/sync", post(spotify::sync_tracks))
        .route("/integrations/spotify/playlist", post(spotify::publish_playlist))
        // Playlists and listening history
        .route("/playlists", post(playlists::create_playlist))
        .route("/playlists/:id", get(playlists::get_playlist))
        .route("/me/playlists", get(playlists::list_playlists))
        .route("/tracks/top", get(tracks::top_tracks));

    // Outermost layer last: trace, request id, panic recovery, auth
    Router::new()
        .route("/health", get(health_check))
        .nest("/api", api_routes)
        .fallback(not_found)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ))
        .layer(CatchPanicLayer::custom(middleware::handle_panic))
        .layer(axum_middleware::from_fn(middleware::request_id))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn not_found() -> ApiError {
    ApiError::from(ErrorCode::NotFound)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Router harness backed by an in-memory database.

    use axum::{
        body::Body,
        http::{header, HeaderMap, Request, StatusCode},
        Router,
    };
    use axum_extra::extract::cookie::Cookie;
    use chrono::Duration;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    use super::create_router;
    use crate::auth::cookies::{ACCESS_COOKIE, CSRF_COOKIE, CSRF_HEADER, REFRESH_COOKIE};
    use crate::auth::{Role, TokenIssuer};
    use crate::config::{Config, SpotifyConfig};
    use crate::crypto::{HashParams, PasswordHasher};
    use crate::db::{test_pool, CredentialStore, SqliteStore, User};
    use crate::spotify::SpotifyClient;
    use crate::AppState;

    pub const PASSWORD: &str = "correct horse battery staple";

    pub struct TestApp {
        pub state: Arc<AppState>,
        pub router: Router,
    }

    /// Cookies handed out by a login or refresh.
    #[derive(Debug, Clone)]
    pub struct Session {
        pub access: String,
        pub refresh: String,
        pub csrf: String,
    }

    pub struct Reply {
        pub status: StatusCode,
        pub headers: HeaderMap,
        pub body: Value,
    }

    impl Reply {
        pub fn code(&self) -> &str {
            self.body["code"].as_str().unwrap_or_default()
        }

        pub fn session(&self) -> Session {
            let mut session = Session {
                access: String::new(),
                refresh: String::new(),
                csrf: String::new(),
            };
            for value in self.headers.get_all(header::SET_COOKIE) {
                let cookie = Cookie::parse_encoded(value.to_str().unwrap().to_string()).unwrap();
                let slot = match cookie.name() {
                    ACCESS_COOKIE => &mut session.access,
                    REFRESH_COOKIE => &mut session.refresh,
                    CSRF_COOKIE => &mut session.csrf,
                    _ => continue,
                };
                *slot = cookie.value().to_string();
            }
            session
        }
    }

    impl Session {
        fn cookie_header(&self) -> String {
            format!(
                "{}={}; {}={}",
                ACCESS_COOKIE, self.access, CSRF_COOKIE, self.csrf
            )
        }

        pub fn get(&self, uri: &str) -> Request<Body> {
            Request::builder()
                .uri(uri)
                .header(header::COOKIE, self.cookie_header())
                .body(Body::empty())
                .unwrap()
        }

        pub fn post(&self, uri: &str, body: Value) -> Request<Body> {
            Request::builder()
                .method("POST")
                .uri(uri)
                .header(header::COOKIE, self.cookie_header())
                .header(CSRF_HEADER, &self.csrf)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap()
        }
    }

    pub fn json_post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    impl TestApp {
        pub async fn new() -> Self {
            Self::with_spotify(SpotifyConfig::default()).await
        }

        pub async fn with_spotify(spotify: SpotifyConfig) -> Self {
            let mut config = Config::default();
            config.spotify = spotify;
            let db = test_pool().await;
            let state = Arc::new(AppState {
                store: Arc::new(SqliteStore::new(db.clone())),
                tokens: TokenIssuer::new(
                    b"router-test-secret",
                    "1",
                    Duration::minutes(30),
                    Duration::days(14),
                ),
                hasher: PasswordHasher::new(HashParams {
                    memory_kib: 256,
                    iterations: 1,
                    parallelism: 1,
                    salt_length: 16,
                    key_length: 32,
                }),
                spotify: SpotifyClient::new(&config.spotify).unwrap(),
                timezone: chrono_tz::America::New_York,
                db,
                config,
            });
            Self {
                router: create_router(state.clone()),
                state,
            }
        }

        pub async fn create_user(&self, email: &str, role: Role) -> User {
            let hash = self.state.hasher.hash(PASSWORD).unwrap();
            self.state.store.create_user(email, &hash, role).await.unwrap()
        }

        pub async fn send(&self, request: Request<Body>) -> Reply {
            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let headers = response.headers().clone();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            let body = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes)
                    .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into()))
            };
            Reply {
                status,
                headers,
                body,
            }
        }

        pub async fn login(&self, email: &str) -> Session {
            let reply = self
                .send(json_post(
                    "/api/login",
                    serde_json::json!({"email": email, "password": PASSWORD}),
                ))
                .await;
            assert_eq!(reply.status, StatusCode::OK, "login failed: {}", reply.body);
            reply.session()
        }

        /// Serve the router on an ephemeral local port and return its base url.
        pub async fn serve(&self) -> String {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base = format!("http://{}", listener.local_addr().unwrap());
            let router = self.router.clone();
            tokio::spawn(async move {
                axum::serve(listener, router).await.unwrap();
            });
            base
        }

        /// Create a user and log in as them.
        pub async fn user_session(&self, email: &str, role: Role) -> (User, Session) {
            let user = self.create_user(email, role).await;
            let session = self.login(email).await;
            (user, session)
        }
    }
}
