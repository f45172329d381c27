//! Session endpoints and the authentication middleware.

use axum::{
    async_trait,
    body::Bytes,
    extract::{rejection::JsonRejection, FromRequestParts, Request, State},
    http::{request::Parts, Method, StatusCode},
    middleware::Next,
    response::Response,
    Json,
};
use axum_extra::extract::cookie::CookieJar;
use chrono::Utc;
use std::sync::Arc;

use super::error::{ApiError, ErrorCode};
use super::{route_security, Security};
use crate::auth::cookies::{self, REFRESH_COOKIE};
use crate::auth::{Identity, RefreshToken, SessionTokens, TokenError};
use crate::crypto::constant_time_eq;
use crate::db::{LoginRequest, RefreshRequest, RefreshSession, TokenResponse, User, VerifyResponse};
use crate::AppState;

/// Methods that must carry a matching CSRF header.
fn is_state_changing(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

/// Authenticate the request and attach its [`Identity`].
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let path = request.uri().path().to_string();
    let security = route_security(&path);
    if security == Security::Public {
        return Ok(next.run(request).await);
    }

    let Some(token) = cookies::access_token(&jar, request.headers()) else {
        tracing::debug!(path = %path, "No access token presented");
        return Err(ErrorCode::InvalidAccessToken.into());
    };

    if is_state_changing(request.method()) {
        match cookies::csrf_pair(&jar, request.headers()) {
            Some((cookie, header)) if constant_time_eq(cookie.as_bytes(), header.as_bytes()) => {}
            Some(_) => {
                tracing::warn!(path = %path, "CSRF header does not match cookie");
                return Err(ErrorCode::InvalidCredentials.into());
            }
            None => {
                tracing::warn!(path = %path, "CSRF cookie or header missing");
                return Err(ErrorCode::InvalidCredentials.into());
            }
        }
    }

    let identity = state.tokens.validate_access(&token).map_err(|e| match e {
        TokenError::Expired => {
            tracing::debug!(path = %path, "Access token expired");
            ApiError::from(ErrorCode::ExpiredAccessToken)
        }
        other => {
            tracing::warn!(path = %path, error = %other, "Access token rejected");
            ApiError::from(ErrorCode::InvalidAccessToken)
        }
    })?;

    if security == Security::Elevated && !identity.role.is_elevated() {
        tracing::warn!(
            path = %path,
            user_id = %identity.user_id,
            role = %identity.role,
            "Elevated route refused"
        );
        return Err(ErrorCode::InsufficientPermissions.into());
    }

    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}

/// Extractor for the caller authenticated by [`auth_middleware`]
#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Identity {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Identity>()
            .cloned()
            .ok_or_else(|| ErrorCode::InvalidAccessToken.into())
    }
}

/// Require that `identity` may act on `user_id`.
pub(crate) fn ensure_may_act_for(identity: &Identity, user_id: uuid::Uuid) -> Result<(), ApiError> {
    if identity.may_act_for(user_id) {
        return Ok(());
    }
    tracing::warn!(
        caller = %identity.user_id,
        target = %user_id,
        "Caller tried to act on another user"
    );
    Err(ErrorCode::InsufficientPermissions.into())
}

fn session_response(
    state: &AppState,
    jar: CookieJar,
    tokens: &SessionTokens,
) -> (CookieJar, Json<TokenResponse>) {
    let jar = cookies::with_session(jar, tokens, state.config.server.secure_cookies);
    (
        jar,
        Json(TokenResponse {
            access_token: tokens.access.token.clone(),
            expires_in: tokens.access.ttl.num_seconds(),
            token_type: "bearer".to_string(),
        }),
    )
}

/// Issue a fresh token triple for `user`, replacing any previous session.
async fn start_session(state: &AppState, user: &User) -> Result<SessionTokens, ApiError> {
    let tokens = state.tokens.issue_session(user.id, user.role, Utc::now())?;
    state
        .store
        .upsert_refresh_session(&RefreshSession {
            user_id: user.id,
            token_hash: tokens.refresh.hash.clone(),
            expires_at: tokens.refresh.expires_at,
        })
        .await?;
    Ok(tokens)
}

/// Login endpoint
pub async fn login(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<(CookieJar, Json<TokenResponse>), ApiError> {
    let Json(request) = payload?;

    // Argon2 is slow, keep it off the async workers
    let hasher = state.hasher.clone();
    let password = request.password;

    let Some(user) = state.store.user_by_email(&request.email).await? else {
        // Same hashing cost as a wrong password
        tokio::task::spawn_blocking(move || hasher.verify_missing(&password)).await??;
        tracing::info!("Login attempt for unknown email");
        return Err(ErrorCode::InvalidCredentials.into());
    };

    let encoded = user.password_hash.clone();
    let matches =
        tokio::task::spawn_blocking(move || hasher.verify(&password, &encoded)).await??;
    if !matches {
        tracing::info!(user_id = %user.id, "Login with wrong password");
        return Err(ErrorCode::InvalidCredentials.into());
    }

    let tokens = start_session(&state, &user).await?;
    tracing::info!(user_id = %user.id, role = %user.role, "User logged in");
    Ok(session_response(&state, jar, &tokens))
}

/// Rotate the refresh token and issue a new triple.
///
/// The refresh token comes from the `refresh` cookie, or from a JSON body
/// `{"refresh_token": ...}` for clients without cookies.
pub async fn refresh(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    body: Bytes,
) -> Result<(CookieJar, Json<TokenResponse>), ApiError> {
    let from_cookie = jar
        .get(REFRESH_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty());
    let raw = match from_cookie {
        Some(raw) => raw,
        None => {
            let request: RefreshRequest = if body.is_empty() {
                RefreshRequest::default()
            } else {
                serde_json::from_slice(&body)
                    .map_err(|e| ApiError::bad_request(format!("Invalid request body: {}", e)))?
            };
            request
                .refresh_token
                .filter(|t| !t.is_empty())
                .ok_or_else(|| ApiError::from(ErrorCode::InvalidRefreshToken))?
        }
    };

    let presented = RefreshToken::parse(&raw).map_err(|e| {
        tracing::debug!(error = %e, "Unparseable refresh token");
        ApiError::from(ErrorCode::InvalidRefreshToken)
    })?;
    let user_id = presented.user_id;

    let Some(session) = state.store.refresh_session(user_id).await? else {
        tracing::info!(user_id = %user_id, "Refresh without a live session");
        return Err(ErrorCode::InvalidRefreshToken.into());
    };
    if !constant_time_eq(presented.hash().as_bytes(), session.token_hash.as_bytes()) {
        tracing::warn!(user_id = %user_id, "Refresh token does not match the live session");
        return Err(ErrorCode::InvalidRefreshToken.into());
    }

    let now = Utc::now();
    if session.is_expired(now) {
        tracing::info!(user_id = %user_id, "Refresh session expired");
        state.store.delete_refresh_session(user_id).await?;
        return Err(ErrorCode::ExpiredRefreshToken.into());
    }

    let Some(user) = state.store.user_by_id(user_id).await? else {
        tracing::warn!(user_id = %user_id, "Refresh session for a deleted user");
        return Err(ErrorCode::InvalidRefreshToken.into());
    };

    let tokens = state.tokens.issue_session(user.id, user.role, now)?;
    let next = RefreshSession {
        user_id,
        token_hash: tokens.refresh.hash.clone(),
        expires_at: tokens.refresh.expires_at,
    };
    if !state
        .store
        .rotate_refresh_session(&session.token_hash, &next)
        .await?
    {
        tracing::warn!(user_id = %user_id, "Refresh token was already rotated");
        return Err(ErrorCode::InvalidRefreshToken.into());
    }

    tracing::debug!(user_id = %user_id, "Session refreshed");
    Ok(session_response(&state, jar, &tokens))
}

/// Identity of the caller
pub async fn verify(identity: Identity) -> Json<VerifyResponse> {
    Json(VerifyResponse {
        id: identity.user_id,
        role: identity.role,
    })
}

pub async fn logout(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    identity: Identity,
) -> Result<(StatusCode, CookieJar), ApiError> {
    state.store.delete_refresh_session(identity.user_id).await?;
    tracing::info!(user_id = %identity.user_id, "User logged out");
    Ok((
        StatusCode::NO_CONTENT,
        cookies::cleared(jar, state.config.server.secure_cookies),
    ))
}
