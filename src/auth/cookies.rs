//! Session cookies.
//!
//! `access` and `refresh` are HttpOnly. `csrf` must stay readable by browser
//! code so it can be echoed back in the `X-CSRF-Token` header.

use axum::http::HeaderMap;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};

use super::tokens::SessionTokens;

pub const ACCESS_COOKIE: &str = "access";
pub const REFRESH_COOKIE: &str = "refresh";
pub const CSRF_COOKIE: &str = "csrf";
pub const CSRF_HEADER: &str = "x-csrf-token";

fn base_cookie(name: &'static str, value: String, secure: bool) -> Cookie<'static> {
    Cookie::build((name, value))
        .path("/")
        .secure(secure)
        .same_site(SameSite::Lax)
        .build()
}

fn max_age(ttl: chrono::Duration) -> time::Duration {
    time::Duration::seconds(ttl.num_seconds())
}

/// Add the three session cookies to `jar`.
pub fn with_session(jar: CookieJar, tokens: &SessionTokens, secure: bool) -> CookieJar {
    let mut access = base_cookie(ACCESS_COOKIE, tokens.access.token.clone(), secure);
    access.set_http_only(true);
    access.set_max_age(max_age(tokens.access.ttl));

    let mut refresh = base_cookie(REFRESH_COOKIE, tokens.refresh.token.to_string(), secure);
    refresh.set_http_only(true);
    refresh.set_max_age(max_age(tokens.refresh.ttl));

    let csrf = base_cookie(CSRF_COOKIE, tokens.csrf.clone(), secure);

    jar.add(access).add(refresh).add(csrf)
}

/// Overwrite the session cookies with immediately-expiring blanks.
pub fn cleared(jar: CookieJar, secure: bool) -> CookieJar {
    [ACCESS_COOKIE, REFRESH_COOKIE, CSRF_COOKIE]
        .into_iter()
        .fold(jar, |jar, name| {
            let mut cookie = base_cookie(name, String::new(), secure);
            cookie.set_max_age(time::Duration::ZERO);
            jar.add(cookie)
        })
}

/// Access token from the `access` cookie, falling back to `Authorization: Bearer`.
pub fn access_token(jar: &CookieJar, headers: &HeaderMap) -> Option<String> {
    if let Some(cookie) = jar.get(ACCESS_COOKIE) {
        if !cookie.value().is_empty() {
            return Some(cookie.value().to_string());
        }
    }

    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

/// The CSRF value from the cookie and from the header, when both are present.
pub fn csrf_pair<'a>(jar: &'a CookieJar, headers: &'a HeaderMap) -> Option<(&'a str, &'a str)> {
    let cookie = jar.get(CSRF_COOKIE)?.value();
    let header = headers.get(CSRF_HEADER)?.to_str().ok()?;
    if cookie.is_empty() || header.is_empty() {
        return None;
    }
    Some((cookie, header))
}
