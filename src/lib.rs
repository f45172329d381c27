pub mod api;
pub mod auth;
pub mod config;
pub mod crypto;
pub mod db;
pub mod engine;
pub mod http;
pub mod spotify;
pub mod startup;

pub use db::DbPool;

use anyhow::Result;
use chrono_tz::Tz;
use config::Config;
use std::sync::Arc;

use crate::auth::TokenIssuer;
use crate::config::secrets::AppSecret;
use crate::crypto::PasswordHasher;
use crate::db::{CredentialStore, SqliteStore};
use crate::spotify::SpotifyClient;

pub struct AppState {
    pub config: Config,
    pub db: DbPool,
    pub store: Arc<dyn CredentialStore>,
    pub tokens: TokenIssuer,
    pub hasher: PasswordHasher,
    pub spotify: SpotifyClient,
    /// Zone that playlist periods are computed in
    pub timezone: Tz,
}

impl AppState {
    pub fn new(config: Config, db: DbPool, secret: &AppSecret) -> Result<Self> {
        let timezone = config.scheduler.tz()?;
        let spotify = SpotifyClient::new(&config.spotify)?;
        Ok(Self {
            store: Arc::new(SqliteStore::new(db.clone())),
            tokens: TokenIssuer::from_config(secret.as_bytes(), &config.auth),
            hasher: PasswordHasher::new(config.auth.password),
            spotify,
            timezone,
            db,
            config,
        })
    }
}
