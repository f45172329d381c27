//! Fan-out of one job across every user.
//!
//! A sweep logs in once as the service account, lists the users and runs one
//! task per user against the service's own API. Units never abort each other;
//! whatever failed is reported together once every task has finished.

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::config::secrets::ServiceCredentials;
use crate::db::{CreatePlaylistRequest, PlaylistKind, PublishPlaylistRequest};

/// Access token and CSRF token shared by every unit of a sweep.
#[derive(Clone)]
pub struct ServiceSession {
    pub access_token: String,
    pub csrf_token: String,
}

impl fmt::Debug for ServiceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ServiceSession(..)")
    }
}

/// Result of one per-user call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    Done,
    /// The user never connected Spotify
    Skipped,
}

/// Calls a sweep makes against the service.
#[async_trait]
pub trait MarsApi: Send + Sync {
    async fn login(&self, credentials: &ServiceCredentials) -> anyhow::Result<ServiceSession>;

    async fn list_users(&self, session: &ServiceSession, limit: u32) -> anyhow::Result<Vec<Uuid>>;

    async fn refresh_spotify_token(
        &self,
        session: &ServiceSession,
        user_id: Uuid,
    ) -> anyhow::Result<UnitOutcome>;

    async fn sync_spotify_tracks(
        &self,
        session: &ServiceSession,
        user_id: Uuid,
    ) -> anyhow::Result<UnitOutcome>;

    /// `None` when the user listened to nothing in the period.
    async fn create_playlist(
        &self,
        session: &ServiceSession,
        request: &CreatePlaylistRequest,
    ) -> anyhow::Result<Option<Uuid>>;

    async fn publish_playlist(
        &self,
        session: &ServiceSession,
        request: &PublishPlaylistRequest,
    ) -> anyhow::Result<UnitOutcome>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sweep {
    RefreshSpotifyTokens,
    SyncSpotifyTracks,
    CreatePlaylists {
        kind: PlaylistKind,
        start_date: NaiveDate,
    },
}

impl fmt::Display for Sweep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sweep::RefreshSpotifyTokens => f.write_str("refresh-spotify-tokens"),
            Sweep::SyncSpotifyTracks => f.write_str("sync-spotify-tracks"),
            Sweep::CreatePlaylists { kind, start_date } => {
                write!(f, "create-{}-playlists({})", kind, start_date)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Users the sweep ran for
    pub users: usize,
    /// Users without a Spotify connection
    pub skipped: usize,
}

#[derive(Debug)]
pub struct UnitFailure {
    pub user_id: Uuid,
    pub error: anyhow::Error,
}

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("service account login failed: {0:#}")]
    Login(anyhow::Error),
    #[error("listing users failed: {0:#}")]
    ListUsers(anyhow::Error),
    #[error("{} of {total} users failed: {}", .failures.len(), summarize(.failures))]
    Units {
        total: usize,
        failures: Vec<UnitFailure>,
    },
}

fn summarize(failures: &[UnitFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {:#}", f.user_id, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

pub struct BatchOrchestrator {
    api: Arc<dyn MarsApi>,
    credentials: ServiceCredentials,
    page_size: u32,
    limiter: Option<Arc<Semaphore>>,
}

impl BatchOrchestrator {
    /// `max_concurrency == 0` leaves the fan-out unbounded.
    pub fn new(
        api: Arc<dyn MarsApi>,
        credentials: ServiceCredentials,
        page_size: u32,
        max_concurrency: usize,
    ) -> Self {
        let limiter = (max_concurrency > 0).then(|| Arc::new(Semaphore::new(max_concurrency)));
        Self {
            api,
            credentials,
            page_size,
            limiter,
        }
    }

    pub async fn run(&self, sweep: &Sweep) -> Result<SweepReport, SweepError> {
        let session = self
            .api
            .login(&self.credentials)
            .await
            .map_err(SweepError::Login)?;
        let session = Arc::new(session);

        let users = self
            .api
            .list_users(&session, self.page_size)
            .await
            .map_err(SweepError::ListUsers)?;
        if users.is_empty() {
            tracing::debug!(sweep = %sweep, "No users to sweep");
            return Ok(SweepReport {
                users: 0,
                skipped: 0,
            });
        }

        tracing::info!(sweep = %sweep, users = users.len(), "Starting sweep");

        let failures: Arc<Mutex<Vec<UnitFailure>>> = Arc::new(Mutex::new(Vec::new()));
        let skipped = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::with_capacity(users.len());

        for user_id in users.iter().copied() {
            let api = self.api.clone();
            let session = session.clone();
            let sweep = sweep.clone();
            let failures = failures.clone();
            let skipped = skipped.clone();
            let limiter = self.limiter.clone();

            let handle = tokio::spawn(async move {
                // Held until the unit finishes; a closed semaphore only lifts the cap
                let _permit = match limiter {
                    Some(limiter) => limiter.acquire_owned().await.ok(),
                    None => None,
                };

                match run_unit(api.as_ref(), &session, &sweep, user_id).await {
                    Ok(UnitOutcome::Done) => {}
                    Ok(UnitOutcome::Skipped) => {
                        skipped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(error) => {
                        tracing::warn!(
                            sweep = %sweep,
                            user_id = %user_id,
                            error = %format!("{:#}", error),
                            "Sweep unit failed"
                        );
                        failures.lock().push(UnitFailure { user_id, error });
                    }
                }
            });
            handles.push((user_id, handle));
        }

        for (user_id, handle) in handles {
            if let Err(e) = handle.await {
                tracing::error!(sweep = %sweep, user_id = %user_id, error = %e, "Sweep unit panicked");
                failures.lock().push(UnitFailure {
                    user_id,
                    error: anyhow::anyhow!("task failed: {}", e),
                });
            }
        }

        let failures = std::mem::take(&mut *failures.lock());
        if !failures.is_empty() {
            return Err(SweepError::Units {
                total: users.len(),
                failures,
            });
        }

        Ok(SweepReport {
            users: users.len(),
            skipped: skipped.load(Ordering::Relaxed),
        })
    }
}

async fn run_unit(
    api: &dyn MarsApi,
    session: &ServiceSession,
    sweep: &Sweep,
    user_id: Uuid,
) -> anyhow::Result<UnitOutcome> {
    match sweep {
        Sweep::RefreshSpotifyTokens => api.refresh_spotify_token(session, user_id).await,
        Sweep::SyncSpotifyTracks => api.sync_spotify_tracks(session, user_id).await,
        Sweep::CreatePlaylists { kind, start_date } => {
            let request = CreatePlaylistRequest {
                user_id,
                kind: *kind,
                start_date: (*start_date).into(),
                end_date: None,
            };
            let Some(playlist_id) = api.create_playlist(session, &request).await? else {
                tracing::debug!(user_id = %user_id, "Nothing listened, no playlist");
                return Ok(UnitOutcome::Done);
            };
            api.publish_playlist(
                session,
                &PublishPlaylistRequest {
                    user_id,
                    playlist_id,
                },
            )
            .await
        }
    }
}
