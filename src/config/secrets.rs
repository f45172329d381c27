//! Secrets resolved once at startup: the token signing secret and the
//! service-account credentials.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::AuthConfig;
use crate::crypto::{self, EntropyError};

const APP_SECRET_FILE: &str = "secret";
const APP_SECRET_BYTES: usize = 64;
const SERVICE_CREDENTIALS_FILE: &str = "service_credentials";
const SERVICE_PASSWORD_BYTES: usize = 32;
pub const DEFAULT_SERVICE_EMAIL: &str = "service@mars.local";

#[derive(Debug, Error)]
pub enum SecretsError {
    #[error("{0} is a directory, expected a secret file")]
    IsDirectory(PathBuf),
    #[error("{0} is empty")]
    Empty(PathBuf),
    #[error(
        "service account credentials incomplete: set both service_email and service_password, or neither"
    )]
    PartialServiceCredentials,
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Entropy(#[from] EntropyError),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> SecretsError + '_ {
    move |source| SecretsError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// HMAC key for access tokens.
#[derive(Clone)]
pub struct AppSecret(String);

impl AppSecret {
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Debug for AppSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AppSecret(..)")
    }
}

/// Login used by the scheduled jobs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCredentials {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for ServiceCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceCredentials")
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

/// Read `<data_dir>/secret`, creating it with fresh random content if absent.
pub fn load_or_create_app_secret(data_dir: &Path) -> Result<AppSecret, SecretsError> {
    let path = data_dir.join(APP_SECRET_FILE);

    match fs::metadata(&path) {
        Ok(meta) if meta.is_dir() => return Err(SecretsError::IsDirectory(path)),
        Ok(_) => {
            let content = fs::read_to_string(&path).map_err(io_error(&path))?;
            let secret = content.trim().to_string();
            if secret.is_empty() {
                return Err(SecretsError::Empty(path));
            }
            tracing::debug!(path = %path.display(), "Loaded application secret");
            return Ok(AppSecret(secret));
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(io_error(&path)(e)),
    }

    let secret = crypto::random_token(APP_SECRET_BYTES)?;
    write_private(&path, secret.as_bytes())?;
    tracing::info!(path = %path.display(), "Generated new application secret");
    Ok(AppSecret(secret))
}

/// Resolve the service account login.
///
/// Both configured: use them. Exactly one configured: error. Neither: read
/// `<data_dir>/service_credentials`, generating it on first start.
pub fn resolve_service_credentials(
    auth: &AuthConfig,
    data_dir: &Path,
) -> Result<ServiceCredentials, SecretsError> {
    match (&auth.service_email, &auth.service_password) {
        (Some(email), Some(password)) => {
            tracing::info!("Using configured service account credentials");
            return Ok(ServiceCredentials {
                email: email.clone(),
                password: password.clone(),
            });
        }
        (None, None) => {}
        _ => return Err(SecretsError::PartialServiceCredentials),
    }

    let path = data_dir.join(SERVICE_CREDENTIALS_FILE);
    match fs::read(&path) {
        Ok(data) => {
            let credentials: ServiceCredentials =
                serde_json::from_slice(&data).map_err(|source| SecretsError::Parse {
                    path: path.clone(),
                    source,
                })?;
            tracing::info!(path = %path.display(), "Using stored service account credentials");
            return Ok(credentials);
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(io_error(&path)(e)),
    }

    let credentials = ServiceCredentials {
        email: DEFAULT_SERVICE_EMAIL.to_string(),
        password: crypto::random_token(SERVICE_PASSWORD_BYTES)?,
    };
    let data = serde_json::to_vec(&credentials).map_err(|source| SecretsError::Parse {
        path: path.clone(),
        source,
    })?;
    write_private(&path, &data)?;
    tracing::info!(path = %path.display(), "Generated service account credentials");
    Ok(credentials)
}

/// Create `path` readable by the owner only. Fails if it already exists.
fn write_private(path: &Path, contents: &[u8]) -> Result<(), SecretsError> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path).map_err(io_error(path))?;
    file.write_all(contents).map_err(io_error(path))?;
    file.sync_all().map_err(io_error(path))?;
    Ok(())
}
