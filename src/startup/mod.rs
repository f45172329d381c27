//! Account bootstrap run before the server accepts requests.
//!
//! - An admin account must exist. On first start it is created from the
//!   configured admin credentials; without them startup is aborted.
//! - The service account the scheduled sweeps log in with is created if absent.

use anyhow::{bail, Context, Result};
use std::path::Path;
use tracing::{info, warn};

use crate::auth::Role;
use crate::config::secrets::ServiceCredentials;
use crate::config::AuthConfig;
use crate::crypto::PasswordHasher;
use crate::db::CredentialStore;

/// Create the data directory if needed.
pub fn ensure_data_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create data directory {}", path.display()))
}

/// Make sure an admin account exists.
pub async fn seed_admin(
    store: &dyn CredentialStore,
    hasher: &PasswordHasher,
    auth: &AuthConfig,
) -> Result<()> {
    if store.admin_exists().await? {
        info!("Admin account present");
        return Ok(());
    }

    let (Some(email), Some(password)) = (&auth.admin_email, &auth.admin_password) else {
        bail!(
            "No admin account exists: set auth.admin_email and auth.admin_password \
             (or MARS_ADMIN_EMAIL / MARS_ADMIN_PASSWORD) for the first start"
        );
    };
    if password.is_empty() {
        bail!("Admin password must not be empty");
    }
    if store.user_by_email(email).await?.is_some() {
        bail!("Cannot create admin {}: a non-admin account already uses that email", email);
    }

    let hash = hasher.hash(password).context("Failed to hash admin password")?;
    let admin = store.create_user(email, &hash, Role::Admin).await?;
    info!(user_id = %admin.id, email = %admin.email, "Created admin account");
    Ok(())
}

/// Make sure the service account for `credentials` exists.
pub async fn seed_service_account(
    store: &dyn CredentialStore,
    hasher: &PasswordHasher,
    credentials: &ServiceCredentials,
) -> Result<()> {
    if let Some(user) = store.user_by_email(&credentials.email).await? {
        if user.role != Role::Service {
            bail!(
                "Service account email {} belongs to a {} account",
                credentials.email,
                user.role
            );
        }
        if !hasher.verify(&credentials.password, &user.password_hash)? {
            warn!(
                email = %credentials.email,
                "Service account password does not match the configured one; scheduled jobs will fail to log in"
            );
        }
        return Ok(());
    }

    let hash = hasher
        .hash(&credentials.password)
        .context("Failed to hash service account password")?;
    let user = store
        .create_user(&credentials.email, &hash, Role::Service)
        .await?;
    info!(user_id = %user.id, email = %user.email, "Created service account");
    Ok(())
}
