//! Credential and refresh-session persistence.
//!
//! Handlers and startup code talk to [`CredentialStore`] rather than to SQL so
//! the authentication flow can be exercised against any backend.

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use super::{timestamp, DbPool, RefreshSession, RefreshSessionRow, User, UserRow};
use crate::auth::Role;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt stored data: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;

    async fn user_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;

    async fn refresh_session(&self, user_id: Uuid) -> Result<Option<RefreshSession>, StoreError>;

    /// Replace whatever session the user had.
    async fn upsert_refresh_session(&self, session: &RefreshSession) -> Result<(), StoreError>;

    /// Swap the stored session for `next` only if its hash still equals
    /// `expected_hash`. Returns `false` when another refresh got there first.
    async fn rotate_refresh_session(
        &self,
        expected_hash: &str,
        next: &RefreshSession,
    ) -> Result<bool, StoreError>;

    async fn delete_refresh_session(&self, user_id: Uuid) -> Result<(), StoreError>;

    async fn user_exists(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn role_exists(&self, role: Role) -> Result<bool, StoreError>;

    async fn admin_exists(&self) -> Result<bool, StoreError> {
        self.role_exists(Role::Admin).await
    }

    async fn service_account_exists(&self) -> Result<bool, StoreError> {
        self.role_exists(Role::Service).await
    }

    async fn create_user(
        &self,
        email: &str,
        password_hash: &str,
        role: Role,
    ) -> Result<User, StoreError>;

    /// Ids of non-service accounts, oldest first.
    async fn list_user_ids(&self, limit: u32) -> Result<Vec<Uuid>, StoreError>;
}

/// SQLite-backed store.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl CredentialStore for SqliteStore {
    async fn user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT id, email, password_hash, role, created_at FROM users WHERE email = ?",
        )
        .bind(email.trim())
        .fetch_optional(&self.pool)
        .await?;
        row.map(User::try_from).transpose()
    }

    async fn user_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT id, email, password_hash, role, created_at FROM users WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(User::try_from).transpose()
    }

    async fn refresh_session(&self, user_id: Uuid) -> Result<Option<RefreshSession>, StoreError> {
        let row: Option<RefreshSessionRow> = sqlx::query_as(
            "SELECT user_id, token_hash, expires_at FROM refresh_sessions WHERE user_id = ?",
        )
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(RefreshSession::try_from).transpose()
    }

    async fn upsert_refresh_session(&self, session: &RefreshSession) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO refresh_sessions (user_id, token_hash, expires_at, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                token_hash = excluded.token_hash,
                expires_at = excluded.expires_at,
                created_at = excluded.created_at
            "#,
        )
        .bind(session.user_id.to_string())
        .bind(&session.token_hash)
        .bind(timestamp(session.expires_at))
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn rotate_refresh_session(
        &self,
        expected_hash: &str,
        next: &RefreshSession,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE refresh_sessions
            SET token_hash = ?, expires_at = ?
            WHERE user_id = ? AND token_hash = ?
            "#,
        )
        .bind(&next.token_hash)
        .bind(timestamp(next.expires_at))
        .bind(next.user_id.to_string())
        .bind(expected_hash)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_refresh_session(&self, user_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM refresh_sessions WHERE user_id = ?")
            .bind(user_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn user_exists(&self, id: Uuid) -> Result<bool, StoreError> {
        let exists: (i64,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM users WHERE id = ?)")
            .bind(id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(exists.0 != 0)
    }

    async fn role_exists(&self, role: Role) -> Result<bool, StoreError> {
        let exists: (i64,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM users WHERE role = ?)")
                .bind(role.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(exists.0 != 0)
    }

    async fn create_user(
        &self,
        email: &str,
        password_hash: &str,
        role: Role,
    ) -> Result<User, StoreError> {
        let user = User {
            id: Uuid::new_v4(),
            email: email.trim().to_string(),
            password_hash: password_hash.to_string(),
            role,
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO users (id, email, password_hash, role, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(user.id.to_string())
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(role.as_str())
        .bind(timestamp(user.created_at))
        .execute(&self.pool)
        .await?;

        Ok(user)
    }

    async fn list_user_ids(&self, limit: u32) -> Result<Vec<Uuid>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM users WHERE role != 'service' ORDER BY created_at, id LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id,)| super::models::user::parse_uuid(&id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use chrono::Duration;

    async fn store() -> SqliteStore {
        SqliteStore::new(test_pool().await)
    }

    fn session(user_id: Uuid, hash: &str) -> RefreshSession {
        RefreshSession {
            user_id,
            token_hash: hash.to_string(),
            expires_at: Utc::now() + Duration::days(14),
        }
    }

    #[tokio::test]
    async fn test_create_and_lookup_user() {
        let store = store().await;
        let created = store
            .create_user("Ada@Example.com", "$argon2id$fake", Role::User)
            .await
            .unwrap();

        let by_email = store.user_by_email("ada@example.com").await.unwrap().unwrap();
        assert_eq!(by_email.id, created.id);
        assert_eq!(by_email.role, Role::User);

        let by_id = store.user_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(by_id.email, "Ada@Example.com");
        assert!(store.user_exists(created.id).await.unwrap());
        assert!(!store.user_exists(Uuid::new_v4()).await.unwrap());
        assert!(store.user_by_email("nobody@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_email_rejected() {
        let store = store().await;
        store.create_user("a@example.com", "h", Role::User).await.unwrap();
        let err = store
            .create_user("A@EXAMPLE.COM", "h", Role::User)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));
    }

    #[tokio::test]
    async fn test_role_existence() {
        let store = store().await;
        assert!(!store.admin_exists().await.unwrap());
        assert!(!store.service_account_exists().await.unwrap());

        store.create_user("root@example.com", "h", Role::Admin).await.unwrap();
        assert!(store.admin_exists().await.unwrap());
        assert!(!store.service_account_exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_list_user_ids_skips_service_accounts() {
        let store = store().await;
        let first = store.create_user("one@example.com", "h", Role::User).await.unwrap();
        store.create_user("svc@example.com", "h", Role::Service).await.unwrap();
        let admin = store.create_user("two@example.com", "h", Role::Admin).await.unwrap();

        let ids = store.list_user_ids(10).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&first.id));
        assert!(ids.contains(&admin.id));

        assert_eq!(store.list_user_ids(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_session_upsert_replaces() {
        let store = store().await;
        let user = store.create_user("a@example.com", "h", Role::User).await.unwrap();

        store.upsert_refresh_session(&session(user.id, "first")).await.unwrap();
        store.upsert_refresh_session(&session(user.id, "second")).await.unwrap();

        let stored = store.refresh_session(user.id).await.unwrap().unwrap();
        assert_eq!(stored.token_hash, "second");
    }

    #[tokio::test]
    async fn test_rotation_is_compare_and_swap() {
        let store = store().await;
        let user = store.create_user("a@example.com", "h", Role::User).await.unwrap();
        store.upsert_refresh_session(&session(user.id, "h1")).await.unwrap();

        assert!(store
            .rotate_refresh_session("h1", &session(user.id, "h2"))
            .await
            .unwrap());
        // A second rotation presenting the old hash loses
        assert!(!store
            .rotate_refresh_session("h1", &session(user.id, "h3"))
            .await
            .unwrap());

        let stored = store.refresh_session(user.id).await.unwrap().unwrap();
        assert_eq!(stored.token_hash, "h2");
    }

    #[tokio::test]
    async fn test_delete_refresh_session() {
        let store = store().await;
        let user = store.create_user("a@example.com", "h", Role::User).await.unwrap();
        store.upsert_refresh_session(&session(user.id, "h1")).await.unwrap();

        store.delete_refresh_session(user.id).await.unwrap();
        assert!(store.refresh_session(user.id).await.unwrap().is_none());
        assert!(!store
            .rotate_refresh_session("h1", &session(user.id, "h2"))
            .await
            .unwrap());
    }
}
