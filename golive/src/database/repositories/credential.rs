//! Credential repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::CredentialDbModel;
use crate::{Error, Result};

/// Credential repository trait.
#[async_trait]
pub trait CredentialRepository: Send + Sync {
    async fn get_credential(&self, id: &str) -> Result<CredentialDbModel>;
    async fn get_credential_by_channel(&self, channel: &str) -> Result<CredentialDbModel>;
    async fn get_default_credential(&self, principal: &str) -> Result<CredentialDbModel>;
    async fn list_credentials_by_principal(&self, principal: &str)
    -> Result<Vec<CredentialDbModel>>;
    async fn create_credential(&self, credential: &CredentialDbModel) -> Result<()>;
    /// Persist refreshed tokens. A `None` refresh token keeps the stored one;
    /// the remote service only returns a new refresh token when it rotates it.
    async fn update_tokens(
        &self,
        id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at_ms: i64,
    ) -> Result<()>;
    /// Make `id` the principal's default credential. Clears any previous
    /// default in the same transaction so there is never more than one.
    async fn set_default_credential(&self, principal: &str, id: &str) -> Result<()>;
    async fn delete_credential(&self, id: &str) -> Result<()>;
}

/// SQLx implementation of CredentialRepository.
pub struct SqlxCredentialRepository {
    pool: SqlitePool,
}

impl SqlxCredentialRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialRepository for SqlxCredentialRepository {
    async fn get_credential(&self, id: &str) -> Result<CredentialDbModel> {
        sqlx::query_as::<_, CredentialDbModel>("SELECT * FROM credentials WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Credential", id))
    }

    async fn get_credential_by_channel(&self, channel: &str) -> Result<CredentialDbModel> {
        sqlx::query_as::<_, CredentialDbModel>("SELECT * FROM credentials WHERE channel = ?")
            .bind(channel)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Credential", channel))
    }

    async fn get_default_credential(&self, principal: &str) -> Result<CredentialDbModel> {
        sqlx::query_as::<_, CredentialDbModel>(
            "SELECT * FROM credentials WHERE principal = ? AND is_default = 1",
        )
        .bind(principal)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::not_found("Default credential", principal))
    }

    async fn list_credentials_by_principal(
        &self,
        principal: &str,
    ) -> Result<Vec<CredentialDbModel>> {
        let credentials = sqlx::query_as::<_, CredentialDbModel>(
            "SELECT * FROM credentials WHERE principal = ? ORDER BY channel",
        )
        .bind(principal)
        .fetch_all(&self.pool)
        .await?;
        Ok(credentials)
    }

    async fn create_credential(&self, credential: &CredentialDbModel) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO credentials (
                id, principal, channel, access_token, refresh_token,
                expires_at, is_default, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&credential.id)
        .bind(&credential.principal)
        .bind(&credential.channel)
        .bind(&credential.access_token)
        .bind(&credential.refresh_token)
        .bind(credential.expires_at)
        .bind(credential.is_default)
        .bind(credential.created_at)
        .bind(credential.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Err(
                Error::validation(format!("credential already exists for channel {}", credential.channel)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_tokens(
        &self,
        id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at_ms: i64,
    ) -> Result<()> {
        let now = crate::database::time::now_ms();
        sqlx::query(
            r#"
            UPDATE credentials
            SET access_token = ?,
                refresh_token = COALESCE(?, refresh_token),
                expires_at = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(access_token)
        .bind(refresh_token)
        .bind(expires_at_ms)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_default_credential(&self, principal: &str, id: &str) -> Result<()> {
        let now = crate::database::time::now_ms();
        let mut tx = crate::database::begin_immediate(&self.pool).await?;

        sqlx::query("UPDATE credentials SET is_default = 0, updated_at = ? WHERE principal = ? AND is_default = 1")
            .bind(now)
            .bind(principal)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query(
            "UPDATE credentials SET is_default = 1, updated_at = ? WHERE id = ? AND principal = ?",
        )
        .bind(now)
        .bind(id)
        .bind(principal)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(Error::not_found("Credential", id));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_credential(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM credentials WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
