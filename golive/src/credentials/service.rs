//! Credential service.
//!
//! Hands out access tokens that will stay valid for at least the configured
//! safety margin. Tokens inside the margin are refreshed before being handed
//! out, so a token cannot expire in the middle of a broadcast start sequence.

use std::sync::Arc;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::database::models::CredentialDbModel;
use crate::database::repositories::CredentialRepository;
use crate::database::time::{datetime_to_ms, ms_to_datetime};
use crate::Result;

use super::refresher::TokenRefresher;

/// Default safety margin: a token expiring within this window counts as stale.
pub const DEFAULT_REFRESH_MARGIN_MINUTES: i64 = 5;

/// A credential ready for use against the broadcast service.
#[derive(Debug, Clone)]
pub struct ChannelCredential {
    pub credential_id: String,
    pub principal: String,
    pub channel: String,
    pub access_token: String,
}

impl ChannelCredential {
    fn from_row(row: &CredentialDbModel) -> Self {
        Self {
            credential_id: row.id.clone(),
            principal: row.principal.clone(),
            channel: row.channel.clone(),
            access_token: row.access_token.clone(),
        }
    }
}

/// Credential service over a [`CredentialRepository`] and a [`TokenRefresher`].
pub struct CredentialService<R: CredentialRepository> {
    repository: Arc<R>,
    refresher: Arc<dyn TokenRefresher>,
    refresh_margin: Duration,
    /// Per-channel locks so concurrent callers trigger at most one refresh.
    refresh_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl<R: CredentialRepository> CredentialService<R> {
    pub fn new(repository: Arc<R>, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self::with_margin(
            repository,
            refresher,
            Duration::minutes(DEFAULT_REFRESH_MARGIN_MINUTES),
        )
    }

    pub fn with_margin(
        repository: Arc<R>,
        refresher: Arc<dyn TokenRefresher>,
        refresh_margin: Duration,
    ) -> Self {
        Self {
            repository,
            refresher,
            refresh_margin,
            refresh_locks: DashMap::new(),
        }
    }

    /// Get a fresh access token for a channel, refreshing if necessary.
    #[instrument(skip(self), fields(channel = %channel))]
    pub async fn get_valid_credential(&self, channel: &str) -> Result<ChannelCredential> {
        let row = self.repository.get_credential_by_channel(channel).await?;
        self.ensure_fresh(row).await
    }

    /// Get a fresh access token for a principal's default channel credential.
    #[instrument(skip(self), fields(principal = %principal))]
    pub async fn get_valid_default(&self, principal: &str) -> Result<ChannelCredential> {
        let row = self.repository.get_default_credential(principal).await?;
        self.ensure_fresh(row).await
    }

    fn is_fresh(&self, row: &CredentialDbModel) -> bool {
        ms_to_datetime(row.expires_at) - Utc::now() > self.refresh_margin
    }

    fn refresh_lock(&self, channel: &str) -> Arc<Mutex<()>> {
        self.refresh_locks
            .entry(channel.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn ensure_fresh(&self, row: CredentialDbModel) -> Result<ChannelCredential> {
        if self.is_fresh(&row) {
            return Ok(ChannelCredential::from_row(&row));
        }

        let lock = self.refresh_lock(&row.channel);
        let _guard = lock.lock().await;

        // Another caller may have refreshed while we waited for the lock.
        let row = self.repository.get_credential(&row.id).await?;
        if self.is_fresh(&row) {
            debug!(channel = %row.channel, "Token already refreshed by concurrent caller");
            return Ok(ChannelCredential::from_row(&row));
        }

        self.refresh_row(row).await
    }

    async fn refresh_row(&self, row: CredentialDbModel) -> Result<ChannelCredential> {
        info!(channel = %row.channel, "Refreshing access token");

        match self.refresher.refresh(&row.refresh_token).await {
            Ok(token) => {
                self.repository
                    .update_tokens(
                        &row.id,
                        &token.access_token,
                        token.refresh_token.as_deref(),
                        datetime_to_ms(token.expires_at),
                    )
                    .await?;
                if token.refresh_token.is_some() {
                    debug!(channel = %row.channel, "Refresh token rotated");
                }
                Ok(ChannelCredential {
                    credential_id: row.id,
                    principal: row.principal,
                    channel: row.channel,
                    access_token: token.access_token,
                })
            }
            Err(e) if e.requires_reauthorization() => {
                // The grant is dead. Keeping the row would make every later
                // occurrence burn its startup on the same rejection.
                error!(
                    channel = %row.channel,
                    principal = %row.principal,
                    error = %e,
                    "Refresh token revoked - deleting credential, re-authorization required"
                );
                self.repository.delete_credential(&row.id).await?;
                Err(e.into())
            }
            Err(e) => {
                warn!(channel = %row.channel, error = %e, "Token refresh failed");
                Err(e.into())
            }
        }
    }
}
