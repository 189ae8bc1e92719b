//! Token refresh against the remote authorization server.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use super::CredentialError;

/// Grant error codes that mean the refresh token is dead for good.
///
/// Anything here deletes the stored credential; retrying would only get the
/// same answer until the principal re-authorizes.
const PERMANENT_GRANT_ERRORS: [&str; 4] = [
    "invalid_grant",
    "invalid_client",
    "unauthorized_client",
    "deleted_client",
];

const HTTP_TIMEOUT_SECS: u64 = 30;

/// Result of a successful token refresh.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    /// Present only when the authorization server rotated the refresh token.
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Exchange a refresh token for a fresh access token.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, CredentialError>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
}

#[derive(Deserialize)]
struct TokenErrorBody {
    error: String,
    error_description: Option<String>,
}

/// OAuth2 `refresh_token` grant against a configurable token endpoint.
pub struct HttpTokenRefresher {
    client: Client,
    token_endpoint: String,
    client_id: String,
    client_secret: String,
}

impl HttpTokenRefresher {
    pub fn new(
        token_endpoint: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self, CredentialError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            token_endpoint: token_endpoint.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        })
    }

    fn classify_failure(status: StatusCode, body: &str) -> CredentialError {
        if let Ok(err) = serde_json::from_str::<TokenErrorBody>(body) {
            if PERMANENT_GRANT_ERRORS.contains(&err.error.as_str()) {
                let detail = err.error_description.unwrap_or(err.error);
                return CredentialError::ReauthorizationRequired(detail);
            }
            if status == StatusCode::TOO_MANY_REQUESTS {
                return CredentialError::RateLimited;
            }
            let detail = err.error_description.unwrap_or(err.error);
            return CredentialError::RefreshFailed(format!("{status}: {detail}"));
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            return CredentialError::RateLimited;
        }
        CredentialError::RefreshFailed(format!("{status}: {body}"))
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    #[instrument(skip(self, refresh_token))]
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, CredentialError> {
        debug!("Requesting access token refresh");

        let response = self
            .client
            .post(&self.token_endpoint)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = Self::classify_failure(status, &body);
            warn!(%status, error = %err, "Token refresh rejected");
            return Err(err);
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| CredentialError::MalformedResponse(e.to_string()))?;

        if token.access_token.is_empty() {
            return Err(CredentialError::MalformedResponse(
                "empty access_token".to_string(),
            ));
        }
        if token.expires_in <= 0 {
            return Err(CredentialError::MalformedResponse(format!(
                "non-positive expires_in: {}",
                token.expires_in
            )));
        }

        Ok(RefreshedToken {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: Utc::now() + Duration::seconds(token.expires_in),
        })
    }
}
