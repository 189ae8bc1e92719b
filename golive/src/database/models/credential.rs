//! Channel credential database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Channel credential database model.
///
/// One row per channel. Access tokens are short-lived and refreshed in place;
/// the refresh token survives until the remote service revokes the grant, at
/// which point the whole row is deleted and the principal must re-authorize.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CredentialDbModel {
    pub id: String,
    /// Account identity that authorized this credential.
    pub principal: String,
    /// Remote channel the tokens are scoped to.
    pub channel: String,
    pub access_token: String,
    pub refresh_token: String,
    /// Unix epoch milliseconds (UTC) when the access token expires.
    pub expires_at: i64,
    /// Whether this is the principal's default channel credential.
    pub is_default: bool,
    /// Unix epoch milliseconds (UTC) when created.
    pub created_at: i64,
    /// Unix epoch milliseconds (UTC) when last updated.
    pub updated_at: i64,
}

impl CredentialDbModel {
    /// Create a new credential for a channel.
    pub fn new(
        principal: impl Into<String>,
        channel: impl Into<String>,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: i64,
    ) -> Self {
        let now = crate::database::time::now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            principal: principal.into(),
            channel: channel.into(),
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at,
            is_default: false,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_new() {
        let cred = CredentialDbModel::new("user-1", "chan-1", "at", "rt", 1_700_000_000_000);
        assert_eq!(cred.principal, "user-1");
        assert_eq!(cred.channel, "chan-1");
        assert!(!cred.is_default);
        assert_eq!(cred.expires_at, 1_700_000_000_000);
    }
}
