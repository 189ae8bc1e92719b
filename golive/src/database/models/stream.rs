//! Managed stream database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Managed stream database model.
/// A stream is the unit the coordinator starts and stops: one ingest, one
/// encoder process, at most one broadcast bound at a time.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct StreamDbModel {
    pub id: String,
    pub name: String,
    /// Remote channel this stream broadcasts on.
    pub channel: String,
    /// Title applied to broadcasts created for this stream.
    pub title: String,
    pub description: Option<String>,
    /// Current lifecycle status (offline, pending, live, stopping).
    pub status: String,
    /// Remote ingest endpoint id, reused across occurrences once created.
    pub ingest_id: Option<String>,
    /// Ingest address the encoder pushes to.
    pub ingest_address: Option<String>,
    /// Broadcast currently bound to this stream, if any.
    pub broadcast_id: Option<String>,
    /// Schedule occurrence that put this stream live, if any.
    pub active_schedule_id: Option<String>,
    /// Unix epoch milliseconds (UTC) when the current session should end.
    pub scheduled_end_time: Option<i64>,
    /// Unix epoch milliseconds (UTC) when created.
    pub created_at: i64,
    /// Unix epoch milliseconds (UTC) when last updated.
    pub updated_at: i64,
}

impl StreamDbModel {
    /// Create a new offline stream.
    pub fn new(
        name: impl Into<String>,
        channel: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        let now = crate::database::time::now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            channel: channel.into(),
            title: title.into(),
            description: None,
            status: StreamStatus::Offline.to_string(),
            ingest_id: None,
            ingest_address: None,
            broadcast_id: None,
            active_schedule_id: None,
            scheduled_end_time: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Status column parsed through the strum `EnumString` derive.
    pub fn parsed_status(&self) -> Option<StreamStatus> {
        self.status.parse().ok()
    }
}

/// Stream lifecycle statuses.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    /// No session in progress.
    Offline,
    /// An occurrence claimed the stream and startup is underway.
    Pending,
    /// Process active and broadcast live.
    Live,
    /// A stop is in progress (encoder teardown, broadcast completion).
    Stopping,
}

impl StreamStatus {
    /// Static form for SQL binds, matching the strum snake_case rendering.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Pending => "pending",
            Self::Live => "live",
            Self::Stopping => "stopping",
        }
    }

    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: StreamStatus) -> bool {
        use StreamStatus::*;
        match (self, target) {
            // An occurrence claims an offline stream.
            (Offline, Pending) => true,
            // Startup either completes or tears down.
            (Pending, Live | Offline) => true,
            // A live stream can only leave through the stop path.
            (Live, Stopping) => true,
            // Stop always lands back at offline.
            (Stopping, Offline) => true,
            _ => false,
        }
    }
}
