//! Stream repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::StreamDbModel;
use crate::{Error, Result};

/// Stream repository trait.
///
/// Lifecycle mutations are compare-and-set on the status column and report
/// whether the row actually moved, so concurrent callers can race them safely
/// and exactly one observes success.
#[async_trait]
pub trait StreamRepository: Send + Sync {
    async fn get_stream(&self, id: &str) -> Result<StreamDbModel>;
    async fn list_streams(&self) -> Result<Vec<StreamDbModel>>;
    async fn list_streams_by_status(&self, status: &str) -> Result<Vec<StreamDbModel>>;
    /// Live streams whose scheduled end time has passed.
    async fn list_overdue_live(&self, now_ms: i64) -> Result<Vec<StreamDbModel>>;
    /// Live streams with no usable stop deadline: missing end time, missing
    /// occurrence reference, or a referenced occurrence that is gone or
    /// already settled.
    async fn list_stale_live(&self) -> Result<Vec<StreamDbModel>>;
    /// Streams parked in a transitional status (pending/stopping) since
    /// before `cutoff_ms`.
    async fn list_stuck_transitional(&self, cutoff_ms: i64) -> Result<Vec<StreamDbModel>>;
    async fn create_stream(&self, stream: &StreamDbModel) -> Result<()>;
    /// CAS offline -> pending, recording which occurrence claimed the stream.
    async fn claim_for_occurrence(&self, id: &str, schedule_id: &str) -> Result<bool>;
    /// Persist the ingest endpoint so later occurrences can reuse it.
    async fn set_ingest(&self, id: &str, ingest_id: &str, ingest_address: &str) -> Result<()>;
    /// CAS pending -> live, binding the broadcast and stop deadline.
    async fn set_live(
        &self,
        id: &str,
        broadcast_id: &str,
        scheduled_end_time_ms: i64,
    ) -> Result<bool>;
    /// CAS live -> stopping. Exactly one of several concurrent stop attempts
    /// wins this.
    async fn begin_stopping(&self, id: &str) -> Result<bool>;
    /// Return the stream to offline and drop broadcast/occurrence bindings.
    async fn clear_binding(&self, id: &str) -> Result<()>;
    async fn delete_stream(&self, id: &str) -> Result<()>;
}

/// SQLx implementation of StreamRepository.
pub struct SqlxStreamRepository {
    pool: SqlitePool,
}

impl SqlxStreamRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StreamRepository for SqlxStreamRepository {
    async fn get_stream(&self, id: &str) -> Result<StreamDbModel> {
        sqlx::query_as::<_, StreamDbModel>("SELECT * FROM streams WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Stream", id))
    }

    async fn list_streams(&self) -> Result<Vec<StreamDbModel>> {
        let streams = sqlx::query_as::<_, StreamDbModel>("SELECT * FROM streams ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(streams)
    }

    async fn list_streams_by_status(&self, status: &str) -> Result<Vec<StreamDbModel>> {
        let streams = sqlx::query_as::<_, StreamDbModel>(
            "SELECT * FROM streams WHERE status = ? ORDER BY name",
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await?;
        Ok(streams)
    }

    async fn list_overdue_live(&self, now_ms: i64) -> Result<Vec<StreamDbModel>> {
        let streams = sqlx::query_as::<_, StreamDbModel>(
            r#"
            SELECT * FROM streams
            WHERE status = 'live'
              AND scheduled_end_time IS NOT NULL
              AND scheduled_end_time <= ?
            ORDER BY scheduled_end_time
            "#,
        )
        .bind(now_ms)
        .fetch_all(&self.pool)
        .await?;
        Ok(streams)
    }

    async fn list_stale_live(&self) -> Result<Vec<StreamDbModel>> {
        // A live stream must carry an end time and reference an occurrence
        // that is still in progress. Anything else is leftover state from a
        // crash or manual meddling and gets force-stopped by reconciliation.
        let streams = sqlx::query_as::<_, StreamDbModel>(
            r#"
            SELECT streams.* FROM streams
            LEFT JOIN schedules ON schedules.id = streams.active_schedule_id
            WHERE streams.status = 'live'
              AND (
                streams.scheduled_end_time IS NULL
                OR streams.active_schedule_id IS NULL
                OR schedules.id IS NULL
                OR schedules.status NOT IN ('triggered', 'broadcast_bound', 'live')
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(streams)
    }

    async fn list_stuck_transitional(&self, cutoff_ms: i64) -> Result<Vec<StreamDbModel>> {
        let streams = sqlx::query_as::<_, StreamDbModel>(
            r#"
            SELECT * FROM streams
            WHERE status IN ('pending', 'stopping')
              AND updated_at < ?
            "#,
        )
        .bind(cutoff_ms)
        .fetch_all(&self.pool)
        .await?;
        Ok(streams)
    }

    async fn create_stream(&self, stream: &StreamDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO streams (
                id, name, channel, title, description, status,
                ingest_id, ingest_address, broadcast_id, active_schedule_id,
                scheduled_end_time, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&stream.id)
        .bind(&stream.name)
        .bind(&stream.channel)
        .bind(&stream.title)
        .bind(&stream.description)
        .bind(&stream.status)
        .bind(&stream.ingest_id)
        .bind(&stream.ingest_address)
        .bind(&stream.broadcast_id)
        .bind(&stream.active_schedule_id)
        .bind(&stream.scheduled_end_time)
        .bind(stream.created_at)
        .bind(stream.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_for_occurrence(&self, id: &str, schedule_id: &str) -> Result<bool> {
        let now = crate::database::time::now_ms();
        let result = sqlx::query(
            r#"
            UPDATE streams
            SET status = 'pending', active_schedule_id = ?, updated_at = ?
            WHERE id = ? AND status = 'offline'
            "#,
        )
        .bind(schedule_id)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_ingest(&self, id: &str, ingest_id: &str, ingest_address: &str) -> Result<()> {
        let now = crate::database::time::now_ms();
        sqlx::query(
            "UPDATE streams SET ingest_id = ?, ingest_address = ?, updated_at = ? WHERE id = ?",
        )
        .bind(ingest_id)
        .bind(ingest_address)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_live(
        &self,
        id: &str,
        broadcast_id: &str,
        scheduled_end_time_ms: i64,
    ) -> Result<bool> {
        let now = crate::database::time::now_ms();
        let result = sqlx::query(
            r#"
            UPDATE streams
            SET status = 'live', broadcast_id = ?, scheduled_end_time = ?, updated_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(broadcast_id)
        .bind(scheduled_end_time_ms)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn begin_stopping(&self, id: &str) -> Result<bool> {
        let now = crate::database::time::now_ms();
        let result = sqlx::query(
            "UPDATE streams SET status = 'stopping', updated_at = ? WHERE id = ? AND status = 'live'",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn clear_binding(&self, id: &str) -> Result<()> {
        let now = crate::database::time::now_ms();
        sqlx::query(
            r#"
            UPDATE streams
            SET status = 'offline', broadcast_id = NULL, active_schedule_id = NULL,
                scheduled_end_time = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_stream(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM streams WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
