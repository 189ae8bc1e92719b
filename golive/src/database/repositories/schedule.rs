//! Schedule repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::ScheduleDbModel;
use crate::{Error, Result};

/// Schedule repository trait.
///
/// `claim_trigger` is the at-most-once gate for occurrence startup: it is a
/// CAS on the status column, so when several evaluator passes see the same
/// due schedule, exactly one claim succeeds.
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn get_schedule(&self, id: &str) -> Result<ScheduleDbModel>;
    async fn list_schedules_by_stream(&self, stream_id: &str) -> Result<Vec<ScheduleDbModel>>;
    async fn list_schedules_by_status(&self, status: &str) -> Result<Vec<ScheduleDbModel>>;
    /// Pending schedules whose stream is free to start. Schedules on busy
    /// streams are left pending rather than triggered-and-failed.
    async fn list_pending_with_free_stream(&self) -> Result<Vec<ScheduleDbModel>>;
    /// Recurring schedules whose last occurrence settled (completed/failed);
    /// candidates for reset once their window has passed.
    async fn list_settled_recurring(&self) -> Result<Vec<ScheduleDbModel>>;
    /// Occurrences claimed before `cutoff_ms` that never reached live;
    /// leftovers from a crashed coordinator.
    async fn list_stuck_in_flight(&self, cutoff_ms: i64) -> Result<Vec<ScheduleDbModel>>;
    /// Occurrences in `live` whose stream is not actually live or no longer
    /// points back at them. For startup recovery only, before any occurrence
    /// tasks run: the stream row goes live before the occurrence does, so a
    /// mid-transition snapshot could false-match.
    async fn list_orphaned_live(&self) -> Result<Vec<ScheduleDbModel>>;
    async fn create_schedule(&self, schedule: &ScheduleDbModel) -> Result<()>;
    /// CAS pending -> triggered, stamping `last_triggered_at` with the
    /// evaluation time. Returns false if another caller claimed first.
    async fn claim_trigger(&self, id: &str, now_ms: i64) -> Result<bool>;
    /// Generic status CAS. Returns false if the row was not in `from`.
    async fn transition_status(&self, id: &str, from: &str, to: &str) -> Result<bool>;
    /// CAS triggered -> broadcast_bound, recording the created broadcast.
    async fn bind_broadcast(&self, id: &str, broadcast_id: &str) -> Result<bool>;
    /// CAS broadcast_bound -> live.
    async fn mark_live(&self, id: &str) -> Result<bool>;
    /// Terminal failure; clears the broadcast binding unconditionally.
    async fn mark_failed(&self, id: &str) -> Result<()>;
    /// One-shot completion; clears the broadcast binding like the other
    /// settle paths, since the broadcast is finished remotely.
    async fn mark_completed(&self, id: &str) -> Result<()>;
    /// Rearm a recurring schedule. `last_triggered_at` survives so the same
    /// window cannot fire twice.
    async fn reset_to_pending(&self, id: &str) -> Result<()>;
    async fn delete_schedule(&self, id: &str) -> Result<()>;
}

/// SQLx implementation of ScheduleRepository.
pub struct SqlxScheduleRepository {
    pool: SqlitePool,
}

impl SqlxScheduleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduleRepository for SqlxScheduleRepository {
    async fn get_schedule(&self, id: &str) -> Result<ScheduleDbModel> {
        sqlx::query_as::<_, ScheduleDbModel>("SELECT * FROM schedules WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Schedule", id))
    }

    async fn list_schedules_by_stream(&self, stream_id: &str) -> Result<Vec<ScheduleDbModel>> {
        let schedules = sqlx::query_as::<_, ScheduleDbModel>(
            "SELECT * FROM schedules WHERE stream_id = ? ORDER BY created_at",
        )
        .bind(stream_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(schedules)
    }

    async fn list_schedules_by_status(&self, status: &str) -> Result<Vec<ScheduleDbModel>> {
        let schedules = sqlx::query_as::<_, ScheduleDbModel>(
            "SELECT * FROM schedules WHERE status = ? ORDER BY created_at",
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await?;
        Ok(schedules)
    }

    async fn list_pending_with_free_stream(&self) -> Result<Vec<ScheduleDbModel>> {
        let schedules = sqlx::query_as::<_, ScheduleDbModel>(
            r#"
            SELECT schedules.* FROM schedules
            JOIN streams ON streams.id = schedules.stream_id
            WHERE schedules.status = 'pending'
              AND streams.status = 'offline'
            ORDER BY schedules.created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(schedules)
    }

    async fn list_settled_recurring(&self) -> Result<Vec<ScheduleDbModel>> {
        let schedules = sqlx::query_as::<_, ScheduleDbModel>(
            r#"
            SELECT * FROM schedules
            WHERE is_recurring = 1
              AND status IN ('completed', 'failed')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(schedules)
    }

    async fn list_stuck_in_flight(&self, cutoff_ms: i64) -> Result<Vec<ScheduleDbModel>> {
        let schedules = sqlx::query_as::<_, ScheduleDbModel>(
            r#"
            SELECT * FROM schedules
            WHERE status IN ('triggered', 'broadcast_bound')
              AND updated_at < ?
            "#,
        )
        .bind(cutoff_ms)
        .fetch_all(&self.pool)
        .await?;
        Ok(schedules)
    }

    async fn list_orphaned_live(&self) -> Result<Vec<ScheduleDbModel>> {
        let schedules = sqlx::query_as::<_, ScheduleDbModel>(
            r#"
            SELECT schedules.* FROM schedules
            JOIN streams ON streams.id = schedules.stream_id
            WHERE schedules.status = 'live'
              AND (streams.status != 'live' OR streams.active_schedule_id IS NOT schedules.id)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(schedules)
    }

    async fn create_schedule(&self, schedule: &ScheduleDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO schedules (
                id, stream_id, trigger_time, time_of_day, weekdays, timezone,
                duration_minutes, is_recurring, status, last_triggered_at,
                broadcast_id, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&schedule.id)
        .bind(&schedule.stream_id)
        .bind(schedule.trigger_time)
        .bind(&schedule.time_of_day)
        .bind(&schedule.weekdays)
        .bind(&schedule.timezone)
        .bind(schedule.duration_minutes)
        .bind(schedule.is_recurring)
        .bind(&schedule.status)
        .bind(schedule.last_triggered_at)
        .bind(&schedule.broadcast_id)
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_trigger(&self, id: &str, now_ms: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE schedules
            SET status = 'triggered', last_triggered_at = ?, updated_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(now_ms)
        .bind(now_ms)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn transition_status(&self, id: &str, from: &str, to: &str) -> Result<bool> {
        let now = crate::database::time::now_ms();
        let result =
            sqlx::query("UPDATE schedules SET status = ?, updated_at = ? WHERE id = ? AND status = ?")
                .bind(to)
                .bind(now)
                .bind(id)
                .bind(from)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn bind_broadcast(&self, id: &str, broadcast_id: &str) -> Result<bool> {
        let now = crate::database::time::now_ms();
        let result = sqlx::query(
            r#"
            UPDATE schedules
            SET status = 'broadcast_bound', broadcast_id = ?, updated_at = ?
            WHERE id = ? AND status = 'triggered'
            "#,
        )
        .bind(broadcast_id)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_live(&self, id: &str) -> Result<bool> {
        let now = crate::database::time::now_ms();
        let result = sqlx::query(
            "UPDATE schedules SET status = 'live', updated_at = ? WHERE id = ? AND status = 'broadcast_bound'",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(&self, id: &str) -> Result<()> {
        let now = crate::database::time::now_ms();
        sqlx::query(
            "UPDATE schedules SET status = 'failed', broadcast_id = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_completed(&self, id: &str) -> Result<()> {
        let now = crate::database::time::now_ms();
        sqlx::query(
            "UPDATE schedules SET status = 'completed', broadcast_id = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset_to_pending(&self, id: &str) -> Result<()> {
        let now = crate::database::time::now_ms();
        sqlx::query(
            "UPDATE schedules SET status = 'pending', broadcast_id = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_schedule(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{ScheduleStatus, StreamDbModel};
    use crate::database::repositories::stream::{SqlxStreamRepository, StreamRepository};
    use chrono::{TimeZone, Utc};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_test_db() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        sqlx::query(
            r#"
            CREATE TABLE streams (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                channel TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                status TEXT NOT NULL DEFAULT 'offline',
                ingest_id TEXT,
                ingest_address TEXT,
                broadcast_id TEXT,
                active_schedule_id TEXT,
                scheduled_end_time INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        sqlx::query(
            r#"
            CREATE TABLE schedules (
                id TEXT PRIMARY KEY,
                stream_id TEXT NOT NULL,
                trigger_time INTEGER,
                time_of_day TEXT,
                weekdays TEXT,
                timezone TEXT NOT NULL DEFAULT 'UTC',
                duration_minutes INTEGER NOT NULL,
                is_recurring INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                last_triggered_at INTEGER,
                broadcast_id TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        pool
    }

    fn sample_one_shot(stream_id: &str) -> ScheduleDbModel {
        let at = Utc.with_ymd_and_hms(2025, 6, 2, 18, 0, 0).unwrap();
        ScheduleDbModel::one_shot(stream_id, at, 30)
    }

    #[tokio::test]
    async fn test_claim_trigger_single_winner() {
        let pool = setup_test_db().await;
        let repo = SqlxScheduleRepository::new(pool);
        let schedule = sample_one_shot("stream-1");
        repo.create_schedule(&schedule).await.unwrap();

        assert!(repo.claim_trigger(&schedule.id, 42).await.unwrap());
        assert!(!repo.claim_trigger(&schedule.id, 43).await.unwrap());

        let row = repo.get_schedule(&schedule.id).await.unwrap();
        assert_eq!(row.status, ScheduleStatus::Triggered.as_str());
        assert_eq!(row.last_triggered_at, Some(42));
    }

    #[tokio::test]
    async fn test_occurrence_status_chain() {
        let pool = setup_test_db().await;
        let repo = SqlxScheduleRepository::new(pool);
        let schedule = sample_one_shot("stream-1");
        repo.create_schedule(&schedule).await.unwrap();

        repo.claim_trigger(&schedule.id, 1).await.unwrap();
        assert!(repo.bind_broadcast(&schedule.id, "bc-1").await.unwrap());
        // Binding twice is not possible.
        assert!(!repo.bind_broadcast(&schedule.id, "bc-2").await.unwrap());
        assert!(repo.mark_live(&schedule.id).await.unwrap());

        let row = repo.get_schedule(&schedule.id).await.unwrap();
        assert_eq!(row.status, ScheduleStatus::Live.as_str());
        assert_eq!(row.broadcast_id.as_deref(), Some("bc-1"));

        repo.mark_completed(&schedule.id).await.unwrap();
        let row = repo.get_schedule(&schedule.id).await.unwrap();
        assert_eq!(row.status, ScheduleStatus::Completed.as_str());
        // Every settle path drops the binding; the broadcast is over.
        assert!(row.broadcast_id.is_none());
    }

    #[tokio::test]
    async fn test_mark_failed_clears_broadcast() {
        let pool = setup_test_db().await;
        let repo = SqlxScheduleRepository::new(pool);
        let schedule = sample_one_shot("stream-1");
        repo.create_schedule(&schedule).await.unwrap();

        repo.claim_trigger(&schedule.id, 1).await.unwrap();
        repo.bind_broadcast(&schedule.id, "bc-1").await.unwrap();
        repo.mark_failed(&schedule.id).await.unwrap();

        let row = repo.get_schedule(&schedule.id).await.unwrap();
        assert_eq!(row.status, ScheduleStatus::Failed.as_str());
        assert!(row.broadcast_id.is_none());
    }

    #[tokio::test]
    async fn test_reset_to_pending_keeps_last_triggered_at() {
        let pool = setup_test_db().await;
        let repo = SqlxScheduleRepository::new(pool);
        let schedule = sample_one_shot("stream-1");
        repo.create_schedule(&schedule).await.unwrap();

        repo.claim_trigger(&schedule.id, 42).await.unwrap();
        repo.bind_broadcast(&schedule.id, "bc-1").await.unwrap();
        repo.reset_to_pending(&schedule.id).await.unwrap();

        let row = repo.get_schedule(&schedule.id).await.unwrap();
        assert_eq!(row.status, ScheduleStatus::Pending.as_str());
        assert!(row.broadcast_id.is_none());
        assert_eq!(row.last_triggered_at, Some(42));
    }

    #[tokio::test]
    async fn test_transition_status_cas() {
        let pool = setup_test_db().await;
        let repo = SqlxScheduleRepository::new(pool);
        let schedule = sample_one_shot("stream-1");
        repo.create_schedule(&schedule).await.unwrap();

        // Missed-trigger path: pending -> failed, but only while still pending.
        assert!(repo.transition_status(&schedule.id, "pending", "failed").await.unwrap());
        assert!(!repo.transition_status(&schedule.id, "pending", "failed").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_pending_with_free_stream() {
        let pool = setup_test_db().await;
        let stream_repo = SqlxStreamRepository::new(pool.clone());
        let repo = SqlxScheduleRepository::new(pool);

        let free = StreamDbModel::new("free", "chan-1", "A");
        let busy = StreamDbModel::new("busy", "chan-2", "B");
        stream_repo.create_stream(&free).await.unwrap();
        stream_repo.create_stream(&busy).await.unwrap();

        let on_free = sample_one_shot(&free.id);
        let on_busy = sample_one_shot(&busy.id);
        repo.create_schedule(&on_free).await.unwrap();
        repo.create_schedule(&on_busy).await.unwrap();

        stream_repo.claim_for_occurrence(&busy.id, &on_busy.id).await.unwrap();

        let candidates = repo.list_pending_with_free_stream().await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, on_free.id);
    }

    #[tokio::test]
    async fn test_list_orphaned_live() {
        let pool = setup_test_db().await;
        let stream_repo = SqlxStreamRepository::new(pool.clone());
        let repo = SqlxScheduleRepository::new(pool);

        let stream = StreamDbModel::new("studio", "chan-1", "Show");
        stream_repo.create_stream(&stream).await.unwrap();

        let schedule = sample_one_shot(&stream.id);
        repo.create_schedule(&schedule).await.unwrap();

        // Occurrence says live, stream never made it: orphaned.
        repo.claim_trigger(&schedule.id, 1).await.unwrap();
        repo.bind_broadcast(&schedule.id, "bc-1").await.unwrap();
        repo.mark_live(&schedule.id).await.unwrap();

        let orphans = repo.list_orphaned_live().await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, schedule.id);

        // Once the stream is live and points back, it is consistent.
        stream_repo.claim_for_occurrence(&stream.id, &schedule.id).await.unwrap();
        stream_repo.set_live(&stream.id, "bc-1", 9999).await.unwrap();
        assert!(repo.list_orphaned_live().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_stuck_in_flight() {
        let pool = setup_test_db().await;
        let repo = SqlxScheduleRepository::new(pool);
        let schedule = sample_one_shot("stream-1");
        repo.create_schedule(&schedule).await.unwrap();
        repo.claim_trigger(&schedule.id, 1).await.unwrap();

        let future_cutoff = crate::database::time::now_ms() + 60_000;
        assert_eq!(repo.list_stuck_in_flight(future_cutoff).await.unwrap().len(), 1);

        let past_cutoff = crate::database::time::now_ms() - 60_000;
        assert!(repo.list_stuck_in_flight(past_cutoff).await.unwrap().is_empty());
    }
}
