//! Auto-stop monitor service.
//!
//! Each tick collects the streams that should not be live anymore and
//! funnels them through the coordinator's stop path, which settles their
//! occurrences and serializes against manual stops. Streams parked in a
//! transitional status with no task behind them are forced offline.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coordinator::{LifecycleCoordinator, StopCause};
use crate::database::repositories::{CredentialRepository, ScheduleRepository, StreamRepository};
use crate::Result;

/// Monitor tuning knobs.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Cadence of stop sweeps.
    pub tick_interval: Duration,
    /// Transitional streams untouched for longer than this are forced
    /// offline. Generous compared to startup's bounded duration, so a slow
    /// but healthy startup is never killed.
    pub stuck_cutoff: chrono::Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            stuck_cutoff: chrono::Duration::minutes(30),
        }
    }
}

/// What one stop sweep did.
#[derive(Debug, Default, Clone, Copy)]
pub struct StopSweepSummary {
    /// Streams stopped because their scheduled end time passed.
    pub expired: usize,
    /// Live streams force-stopped because no valid session backed them.
    pub reconciled: usize,
    /// Stuck transitional streams forced offline.
    pub forced_offline: usize,
}

impl StopSweepSummary {
    pub fn is_empty(&self) -> bool {
        self.expired == 0 && self.reconciled == 0 && self.forced_offline == 0
    }
}

/// Periodic auto-stop and reconciliation sweep.
pub struct AutoStopMonitor<SR, SCR, CR>
where
    SR: StreamRepository + Send + Sync + 'static,
    SCR: ScheduleRepository + Send + Sync + 'static,
    CR: CredentialRepository + Send + Sync + 'static,
{
    stream_repository: Arc<SR>,
    coordinator: Arc<LifecycleCoordinator<SR, SCR, CR>>,
    config: MonitorConfig,
}

impl<SR, SCR, CR> AutoStopMonitor<SR, SCR, CR>
where
    SR: StreamRepository + Send + Sync + 'static,
    SCR: ScheduleRepository + Send + Sync + 'static,
    CR: CredentialRepository + Send + Sync + 'static,
{
    pub fn new(
        stream_repository: Arc<SR>,
        coordinator: Arc<LifecycleCoordinator<SR, SCR, CR>>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            stream_repository,
            coordinator,
            config,
        }
    }

    /// One stop sweep at `now`.
    ///
    /// Overdue and stale live streams are stopped concurrently; the sweep
    /// waits for every stop before returning, so a tick's effects are fully
    /// settled when it reports. Per-stream results only get logged: one
    /// failed stop must not starve the rest, and the next tick retries it.
    pub async fn tick_once(&self, now: DateTime<Utc>) -> Result<StopSweepSummary> {
        let mut summary = StopSweepSummary::default();
        let mut stops: JoinSet<(StopCause, Result<bool>)> = JoinSet::new();
        let mut seen = HashSet::new();

        for stream in self
            .stream_repository
            .list_overdue_live(now.timestamp_millis())
            .await?
        {
            info!(
                stream_id = %stream.id,
                scheduled_end_time = ?stream.scheduled_end_time,
                "Scheduled end time reached, stopping stream"
            );
            seen.insert(stream.id.clone());
            let coordinator = Arc::clone(&self.coordinator);
            stops.spawn(async move {
                let result = coordinator.stop_stream(&stream.id, StopCause::Expired).await;
                (StopCause::Expired, result)
            });
        }

        for stream in self.stream_repository.list_stale_live().await? {
            if !seen.insert(stream.id.clone()) {
                continue;
            }
            warn!(
                stream_id = %stream.id,
                "Live stream with no valid session behind it, force-stopping"
            );
            let coordinator = Arc::clone(&self.coordinator);
            stops.spawn(async move {
                let result = coordinator
                    .stop_stream(&stream.id, StopCause::Reconcile)
                    .await;
                (StopCause::Reconcile, result)
            });
        }

        while let Some(joined) = stops.join_next().await {
            match joined {
                Ok((StopCause::Expired, Ok(true))) => summary.expired += 1,
                Ok((_, Ok(true))) => summary.reconciled += 1,
                Ok((_, Ok(false))) => {}
                Ok((cause, Err(e))) => {
                    error!(cause = cause.as_str(), error = %e, "Stop attempt failed");
                }
                Err(e) => {
                    error!(error = %e, "Stop task panicked");
                }
            }
        }

        summary.forced_offline = self.sweep_stuck_transitional(now).await?;

        Ok(summary)
    }

    /// Force offline the streams parked in pending/stopping since before the
    /// cutoff. Streams whose process is tracked by this run are skipped; a
    /// task of ours still owns them.
    async fn sweep_stuck_transitional(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = (now - self.config.stuck_cutoff).timestamp_millis();
        let mut forced = 0;

        for stream in self
            .stream_repository
            .list_stuck_transitional(cutoff)
            .await?
        {
            if self.coordinator.has_handle(&stream.id) {
                debug!(stream_id = %stream.id, "Transitional stream has a task in this run, skipping");
                continue;
            }
            warn!(
                stream_id = %stream.id,
                status = %stream.status,
                "Stream stuck in transitional status, forcing offline"
            );
            self.coordinator.force_offline(&stream.id).await?;
            forced += 1;
        }

        Ok(forced)
    }

    /// Stop sweep loop. Runs until the token is cancelled.
    pub async fn run(self: Arc<Self>, cancellation_token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_secs = self.config.tick_interval.as_secs(),
            "Auto-stop monitor started"
        );

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("Auto-stop monitor stopping");
                    break;
                }
                _ = interval.tick() => {
                    match self.tick_once(Utc::now()).await {
                        Ok(summary) if summary.is_empty() => {}
                        Ok(summary) => {
                            info!(
                                expired = summary.expired,
                                reconciled = summary.reconciled,
                                forced_offline = summary.forced_offline,
                                "Stop sweep complete"
                            );
                        }
                        Err(e) => {
                            error!(error = %e, "Stop sweep failed");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use sqlx::sqlite::SqlitePoolOptions;
    use sqlx::SqlitePool;

    use super::*;
    use crate::broadcast::{
        BroadcastClient, BroadcastError, BroadcastMetadata, Ingest, TransitionTarget,
    };
    use crate::coordinator::CoordinatorConfig;
    use crate::credentials::refresher::{RefreshedToken, TokenRefresher};
    use crate::credentials::{CredentialError, CredentialService};
    use crate::database::models::{CredentialDbModel, ScheduleDbModel, StreamDbModel};
    use crate::database::repositories::{
        SqlxCredentialRepository, SqlxScheduleRepository, SqlxStreamRepository,
    };
    use crate::database::time::datetime_to_ms;
    use crate::supervisor::{ProcessHandle, ProcessHealth, ProcessSupervisor, SupervisorError};

    struct StubSupervisor;

    #[async_trait]
    impl ProcessSupervisor for StubSupervisor {
        async fn start(
            &self,
            stream_id: &str,
            _ingest_address: &str,
        ) -> std::result::Result<ProcessHandle, SupervisorError> {
            Ok(ProcessHandle {
                id: format!("proc-{stream_id}"),
                stream_id: stream_id.to_string(),
            })
        }

        async fn health(
            &self,
            _handle: &ProcessHandle,
        ) -> std::result::Result<ProcessHealth, SupervisorError> {
            Ok(ProcessHealth::Active)
        }

        async fn stop(
            &self,
            _handle: &ProcessHandle,
        ) -> std::result::Result<(), SupervisorError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingBroadcast {
        transitions: StdMutex<Vec<(String, &'static str)>>,
    }

    #[async_trait]
    impl BroadcastClient for RecordingBroadcast {
        async fn create_ingest(
            &self,
            _access_token: &str,
            _title: &str,
        ) -> std::result::Result<Ingest, BroadcastError> {
            Ok(Ingest {
                id: "ingest-0".to_string(),
                address: "rtmp://ingest.example/stub".to_string(),
            })
        }

        async fn create_and_bind_broadcast(
            &self,
            _access_token: &str,
            _ingest_id: &str,
            _metadata: &BroadcastMetadata,
        ) -> std::result::Result<String, BroadcastError> {
            Ok("bc-0".to_string())
        }

        async fn transition_broadcast(
            &self,
            _access_token: &str,
            broadcast_id: &str,
            target: TransitionTarget,
        ) -> std::result::Result<(), BroadcastError> {
            self.transitions
                .lock()
                .unwrap()
                .push((broadcast_id.to_string(), target.as_str()));
            Ok(())
        }

        async fn delete_broadcast(
            &self,
            _access_token: &str,
            _broadcast_id: &str,
        ) -> std::result::Result<(), BroadcastError> {
            Ok(())
        }
    }

    struct NoRefresh;

    #[async_trait]
    impl TokenRefresher for NoRefresh {
        async fn refresh(
            &self,
            _refresh_token: &str,
        ) -> std::result::Result<RefreshedToken, CredentialError> {
            Ok(RefreshedToken {
                access_token: "fresh".to_string(),
                refresh_token: None,
                expires_at: Utc::now() + chrono::Duration::hours(1),
            })
        }
    }

    type TestMonitor =
        AutoStopMonitor<SqlxStreamRepository, SqlxScheduleRepository, SqlxCredentialRepository>;

    struct Harness {
        pool: SqlitePool,
        stream_repo: Arc<SqlxStreamRepository>,
        schedule_repo: Arc<SqlxScheduleRepository>,
        broadcast: Arc<RecordingBroadcast>,
        monitor: TestMonitor,
    }

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

        sqlx::query(
            r#"
            CREATE TABLE credentials (
                id TEXT PRIMARY KEY,
                principal TEXT NOT NULL,
                channel TEXT NOT NULL UNIQUE,
                access_token TEXT NOT NULL,
                refresh_token TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                is_default INTEGER NOT NULL DEFAULT 0,
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

    async fn setup() -> Harness {
        let pool = setup_test_db().await;
        let stream_repo = Arc::new(SqlxStreamRepository::new(pool.clone()));
        let schedule_repo = Arc::new(SqlxScheduleRepository::new(pool.clone()));
        let credential_repo = Arc::new(SqlxCredentialRepository::new(pool.clone()));
        let credentials = Arc::new(CredentialService::new(
            Arc::clone(&credential_repo),
            Arc::new(NoRefresh),
        ));
        let broadcast = Arc::new(RecordingBroadcast::default());
        let coordinator = Arc::new(LifecycleCoordinator::with_config(
            Arc::clone(&stream_repo),
            Arc::clone(&schedule_repo),
            credentials,
            Arc::new(StubSupervisor),
            Arc::clone(&broadcast) as Arc<dyn BroadcastClient>,
            CoordinatorConfig::default(),
        ));
        let monitor = AutoStopMonitor::new(
            Arc::clone(&stream_repo),
            coordinator,
            MonitorConfig::default(),
        );

        let expires = datetime_to_ms(Utc::now() + chrono::Duration::hours(1));
        let cred = CredentialDbModel::new("user-1", "chan-1", "token", "rt", expires);
        credential_repo.create_credential(&cred).await.unwrap();

        Harness {
            pool,
            stream_repo,
            schedule_repo,
            broadcast,
            monitor,
        }
    }

    fn now_fixed() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap()
    }

    /// Build a live stream bound to a live one-shot occurrence through the
    /// repository CAS chain, without running a coordinator startup.
    async fn seed_live_session(h: &Harness, end_time: DateTime<Utc>) -> (StreamDbModel, ScheduleDbModel) {
        let stream = StreamDbModel::new("studio-a", "chan-1", "Morning Show");
        h.stream_repo.create_stream(&stream).await.unwrap();

        let schedule = ScheduleDbModel::one_shot(&stream.id, now_fixed(), 30);
        h.schedule_repo.create_schedule(&schedule).await.unwrap();
        assert!(h
            .schedule_repo
            .claim_trigger(&schedule.id, now_fixed().timestamp_millis())
            .await
            .unwrap());
        assert!(h
            .stream_repo
            .claim_for_occurrence(&stream.id, &schedule.id)
            .await
            .unwrap());
        assert!(h
            .schedule_repo
            .bind_broadcast(&schedule.id, "bc-0")
            .await
            .unwrap());
        assert!(h
            .stream_repo
            .set_live(&stream.id, "bc-0", end_time.timestamp_millis())
            .await
            .unwrap());
        assert!(h.schedule_repo.mark_live(&schedule.id).await.unwrap());

        (stream, schedule)
    }

    #[tokio::test]
    async fn test_overdue_live_stream_stopped() {
        let h = setup().await;
        let now = now_fixed();
        let (stream, schedule) = seed_live_session(&h, now - chrono::Duration::seconds(1)).await;

        let summary = h.monitor.tick_once(now).await.unwrap();
        assert_eq!(summary.expired, 1);
        assert_eq!(summary.reconciled, 0);

        let stream = h.stream_repo.get_stream(&stream.id).await.unwrap();
        assert_eq!(stream.status, "offline");
        assert!(stream.broadcast_id.is_none());

        let schedule = h.schedule_repo.get_schedule(&schedule.id).await.unwrap();
        assert_eq!(schedule.status, "completed");

        let transitions = h.broadcast.transitions.lock().unwrap();
        assert_eq!(transitions.as_slice(), [("bc-0".to_string(), "complete")]);
    }

    #[tokio::test]
    async fn test_live_stream_within_deadline_untouched() {
        let h = setup().await;
        let now = now_fixed();
        let (stream, _) = seed_live_session(&h, now + chrono::Duration::minutes(10)).await;

        let summary = h.monitor.tick_once(now).await.unwrap();
        assert!(summary.is_empty());

        let stream = h.stream_repo.get_stream(&stream.id).await.unwrap();
        assert_eq!(stream.status, "live");
    }

    #[tokio::test]
    async fn test_live_stream_without_session_reconciled() {
        let h = setup().await;

        // A live row with no end time and no occurrence: leftover state that
        // nothing would ever stop on its own.
        let stream = StreamDbModel::new("studio-a", "chan-1", "Morning Show");
        h.stream_repo.create_stream(&stream).await.unwrap();
        sqlx::query("UPDATE streams SET status = 'live', broadcast_id = 'bc-9' WHERE id = ?")
            .bind(&stream.id)
            .execute(&h.pool)
            .await
            .unwrap();

        let summary = h.monitor.tick_once(now_fixed()).await.unwrap();
        assert_eq!(summary.reconciled, 1);
        assert_eq!(summary.expired, 0);

        let stream = h.stream_repo.get_stream(&stream.id).await.unwrap();
        assert_eq!(stream.status, "offline");
        assert!(stream.broadcast_id.is_none());
    }

    #[tokio::test]
    async fn test_live_stream_with_settled_occurrence_reconciled() {
        let h = setup().await;
        let now = now_fixed();
        let (stream, schedule) = seed_live_session(&h, now + chrono::Duration::minutes(10)).await;

        // The occurrence settled (failed by a sweep) while the stream row
        // stayed live. The stream has no valid session anymore.
        h.schedule_repo.mark_failed(&schedule.id).await.unwrap();

        let summary = h.monitor.tick_once(now).await.unwrap();
        assert_eq!(summary.reconciled, 1);

        let stream = h.stream_repo.get_stream(&stream.id).await.unwrap();
        assert_eq!(stream.status, "offline");

        // Already-settled occurrences are left alone by the stop path.
        let schedule = h.schedule_repo.get_schedule(&schedule.id).await.unwrap();
        assert_eq!(schedule.status, "failed");
    }

    #[tokio::test]
    async fn test_stuck_pending_stream_forced_offline() {
        let h = setup().await;
        let now = now_fixed();

        let stream = StreamDbModel::new("studio-a", "chan-1", "Morning Show");
        h.stream_repo.create_stream(&stream).await.unwrap();
        let schedule = ScheduleDbModel::one_shot(&stream.id, now, 30);
        h.schedule_repo.create_schedule(&schedule).await.unwrap();
        assert!(h
            .schedule_repo
            .claim_trigger(&schedule.id, now.timestamp_millis())
            .await
            .unwrap());
        assert!(h
            .stream_repo
            .claim_for_occurrence(&stream.id, &schedule.id)
            .await
            .unwrap());

        // Backdate the claim past the stuck cutoff: the startup that made it
        // is long dead.
        let stale_ms = (now - chrono::Duration::minutes(31)).timestamp_millis();
        sqlx::query("UPDATE streams SET updated_at = ? WHERE id = ?")
            .bind(stale_ms)
            .bind(&stream.id)
            .execute(&h.pool)
            .await
            .unwrap();

        let summary = h.monitor.tick_once(now).await.unwrap();
        assert_eq!(summary.forced_offline, 1);

        let stream = h.stream_repo.get_stream(&stream.id).await.unwrap();
        assert_eq!(stream.status, "offline");
        assert!(stream.active_schedule_id.is_none());

        let schedule = h.schedule_repo.get_schedule(&schedule.id).await.unwrap();
        assert_eq!(schedule.status, "failed");
    }

    #[tokio::test]
    async fn test_recent_pending_stream_not_forced() {
        let h = setup().await;
        let now = now_fixed();

        let stream = StreamDbModel::new("studio-a", "chan-1", "Morning Show");
        h.stream_repo.create_stream(&stream).await.unwrap();
        assert!(h
            .stream_repo
            .claim_for_occurrence(&stream.id, "some-occurrence")
            .await
            .unwrap());

        // Freshly claimed: a startup is legitimately in progress.
        let recent_ms = (now - chrono::Duration::minutes(1)).timestamp_millis();
        sqlx::query("UPDATE streams SET updated_at = ? WHERE id = ?")
            .bind(recent_ms)
            .bind(&stream.id)
            .execute(&h.pool)
            .await
            .unwrap();

        let summary = h.monitor.tick_once(now).await.unwrap();
        assert_eq!(summary.forced_offline, 0);

        let stream = h.stream_repo.get_stream(&stream.id).await.unwrap();
        assert_eq!(stream.status, "pending");
    }
}
