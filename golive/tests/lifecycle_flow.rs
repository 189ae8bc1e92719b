//! End-to-end lifecycle flow over a file-backed database.
//!
//! Drives the public service surface the way a deployment would: a due
//! schedule is picked up by an evaluation pass, the occurrence goes live
//! through the coordinator, and a later stop sweep ends the session once its
//! scheduled end time has passed. Time is passed explicitly to the sweeps,
//! so "31 minutes later" does not need a 31 minute test.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use golive::broadcast::{
    BroadcastClient, BroadcastError, BroadcastMetadata, Ingest, TransitionTarget,
};
use golive::coordinator::{BackoffConfig, CoordinatorConfig};
use golive::credentials::refresher::{RefreshedToken, TokenRefresher};
use golive::credentials::CredentialError;
use golive::database::models::{CredentialDbModel, ScheduleDbModel, StreamDbModel};
use golive::database::repositories::{CredentialRepository, ScheduleRepository, StreamRepository};
use golive::database::time::datetime_to_ms;
use golive::database::{init_pool, run_migrations};
use golive::services::{ContainerConfig, ServiceContainer};
use golive::supervisor::{ProcessHandle, ProcessHealth, ProcessSupervisor, SupervisorError};

#[derive(Default)]
struct CountingSupervisor {
    starts: AtomicUsize,
    stops: AtomicUsize,
}

#[async_trait]
impl ProcessSupervisor for CountingSupervisor {
    async fn start(
        &self,
        stream_id: &str,
        _ingest_address: &str,
    ) -> Result<ProcessHandle, SupervisorError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(ProcessHandle {
            id: format!("proc-{stream_id}"),
            stream_id: stream_id.to_string(),
        })
    }

    async fn health(&self, _handle: &ProcessHandle) -> Result<ProcessHealth, SupervisorError> {
        Ok(ProcessHealth::Active)
    }

    async fn stop(&self, _handle: &ProcessHandle) -> Result<(), SupervisorError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingBroadcast {
    ingests: AtomicUsize,
    created: AtomicUsize,
    transitions: StdMutex<Vec<(String, &'static str)>>,
}

#[async_trait]
impl BroadcastClient for RecordingBroadcast {
    async fn create_ingest(
        &self,
        _access_token: &str,
        _title: &str,
    ) -> Result<Ingest, BroadcastError> {
        let n = self.ingests.fetch_add(1, Ordering::SeqCst);
        Ok(Ingest {
            id: format!("ingest-{n}"),
            address: "rtmp://ingest.example/e2e".to_string(),
        })
    }

    async fn create_and_bind_broadcast(
        &self,
        _access_token: &str,
        _ingest_id: &str,
        _metadata: &BroadcastMetadata,
    ) -> Result<String, BroadcastError> {
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(format!("bc-{n}"))
    }

    async fn transition_broadcast(
        &self,
        _access_token: &str,
        broadcast_id: &str,
        target: TransitionTarget,
    ) -> Result<(), BroadcastError> {
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
    ) -> Result<(), BroadcastError> {
        Ok(())
    }
}

struct NoRefresh;

#[async_trait]
impl TokenRefresher for NoRefresh {
    async fn refresh(&self, _refresh_token: &str) -> Result<RefreshedToken, CredentialError> {
        Ok(RefreshedToken {
            access_token: "fresh".to_string(),
            refresh_token: None,
            expires_at: Utc::now() + chrono::Duration::hours(1),
        })
    }
}

struct Flow {
    _dir: TempDir,
    supervisor: Arc<CountingSupervisor>,
    broadcast: Arc<RecordingBroadcast>,
    container: ServiceContainer,
    stream: StreamDbModel,
}

async fn setup_flow() -> Flow {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("flow.db");
    let db_url = format!(
        "sqlite:{}?mode=rwc",
        db_path.to_string_lossy().replace('\\', "/")
    );

    let pool = init_pool(&db_url).await.unwrap();
    run_migrations(&pool).await.unwrap();

    let supervisor = Arc::new(CountingSupervisor::default());
    let broadcast = Arc::new(RecordingBroadcast::default());

    let config = ContainerConfig {
        coordinator: CoordinatorConfig {
            health_poll_interval: Duration::from_millis(1),
            health_poll_attempts: 5,
            retry: BackoffConfig {
                max_attempts: 4,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        },
        ..ContainerConfig::default()
    };

    let container = ServiceContainer::with_config(
        pool,
        Arc::clone(&supervisor) as Arc<dyn ProcessSupervisor>,
        Arc::clone(&broadcast) as Arc<dyn BroadcastClient>,
        Arc::new(NoRefresh),
        config,
    )
    .await
    .unwrap();

    let expires = datetime_to_ms(Utc::now() + chrono::Duration::hours(1));
    let credential = CredentialDbModel::new("user-1", "chan-1", "token", "rt", expires);
    container
        .credential_repository
        .create_credential(&credential)
        .await
        .unwrap();

    let stream = StreamDbModel::new("studio-a", "chan-1", "Morning Show");
    container
        .stream_repository
        .create_stream(&stream)
        .await
        .unwrap();

    Flow {
        _dir: dir,
        supervisor,
        broadcast,
        container,
        stream,
    }
}

async fn wait_for_schedule_status(flow: &Flow, schedule_id: &str, status: &str) {
    for _ in 0..200 {
        let row = flow
            .container
            .schedule_repository
            .get_schedule(schedule_id)
            .await
            .unwrap();
        if row.status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("schedule {schedule_id} never reached status {status}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_shot_goes_live_and_auto_stops() {
    let flow = setup_flow().await;
    let t0 = Utc::now();

    let schedule = ScheduleDbModel::one_shot(&flow.stream.id, t0, 30);
    flow.container
        .schedule_repository
        .create_schedule(&schedule)
        .await
        .unwrap();

    // T: the evaluation pass claims the due schedule.
    let summary = flow.container.evaluator.evaluate_once(t0).await.unwrap();
    assert_eq!(summary.triggered, 1);

    wait_for_schedule_status(&flow, &schedule.id, "live").await;

    let live_stream = flow
        .container
        .stream_repository
        .get_stream(&flow.stream.id)
        .await
        .unwrap();
    assert_eq!(live_stream.status, "live");
    assert_eq!(live_stream.broadcast_id.as_deref(), Some("bc-0"));
    assert!(flow.container.coordinator.has_handle(&flow.stream.id));

    // The session ends thirty minutes after going live.
    let end = live_stream.scheduled_end_time.unwrap();
    let expected_end = datetime_to_ms(t0 + chrono::Duration::minutes(30));
    assert!(
        (end - expected_end).abs() < 10_000,
        "end {end} not near {expected_end}"
    );

    let row = flow
        .container
        .schedule_repository
        .get_schedule(&schedule.id)
        .await
        .unwrap();
    assert_eq!(row.last_triggered_at, Some(t0.timestamp_millis()));
    assert_eq!(row.broadcast_id.as_deref(), Some("bc-0"));

    assert_eq!(flow.supervisor.starts.load(Ordering::SeqCst), 1);

    // A sweep before the deadline leaves the session alone.
    let early = flow
        .container
        .auto_stop
        .tick_once(t0 + chrono::Duration::minutes(29))
        .await
        .unwrap();
    assert_eq!(early.expired, 0);

    // T+31m: the sweep ends the session.
    let late = flow
        .container
        .auto_stop
        .tick_once(t0 + chrono::Duration::minutes(31))
        .await
        .unwrap();
    assert_eq!(late.expired, 1);

    let stopped_stream = flow
        .container
        .stream_repository
        .get_stream(&flow.stream.id)
        .await
        .unwrap();
    assert_eq!(stopped_stream.status, "offline");
    assert!(stopped_stream.broadcast_id.is_none());
    assert!(stopped_stream.active_schedule_id.is_none());
    assert!(!flow.container.coordinator.has_handle(&flow.stream.id));

    let row = flow
        .container
        .schedule_repository
        .get_schedule(&schedule.id)
        .await
        .unwrap();
    assert_eq!(row.status, "completed");
    assert!(row.broadcast_id.is_none());

    assert_eq!(flow.supervisor.stops.load(Ordering::SeqCst), 1);
    let transitions = flow.broadcast.transitions.lock().unwrap().clone();
    assert_eq!(
        transitions,
        [
            ("bc-0".to_string(), "live"),
            ("bc-0".to_string(), "complete")
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manual_sessions_reuse_the_ingest() {
    let flow = setup_flow().await;

    let first = flow
        .container
        .coordinator
        .manual_start(&flow.stream.id, 45)
        .await
        .unwrap();
    wait_for_schedule_status(&flow, &first, "live").await;

    assert!(flow
        .container
        .coordinator
        .manual_stop(&flow.stream.id)
        .await
        .unwrap());
    wait_for_schedule_status(&flow, &first, "completed").await;

    let stream = flow
        .container
        .stream_repository
        .get_stream(&flow.stream.id)
        .await
        .unwrap();
    assert_eq!(stream.status, "offline");
    // The ingest endpoint survives the stop for the next session.
    assert!(stream.ingest_id.is_some());

    let second = flow
        .container
        .coordinator
        .manual_start(&flow.stream.id, 45)
        .await
        .unwrap();
    wait_for_schedule_status(&flow, &second, "live").await;

    assert_eq!(flow.broadcast.ingests.load(Ordering::SeqCst), 1);
    assert_eq!(flow.broadcast.created.load(Ordering::SeqCst), 2);

    let second_row = flow
        .container
        .schedule_repository
        .get_schedule(&second)
        .await
        .unwrap();
    assert_eq!(second_row.broadcast_id.as_deref(), Some("bc-1"));
}
