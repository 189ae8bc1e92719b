//! Service container for dependency injection.
//!
//! The ServiceContainer wires the repositories and services together over a
//! single database pool and manages their lifecycle: startup recovery runs
//! first, then the background loops start, and shutdown drains them before
//! the pool closes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broadcast::BroadcastClient;
use crate::coordinator::{CoordinatorConfig, LifecycleCoordinator};
use crate::credentials::{CredentialService, TokenRefresher, DEFAULT_REFRESH_MARGIN_MINUTES};
use crate::database::repositories::{
    SqlxCredentialRepository, SqlxScheduleRepository, SqlxStreamRepository,
};
use crate::monitor::{AutoStopMonitor, MonitorConfig};
use crate::scheduler::{EvaluatorConfig, ScheduleEvaluator};
use crate::supervisor::ProcessSupervisor;
use crate::Result;

/// Default shutdown timeout.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Coordinator specialized to the sqlx-backed repositories.
pub type SqlxLifecycleCoordinator =
    LifecycleCoordinator<SqlxStreamRepository, SqlxScheduleRepository, SqlxCredentialRepository>;

/// Evaluator specialized to the sqlx-backed repositories.
pub type SqlxScheduleEvaluator =
    ScheduleEvaluator<SqlxStreamRepository, SqlxScheduleRepository, SqlxCredentialRepository>;

/// Auto-stop monitor specialized to the sqlx-backed repositories.
pub type SqlxAutoStopMonitor =
    AutoStopMonitor<SqlxStreamRepository, SqlxScheduleRepository, SqlxCredentialRepository>;

/// Tuning knobs for the assembled services.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Safety margin for handed-out access tokens.
    pub refresh_margin: chrono::Duration,
    pub coordinator: CoordinatorConfig,
    pub evaluator: EvaluatorConfig,
    pub monitor: MonitorConfig,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            refresh_margin: chrono::Duration::minutes(DEFAULT_REFRESH_MARGIN_MINUTES),
            coordinator: CoordinatorConfig::default(),
            evaluator: EvaluatorConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

/// Service container holding all application services.
pub struct ServiceContainer {
    /// Database connection pool.
    pub pool: SqlitePool,
    /// Stream repository.
    pub stream_repository: Arc<SqlxStreamRepository>,
    /// Schedule repository.
    pub schedule_repository: Arc<SqlxScheduleRepository>,
    /// Credential repository.
    pub credential_repository: Arc<SqlxCredentialRepository>,
    /// Credential service.
    pub credential_service: Arc<CredentialService<SqlxCredentialRepository>>,
    /// Lifecycle coordinator.
    pub coordinator: Arc<SqlxLifecycleCoordinator>,
    /// Schedule evaluator.
    pub evaluator: Arc<SqlxScheduleEvaluator>,
    /// Auto-stop monitor.
    pub auto_stop: Arc<SqlxAutoStopMonitor>,
    /// Background loop handles, joined during shutdown.
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Cancellation token for graceful shutdown.
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Create a new service container over the given pool and integrations.
    pub async fn new(
        pool: SqlitePool,
        supervisor: Arc<dyn ProcessSupervisor>,
        broadcast: Arc<dyn BroadcastClient>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Result<Self> {
        Self::with_config(
            pool,
            supervisor,
            broadcast,
            refresher,
            ContainerConfig::default(),
        )
        .await
    }

    /// Create a new service container with custom configuration.
    pub async fn with_config(
        pool: SqlitePool,
        supervisor: Arc<dyn ProcessSupervisor>,
        broadcast: Arc<dyn BroadcastClient>,
        refresher: Arc<dyn TokenRefresher>,
        config: ContainerConfig,
    ) -> Result<Self> {
        info!("Initializing service container");

        let stream_repository = Arc::new(SqlxStreamRepository::new(pool.clone()));
        let schedule_repository = Arc::new(SqlxScheduleRepository::new(pool.clone()));
        let credential_repository = Arc::new(SqlxCredentialRepository::new(pool.clone()));

        let credential_service = Arc::new(CredentialService::with_margin(
            Arc::clone(&credential_repository),
            refresher,
            config.refresh_margin,
        ));

        let coordinator = Arc::new(LifecycleCoordinator::with_config(
            Arc::clone(&stream_repository),
            Arc::clone(&schedule_repository),
            Arc::clone(&credential_service),
            supervisor,
            broadcast,
            config.coordinator,
        ));

        let evaluator = Arc::new(ScheduleEvaluator::new(
            Arc::clone(&schedule_repository),
            Arc::clone(&coordinator),
            config.evaluator,
        ));

        let auto_stop = Arc::new(AutoStopMonitor::new(
            Arc::clone(&stream_repository),
            Arc::clone(&coordinator),
            config.monitor,
        ));

        info!("Service container initialized");

        Ok(Self {
            pool,
            stream_repository,
            schedule_repository,
            credential_repository,
            credential_service,
            coordinator,
            evaluator,
            auto_stop,
            tasks: Mutex::new(Vec::new()),
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Run startup recovery and start the background loops.
    ///
    /// Recovery runs to completion before the first evaluator pass, so a
    /// fresh pass never races cleanup of state a dead run left behind: stuck
    /// occurrences are failed first, then an immediate stop sweep settles the
    /// stream rows they were bound to.
    pub async fn initialize(&self) -> Result<()> {
        info!("Initializing services");

        let now = Utc::now();

        let failed = self.evaluator.fail_stuck_occurrences(now).await?;
        if failed > 0 {
            warn!(
                count = failed,
                "Failed stuck occurrences left by a previous run"
            );
        }

        let sweep = self.auto_stop.tick_once(now).await?;
        if !sweep.is_empty() {
            info!(
                expired = sweep.expired,
                reconciled = sweep.reconciled,
                forced_offline = sweep.forced_offline,
                "Startup stop sweep settled leftover sessions"
            );
        }

        let evaluator_loop = tokio::spawn(
            Arc::clone(&self.evaluator).run(self.cancellation_token.clone()),
        );
        let auto_stop_loop = tokio::spawn(
            Arc::clone(&self.auto_stop).run(self.cancellation_token.clone()),
        );
        self.tasks
            .lock()
            .await
            .extend([evaluator_loop, auto_stop_loop]);

        info!("Services initialized");
        Ok(())
    }

    /// Shutdown all services gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Shutdown all services gracefully with a custom timeout.
    ///
    /// The background loops never interrupt a tick in progress, so joining
    /// them here waits for in-flight database writes before the pool closes.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        info!("Shutting down services (timeout: {:?})", timeout);

        // Signal the background loops to stop.
        self.cancellation_token.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        let drained = tokio::time::timeout(timeout, async {
            for task in tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "Background task ended abnormally");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!("Shutdown timeout reached, forcing shutdown");
        }

        info!("Closing database pool...");
        self.pool.close().await;

        info!("Services shut down");
        Ok(())
    }

    /// Get the cancellation token for external use.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Check if shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}
