//! Lifecycle coordinator service.
//!
//! Owns the path from a claimed occurrence to a live stream and back down
//! again. The startup sequence is strictly ordered: credential, ingest,
//! process start, activation, and only once media is confirmed flowing does a
//! broadcast get created and bound. A startup that dies before that point
//! leaves nothing behind on the remote service; one that dies after it tears
//! the broadcast down again.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::broadcast::{BroadcastClient, BroadcastMetadata, Ingest, TransitionTarget};
use crate::credentials::{ChannelCredential, CredentialService};
use crate::database::models::{ScheduleDbModel, ScheduleStatus, StreamDbModel, StreamStatus};
use crate::database::repositories::{CredentialRepository, ScheduleRepository, StreamRepository};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::supervisor::{ProcessHandle, ProcessHealth, ProcessSupervisor};
use crate::{Error, Result};

use super::backoff::{retry_transient, BackoffConfig};

/// Coordinator tuning knobs.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Delay between process health polls while waiting for activation.
    pub health_poll_interval: Duration,
    /// Number of health polls before startup is abandoned.
    pub health_poll_attempts: u32,
    /// Retry policy for transient remote failures during startup.
    pub retry: BackoffConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            health_poll_interval: Duration::from_secs(3),
            health_poll_attempts: 40,
            retry: BackoffConfig::default(),
        }
    }
}

/// Why a stream is being stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    /// The session's scheduled end time passed.
    Expired,
    /// An operator asked for the stop.
    Manual,
    /// Reconciliation found a live stream with no valid session behind it.
    Reconcile,
}

impl StopCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::Manual => "manual",
            Self::Reconcile => "reconcile",
        }
    }
}

/// Drives stream sessions through their lifecycle.
///
/// All stop paths (scheduled end, operator stop, reconciliation) funnel
/// through [`LifecycleCoordinator::stop_stream`] and serialize on a per-stream
/// lock, so concurrent stop attempts cannot interleave their side effects.
/// Startup races are settled earlier, by the status CAS on the stream row.
pub struct LifecycleCoordinator<SR, SCR, CR>
where
    SR: StreamRepository + Send + Sync + 'static,
    SCR: ScheduleRepository + Send + Sync + 'static,
    CR: CredentialRepository + Send + Sync + 'static,
{
    stream_repository: Arc<SR>,
    schedule_repository: Arc<SCR>,
    credentials: Arc<CredentialService<CR>>,
    supervisor: Arc<dyn ProcessSupervisor>,
    broadcast: Arc<dyn BroadcastClient>,
    /// Handles for processes started by this run, keyed by stream id. Not
    /// persisted: after a crash the supervisor's processes are assumed gone.
    handles: DashMap<String, ProcessHandle>,
    /// Per-stream stop serialization.
    stop_locks: DashMap<String, Arc<Mutex<()>>>,
    config: CoordinatorConfig,
}

impl<SR, SCR, CR> LifecycleCoordinator<SR, SCR, CR>
where
    SR: StreamRepository + Send + Sync + 'static,
    SCR: ScheduleRepository + Send + Sync + 'static,
    CR: CredentialRepository + Send + Sync + 'static,
{
    pub fn new(
        stream_repository: Arc<SR>,
        schedule_repository: Arc<SCR>,
        credentials: Arc<CredentialService<CR>>,
        supervisor: Arc<dyn ProcessSupervisor>,
        broadcast: Arc<dyn BroadcastClient>,
    ) -> Self {
        Self::with_config(
            stream_repository,
            schedule_repository,
            credentials,
            supervisor,
            broadcast,
            CoordinatorConfig::default(),
        )
    }

    pub fn with_config(
        stream_repository: Arc<SR>,
        schedule_repository: Arc<SCR>,
        credentials: Arc<CredentialService<CR>>,
        supervisor: Arc<dyn ProcessSupervisor>,
        broadcast: Arc<dyn BroadcastClient>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            stream_repository,
            schedule_repository,
            credentials,
            supervisor,
            broadcast,
            handles: DashMap::new(),
            stop_locks: DashMap::new(),
            config,
        }
    }

    /// True if this run started (and still tracks) a process for the stream.
    pub fn has_handle(&self, stream_id: &str) -> bool {
        self.handles.contains_key(stream_id)
    }

    fn stop_lock(&self, stream_id: &str) -> Arc<Mutex<()>> {
        self.stop_locks
            .entry(stream_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run a claimed occurrence on a background task.
    ///
    /// By the time the task finishes, the outcome is persisted either way, so
    /// the task result is only logged.
    pub fn spawn_occurrence(self: &Arc<Self>, schedule_id: String) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = coordinator.run_occurrence(&schedule_id).await {
                error!(schedule_id = %schedule_id, error = %e, "Occurrence startup failed");
            }
        });
    }

    /// Drive a `triggered` occurrence to `live`.
    ///
    /// On failure the partial startup is torn down: process stopped, any
    /// created broadcast deleted, the occurrence marked failed, and the
    /// stream returned to offline.
    #[instrument(skip(self), fields(schedule_id = %schedule_id))]
    pub async fn run_occurrence(&self, schedule_id: &str) -> Result<()> {
        let schedule = self.schedule_repository.get_schedule(schedule_id).await?;
        if schedule.parsed_status() != Some(ScheduleStatus::Triggered) {
            warn!(status = %schedule.status, "Occurrence is not claimed for startup, skipping");
            return Ok(());
        }

        let stream = self
            .stream_repository
            .get_stream(&schedule.stream_id)
            .await?;
        let claimed = retry_on_sqlite_busy("claim_for_occurrence", || async {
            self.stream_repository
                .claim_for_occurrence(&stream.id, schedule_id)
                .await
        })
        .await?;
        if !claimed {
            warn!(stream_id = %stream.id, "Stream is busy, failing occurrence");
            self.schedule_repository.mark_failed(schedule_id).await?;
            return Ok(());
        }

        let mut created_broadcast = None;
        match self
            .drive_to_live(&schedule, &stream, &mut created_broadcast)
            .await
        {
            Ok(()) => {
                info!(stream_id = %stream.id, "Occurrence is live");
                Ok(())
            }
            Err(e) => {
                error!(stream_id = %stream.id, error = %e, "Startup failed, tearing down");
                self.teardown_failed(schedule_id, &stream, created_broadcast.as_deref())
                    .await;
                Err(e)
            }
        }
    }

    async fn drive_to_live(
        &self,
        schedule: &ScheduleDbModel,
        stream: &StreamDbModel,
        created_broadcast: &mut Option<String>,
    ) -> Result<()> {
        let credential = self
            .credentials
            .get_valid_credential(&stream.channel)
            .await?;
        let ingest = self.ensure_ingest(stream, &credential).await?;

        let handle = self.supervisor.start(&stream.id, &ingest.address).await?;
        debug!(stream_id = %stream.id, process_id = %handle.id, "Stream process started");
        self.handles.insert(stream.id.clone(), handle.clone());

        self.await_process_active(&handle).await?;
        info!(stream_id = %stream.id, "Stream process is delivering media");

        // Only now, with media confirmed flowing, does the broadcast exist.
        let metadata = BroadcastMetadata {
            title: stream.title.clone(),
            description: stream.description.clone(),
            scheduled_start: Utc::now(),
        };
        let broadcast_id = retry_transient(
            "create_and_bind_broadcast",
            &self.config.retry,
            || async {
                self.broadcast
                    .create_and_bind_broadcast(&credential.access_token, &ingest.id, &metadata)
                    .await
                    .map_err(Error::from)
            },
        )
        .await?;
        info!(stream_id = %stream.id, broadcast_id = %broadcast_id, "Broadcast created and bound to ingest");
        *created_broadcast = Some(broadcast_id.clone());

        if !self
            .schedule_repository
            .bind_broadcast(&schedule.id, &broadcast_id)
            .await?
        {
            // The staleness sweep (or an operator) moved the occurrence while
            // startup was in flight. Abort; teardown deletes the broadcast.
            return Err(Error::InvalidStateTransition {
                from: self.current_schedule_status(&schedule.id).await,
                to: ScheduleStatus::BroadcastBound.as_str().to_string(),
            });
        }

        retry_transient("transition_broadcast_live", &self.config.retry, || async {
            self.broadcast
                .transition_broadcast(
                    &credential.access_token,
                    &broadcast_id,
                    TransitionTarget::Live,
                )
                .await
                .map_err(Error::from)
        })
        .await?;

        let end_ms = now_ms() + schedule.duration_minutes * 60_000;
        if !self
            .stream_repository
            .set_live(&stream.id, &broadcast_id, end_ms)
            .await?
        {
            return Err(Error::InvalidStateTransition {
                from: self.current_stream_status(&stream.id).await,
                to: StreamStatus::Live.as_str().to_string(),
            });
        }
        if !self.schedule_repository.mark_live(&schedule.id).await? {
            return Err(Error::InvalidStateTransition {
                from: self.current_schedule_status(&schedule.id).await,
                to: ScheduleStatus::Live.as_str().to_string(),
            });
        }

        Ok(())
    }

    /// Reuse the stream's persisted ingest, or create one on first use.
    async fn ensure_ingest(
        &self,
        stream: &StreamDbModel,
        credential: &ChannelCredential,
    ) -> Result<Ingest> {
        if let (Some(id), Some(address)) = (&stream.ingest_id, &stream.ingest_address) {
            debug!(stream_id = %stream.id, ingest_id = %id, "Reusing persisted ingest");
            return Ok(Ingest {
                id: id.clone(),
                address: address.clone(),
            });
        }

        let ingest = retry_transient("create_ingest", &self.config.retry, || async {
            self.broadcast
                .create_ingest(&credential.access_token, &stream.title)
                .await
                .map_err(Error::from)
        })
        .await?;
        self.stream_repository
            .set_ingest(&stream.id, &ingest.id, &ingest.address)
            .await?;
        info!(stream_id = %stream.id, ingest_id = %ingest.id, "Created ingest endpoint");
        Ok(ingest)
    }

    /// Poll process health until it reports active, bounded by the configured
    /// attempt budget. Transient probe failures are tolerated; an exited
    /// process fails startup immediately.
    async fn await_process_active(&self, handle: &ProcessHandle) -> Result<()> {
        for attempt in 1..=self.config.health_poll_attempts {
            match self.supervisor.health(handle).await {
                Ok(ProcessHealth::Active) => return Ok(()),
                Ok(ProcessHealth::Inactive) => {
                    debug!(stream_id = %handle.stream_id, attempt, "Process not yet active");
                }
                Ok(ProcessHealth::Exited) => {
                    return Err(Error::ProcessExited {
                        stream_id: handle.stream_id.clone(),
                    });
                }
                Err(e) => {
                    warn!(stream_id = %handle.stream_id, attempt, error = %e, "Health probe failed");
                }
            }
            tokio::time::sleep(self.config.health_poll_interval).await;
        }
        Err(Error::ProcessActivationTimeout {
            stream_id: handle.stream_id.clone(),
            attempts: self.config.health_poll_attempts,
        })
    }

    /// Undo a partial startup. Every step is best-effort: whatever happens to
    /// the remote side, the occurrence ends up failed and the stream offline.
    async fn teardown_failed(
        &self,
        schedule_id: &str,
        stream: &StreamDbModel,
        created_broadcast: Option<&str>,
    ) {
        if let Some((_, handle)) = self.handles.remove(&stream.id) {
            if let Err(e) = self.supervisor.stop(&handle).await {
                warn!(stream_id = %stream.id, error = %e, "Failed to stop process during teardown");
            }
        }

        if let Some(broadcast_id) = created_broadcast {
            match self.credentials.get_valid_credential(&stream.channel).await {
                Ok(credential) => {
                    match self
                        .broadcast
                        .delete_broadcast(&credential.access_token, broadcast_id)
                        .await
                    {
                        Ok(()) => {
                            info!(stream_id = %stream.id, broadcast_id = %broadcast_id, "Deleted broadcast that never went live")
                        }
                        Err(e) => {
                            warn!(stream_id = %stream.id, broadcast_id = %broadcast_id, error = %e, "Failed to delete orphaned broadcast")
                        }
                    }
                }
                Err(e) => {
                    warn!(stream_id = %stream.id, broadcast_id = %broadcast_id, error = %e, "No usable credential to delete orphaned broadcast");
                }
            }
        }

        if let Err(e) = self.schedule_repository.mark_failed(schedule_id).await {
            error!(schedule_id = %schedule_id, error = %e, "Failed to mark occurrence failed");
        }
        if let Err(e) = self.stream_repository.clear_binding(&stream.id).await {
            error!(stream_id = %stream.id, error = %e, "Failed to return stream to offline");
        }
    }

    /// Stop a live stream and settle its occurrence.
    ///
    /// Returns false when there was nothing to stop (stream not live, or a
    /// concurrent stop won the status race).
    #[instrument(skip(self), fields(stream_id = %stream_id, cause = cause.as_str()))]
    pub async fn stop_stream(&self, stream_id: &str, cause: StopCause) -> Result<bool> {
        let lock = self.stop_lock(stream_id);
        let _guard = lock.lock().await;

        let stream = self.stream_repository.get_stream(stream_id).await?;
        let Some(status) = stream.parsed_status() else {
            warn!(status = %stream.status, "Stream has unrecognized status, skipping stop");
            return Ok(false);
        };
        if !status.can_transition_to(StreamStatus::Stopping) {
            debug!(status = %stream.status, "Stream is not live, nothing to stop");
            return Ok(false);
        }
        let stopping = retry_on_sqlite_busy("begin_stopping", || async {
            self.stream_repository.begin_stopping(stream_id).await
        })
        .await?;
        if !stopping {
            debug!("Concurrent stop won the race");
            return Ok(false);
        }

        info!("Stopping stream");

        if let Some((_, handle)) = self.handles.remove(stream_id) {
            if let Err(e) = self.supervisor.stop(&handle).await {
                warn!(error = %e, "Failed to stop stream process");
            }
        } else {
            debug!("No process handle registered; process predates this run or never started");
        }

        self.complete_remote_broadcast(&stream).await;
        self.settle_occurrence(&stream).await?;
        self.stream_repository.clear_binding(stream_id).await?;

        info!("Stream stopped");
        Ok(true)
    }

    /// Operator-initiated stop.
    pub async fn manual_stop(&self, stream_id: &str) -> Result<bool> {
        self.stop_stream(stream_id, StopCause::Manual).await
    }

    /// Operator-initiated start: creates a one-shot occurrence due now and
    /// runs it in the background. Returns the created schedule's id.
    #[instrument(skip(self), fields(stream_id = %stream_id))]
    pub async fn manual_start(
        self: &Arc<Self>,
        stream_id: &str,
        duration_minutes: i64,
    ) -> Result<String> {
        if duration_minutes <= 0 {
            return Err(Error::validation("duration_minutes must be positive"));
        }
        let stream = self.stream_repository.get_stream(stream_id).await?;
        if stream.parsed_status() != Some(StreamStatus::Offline) {
            return Err(Error::InvalidStateTransition {
                from: stream.status,
                to: StreamStatus::Pending.as_str().to_string(),
            });
        }

        let schedule = ScheduleDbModel::one_shot(stream_id, Utc::now(), duration_minutes);
        self.schedule_repository.create_schedule(&schedule).await?;
        if !self
            .schedule_repository
            .claim_trigger(&schedule.id, now_ms())
            .await?
        {
            return Err(Error::validation(
                "schedule was claimed before manual start could run",
            ));
        }

        info!(schedule_id = %schedule.id, "Manual start requested");
        self.spawn_occurrence(schedule.id.clone());
        Ok(schedule.id)
    }

    /// Force a stream stuck in a transitional status back to offline.
    ///
    /// For rows left behind by a crashed run: the process (if any is still
    /// tracked) is stopped, the bound occurrence fails, and the stream is
    /// released. Recurring schedules failed here are rearmed by the evaluator
    /// once their window has passed.
    #[instrument(skip(self), fields(stream_id = %stream_id))]
    pub async fn force_offline(&self, stream_id: &str) -> Result<()> {
        let lock = self.stop_lock(stream_id);
        let _guard = lock.lock().await;

        let stream = self.stream_repository.get_stream(stream_id).await?;
        match stream.parsed_status() {
            Some(StreamStatus::Pending | StreamStatus::Stopping) => {}
            _ => {
                debug!(status = %stream.status, "Stream no longer transitional, skipping");
                return Ok(());
            }
        }

        warn!(status = %stream.status, "Forcing stuck stream offline");

        if let Some((_, handle)) = self.handles.remove(stream_id) {
            if let Err(e) = self.supervisor.stop(&handle).await {
                warn!(error = %e, "Failed to stop process of stuck stream");
            }
        }

        if let Some(schedule_id) = &stream.active_schedule_id {
            match self.schedule_repository.get_schedule(schedule_id).await {
                Ok(s) if !s.parsed_status().is_some_and(|st| st.is_terminal()) => {
                    self.schedule_repository.mark_failed(&s.id).await?;
                }
                Ok(_) => {}
                Err(Error::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        self.stream_repository.clear_binding(stream_id).await?;
        Ok(())
    }

    /// Best-effort remote completion during a stop. A failure here (expired
    /// credential, broadcast already finished remotely) never blocks the
    /// local stop.
    async fn complete_remote_broadcast(&self, stream: &StreamDbModel) {
        let Some(broadcast_id) = &stream.broadcast_id else {
            return;
        };
        match self.credentials.get_valid_credential(&stream.channel).await {
            Ok(credential) => {
                if let Err(e) = self
                    .broadcast
                    .transition_broadcast(
                        &credential.access_token,
                        broadcast_id,
                        TransitionTarget::Complete,
                    )
                    .await
                {
                    warn!(
                        stream_id = %stream.id,
                        broadcast_id = %broadcast_id,
                        error = %e,
                        "Failed to complete broadcast remotely"
                    );
                }
            }
            Err(e) => {
                warn!(stream_id = %stream.id, error = %e, "No usable credential to complete broadcast");
            }
        }
    }

    /// Settle the occurrence bound to a stopping stream: recurring schedules
    /// are rearmed for their next window, one-shots complete. An occurrence
    /// that already settled (a failed one being force-stopped) is left alone.
    async fn settle_occurrence(&self, stream: &StreamDbModel) -> Result<()> {
        let Some(schedule_id) = &stream.active_schedule_id else {
            debug!(stream_id = %stream.id, "No occurrence bound to stream");
            return Ok(());
        };
        let schedule = match self.schedule_repository.get_schedule(schedule_id).await {
            Ok(s) => s,
            Err(Error::NotFound { .. }) => {
                warn!(stream_id = %stream.id, schedule_id = %schedule_id, "Bound occurrence no longer exists");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if schedule.parsed_status().is_some_and(|s| s.is_terminal()) {
            debug!(schedule_id = %schedule.id, status = %schedule.status, "Occurrence already settled");
            return Ok(());
        }

        if schedule.is_recurring {
            self.schedule_repository
                .reset_to_pending(&schedule.id)
                .await?;
            info!(schedule_id = %schedule.id, "Recurring schedule rearmed");
        } else {
            self.schedule_repository.mark_completed(&schedule.id).await?;
            info!(schedule_id = %schedule.id, "One-shot schedule completed");
        }
        Ok(())
    }

    async fn current_schedule_status(&self, id: &str) -> String {
        self.schedule_repository
            .get_schedule(id)
            .await
            .map(|s| s.status)
            .unwrap_or_else(|_| "unknown".to_string())
    }

    async fn current_stream_status(&self, id: &str) -> String {
        self.stream_repository
            .get_stream(id)
            .await
            .map(|s| s.status)
            .unwrap_or_else(|_| "unknown".to_string())
    }
}
