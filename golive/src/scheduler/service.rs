//! Schedule evaluator service.
//!
//! A periodic sweep that decides, per pending schedule, whether its trigger
//! condition holds right now. Due schedules are claimed with a status CAS
//! (at most one evaluation pass wins) and handed to the coordinator on a
//! background task. Triggers that surface outside their grace window are
//! failed so the miss is visible instead of firing arbitrarily late.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coordinator::LifecycleCoordinator;
use crate::database::models::{ScheduleStatus, TriggerSpec};
use crate::database::repositories::{CredentialRepository, ScheduleRepository, StreamRepository};
use crate::database::retry::retry_on_sqlite_busy;
use crate::Result;

use super::window::{current_recurring_window, one_shot_due, OneShotDue};

/// Evaluator tuning knobs.
#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    /// Cadence of evaluation passes.
    pub tick_interval: Duration,
    /// How long a trigger stays fireable after its nominal time.
    pub grace_window: chrono::Duration,
    /// In-flight occurrences untouched for longer than this are failed
    /// during startup recovery.
    pub staleness_window: chrono::Duration,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            grace_window: chrono::Duration::minutes(10),
            staleness_window: chrono::Duration::minutes(30),
        }
    }
}

/// What one evaluation pass did.
#[derive(Debug, Default, Clone, Copy)]
pub struct EvaluationSummary {
    /// Schedules claimed and handed to the coordinator.
    pub triggered: usize,
    /// One-shot schedules failed because their grace window had passed.
    pub failed_missed: usize,
    /// Settled recurring schedules rearmed for their next window.
    pub reset: usize,
}

impl EvaluationSummary {
    pub fn is_empty(&self) -> bool {
        self.triggered == 0 && self.failed_missed == 0 && self.reset == 0
    }
}

/// Periodic schedule evaluator.
///
/// Everything is a function of the `now` passed in, so passes are
/// reproducible in tests without touching a clock.
pub struct ScheduleEvaluator<SR, SCR, CR>
where
    SR: StreamRepository + Send + Sync + 'static,
    SCR: ScheduleRepository + Send + Sync + 'static,
    CR: CredentialRepository + Send + Sync + 'static,
{
    schedule_repository: Arc<SCR>,
    coordinator: Arc<LifecycleCoordinator<SR, SCR, CR>>,
    config: EvaluatorConfig,
}

impl<SR, SCR, CR> ScheduleEvaluator<SR, SCR, CR>
where
    SR: StreamRepository + Send + Sync + 'static,
    SCR: ScheduleRepository + Send + Sync + 'static,
    CR: CredentialRepository + Send + Sync + 'static,
{
    pub fn new(
        schedule_repository: Arc<SCR>,
        coordinator: Arc<LifecycleCoordinator<SR, SCR, CR>>,
        config: EvaluatorConfig,
    ) -> Self {
        Self {
            schedule_repository,
            coordinator,
            config,
        }
    }

    /// One evaluation pass at `now`.
    ///
    /// Rearms elapsed recurring schedules first, then classifies every
    /// pending schedule whose stream is free. Due schedules are claimed via
    /// CAS; the claim winner hands the occurrence to the coordinator.
    pub async fn evaluate_once(&self, now: DateTime<Utc>) -> Result<EvaluationSummary> {
        let mut summary = EvaluationSummary {
            reset: self.rearm_elapsed_recurring(now).await?,
            ..EvaluationSummary::default()
        };

        let candidates = self
            .schedule_repository
            .list_pending_with_free_stream()
            .await?;

        for schedule in candidates {
            let spec = match schedule.trigger_spec() {
                Ok(spec) => spec,
                Err(e) => {
                    warn!(schedule_id = %schedule.id, error = %e, "Skipping malformed schedule");
                    continue;
                }
            };

            match spec {
                TriggerSpec::OneShot { trigger_time } => {
                    match one_shot_due(trigger_time, self.config.grace_window, now) {
                        OneShotDue::NotYet => continue,
                        OneShotDue::Ready => {}
                        OneShotDue::Missed => {
                            if self
                                .schedule_repository
                                .transition_status(
                                    &schedule.id,
                                    ScheduleStatus::Pending.as_str(),
                                    ScheduleStatus::Failed.as_str(),
                                )
                                .await?
                            {
                                warn!(
                                    schedule_id = %schedule.id,
                                    trigger_time = %trigger_time,
                                    "Trigger surfaced outside its grace window, failing occurrence"
                                );
                                summary.failed_missed += 1;
                            }
                            continue;
                        }
                    }
                }
                TriggerSpec::Recurring {
                    time_of_day,
                    weekdays,
                    timezone,
                } => {
                    let Some(window) = current_recurring_window(
                        time_of_day,
                        &weekdays,
                        timezone,
                        self.config.grace_window,
                        now,
                    ) else {
                        continue;
                    };
                    // Each window fires at most once; the trigger stamp
                    // survives resets exactly for this comparison.
                    if schedule
                        .last_triggered_at
                        .is_some_and(|last| last >= window.start_ms())
                    {
                        continue;
                    }
                }
            }

            let claimed = retry_on_sqlite_busy("claim_trigger", || async {
                self.schedule_repository
                    .claim_trigger(&schedule.id, now.timestamp_millis())
                    .await
            })
            .await?;

            if claimed {
                info!(
                    schedule_id = %schedule.id,
                    stream_id = %schedule.stream_id,
                    "Schedule triggered"
                );
                summary.triggered += 1;
                self.coordinator.spawn_occurrence(schedule.id.clone());
            } else {
                debug!(schedule_id = %schedule.id, "Lost trigger claim to a concurrent pass");
            }
        }

        Ok(summary)
    }

    /// Rearm settled recurring schedules whose window has fully passed.
    ///
    /// Waiting for the window to elapse keeps a failed occurrence from
    /// firing a second time inside the same window.
    async fn rearm_elapsed_recurring(&self, now: DateTime<Utc>) -> Result<usize> {
        let settled = self.schedule_repository.list_settled_recurring().await?;
        let mut reset = 0;

        for schedule in settled {
            let Ok(TriggerSpec::Recurring {
                time_of_day,
                weekdays,
                timezone,
            }) = schedule.trigger_spec()
            else {
                warn!(
                    schedule_id = %schedule.id,
                    "Settled recurring schedule has malformed trigger columns, leaving it"
                );
                continue;
            };
            if current_recurring_window(
                time_of_day,
                &weekdays,
                timezone,
                self.config.grace_window,
                now,
            )
            .is_some()
            {
                continue;
            }

            self.schedule_repository
                .reset_to_pending(&schedule.id)
                .await?;
            debug!(schedule_id = %schedule.id, "Recurring schedule rearmed");
            reset += 1;
        }

        Ok(reset)
    }

    /// Startup recovery: fail occurrences a previous run left behind.
    ///
    /// Covers two shapes. Occurrences claimed but never driven to live are
    /// failed once they are older than the staleness window. Occurrences
    /// recorded live with no live stream behind them are failed outright;
    /// this runs before any occurrence task, so the mid-startup snapshot
    /// hazard on that query does not apply.
    pub async fn fail_stuck_occurrences(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = (now - self.config.staleness_window).timestamp_millis();
        let mut failed = 0;

        for schedule in self.schedule_repository.list_stuck_in_flight(cutoff).await? {
            warn!(
                schedule_id = %schedule.id,
                status = %schedule.status,
                "Occurrence stuck in flight past the staleness window, failing"
            );
            self.schedule_repository.mark_failed(&schedule.id).await?;
            failed += 1;
        }

        for schedule in self.schedule_repository.list_orphaned_live().await? {
            warn!(
                schedule_id = %schedule.id,
                stream_id = %schedule.stream_id,
                "Occurrence recorded live without a live stream behind it, failing"
            );
            self.schedule_repository.mark_failed(&schedule.id).await?;
            failed += 1;
        }

        Ok(failed)
    }

    /// Evaluation loop. Runs until the token is cancelled.
    pub async fn run(self: Arc<Self>, cancellation_token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_secs = self.config.tick_interval.as_secs(),
            "Schedule evaluator started"
        );

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("Schedule evaluator stopping");
                    break;
                }
                _ = interval.tick() => {
                    match self.evaluate_once(Utc::now()).await {
                        Ok(summary) if summary.is_empty() => {}
                        Ok(summary) => {
                            info!(
                                triggered = summary.triggered,
                                failed_missed = summary.failed_missed,
                                reset = summary.reset,
                                "Evaluation pass complete"
                            );
                        }
                        Err(e) => {
                            error!(error = %e, "Evaluation pass failed");
                        }
                    }
                }
            }
        }
    }
}
