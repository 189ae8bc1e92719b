//! Environment-backed application configuration.

use std::time::Duration;

use crate::coordinator::CoordinatorConfig;
use crate::credentials::{HttpTokenRefresher, DEFAULT_REFRESH_MARGIN_MINUTES};
use crate::monitor::MonitorConfig;
use crate::scheduler::EvaluatorConfig;
use crate::services::ContainerConfig;
use crate::{Error, Result};

/// Default database path, created on first run.
pub const DEFAULT_DATABASE_URL: &str = "sqlite:golive.db?mode=rwc";

/// Default directory for rolling log files.
pub const DEFAULT_LOG_DIR: &str = "logs";

/// Application configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// SQLite database URL.
    pub database_url: String,
    /// Directory for rolling log files.
    pub log_dir: String,
    /// OAuth2 token endpoint used for refresh grants.
    pub token_endpoint: String,
    pub oauth_client_id: String,
    pub oauth_client_secret: String,
    /// Schedule evaluation cadence in seconds.
    pub evaluator_tick_secs: u64,
    /// Stop sweep cadence in seconds.
    pub auto_stop_tick_secs: u64,
    /// How long a trigger stays fireable after its nominal time.
    pub grace_window_minutes: i64,
    /// Untouched in-flight state older than this is treated as abandoned.
    pub staleness_window_minutes: i64,
    /// Safety margin for handed-out access tokens.
    pub refresh_margin_minutes: i64,
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `DATABASE_URL`: SQLite database URL (default: "sqlite:golive.db?mode=rwc")
    /// - `GOLIVE_LOG_DIR`: directory for rolling log files (default: "logs")
    /// - `GOLIVE_TOKEN_ENDPOINT`: OAuth2 token endpoint for refresh grants
    /// - `GOLIVE_OAUTH_CLIENT_ID` / `GOLIVE_OAUTH_CLIENT_SECRET`: OAuth2 client pair
    /// - `GOLIVE_EVALUATOR_TICK_SECS`: schedule evaluation cadence (default: 60)
    /// - `GOLIVE_AUTO_STOP_TICK_SECS`: stop sweep cadence (default: 60)
    /// - `GOLIVE_GRACE_WINDOW_MINUTES`: trigger grace window (default: 10)
    /// - `GOLIVE_STALENESS_WINDOW_MINUTES`: stuck state cutoff (default: 30)
    /// - `GOLIVE_REFRESH_MARGIN_MINUTES`: token freshness margin (default: 5)
    ///
    /// Unset variables fall back to their defaults; set but unparseable ones
    /// are configuration errors rather than silent fallbacks.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let evaluator = EvaluatorConfig::default();
        let monitor = MonitorConfig::default();

        let config = Self {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            log_dir: lookup("GOLIVE_LOG_DIR").unwrap_or_else(|| DEFAULT_LOG_DIR.to_string()),
            token_endpoint: lookup("GOLIVE_TOKEN_ENDPOINT").unwrap_or_default(),
            oauth_client_id: lookup("GOLIVE_OAUTH_CLIENT_ID").unwrap_or_default(),
            oauth_client_secret: lookup("GOLIVE_OAUTH_CLIENT_SECRET").unwrap_or_default(),
            evaluator_tick_secs: parse_var(
                &lookup,
                "GOLIVE_EVALUATOR_TICK_SECS",
                evaluator.tick_interval.as_secs(),
            )?,
            auto_stop_tick_secs: parse_var(
                &lookup,
                "GOLIVE_AUTO_STOP_TICK_SECS",
                monitor.tick_interval.as_secs(),
            )?,
            grace_window_minutes: parse_var(
                &lookup,
                "GOLIVE_GRACE_WINDOW_MINUTES",
                evaluator.grace_window.num_minutes(),
            )?,
            staleness_window_minutes: parse_var(
                &lookup,
                "GOLIVE_STALENESS_WINDOW_MINUTES",
                evaluator.staleness_window.num_minutes(),
            )?,
            refresh_margin_minutes: parse_var(
                &lookup,
                "GOLIVE_REFRESH_MARGIN_MINUTES",
                DEFAULT_REFRESH_MARGIN_MINUTES,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.evaluator_tick_secs == 0 {
            return Err(Error::config("GOLIVE_EVALUATOR_TICK_SECS must be positive"));
        }
        if self.auto_stop_tick_secs == 0 {
            return Err(Error::config("GOLIVE_AUTO_STOP_TICK_SECS must be positive"));
        }
        if self.grace_window_minutes <= 0 {
            return Err(Error::config("GOLIVE_GRACE_WINDOW_MINUTES must be positive"));
        }
        if self.staleness_window_minutes <= 0 {
            return Err(Error::config(
                "GOLIVE_STALENESS_WINDOW_MINUTES must be positive",
            ));
        }
        if self.refresh_margin_minutes < 0 {
            return Err(Error::config(
                "GOLIVE_REFRESH_MARGIN_MINUTES must not be negative",
            ));
        }
        Ok(())
    }

    /// Assemble the per-service configs this configuration describes.
    ///
    /// The staleness window drives both the evaluator's startup recovery and
    /// the monitor's stuck-stream cutoff, so the two sweeps agree on when
    /// abandoned state is old enough to reclaim.
    pub fn container_config(&self) -> ContainerConfig {
        ContainerConfig {
            refresh_margin: chrono::Duration::minutes(self.refresh_margin_minutes),
            coordinator: CoordinatorConfig::default(),
            evaluator: EvaluatorConfig {
                tick_interval: Duration::from_secs(self.evaluator_tick_secs),
                grace_window: chrono::Duration::minutes(self.grace_window_minutes),
                staleness_window: chrono::Duration::minutes(self.staleness_window_minutes),
            },
            monitor: MonitorConfig {
                tick_interval: Duration::from_secs(self.auto_stop_tick_secs),
                stuck_cutoff: chrono::Duration::minutes(self.staleness_window_minutes),
            },
        }
    }

    /// Build the OAuth2 token refresher this configuration points at.
    ///
    /// Errors if the token endpoint or client pair is not configured; stored
    /// refresh tokens are useless without them.
    pub fn refresher(&self) -> Result<HttpTokenRefresher> {
        if self.token_endpoint.is_empty() {
            return Err(Error::config("GOLIVE_TOKEN_ENDPOINT is not set"));
        }
        if self.oauth_client_id.is_empty() || self.oauth_client_secret.is_empty() {
            return Err(Error::config(
                "GOLIVE_OAUTH_CLIENT_ID and GOLIVE_OAUTH_CLIENT_SECRET must be set",
            ));
        }
        Ok(HttpTokenRefresher::new(
            self.token_endpoint.as_str(),
            self.oauth_client_id.as_str(),
            self.oauth_client_secret.as_str(),
        )?)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("invalid {name} value {raw:?}: {e}"))),
        None => Ok(default),
    }
}
