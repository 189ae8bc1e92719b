//! Schedule database model.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::ms_to_datetime;
use crate::{Error, Result};

/// Schedule database model.
///
/// A schedule describes when a stream should go live. The row doubles as the
/// occurrence record: `status` tracks the current occurrence through its
/// lifecycle, and recurring schedules are reset to `pending` once their window
/// has passed so the next occurrence can fire.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ScheduleDbModel {
    pub id: String,
    pub stream_id: String,
    /// Unix epoch milliseconds (UTC) of a one-shot trigger. NULL for recurring.
    pub trigger_time: Option<i64>,
    /// Local wall-clock time "HH:MM" for recurring schedules. NULL for one-shot.
    pub time_of_day: Option<String>,
    /// Comma-separated weekday names ("mon,wed,fri"). NULL for one-shot.
    pub weekdays: Option<String>,
    /// IANA timezone name the recurring times are interpreted in.
    pub timezone: String,
    /// How long the session should run once live.
    pub duration_minutes: i64,
    pub is_recurring: bool,
    /// Occurrence status (pending, triggered, broadcast_bound, live, completed, failed).
    pub status: String,
    /// Unix epoch milliseconds (UTC) when the current occurrence was claimed.
    pub last_triggered_at: Option<i64>,
    /// Broadcast bound to the current occurrence, if any.
    pub broadcast_id: Option<String>,
    /// Unix epoch milliseconds (UTC) when created.
    pub created_at: i64,
    /// Unix epoch milliseconds (UTC) when last updated.
    pub updated_at: i64,
}

impl ScheduleDbModel {
    /// Create a new one-shot schedule firing at `trigger_time`.
    pub fn one_shot(
        stream_id: impl Into<String>,
        trigger_time: DateTime<Utc>,
        duration_minutes: i64,
    ) -> Self {
        let now = crate::database::time::now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            stream_id: stream_id.into(),
            trigger_time: Some(trigger_time.timestamp_millis()),
            time_of_day: None,
            weekdays: None,
            timezone: "UTC".to_string(),
            duration_minutes,
            is_recurring: false,
            status: ScheduleStatus::Pending.to_string(),
            last_triggered_at: None,
            broadcast_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a new recurring schedule firing at `time_of_day` local to
    /// `timezone` on each weekday in `weekdays`.
    pub fn recurring(
        stream_id: impl Into<String>,
        time_of_day: NaiveTime,
        weekdays: WeekdaySet,
        timezone: Tz,
        duration_minutes: i64,
    ) -> Self {
        let now = crate::database::time::now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            stream_id: stream_id.into(),
            trigger_time: None,
            time_of_day: Some(time_of_day.format("%H:%M").to_string()),
            weekdays: Some(weekdays.to_string()),
            timezone: timezone.name().to_string(),
            duration_minutes,
            is_recurring: true,
            status: ScheduleStatus::Pending.to_string(),
            last_triggered_at: None,
            broadcast_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Status column parsed through the strum `EnumString` derive. `None`
    /// means a value no release ever wrote; callers treat it as unknown.
    pub fn parsed_status(&self) -> Option<ScheduleStatus> {
        self.status.parse().ok()
    }

    /// Parse the persisted trigger columns into a typed [`TriggerSpec`].
    ///
    /// Rows created through the typed constructors always parse; anything
    /// hand-edited into an inconsistent shape surfaces as a validation error
    /// so the evaluator can skip it instead of firing nonsense.
    pub fn trigger_spec(&self) -> Result<TriggerSpec> {
        if self.is_recurring {
            let time_of_day = self
                .time_of_day
                .as_deref()
                .ok_or_else(|| Error::validation("recurring schedule missing time_of_day"))?;
            let time_of_day = NaiveTime::parse_from_str(time_of_day, "%H:%M:%S")
                .or_else(|_| NaiveTime::parse_from_str(time_of_day, "%H:%M"))
                .map_err(|e| Error::validation(format!("invalid time_of_day: {e}")))?;

            let weekdays = self
                .weekdays
                .as_deref()
                .ok_or_else(|| Error::validation("recurring schedule missing weekdays"))?
                .parse::<WeekdaySet>()?;
            if weekdays.is_empty() {
                return Err(Error::validation("recurring schedule has no weekdays"));
            }

            let timezone = self
                .timezone
                .parse::<Tz>()
                .map_err(|_| Error::validation(format!("invalid timezone: {}", self.timezone)))?;

            Ok(TriggerSpec::Recurring {
                time_of_day,
                weekdays,
                timezone,
            })
        } else {
            let trigger_time = self
                .trigger_time
                .ok_or_else(|| Error::validation("one-shot schedule missing trigger_time"))?;
            Ok(TriggerSpec::OneShot {
                trigger_time: ms_to_datetime(trigger_time),
            })
        }
    }
}

/// Typed view of a schedule's trigger columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerSpec {
    OneShot {
        trigger_time: DateTime<Utc>,
    },
    Recurring {
        time_of_day: NaiveTime,
        weekdays: WeekdaySet,
        timezone: Tz,
    },
}

/// Schedule occurrence statuses.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    /// Waiting for its trigger condition.
    Pending,
    /// Claimed by the evaluator; startup in progress.
    Triggered,
    /// A broadcast has been created and bound; not yet live.
    BroadcastBound,
    /// The occurrence is on air.
    Live,
    /// A one-shot occurrence that ran to completion.
    Completed,
    /// The occurrence failed or was missed.
    Failed,
}

impl ScheduleStatus {
    /// Static form for SQL binds, matching the strum snake_case rendering.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Triggered => "triggered",
            Self::BroadcastBound => "broadcast_bound",
            Self::Live => "live",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Statuses that mean an occurrence task claimed this row and has not
    /// reached `live` yet. Rows stuck here past the staleness cutoff belong
    /// to a crashed process.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Triggered | Self::BroadcastBound)
    }

    /// Statuses the occurrence cannot leave on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Set of weekdays a recurring schedule fires on, stored as a bitmask with
/// Monday at bit 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WeekdaySet(u8);

const WEEKDAY_NAMES: [(&str, Weekday); 7] = [
    ("mon", Weekday::Mon),
    ("tue", Weekday::Tue),
    ("wed", Weekday::Wed),
    ("thu", Weekday::Thu),
    ("fri", Weekday::Fri),
    ("sat", Weekday::Sat),
    ("sun", Weekday::Sun),
];

impl WeekdaySet {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn insert(&mut self, day: Weekday) {
        self.0 |= 1 << day.num_days_from_monday();
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Weekday> + '_ {
        WEEKDAY_NAMES
            .iter()
            .map(|(_, day)| *day)
            .filter(|day| self.contains(*day))
    }
}

impl FromIterator<Weekday> for WeekdaySet {
    fn from_iter<I: IntoIterator<Item = Weekday>>(iter: I) -> Self {
        let mut set = Self::new();
        for day in iter {
            set.insert(day);
        }
        set
    }
}

impl FromStr for WeekdaySet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut set = Self::new();
        for token in s.split(',') {
            let token = token.trim().to_ascii_lowercase();
            if token.is_empty() {
                continue;
            }
            let day = WEEKDAY_NAMES
                .iter()
                .find(|(name, _)| *name == token)
                .map(|(_, day)| *day)
                .ok_or_else(|| Error::validation(format!("invalid weekday: {token}")))?;
            set.insert(day);
        }
        Ok(set)
    }
}

impl fmt::Display for WeekdaySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, day) in WEEKDAY_NAMES {
            if self.contains(day) {
                if !first {
                    write!(f, ",")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        Ok(())
    }
}
