//! Due-window math for one-shot and recurring schedules.

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::database::models::WeekdaySet;

/// Where a one-shot trigger time sits relative to `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OneShotDue {
    /// Trigger time is still in the future.
    NotYet,
    /// Inside the grace window; fire it.
    Ready,
    /// Past the grace window; mark it failed so the miss is visible instead
    /// of firing arbitrarily late.
    Missed,
}

/// Classify a one-shot trigger against `now` with a bounded grace window.
pub fn one_shot_due(trigger_time: DateTime<Utc>, grace: Duration, now: DateTime<Utc>) -> OneShotDue {
    if trigger_time > now {
        OneShotDue::NotYet
    } else if now - trigger_time < grace {
        OneShotDue::Ready
    } else {
        OneShotDue::Missed
    }
}

/// The concrete UTC interval of a recurring schedule's window on one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecurringWindow {
    pub start: DateTime<Utc>,
    /// Exclusive end (`start + grace`).
    pub end: DateTime<Utc>,
}

impl RecurringWindow {
    pub fn start_ms(&self) -> i64 {
        self.start.timestamp_millis()
    }
}

/// The window `now` currently falls inside, if any.
///
/// A recurring schedule is inside a window when the local weekday (in the
/// schedule's timezone) is in the allowed set and the local time is within
/// `[time_of_day, time_of_day + grace)`. Returns `None` outside any window,
/// and also on the day a DST jump erases `time_of_day` from the local
/// calendar. An ambiguous local time (the repeated hour when DST ends) uses
/// its earlier occurrence.
pub fn current_recurring_window(
    time_of_day: NaiveTime,
    weekdays: &WeekdaySet,
    timezone: Tz,
    grace: Duration,
    now: DateTime<Utc>,
) -> Option<RecurringWindow> {
    let local_now = now.with_timezone(&timezone);
    if !weekdays.contains(local_now.weekday()) {
        return None;
    }

    let candidate = local_now.date_naive().and_time(time_of_day);
    let start = match timezone.from_local_datetime(&candidate) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => return None,
    }
    .with_timezone(&Utc);

    let end = start + grace;
    if start <= now && now < end {
        Some(RecurringWindow { start, end })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;
    use rstest::rstest;

    fn grace() -> Duration {
        Duration::minutes(10)
    }

    fn mon_wed() -> WeekdaySet {
        [Weekday::Mon, Weekday::Wed].into_iter().collect()
    }

    fn nine_am() -> NaiveTime {
        NaiveTime::from_hms_opt(9, 0, 0).unwrap()
    }

    #[test]
    fn test_one_shot_boundaries() {
        let t = Utc.with_ymd_and_hms(2025, 6, 2, 18, 0, 0).unwrap();

        assert_eq!(one_shot_due(t, grace(), t - Duration::seconds(1)), OneShotDue::NotYet);
        assert_eq!(one_shot_due(t, grace(), t), OneShotDue::Ready);
        assert_eq!(
            one_shot_due(t, grace(), t + Duration::minutes(9)),
            OneShotDue::Ready
        );
        // The window is half-open: exactly grace past the trigger is missed.
        assert_eq!(
            one_shot_due(t, grace(), t + Duration::minutes(10)),
            OneShotDue::Missed
        );
        assert_eq!(
            one_shot_due(t, grace(), t + Duration::minutes(20)),
            OneShotDue::Missed
        );
    }

    // 2025-06-02 is a Monday; 09:00 America/New_York is 13:00 UTC (EDT).
    #[rstest]
    // Inside Monday's window.
    #[case(Utc.with_ymd_and_hms(2025, 6, 2, 13, 0, 0).unwrap(), true)]
    #[case(Utc.with_ymd_and_hms(2025, 6, 2, 13, 9, 59).unwrap(), true)]
    // Before the window opens, and at its exclusive end.
    #[case(Utc.with_ymd_and_hms(2025, 6, 2, 12, 59, 59).unwrap(), false)]
    #[case(Utc.with_ymd_and_hms(2025, 6, 2, 13, 10, 0).unwrap(), false)]
    // Tuesday is not in {Mon, Wed}.
    #[case(Utc.with_ymd_and_hms(2025, 6, 3, 13, 5, 0).unwrap(), false)]
    // Wednesday fires again.
    #[case(Utc.with_ymd_and_hms(2025, 6, 4, 13, 5, 0).unwrap(), true)]
    fn test_recurring_window_match(#[case] now: DateTime<Utc>, #[case] inside: bool) {
        let window = current_recurring_window(
            nine_am(),
            &mon_wed(),
            chrono_tz::America::New_York,
            grace(),
            now,
        );
        assert_eq!(window.is_some(), inside, "now = {now}");
    }

    #[test]
    fn test_recurring_window_start_is_local_time() {
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 13, 5, 0).unwrap();
        let window = current_recurring_window(
            nine_am(),
            &mon_wed(),
            chrono_tz::America::New_York,
            grace(),
            now,
        )
        .unwrap();
        assert_eq!(window.start, Utc.with_ymd_and_hms(2025, 6, 2, 13, 0, 0).unwrap());
        assert_eq!(window.end, Utc.with_ymd_and_hms(2025, 6, 2, 13, 10, 0).unwrap());
    }

    #[test]
    fn test_dst_gap_has_no_window() {
        // US DST started 2025-03-09: 02:00-03:00 local did not exist.
        let days: WeekdaySet = [Weekday::Sun].into_iter().collect();
        let half_past_two = NaiveTime::from_hms_opt(2, 30, 0).unwrap();
        // 07:35 UTC is 03:35 EDT that morning, past where 02:30 would have been.
        let now = Utc.with_ymd_and_hms(2025, 3, 9, 7, 35, 0).unwrap();

        let window = current_recurring_window(
            half_past_two,
            &days,
            chrono_tz::America::New_York,
            grace(),
            now,
        );
        assert!(window.is_none());
    }

    #[test]
    fn test_dst_ambiguity_uses_earlier_occurrence() {
        // US DST ended 2025-11-02: 01:00-02:00 local happened twice.
        let days: WeekdaySet = [Weekday::Sun].into_iter().collect();
        let half_past_one = NaiveTime::from_hms_opt(1, 30, 0).unwrap();
        // 05:35 UTC is 01:35 EDT, five minutes into the first 01:30.
        let now = Utc.with_ymd_and_hms(2025, 11, 2, 5, 35, 0).unwrap();

        let window = current_recurring_window(
            half_past_one,
            &days,
            chrono_tz::America::New_York,
            grace(),
            now,
        )
        .unwrap();
        // Earlier occurrence: 01:30 EDT == 05:30 UTC.
        assert_eq!(window.start, Utc.with_ymd_and_hms(2025, 11, 2, 5, 30, 0).unwrap());
    }
}
