//! Reusable blocking presets and the schedule resolution that decides
//! which preset (if any) is active at a given instant.

use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LockError, Result};

/// A named, reusable blocking configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    pub id: Uuid,
    pub name: String,
    /// Application identifiers this preset blocks while active.
    pub blocked_apps: Vec<String>,
    pub schedule: Schedule,
}

/// When a preset activates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Never auto-activates; only the template applied on an explicit lock.
    Manual,
    /// One-shot fixed window, active in `[start, end)`.
    Window {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    /// Repeating day-of-week rule, evaluated against wall-clock time in
    /// the caller's local timezone. A window with `start > end` wraps past
    /// midnight into the next morning.
    Recurring {
        days: Vec<Weekday>,
        start: NaiveTime,
        end: NaiveTime,
    },
}

impl Preset {
    /// Create a preset with a fresh id, validating the schedule.
    pub fn new(name: impl Into<String>, blocked_apps: Vec<String>, schedule: Schedule) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(LockError::validation("preset name is empty"));
        }

        match &schedule {
            Schedule::Manual => {}
            Schedule::Window { start, end } => {
                if start >= end {
                    return Err(LockError::validation(format!(
                        "preset window must start before it ends ({start} >= {end})"
                    )));
                }
            }
            Schedule::Recurring { days, start, end } => {
                if days.is_empty() {
                    return Err(LockError::validation(
                        "recurring preset must name at least one day",
                    ));
                }
                if start == end {
                    return Err(LockError::validation(
                        "recurring preset window is empty",
                    ));
                }
            }
        }

        Ok(Self {
            id: Uuid::new_v4(),
            name,
            blocked_apps,
            schedule,
        })
    }

    pub fn is_manual(&self) -> bool {
        matches!(self.schedule, Schedule::Manual)
    }

    /// Whether this preset's schedule matches the given instant.
    ///
    /// Manual presets never match. Fixed windows compare UTC instants;
    /// recurring rules use the weekday and time-of-day of `now` in
    /// whatever timezone the caller evaluated it in.
    pub fn is_active_at<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> bool {
        match &self.schedule {
            Schedule::Manual => false,
            Schedule::Window { start, end } => {
                let now_utc = now.with_timezone(&Utc);
                *start <= now_utc && now_utc < *end
            }
            Schedule::Recurring { days, start, end } => {
                let weekday = now.weekday();
                let time = now.time();
                if start < end {
                    days.contains(&weekday) && *start <= time && time < *end
                } else {
                    // Wraps midnight: the evening half belongs to the named
                    // day, the morning half to the day after.
                    (days.contains(&weekday) && time >= *start)
                        || (days.contains(&weekday.pred()) && time < *end)
                }
            }
        }
    }
}

/// Reject a candidate whose one-shot window overlaps an existing one for
/// the same account. Runs at create/edit time; schedule resolution relies
/// on at most one window matching by construction.
pub fn check_window_overlap(existing: &[Preset], candidate: &Preset) -> Result<()> {
    let Schedule::Window { start, end } = &candidate.schedule else {
        return Ok(());
    };

    for other in existing {
        if other.id == candidate.id {
            continue;
        }
        if let Schedule::Window {
            start: other_start,
            end: other_end,
        } = &other.schedule
        {
            if start < other_end && other_start < end {
                return Err(LockError::conflict(format!(
                    "preset window overlaps existing preset '{}'",
                    other.name
                )));
            }
        }
    }
    Ok(())
}

/// Resolve which preset should be active at `now`.
///
/// Pure and deterministic; operates over an already-fetched preset list
/// and performs no I/O, so it is cheap enough for every poll tick.
/// Tie-break: a matching one-shot window outranks a matching recurring
/// rule (a time-boxed commitment beats a standing one).
pub fn resolve_active_preset<'a, Tz: TimeZone>(
    presets: &'a [Preset],
    now: &DateTime<Tz>,
) -> Option<&'a Preset> {
    let mut recurring_hit = None;

    for preset in presets {
        if !preset.is_active_at(now) {
            continue;
        }
        match preset.schedule {
            Schedule::Window { .. } => return Some(preset),
            Schedule::Recurring { .. } => {
                if recurring_hit.is_none() {
                    recurring_hit = Some(preset);
                }
            }
            Schedule::Manual => unreachable!("manual presets never match"),
        }
    }

    recurring_hit
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, FixedOffset};

    fn manual() -> Preset {
        Preset::new("homework", vec!["games".into()], Schedule::Manual).unwrap()
    }

    fn window(start: DateTime<Utc>, end: DateTime<Utc>) -> Preset {
        Preset::new("exam week", vec!["social".into()], Schedule::Window { start, end }).unwrap()
    }

    fn recurring(days: Vec<Weekday>, start: &str, end: &str) -> Preset {
        Preset::new(
            "bedtime",
            vec!["everything".into()],
            Schedule::Recurring {
                days,
                start: start.parse().unwrap(),
                end: end.parse().unwrap(),
            },
        )
        .unwrap()
    }

    #[test]
    fn manual_preset_never_auto_activates() {
        let now = Utc::now();
        assert!(!manual().is_active_at(&now));
        let presets = vec![manual()];
        assert!(resolve_active_preset(&presets, &now).is_none());
    }

    #[test]
    fn window_is_half_open() {
        let start = Utc::now();
        let end = start + Duration::seconds(3600);
        let p = window(start, end);

        assert!(p.is_active_at(&start));
        assert!(p.is_active_at(&(end - Duration::seconds(1))));
        assert!(!p.is_active_at(&end));
        assert!(!p.is_active_at(&(start - Duration::seconds(1))));
    }

    #[test]
    fn scheduled_window_outranks_recurring() {
        // A window covering `now` plus a recurring rule matching every day
        // all day: the window must win.
        let start = Utc::now();
        let now = start + Duration::seconds(10);
        let all_week = vec![
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ];

        let presets = vec![
            recurring(all_week, "00:00:00", "23:59:59"),
            window(start, start + Duration::seconds(3600)),
        ];

        let active = resolve_active_preset(&presets, &now).unwrap();
        assert!(matches!(active.schedule, Schedule::Window { .. }));
    }

    #[test]
    fn recurring_matches_day_and_time_window() {
        // 2026-08-24 was a Monday.
        let monday_evening = Utc.with_ymd_and_hms(2026, 8, 24, 20, 30, 0).unwrap();
        let monday_morning = Utc.with_ymd_and_hms(2026, 8, 24, 9, 0, 0).unwrap();
        let tuesday_evening = Utc.with_ymd_and_hms(2026, 8, 25, 20, 30, 0).unwrap();

        let p = recurring(vec![Weekday::Mon], "20:00:00", "22:00:00");

        assert!(p.is_active_at(&monday_evening));
        assert!(!p.is_active_at(&monday_morning));
        assert!(!p.is_active_at(&tuesday_evening));
    }

    #[test]
    fn recurring_uses_local_wall_clock() {
        // 21:00 UTC on Monday is 23:00 in UTC+2; a 22:30-23:30 rule only
        // matches when evaluated in the local zone.
        let utc_now = Utc.with_ymd_and_hms(2026, 8, 24, 21, 0, 0).unwrap();
        let local_now = utc_now.with_timezone(&FixedOffset::east_opt(2 * 3600).unwrap());

        let p = recurring(vec![Weekday::Mon], "22:30:00", "23:30:00");

        assert!(!p.is_active_at(&utc_now));
        assert!(p.is_active_at(&local_now));
    }

    #[test]
    fn recurring_window_wraps_midnight() {
        let p = recurring(vec![Weekday::Mon], "22:00:00", "06:00:00");

        let monday_night = Utc.with_ymd_and_hms(2026, 8, 24, 23, 0, 0).unwrap();
        let tuesday_early = Utc.with_ymd_and_hms(2026, 8, 25, 5, 0, 0).unwrap();
        let tuesday_late = Utc.with_ymd_and_hms(2026, 8, 25, 23, 0, 0).unwrap();
        let monday_noon = Utc.with_ymd_and_hms(2026, 8, 24, 12, 0, 0).unwrap();

        assert!(p.is_active_at(&monday_night));
        assert!(p.is_active_at(&tuesday_early));
        assert!(!p.is_active_at(&tuesday_late));
        assert!(!p.is_active_at(&monday_noon));
    }

    #[test]
    fn overlapping_windows_are_rejected() {
        let start = Utc::now();
        let existing = vec![window(start, start + Duration::seconds(3600))];

        let overlapping = window(start + Duration::seconds(1800), start + Duration::seconds(5400));
        assert!(check_window_overlap(&existing, &overlapping).is_err());

        let adjacent = window(start + Duration::seconds(3600), start + Duration::seconds(7200));
        assert!(check_window_overlap(&existing, &adjacent).is_ok());
    }

    #[test]
    fn overlap_check_ignores_self_on_edit() {
        let start = Utc::now();
        let p = window(start, start + Duration::seconds(3600));
        let existing = vec![p.clone()];
        assert!(check_window_overlap(&existing, &p).is_ok());
    }

    #[test]
    fn preset_validation() {
        let now = Utc::now();
        assert!(Preset::new("", vec![], Schedule::Manual).is_err());
        assert!(Preset::new(
            "backwards",
            vec![],
            Schedule::Window {
                start: now,
                end: now - Duration::seconds(1)
            }
        )
        .is_err());
        assert!(Preset::new(
            "no days",
            vec![],
            Schedule::Recurring {
                days: vec![],
                start: "08:00:00".parse().unwrap(),
                end: "09:00:00".parse().unwrap(),
            }
        )
        .is_err());
    }
}
