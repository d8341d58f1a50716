//! Alerting window policy.
//!
//! Windows are wall-clock ranges in the site's zone. Poll times are
//! converted into that zone first, so DST shifts move the UTC edges.

use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Timelike, Weekday};
use chrono_tz::Tz;

use crate::config::{ActiveWindows, DAY_NAMES};
use crate::error::{MonitorError, Result};

/// Per-weekday inclusive minute ranges in a fixed zone.
#[derive(Debug, Clone)]
pub struct WindowPolicy {
    tz: Tz,
    /// Monday = 0 .. Sunday = 6.
    days: [Option<(NaiveTime, NaiveTime)>; 7],
}

impl WindowPolicy {
    pub fn new(windows: &ActiveWindows, tz: Tz) -> Result<Self> {
        let mut days = [None; 7];
        for (i, window) in windows.by_weekday().into_iter().enumerate() {
            if let Some(window) = window {
                let range = window.parse().map_err(|e| {
                    MonitorError::Config(format!("active_windows.{}: {e:#}", DAY_NAMES[i]))
                })?;
                days[i] = Some(range);
            }
        }
        Ok(Self { tz, days })
    }

    #[must_use]
    pub const fn timezone(&self) -> Tz {
        self.tz
    }

    /// Whether `now` falls inside the window for its local weekday.
    ///
    /// Both ends are inclusive at minute granularity: with an end of 21:00,
    /// 21:00:59 is active and 21:01 is not.
    #[must_use]
    pub fn is_active<Z: TimeZone>(&self, now: &DateTime<Z>) -> bool {
        let local = now.with_timezone(&self.tz);
        self.is_active_at(local.weekday(), local.time())
    }

    /// Check a local weekday and wall-clock time directly.
    #[must_use]
    pub fn is_active_at(&self, weekday: Weekday, time: NaiveTime) -> bool {
        let Some((start, end)) = self.days[weekday.num_days_from_monday() as usize] else {
            return false;
        };
        let minute = NaiveTime::from_hms_opt(time.hour(), time.minute(), 0).unwrap_or(time);
        start <= minute && minute <= end
    }

    /// Human-readable summary, e.g. `Mon 18:00-23:59, ..., Sun 00:00-21:00`.
    #[must_use]
    pub fn describe(&self) -> String {
        const SHORT: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
        SHORT
            .iter()
            .zip(self.days.iter())
            .map(|(day, range)| match range {
                Some((s, e)) => format!("{day} {}-{}", s.format("%H:%M"), e.format("%H:%M")),
                None => format!("{day} off"),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}
