//! Business-hour arithmetic and the process clock.
//!
//! All timestamps in this crate are naive wall-clock values in the business
//! timezone. `SystemClock` is the only place that talks to UTC; everything
//! downstream works with `NaiveDateTime`.

use std::collections::BTreeSet;

use chrono::{Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, Timelike, Utc};

use crate::error::{AppError, AppResult};

/// Source of "now" in business wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Real clock: UTC converted to the configured fixed offset.
pub struct SystemClock {
    offset: FixedOffset,
}

impl SystemClock {
    pub fn new(offset_hours: i32) -> AppResult<Self> {
        let offset = FixedOffset::east_opt(offset_hours * 3600).ok_or_else(|| {
            AppError::BusinessLogic(format!("invalid timezone offset: {}h", offset_hours))
        })?;
        Ok(Self { offset })
    }
}

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Utc::now().with_timezone(&self.offset).naive_local()
    }
}

/// Test clock returning a programmed instant.
#[cfg(test)]
pub struct FixedClock(std::sync::Mutex<NaiveDateTime>);

#[cfg(test)]
impl FixedClock {
    pub fn new(at: NaiveDateTime) -> Self {
        Self(std::sync::Mutex::new(at))
    }

    pub fn set(&self, at: NaiveDateTime) {
        *self.0.lock().unwrap() = at;
    }

    pub fn advance_hours(&self, hours: f64) {
        let mut guard = self.0.lock().unwrap();
        *guard += Duration::seconds((hours * 3600.0).round() as i64);
    }
}

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        *self.0.lock().unwrap()
    }
}

/// Work calendar: which weekdays and which hours count as business time.
///
/// Weekdays are numbered 1..=7 with 1 = Monday. A moment is inside business
/// hours iff its weekday is a work day and `work_start_hour <= hour <
/// work_end_hour`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusinessCalendar {
    work_start_hour: u32,
    work_end_hour: u32,
    work_days: BTreeSet<u32>,
}

impl Default for BusinessCalendar {
    fn default() -> Self {
        Self {
            work_start_hour: 9,
            work_end_hour: 19,
            work_days: (1..=5).collect(),
        }
    }
}

impl BusinessCalendar {
    pub fn new(
        work_start_hour: u32,
        work_end_hour: u32,
        work_days: impl IntoIterator<Item = u32>,
    ) -> AppResult<Self> {
        let work_days: BTreeSet<u32> = work_days.into_iter().collect();
        if work_start_hour >= work_end_hour || work_end_hour > 23 {
            return Err(AppError::BusinessLogic(format!(
                "invalid work hours: {}..{}",
                work_start_hour, work_end_hour
            )));
        }
        if work_days.is_empty() || work_days.iter().any(|d| !(1..=7).contains(d)) {
            return Err(AppError::BusinessLogic(format!(
                "invalid work days: {:?}",
                work_days
            )));
        }
        Ok(Self {
            work_start_hour,
            work_end_hour,
            work_days,
        })
    }

    pub fn is_business_day(&self, t: NaiveDateTime) -> bool {
        self.work_days.contains(&t.weekday().number_from_monday())
    }

    pub fn is_business_hours(&self, t: NaiveDateTime) -> bool {
        self.is_business_day(t)
            && (self.work_start_hour..self.work_end_hour).contains(&t.hour())
    }

    fn day_start(&self, date: NaiveDate) -> NaiveDateTime {
        date.and_hms_opt(self.work_start_hour, 0, 0)
            .expect("work_start_hour validated at construction")
    }

    fn day_end(&self, date: NaiveDate) -> NaiveDateTime {
        date.and_hms_opt(self.work_end_hour, 0, 0)
            .expect("work_end_hour validated at construction")
    }

    /// Earliest moment >= `t` that is inside business hours; `t` itself when
    /// it already is.
    pub fn next_business_start(&self, t: NaiveDateTime) -> NaiveDateTime {
        if self.is_business_hours(t) {
            return t;
        }
        if self.is_business_day(t) && t.hour() < self.work_start_hour {
            return self.day_start(t.date());
        }
        let mut date = t.date() + Duration::days(1);
        while !self
            .work_days
            .contains(&date.weekday().number_from_monday())
        {
            date += Duration::days(1);
        }
        self.day_start(date)
    }

    /// Integral of the business-hours indicator over `[start, end)`, in
    /// hours. Returns 0 for `start >= end`.
    pub fn elapsed_business_hours(&self, start: NaiveDateTime, end: NaiveDateTime) -> f64 {
        if start >= end {
            return 0.0;
        }

        let mut total = 0.0;
        let mut cur = start;

        while cur < end {
            if !self.is_business_hours(cur) {
                cur = self.next_business_start(cur);
                if cur >= end {
                    break;
                }
            }

            let work_end_today = self.day_end(cur.date());
            let segment_end = end.min(work_end_today);
            if segment_end > cur {
                total += (segment_end - cur).num_seconds() as f64 / 3600.0;
            }

            cur = self.next_business_start(work_end_today);
        }

        total
    }

    /// Project a deadline: the moment `hours` of business time after
    /// `start`. Used by the dashboard to show when an SLA threshold lands.
    pub fn add_business_hours(&self, start: NaiveDateTime, hours: f64) -> NaiveDateTime {
        if hours <= 0.0 {
            return start;
        }

        let mut cur = start;
        let mut remaining = hours;

        loop {
            if !self.is_business_hours(cur) {
                cur = self.next_business_start(cur);
            }

            let work_end_today = self.day_end(cur.date());
            let available = (work_end_today - cur).num_seconds() as f64 / 3600.0;

            if remaining <= available {
                return cur + Duration::seconds((remaining * 3600.0).round() as i64);
            }

            remaining -= available;
            cur = self.next_business_start(work_end_today);
        }
    }
}
