//! Period bucketing around the ban.
//!
//! `pre` is everything before the ban starts and `post` everything after the
//! full ban ends, whatever the variant. For the short variants the days
//! between the variant's end and the full ban end are the adaptation window:
//! they are neither cleanly "during" nor "post" and are reported as an
//! exclusion instead of a period.

use chrono::{Duration, NaiveDate};

use crate::config::StudyConfig;
use crate::models::{BanVariant, CommitRecord, Period};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    In(Period),
    AdaptationWindow,
    OutsideWindow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BanCalendar {
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub ban_start: NaiveDate,
    pub ban_end: NaiveDate,
}

impl BanCalendar {
    pub fn from_config(config: &StudyConfig) -> Self {
        Self {
            window_start: config.window_start,
            window_end: config.window_end,
            ban_start: config.ban_start,
            ban_end: config.ban_end,
        }
    }

    /// Last day (inclusive) of the during window for `variant`.
    pub fn during_end(&self, variant: BanVariant) -> NaiveDate {
        match variant.window_days() {
            Some(days) => (self.ban_start + Duration::days(days - 1)).min(self.ban_end),
            None => self.ban_end,
        }
    }

    pub fn classify(&self, date: NaiveDate, variant: BanVariant) -> Classification {
        if date < self.window_start || date > self.window_end {
            Classification::OutsideWindow
        } else if date < self.ban_start {
            Classification::In(Period::Pre)
        } else if date <= self.during_end(variant) {
            Classification::In(Period::During)
        } else if date <= self.ban_end {
            Classification::AdaptationWindow
        } else {
            Classification::In(Period::Post)
        }
    }

    /// Inclusive date bounds of `period` under `variant`.
    pub fn bounds(&self, period: Period, variant: BanVariant) -> (NaiveDate, NaiveDate) {
        match period {
            Period::Pre => (self.window_start, self.ban_start - Duration::days(1)),
            Period::During => (self.ban_start, self.during_end(variant)),
            Period::Post => (self.ban_end + Duration::days(1), self.window_end),
        }
    }

    pub fn days_in(&self, period: Period, variant: BanVariant) -> i64 {
        let (start, end) = self.bounds(period, variant);
        (end - start).num_days() + 1
    }
}

impl Default for BanCalendar {
    fn default() -> Self {
        Self::from_config(&StudyConfig::default())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClassifiedRecord<'a> {
    pub record: &'a CommitRecord,
    pub period: Period,
}

#[derive(Debug, Clone, Default)]
pub struct Classified<'a> {
    pub records: Vec<ClassifiedRecord<'a>>,
    pub adaptation_window: usize,
    pub outside_window: usize,
}

pub fn classify_records<'a>(
    calendar: &BanCalendar,
    records: &'a [CommitRecord],
    variant: BanVariant,
) -> Classified<'a> {
    let mut classified = Classified::default();

    for record in records {
        match calendar.classify(record.date, variant) {
            Classification::In(period) => classified.records.push(ClassifiedRecord { record, period }),
            Classification::AdaptationWindow => classified.adaptation_window += 1,
            Classification::OutsideWindow => classified.outside_window += 1,
        }
    }

    if classified.adaptation_window > 0 {
        log::debug!(
            "{variant}: {} records fall in the adaptation window ({} .. {}) and are excluded",
            classified.adaptation_window,
            calendar.during_end(variant) + Duration::days(1),
            calendar.ban_end
        );
    }
    if classified.outside_window > 0 {
        log::warn!(
            "{variant}: {} records outside the analysis window were not classified",
            classified.outside_window
        );
    }

    classified
}
