//! Region/period statistics over the active subset.
//!
//! Only users with at least one record in a period contribute to it. A
//! missing user-day is never filled with a zero: the data cannot tell an idle
//! day from an unobserved one.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{Datelike, NaiveDate, Weekday};

use crate::models::{BanVariant, CommitRecord, DailyTrend, Period, Region, RegionPeriodStat, WeekdayProfile};
use crate::period::{classify_records, BanCalendar, ClassifiedRecord};
use crate::significance::Moments;

/// Mean/variance of `commit_count` for one region and period.
pub fn region_period_stat(
    classified: &[ClassifiedRecord<'_>],
    region: Region,
    period: Period,
    days_in_period: i64,
) -> RegionPeriodStat {
    let mut users = BTreeSet::new();
    let counts: Vec<f64> = classified
        .iter()
        .filter(|c| c.record.region == region && c.period == period)
        .map(|c| {
            users.insert(c.record.user_id.as_str());
            c.record.commit_count as f64
        })
        .collect();

    let moments = Moments::of(&counts);
    let sample_count = users.len();
    let possible_user_days = sample_count * usize::try_from(days_in_period).unwrap_or(0);
    let activity_rate = if possible_user_days == 0 {
        0.0
    } else {
        counts.len() as f64 / possible_user_days as f64
    };

    RegionPeriodStat {
        region,
        period,
        mean_commits: moments.mean,
        variance: moments.variance,
        sample_count,
        record_count: counts.len(),
        possible_user_days,
        activity_rate,
    }
}

/// Cell statistics for one period over one or more regions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupStat {
    pub mean_commits: f64,
    pub variance: f64,
    pub sample_count: usize,
    pub record_count: usize,
    pub possible_user_days: usize,
    pub activity_rate: f64,
}

impl From<&RegionPeriodStat> for GroupStat {
    fn from(stat: &RegionPeriodStat) -> Self {
        Self {
            mean_commits: stat.mean_commits,
            variance: stat.variance,
            sample_count: stat.sample_count,
            record_count: stat.record_count,
            possible_user_days: stat.possible_user_days,
            activity_rate: stat.activity_rate,
        }
    }
}

impl GroupStat {
    /// Combine disjoint cells as if their records were one sample.
    pub fn pool(stats: &[&RegionPeriodStat]) -> Self {
        if let [stat] = stats {
            return Self::from(*stat);
        }

        let record_count: usize = stats.iter().map(|s| s.record_count).sum();
        let sample_count: usize = stats.iter().map(|s| s.sample_count).sum();
        let possible_user_days: usize = stats.iter().map(|s| s.possible_user_days).sum();
        if record_count == 0 {
            return Self {
                mean_commits: 0.0,
                variance: 0.0,
                sample_count,
                record_count,
                possible_user_days,
                activity_rate: 0.0,
            };
        }

        let mean_commits = stats
            .iter()
            .map(|s| s.mean_commits * s.record_count as f64)
            .sum::<f64>()
            / record_count as f64;
        let m2: f64 = stats
            .iter()
            .filter(|s| s.record_count > 0)
            .map(|s| {
                let n = s.record_count as f64;
                s.variance * (n - 1.0) + n * (s.mean_commits - mean_commits).powi(2)
            })
            .sum();

        Self {
            mean_commits,
            variance: if record_count > 1 { m2 / (record_count - 1) as f64 } else { 0.0 },
            sample_count,
            record_count,
            possible_user_days,
            activity_rate: if possible_user_days == 0 {
                0.0
            } else {
                record_count as f64 / possible_user_days as f64
            },
        }
    }
}

/// Every (region, period) cell for one ban variant. Regions without records
/// still get cells, with a `sample_count` of zero.
#[derive(Debug, Clone)]
pub struct PeriodTable {
    pub variant: BanVariant,
    pub adaptation_window_records: usize,
    cells: BTreeMap<(Region, Period), RegionPeriodStat>,
    user_means: BTreeMap<(Region, Period), BTreeMap<String, f64>>,
}

impl PeriodTable {
    pub fn build(records: &[CommitRecord], calendar: &BanCalendar, variant: BanVariant) -> Self {
        let classified = classify_records(calendar, records, variant);
        let mut cells = BTreeMap::new();
        let mut user_means = BTreeMap::new();

        for region in Region::ALL {
            for period in Period::ALL {
                let stat = region_period_stat(
                    &classified.records,
                    region,
                    period,
                    calendar.days_in(period, variant),
                );
                log::debug!(
                    "{variant} {region}/{period}: mean {:.3} var {:.3} over {} users ({} user-days)",
                    stat.mean_commits,
                    stat.variance,
                    stat.sample_count,
                    stat.record_count
                );
                cells.insert((region, period), stat);
                user_means.insert(
                    (region, period),
                    user_period_means(&classified.records, region, period),
                );
            }
        }

        Self {
            variant,
            adaptation_window_records: classified.adaptation_window,
            cells,
            user_means,
        }
    }

    pub fn get(&self, region: Region, period: Period) -> Option<&RegionPeriodStat> {
        self.cells.get(&(region, period))
    }

    pub fn stats(&self) -> impl Iterator<Item = &RegionPeriodStat> {
        self.cells.values()
    }

    /// `period` cell pooled over `regions`.
    pub fn group_stat(&self, regions: &[Region], period: Period) -> GroupStat {
        let stats: Vec<&RegionPeriodStat> = regions
            .iter()
            .filter_map(|region| self.get(*region, period))
            .collect();
        GroupStat::pool(&stats)
    }

    pub fn user_means(&self, region: Region, period: Period) -> Option<&BTreeMap<String, f64>> {
        self.user_means.get(&(region, period))
    }

    /// Per-user change `mean(to) - mean(from)` for users active in both periods.
    pub fn user_changes(&self, region: Region, from: Period, to: Period) -> Vec<f64> {
        let (Some(before), Some(after)) = (self.user_means(region, from), self.user_means(region, to)) else {
            return Vec::new();
        };
        before
            .iter()
            .filter_map(|(user, b)| after.get(user).map(|a| a - b))
            .collect()
    }
}

/// Average daily commits per active user-day, per user.
pub fn user_period_means(
    classified: &[ClassifiedRecord<'_>],
    region: Region,
    period: Period,
) -> BTreeMap<String, f64> {
    let mut totals: BTreeMap<&str, (u64, usize)> = BTreeMap::new();
    for c in classified
        .iter()
        .filter(|c| c.record.region == region && c.period == period)
    {
        let entry = totals.entry(c.record.user_id.as_str()).or_insert((0, 0));
        entry.0 = entry.0.saturating_add(c.record.commit_count);
        entry.1 += 1;
    }

    totals
        .into_iter()
        .map(|(user, (sum, days))| (user.to_string(), sum as f64 / days as f64))
        .collect()
}

/// One row per region and date with activity, for plotting trend lines.
pub fn daily_trends(records: &[CommitRecord]) -> Vec<DailyTrend> {
    let mut days: BTreeMap<(Region, NaiveDate), (usize, u64)> = BTreeMap::new();
    for record in records {
        let entry = days.entry((record.region, record.date)).or_insert((0, 0));
        entry.0 += 1;
        entry.1 = entry.1.saturating_add(record.commit_count);
    }

    days.into_iter()
        .map(|((region, date), (active_users, total_commits))| DailyTrend {
            region,
            date,
            active_users,
            total_commits,
            mean_commits: total_commits as f64 / active_users as f64,
        })
        .collect()
}

pub fn weekday_profiles(records: &[CommitRecord]) -> Vec<WeekdayProfile> {
    let mut buckets: HashMap<(Region, u32), (u64, usize)> = HashMap::new();
    for record in records {
        let key = (record.region, record.date.weekday().num_days_from_monday());
        let entry = buckets.entry(key).or_insert((0, 0));
        entry.0 = entry.0.saturating_add(record.commit_count);
        entry.1 += 1;
    }

    let weekdays = [
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
        Weekday::Sun,
    ];

    let mut profiles = Vec::new();
    for region in Region::ALL {
        for weekday in weekdays {
            let Some((total, count)) = buckets.get(&(region, weekday.num_days_from_monday())) else {
                continue;
            };
            profiles.push(WeekdayProfile {
                region,
                weekday: weekday.to_string(),
                mean_commits: *total as f64 / *count as f64,
                record_count: *count,
            });
        }
    }
    profiles
}
