//! Region commit files into `CommitRecord`s.
//!
//! Two layouts are accepted, detected from the header:
//! - daily: `user_id` (or `username`), `date`, `commit_count`, optional `region`
//! - events: `username` (or `user_id`), `event_timestamp`, optional `region`,
//!   one row per commit, folded into per-user-day counts on the UTC day
//!
//! Rows that fail validation are counted by reason in the `LoadSummary`.

use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;

use crate::cohort;
use crate::config::StudyConfig;
use crate::error::{AnalysisError, AnalysisResult};
use crate::models::{CommitRecord, ExclusionReason, LoadSummary, Region};

/// One input row. Which fields are required depends on the `Layout`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CommitRow {
    user_id: Option<String>,
    username: Option<String>,
    date: Option<String>,
    commit_count: Option<String>,
    event_timestamp: Option<String>,
    region: Option<String>,
    country: Option<String>,
}

impl CommitRow {
    fn user(&self) -> &str {
        self.user_id
            .as_deref()
            .or(self.username.as_deref())
            .map(|u| u.trim_matches('"'))
            .unwrap_or("")
    }

    fn region(&self) -> Option<&str> {
        self.region.as_deref().or(self.country.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Daily,
    Events,
}

impl Layout {
    fn detect(headers: &csv::StringRecord, source_name: &str) -> AnalysisResult<Self> {
        let has = |names: &[&str]| headers.iter().any(|h| names.contains(&h));
        let user = has(&["user_id", "username"]);
        let date = has(&["date"]);
        let count = has(&["commit_count"]);
        let timestamp = has(&["event_timestamp"]);

        let missing = |columns: &[(&str, bool)]| -> AnalysisError {
            let names: Vec<&str> = columns
                .iter()
                .filter(|(_, present)| !present)
                .map(|(name, _)| *name)
                .collect();
            AnalysisError::DataFormat {
                source_name: source_name.to_string(),
                reason: format!("missing required column(s): {}", names.join(", ")),
            }
        };

        if date || count {
            if user && date && count {
                Ok(Self::Daily)
            } else {
                Err(missing(&[("user_id", user), ("date", date), ("commit_count", count)]))
            }
        } else if timestamp {
            if user {
                Ok(Self::Events)
            } else {
                Err(missing(&[("username", user)]))
            }
        } else {
            Err(missing(&[("user_id", user), ("date", date), ("commit_count", count)]))
        }
    }
}

/// One region's accepted records plus the bookkeeping of what was dropped.
#[derive(Debug, Clone)]
pub struct RegionData {
    pub region: Region,
    pub records: Vec<CommitRecord>,
    pub summary: LoadSummary,
}

/// All regions that loaded, and the reason for each region that did not.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub records: Vec<CommitRecord>,
    pub summaries: BTreeMap<Region, LoadSummary>,
    pub failures: BTreeMap<Region, String>,
}

impl Dataset {
    pub fn from_regions(regions: Vec<RegionData>) -> Self {
        let mut dataset = Dataset::default();
        for data in regions {
            dataset.push(data);
        }
        dataset
    }

    pub fn push(&mut self, data: RegionData) {
        self.records.extend(data.records);
        self.summaries.insert(data.region, data.summary);
    }
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let value = raw.trim().trim_matches('"');
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_timestamp(value).map(|ts| ts.date_naive()))
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let value = raw.trim().trim_matches('"');
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(ts.with_timezone(&Utc));
    }

    let naive = value.strip_suffix(" UTC").unwrap_or(value);
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(naive, format).ok())
        .map(|ts| ts.and_utc())
}

fn parse_count(raw: &str) -> Option<u64> {
    let value = raw.trim();
    if let Ok(count) = value.parse::<u64>() {
        return Some(count);
    }
    // Counts that went through a float column, e.g. "3.0".
    let float: f64 = value.parse().ok()?;
    if float.is_finite() && float >= 0.0 && float.fract() == 0.0 && float <= u64::MAX as f64 {
        Some(float as u64)
    } else {
        None
    }
}

pub fn load_region_reader<R: Read>(
    reader: R,
    region: Region,
    source_name: &str,
    config: &StudyConfig,
) -> AnalysisResult<RegionData> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let layout = Layout::detect(reader.headers()?, source_name)?;

    let mut summary = LoadSummary::default();
    let mut counts: BTreeMap<(String, NaiveDate), u64> = BTreeMap::new();
    let mut users_in_order: Vec<String> = Vec::new();
    let mut seen_users: HashSet<String> = HashSet::new();

    for result in reader.deserialize::<CommitRow>() {
        summary.rows_read += 1;
        let row = match result {
            Ok(row) => row,
            Err(err) if err.is_io_error() => return Err(err.into()),
            Err(err) => {
                log::debug!("{source_name}: malformed row: {err}");
                summary.exclude(ExclusionReason::MalformedRow);
                continue;
            }
        };

        if let Some(value) = row.region() {
            if !value.is_empty() && value.parse::<Region>().ok() != Some(region) {
                summary.exclude(ExclusionReason::RegionMismatch);
                continue;
            }
        }

        let (date, count) = match layout {
            Layout::Daily => {
                let Some(date) = row.date.as_deref().and_then(parse_date) else {
                    summary.exclude(ExclusionReason::InvalidDate);
                    continue;
                };
                let Some(count) = row.commit_count.as_deref().and_then(parse_count) else {
                    summary.exclude(ExclusionReason::InvalidCount);
                    continue;
                };
                (date, count)
            }
            Layout::Events => {
                let Some(ts) = row.event_timestamp.as_deref().and_then(parse_timestamp) else {
                    summary.exclude(ExclusionReason::InvalidDate);
                    continue;
                };
                (ts.date_naive(), 1)
            }
        };

        let user = row.user();
        if user.is_empty() {
            summary.exclude(ExclusionReason::EmptyUser);
            continue;
        }
        if !config.contains(date) {
            summary.exclude(ExclusionReason::OutOfWindow);
            continue;
        }
        if count == 0 {
            summary.exclude(ExclusionReason::ZeroCount);
            continue;
        }

        if seen_users.insert(user.to_string()) {
            users_in_order.push(user.to_string());
        }
        let entry = counts.entry((user.to_string(), date)).or_insert(0);
        *entry = entry.saturating_add(count);
    }

    if users_in_order.len() > config.sample_cap {
        let kept: HashSet<String> =
            cohort::sample_users(&users_in_order, config.sample_cap, config.seed)
                .into_iter()
                .collect();
        summary.users_dropped_by_cap = users_in_order.len() - kept.len();
        log::warn!(
            "{region}: {} users exceed the cap of {}; keeping a seeded sample and dropping {}",
            users_in_order.len(),
            config.sample_cap,
            summary.users_dropped_by_cap
        );
        counts.retain(|(user, _), _| kept.contains(user));
        summary.users = kept.len();
    } else {
        summary.users = users_in_order.len();
    }

    let records: Vec<CommitRecord> = counts
        .into_iter()
        .map(|((user_id, date), commit_count)| CommitRecord {
            user_id,
            region,
            date,
            commit_count,
        })
        .collect();
    summary.records = records.len();

    if summary.excluded_total() > 0 {
        log::warn!(
            "{region}: excluded {} of {} rows from {source_name}",
            summary.excluded_total(),
            summary.rows_read
        );
        for (reason, count) in &summary.excluded {
            log::debug!("{region}:   {}: {count}", reason.label());
        }
    }
    log::info!(
        "{region}: loaded {} user-day records for {} users",
        summary.records,
        summary.users
    );

    Ok(RegionData {
        region,
        records,
        summary,
    })
}

pub fn load_region_file(path: &Path, region: Region, config: &StudyConfig) -> AnalysisResult<RegionData> {
    let file = std::fs::File::open(path)?;
    load_region_reader(file, region, &path.display().to_string(), config)
}

/// Load every region. A region whose file cannot be read or lacks a required
/// column is recorded as a failure; the others still load.
pub fn load_dataset(sources: &[(Region, PathBuf)], config: &StudyConfig) -> Dataset {
    let mut loaded = Vec::new();
    let mut failures = BTreeMap::new();

    for (region, path) in sources {
        match load_region_file(path, *region, config) {
            Ok(data) => loaded.push(data),
            Err(err) => {
                log::error!("{region}: failed to load {}: {err}", path.display());
                failures.insert(*region, err.to_string());
            }
        }
    }

    Dataset {
        failures,
        ..Dataset::from_regions(loaded)
    }
}
