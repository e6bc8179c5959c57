use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    Italy,
    Austria,
    France,
}

impl Region {
    pub const ALL: [Region; 3] = [Region::Italy, Region::Austria, Region::France];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Italy => "Italy",
            Self::Austria => "Austria",
            Self::France => "France",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Region {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "italy" | "it" => Ok(Self::Italy),
            "austria" | "at" => Ok(Self::Austria),
            "france" | "fr" => Ok(Self::France),
            other => Err(format!("unknown region '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Pre,
    During,
    Post,
}

impl Period {
    pub const ALL: [Period; 3] = [Period::Pre, Period::During, Period::Post];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Pre => "pre",
            Self::During => "during",
            Self::Post => "post",
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Alternative definitions of how long the "during ban" window lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BanVariant {
    #[serde(rename = "3-day")]
    ThreeDay,
    #[serde(rename = "7-day")]
    SevenDay,
    #[serde(rename = "full")]
    Full,
}

impl BanVariant {
    pub const ALL: [BanVariant; 3] = [BanVariant::ThreeDay, BanVariant::SevenDay, BanVariant::Full];

    pub fn label(&self) -> &'static str {
        match self {
            Self::ThreeDay => "3-day",
            Self::SevenDay => "7-day",
            Self::Full => "full",
        }
    }

    /// Length of the during window counted from the ban start, or `None`
    /// when it runs to the configured ban end.
    pub fn window_days(&self) -> Option<i64> {
        match self {
            Self::ThreeDay => Some(3),
            Self::SevenDay => Some(7),
            Self::Full => None,
        }
    }
}

impl fmt::Display for BanVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for BanVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "3-day" | "3" | "three-day" => Ok(Self::ThreeDay),
            "7-day" | "7" | "seven-day" => Ok(Self::SevenDay),
            "full" => Ok(Self::Full),
            other => Err(format!("unknown ban variant '{other}' (expected 3-day, 7-day or full)")),
        }
    }
}

/// The comparison group of one estimate: a single control region, or the
/// configured controls pooled into one group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ControlGroup {
    Single(Region),
    Pooled(Vec<Region>),
}

impl ControlGroup {
    pub fn regions(&self) -> &[Region] {
        match self {
            Self::Single(region) => std::slice::from_ref(region),
            Self::Pooled(regions) => regions,
        }
    }
}

impl fmt::Display for ControlGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.regions().iter().map(Region::name).collect();
        f.write_str(&names.join("+"))
    }
}

impl Serialize for ControlGroup {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string().to_ascii_lowercase())
    }
}

/// Outcome differenced by an estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Mean commits per active user-day.
    CommitCount,
    /// Share of possible user-days with at least one commit.
    ActivityRate,
}

impl Metric {
    pub const ALL: [Metric; 2] = [Metric::CommitCount, Metric::ActivityRate];

    pub fn label(&self) -> &'static str {
        match self {
            Self::CommitCount => "commits",
            Self::ActivityRate => "activity",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub user_id: String,
    pub region: Region,
    pub date: NaiveDate,
    pub commit_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    MalformedRow,
    EmptyUser,
    InvalidDate,
    OutOfWindow,
    InvalidCount,
    ZeroCount,
    RegionMismatch,
}

impl ExclusionReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::MalformedRow => "malformed row",
            Self::EmptyUser => "empty user id",
            Self::InvalidDate => "unparseable date",
            Self::OutOfWindow => "outside analysis window",
            Self::InvalidCount => "invalid commit count",
            Self::ZeroCount => "zero commit count",
            Self::RegionMismatch => "region mismatch",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadSummary {
    pub rows_read: usize,
    pub records: usize,
    pub users: usize,
    pub users_dropped_by_cap: usize,
    pub excluded: BTreeMap<ExclusionReason, usize>,
}

impl LoadSummary {
    pub fn exclude(&mut self, reason: ExclusionReason) {
        *self.excluded.entry(reason).or_insert(0) += 1;
    }

    pub fn excluded_total(&self) -> usize {
        self.excluded.values().sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegionPeriodStat {
    pub region: Region,
    pub period: Period,
    pub mean_commits: f64,
    pub variance: f64,
    pub sample_count: usize,
    pub record_count: usize,
    /// Active users × calendar days in the period.
    pub possible_user_days: usize,
    pub activity_rate: f64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct WelchTest {
    pub statistic: f64,
    pub degrees_of_freedom: f64,
    pub p_value: f64,
    pub mean_difference: f64,
    pub standard_error: f64,
    pub ci_low: f64,
    pub ci_high: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiDEstimate {
    pub treatment: Region,
    pub control: ControlGroup,
    pub variant: BanVariant,
    pub metric: Metric,
    pub estimate: f64,
    pub standard_error: Option<f64>,
    pub p_value: Option<f64>,
    /// Inference for `estimate` from the four cells' sampling variances.
    /// `mean_difference` equals `estimate`.
    pub test: Option<WelchTest>,
    /// Welch test on per-user changes (during minus pre) of users active in
    /// both periods. A different quantity from `estimate`; commit counts only.
    pub user_change_test: Option<WelchTest>,
    pub treatment_users: usize,
    pub control_users: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyTrend {
    pub region: Region,
    pub date: NaiveDate,
    pub active_users: usize,
    pub total_commits: u64,
    pub mean_commits: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WeekdayProfile {
    pub region: Region,
    pub weekday: String,
    pub mean_commits: f64,
    pub record_count: usize,
}
