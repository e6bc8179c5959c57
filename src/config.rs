use std::path::Path;

use anyhow::Context;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, AnalysisResult};
use crate::models::Region;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap_or_default()
}

fn default_window_start() -> NaiveDate {
    date(2023, 1, 26)
}

fn default_window_end() -> NaiveDate {
    date(2023, 5, 26)
}

fn default_ban_start() -> NaiveDate {
    date(2023, 4, 1)
}

fn default_ban_end() -> NaiveDate {
    date(2023, 4, 28)
}

fn default_sample_cap() -> usize {
    1000
}

fn default_seed() -> u64 {
    42
}

fn default_treatment() -> Region {
    Region::Italy
}

fn default_controls() -> Vec<Region> {
    vec![Region::Austria, Region::France]
}

fn default_pool_controls() -> bool {
    true
}

fn default_confidence_level() -> f64 {
    0.95
}

/// Study parameters. Every field has a default, so a config file only needs
/// the values it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyConfig {
    #[serde(default = "default_window_start")]
    pub window_start: NaiveDate,
    #[serde(default = "default_window_end")]
    pub window_end: NaiveDate,
    #[serde(default = "default_ban_start")]
    pub ban_start: NaiveDate,
    #[serde(default = "default_ban_end")]
    pub ban_end: NaiveDate,
    #[serde(default = "default_sample_cap")]
    pub sample_cap: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_treatment")]
    pub treatment: Region,
    #[serde(default = "default_controls")]
    pub controls: Vec<Region>,
    /// Also estimate against all controls pooled into one group.
    #[serde(default = "default_pool_controls")]
    pub pool_controls: bool,
    #[serde(default = "default_confidence_level")]
    pub confidence_level: f64,
}

impl Default for StudyConfig {
    fn default() -> Self {
        Self {
            window_start: default_window_start(),
            window_end: default_window_end(),
            ban_start: default_ban_start(),
            ban_end: default_ban_end(),
            sample_cap: default_sample_cap(),
            seed: default_seed(),
            treatment: default_treatment(),
            controls: default_controls(),
            pool_controls: default_pool_controls(),
            confidence_level: default_confidence_level(),
        }
    }
}

impl StudyConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read config {}", path.display()))?;
        let config = Self::from_json(&content)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn from_json(content: &str) -> AnalysisResult<Self> {
        let config: StudyConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AnalysisResult<()> {
        if self.window_start > self.window_end {
            return Err(AnalysisError::InvalidConfig(format!(
                "analysis window starts {} after it ends {}",
                self.window_start, self.window_end
            )));
        }
        if self.ban_start > self.ban_end {
            return Err(AnalysisError::InvalidConfig(format!(
                "ban starts {} after it ends {}",
                self.ban_start, self.ban_end
            )));
        }
        if self.ban_start <= self.window_start || self.ban_end >= self.window_end {
            return Err(AnalysisError::InvalidConfig(
                "ban must lie strictly inside the analysis window".to_string(),
            ));
        }
        if self.sample_cap == 0 {
            return Err(AnalysisError::InvalidConfig(
                "sample_cap must be positive".to_string(),
            ));
        }
        if self.controls.is_empty() {
            return Err(AnalysisError::InvalidConfig(
                "at least one control region is required".to_string(),
            ));
        }
        let mut distinct = self.controls.clone();
        distinct.sort();
        distinct.dedup();
        if distinct.len() != self.controls.len() {
            return Err(AnalysisError::InvalidConfig(
                "control regions must be distinct".to_string(),
            ));
        }
        if self.controls.contains(&self.treatment) {
            return Err(AnalysisError::InvalidConfig(format!(
                "{} cannot be both treatment and control",
                self.treatment
            )));
        }
        if !(self.confidence_level > 0.0 && self.confidence_level < 1.0) {
            return Err(AnalysisError::InvalidConfig(format!(
                "confidence_level {} must be in (0, 1)",
                self.confidence_level
            )));
        }
        Ok(())
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.window_start && date <= self.window_end
    }
}
