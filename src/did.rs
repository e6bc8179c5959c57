//! Difference-in-differences estimation.
//!
//! estimate = (T_during - T_pre) - (C_during - C_pre), with "during" taken
//! from the same ban variant for both groups. Two outcomes are differenced:
//! mean commits per active user-day and the activity rate. The estimate's
//! standard error combines the four cells' sampling variances; a Welch test
//! on per-user changes is reported beside it as a separate quantity.

use crate::aggregate::{GroupStat, PeriodTable};
use crate::config::StudyConfig;
use crate::error::{AnalysisError, AnalysisResult};
use crate::models::{BanVariant, CommitRecord, ControlGroup, DiDEstimate, Metric, Period, Region};
use crate::period::BanCalendar;
use crate::significance::{contrast_test, welch_t_test};

/// `period` cell of a group, failing if no user in it was active.
fn cell(table: &PeriodTable, regions: &[Region], period: Period) -> AnalysisResult<GroupStat> {
    let stat = table.group_stat(regions, period);
    if stat.sample_count > 0 {
        return Ok(stat);
    }
    match regions.first() {
        Some(&region) => Err(AnalysisError::InsufficientData {
            region,
            period,
            variant: table.variant,
        }),
        None => Err(AnalysisError::InvalidConfig("empty control group".to_string())),
    }
}

fn value(metric: Metric, stat: &GroupStat) -> f64 {
    match metric {
        Metric::CommitCount => stat.mean_commits,
        Metric::ActivityRate => stat.activity_rate,
    }
}

/// (variance, n) of the sample behind a cell value.
fn sampling(metric: Metric, stat: &GroupStat) -> (f64, usize) {
    match metric {
        Metric::CommitCount => (stat.variance, stat.record_count),
        Metric::ActivityRate => {
            let p = stat.activity_rate;
            (p * (1.0 - p), stat.possible_user_days)
        }
    }
}

/// Treatment pre, treatment during, control pre, control during.
fn did_cells(table: &PeriodTable, treatment: Region, control: &ControlGroup) -> AnalysisResult<[GroupStat; 4]> {
    let treatment = [treatment];
    Ok([
        cell(table, &treatment, Period::Pre)?,
        cell(table, &treatment, Period::During)?,
        cell(table, control.regions(), Period::Pre)?,
        cell(table, control.regions(), Period::During)?,
    ])
}

fn difference(metric: Metric, cells: &[GroupStat; 4]) -> f64 {
    let [t_pre, t_during, c_pre, c_during] = cells;
    (value(metric, t_during) - value(metric, t_pre)) - (value(metric, c_during) - value(metric, c_pre))
}

pub fn estimate(
    table: &PeriodTable,
    treatment: Region,
    control: &ControlGroup,
    metric: Metric,
    confidence_level: f64,
) -> AnalysisResult<DiDEstimate> {
    let cells = did_cells(table, treatment, control)?;
    let point = difference(metric, &cells);
    let test = contrast_test(point, &cells.map(|c| sampling(metric, &c)), confidence_level);
    if test.is_none() {
        log::warn!(
            "{} {metric} {treatment} vs {control}: no standard error (a cell has fewer than two observations or no variance)",
            table.variant
        );
    }

    let treatment_changes = table.user_changes(treatment, Period::Pre, Period::During);
    let control_changes: Vec<f64> = control
        .regions()
        .iter()
        .flat_map(|region| table.user_changes(*region, Period::Pre, Period::During))
        .collect();
    let user_change_test = match metric {
        Metric::CommitCount => welch_t_test(&treatment_changes, &control_changes, confidence_level),
        Metric::ActivityRate => None,
    };

    Ok(DiDEstimate {
        treatment,
        control: control.clone(),
        variant: table.variant,
        metric,
        estimate: point,
        standard_error: test.map(|t| t.standard_error),
        p_value: test.map(|t| t.p_value),
        test,
        user_change_test,
        treatment_users: treatment_changes.len(),
        control_users: control_changes.len(),
    })
}

/// Each configured control on its own, then all of them pooled when there
/// is more than one.
pub fn control_groups(config: &StudyConfig) -> Vec<ControlGroup> {
    let mut groups: Vec<ControlGroup> = config.controls.iter().copied().map(ControlGroup::Single).collect();
    if config.pool_controls && config.controls.len() > 1 {
        groups.push(ControlGroup::Pooled(config.controls.clone()));
    }
    groups
}

/// Outcome of one (control, variant, metric) cell of the run.
#[derive(Debug)]
pub struct EstimateOutcome {
    pub control: ControlGroup,
    pub variant: BanVariant,
    pub metric: Metric,
    pub result: AnalysisResult<DiDEstimate>,
}

/// Every control × variant × metric estimate. A failed estimate does not
/// stop the rest.
pub fn estimate_all(
    records: &[CommitRecord],
    config: &StudyConfig,
    variants: &[BanVariant],
) -> (Vec<PeriodTable>, Vec<EstimateOutcome>) {
    let calendar = BanCalendar::from_config(config);
    let groups = control_groups(config);
    let mut tables = Vec::new();
    let mut outcomes = Vec::new();

    for &variant in variants {
        let table = PeriodTable::build(records, &calendar, variant);
        for control in &groups {
            for metric in Metric::ALL {
                let result = estimate(&table, config.treatment, control, metric, config.confidence_level);
                match &result {
                    Ok(est) => log::info!(
                        "{variant} {metric} {} vs {control}: DiD {:+.4} (p = {})",
                        config.treatment,
                        est.estimate,
                        est.p_value
                            .map(|p| format!("{p:.4}"))
                            .unwrap_or_else(|| "n/a".to_string())
                    ),
                    Err(err) => log::warn!("{variant} {metric} {} vs {control}: {err}", config.treatment),
                }
                outcomes.push(EstimateOutcome {
                    control: control.clone(),
                    variant,
                    metric,
                    result,
                });
            }
        }
        tables.push(table);
    }

    (tables, outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Duration, NaiveDate};

    fn d(m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, m, day).unwrap()
    }

    /// Each user commits `f(user_index, date)` every day of the window.
    fn synthetic<F>(region: Region, users: usize, f: F) -> Vec<CommitRecord>
    where
        F: Fn(usize, NaiveDate) -> u64,
    {
        let mut records = Vec::new();
        for u in 0..users {
            let mut date = d(1, 26);
            while date <= d(5, 26) {
                let commit_count = f(u, date);
                if commit_count > 0 {
                    records.push(CommitRecord {
                        user_id: format!("{region}-{u}"),
                        region,
                        date,
                        commit_count,
                    });
                }
                date += Duration::days(1);
            }
        }
        records
    }

    fn flat(region: Region, level: u64) -> Vec<CommitRecord> {
        synthetic(region, 20, |u, _| level + (u % 3) as u64)
    }

    fn in_full_ban(date: NaiveDate) -> bool {
        date >= d(4, 1) && date <= d(4, 28)
    }

    fn single(region: Region) -> ControlGroup {
        ControlGroup::Single(region)
    }

    fn estimates_for(records: &[CommitRecord]) -> Vec<EstimateOutcome> {
        estimate_all(records, &StudyConfig::default(), &BanVariant::ALL).1
    }

    #[test]
    fn flat_input_gives_zero_for_every_variant() {
        let mut records = flat(Region::Italy, 5);
        records.extend(flat(Region::Austria, 3));
        records.extend(flat(Region::France, 8));

        let outcomes = estimates_for(&records);
        // 3 variants x (Austria, France, pooled) x 2 metrics
        assert_eq!(outcomes.len(), 18);
        for outcome in outcomes {
            let est = outcome.result.unwrap();
            assert!(est.estimate.abs() < 1e-9, "{:?}", est);
        }
    }

    #[test]
    fn full_ban_drop_of_two_commits_is_recovered() {
        let calendar = BanCalendar::default();
        let mut records = synthetic(Region::Italy, 20, |u, date| {
            let base = 5 + (u % 4) as u64;
            if calendar.classify(date, BanVariant::Full) == crate::period::Classification::In(Period::During) {
                base - 2
            } else {
                base
            }
        });
        records.extend(flat(Region::Austria, 3));
        records.extend(flat(Region::France, 4));

        let table = PeriodTable::build(&records, &calendar, BanVariant::Full);
        let pooled = ControlGroup::Pooled(vec![Region::Austria, Region::France]);
        for control in [single(Region::Austria), single(Region::France), pooled] {
            let est = estimate(&table, Region::Italy, &control, Metric::CommitCount, 0.95).unwrap();
            assert!((est.estimate + 2.0).abs() < 1e-9, "{control}: {}", est.estimate);
        }
    }

    #[test]
    fn swapping_roles_negates_the_estimate() {
        let mut records = synthetic(Region::Italy, 15, |u, date| {
            if date >= d(4, 1) { 2 + (u % 2) as u64 } else { 4 + (u % 5) as u64 }
        });
        records.extend(synthetic(Region::Austria, 12, |u, date| {
            if date >= d(4, 1) { 6 + (u % 3) as u64 } else { 5 }
        }));

        let calendar = BanCalendar::default();
        for variant in BanVariant::ALL {
            let table = PeriodTable::build(&records, &calendar, variant);
            for metric in Metric::ALL {
                let forward = estimate(&table, Region::Italy, &single(Region::Austria), metric, 0.95).unwrap();
                let backward = estimate(&table, Region::Austria, &single(Region::Italy), metric, 0.95).unwrap();
                assert!((forward.estimate + backward.estimate).abs() < 1e-12);
                match (forward.standard_error, backward.standard_error) {
                    (Some(a), Some(b)) => assert!((a - b).abs() < 1e-12),
                    (a, b) => assert_eq!(a, b),
                }
            }
            let forward = estimate(&table, Region::Italy, &single(Region::Austria), Metric::CommitCount, 0.95).unwrap();
            assert!(forward.estimate.abs() > 0.1);
        }
    }

    #[test]
    fn adaptation_window_does_not_affect_three_day_estimate() {
        let mut records = synthetic(Region::Italy, 10, |u, date| 1 + ((u as i64 + date.ordinal() as i64) % 4) as u64);
        records.extend(synthetic(Region::Austria, 10, |u, date| 2 + ((u as i64 * 3 + date.ordinal() as i64) % 5) as u64));
        records.extend(synthetic(Region::France, 10, |u, date| 1 + ((u as i64 + 2 * date.ordinal() as i64) % 3) as u64));

        let trimmed: Vec<CommitRecord> = records
            .iter()
            .filter(|r| !(r.date >= d(4, 8) && r.date <= d(4, 28)))
            .cloned()
            .collect();

        let calendar = BanCalendar::default();
        let full_table = PeriodTable::build(&records, &calendar, BanVariant::ThreeDay);
        let trimmed_table = PeriodTable::build(&trimmed, &calendar, BanVariant::ThreeDay);
        for control in [single(Region::Austria), single(Region::France)] {
            for metric in Metric::ALL {
                let a = estimate(&full_table, Region::Italy, &control, metric, 0.95).unwrap();
                let b = estimate(&trimmed_table, Region::Italy, &control, metric, 0.95).unwrap();
                assert_eq!(a.estimate, b.estimate);
                assert_eq!(a.p_value, b.p_value);
            }
        }
    }

    #[test]
    fn empty_cell_fails_only_that_estimate() {
        let mut records = flat(Region::Italy, 5);
        records.extend(flat(Region::Austria, 3));
        // France is only active before the ban.
        records.extend(synthetic(Region::France, 5, |_, date| if date < d(4, 1) { 2 } else { 0 }));

        let outcomes = estimates_for(&records);
        assert_eq!(outcomes.len(), 18);
        for outcome in &outcomes {
            match &outcome.control {
                ControlGroup::Single(Region::France) => match &outcome.result {
                    Err(AnalysisError::InsufficientData { region, period, variant }) => {
                        assert_eq!(*region, Region::France);
                        assert_eq!(*period, Period::During);
                        assert_eq!(*variant, outcome.variant);
                    }
                    other => panic!("expected InsufficientData, got {other:?}"),
                },
                // Austria alone, and the pool that still has Austria's users.
                _ => assert!(outcome.result.is_ok(), "{}: {:?}", outcome.control, outcome.result),
            }
        }
    }

    #[test]
    fn significance_is_attached_when_defined() {
        let mut records = synthetic(Region::Italy, 30, |u, date| {
            let base = 6 + (u % 5) as u64;
            if in_full_ban(date) { base - 3 + (u % 2) as u64 } else { base }
        });
        records.extend(synthetic(Region::Austria, 30, |u, date| {
            let base = 4 + (u % 3) as u64;
            if in_full_ban(date) { base + (u % 2) as u64 } else { base }
        }));

        let table = PeriodTable::build(&records, &BanCalendar::default(), BanVariant::Full);
        let est = estimate(&table, Region::Italy, &single(Region::Austria), Metric::CommitCount, 0.95).unwrap();
        let test = est.test.expect("cells vary");
        assert_eq!(est.treatment_users, 30);
        assert_eq!(est.control_users, 30);
        assert!(est.estimate < 0.0);
        assert!(test.p_value < 0.001);
        assert_eq!(est.p_value, Some(test.p_value));
        assert_eq!(est.standard_error, Some(test.standard_error));
        assert!(test.ci_high < 0.0);
        assert!(est.user_change_test.is_some());
    }

    #[test]
    fn interval_contains_its_own_estimate() {
        // Three Italian users drop by one or two commits a day; a fourth only
        // shows up during the ban, at 100 a day. Austria is flat.
        let mut records = synthetic(Region::Italy, 4, |u, date| match (u, in_full_ban(date)) {
            (3, true) => 100,
            (3, false) => 0,
            (u, true) => 5 + u as u64 - 1 - (u % 2) as u64,
            (u, false) => 5 + u as u64,
        });
        records.extend(synthetic(Region::Austria, 3, |u, _| 3 + u as u64));

        let table = PeriodTable::build(&records, &BanCalendar::default(), BanVariant::Full);
        let est = estimate(&table, Region::Italy, &single(Region::Austria), Metric::CommitCount, 0.95).unwrap();
        assert!((est.estimate - 22.5).abs() < 1e-9, "{}", est.estimate);

        let test = est.test.expect("cells vary");
        assert_eq!(test.mean_difference, est.estimate);
        assert!(test.ci_low <= est.estimate && est.estimate <= test.ci_high);

        // The per-user comparison only sees users active in both periods and
        // moves the other way; it stays a separate quantity.
        let users = est.user_change_test.expect("Italian changes vary");
        assert_eq!(est.treatment_users, 3);
        assert!((users.mean_difference + 4.0 / 3.0).abs() < 1e-9);
        assert!(users.ci_high < est.estimate);
    }

    #[test]
    fn activity_rate_difference_is_recovered() {
        // Italy commits every day, except every other day during the ban.
        let mut records = synthetic(Region::Italy, 10, |u, date| {
            if in_full_ban(date) && date.ordinal() % 2 == 1 { 0 } else { 3 + (u % 2) as u64 }
        });
        records.extend(flat(Region::Austria, 2));
        records.extend(flat(Region::France, 4));

        let table = PeriodTable::build(&records, &BanCalendar::default(), BanVariant::Full);
        let pooled = ControlGroup::Pooled(vec![Region::Austria, Region::France]);
        for control in [single(Region::Austria), pooled] {
            let est = estimate(&table, Region::Italy, &control, Metric::ActivityRate, 0.95).unwrap();
            assert_eq!(est.metric, Metric::ActivityRate);
            assert!((est.estimate + 0.5).abs() < 1e-12, "{control}: {}", est.estimate);
            assert!(est.user_change_test.is_none());
            let test = est.test.expect("Italy's during cell varies");
            assert!(test.p_value < 0.001);
            assert!(test.ci_low <= est.estimate && est.estimate <= test.ci_high);

            let counts = estimate(&table, Region::Italy, &control, Metric::CommitCount, 0.95).unwrap();
            assert!(counts.estimate.abs() < 1e-9, "active days keep their level");
        }
    }

    #[test]
    fn activity_estimate_shares_insufficient_data_isolation() {
        let mut records = flat(Region::Italy, 5);
        records.extend(synthetic(Region::Austria, 5, |_, date| if date < d(4, 1) { 2 } else { 0 }));
        let table = PeriodTable::build(&records, &BanCalendar::default(), BanVariant::SevenDay);
        let result = estimate(&table, Region::Italy, &single(Region::Austria), Metric::ActivityRate, 0.95);
        assert!(matches!(
            result,
            Err(AnalysisError::InsufficientData { region: Region::Austria, period: Period::During, .. })
        ));
    }

    #[test]
    fn pooled_group_needs_only_one_active_member() {
        let mut config = StudyConfig::default();
        assert_eq!(control_groups(&config).len(), 3);
        config.pool_controls = false;
        assert_eq!(control_groups(&config).len(), 2);
        config.pool_controls = true;
        config.controls = vec![Region::France];
        assert_eq!(control_groups(&config), vec![single(Region::France)]);

        let records = flat(Region::Italy, 5);
        let table = PeriodTable::build(&records, &BanCalendar::default(), BanVariant::Full);
        let pooled = ControlGroup::Pooled(vec![Region::Austria, Region::France]);
        match estimate(&table, Region::Italy, &pooled, Metric::CommitCount, 0.95) {
            Err(AnalysisError::InsufficientData { region, period, .. }) => {
                assert_eq!(region, Region::Austria);
                assert_eq!(period, Period::Pre);
            }
            other => panic!("expected InsufficientData, got {other:?}"),
        }
    }

    #[test]
    fn constant_cells_leave_test_undefined() {
        let mut records = synthetic(Region::Italy, 10, |_, _| 5);
        records.extend(synthetic(Region::Austria, 10, |_, _| 3));
        let table = PeriodTable::build(&records, &BanCalendar::default(), BanVariant::SevenDay);
        let est = estimate(&table, Region::Italy, &single(Region::Austria), Metric::CommitCount, 0.95).unwrap();
        assert!(est.estimate.abs() < 1e-12);
        assert!(est.test.is_none());
        assert!(est.standard_error.is_none());
        assert!(est.p_value.is_none());
        assert!(est.user_change_test.is_none());
    }
}
