use std::collections::BTreeMap;
use std::fmt::Write;
use std::io;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::aggregate::{self, PeriodTable};
use crate::config::StudyConfig;
use crate::did::EstimateOutcome;
use crate::error::AnalysisResult;
use crate::loader::Dataset;
use crate::models::{BanVariant, ControlGroup, DiDEstimate, LoadSummary, Metric, Period, Region, RegionPeriodStat};
use crate::period::BanCalendar;
use crate::significance::significance_stars;

/// Everything one analysis run produced.
pub struct AnalysisRun<'a> {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub config: &'a StudyConfig,
    pub dataset: &'a Dataset,
    pub tables: &'a [PeriodTable],
    pub outcomes: &'a [EstimateOutcome],
}

impl<'a> AnalysisRun<'a> {
    pub fn new(
        config: &'a StudyConfig,
        dataset: &'a Dataset,
        tables: &'a [PeriodTable],
        outcomes: &'a [EstimateOutcome],
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            generated_at: Utc::now(),
            config,
            dataset,
            tables,
            outcomes,
        }
    }
}

#[derive(Serialize)]
struct FailedEstimate<'a> {
    control: &'a ControlGroup,
    variant: BanVariant,
    metric: Metric,
    error: String,
}

#[derive(Serialize)]
struct VariantStats<'a> {
    variant: BanVariant,
    adaptation_window_records: usize,
    stats: Vec<&'a RegionPeriodStat>,
}

#[derive(Serialize)]
struct RunDocument<'a> {
    run_id: Uuid,
    generated_at: DateTime<Utc>,
    config: &'a StudyConfig,
    loads: &'a BTreeMap<Region, LoadSummary>,
    load_failures: &'a BTreeMap<Region, String>,
    period_stats: Vec<VariantStats<'a>>,
    estimates: Vec<&'a DiDEstimate>,
    failed_estimates: Vec<FailedEstimate<'a>>,
}

pub fn write_json<W: io::Write>(run: &AnalysisRun<'_>, writer: W) -> AnalysisResult<()> {
    let document = RunDocument {
        run_id: run.run_id,
        generated_at: run.generated_at,
        config: run.config,
        loads: &run.dataset.summaries,
        load_failures: &run.dataset.failures,
        period_stats: run
            .tables
            .iter()
            .map(|table| VariantStats {
                variant: table.variant,
                adaptation_window_records: table.adaptation_window_records,
                stats: table.stats().collect(),
            })
            .collect(),
        estimates: run.outcomes.iter().filter_map(|o| o.result.as_ref().ok()).collect(),
        failed_estimates: run
            .outcomes
            .iter()
            .filter_map(|o| {
                o.result.as_ref().err().map(|err| FailedEstimate {
                    control: &o.control,
                    variant: o.variant,
                    metric: o.metric,
                    error: err.to_string(),
                })
            })
            .collect(),
    };
    serde_json::to_writer_pretty(writer, &document)?;
    Ok(())
}

fn format_p(p_value: Option<f64>) -> String {
    match p_value {
        Some(p) => format!("{p:.4}{}", significance_stars(p)),
        None => "n/a".to_string(),
    }
}

/// Plain-text table of the estimates, for the terminal.
pub fn estimates_table(outcomes: &[EstimateOutcome]) -> String {
    let mut output = String::new();
    let _ = writeln!(
        output,
        "{:<7} {:<14} {:<8} {:>10} {:>8} {:>10}  {}",
        "variant", "control", "outcome", "estimate", "se", "p", "users (T/C)"
    );

    for outcome in outcomes {
        let control = outcome.control.to_string();
        match &outcome.result {
            Ok(est) => {
                let se = est
                    .standard_error
                    .map(|se| format!("{se:.4}"))
                    .unwrap_or_else(|| "n/a".to_string());
                let _ = writeln!(
                    output,
                    "{:<7} {:<14} {:<8} {:>+10.4} {:>8} {:>10}  {}/{}",
                    outcome.variant.label(),
                    control,
                    outcome.metric.label(),
                    est.estimate,
                    se,
                    format_p(est.p_value),
                    est.treatment_users,
                    est.control_users
                );
            }
            Err(err) => {
                let _ = writeln!(
                    output,
                    "{:<7} {:<14} {:<8} failed: {err}",
                    outcome.variant.label(),
                    control,
                    outcome.metric.label()
                );
            }
        }
    }

    output
}

pub fn build_report(run: &AnalysisRun<'_>) -> String {
    let config = run.config;
    let calendar = BanCalendar::from_config(config);
    let mut output = String::new();

    let _ = writeln!(output, "# Ban Impact Report");
    let _ = writeln!(
        output,
        "Run {} generated {} for {} against {}.",
        run.run_id,
        run.generated_at.format("%Y-%m-%d %H:%M UTC"),
        config.treatment,
        config
            .controls
            .iter()
            .map(Region::name)
            .collect::<Vec<_>>()
            .join(", ")
    );
    let _ = writeln!(output);
    let _ = writeln!(
        output,
        "Analysis window {} to {}; ban {} to {}; cohort cap {} users per region (seed {}).",
        config.window_start, config.window_end, config.ban_start, config.ban_end, config.sample_cap, config.seed
    );

    let _ = writeln!(output);
    let _ = writeln!(output, "## Data Loading");

    for (region, summary) in &run.dataset.summaries {
        let _ = writeln!(
            output,
            "- {}: {} rows read, {} user-day records from {} users",
            region, summary.rows_read, summary.records, summary.users
        );
        for (reason, count) in &summary.excluded {
            let _ = writeln!(output, "  - excluded ({}): {}", reason.label(), count);
        }
        if summary.users_dropped_by_cap > 0 {
            let _ = writeln!(
                output,
                "  - {} users dropped to respect the cohort cap",
                summary.users_dropped_by_cap
            );
        }
    }
    for (region, reason) in &run.dataset.failures {
        let _ = writeln!(output, "- {}: not loaded ({})", region, reason);
    }

    for table in run.tables {
        let variant = table.variant;
        let (during_start, during_end) = calendar.bounds(Period::During, variant);
        let _ = writeln!(output);
        let _ = writeln!(output, "## Period Means ({variant} ban window)");
        let _ = writeln!(output, "During window: {during_start} to {during_end}.");
        if table.adaptation_window_records > 0 {
            let _ = writeln!(
                output,
                "{} user-day records in the adaptation window were excluded.",
                table.adaptation_window_records
            );
        }
        let _ = writeln!(output);
        let _ = writeln!(
            output,
            "| Region | Period | Mean commits | Variance | Active users | User-days | Activity rate |"
        );
        let _ = writeln!(output, "|---|---|---:|---:|---:|---:|---:|");
        for stat in table.stats() {
            let _ = writeln!(
                output,
                "| {} | {} | {:.3} | {:.3} | {} | {} | {:.3} |",
                stat.region,
                stat.period,
                stat.mean_commits,
                stat.variance,
                stat.sample_count,
                stat.record_count,
                stat.activity_rate
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Difference-in-Differences Estimates");

    if run.outcomes.is_empty() {
        let _ = writeln!(output, "No estimates were requested.");
    } else {
        let level = config.confidence_level * 100.0;
        let _ = writeln!(
            output,
            "| Variant | Control | Outcome | Estimate | Std. error | t | df | p-value | {level:.0}% CI |"
        );
        let _ = writeln!(output, "|---|---|---|---:|---:|---:|---:|---:|---|");
        for outcome in run.outcomes {
            match &outcome.result {
                Ok(est) => match est.test {
                    Some(test) => {
                        let _ = writeln!(
                            output,
                            "| {} | {} | {} | {:+.4} | {:.4} | {:.3} | {:.1} | {} | [{:+.4}, {:+.4}] |",
                            est.variant,
                            est.control,
                            est.metric,
                            est.estimate,
                            test.standard_error,
                            test.statistic,
                            test.degrees_of_freedom,
                            format_p(est.p_value),
                            test.ci_low,
                            test.ci_high
                        );
                    }
                    None => {
                        let _ = writeln!(
                            output,
                            "| {} | {} | {} | {:+.4} | n/a | n/a | n/a | n/a | n/a |",
                            est.variant, est.control, est.metric, est.estimate
                        );
                    }
                },
                Err(err) => {
                    let _ = writeln!(
                        output,
                        "| {} | {} | {} | failed: {} | | | | | |",
                        outcome.variant, outcome.control, outcome.metric, err
                    );
                }
            }
        }
        let _ = writeln!(output);
        let _ = writeln!(output, "Significance: *** p < 0.001, ** p < 0.01, * p < 0.05.");

        let _ = writeln!(output);
        let _ = writeln!(output, "### Per-user changes");
        let _ = writeln!(
            output,
            "Welch test on each user's change in mean daily commits (during minus pre), users active in both periods. This compares panel users only and is not the interval of the estimate above."
        );
        let _ = writeln!(output);
        let _ = writeln!(
            output,
            "| Variant | Control | Users (T/C) | Mean change difference | p-value | {level:.0}% CI |"
        );
        let _ = writeln!(output, "|---|---|---:|---:|---:|---|");
        for est in run
            .outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok())
            .filter(|est| est.metric == Metric::CommitCount)
        {
            match est.user_change_test {
                Some(test) => {
                    let _ = writeln!(
                        output,
                        "| {} | {} | {}/{} | {:+.4} | {} | [{:+.4}, {:+.4}] |",
                        est.variant,
                        est.control,
                        est.treatment_users,
                        est.control_users,
                        test.mean_difference,
                        format_p(Some(test.p_value)),
                        test.ci_low,
                        test.ci_high
                    );
                }
                None => {
                    let _ = writeln!(
                        output,
                        "| {} | {} | {}/{} | n/a | n/a | n/a |",
                        est.variant, est.control, est.treatment_users, est.control_users
                    );
                }
            }
        }
    }

    let profiles = aggregate::weekday_profiles(&run.dataset.records);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Weekday Profile");

    if profiles.is_empty() {
        let _ = writeln!(output, "No records loaded.");
    } else {
        for region in Region::ALL {
            let line: Vec<String> = profiles
                .iter()
                .filter(|p| p.region == region)
                .map(|p| format!("{} {:.2}", p.weekday, p.mean_commits))
                .collect();
            if !line.is_empty() {
                let _ = writeln!(output, "- {}: {}", region, line.join(", "));
            }
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Method Notes");
    let _ = writeln!(
        output,
        "- Null hypothesis: no differential change in commit activity between {} and the control group around the ban window. The estimate's standard error combines the sampling variances of its four cells (user-days for commits, possible user-days for activity), with Welch-Satterthwaite degrees of freedom.",
        config.treatment
    );
    let _ = writeln!(
        output,
        "- Activity is the share of possible user-days (active users x days in the period) with at least one commit. The pooled control treats all control regions as one group."
    );
    let _ = writeln!(
        output,
        "- Means cover the active subset only: users with at least one record in the period. Missing user-days are not imputed as zero."
    );
    let _ = writeln!(
        output,
        "- For the 3-day and 7-day variants, days between the end of the variant's window and {} form an adaptation window and are excluded from every comparison.",
        config.ban_end
    );
    let _ = writeln!(
        output,
        "- Rows with a commit count of 0 are excluded at load time and counted under \"zero commit count\": a zero row is not observed activity, and keeping it would impute zeros into the active subset."
    );
    let _ = writeln!(
        output,
        "- Caveat: the source data cannot distinguish a day without commits from an unobserved day. This can bias the estimates and is not corrected here."
    );

    output
}
