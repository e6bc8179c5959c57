//! Welch-type t-tests.
//!
//! Null hypothesis: there is no differential change in commit activity
//! between the treatment and control region around the ban window, i.e. the
//! difference-in-differences is zero. Variances are not assumed equal
//! between samples.

use crate::models::WelchTest;

/// Sample size, mean and unbiased variance of a sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Moments {
    pub n: usize,
    pub mean: f64,
    pub variance: f64,
}

impl Moments {
    /// Welford's single pass. Variance is 0 for fewer than two values.
    pub fn of(values: &[f64]) -> Self {
        let mut mean = 0.0;
        let mut m2 = 0.0;
        for (i, value) in values.iter().enumerate() {
            let delta = value - mean;
            mean += delta / (i + 1) as f64;
            m2 += delta * (value - mean);
        }

        let n = values.len();
        Self {
            n,
            mean,
            variance: if n > 1 { m2 / (n - 1) as f64 } else { 0.0 },
        }
    }
}

/// Test whether `treatment` and `control` have equal means. Returns `None`
/// when the statistic is undefined: fewer than two observations on either
/// side, or no variance at all.
pub fn welch_t_test(treatment: &[f64], control: &[f64], confidence_level: f64) -> Option<WelchTest> {
    let a = Moments::of(treatment);
    let b = Moments::of(control);
    contrast_test(
        a.mean - b.mean,
        &[(a.variance, a.n), (b.variance, b.n)],
        confidence_level,
    )
}

/// t-test of a ±1 contrast of independent sample means, e.g. the four cells
/// of a difference-in-differences. `cells` holds each sample's (variance, n);
/// degrees of freedom follow Welch–Satterthwaite. Undefined when a cell has
/// fewer than two observations or the contrast has no variance.
pub fn contrast_test(estimate: f64, cells: &[(f64, usize)], confidence_level: f64) -> Option<WelchTest> {
    if cells.is_empty() || cells.iter().any(|&(_, n)| n < 2) {
        return None;
    }

    let se_squared: f64 = cells.iter().map(|&(variance, n)| variance / n as f64).sum();
    if se_squared <= 0.0 || !se_squared.is_finite() {
        return None;
    }

    let standard_error = se_squared.sqrt();
    let statistic = estimate / standard_error;
    let degrees_of_freedom = se_squared * se_squared
        / cells
            .iter()
            .map(|&(variance, n)| {
                let v = variance / n as f64;
                v * v / (n - 1) as f64
            })
            .sum::<f64>();

    let p_value = two_sided_p_value(statistic, degrees_of_freedom);
    let critical = student_t_quantile(0.5 + confidence_level / 2.0, degrees_of_freedom);

    Some(WelchTest {
        statistic,
        degrees_of_freedom,
        p_value,
        mean_difference: estimate,
        standard_error,
        ci_low: estimate - critical * standard_error,
        ci_high: estimate + critical * standard_error,
    })
}

pub fn significance_stars(p_value: f64) -> &'static str {
    if p_value < 0.001 {
        "***"
    } else if p_value < 0.01 {
        "**"
    } else if p_value < 0.05 {
        "*"
    } else {
        ""
    }
}

pub fn two_sided_p_value(t: f64, df: f64) -> f64 {
    regularized_incomplete_beta(df / 2.0, 0.5, df / (df + t * t)).clamp(0.0, 1.0)
}

pub fn student_t_cdf(t: f64, df: f64) -> f64 {
    let tail = 0.5 * two_sided_p_value(t, df);
    if t > 0.0 {
        1.0 - tail
    } else {
        tail
    }
}

/// Inverse CDF by bisection. `p` must lie in (0, 1).
pub fn student_t_quantile(p: f64, df: f64) -> f64 {
    let (mut lo, mut hi) = (-1.0_f64, 1.0_f64);
    while student_t_cdf(lo, df) > p && lo > -1e12 {
        lo *= 2.0;
    }
    while student_t_cdf(hi, df) < p && hi < 1e12 {
        hi *= 2.0;
    }

    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if student_t_cdf(mid, df) < p {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo < 1e-12 {
            break;
        }
    }
    0.5 * (lo + hi)
}

const LANCZOS: [f64; 9] = [
    0.999_999_999_999_809_9,
    676.520_368_121_885_1,
    -1_259.139_216_722_402_8,
    771.323_428_777_653_1,
    -176.615_029_162_140_6,
    12.507_343_278_686_905,
    -0.138_571_095_265_720_12,
    9.984_369_578_019_572e-6,
    1.505_632_735_149_311_6e-7,
];

/// ln Γ(x) for x > 0 (Lanczos, g = 7).
pub fn ln_gamma(x: f64) -> f64 {
    if x < 0.5 {
        let pi = std::f64::consts::PI;
        return (pi / (pi * x).sin()).ln() - ln_gamma(1.0 - x);
    }

    let x = x - 1.0;
    let t = x + 7.5;
    let series = LANCZOS
        .iter()
        .enumerate()
        .skip(1)
        .fold(LANCZOS[0], |acc, (i, c)| acc + c / (x + i as f64));
    0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + series.ln()
}

/// I_x(a, b), via the continued fraction on whichever side converges faster.
pub fn regularized_incomplete_beta(a: f64, b: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }

    let ln_front = ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln();
    if x < (a + 1.0) / (a + b + 2.0) {
        ln_front.exp() * beta_continued_fraction(a, b, x) / a
    } else {
        1.0 - ln_front.exp() * beta_continued_fraction(b, a, 1.0 - x) / b
    }
}

fn beta_continued_fraction(a: f64, b: f64, x: f64) -> f64 {
    const MAX_ITERATIONS: usize = 300;
    const EPSILON: f64 = 1e-14;
    const TINY: f64 = 1e-300;

    let guard = |v: f64| if v.abs() < TINY { TINY } else { v };

    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;
    let mut c = 1.0;
    let mut d = 1.0 / guard(1.0 - qab * x / qap);
    let mut h = d;

    for m in 1..=MAX_ITERATIONS {
        let m = m as f64;
        let m2 = 2.0 * m;

        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 / guard(1.0 + aa * d);
        c = guard(1.0 + aa / c);
        h *= d * c;

        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 / guard(1.0 + aa * d);
        c = guard(1.0 + aa / c);
        let delta = d * c;
        h *= delta;

        if (delta - 1.0).abs() < EPSILON {
            break;
        }
    }

    h
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() < tol
    }

    #[test]
    fn moments_match_textbook_values() {
        let m = Moments::of(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert_eq!(m.n, 8);
        assert!(close(m.mean, 5.0, 1e-12));
        assert!(close(m.variance, 32.0 / 7.0, 1e-12));

        let single = Moments::of(&[3.0]);
        assert_eq!(single.variance, 0.0);
        assert_eq!(Moments::of(&[]).n, 0);
    }

    #[test]
    fn ln_gamma_matches_factorials() {
        assert!(close(ln_gamma(5.0).exp(), 24.0, 1e-9));
        assert!(close(ln_gamma(0.5).exp(), std::f64::consts::PI.sqrt(), 1e-9));
        assert!(close(ln_gamma(1.0), 0.0, 1e-12));
    }

    #[test]
    fn t_distribution_reference_points() {
        // df = 1 is the Cauchy distribution: P(|T| > 1) = 0.5.
        assert!(close(two_sided_p_value(1.0, 1.0), 0.5, 1e-9));
        assert!(close(two_sided_p_value(0.0, 5.0), 1.0, 1e-12));
        assert!(close(two_sided_p_value(2.228, 10.0), 0.05, 1e-3));
        assert!(close(student_t_cdf(0.0, 7.0), 0.5, 1e-12));
    }

    #[test]
    fn t_quantiles() {
        assert!(close(student_t_quantile(0.975, 10.0), 2.2281, 1e-3));
        assert!(close(student_t_quantile(0.975, 1e6), 1.95996, 1e-3));
        assert!(close(student_t_quantile(0.025, 10.0), -2.2281, 1e-3));
    }

    #[test]
    fn welch_reference_example() {
        let a = [
            27.5, 21.0, 19.0, 23.6, 17.0, 17.9, 16.9, 20.1, 21.9, 22.6, 23.1, 19.6, 19.0, 21.7, 21.4,
        ];
        let b = [
            27.1, 22.0, 20.8, 23.4, 23.4, 23.5, 25.8, 22.0, 24.8, 20.2, 21.9, 22.1, 22.9, 20.5, 24.4,
        ];
        let test = welch_t_test(&a, &b, 0.95).unwrap();
        assert!(close(test.statistic, -2.4554, 1e-3));
        assert!(close(test.degrees_of_freedom, 24.9885, 1e-3));
        assert!(close(test.p_value, 0.02138, 1e-4));
        assert!(test.ci_low < test.mean_difference && test.mean_difference < test.ci_high);
        assert!(test.ci_high < 0.0, "a significant result excludes zero");
    }

    #[test]
    fn undefined_cases_return_none() {
        assert!(welch_t_test(&[1.0], &[1.0, 2.0], 0.95).is_none());
        assert!(welch_t_test(&[1.0, 1.0], &[2.0, 2.0], 0.95).is_none());
    }

    #[test]
    fn one_constant_sample_is_still_testable() {
        let test = welch_t_test(&[0.0, 0.0, 0.0], &[1.0, 2.0, 3.0], 0.95).unwrap();
        assert!(close(test.degrees_of_freedom, 2.0, 1e-9));
        assert!(test.p_value > 0.0 && test.p_value < 1.0);
    }

    #[test]
    fn two_cell_contrast_is_welch() {
        let a = [3.0, 5.0, 4.0, 8.0];
        let b = [1.0, 2.0, 2.5];
        let ma = Moments::of(&a);
        let mb = Moments::of(&b);
        let welch = welch_t_test(&a, &b, 0.9).unwrap();
        let contrast =
            contrast_test(ma.mean - mb.mean, &[(ma.variance, ma.n), (mb.variance, mb.n)], 0.9).unwrap();
        assert_eq!(welch.statistic, contrast.statistic);
        assert_eq!(welch.degrees_of_freedom, contrast.degrees_of_freedom);
        assert_eq!(welch.ci_low, contrast.ci_low);
    }

    #[test]
    fn four_cell_contrast_centres_on_its_estimate() {
        let cells = [(4.0, 100), (9.0, 40), (1.0, 80), (2.5, 30)];
        let test = contrast_test(-0.75, &cells, 0.95).unwrap();
        let expected_se = (4.0 / 100.0 + 9.0 / 40.0 + 1.0 / 80.0 + 2.5 / 30.0_f64).sqrt();
        assert!(close(test.standard_error, expected_se, 1e-12));
        assert_eq!(test.mean_difference, -0.75);
        assert!(test.ci_low < -0.75 && -0.75 < test.ci_high);
        assert!(close(test.ci_low + test.ci_high, -1.5, 1e-9));
        assert!(test.degrees_of_freedom > 29.0);

        assert!(contrast_test(1.0, &[(4.0, 100), (9.0, 1)], 0.95).is_none());
        assert!(contrast_test(1.0, &[(0.0, 10), (0.0, 10)], 0.95).is_none());
    }

    #[test]
    fn stars_follow_thresholds() {
        assert_eq!(significance_stars(0.0005), "***");
        assert_eq!(significance_stars(0.005), "**");
        assert_eq!(significance_stars(0.03), "*");
        assert_eq!(significance_stars(0.2), "");
    }
}
