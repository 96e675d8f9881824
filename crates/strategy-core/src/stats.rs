//! Pure statistics shared by the evaluation engines.
//! Stateless functions; every degenerate input resolves to 0.0 instead of NaN.

use statrs::statistics::Statistics;

/// Arithmetic mean. 0.0 for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.mean()
}

/// Sample standard deviation (n-1). 0.0 below two observations.
pub fn sample_std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let sd = values.std_dev();
    if sd.is_finite() {
        sd
    } else {
        0.0
    }
}

/// Population standard deviation (n). 0.0 for an empty slice.
pub fn population_std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let sd = values.population_std_dev();
    if sd.is_finite() {
        sd
    } else {
        0.0
    }
}

/// Sample covariance (n-1) over the common prefix of `x` and `y`.
pub fn sample_covariance(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len().min(y.len());
    if n < 2 {
        return 0.0;
    }
    let mx = mean(&x[..n]);
    let my = mean(&y[..n]);
    x[..n]
        .iter()
        .zip(&y[..n])
        .map(|(a, b)| (a - mx) * (b - my))
        .sum::<f64>()
        / (n - 1) as f64
}

/// Pearson correlation. 0.0 when either side has no variance.
pub fn pearson_correlation(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len().min(y.len());
    if n < 2 {
        return 0.0;
    }
    let sx = sample_std_dev(&x[..n]);
    let sy = sample_std_dev(&y[..n]);
    if sx < 1e-12 || sy < 1e-12 {
        return 0.0;
    }
    (sample_covariance(x, y) / (sx * sy)).clamp(-1.0, 1.0)
}

/// Third standardized moment (population).
pub fn skewness(values: &[f64]) -> f64 {
    let sd = population_std_dev(values);
    if sd < 1e-12 {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| ((v - m) / sd).powi(3)).sum::<f64>() / values.len() as f64
}

/// Fourth standardized moment minus 3 (population).
pub fn excess_kurtosis(values: &[f64]) -> f64 {
    let sd = population_std_dev(values);
    if sd < 1e-12 {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| ((v - m) / sd).powi(4)).sum::<f64>() / values.len() as f64 - 3.0
}

/// Simple step returns of a value series. Steps from a zero value are skipped.
pub fn step_returns(values: &[f64]) -> Vec<f64> {
    values
        .windows(2)
        .filter_map(|w| {
            if w[0] != 0.0 {
                Some((w[1] - w[0]) / w[0])
            } else {
                None
            }
        })
        .collect()
}

/// Largest peak-to-trough decline of a value series as a positive fraction.
pub fn max_drawdown_fraction(values: &[f64]) -> f64 {
    let Some(&first) = values.first() else {
        return 0.0;
    };
    let mut peak = first;
    let mut max_dd = 0.0_f64;
    for &v in values {
        if v > peak {
            peak = v;
        }
        if peak > 0.0 {
            max_dd = max_dd.max((peak - v) / peak);
        }
    }
    max_dd
}

/// Sort ascending, treating incomparable values as equal.
pub fn sort_ascending(values: &mut [f64]) {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
}

/// Empirical lower-tail index `floor(n * tail)`, clamped into the slice.
pub fn tail_index(len: usize, tail: f64) -> usize {
    if len == 0 {
        return 0;
    }
    ((len as f64 * tail).floor() as usize).min(len - 1)
}

/// Historical VaR at `confidence` on an ascending slice, as a positive loss.
pub fn value_at_risk(sorted: &[f64], confidence: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    -sorted[tail_index(sorted.len(), 1.0 - confidence)]
}

/// Expected shortfall: negated mean of the returns at or below the VaR quantile.
pub fn conditional_value_at_risk(sorted: &[f64], confidence: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = tail_index(sorted.len(), 1.0 - confidence);
    -mean(&sorted[..=idx])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_degenerate_inputs_are_zero() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(sample_std_dev(&[1.0]), 0.0);
        assert_eq!(population_std_dev(&[]), 0.0);
        assert_eq!(skewness(&[2.0, 2.0, 2.0]), 0.0);
        assert_eq!(excess_kurtosis(&[2.0, 2.0, 2.0]), 0.0);
        assert_eq!(pearson_correlation(&[1.0, 1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(max_drawdown_fraction(&[]), 0.0);
        assert_eq!(value_at_risk(&[], 0.95), 0.0);
    }

    #[test]
    fn test_moments() {
        let v = [1.0, 2.0, 3.0, 4.0];
        assert!(close(mean(&v), 2.5));
        assert!(close(sample_std_dev(&v), (5.0_f64 / 3.0).sqrt()));
        assert!(close(population_std_dev(&v), 1.25_f64.sqrt()));
        // symmetric distribution
        assert!(close(skewness(&v), 0.0));
        // uniform-like: kurtosis below normal
        assert!(excess_kurtosis(&v) < 0.0);
        let skewed = [0.0, 0.0, 0.0, 10.0];
        assert!(skewness(&skewed) > 0.0);
    }

    #[test]
    fn test_covariance_and_correlation() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [2.0, 4.0, 6.0, 8.0];
        assert!(close(sample_covariance(&x, &y), 2.0 * 5.0 / 3.0));
        assert!(close(pearson_correlation(&x, &y), 1.0));
        let z = [8.0, 6.0, 4.0, 2.0];
        assert!(close(pearson_correlation(&x, &z), -1.0));
    }

    #[test]
    fn test_returns_and_drawdown() {
        let values = [100.0, 110.0, 99.0, 121.0];
        let r = step_returns(&values);
        assert_eq!(r.len(), 3);
        assert!(close(r[0], 0.1));
        assert!(close(r[1], -0.1));
        assert!(close(max_drawdown_fraction(&values), 0.1));
        assert_eq!(step_returns(&[0.0, 5.0]).len(), 0);
    }

    #[test]
    fn test_var_and_cvar() {
        let mut returns: Vec<f64> = (0..100).map(|i| (i as f64 - 50.0) / 100.0).collect();
        sort_ascending(&mut returns);
        // 5th percentile index = 5 -> -0.45
        assert!(close(value_at_risk(&returns, 0.95), 0.45));
        // mean of -0.50..=-0.45
        assert!(close(conditional_value_at_risk(&returns, 0.95), 0.475));
        assert!(conditional_value_at_risk(&returns, 0.95) >= value_at_risk(&returns, 0.95));
    }
}
