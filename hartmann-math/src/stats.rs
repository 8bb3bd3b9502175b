//! Robust statistics used for bias levels and light checks.

use ndarray::ArrayView2;

/// Median of a set of samples, averaging the two middle values for even counts.
///
/// Returns `None` for an empty input.
pub fn median(mut values: Vec<f64>) -> Option<f64> {
    let n = values.len();
    if n == 0 {
        return None;
    }

    let mid = n / 2;
    let (lower, upper, _) = values.select_nth_unstable_by(mid, f64::total_cmp);
    let upper = *upper;

    if n % 2 == 1 {
        return Some(upper);
    }

    let lower_max = lower.iter().copied().max_by(f64::total_cmp)?;
    Some(0.5 * (lower_max + upper))
}

/// Sample variance (ddof = 1) of `data` after clipping every value to `clip`.
///
/// Clipping keeps a handful of saturated arc lines from dominating the
/// statistic. Returns `None` for fewer than two samples.
pub fn clipped_sample_variance(data: ArrayView2<f64>, clip: f64) -> Option<f64> {
    let n = data.len();
    if n < 2 {
        return None;
    }

    let clipped = || data.iter().map(|&v| v.min(clip));
    let mean = clipped().sum::<f64>() / n as f64;
    let sum_sq = clipped().map(|v| (v - mean).powi(2)).sum::<f64>();

    Some(sum_sq / (n - 1) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{array, Array2};

    #[test]
    fn test_median_odd() {
        assert_eq!(median(vec![5.0, 1.0, 3.0]), Some(3.0));
    }

    #[test]
    fn test_median_even() {
        assert_eq!(median(vec![4.0, 1.0, 3.0, 2.0]), Some(2.5));
    }

    #[test]
    fn test_median_empty() {
        assert_eq!(median(Vec::new()), None);
    }

    #[test]
    fn test_median_ignores_outliers() {
        let mut values = vec![100.0; 50];
        values.push(60000.0);
        values.push(60000.0);
        assert_eq!(median(values), Some(100.0));
    }

    #[test]
    fn test_clipped_variance_matches_ddof1() {
        let data = array![[1.0, 2.0], [3.0, 4.0]];
        // mean 2.5, squared deviations 5.0, ddof=1 -> 5/3
        let var = clipped_sample_variance(data.view(), 1000.0).unwrap();
        assert_relative_eq!(var, 5.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_clipping_applied_before_variance() {
        let data = array![[0.0, 50_000.0]];
        let var = clipped_sample_variance(data.view(), 1000.0).unwrap();
        // Values become [0, 1000]: mean 500, variance 2 * 500^2 / 1
        assert_relative_eq!(var, 500_000.0, epsilon = 1e-9);
    }

    #[test]
    fn test_constant_frame_has_zero_variance() {
        let data = Array2::from_elem((10, 10), 42.0);
        assert_eq!(clipped_sample_variance(data.view(), 1000.0), Some(0.0));
    }

    #[test]
    fn test_single_sample_has_no_variance() {
        let data = Array2::from_elem((1, 1), 42.0);
        assert!(clipped_sample_variance(data.view(), 1000.0).is_none());
    }
}
