//! Robust statistics used by the channel-quality criteria.
//!
//! All estimators return `NaN` for empty input and propagate `NaN` samples,
//! so callers can treat an undefined score as a reason to flag a channel.

use ndarray::ArrayView1;

/// Scale turning an interquartile range into a normal-equivalent standard deviation
pub const IQR_TO_SD: f64 = 0.7413;

fn sorted(data: &[f64]) -> Option<Vec<f64>> {
    if data.is_empty() || data.iter().any(|x| x.is_nan()) {
        return None;
    }
    let mut sorted = data.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    Some(sorted)
}

/// Linear-interpolated quantile of an already sorted slice, `q` in [0, 1]
fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Quantile with linear interpolation between order statistics
pub fn quantile(data: &[f64], q: f64) -> f64 {
    match sorted(data) {
        Some(s) => quantile_sorted(&s, q),
        None => f64::NAN,
    }
}

pub fn median(data: &[f64]) -> f64 {
    quantile(data, 0.5)
}

/// Median ignoring NaN samples
pub fn nan_median(data: &[f64]) -> f64 {
    let finite: Vec<f64> = data.iter().copied().filter(|x| !x.is_nan()).collect();
    median(&finite)
}

pub fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return f64::NAN;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

/// Population standard deviation
pub fn std_dev(data: &[f64]) -> f64 {
    let m = mean(data);
    if m.is_nan() {
        return f64::NAN;
    }
    let var = data.iter().map(|&x| (x - m).powi(2)).sum::<f64>() / data.len() as f64;
    var.sqrt()
}

/// Unscaled median absolute deviation from the median
pub fn mad(data: &[f64]) -> f64 {
    let center = median(data);
    if center.is_nan() {
        return f64::NAN;
    }
    let deviations: Vec<f64> = data.iter().map(|&x| (x - center).abs()).collect();
    median(&deviations)
}

pub fn iqr(data: &[f64]) -> f64 {
    match sorted(data) {
        Some(s) => quantile_sorted(&s, 0.75) - quantile_sorted(&s, 0.25),
        None => f64::NAN,
    }
}

/// Robust standard deviation estimate: `0.7413 * IQR`
pub fn robust_std(data: &[f64]) -> f64 {
    IQR_TO_SD * iqr(data)
}

/// Robust z-scores of a population: `(x - median) / robust_std`.
///
/// A zero spread yields `NaN` (for values at the median) or `±inf`.
pub fn robust_zscores(values: &[f64]) -> Vec<f64> {
    let center = median(values);
    let spread = robust_std(values);
    values.iter().map(|&v| (v - center) / spread).collect()
}

/// Pearson correlation; `NaN` when either input has zero variance
pub fn pearson(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    let n = a.len().min(b.len());
    if n == 0 {
        return f64::NAN;
    }
    let ma = a.iter().take(n).sum::<f64>() / n as f64;
    let mb = b.iter().take(n).sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut va = 0.0;
    let mut vb = 0.0;
    for (&x, &y) in a.iter().zip(b.iter()).take(n) {
        let dx = x - ma;
        let dy = y - mb;
        cov += dx * dy;
        va += dx * dx;
        vb += dy * dy;
    }

    let denom = (va * vb).sqrt();
    if denom == 0.0 {
        f64::NAN
    } else {
        cov / denom
    }
}
