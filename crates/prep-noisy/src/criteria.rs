//! Independent channel-quality criteria.
//!
//! Every evaluator receives the conditioned channel-by-sample matrix and the
//! list of candidate channels that survived the NaN/flat exclusion. Channels
//! outside the candidate list are never flagged and carry a `NaN` score.
//! An undefined score on a candidate always counts as bad.

use ndarray::{s, ArrayView1, ArrayView2, Axis};
use prep_core::stats::{
    mad, pearson, quantile, robust_std, robust_zscores, std_dev, IQR_TO_SD,
};
use prep_core::{ChannelMask, NoisyConfig};

/// A mask together with the per-channel score it was thresholded from
#[derive(Debug, Clone, PartialEq)]
pub struct CriterionOutcome {
    pub mask: ChannelMask,
    pub scores: Vec<f64>,
}

impl CriterionOutcome {
    /// Nothing flagged, every score undefined
    pub fn skipped(n_channels: usize) -> Self {
        Self {
            mask: ChannelMask::none(n_channels),
            scores: vec![f64::NAN; n_channels],
        }
    }

    fn scatter<F>(n_channels: usize, candidates: &[usize], values: &[f64], is_bad: F) -> Self
    where
        F: Fn(f64) -> bool,
    {
        let mut outcome = Self::skipped(n_channels);
        for (&channel, &value) in candidates.iter().zip(values) {
            outcome.scores[channel] = value;
            if is_bad(value) {
                outcome.mask.insert(channel);
            }
        }
        outcome
    }
}

/// Result of the windowed correlation test
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationOutcome {
    pub by_correlation: ChannelMask,
    pub by_dropout: ChannelMask,
    /// Fraction of windows whose correlation score fell below threshold
    pub bad_fraction: Vec<f64>,
    /// Fraction of windows where the score or noise ratio was undefined
    pub dropout_fraction: Vec<f64>,
}

/// Number of samples in a window of `seconds`, at least one
pub fn window_frames(seconds: f64, sample_rate: f64) -> usize {
    (seconds * sample_rate).round().max(1.0) as usize
}

fn row_vec(data: ArrayView2<f64>, channel: usize) -> Vec<f64> {
    data.row(channel).to_vec()
}

fn residual(raw: ArrayView1<f64>, filtered: ArrayView1<f64>) -> Vec<f64> {
    raw.iter().zip(filtered.iter()).map(|(a, b)| a - b).collect()
}

/// Channels with any missing sample, and channels with (near) zero spread.
///
/// Spread is the MAD scaled by [`IQR_TO_SD`] or the standard deviation; either
/// one below `flat_threshold` makes the channel flat. A NaN channel is never
/// also reported as flat.
pub fn find_nan_and_flat(data: ArrayView2<f64>, flat_threshold: f64) -> (ChannelMask, ChannelMask) {
    let n = data.nrows();
    let mut by_nan = ChannelMask::none(n);
    let mut by_flat = ChannelMask::none(n);

    for (channel, row) in data.axis_iter(Axis(0)).enumerate() {
        if row.iter().any(|x| x.is_nan()) {
            by_nan.insert(channel);
            continue;
        }
        let values = row.to_vec();
        if IQR_TO_SD * mad(&values) < flat_threshold || std_dev(&values) < flat_threshold {
            by_flat.insert(channel);
        }
    }

    (by_nan, by_flat)
}

/// Robust z-score of each candidate's amplitude dispersion.
///
/// Flags |z| above `z_threshold` or undefined.
pub fn find_bad_by_deviation(
    data: ArrayView2<f64>,
    candidates: &[usize],
    z_threshold: f64,
) -> CriterionOutcome {
    let dispersion: Vec<f64> = candidates
        .iter()
        .map(|&c| robust_std(&row_vec(data, c)))
        .collect();
    let z = robust_zscores(&dispersion);

    CriterionOutcome::scatter(data.nrows(), candidates, &z, |z| {
        z.is_nan() || z.abs() > z_threshold
    })
}

/// Noisiness = MAD(raw - band-limited) / MAD(band-limited), scored as a robust
/// z across candidates. Flags z above `z_threshold` or undefined.
pub fn find_bad_by_hf_noise(
    data: ArrayView2<f64>,
    band_limited: ArrayView2<f64>,
    candidates: &[usize],
    z_threshold: f64,
) -> CriterionOutcome {
    let noisiness: Vec<f64> = candidates
        .iter()
        .map(|&c| {
            let high = residual(data.row(c), band_limited.row(c));
            mad(&high) / mad(&row_vec(band_limited, c))
        })
        .collect();
    let z = robust_zscores(&noisiness);

    CriterionOutcome::scatter(data.nrows(), candidates, &z, |z| {
        z.is_nan() || z > z_threshold
    })
}

/// Per-candidate correlation score of one window: the `q` quantile of the
/// absolute correlations with every other candidate.
///
/// `NaN` when the channel itself is constant over the window. Undefined
/// correlations with constant partners are left out of the quantile.
fn window_correlation_scores(
    window: ArrayView2<f64>,
    candidates: &[usize],
    q: f64,
    flat_threshold: f64,
) -> Vec<f64> {
    let rows: Vec<ArrayView1<f64>> = candidates.iter().map(|&c| window.row(c)).collect();
    let m = rows.len();

    let mut abs_corr = vec![f64::NAN; m * m];
    for i in 0..m {
        for j in (i + 1)..m {
            let r = pearson(rows[i], rows[j]).abs();
            abs_corr[i * m + j] = r;
            abs_corr[j * m + i] = r;
        }
    }

    (0..m)
        .map(|i| {
            if std_dev(&rows[i].to_vec()) < flat_threshold {
                return f64::NAN;
            }
            let others: Vec<f64> = (0..m)
                .filter(|&j| j != i)
                .map(|j| abs_corr[i * m + j])
                .filter(|r| !r.is_nan())
                .collect();
            if others.is_empty() {
                0.0
            } else {
                quantile(&others, q)
            }
        })
        .collect()
}

/// Windowed correlation and dropout test over non-overlapping windows of
/// `frames` samples. Trailing samples that do not fill a window are ignored.
pub fn find_bad_by_correlation(
    data: ArrayView2<f64>,
    band_limited: ArrayView2<f64>,
    candidates: &[usize],
    frames: usize,
    config: &NoisyConfig,
) -> CorrelationOutcome {
    let n = data.nrows();
    let n_windows = if frames == 0 { 0 } else { data.ncols() / frames };

    let mut outcome = CorrelationOutcome {
        by_correlation: ChannelMask::none(n),
        by_dropout: ChannelMask::none(n),
        bad_fraction: vec![f64::NAN; n],
        dropout_fraction: vec![f64::NAN; n],
    };

    if n_windows == 0 {
        tracing::debug!(
            "Recording too short for a {} sample correlation window; correlation test skipped",
            frames
        );
        for &c in candidates {
            outcome.bad_fraction[c] = 0.0;
            outcome.dropout_fraction[c] = 0.0;
        }
        return outcome;
    }

    let mut bad_windows = vec![0usize; n];
    let mut dropout_windows = vec![0usize; n];

    for w in 0..n_windows {
        let raw = data.slice(s![.., w * frames..(w + 1) * frames]);
        let filtered = band_limited.slice(s![.., w * frames..(w + 1) * frames]);

        let scores = window_correlation_scores(
            filtered,
            candidates,
            config.correlation_quantile,
            config.flat_threshold,
        );

        for (&c, &score) in candidates.iter().zip(&scores) {
            let high = residual(raw.row(c), filtered.row(c));
            let noise_ratio = mad(&high) / mad(&filtered.row(c).to_vec());

            if score.is_nan() || noise_ratio.is_nan() {
                dropout_windows[c] += 1;
            } else if score < config.correlation_threshold {
                bad_windows[c] += 1;
            }
        }
    }

    for &c in candidates {
        let bad = bad_windows[c] as f64 / n_windows as f64;
        let dropout = dropout_windows[c] as f64 / n_windows as f64;
        outcome.bad_fraction[c] = bad;
        outcome.dropout_fraction[c] = dropout;
        if bad > config.bad_fraction_threshold {
            outcome.by_correlation.insert(c);
        }
        if dropout > config.bad_fraction_threshold {
            outcome.by_dropout.insert(c);
        }
    }

    outcome
}
