//! Consensus prediction of every channel from random subsets of good channels.
//!
//! Each repetition draws a subset of the good pool, builds a spatial
//! interpolation operator from the subset to every sensor and predicts all
//! channels. The per-sample median over repetitions is the consensus signal
//! a channel must correlate with to be considered good.

use std::sync::Arc;

use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use prep_core::stats::{median, pearson};
use prep_core::{
    ChannelMask, Error, InterpolationOperator, NoisyConfig, Position3D, Result, SphericalSpline,
};
use rand::seq::index;
use rand::Rng;
use rayon::prelude::*;

use crate::criteria::CriterionOutcome;

/// Smallest number of predicting channels that gives a usable interpolation
pub const MIN_PREDICTING_CHANNELS: usize = 4;

/// Random-subset spatial predictor
#[derive(Clone)]
pub struct RansacPredictor {
    interpolator: Arc<dyn InterpolationOperator>,
    sample_count: usize,
    good_fraction: f64,
}

impl RansacPredictor {
    pub fn new(
        interpolator: Arc<dyn InterpolationOperator>,
        sample_count: usize,
        good_fraction: f64,
    ) -> Self {
        Self {
            interpolator,
            sample_count,
            good_fraction,
        }
    }

    /// Spherical-spline predictor with the repetition settings of `config`
    pub fn from_config(config: &NoisyConfig) -> Self {
        Self::new(
            Arc::new(SphericalSpline::default()),
            config.ransac_sample_count,
            config.ransac_good_fraction,
        )
    }

    pub fn with_interpolator(mut self, interpolator: Arc<dyn InterpolationOperator>) -> Self {
        self.interpolator = interpolator;
        self
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// ceil(good_fraction * pool_size), which must reach [`MIN_PREDICTING_CHANNELS`]
    pub fn predicted_channel_count(&self, pool_size: usize) -> Result<usize> {
        let n_pred = (self.good_fraction * pool_size as f64).ceil() as usize;
        if n_pred < MIN_PREDICTING_CHANNELS {
            return Err(Error::InsufficientChannels {
                required: MIN_PREDICTING_CHANNELS,
                available: n_pred,
            });
        }
        Ok(n_pred.min(pool_size))
    }

    /// Draw `sample_count` subsets of `n_pred` channels from `pool`, without
    /// replacement inside a subset
    pub fn draw_subsets<R: Rng + ?Sized>(
        &self,
        pool: &[usize],
        n_pred: usize,
        rng: &mut R,
    ) -> Vec<Vec<usize>> {
        (0..self.sample_count)
            .map(|_| {
                let mut subset: Vec<usize> = index::sample(rng, pool.len(), n_pred)
                    .into_iter()
                    .map(|i| pool[i])
                    .collect();
                subset.sort_unstable();
                subset
            })
            .collect()
    }

    /// Median prediction of every channel of `data` from random subsets of `pool`.
    ///
    /// Fails with [`Error::InsufficientChannels`] before drawing anything if
    /// the pool is too small.
    pub fn predict<R: Rng + ?Sized>(
        &self,
        data: ArrayView2<f64>,
        positions: &[Position3D],
        pool: &[usize],
        rng: &mut R,
    ) -> Result<Array2<f64>> {
        if positions.len() != data.nrows() {
            return Err(Error::ShapeMismatch {
                expected: data.nrows(),
                actual: positions.len(),
            });
        }
        let n_pred = self.predicted_channel_count(pool.len())?;
        let subsets = self.draw_subsets(pool, n_pred, rng);

        // One operator per repetition; all must exist before aggregation
        let operators = subsets
            .par_iter()
            .map(|subset| {
                let sources: Vec<Position3D> = subset.iter().map(|&i| positions[i]).collect();
                self.interpolator.operator(&sources, positions)
            })
            .collect::<Result<Vec<Array2<f64>>>>()?;
        let sources: Vec<Array2<f64>> = subsets
            .iter()
            .map(|subset| data.select(Axis(0), subset))
            .collect();

        let (n_channels, n_samples) = data.dim();
        let rows: Vec<Vec<f64>> = (0..n_channels)
            .into_par_iter()
            .map(|channel| {
                let predictions: Vec<Array1<f64>> = operators
                    .iter()
                    .zip(&sources)
                    .map(|(op, src)| op.row(channel).dot(src))
                    .collect();

                let mut scratch = vec![0.0; predictions.len()];
                (0..n_samples)
                    .map(|t| {
                        for (slot, prediction) in scratch.iter_mut().zip(&predictions) {
                            *slot = prediction[t];
                        }
                        median(&scratch)
                    })
                    .collect()
            })
            .collect();

        Ok(Array2::from_shape_fn((n_channels, n_samples), |(c, t)| {
            rows[c][t]
        }))
    }
}

/// Window-by-window correlation between actual and predicted signals.
///
/// A window is bad when its correlation is below `corr_threshold` or
/// undefined; a candidate is flagged when its fraction of bad windows exceeds
/// `bad_window_fraction`.
pub fn find_bad_by_ransac(
    actual: ArrayView2<f64>,
    predicted: ArrayView2<f64>,
    candidates: &[usize],
    frames: usize,
    corr_threshold: f64,
    bad_window_fraction: f64,
) -> CriterionOutcome {
    let n = actual.nrows();
    let n_windows = if frames == 0 { 0 } else { actual.ncols() / frames };
    let mut outcome = CriterionOutcome {
        mask: ChannelMask::none(n),
        scores: vec![f64::NAN; n],
    };

    if n_windows == 0 {
        tracing::debug!(
            "Recording too short for a {} sample RANSAC window; RANSAC test skipped",
            frames
        );
        for &c in candidates {
            outcome.scores[c] = 0.0;
        }
        return outcome;
    }

    for &c in candidates {
        let bad = (0..n_windows)
            .filter(|&w| {
                let window = w * frames..(w + 1) * frames;
                let r = pearson(
                    actual.slice(s![c, window.clone()]),
                    predicted.slice(s![c, window]),
                );
                r.is_nan() || r < corr_threshold
            })
            .count();

        let fraction = bad as f64 / n_windows as f64;
        outcome.scores[c] = fraction;
        if fraction > bad_window_fraction {
            outcome.mask.insert(c);
        }
    }

    outcome
}
