//! One complete noisy-channel detection pass.

use std::sync::Arc;

use ndarray::Array2;
use prep_core::{
    BadChannelReport, ChannelMask, Criterion, InterpolationOperator, NoisyConfig, Recording,
    Result,
};
use prep_signal::{band_limit, SignalConditioner};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::criteria::{
    find_bad_by_correlation, find_bad_by_deviation, find_bad_by_hf_noise, find_nan_and_flat,
    window_frames, CriterionOutcome,
};
use crate::ransac::{find_bad_by_ransac, RansacPredictor};

/// Per-channel scores behind the report masks. `NaN` marks a channel the
/// criterion did not evaluate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelScores {
    /// Robust z-score of amplitude dispersion
    pub deviation_z: Vec<f64>,
    /// Robust z-score of the high-frequency noise ratio
    pub hf_noise_z: Vec<f64>,
    /// Fraction of correlation windows below threshold
    pub bad_correlation_fraction: Vec<f64>,
    /// Fraction of correlation windows with an undefined score
    pub dropout_fraction: Vec<f64>,
    /// Fraction of RANSAC windows poorly predicted
    pub ransac_bad_window_fraction: Vec<f64>,
}

/// Runs conditioning, every criterion and the RANSAC test over a recording.
///
/// The detector holds no state between calls.
#[derive(Clone)]
pub struct NoisyChannelDetector {
    config: NoisyConfig,
    conditioner: SignalConditioner,
    ransac: RansacPredictor,
}

impl NoisyChannelDetector {
    pub fn new(config: NoisyConfig, line_frequencies: &[f64]) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            conditioner: SignalConditioner::from_config(line_frequencies, &config),
            ransac: RansacPredictor::from_config(&config),
            config,
        })
    }

    /// Replace the spherical-spline interpolator used by RANSAC
    pub fn with_interpolator(mut self, interpolator: Arc<dyn InterpolationOperator>) -> Self {
        self.ransac = self.ransac.with_interpolator(interpolator);
        self
    }

    pub fn config(&self) -> &NoisyConfig {
        &self.config
    }

    /// Same detector with the RANSAC test switched off
    pub fn without_ransac(&self) -> Self {
        let mut detector = self.clone();
        detector.config.ransac_enabled = false;
        detector
    }

    pub fn detect<R: Rng + ?Sized>(
        &self,
        recording: &Recording<'_>,
        rng: &mut R,
    ) -> Result<BadChannelReport> {
        self.detect_with_scores(recording, rng).map(|(report, _)| report)
    }

    pub fn detect_with_scores<R: Rng + ?Sized>(
        &self,
        recording: &Recording<'_>,
        rng: &mut R,
    ) -> Result<(BadChannelReport, ChannelScores)> {
        let sample_rate = recording.sample_rate();
        let n = recording.n_channels();
        let mut report = BadChannelReport::new(recording.montage().names().to_vec());

        let conditioned = self.conditioner.condition(recording.data(), sample_rate)?;

        let (by_nan, by_flat) = find_nan_and_flat(conditioned.view(), self.config.flat_threshold);
        let survivors = by_nan.union(&by_flat).complement().indices();

        let deviation = find_bad_by_deviation(
            conditioned.view(),
            &survivors,
            self.config.deviation_z_threshold,
        );

        let (band_limited, hf_noise) = if sample_rate > self.config.hf_min_sample_rate {
            let band_limited = band_limit(conditioned.view());
            let hf_noise = find_bad_by_hf_noise(
                conditioned.view(),
                band_limited.view(),
                &survivors,
                self.config.hf_noise_z_threshold,
            );
            (band_limited, hf_noise)
        } else {
            tracing::debug!(
                "Sample rate {} Hz at or below {} Hz; high-frequency noise test skipped",
                sample_rate,
                self.config.hf_min_sample_rate
            );
            (conditioned.clone(), CriterionOutcome::skipped(n))
        };

        let correlation = find_bad_by_correlation(
            conditioned.view(),
            band_limited.view(),
            &survivors,
            window_frames(self.config.correlation_window_seconds, sample_rate),
            &self.config,
        );

        report.set_mask(Criterion::Nan, by_nan)?;
        report.set_mask(Criterion::Flat, by_flat)?;
        report.set_mask(Criterion::Deviation, deviation.mask)?;
        report.set_mask(Criterion::HfNoise, hf_noise.mask)?;
        report.set_mask(Criterion::Correlation, correlation.by_correlation)?;
        report.set_mask(Criterion::Dropout, correlation.by_dropout)?;

        let ransac = if self.config.ransac_enabled {
            self.run_ransac(recording, &band_limited, &report.all_bad(), &survivors, rng)?
        } else {
            CriterionOutcome::skipped(n)
        };
        report.set_mask(Criterion::Ransac, ransac.mask)?;

        tracing::info!(
            "Detection pass over {} channels: {} bad (nan {}, flat {}, deviation {}, hf noise {}, correlation {}, dropout {}, ransac {})",
            n,
            report.all_bad().count(),
            report.by_nan().count(),
            report.by_flat().count(),
            report.by_deviation().count(),
            report.by_hf_noise().count(),
            report.by_correlation().count(),
            report.by_dropout().count(),
            report.by_ransac().count()
        );

        let scores = ChannelScores {
            deviation_z: deviation.scores,
            hf_noise_z: hf_noise.scores,
            bad_correlation_fraction: correlation.bad_fraction,
            dropout_fraction: correlation.dropout_fraction,
            ransac_bad_window_fraction: ransac.scores,
        };

        Ok((report, scores))
    }

    /// RANSAC over the pool of channels no earlier criterion flagged
    fn run_ransac<R: Rng + ?Sized>(
        &self,
        recording: &Recording<'_>,
        band_limited: &Array2<f64>,
        flagged: &ChannelMask,
        survivors: &[usize],
        rng: &mut R,
    ) -> Result<CriterionOutcome> {
        let pool = flagged.complement().indices();
        let predicted = self.ransac.predict(
            band_limited.view(),
            recording.montage().positions(),
            &pool,
            rng,
        )?;

        Ok(find_bad_by_ransac(
            band_limited.view(),
            predicted.view(),
            survivors,
            window_frames(self.config.ransac_window_seconds, recording.sample_rate()),
            self.config.ransac_corr_threshold,
            self.config.ransac_bad_window_fraction,
        ))
    }
}

/// Generator for RANSAC subsets: seeded when `seed` is set, from entropy otherwise
pub fn subset_rng(seed: Option<u64>) -> ChaCha8Rng {
    match seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_entropy(),
    }
}

/// Run a single detection pass with the generator configured by `config.ransac_seed`
pub fn detect_noisy_channels(
    recording: &Recording<'_>,
    line_noise_freqs: &[f64],
    config: &NoisyConfig,
) -> Result<BadChannelReport> {
    let detector = NoisyChannelDetector::new(config.clone(), line_noise_freqs)?;
    let mut rng = subset_rng(config.ransac_seed);
    detector.detect(recording, &mut rng)
}
