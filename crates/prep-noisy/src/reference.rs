//! Iterative robust reference estimation.
//!
//! ```text
//! INIT → ESTIMATING → EVALUATING → (CONVERGED | ITERATING → EVALUATING) → DONE
//! ```
//!
//! The seeding pass marks NaN and flat channels unusable. The first
//! reference is the median over the remaining reference channels. Every
//! later estimate is the mean over reference channels after the current bad
//! set has been interpolated from the good channels of the original signal.
//! Flags only accumulate: a channel once bad stays bad.

use std::collections::BTreeSet;
use std::sync::Arc;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use prep_core::stats::median;
use prep_core::{
    interpolate_bad_channels, BadChannelReport, ChannelMask, Error, InterpolationOperator,
    Montage, Recording, ReferenceConfig, Result, SphericalSpline,
};
use rand::Rng;

use crate::detector::{subset_rng, NoisyChannelDetector};

/// Everything the referencing loop produces
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceOutcome {
    /// Union of every pass's report over all channels
    pub report: BadChannelReport,
    /// Original signal minus the final reference (unusable channels untouched)
    pub referenced: Array2<f64>,
    /// Final reference estimate, one value per sample
    pub reference: Array1<f64>,
    /// Completed re-estimations
    pub iterations: usize,
    /// Detection passes that completed, the seeding pass included. A pass
    /// that fails for lack of RANSAC channels ends the loop uncounted.
    pub detection_passes: usize,
    /// Running `all_bad` union after each completed pass
    pub history: Vec<ChannelMask>,
}

/// Loop bookkeeping, discarded on return
struct IterationState {
    iterations: usize,
    detection_passes: usize,
    previous_bad: Option<ChannelMask>,
    interpolated: Array2<f64>,
    converged: bool,
}

/// Drives repeated detection passes towards a stable reference
#[derive(Clone)]
pub struct RobustReferencer {
    config: ReferenceConfig,
    detector: NoisyChannelDetector,
    interpolator: Arc<dyn InterpolationOperator>,
}

impl RobustReferencer {
    pub fn new(config: ReferenceConfig, line_frequencies: &[f64]) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            detector: NoisyChannelDetector::new(config.noisy.clone(), line_frequencies)?,
            interpolator: Arc::new(SphericalSpline::default()),
            config,
        })
    }

    /// Use `interpolator` both for RANSAC and for bad-channel interpolation
    pub fn with_interpolator(mut self, interpolator: Arc<dyn InterpolationOperator>) -> Self {
        self.detector = self.detector.with_interpolator(interpolator.clone());
        self.interpolator = interpolator;
        self
    }

    /// Detection restricted to `evaluation`, reported over the full montage
    fn evaluate<R: Rng + ?Sized>(
        detector: &NoisyChannelDetector,
        signal: ArrayView2<f64>,
        recording: &Recording<'_>,
        evaluation: &[usize],
        evaluation_montage: &Montage,
        rng: &mut R,
    ) -> Result<BadChannelReport> {
        let subset = signal.select(Axis(0), evaluation);
        let sub = Recording::new(subset.view(), evaluation_montage, recording.sample_rate())?;
        let report = detector.detect(&sub, rng)?;
        Ok(report.expand(evaluation, recording.montage().names().to_vec()))
    }

    /// Run the loop with channel indices already resolved
    pub fn reference<R: Rng + ?Sized>(
        &self,
        recording: &Recording<'_>,
        reference_channels: &[usize],
        evaluation_channels: &[usize],
        rng: &mut R,
    ) -> Result<ReferenceOutcome> {
        let n_channels = recording.n_channels();
        if let Some(&bad) = reference_channels
            .iter()
            .chain(evaluation_channels)
            .find(|&&c| c >= n_channels)
        {
            return Err(Error::InvalidParameter(format!(
                "channel index {bad} out of range for {n_channels} channels"
            )));
        }
        if reference_channels.is_empty() || evaluation_channels.is_empty() {
            return Err(Error::InvalidParameter(
                "reference and evaluation channel sets must not be empty".into(),
            ));
        }

        let reference_set: BTreeSet<usize> = reference_channels.iter().copied().collect();
        let evaluation_set: BTreeSet<usize> = evaluation_channels.iter().copied().collect();
        if reference_set != evaluation_set {
            tracing::warn!(
                "Reference channels and evaluation channels should be the same for a robust reference"
            );
        }

        let data = recording.data();
        let names = recording.montage().names();
        let positions = recording.montage().positions();
        let evaluation: Vec<usize> = evaluation_set.into_iter().collect();
        let evaluation_montage = recording.montage().select(&evaluation);

        // INIT: seed the unusable set from the raw signal
        let seed = match Self::evaluate(
            &self.detector,
            data,
            recording,
            &evaluation,
            &evaluation_montage,
            rng,
        ) {
            Err(Error::InsufficientChannels { .. }) => {
                tracing::debug!(
                    "Too few channels for RANSAC on the raw signal; seeding without it"
                );
                Self::evaluate(
                    &self.detector.without_ransac(),
                    data,
                    recording,
                    &evaluation,
                    &evaluation_montage,
                    rng,
                )?
            }
            other => other?,
        };
        tracing::info!("Initial bad channels: {:?}", seed.bad_names());

        let unusable = seed.unusable();
        let usable_reference: Vec<usize> = reference_set
            .iter()
            .copied()
            .filter(|&c| !unusable.contains(c))
            .collect();

        let mut union = seed;
        let mut history = vec![union.all_bad()];
        let mut state = IterationState {
            iterations: 0,
            detection_passes: 1,
            previous_bad: None,
            interpolated: data.to_owned(),
            converged: false,
        };

        // ESTIMATING
        let mut reference = median_reference(data, &usable_reference);
        let mut signal = remove_reference(data, reference.view(), &unusable);

        loop {
            // EVALUATING
            let pass = match Self::evaluate(
                &self.detector,
                signal.view(),
                recording,
                &evaluation,
                &evaluation_montage,
                rng,
            ) {
                Ok(pass) => pass,
                Err(e @ Error::InsufficientChannels { .. }) => {
                    tracing::error!(
                        "Robust reference stopped after {} iterations: {}",
                        state.iterations,
                        e
                    );
                    break;
                }
                Err(e) => return Err(e),
            };
            state.detection_passes += 1;
            union.merge(&pass)?;
            let bad = union.all_bad();
            history.push(bad.clone());
            tracing::info!(
                "Bad channels after pass {}: {:?}",
                state.detection_passes,
                bad.names(names)
            );

            let unchanged = state.previous_bad.as_ref() == Some(&bad);
            if state.iterations >= 1 && (!bad.any() || unchanged) {
                state.converged = true;
                break;
            }
            if state.detection_passes > self.config.max_iterations {
                tracing::info!(
                    "Robust reference reached the iteration cap ({})",
                    self.config.max_iterations
                );
                break;
            }

            // ITERATING
            let usable = n_channels - bad.count();
            if usable < 2 {
                tracing::error!("{}", Error::TooManyBad { usable });
            }
            state.interpolated = if bad.any() && usable > 0 {
                interpolate_bad_channels(data, positions, &bad, self.interpolator.as_ref())?
            } else {
                data.to_owned()
            };
            state.previous_bad = Some(bad);

            reference = mean_reference(state.interpolated.view(), &usable_reference);
            signal = remove_reference(data, reference.view(), &unusable);
            state.iterations += 1;
            tracing::info!("Iterations: {}", state.iterations);
        }

        tracing::info!(
            "Robust reference done after {} iterations ({} detection passes, converged: {})",
            state.iterations,
            state.detection_passes,
            state.converged
        );

        Ok(ReferenceOutcome {
            report: union,
            referenced: signal,
            reference,
            iterations: state.iterations,
            detection_passes: state.detection_passes,
            history,
        })
    }
}

fn median_reference(data: ArrayView2<f64>, channels: &[usize]) -> Array1<f64> {
    if channels.is_empty() {
        tracing::error!("No usable reference channels; using a zero reference");
        return Array1::zeros(data.ncols());
    }
    data.select(Axis(0), channels)
        .axis_iter(Axis(1))
        .map(|column| median(&column.to_vec()))
        .collect()
}

fn mean_reference(data: ArrayView2<f64>, channels: &[usize]) -> Array1<f64> {
    data.select(Axis(0), channels)
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(data.ncols()))
}

/// Subtract `reference` from every channel not in `skip`
pub fn remove_reference(
    data: ArrayView2<f64>,
    reference: ArrayView1<f64>,
    skip: &ChannelMask,
) -> Array2<f64> {
    let mut out = data.to_owned();
    for (channel, mut row) in out.axis_iter_mut(Axis(0)).enumerate() {
        if !skip.contains(channel) {
            row -= &reference;
        }
    }
    out
}

/// Robust reference over named channel sets, with the RANSAC generator
/// configured by `config.noisy.ransac_seed`.
pub fn robust_reference<S: AsRef<str>>(
    recording: &Recording<'_>,
    reference_channels: &[S],
    evaluation_channels: &[S],
    line_noise_freqs: &[f64],
    config: &ReferenceConfig,
) -> Result<ReferenceOutcome> {
    let referencer = RobustReferencer::new(config.clone(), line_noise_freqs)?;
    let montage = recording.montage();
    let reference_idx = montage.indices_of(reference_channels)?;
    let evaluation_idx = montage.indices_of(evaluation_channels)?;

    let mut rng = subset_rng(config.noisy.ransac_seed);
    referencer.reference(recording, &reference_idx, &evaluation_idx, &mut rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticRecording;
    use prep_core::{fibonacci_sphere, NoisyConfig};
    use std::f64::consts::PI;

    fn config(seed: u64) -> ReferenceConfig {
        ReferenceConfig {
            max_iterations: 4,
            noisy: NoisyConfig::default().with_seed(seed),
        }
    }

    fn all_names(synthetic: &SyntheticRecording) -> Vec<String> {
        synthetic.montage.names().to_vec()
    }

    #[test]
    fn test_remove_reference_skips_unusable() {
        let data = Array2::from_shape_fn((3, 4), |(c, i)| (c * 10 + i) as f64);
        let reference = Array1::from(vec![1.0, 1.0, 2.0, 2.0]);
        let skip = ChannelMask::from_indices(3, [1]);

        let out = remove_reference(data.view(), reference.view(), &skip);
        assert_eq!(out.row(0).to_vec(), vec![-1.0, 0.0, 0.0, 1.0]);
        assert_eq!(out.row(1), data.row(1));
        assert_eq!(out.row(2).to_vec(), vec![19.0, 20.0, 20.0, 21.0]);
    }

    #[test]
    fn test_median_and_mean_reference() {
        let data = Array2::from_shape_vec((3, 2), vec![1.0, 4.0, 2.0, 5.0, 9.0, 6.0]).unwrap();
        assert_eq!(median_reference(data.view(), &[0, 1, 2]).to_vec(), vec![2.0, 5.0]);
        assert_eq!(mean_reference(data.view(), &[0, 1]).to_vec(), vec![1.5, 4.5]);
        assert_eq!(median_reference(data.view(), &[]).to_vec(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_noisy_channel_found_and_reference_recovered() {
        let mut synthetic = SyntheticRecording::new(32, 256.0, 20.0, 21);
        synthetic.replace_with_noise(11, 10.0);
        let recording = synthetic.recording();
        let names = all_names(&synthetic);

        let outcome = robust_reference(&recording, &names, &names, &[50.0], &config(21)).unwrap();

        assert_eq!(outcome.report.all_bad().indices(), vec![11]);
        assert!(outcome.iterations >= 1);
        assert_eq!(outcome.referenced.dim(), synthetic.data.dim());

        // Every channel is the original minus the same reference
        for c in 0..32 {
            for i in (0..5120).step_by(97) {
                let expected = synthetic.data[(c, i)] - outcome.reference[i];
                assert!((outcome.referenced[(c, i)] - expected).abs() < 1e-12);
            }
        }

        // The common 3 Hz rhythm dominates the reference
        let err: f64 = (0..5120)
            .map(|i| {
                let t = i as f64 / 256.0;
                (outcome.reference[i] - (2.0 * PI * 3.0 * t).sin()).powi(2)
            })
            .sum::<f64>()
            / 5120.0;
        assert!(err.sqrt() < 0.1, "reference rms error {}", err.sqrt());
    }

    #[test]
    fn test_history_never_shrinks_and_passes_are_bounded() {
        let mut synthetic = SyntheticRecording::new(32, 256.0, 12.0, 22);
        synthetic.replace_with_noise(5, 10.0);
        synthetic.replace_with_noise(27, 10.0);
        synthetic.data.row_mut(14).fill(0.0);
        let recording = synthetic.recording();
        let names = all_names(&synthetic);

        for max_iterations in 1..=4 {
            let config = ReferenceConfig {
                max_iterations,
                ..config(22)
            };
            let outcome = robust_reference(&recording, &names, &names, &[50.0], &config).unwrap();

            assert!(outcome.detection_passes <= max_iterations + 1);
            assert_eq!(outcome.history.len(), outcome.detection_passes);
            for pair in outcome.history.windows(2) {
                assert!(!pair[0].difference(&pair[1]).any());
            }
            assert_eq!(outcome.history.last(), Some(&outcome.report.all_bad()));
        }
    }

    #[test]
    fn test_unusable_channel_is_left_untouched() {
        let mut synthetic = SyntheticRecording::new(32, 256.0, 12.0, 23);
        synthetic.data.row_mut(8).fill(3.0);
        let recording = synthetic.recording();
        let names = all_names(&synthetic);

        let outcome = robust_reference(&recording, &names, &names, &[], &config(23)).unwrap();
        assert!(outcome.report.by_flat().contains(8));
        assert_eq!(outcome.referenced.row(8), synthetic.data.row(8));
    }

    #[test]
    fn test_clean_recording_converges_without_bad_channels() {
        let synthetic = SyntheticRecording::new(32, 256.0, 12.0, 24);
        let recording = synthetic.recording();
        let names = all_names(&synthetic);

        let outcome = robust_reference(&recording, &names, &names, &[50.0], &config(24)).unwrap();
        assert!(!outcome.report.all_bad().any());
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.detection_passes, 3);
    }

    #[test]
    fn test_same_seed_same_outcome() {
        let mut synthetic = SyntheticRecording::new(32, 256.0, 12.0, 25);
        synthetic.replace_with_noise(9, 10.0);
        let recording = synthetic.recording();
        let names = all_names(&synthetic);

        let a = robust_reference(&recording, &names, &names, &[50.0], &config(25)).unwrap();
        let b = robust_reference(&recording, &names, &names, &[50.0], &config(25)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_evaluation_subset_limits_flagging() {
        let mut synthetic = SyntheticRecording::new(32, 256.0, 12.0, 26);
        synthetic.replace_with_noise(0, 10.0);
        let recording = synthetic.recording();
        let reference_names = all_names(&synthetic);
        let evaluation_names: Vec<String> = reference_names[1..].to_vec();

        let outcome = robust_reference(
            &recording,
            &reference_names,
            &evaluation_names,
            &[50.0],
            &config(26),
        )
        .unwrap();
        assert!(!outcome.report.all_bad().contains(0));
        assert_eq!(outcome.report.n_channels(), 32);
    }

    #[test]
    fn test_too_few_channels_stops_gracefully() {
        let n = 500;
        let data = Array2::from_shape_fn((5, n), |(c, i)| {
            let t = i as f64 / 100.0;
            (2.0 * PI * 4.0 * t).sin() * (1.0 + 0.1 * c as f64)
        });
        let names: Vec<String> = (0..5).map(|i| format!("C{i}")).collect();
        let montage = Montage::new(names.clone(), fibonacci_sphere(5)).unwrap();
        let recording = Recording::new(data.view(), &montage, 100.0).unwrap();

        let outcome = robust_reference(&recording, &names, &names, &[], &config(27)).unwrap();
        assert_eq!(outcome.iterations, 0);
        assert_eq!(outcome.detection_passes, 1);
        assert_eq!(outcome.history.len(), outcome.detection_passes);
        assert_eq!(outcome.referenced.dim(), (5, n));
    }

    #[test]
    fn test_too_many_bad_channels_keeps_iterating() {
        for n_flat in [6, 7] {
            let mut synthetic = SyntheticRecording::new(8, 256.0, 4.0, 30);
            for c in 0..n_flat {
                synthetic.data.row_mut(c).fill(0.0);
            }
            let recording = synthetic.recording();
            let names = all_names(&synthetic);
            let config = ReferenceConfig {
                max_iterations: 4,
                noisy: NoisyConfig::default().with_seed(30).without_ransac(),
            };

            let outcome = robust_reference(&recording, &names, &names, &[], &config).unwrap();

            let bad = outcome.report.all_bad();
            assert!((0..n_flat).all(|c| outcome.report.by_flat().contains(c)));
            assert!((0..n_flat).all(|c| bad.contains(c)));
            assert!(outcome.reference.iter().all(|v| v.is_finite()));
            assert!(outcome.iterations >= 1);
            assert!(outcome.detection_passes <= config.max_iterations + 1);
            assert_eq!(outcome.history.len(), outcome.detection_passes);
        }
    }

    #[test]
    fn test_unknown_channel_rejected() {
        let synthetic = SyntheticRecording::new(8, 128.0, 2.0, 28);
        let recording = synthetic.recording();
        let names = vec!["E0".to_string(), "missing".to_string()];

        let result = robust_reference(&recording, &names, &names, &[], &config(28));
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn test_invalid_iteration_cap_rejected() {
        let synthetic = SyntheticRecording::new(8, 128.0, 2.0, 29);
        let recording = synthetic.recording();
        let names = all_names(&synthetic);
        let config = ReferenceConfig {
            max_iterations: 0,
            ..config(29)
        };

        let result = robust_reference(&recording, &names, &names, &[], &config);
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }
}
