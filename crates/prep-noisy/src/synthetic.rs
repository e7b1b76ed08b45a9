//! Seeded synthetic recordings for tests.

use ndarray::{Array1, Array2};
use prep_core::{fibonacci_sphere, Montage, Recording};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::f64::consts::PI;

/// Lowest and highest frequency of the spatial sources, and their spacing
const SOURCE_BAND: (f64, f64) = (1.0, 20.0);
const SOURCE_STEP: f64 = 0.25;
const COMMON_HZ: f64 = 3.0;

/// Spatially smooth multichannel signal on a spherical montage.
///
/// Every channel carries a global 3 Hz rhythm plus `p · v(t)`, where `p` is
/// the sensor position and `v` holds three independent band-limited random
/// sources of equal power. Channels therefore look alike statistically with
/// or without the common rhythm. Each channel also gets its own gain and a
/// little independent white noise.
pub struct SyntheticRecording {
    pub data: Array2<f64>,
    pub montage: Montage,
    pub sample_rate: f64,
    rng: ChaCha8Rng,
}

/// Uniform white noise with standard deviation `sd`
fn white_noise(rng: &mut ChaCha8Rng, sd: f64) -> f64 {
    let half_width = sd * 3.0_f64.sqrt();
    rng.gen_range(-half_width..half_width)
}

/// Three unit-variance sources, each a sum of random-phase sinusoids on a
/// disjoint share of the source band
fn spatial_sources(
    rng: &mut ChaCha8Rng,
    n_samples: usize,
    sample_rate: f64,
) -> [Array1<f64>; 3] {
    let (low, high) = SOURCE_BAND;
    let steps = ((high - low) / SOURCE_STEP).round() as usize;
    let mut freqs: Vec<f64> = (0..=steps)
        .map(|k| low + k as f64 * SOURCE_STEP)
        .filter(|&f| (f - COMMON_HZ).abs() > 1e-9)
        .collect();
    freqs.shuffle(rng);

    std::array::from_fn(|source| {
        let share: Vec<(f64, f64)> = freqs
            .iter()
            .skip(source)
            .step_by(3)
            .map(|&f| (f, rng.gen_range(0.0..2.0 * PI)))
            .collect();
        let amplitude = (2.0 / share.len() as f64).sqrt();
        Array1::from_shape_fn(n_samples, |i| {
            let t = i as f64 / sample_rate;
            share
                .iter()
                .map(|&(f, phase)| (2.0 * PI * f * t + phase).sin())
                .sum::<f64>()
                * amplitude
        })
    })
}

impl SyntheticRecording {
    pub fn new(n_channels: usize, sample_rate: f64, seconds: f64, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let positions = fibonacci_sphere(n_channels);
        let names: Vec<String> = (0..n_channels).map(|i| format!("E{i}")).collect();
        let n_samples = (seconds * sample_rate).round() as usize;

        let sources = spatial_sources(&mut rng, n_samples, sample_rate);
        let mut data = Array2::zeros((n_channels, n_samples));
        for (c, position) in positions.iter().enumerate() {
            let gain = rng.gen_range(0.85..1.15);
            let noise_sd = 0.02 * rng.gen_range(0.75..1.25);
            for i in 0..n_samples {
                let t = i as f64 / sample_rate;
                let spatial = position.x * sources[0][i]
                    + position.y * sources[1][i]
                    + position.z * sources[2][i];
                let clean = (2.0 * PI * COMMON_HZ * t).sin() + 0.5 * spatial;
                data[(c, i)] = gain * (clean + white_noise(&mut rng, noise_sd));
            }
        }

        let montage = Montage::new(names, positions).unwrap();

        Self {
            data,
            montage,
            sample_rate,
            rng,
        }
    }

    /// Replace `channel` with white noise `factor` times the typical channel amplitude
    pub fn replace_with_noise(&mut self, channel: usize, factor: f64) {
        let sd = factor * 0.8;
        for value in self.data.row_mut(channel).iter_mut() {
            *value = white_noise(&mut self.rng, sd);
        }
    }

    pub fn recording(&self) -> Recording<'_> {
        Recording::new(self.data.view(), &self.montage, self.sample_rate).unwrap()
    }
}
