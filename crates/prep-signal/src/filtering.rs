//! Zero-phase filters used ahead of channel-quality analysis.

use ndarray::{Array2, ArrayView2, Axis};
use num_complex::Complex;
use rustfft::FftPlanner;

/// Second-order IIR section (normalized so that a0 = 1)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Biquad {
    b: [f64; 3],
    a: [f64; 3],
}

impl Biquad {
    fn from_raw(b: [f64; 3], a: [f64; 3]) -> Self {
        let a0 = a[0];
        Self {
            b: [b[0] / a0, b[1] / a0, b[2] / a0],
            a: [1.0, a[1] / a0, a[2] / a0],
        }
    }

    /// Notch centred on `freq` with -3 dB bandwidth `width` (both Hz)
    pub fn notch(freq: f64, width: f64, sample_rate: f64) -> Self {
        let omega = 2.0 * std::f64::consts::PI * freq / sample_rate;
        let q = freq / width;
        let alpha = omega.sin() / (2.0 * q);
        let cos = omega.cos();

        Self::from_raw(
            [1.0, -2.0 * cos, 1.0],
            [1.0 + alpha, -2.0 * cos, 1.0 - alpha],
        )
    }

    /// Second-order Butterworth high-pass
    pub fn highpass(cutoff: f64, sample_rate: f64) -> Self {
        let omega = 2.0 * std::f64::consts::PI * cutoff / sample_rate;
        let alpha = omega.sin() / std::f64::consts::SQRT_2;
        let cos = omega.cos();

        Self::from_raw(
            [(1.0 + cos) / 2.0, -(1.0 + cos), (1.0 + cos) / 2.0],
            [1.0 + alpha, -2.0 * cos, 1.0 - alpha],
        )
    }

    pub fn dc_gain(&self) -> f64 {
        self.b.iter().sum::<f64>() / self.a.iter().sum::<f64>()
    }

    /// Causal filtering (transposed direct form II, zero initial state)
    pub fn filter(&self, signal: &[f64]) -> Vec<f64> {
        let [b0, b1, b2] = self.b;
        let [_, a1, a2] = self.a;
        let mut z1 = 0.0;
        let mut z2 = 0.0;

        signal
            .iter()
            .map(|&x| {
                let y = b0 * x + z1;
                z1 = b1 * x - a1 * y + z2;
                z2 = b2 * x - a2 * y;
                y
            })
            .collect()
    }

    /// Forward-backward filtering with odd reflection padding of `pad` samples
    pub fn filtfilt(&self, signal: &[f64], pad: usize) -> Vec<f64> {
        zero_phase(signal, pad, self.dc_gain(), |x| self.filter(x))
    }
}

/// Finite impulse response filter
#[derive(Debug, Clone, PartialEq)]
pub struct FirFilter {
    taps: Vec<f64>,
}

impl FirFilter {
    pub fn new(taps: Vec<f64>) -> Self {
        Self { taps }
    }

    /// Low-pass designed by frequency sampling.
    ///
    /// `pass_edge` and `stop_edge` are fractions of Nyquist. The amplitude
    /// grid (nfft = max(512, next power of two of `order`)) falls from 1 to 0
    /// between the edges along a monotone cubic, is given linear phase,
    /// inverted, truncated to `order + 1` taps and Hamming windowed.
    pub fn lowpass_frequency_sampling(order: usize, pass_edge: f64, stop_edge: f64) -> Self {
        let nfft = order.next_power_of_two().max(512);
        let pass = (nfft as f64 * pass_edge).round() as usize;
        let stop = ((nfft as f64 * stop_edge).round() as usize).max(pass + 1);

        let amplitude = |k: usize| -> f64 {
            if k <= pass {
                1.0
            } else if k >= stop {
                0.0
            } else {
                let t = (k - pass) as f64 / (stop - pass) as f64;
                1.0 - t * t * (3.0 - 2.0 * t)
            }
        };

        let half: Vec<Complex<f64>> = (0..=nfft)
            .map(|k| {
                let phase = -0.5 * order as f64 * std::f64::consts::PI * k as f64 / nfft as f64;
                Complex::from_polar(amplitude(k), phase)
            })
            .collect();

        let n = 2 * nfft;
        let mut spectrum: Vec<Complex<f64>> = Vec::with_capacity(n);
        spectrum.extend_from_slice(&half);
        spectrum.extend((nfft + 1..n).map(|i| half[n - i].conj()));

        let mut planner = FftPlanner::new();
        planner.plan_fft_inverse(n).process(&mut spectrum);

        let taps = (0..=order)
            .map(|k| {
                let hamming = if order == 0 {
                    1.0
                } else {
                    0.54 - 0.46 * (2.0 * std::f64::consts::PI * k as f64 / order as f64).cos()
                };
                spectrum[k].re / n as f64 * hamming
            })
            .collect();

        Self { taps }
    }

    pub fn taps(&self) -> &[f64] {
        &self.taps
    }

    pub fn dc_gain(&self) -> f64 {
        self.taps.iter().sum()
    }

    /// Causal convolution with zero initial state
    pub fn filter(&self, signal: &[f64]) -> Vec<f64> {
        (0..signal.len())
            .map(|i| {
                self.taps
                    .iter()
                    .take(i + 1)
                    .enumerate()
                    .map(|(k, &h)| h * signal[i - k])
                    .sum()
            })
            .collect()
    }

    /// Forward-backward filtering with the default padding of three filter lengths
    pub fn filtfilt(&self, signal: &[f64]) -> Vec<f64> {
        let pad = 3 * self.taps.len();
        zero_phase(signal, pad, self.dc_gain(), |x| self.filter(x))
    }
}

/// Odd extension: `2·x[0] - x[pad..1]` before and `2·x[n-1] - x[n-2..n-1-pad]` after
fn odd_extend(signal: &[f64], pad: usize) -> Vec<f64> {
    let n = signal.len();
    let first = signal[0];
    let last = signal[n - 1];

    let mut out = Vec::with_capacity(n + 2 * pad);
    out.extend((1..=pad).rev().map(|i| 2.0 * first - signal[i]));
    out.extend_from_slice(signal);
    out.extend((1..=pad).map(|i| 2.0 * last - signal[n - 1 - i]));
    out
}

/// Run `filter` forward then backward over an odd-extended copy of `signal`.
///
/// The extended signal is offset by its first sample so the filter starts
/// from rest; the offset is restored through the filter's DC gain.
fn zero_phase<F>(signal: &[f64], pad: usize, dc_gain: f64, filter: F) -> Vec<f64>
where
    F: Fn(&[f64]) -> Vec<f64>,
{
    let n = signal.len();
    if n < 2 {
        return signal.to_vec();
    }
    let pad = pad.min(n - 1);

    let extended = odd_extend(signal, pad);
    let offset = extended[0];
    let shifted: Vec<f64> = extended.iter().map(|&x| x - offset).collect();

    let mut forward = filter(&shifted);
    forward.reverse();
    let back_offset = forward[0];
    let shifted_back: Vec<f64> = forward.iter().map(|&x| x - back_offset).collect();
    let mut backward = filter(&shifted_back);
    backward.reverse();

    // Restore the offsets removed on each pass
    let restored = offset * dc_gain * dc_gain + back_offset * dc_gain;
    backward[pad..pad + n].iter().map(|&y| y + restored).collect()
}

/// Band-limit every channel with the high-frequency reference low-pass:
/// order 100, pass band up to 0.36 and stop band from 0.40 of Nyquist.
pub fn band_limit(data: ArrayView2<f64>) -> Array2<f64> {
    let kernel = FirFilter::lowpass_frequency_sampling(100, 0.36, 0.40);
    apply_rows(data, |row| kernel.filtfilt(row))
}

/// Apply a per-channel transform to every row
pub fn apply_rows<F>(data: ArrayView2<f64>, f: F) -> Array2<f64>
where
    F: Fn(&[f64]) -> Vec<f64>,
{
    let mut out = Array2::zeros(data.raw_dim());
    for (src, mut dst) in data.axis_iter(Axis(0)).zip(out.axis_iter_mut(Axis(0))) {
        let row = src.to_vec();
        let filtered = f(&row);
        dst.iter_mut().zip(filtered).for_each(|(d, v)| *d = v);
    }
    out
}
