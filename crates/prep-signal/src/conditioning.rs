//! Signal conditioning ahead of channel-quality analysis.
//!
//! Conditioning removes components that would bias every criterion equally:
//!
//! 1. **High-pass** (optional): slow drifts below the cutoff
//! 2. **Linear trend**: per-channel least-squares line
//! 3. **Line noise**: notch at each mains frequency below Nyquist
//!
//! The output always has the input's shape and channel order.

use ndarray::{Array2, ArrayView2};
use prep_core::{Error, NoisyConfig, Result};

use crate::filtering::{apply_rows, Biquad};

/// Detrend + line-noise removal, with an optional high-pass stage
#[derive(Debug, Clone, PartialEq)]
pub struct SignalConditioner {
    /// Frequencies to notch out (Hz)
    pub line_frequencies: Vec<f64>,

    /// -3 dB width of each notch (Hz)
    pub notch_width_hz: f64,

    /// High-pass cutoff applied before detrending (Hz)
    pub highpass_hz: Option<f64>,
}

impl SignalConditioner {
    pub fn new(line_frequencies: &[f64]) -> Self {
        Self {
            line_frequencies: line_frequencies.to_vec(),
            notch_width_hz: 1.0,
            highpass_hz: None,
        }
    }

    pub fn from_config(line_frequencies: &[f64], config: &NoisyConfig) -> Self {
        Self {
            line_frequencies: line_frequencies.to_vec(),
            notch_width_hz: config.notch_width_hz,
            highpass_hz: config.highpass_hz,
        }
    }

    pub fn with_highpass(mut self, cutoff_hz: f64) -> Self {
        self.highpass_hz = Some(cutoff_hz);
        self
    }

    pub fn with_notch_width(mut self, width_hz: f64) -> Self {
        self.notch_width_hz = width_hz;
        self
    }

    fn validate(&self, sample_rate: f64) -> Result<()> {
        if !sample_rate.is_finite() || sample_rate <= 0.0 {
            return Err(Error::InvalidParameter(format!(
                "sample rate must be positive, got {sample_rate}"
            )));
        }
        if !self.notch_width_hz.is_finite() || self.notch_width_hz <= 0.0 {
            return Err(Error::InvalidParameter(format!(
                "notch width must be positive, got {}",
                self.notch_width_hz
            )));
        }
        if let Some(&f) = self
            .line_frequencies
            .iter()
            .find(|f| !f.is_finite() || **f <= 0.0)
        {
            return Err(Error::InvalidParameter(format!(
                "line frequency must be positive, got {f}"
            )));
        }
        if let Some(hz) = self.highpass_hz {
            if !hz.is_finite() || hz <= 0.0 || hz >= sample_rate / 2.0 {
                return Err(Error::InvalidParameter(format!(
                    "high-pass cutoff must lie in (0, Nyquist), got {hz}"
                )));
            }
        }
        Ok(())
    }

    /// Condition a channel-by-sample matrix
    pub fn condition(&self, data: ArrayView2<f64>, sample_rate: f64) -> Result<Array2<f64>> {
        self.validate(sample_rate)?;

        let nyquist = sample_rate / 2.0;
        let notches: Vec<Biquad> = self
            .line_frequencies
            .iter()
            .filter_map(|&f| {
                if f >= nyquist {
                    tracing::debug!("Skipping line frequency {} Hz at or above Nyquist", f);
                    None
                } else {
                    Some(Biquad::notch(f, self.notch_width_hz, sample_rate))
                }
            })
            .collect();
        let notch_pad = (3.0 * sample_rate / self.notch_width_hz).ceil() as usize;
        let highpass = self
            .highpass_hz
            .map(|hz| (Biquad::highpass(hz, sample_rate), (3.0 * sample_rate / hz).ceil() as usize));

        Ok(apply_rows(data, |row| {
            let mut channel = match &highpass {
                Some((filter, pad)) => filter.filtfilt(row, *pad),
                None => row.to_vec(),
            };
            remove_linear_trend(&mut channel);
            for notch in &notches {
                channel = notch.filtfilt(&channel, notch_pad);
            }
            channel
        }))
    }
}

/// Remove the least-squares line y = mx + b from `signal`
pub fn remove_linear_trend(signal: &mut [f64]) {
    if signal.len() < 2 {
        return;
    }

    let n = signal.len() as f64;
    let x_mean = (n - 1.0) / 2.0;
    let y_mean: f64 = signal.iter().sum::<f64>() / n;

    let mut numerator = 0.0;
    let mut denominator = 0.0;

    for (i, &y) in signal.iter().enumerate() {
        let x = i as f64;
        numerator += (x - x_mean) * (y - y_mean);
        denominator += (x - x_mean).powi(2);
    }

    let slope = numerator / denominator;
    let intercept = y_mean - slope * x_mean;

    for (i, y) in signal.iter_mut().enumerate() {
        *y -= slope * i as f64 + intercept;
    }
}

/// Every multiple of `base` strictly below Nyquist
pub fn line_harmonics(base: f64, sample_rate: f64) -> Vec<f64> {
    if base <= 0.0 || sample_rate <= 0.0 {
        return Vec::new();
    }
    let nyquist = sample_rate / 2.0;
    (1..)
        .map(|k| base * k as f64)
        .take_while(|&f| f < nyquist)
        .collect()
}
