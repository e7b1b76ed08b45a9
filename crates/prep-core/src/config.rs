//! Detection and referencing configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Options for a single noisy-channel detection pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoisyConfig {
    /// Robust dispersion / standard deviation below which a channel is flat
    pub flat_threshold: f64,

    /// |z| above which a channel is bad by deviation
    pub deviation_z_threshold: f64,

    /// z above which a channel is bad by high-frequency noise
    pub hf_noise_z_threshold: f64,

    /// The high-frequency test is skipped at or below this sample rate (Hz)
    pub hf_min_sample_rate: f64,

    /// Window length of the correlation test (seconds)
    pub correlation_window_seconds: f64,

    /// Quantile of absolute inter-channel correlations used as window score
    pub correlation_quantile: f64,

    /// Window score below which a window counts as badly correlated
    pub correlation_threshold: f64,

    /// Fraction of bad windows above which a channel is flagged
    pub bad_fraction_threshold: f64,

    /// Run the RANSAC prediction test
    pub ransac_enabled: bool,

    /// Number of random channel subsets
    pub ransac_sample_count: usize,

    /// Fraction of the good pool used to predict all channels
    pub ransac_good_fraction: f64,

    /// Window correlation below which a RANSAC window counts as bad
    pub ransac_corr_threshold: f64,

    /// Fraction of bad RANSAC windows above which a channel is flagged
    pub ransac_bad_window_fraction: f64,

    /// Window length of the RANSAC correlation test (seconds)
    pub ransac_window_seconds: f64,

    /// Seed for the RANSAC subset generator; `None` seeds from entropy
    pub ransac_seed: Option<u64>,

    /// Width of each line-noise notch (Hz)
    pub notch_width_hz: f64,

    /// Optional high-pass cutoff applied before detrending (Hz)
    pub highpass_hz: Option<f64>,
}

impl Default for NoisyConfig {
    fn default() -> Self {
        Self {
            flat_threshold: 1e-10,
            deviation_z_threshold: 5.0,
            hf_noise_z_threshold: 5.0,
            hf_min_sample_rate: 100.0,
            correlation_window_seconds: 1.0,
            correlation_quantile: 0.98,
            correlation_threshold: 0.4,
            bad_fraction_threshold: 0.01,
            ransac_enabled: true,
            ransac_sample_count: 50,
            ransac_good_fraction: 0.25,
            ransac_corr_threshold: 0.75,
            ransac_bad_window_fraction: 0.4,
            ransac_window_seconds: 4.0,
            ransac_seed: None,
            notch_width_hz: 1.0,
            highpass_hz: None,
        }
    }
}

fn check(ok: bool, message: impl FnOnce() -> String) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidParameter(message()))
    }
}

fn check_positive(name: &str, value: f64) -> Result<()> {
    check(value.is_finite() && value > 0.0, || {
        format!("{name} must be positive and finite, got {value}")
    })
}

fn check_fraction(name: &str, value: f64) -> Result<()> {
    check(value.is_finite() && (0.0..=1.0).contains(&value), || {
        format!("{name} must lie in [0, 1], got {value}")
    })
}

impl NoisyConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.ransac_seed = Some(seed);
        self
    }

    pub fn without_ransac(mut self) -> Self {
        self.ransac_enabled = false;
        self
    }

    pub fn validate(&self) -> Result<()> {
        check(self.flat_threshold.is_finite() && self.flat_threshold >= 0.0, || {
            format!("flat_threshold must be non-negative, got {}", self.flat_threshold)
        })?;
        check_positive("deviation_z_threshold", self.deviation_z_threshold)?;
        check_positive("hf_noise_z_threshold", self.hf_noise_z_threshold)?;
        check_positive("hf_min_sample_rate", self.hf_min_sample_rate)?;
        check_positive("correlation_window_seconds", self.correlation_window_seconds)?;
        check_fraction("correlation_quantile", self.correlation_quantile)?;
        check_fraction("correlation_threshold", self.correlation_threshold)?;
        check_fraction("bad_fraction_threshold", self.bad_fraction_threshold)?;
        check(self.ransac_sample_count > 0, || {
            "ransac_sample_count must be at least 1".to_string()
        })?;
        check(
            self.ransac_good_fraction.is_finite()
                && self.ransac_good_fraction > 0.0
                && self.ransac_good_fraction <= 1.0,
            || {
                format!(
                    "ransac_good_fraction must lie in (0, 1], got {}",
                    self.ransac_good_fraction
                )
            },
        )?;
        check(
            self.ransac_corr_threshold.is_finite() && self.ransac_corr_threshold.abs() <= 1.0,
            || {
                format!(
                    "ransac_corr_threshold must lie in [-1, 1], got {}",
                    self.ransac_corr_threshold
                )
            },
        )?;
        check_fraction("ransac_bad_window_fraction", self.ransac_bad_window_fraction)?;
        check_positive("ransac_window_seconds", self.ransac_window_seconds)?;
        check_positive("notch_width_hz", self.notch_width_hz)?;
        if let Some(hz) = self.highpass_hz {
            check_positive("highpass_hz", hz)?;
        }
        Ok(())
    }
}

/// Options for the robust-reference loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    /// Cap on re-estimation iterations
    pub max_iterations: usize,

    /// Detector options used on every pass
    pub noisy: NoisyConfig,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            max_iterations: 4,
            noisy: NoisyConfig::default(),
        }
    }
}

impl ReferenceConfig {
    pub fn validate(&self) -> Result<()> {
        check(self.max_iterations >= 1, || {
            "max_iterations must be at least 1".to_string()
        })?;
        self.noisy.validate()
    }
}

/// Complete preprocessing configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PrepConfig {
    /// Line-noise frequencies to notch out (Hz)
    pub line_frequencies: Vec<f64>,

    pub reference: ReferenceConfig,
}

impl PrepConfig {
    /// Load configuration from file, overridable by `PREP_`-prefixed environment variables
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("PREP").separator("__"))
            .build()?;

        let parsed: Self = settings.try_deserialize()?;
        parsed.validate()?;
        tracing::info!("Loaded preprocessing configuration from {}", path);
        Ok(parsed)
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("PREP").separator("__"))
            .build()?;

        let parsed: Self = settings.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn validate(&self) -> Result<()> {
        for &f in &self.line_frequencies {
            check_positive("line frequency", f)?;
        }
        self.reference.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = PrepConfig::default();
        assert_eq!(config.reference.max_iterations, 4);
        assert_eq!(config.reference.noisy.ransac_sample_count, 50);
        assert_eq!(config.reference.noisy.ransac_good_fraction, 0.25);
        assert_eq!(config.reference.noisy.correlation_threshold, 0.4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = NoisyConfig::default();
        config.ransac_good_fraction = 0.0;
        assert!(matches!(config.validate(), Err(Error::InvalidParameter(_))));

        let mut config = NoisyConfig::default();
        config.correlation_window_seconds = -1.0;
        assert!(matches!(config.validate(), Err(Error::InvalidParameter(_))));

        let config = ReferenceConfig {
            max_iterations: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidParameter(_))));

        let config = PrepConfig {
            line_frequencies: vec![0.0],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn test_from_file_with_partial_overrides() {
        let path = std::env::temp_dir().join(format!("prep_config_{}.json", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"{{ "line_frequencies": [50.0, 100.0], "reference": {{ "max_iterations": 2, "noisy": {{ "ransac_seed": 7 }} }} }}"#
        )
        .unwrap();

        let config = PrepConfig::from_file(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.line_frequencies, vec![50.0, 100.0]);
        assert_eq!(config.reference.max_iterations, 2);
        assert_eq!(config.reference.noisy.ransac_seed, Some(7));
        assert_eq!(config.reference.noisy.ransac_window_seconds, 4.0);
    }
}
