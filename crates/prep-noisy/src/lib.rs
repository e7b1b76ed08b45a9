//! # Prep-Noisy
//!
//! Noisy-channel detection and robust referencing for multichannel
//! biosignal recordings.
//!
//! ## Detection pass
//!
//! 1. **Conditioning**: detrend and line-noise removal
//! 2. **NaN / flat**: channels excluded from every later criterion
//! 3. **Deviation**: robust z-score of amplitude dispersion
//! 4. **High-frequency noise**: robust z-score of the noise-to-signal ratio
//! 5. **Correlation / dropout**: windowed inter-channel correlation
//! 6. **RANSAC**: windowed correlation with a consensus spatial prediction
//!
//! [`robust_reference`] repeats the pass on re-referenced data until the
//! bad-channel set stops growing.

pub mod criteria;
pub mod detector;
pub mod ransac;
pub mod reference;

#[cfg(test)]
mod synthetic;

pub use detector::{detect_noisy_channels, subset_rng, ChannelScores, NoisyChannelDetector};
pub use ransac::RansacPredictor;
pub use reference::{remove_reference, robust_reference, ReferenceOutcome, RobustReferencer};
