//! # Prep-Signal
//!
//! Signal conditioning for multichannel biosignal recordings.
//!
//! ## Stages
//!
//! 1. **High-pass** (optional): second-order Butterworth, zero phase
//! 2. **Detrend**: per-channel linear trend removal
//! 3. **Line noise**: zero-phase notch at each mains frequency
//!
//! The [`filtering`] module also provides the band-limiting low-pass that
//! separates high-frequency noise from the physiological band.

pub mod conditioning;
pub mod filtering;

pub use conditioning::*;
pub use filtering::*;
