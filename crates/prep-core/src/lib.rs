//! # Prep-Core
//!
//! Core types and utilities for noisy-channel detection and robust
//! referencing of multichannel biosignal recordings.
//!
//! - [`types`]: recordings, montages, per-criterion channel masks and reports
//! - [`stats`]: robust dispersion, z-scores, quantiles and correlation
//! - [`geometry`]: spherical-spline interpolation between sensor positions
//! - [`config`]: detection and referencing options

pub mod config;
pub mod error;
pub mod geometry;
pub mod stats;
pub mod types;

pub use config::*;
pub use error::{Error, Result};
pub use geometry::*;
pub use types::*;
