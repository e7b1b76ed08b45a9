//! Spatial interpolation between sensor positions.
//!
//! Channels are projected onto the unit sphere and interpolated with
//! spherical splines (Perrin et al., 1989):
//!
//! g(x) = 1/(4π) Σ_{n=1}^{N} (2n + 1) / (n^m (n + 1)^m) · P_n(x)
//!
//! where x is the cosine of the angle between two sensors, P_n the Legendre
//! polynomial of degree n and m the spline stiffness.

use nalgebra::DMatrix;
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{ChannelMask, Position3D};

/// Builds a linear operator predicting signals at `targets` from signals at `sources`.
pub trait InterpolationOperator: Send + Sync {
    /// Returns a `targets.len() x sources.len()` matrix
    fn operator(&self, sources: &[Position3D], targets: &[Position3D]) -> Result<Array2<f64>>;
}

/// Spherical spline interpolation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SphericalSpline {
    /// Spline order m
    pub stiffness: i32,
    /// Number of Legendre terms in the series
    pub n_terms: usize,
    /// Ridge added to the diagonal of the source system
    pub regularization: f64,
}

impl Default for SphericalSpline {
    fn default() -> Self {
        Self {
            stiffness: 4,
            n_terms: 50,
            regularization: 1e-5,
        }
    }
}

impl SphericalSpline {
    pub fn new() -> Self {
        Self::default()
    }

    fn series_coefficients(&self) -> Vec<f64> {
        let four_pi = 4.0 * std::f64::consts::PI;
        let mut coefficients = vec![0.0; self.n_terms + 1];
        for (n, c) in coefficients.iter_mut().enumerate().skip(1) {
            let nf = n as f64;
            *c = (2.0 * nf + 1.0)
                / (nf.powi(self.stiffness) * (nf + 1.0).powi(self.stiffness) * four_pi);
        }
        coefficients
    }

    /// Evaluate the Legendre series at `x` via the three-term recurrence
    fn g(coefficients: &[f64], x: f64) -> f64 {
        let x = x.clamp(-1.0, 1.0);
        let mut p_prev = 1.0;
        let mut p = x;
        let mut sum = 0.0;
        for (n, &c) in coefficients.iter().enumerate().skip(1) {
            sum += c * p;
            let nf = n as f64;
            let p_next = ((2.0 * nf + 1.0) * x * p - nf * p_prev) / (nf + 1.0);
            p_prev = p;
            p = p_next;
        }
        sum
    }
}

fn unit_vectors(positions: &[Position3D]) -> Result<Vec<nalgebra::Vector3<f64>>> {
    positions
        .iter()
        .map(|p| {
            let norm = p.norm();
            if norm < 1e-12 {
                Err(Error::Interpolation(
                    "sensor located at the sphere origin".into(),
                ))
            } else {
                Ok(p.to_nalgebra() / norm)
            }
        })
        .collect()
}

impl InterpolationOperator for SphericalSpline {
    fn operator(&self, sources: &[Position3D], targets: &[Position3D]) -> Result<Array2<f64>> {
        if sources.is_empty() {
            return Err(Error::Interpolation("no source channels".into()));
        }

        let from = unit_vectors(sources)?;
        let to = unit_vectors(targets)?;
        let coefficients = self.series_coefficients();
        let n_from = from.len();

        // Source system augmented with a constant term:
        // [ G + αI  1 ] [c ]   [v]
        // [ 1ᵀ      0 ] [c0] = [0]
        let mut system = DMatrix::<f64>::zeros(n_from + 1, n_from + 1);
        for i in 0..n_from {
            for j in 0..n_from {
                system[(i, j)] = Self::g(&coefficients, from[i].dot(&from[j]));
            }
            system[(i, i)] += self.regularization;
            system[(i, n_from)] = 1.0;
            system[(n_from, i)] = 1.0;
        }

        let inverse = system.pseudo_inverse(1e-12).map_err(|e| {
            tracing::error!(
                "Spherical spline system for {} sources not invertible: {}",
                n_from,
                e
            );
            Error::Interpolation(e.to_string())
        })?;

        let mut target_basis = DMatrix::<f64>::zeros(to.len(), n_from + 1);
        for (t, target) in to.iter().enumerate() {
            for (s, source) in from.iter().enumerate() {
                target_basis[(t, s)] = Self::g(&coefficients, target.dot(source));
            }
            target_basis[(t, n_from)] = 1.0;
        }

        let op = target_basis * inverse.columns(0, n_from);
        Ok(Array2::from_shape_fn((to.len(), n_from), |(i, j)| op[(i, j)]))
    }
}

/// Replace the rows of `bad` channels with predictions from the remaining channels.
///
/// Good channels are copied unchanged.
pub fn interpolate_bad_channels(
    data: ArrayView2<f64>,
    positions: &[Position3D],
    bad: &ChannelMask,
    interpolator: &dyn InterpolationOperator,
) -> Result<Array2<f64>> {
    let mut out = data.to_owned();
    if !bad.any() {
        return Ok(out);
    }

    let good = bad.complement().indices();
    if good.is_empty() {
        tracing::warn!(
            "All {} channels are bad; nothing to interpolate from",
            bad.n_channels()
        );
        return Err(Error::Interpolation("no good channels to interpolate from".into()));
    }
    let bad_idx = bad.indices();
    tracing::debug!(
        "Interpolating {} bad channels from {} good channels",
        bad_idx.len(),
        good.len()
    );

    let source_pos: Vec<Position3D> = good.iter().map(|&i| positions[i]).collect();
    let target_pos: Vec<Position3D> = bad_idx.iter().map(|&i| positions[i]).collect();
    let op = interpolator.operator(&source_pos, &target_pos)?;

    let sources = data.select(ndarray::Axis(0), &good);
    let predicted = op.dot(&sources);
    for (row, &channel) in bad_idx.iter().enumerate() {
        out.row_mut(channel).assign(&predicted.row(row));
    }

    Ok(out)
}

/// `n` points spread evenly over the unit sphere (Fibonacci lattice)
pub fn fibonacci_sphere(n: usize) -> Vec<Position3D> {
    let golden = std::f64::consts::PI * (3.0 - 5.0_f64.sqrt());
    (0..n)
        .map(|i| {
            let z = 1.0 - 2.0 * (i as f64 + 0.5) / n as f64;
            let r = (1.0 - z * z).sqrt();
            let theta = golden * i as f64;
            Position3D::new(r * theta.cos(), r * theta.sin(), z)
        })
        .collect()
}
