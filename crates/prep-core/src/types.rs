//! Fundamental types shared by the detection and referencing stages.

use std::collections::HashSet;
use std::fmt;

use nalgebra::Vector3;
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// 3D sensor position (head coordinates, any consistent unit)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position3D {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position3D {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn origin() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn to_nalgebra(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }

    pub fn norm(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn distance_to(&self, other: &Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Ordered channel identifiers with one 3D position per channel.
///
/// Owned by the caller (a montage/metadata collaborator); the detection
/// stages only ever borrow it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Montage {
    names: Vec<String>,
    positions: Vec<Position3D>,
}

impl Montage {
    pub fn new(names: Vec<String>, positions: Vec<Position3D>) -> Result<Self> {
        if names.len() != positions.len() {
            return Err(Error::ShapeMismatch {
                expected: names.len(),
                actual: positions.len(),
            });
        }

        let mut seen = HashSet::with_capacity(names.len());
        for name in &names {
            if !seen.insert(name.as_str()) {
                return Err(Error::DuplicateChannel(name.clone()));
            }
        }

        if let Some(i) = positions.iter().position(|p| !p.is_finite()) {
            return Err(Error::InvalidParameter(format!(
                "channel {} has a non-finite position",
                names[i]
            )));
        }

        Ok(Self { names, positions })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn positions(&self) -> &[Position3D] {
        &self.positions
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Resolve channel names to indices, failing on the first unknown name
    pub fn indices_of<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<usize>> {
        names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                self.index_of(name).ok_or_else(|| {
                    Error::InvalidParameter(format!("unknown channel: {name}"))
                })
            })
            .collect()
    }

    /// Sub-montage restricted to `indices`, in the given order
    pub fn select(&self, indices: &[usize]) -> Montage {
        Montage {
            names: indices.iter().map(|&i| self.names[i].clone()).collect(),
            positions: indices.iter().map(|&i| self.positions[i]).collect(),
        }
    }
}

/// A channel-by-sample recording borrowed from the caller.
#[derive(Debug, Clone, Copy)]
pub struct Recording<'a> {
    data: ArrayView2<'a, f64>,
    montage: &'a Montage,
    sample_rate: f64,
}

impl<'a> Recording<'a> {
    pub fn new(data: ArrayView2<'a, f64>, montage: &'a Montage, sample_rate: f64) -> Result<Self> {
        if !sample_rate.is_finite() || sample_rate <= 0.0 {
            return Err(Error::InvalidParameter(format!(
                "sample rate must be positive, got {sample_rate}"
            )));
        }
        if data.nrows() != montage.len() {
            return Err(Error::ShapeMismatch {
                expected: montage.len(),
                actual: data.nrows(),
            });
        }

        Ok(Self {
            data,
            montage,
            sample_rate,
        })
    }

    pub fn data(&self) -> ArrayView2<'a, f64> {
        self.data
    }

    pub fn montage(&self) -> &'a Montage {
        self.montage
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn n_channels(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_samples(&self) -> usize {
        self.data.ncols()
    }

    pub fn duration_secs(&self) -> f64 {
        self.n_samples() as f64 / self.sample_rate
    }
}

/// Detection criteria, one mask each in a [`BadChannelReport`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Criterion {
    /// Any missing (NaN) sample
    Nan,
    /// Robust dispersion or standard deviation below the flat threshold
    Flat,
    /// Amplitude dispersion is a robust outlier
    Deviation,
    /// High-frequency to low-frequency ratio is a robust outlier
    HfNoise,
    /// Too many windows with low maximal correlation
    Correlation,
    /// Too many windows where the quality score is undefined
    Dropout,
    /// Too many windows poorly predicted from spatial neighbours
    Ransac,
}

impl Criterion {
    pub const COUNT: usize = 7;

    pub const ALL: [Criterion; Criterion::COUNT] = [
        Criterion::Nan,
        Criterion::Flat,
        Criterion::Deviation,
        Criterion::HfNoise,
        Criterion::Correlation,
        Criterion::Dropout,
        Criterion::Ransac,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Criterion::Nan => "bad_by_nan",
            Criterion::Flat => "bad_by_flat",
            Criterion::Deviation => "bad_by_deviation",
            Criterion::HfNoise => "bad_by_hf_noise",
            Criterion::Correlation => "bad_by_correlation",
            Criterion::Dropout => "bad_by_dropout",
            Criterion::Ransac => "bad_by_ransac",
        }
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of channel indices flagged by one criterion, stored as a bitset
/// over all channels of a recording.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelMask {
    bits: Vec<bool>,
}

impl ChannelMask {
    pub fn none(n_channels: usize) -> Self {
        Self {
            bits: vec![false; n_channels],
        }
    }

    pub fn all(n_channels: usize) -> Self {
        Self {
            bits: vec![true; n_channels],
        }
    }

    pub fn from_bools(bits: Vec<bool>) -> Self {
        Self { bits }
    }

    /// Build a mask from indices; indices outside `0..n_channels` are ignored
    pub fn from_indices<I: IntoIterator<Item = usize>>(n_channels: usize, indices: I) -> Self {
        let mut mask = Self::none(n_channels);
        for i in indices {
            mask.insert(i);
        }
        mask
    }

    pub fn n_channels(&self) -> usize {
        self.bits.len()
    }

    pub fn contains(&self, index: usize) -> bool {
        self.bits.get(index).copied().unwrap_or(false)
    }

    pub fn insert(&mut self, index: usize) {
        if let Some(bit) = self.bits.get_mut(index) {
            *bit = true;
        }
    }

    /// Number of flagged channels
    pub fn count(&self) -> usize {
        self.bits.iter().filter(|&&b| b).count()
    }

    pub fn any(&self) -> bool {
        self.bits.iter().any(|&b| b)
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter_map(|(i, &b)| b.then_some(i))
    }

    pub fn indices(&self) -> Vec<usize> {
        self.iter().collect()
    }

    pub fn as_bools(&self) -> &[bool] {
        &self.bits
    }

    pub fn union(&self, other: &ChannelMask) -> ChannelMask {
        let mut out = self.clone();
        out.union_with(other);
        out
    }

    pub fn union_with(&mut self, other: &ChannelMask) {
        debug_assert_eq!(self.bits.len(), other.bits.len());
        for (a, &b) in self.bits.iter_mut().zip(other.bits.iter()) {
            *a |= b;
        }
    }

    pub fn difference(&self, other: &ChannelMask) -> ChannelMask {
        ChannelMask {
            bits: self
                .bits
                .iter()
                .enumerate()
                .map(|(i, &b)| b && !other.contains(i))
                .collect(),
        }
    }

    pub fn complement(&self) -> ChannelMask {
        ChannelMask {
            bits: self.bits.iter().map(|&b| !b).collect(),
        }
    }

    /// Map a mask over a channel subset back to the full channel space.
    ///
    /// `subset[i]` is the full-space index of the subset's i-th channel.
    pub fn expand(&self, subset: &[usize], n_channels: usize) -> ChannelMask {
        ChannelMask::from_indices(n_channels, self.iter().map(|i| subset[i]))
    }

    pub fn names(&self, names: &[String]) -> Vec<String> {
        self.iter().filter_map(|i| names.get(i).cloned()).collect()
    }
}

/// Per-criterion bad-channel masks produced by one detection pass, or the
/// union of several passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadChannelReport {
    channel_names: Vec<String>,
    masks: [ChannelMask; Criterion::COUNT],
}

impl BadChannelReport {
    pub fn new(channel_names: Vec<String>) -> Self {
        let n = channel_names.len();
        Self {
            channel_names,
            masks: std::array::from_fn(|_| ChannelMask::none(n)),
        }
    }

    pub fn n_channels(&self) -> usize {
        self.channel_names.len()
    }

    pub fn channel_names(&self) -> &[String] {
        &self.channel_names
    }

    pub fn mask(&self, criterion: Criterion) -> &ChannelMask {
        &self.masks[criterion.index()]
    }

    /// Replace the mask for `criterion`
    pub fn set_mask(&mut self, criterion: Criterion, mask: ChannelMask) -> Result<()> {
        if mask.n_channels() != self.n_channels() {
            return Err(Error::ShapeMismatch {
                expected: self.n_channels(),
                actual: mask.n_channels(),
            });
        }
        self.masks[criterion.index()] = mask;
        Ok(())
    }

    pub fn by_nan(&self) -> &ChannelMask {
        self.mask(Criterion::Nan)
    }

    pub fn by_flat(&self) -> &ChannelMask {
        self.mask(Criterion::Flat)
    }

    pub fn by_deviation(&self) -> &ChannelMask {
        self.mask(Criterion::Deviation)
    }

    pub fn by_hf_noise(&self) -> &ChannelMask {
        self.mask(Criterion::HfNoise)
    }

    pub fn by_correlation(&self) -> &ChannelMask {
        self.mask(Criterion::Correlation)
    }

    pub fn by_dropout(&self) -> &ChannelMask {
        self.mask(Criterion::Dropout)
    }

    pub fn by_ransac(&self) -> &ChannelMask {
        self.mask(Criterion::Ransac)
    }

    /// Channels that can never serve as a reference (NaN or flat)
    pub fn unusable(&self) -> ChannelMask {
        self.by_nan().union(self.by_flat())
    }

    /// Union of every criterion mask
    pub fn all_bad(&self) -> ChannelMask {
        self.masks
            .iter()
            .fold(ChannelMask::none(self.n_channels()), |acc, m| acc.union(m))
    }

    pub fn bad_names(&self) -> Vec<String> {
        self.all_bad().names(&self.channel_names)
    }

    /// Criteria that flagged `channel`
    pub fn criteria_for(&self, channel: usize) -> Vec<Criterion> {
        Criterion::ALL
            .into_iter()
            .filter(|c| self.mask(*c).contains(channel))
            .collect()
    }

    /// Union every mask of `other` into this report
    pub fn merge(&mut self, other: &BadChannelReport) -> Result<()> {
        if other.n_channels() != self.n_channels() {
            return Err(Error::ShapeMismatch {
                expected: self.n_channels(),
                actual: other.n_channels(),
            });
        }
        for (mine, theirs) in self.masks.iter_mut().zip(other.masks.iter()) {
            mine.union_with(theirs);
        }
        Ok(())
    }

    /// Re-index a report computed on a channel subset into the full montage
    pub fn expand(&self, subset: &[usize], channel_names: Vec<String>) -> BadChannelReport {
        let n = channel_names.len();
        BadChannelReport {
            channel_names,
            masks: std::array::from_fn(|i| self.masks[i].expand(subset, n)),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        let mut map = serde_json::Map::new();
        for criterion in Criterion::ALL {
            map.insert(
                criterion.name().to_string(),
                serde_json::to_value(self.mask(criterion).names(&self.channel_names))?,
            );
        }
        map.insert("bad_all".to_string(), serde_json::to_value(self.bad_names())?);
        Ok(serde_json::to_string(&map)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("E{i}")).collect()
    }

    #[test]
    fn test_montage_rejects_duplicates() {
        let result = Montage::new(
            vec!["Fz".into(), "Fz".into()],
            vec![Position3D::origin(), Position3D::new(1.0, 0.0, 0.0)],
        );
        assert_eq!(result, Err(Error::DuplicateChannel("Fz".into())));
    }

    #[test]
    fn test_recording_rejects_bad_sample_rate() {
        let montage = Montage::new(names(2), vec![Position3D::origin(); 2]).unwrap();
        let data = ndarray::Array2::<f64>::zeros((2, 10));
        assert!(matches!(
            Recording::new(data.view(), &montage, 0.0),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            Recording::new(data.view(), &montage, -5.0),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_mask_set_operations() {
        let a = ChannelMask::from_indices(5, [0, 2]);
        let b = ChannelMask::from_indices(5, [2, 4]);

        assert_eq!(a.union(&b).indices(), vec![0, 2, 4]);
        assert_eq!(a.difference(&b).indices(), vec![0]);
        assert_eq!(a.complement().indices(), vec![1, 3, 4]);
        assert_eq!(a.count(), 2);

        // Out-of-range indices are dropped
        let c = ChannelMask::from_indices(3, [1, 7]);
        assert_eq!(c.indices(), vec![1]);
    }

    #[test]
    fn test_mask_expand() {
        let sub = ChannelMask::from_indices(3, [0, 2]);
        let full = sub.expand(&[1, 3, 4], 6);
        assert_eq!(full.indices(), vec![1, 4]);
    }

    #[test]
    fn test_report_all_bad_and_merge() {
        let mut report = BadChannelReport::new(names(4));
        report
            .set_mask(Criterion::Flat, ChannelMask::from_indices(4, [1]))
            .unwrap();
        report
            .set_mask(Criterion::Ransac, ChannelMask::from_indices(4, [3]))
            .unwrap();
        assert_eq!(report.all_bad().indices(), vec![1, 3]);
        assert_eq!(report.bad_names(), vec!["E1".to_string(), "E3".to_string()]);
        assert_eq!(report.criteria_for(1), vec![Criterion::Flat]);

        let mut other = BadChannelReport::new(names(4));
        other
            .set_mask(Criterion::Flat, ChannelMask::from_indices(4, [2]))
            .unwrap();
        report.merge(&other).unwrap();
        assert_eq!(report.by_flat().indices(), vec![1, 2]);
        assert_eq!(report.all_bad().indices(), vec![1, 2, 3]);
    }

    #[test]
    fn test_report_rejects_wrong_width() {
        let mut report = BadChannelReport::new(names(4));
        let result = report.set_mask(Criterion::Nan, ChannelMask::none(3));
        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_report_json() {
        let mut report = BadChannelReport::new(names(3));
        report
            .set_mask(Criterion::Nan, ChannelMask::from_indices(3, [0]))
            .unwrap();
        let json = report.to_json().unwrap();
        assert!(json.contains("\"bad_by_nan\":[\"E0\"]"));
        assert!(json.contains("\"bad_all\":[\"E0\"]"));
    }
}
