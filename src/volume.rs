//! Volumes, voxel scales and axis labels

use std::fmt;

use ndarray::Array3;
use serde::{Deserialize, Serialize};
use strum_macros::EnumIter;

/// A 3-D intensity volume indexed (axis0, axis1, axis2)
pub type Volume = Array3<f32>;

/// A volume shape
pub type Shape = [usize; 3];

#[derive(Debug, thiserror::Error)]
pub enum ScaleError {
    #[error("voxel scale must be strictly positive and finite, found {0:?}")]
    NonPositive([f64; 3]),
}

/// Physical units (µm) per voxel index, one per volume axis
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "[f64; 3]", into = "[f64; 3]")]
pub struct VoxelScale([f64; 3]);
impl VoxelScale {
    pub fn new(scale: [f64; 3]) -> Result<Self, ScaleError> {
        if scale.iter().all(|s| s.is_finite() && *s > 0f64) {
            Ok(Self(scale))
        } else {
            Err(ScaleError::NonPositive(scale))
        }
    }
    /// Isotropic scale
    pub fn uniform(value: f64) -> Result<Self, ScaleError> {
        Self::new([value; 3])
    }
    pub fn as_array(&self) -> [f64; 3] {
        self.0
    }
    /// Converts a voxel index coordinate into physical units
    pub fn to_physical(&self, index: [f64; 3]) -> [f64; 3] {
        [
            index[0] * self.0[0],
            index[1] * self.0[1],
            index[2] * self.0[2],
        ]
    }
    /// Converts a physical coordinate into voxel index units
    pub fn to_index(&self, physical: [f64; 3]) -> [f64; 3] {
        [
            physical[0] / self.0[0],
            physical[1] / self.0[1],
            physical[2] / self.0[2],
        ]
    }
    /// Compares two scales within a relative tolerance
    pub fn approx_eq(&self, other: &VoxelScale, rel_tol: f64) -> bool {
        self.0
            .iter()
            .zip(other.0.iter())
            .all(|(a, b)| (a - b).abs() <= rel_tol * a.abs().max(b.abs()))
    }
}
impl std::ops::Index<usize> for VoxelScale {
    type Output = f64;

    fn index(&self, index: usize) -> &Self::Output {
        &self.0[index]
    }
}
impl TryFrom<[f64; 3]> for VoxelScale {
    type Error = ScaleError;

    fn try_from(value: [f64; 3]) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}
impl From<VoxelScale> for [f64; 3] {
    fn from(scale: VoxelScale) -> Self {
        scale.0
    }
}
impl fmt::Display for VoxelScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.4}, {:.4}, {:.4})µm", self.0[0], self.0[1], self.0[2])
    }
}

/// Volume axes semantic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter)]
#[serde(rename_all = "lowercase")]
pub enum AxisLabels {
    /// Oblique-scan acquisition frame: (SCAN, TILT, COVERSLIP)
    Raw,
    /// Deskewed physical frame: (Z, Y, X)
    Corrected,
}
impl AxisLabels {
    pub fn names(&self) -> [&'static str; 3] {
        match self {
            AxisLabels::Raw => ["SCAN", "TILT", "COVERSLIP"],
            AxisLabels::Corrected => ["Z", "Y", "X"],
        }
    }
    pub fn is_raw(&self) -> bool {
        matches!(self, AxisLabels::Raw)
    }
}
impl fmt::Display for AxisLabels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a0, a1, a2] = self.names();
        write!(f, "({a0}, {a1}, {a2})")
    }
}

/// Shape of a volume as an array
pub fn shape_of(volume: &Volume) -> Shape {
    let dim = volume.dim();
    [dim.0, dim.1, dim.2]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_positive_scale() {
        assert!(VoxelScale::new([0.1, 0.0, 0.1]).is_err());
        assert!(VoxelScale::new([0.1, -1.0, 0.1]).is_err());
        assert!(VoxelScale::new([0.1, f64::NAN, 0.1]).is_err());
        assert!(VoxelScale::new([0.1565, 0.116, 0.116]).is_ok());
    }

    #[test]
    fn scale_deserialization_validates() {
        let scale: Result<VoxelScale, _> = serde_json::from_str("[0.25, 0.069, 0.069]");
        assert!(scale.is_ok());
        let scale: Result<VoxelScale, _> = serde_json::from_str("[0.25, 0.0, 0.069]");
        assert!(scale.is_err());
    }

    #[test]
    fn physical_index_conversion() {
        let scale = VoxelScale::new([0.5, 0.25, 2.0]).unwrap();
        let p = scale.to_physical([2.0, 4.0, 1.0]);
        assert_eq!(p, [1.0, 1.0, 2.0]);
        assert_eq!(scale.to_index(p), [2.0, 4.0, 1.0]);
    }

    #[test]
    fn approx_scale_comparison() {
        let a = VoxelScale::new([0.25, 0.069, 0.069]).unwrap();
        let b = VoxelScale::new([0.25, 0.069 + 1e-9, 0.069]).unwrap();
        let c = VoxelScale::new([0.1565, 0.116, 0.116]).unwrap();
        assert!(a.approx_eq(&b, 1e-6));
        assert!(!a.approx_eq(&c, 1e-6));
    }

    #[test]
    fn axis_label_documents() {
        use strum::IntoEnumIterator;
        let labels: Vec<String> = AxisLabels::iter()
            .map(|labels| serde_json::to_string(&labels).unwrap())
            .collect();
        assert_eq!(labels, vec![r#""raw""#, r#""corrected""#]);
        assert_eq!(AxisLabels::Corrected.to_string(), "(Z, Y, X)");
    }
}
