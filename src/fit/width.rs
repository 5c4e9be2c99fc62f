//! Model-free full width at half maximum

use ndarray::{ArrayView1, Axis};
use serde::{Deserialize, Serialize};

use crate::{extract::BeadPatch, volume::VoxelScale};

/// Half-maximum width of the 1-D profiles through a bead [µm]
///
/// An axis is `None` when its profile does not fall to half maximum on
/// both sides of the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PeakWidthResult {
    pub fwhm: [Option<f64>; 3],
}

/// Width of a profile at half height, in samples
pub fn profile_fwhm(profile: ArrayView1<f32>) -> Option<f64> {
    if profile.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let (argmax, max) = profile
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(k, m), (i, &v)| {
            if v > m {
                (i, v)
            } else {
                (k, m)
            }
        });
    let background = profile.iter().copied().fold(f32::INFINITY, f32::min);
    if max <= background {
        return None;
    }
    let level = (background + (max - background) / 2f32) as f64;
    let value = |i: usize| profile[i] as f64;

    let left = (0..argmax).rev().find(|&i| value(i) <= level).map(|i| {
        let (lo, hi) = (value(i), value(i + 1));
        i as f64 + (level - lo) / (hi - lo)
    })?;
    let right = (argmax + 1..profile.len())
        .find(|&i| value(i) <= level)
        .map(|i| {
            let (hi, lo) = (value(i - 1), value(i));
            (i - 1) as f64 + (hi - level) / (hi - lo)
        })?;
    Some(right - left)
}

/// Measures the half-maximum widths along the axes through the patch voxel `center`
pub fn peak_width(patch: &BeadPatch, scale: &VoxelScale, center: [usize; 3]) -> PeakWidthResult {
    let mut width = PeakWidthResult::default();
    let [i, j, k] = center;
    for (a, fwhm) in width.fwhm.iter_mut().enumerate() {
        let profile = match a {
            0 => patch.data.index_axis(Axis(2), k).index_axis(Axis(1), j).to_owned(),
            1 => patch.data.index_axis(Axis(2), k).index_axis(Axis(0), i).to_owned(),
            _ => patch.data.index_axis(Axis(1), j).index_axis(Axis(0), i).to_owned(),
        };
        *fwhm = profile_fwhm(profile.view()).map(|w| w * scale[a]);
    }
    width
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fit::gaussian::FWHM_PER_SIGMA,
        peaks::Peak,
        test_util::{bead_volume, Bead},
    };
    use approx::assert_relative_eq;
    use ndarray::arr1;

    #[test]
    fn triangle_profile() {
        let profile = arr1(&[0f32, 1.0, 2.0, 3.0, 4.0, 3.0, 2.0, 1.0, 0.0]);
        assert_relative_eq!(profile_fwhm(profile.view()).unwrap(), 4f64);
    }

    #[test]
    fn one_sided_profile() {
        let profile = arr1(&[0f32, 1.0, 2.0, 3.0, 4.0, 3.8, 3.6]);
        assert!(profile_fwhm(profile.view()).is_none());
        let flat = arr1(&[2f32; 5]);
        assert!(profile_fwhm(flat.view()).is_none());
    }

    #[test]
    fn gaussian_bead_width() {
        let scale = VoxelScale::new([0.2, 0.1, 0.1]).unwrap();
        let sigma = [3.0, 2.0, 2.5];
        let data = bead_volume([31, 25, 25], &[Bead::new([15.0, 12.0, 12.0], sigma, 1000.0)], 0f64);
        let patch = BeadPatch {
            data,
            offset: [0; 3],
            peak: Peak {
                index: [15, 12, 12],
                intensity: 1000f32,
            },
        };
        let width = peak_width(&patch, &scale, [15, 12, 12]);
        for a in 0..3 {
            assert_relative_eq!(
                width.fwhm[a].unwrap(),
                FWHM_PER_SIGMA * sigma[a] * scale[a],
                max_relative = 0.03
            );
        }
    }
}
