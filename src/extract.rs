//! Bead patch extraction

use ndarray::{s, ArrayView3};

use crate::{
    peaks::Peak,
    volume::{Volume, VoxelScale},
};

/// A sub-volume centred on a bead peak
#[derive(Debug, Clone)]
pub struct BeadPatch {
    pub data: Volume,
    /// Index of the first patch voxel in the parent volume
    pub offset: [usize; 3],
    pub peak: Peak,
}
impl BeadPatch {
    /// Patch shape
    pub fn shape(&self) -> [usize; 3] {
        let (n0, n1, n2) = self.data.dim();
        [n0, n1, n2]
    }
    /// Peak index in the patch frame
    pub fn local_peak(&self) -> [usize; 3] {
        [0, 1, 2].map(|k| self.peak.index[k] - self.offset[k])
    }
}

/// Patches of the beads that fit in the volume
#[derive(Debug, Clone, Default)]
pub struct ExtractedBeads {
    pub patches: Vec<BeadPatch>,
    /// Number of peaks too close to the volume edge
    pub dropped: usize,
}
impl ExtractedBeads {
    pub fn len(&self) -> usize {
        self.patches.len()
    }
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }
}

/// Patch extent in voxels: nearest odd integer to `patch_size / scale`, at least 3
pub fn footprint(scale: &VoxelScale, patch_size: [f64; 3]) -> [usize; 3] {
    [0, 1, 2].map(|k| {
        let voxels = patch_size[k] / scale[k];
        let odd = 2f64 * ((voxels - 1f64) / 2f64).round() + 1f64;
        (odd.max(3f64)) as usize
    })
}

/// Cuts a patch around every peak whose footprint lies within the volume
pub fn extract(
    volume: ArrayView3<f32>,
    peaks: &[Peak],
    scale: &VoxelScale,
    patch_size: [f64; 3],
) -> ExtractedBeads {
    let extent = footprint(scale, patch_size);
    let half = extent.map(|n| n / 2);
    let (n0, n1, n2) = volume.dim();
    let dim = [n0, n1, n2];

    let mut beads = ExtractedBeads::default();
    for peak in peaks {
        let p = peak.index;
        if (0..3).any(|k| p[k] < half[k] || p[k] + half[k] >= dim[k]) {
            log::debug!("dropping peak at {:?}: patch out of volume", p);
            beads.dropped += 1;
            continue;
        }
        let offset = [0, 1, 2].map(|k| p[k] - half[k]);
        let data = volume
            .slice(s![
                offset[0]..offset[0] + extent[0],
                offset[1]..offset[1] + extent[1],
                offset[2]..offset[2] + extent[2]
            ])
            .to_owned();
        beads.patches.push(BeadPatch {
            data,
            offset,
            peak: *peak,
        });
    }
    log::info!(
        "Extracted {} bead patches of {:?} voxels, {} dropped at the volume edges",
        beads.len(),
        extent,
        beads.dropped
    );
    beads
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn peak(index: [usize; 3]) -> Peak {
        Peak {
            index,
            intensity: 1f32,
        }
    }

    #[test]
    fn odd_footprint() {
        let scale = VoxelScale::new([0.25, 0.1, 1.0]).unwrap();
        // 10 -> 9 or 11, 20 -> 19 or 21, 1 -> 3
        let fp = footprint(&scale, [2.5, 2.0, 1.0]);
        assert!(fp.iter().all(|n| n % 2 == 1));
        assert!(fp[0] == 9 || fp[0] == 11);
        assert!(fp[1] == 19 || fp[1] == 21);
        assert_eq!(fp[2], 3);
        let fp = footprint(&scale, [1.75, 0.7, 5.0]);
        assert_eq!(fp, [7, 7, 5]);
    }

    #[test]
    fn edge_peaks_are_dropped() {
        let volume = Array3::from_shape_fn((20, 20, 20), |(i, j, k)| (i * 400 + j * 20 + k) as f32);
        let scale = VoxelScale::uniform(1f64).unwrap();
        // 5 voxels per axis, half-width 2
        let peaks = [
            peak([10, 10, 10]),
            peak([1, 10, 10]),
            peak([10, 18, 10]),
            peak([2, 2, 17]),
            peak([10, 10, 19]),
        ];
        let beads = extract(volume.view(), &peaks, &scale, [5.0; 3]);
        assert_eq!(beads.len(), 2);
        assert_eq!(beads.dropped, 3);
        assert_eq!(beads.patches[0].peak.index, [10, 10, 10]);
        assert_eq!(beads.patches[1].peak.index, [2, 2, 17]);
        for patch in &beads.patches {
            assert_eq!(patch.shape(), [5, 5, 5]);
            assert_eq!(patch.local_peak(), [2, 2, 2]);
            let [i, j, k] = patch.peak.index;
            assert_eq!(patch.data[[2, 2, 2]], volume[[i, j, k]]);
        }
        assert_eq!(beads.patches[1].offset, [0, 0, 15]);
    }
}
