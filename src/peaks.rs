//! Bead peak detection
//!
//! A voxel is a peak if it is the maximum of its search window, stands above
//! a threshold derived from the background statistics of the volume and is
//! not within the excluded border. Search windows are isotropic in physical
//! units; the scan axis of raw volumes, along which beads are elongated, gets
//! a longer window. Candidates closer than the window to a brighter peak are
//! merged into it.

use ndarray::ArrayView3;
use serde::{Deserialize, Serialize};

use crate::{
    backend::{BackendError, ComputeBackend},
    config::DetectionSettings,
    volume::VoxelScale,
};

/// A local intensity maximum
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    pub index: [usize; 3],
    pub intensity: f32,
}

/// Robust background level and noise
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Background {
    pub median: f32,
    pub sigma: f32,
}

/// Estimates the background from the median and the sigma-clipped lower half of the values
///
/// The lower half is not contaminated by the beads.
pub fn estimate_background(
    values: impl Iterator<Item = f32>,
    iterations: usize,
    clip_factor: f64,
) -> Background {
    let mut values: Vec<f32> = values.filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return Background {
            median: 0f32,
            sigma: 0f32,
        };
    }
    values.sort_unstable_by(|a, b| a.total_cmp(b));
    let n = values.len();
    let median = if n % 2 == 0 {
        (values[n / 2 - 1] + values[n / 2]) / 2f32
    } else {
        values[n / 2]
    };

    let mut low_half: Vec<f32> = values.into_iter().filter(|&v| v <= median).collect();
    let mut sigma = 0f64;
    for _ in 0..iterations {
        if low_half.is_empty() {
            break;
        }
        let mean = low_half.iter().map(|&v| v as f64).sum::<f64>() / low_half.len() as f64;
        let var = low_half
            .iter()
            .map(|&v| (v as f64 - mean).powi(2))
            .sum::<f64>()
            / low_half.len() as f64;
        sigma = var.sqrt();
        if sigma < 1e-10 {
            break;
        }
        let (lo, hi) = (mean - clip_factor * sigma, mean + clip_factor * sigma);
        let before = low_half.len();
        low_half.retain(|&v| (lo..=hi).contains(&(v as f64)));
        if low_half.len() == before {
            break;
        }
    }
    Background {
        median,
        sigma: sigma as f32,
    }
}

pub struct PeakDetector<'a> {
    settings: &'a DetectionSettings,
    scale: VoxelScale,
}
impl<'a> PeakDetector<'a> {
    pub fn new(settings: &'a DetectionSettings, scale: VoxelScale) -> Self {
        Self { settings, scale }
    }
    /// Half-width of the search window in voxels
    pub fn window_radius(&self, raw: bool) -> [usize; 3] {
        let mut radius = [0usize; 3];
        for (k, r) in radius.iter_mut().enumerate() {
            let mut voxels = self.settings.min_distance / self.scale[k];
            if raw && k == 0 {
                voxels *= self.settings.raw_scan_elongation;
            }
            *r = (voxels.ceil() as usize).max(1);
        }
        radius
    }
    /// Intensity a peak must exceed
    pub fn threshold(&self, volume: &ArrayView3<f32>) -> f32 {
        let Background { median, sigma } = estimate_background(
            volume.iter().copied(),
            self.settings.sigma_clip_iterations,
            self.settings.sigma_clip_factor,
        );
        let max = volume
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold(median, f32::max);
        let noise_floor = self.settings.threshold_sigma as f32 * sigma;
        let prominence = self.settings.min_prominence as f32 * (max - median);
        let threshold = median + noise_floor.max(prominence);
        log::debug!(
            "background: {median:.3}±{sigma:.3}, maximum: {max:.3}, threshold: {threshold:.3}"
        );
        threshold
    }
    /// Finds the bead peaks, brightest first
    ///
    /// `raw` tells whether the volume is in the oblique acquisition frame.
    pub fn detect(
        &self,
        backend: &dyn ComputeBackend,
        volume: ArrayView3<f32>,
        raw: bool,
    ) -> Result<Vec<Peak>, BackendError> {
        if volume.is_empty() {
            return Ok(Vec::new());
        }
        let radius = self.window_radius(raw);
        let threshold = self.threshold(&volume);
        let maxima = backend.maximum_filter(volume.view(), radius)?;

        let (n0, n1, n2) = volume.dim();
        let dim = [n0, n1, n2];
        let border = self.settings.exclude_border;
        let inside = |index: [usize; 3]| {
            (0..3).all(|k| index[k] >= border[k] && index[k] + border[k] < dim[k])
        };
        let mut candidates: Vec<Peak> = volume
            .indexed_iter()
            .zip(maxima.iter())
            .filter_map(|(((i, j, k), &value), &maximum)| {
                let index = [i, j, k];
                (value.is_finite() && value == maximum && value > threshold && inside(index))
                    .then_some(Peak {
                        index,
                        intensity: value,
                    })
            })
            .collect();
        candidates.sort_by(|a, b| b.intensity.total_cmp(&a.intensity));
        let n_candidates = candidates.len();

        let mut peaks: Vec<Peak> = Vec::new();
        for candidate in candidates {
            if peaks.len() >= self.settings.max_num_peaks {
                break;
            }
            let separated = peaks.iter().all(|peak| {
                let d2: f64 = (0..3)
                    .map(|k| {
                        let d = candidate.index[k] as f64 - peak.index[k] as f64;
                        (d / radius[k] as f64).powi(2)
                    })
                    .sum();
                d2 >= 1f64
            });
            if separated {
                peaks.push(candidate);
            }
        }
        log::info!(
            "Detected {} peaks ({} candidates, window radius: {:?}, raw: {})",
            peaks.len(),
            n_candidates,
            radius,
            raw
        );
        Ok(peaks)
    }
}
