//! Anisotropic 3-D Gaussian least-squares fit
//!
//! The model `bg + A·exp(-Σ (x_a - c_a)² / (2σ_a²))` is fitted to a bead
//! patch with a Levenberg-Marquardt solver, coordinates in physical units
//! local to the patch.

use nalgebra::{SMatrix, SVector};
use serde::{Deserialize, Serialize};

use crate::{config::FitSettings, extract::BeadPatch, volume::VoxelScale};

/// Ratio of the full width at half maximum to the standard deviation of a Gaussian
pub const FWHM_PER_SIGMA: f64 = 2.354_820_045_030_949_3;

const N_PARAMS: usize = 8;
type Params = SVector<f64, N_PARAMS>;
type Normal = SMatrix<f64, N_PARAMS, N_PARAMS>;

/// Gaussian fit of one bead
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GaussianFitResult {
    /// Bead centre in the parent volume [µm]
    pub center: [f64; 3],
    /// Standard deviation [µm]
    pub sigma: [f64; 3],
    /// Full width at half maximum [µm]
    pub fwhm: [f64; 3],
    pub amplitude: f64,
    pub background: f64,
    pub valid: bool,
    /// Root mean square of the fit residuals
    pub rmse: f64,
    pub iterations: usize,
}
impl GaussianFitResult {
    /// Bead centre in the patch index frame
    pub fn local_index(&self, patch: &BeadPatch, scale: &VoxelScale) -> [f64; 3] {
        let index = scale.to_index(self.center);
        [0, 1, 2].map(|k| index[k] - patch.offset[k] as f64)
    }
}

/// Samples of a patch in physical coordinates
struct Samples {
    coordinates: Vec<[f64; 3]>,
    values: Vec<f64>,
}
impl Samples {
    fn new(patch: &BeadPatch, scale: &VoxelScale) -> Self {
        let (coordinates, values) = patch
            .data
            .indexed_iter()
            .map(|((i, j, k), &v)| {
                (
                    scale.to_physical([i as f64, j as f64, k as f64]),
                    v as f64,
                )
            })
            .unzip();
        Self {
            coordinates,
            values,
        }
    }
    fn len(&self) -> usize {
        self.values.len()
    }
}

#[inline]
fn model(p: &Params, x: &[f64; 3]) -> (f64, f64) {
    let r2: f64 = (0..3).map(|a| ((x[a] - p[2 + a]) / p[5 + a]).powi(2)).sum();
    let e = (-0.5 * r2).exp();
    (p[0] + p[1] * e, e)
}

fn cost(p: &Params, samples: &Samples) -> f64 {
    0.5 * samples
        .coordinates
        .iter()
        .zip(&samples.values)
        .map(|(x, y)| (model(p, x).0 - y).powi(2))
        .sum::<f64>()
}

/// Normal matrix `JᵀJ` and gradient `Jᵀr`
fn normal_equations(p: &Params, samples: &Samples) -> (Normal, Params) {
    let mut jtj = Normal::zeros();
    let mut jtr = Params::zeros();
    for (x, y) in samples.coordinates.iter().zip(&samples.values) {
        let (f, e) = model(p, x);
        let r = f - y;
        let mut j = Params::zeros();
        j[0] = 1f64;
        j[1] = e;
        for a in 0..3 {
            let d = x[a] - p[2 + a];
            let s = p[5 + a];
            j[2 + a] = p[1] * e * d / (s * s);
            j[5 + a] = p[1] * e * d * d / (s * s * s);
        }
        jtj += j * j.transpose();
        jtr += j * r;
    }
    (jtj, jtr)
}

fn initial_guess(patch: &BeadPatch, scale: &VoxelScale, samples: &Samples) -> Params {
    let (min, max) = samples
        .values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let mut weight = 0f64;
    let mut moment = [0f64; 3];
    for (x, y) in samples.coordinates.iter().zip(&samples.values) {
        let w = y - min;
        weight += w;
        (0..3).for_each(|a| moment[a] += w * x[a]);
    }
    let shape = patch.shape();
    let center = if weight > 0f64 {
        moment.map(|m| m / weight)
    } else {
        scale.to_physical(shape.map(|n| (n / 2) as f64))
    };
    let mut p = Params::zeros();
    p[0] = min;
    p[1] = max - min;
    for a in 0..3 {
        p[2 + a] = center[a];
        p[5 + a] = shape[a] as f64 * scale[a] / 6f64;
    }
    p
}

enum Outcome {
    Converged,
    Exhausted,
    Diverged,
}

/// Fits a Gaussian to the patch
///
/// A fit that does not converge is returned with `valid` set to `false`.
pub fn fit_gaussian(
    patch: &BeadPatch,
    scale: &VoxelScale,
    settings: &FitSettings,
) -> GaussianFitResult {
    let samples = Samples::new(patch, scale);
    let mut p = initial_guess(patch, scale, &samples);
    let mut f = cost(&p, &samples);
    let tiny_cost = 1e-24 * (1f64 + p[1] * p[1]) * samples.len() as f64;
    let mut lambda = 1e-3;
    let mut iterations = 0;

    let outcome = loop {
        if !f.is_finite() || !p.iter().all(|x| x.is_finite()) {
            break Outcome::Diverged;
        }
        if f <= tiny_cost {
            break Outcome::Converged;
        }
        if iterations >= settings.max_iterations {
            break Outcome::Exhausted;
        }
        iterations += 1;

        let (jtj, jtr) = normal_equations(&p, &samples);
        let mut a = jtj;
        for k in 0..N_PARAMS {
            a[(k, k)] += lambda * jtj[(k, k)].max(1e-12);
        }
        let Some(cholesky) = a.cholesky() else {
            lambda *= 10f64;
            continue;
        };
        let step = cholesky.solve(&(-jtr));
        let candidate = p + step;
        let f_candidate = cost(&candidate, &samples);
        let small_step = step.norm() <= settings.xtol * (p.norm() + settings.xtol);

        if f_candidate.is_finite() && f_candidate < f {
            let decrease = (f - f_candidate) / f;
            p = candidate;
            f = f_candidate;
            lambda = (lambda / 10f64).max(1e-12);
            if decrease <= settings.ftol || small_step {
                break Outcome::Converged;
            }
        } else {
            if small_step {
                break Outcome::Converged;
            }
            lambda *= 10f64;
            if lambda > 1e16 {
                break Outcome::Converged;
            }
        }
    };

    let sigma = [p[5], p[6], p[7]];
    let valid = match outcome {
        Outcome::Converged => {
            p.iter().all(|x| x.is_finite()) && sigma.iter().all(|&s| s > 0f64) && p[1] > 0f64
        }
        Outcome::Exhausted | Outcome::Diverged => false,
    };
    let local = scale.to_index([p[2], p[3], p[4]]);
    let center = scale.to_physical([0, 1, 2].map(|k| patch.offset[k] as f64 + local[k]));
    let result = GaussianFitResult {
        center,
        sigma,
        fwhm: sigma.map(|s| FWHM_PER_SIGMA * s),
        amplitude: p[1],
        background: p[0],
        valid,
        rmse: (2f64 * f / samples.len() as f64).sqrt(),
        iterations,
    };
    if !valid {
        log::warn!(
            "Gaussian fit of the bead at {:?} failed after {} iterations",
            patch.peak.index,
            iterations
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        peaks::Peak,
        test_util::{bead_volume, noisy_bead_volume, Bead},
        volume::Volume,
    };
    use approx::assert_relative_eq;

    fn patch(data: Volume, offset: [usize; 3]) -> BeadPatch {
        let (n0, n1, n2) = data.dim();
        BeadPatch {
            peak: Peak {
                index: [offset[0] + n0 / 2, offset[1] + n1 / 2, offset[2] + n2 / 2],
                intensity: data[[n0 / 2, n1 / 2, n2 / 2]],
            },
            data,
            offset,
        }
    }

    #[test]
    fn fwhm_ratio() {
        assert_relative_eq!(FWHM_PER_SIGMA, 2f64 * (2f64 * 2f64.ln()).sqrt());
    }

    #[test]
    fn recovers_noise_free_bead() {
        let scale = VoxelScale::new([0.3, 0.1, 0.1]).unwrap();
        // sigma [µm]: 0.6, 0.25, 0.2
        let bead = Bead::new([7.3, 9.8, 10.2], [2.0, 2.5, 2.0], 500.0);
        let data = bead_volume([15, 21, 21], &[bead], 100f64);
        let patch = patch(data, [40, 50, 60]);
        let fit = fit_gaussian(&patch, &scale, &FitSettings::default());
        assert!(fit.valid);
        assert_relative_eq!(fit.sigma[0], 0.6, max_relative = 0.01);
        assert_relative_eq!(fit.sigma[1], 0.25, max_relative = 0.01);
        assert_relative_eq!(fit.sigma[2], 0.2, max_relative = 0.01);
        assert_relative_eq!(fit.fwhm[1], 0.25 * 2.3548, max_relative = 0.01);
        assert_relative_eq!(fit.amplitude, 500.0, max_relative = 0.01);
        assert_relative_eq!(fit.background, 100.0, max_relative = 0.01);
        assert_relative_eq!(fit.center[0], (40.0 + 7.3) * 0.3, max_relative = 1e-3);
        assert_relative_eq!(fit.center[1], (50.0 + 9.8) * 0.1, max_relative = 1e-3);
        assert_relative_eq!(fit.center[2], (60.0 + 10.2) * 0.1, max_relative = 1e-3);
        assert!(fit.rmse < 1e-3);
        let local = fit.local_index(&patch, &scale);
        assert_relative_eq!(local[0], 7.3, epsilon = 1e-2);
    }

    #[test]
    fn recovers_noisy_bead() {
        let scale = VoxelScale::new([0.25, 0.1, 0.1]).unwrap();
        let bead = Bead::new([8.0, 10.0, 10.0], [2.4, 1.8, 1.8], 1000.0);
        let data = noisy_bead_volume([17, 21, 21], &[bead], 100f64, 5f64, 3);
        let fit = fit_gaussian(&patch(data, [0, 0, 0]), &scale, &FitSettings::default());
        assert!(fit.valid);
        assert_relative_eq!(fit.sigma[0], 0.6, max_relative = 0.05);
        assert_relative_eq!(fit.sigma[1], 0.18, max_relative = 0.05);
        assert_relative_eq!(fit.sigma[2], 0.18, max_relative = 0.05);
    }

    #[test]
    fn flat_patch_is_invalid() {
        let scale = VoxelScale::uniform(0.1).unwrap();
        let data = Volume::from_elem((7, 7, 7), 50f32);
        let fit = fit_gaussian(&patch(data, [0, 0, 0]), &scale, &FitSettings::default());
        assert!(!fit.valid);
    }

    #[test]
    fn non_finite_patch_is_invalid() {
        let scale = VoxelScale::uniform(0.1).unwrap();
        let mut data = bead_volume([7, 7, 7], &[Bead::new([3.0; 3], [1.0; 3], 10.0)], 1f64);
        data[[0, 0, 0]] = f32::NAN;
        let fit = fit_gaussian(&patch(data, [0, 0, 0]), &scale, &FitSettings::default());
        assert!(!fit.valid);
    }

    #[test]
    fn exhausted_iterations_are_invalid() {
        let scale = VoxelScale::new([0.25, 0.1, 0.1]).unwrap();
        let bead = Bead::new([8.0, 10.0, 10.0], [2.4, 1.8, 1.8], 1000.0);
        let data = noisy_bead_volume([17, 21, 21], &[bead], 100f64, 5f64, 3);
        let settings = FitSettings {
            max_iterations: 1,
            ..Default::default()
        };
        let fit = fit_gaussian(&patch(data, [0, 0, 0]), &scale, &settings);
        assert!(!fit.valid);
        assert_eq!(fit.iterations, 1);
    }
}
