//! Synthetic bead volumes

use ndarray::Array3;
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::volume::{Shape, Volume};

/// A Gaussian bead in voxel index units
#[derive(Debug, Clone, Copy)]
pub struct Bead {
    pub center: [f64; 3],
    pub sigma: [f64; 3],
    pub amplitude: f64,
}
impl Bead {
    pub fn new(center: [f64; 3], sigma: [f64; 3], amplitude: f64) -> Self {
        Self {
            center,
            sigma,
            amplitude,
        }
    }
    pub fn value(&self, index: [f64; 3]) -> f64 {
        let r2: f64 = (0..3)
            .map(|k| ((index[k] - self.center[k]) / self.sigma[k]).powi(2))
            .sum();
        self.amplitude * (-0.5 * r2).exp()
    }
}

/// Beads on a constant background without noise
pub fn bead_volume(shape: Shape, beads: &[Bead], background: f64) -> Volume {
    Array3::from_shape_fn(shape, |(i, j, k)| {
        let index = [i as f64, j as f64, k as f64];
        (background + beads.iter().map(|b| b.value(index)).sum::<f64>()) as f32
    })
}

/// Beads on a background with seeded Gaussian noise
pub fn noisy_bead_volume(
    shape: Shape,
    beads: &[Bead],
    background: f64,
    noise_std: f64,
    seed: u64,
) -> Volume {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0f64, noise_std).unwrap();
    let mut volume = bead_volume(shape, beads, background);
    volume
        .iter_mut()
        .for_each(|v| *v += noise.sample(&mut rng) as f32);
    volume
}
