//! Array computation backends
//!
//! The data-parallel primitives of the pipeline, the affine resampling of a
//! volume and the maximum filter, are delegated to a [ComputeBackend] chosen
//! once from the [ComputeSettings]. Backends are single-call: nothing is kept
//! between two primitives.

use ndarray::ArrayView3;

use crate::{
    config::{BackendKind, ComputeSettings},
    geometry::AffineMap,
    volume::{Shape, Volume},
};

mod accelerated;
mod host;
pub mod kernels;

pub use accelerated::AcceleratedBackend;
pub use host::HostBackend;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(
        "{backend} backend out of memory: {requested} bytes requested, {budget} bytes available, increase the number of chunks"
    )]
    Resource {
        backend: &'static str,
        requested: usize,
        budget: usize,
    },
    #[error("failed to build the worker pool")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("output shape {0:?} has a zero extent")]
    EmptyOutput(Shape),
    #[error("input shape {0:?} has a zero extent")]
    EmptyInput(Shape),
}
impl BackendError {
    /// Memory exhaustion, fixed by the caller with more chunks
    pub fn is_resource(&self) -> bool {
        matches!(self, BackendError::Resource { .. })
    }
}
pub type Result<T> = std::result::Result<T, BackendError>;

/// Rejects resampling from or into a volume with a zero extent
fn check_shapes(input: &ArrayView3<f32>, output_shape: Shape) -> Result<()> {
    let (n0, n1, n2) = input.dim();
    if n0 == 0 || n1 == 0 || n2 == 0 {
        return Err(BackendError::EmptyInput([n0, n1, n2]));
    }
    if output_shape.iter().any(|&n| n == 0) {
        return Err(BackendError::EmptyOutput(output_shape));
    }
    Ok(())
}

/// Data-parallel volume primitives
pub trait ComputeBackend: Send + Sync {
    fn name(&self) -> &'static str;
    /// Samples `input` at `map(d)` for every destination index `d` of `output_shape`
    ///
    /// First-order interpolation; samples mapped outside of the input are
    /// set to `fill_value`.
    fn affine_transform(
        &self,
        input: ArrayView3<f32>,
        map: &AffineMap,
        output_shape: Shape,
        fill_value: f32,
    ) -> Result<Volume>;
    /// Maximum over the box `[i - radius, i + radius]` truncated to the volume
    fn maximum_filter(&self, input: ArrayView3<f32>, radius: [usize; 3]) -> Result<Volume>;
}

/// Instantiates the backend named in the settings
pub fn select(settings: &ComputeSettings) -> Result<Box<dyn ComputeBackend>> {
    let backend: Box<dyn ComputeBackend> = match settings.backend {
        BackendKind::Host => Box::new(HostBackend),
        BackendKind::Accelerated => Box::new(AcceleratedBackend::new(
            settings.threads,
            settings.device_memory_bytes(),
        )?),
    };
    log::info!("Compute backend: {}", backend.name());
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array3;

    fn ramp() -> Volume {
        Array3::from_shape_fn((6, 5, 4), |(i, j, k)| (i * 100 + j * 10 + k) as f32)
    }

    fn backends() -> Vec<Box<dyn ComputeBackend>> {
        vec![
            Box::new(HostBackend),
            Box::new(AcceleratedBackend::new(2, None).unwrap()),
        ]
    }

    #[test]
    fn identity_transform() {
        let input = ramp();
        for backend in backends() {
            let output = backend
                .affine_transform(input.view(), &AffineMap::identity(), [6, 5, 4], -1f32)
                .unwrap();
            assert_eq!(output, input, "{}", backend.name());
        }
    }

    #[test]
    fn half_voxel_shift_interpolates() {
        let input = ramp();
        let map = AffineMap::translation([0f64, 0f64, 0.5]);
        for backend in backends() {
            let output = backend
                .affine_transform(input.view(), &map, [6, 5, 4], -1f32)
                .unwrap();
            assert_relative_eq!(output[[2, 3, 1]], 231.5);
            // x = 3.5 is outside of [0, 3]
            assert_eq!(output[[2, 3, 3]], -1f32);
        }
    }

    #[test]
    fn maximum_filter_spreads_maximum() {
        let mut input = Array3::<f32>::zeros((7, 7, 7));
        input[[3, 3, 3]] = 5f32;
        input[[0, 0, 0]] = 1f32;
        for backend in backends() {
            let output = backend.maximum_filter(input.view(), [1, 2, 0]).unwrap();
            assert_eq!(output[[2, 1, 3]], 5f32);
            assert_eq!(output[[4, 5, 3]], 5f32);
            assert_eq!(output[[3, 3, 2]], 0f32);
            assert_eq!(output[[1, 2, 0]], 1f32);
            assert_eq!(output[[2, 0, 0]], 0f32);
        }
    }

    #[test]
    fn backends_agree() {
        let input = ramp();
        let map = AffineMap::from_rows([
            [1f64, -0.7, 0f64, 0.3],
            [0f64, 1f64, 0f64, 0f64],
            [0f64, 0f64, 1f64, 0f64],
        ])
        .unwrap();
        let host = HostBackend
            .affine_transform(input.view(), &map, [9, 5, 4], 0f32)
            .unwrap();
        let accelerated = AcceleratedBackend::new(3, None)
            .unwrap()
            .affine_transform(input.view(), &map, [9, 5, 4], 0f32)
            .unwrap();
        assert_eq!(host, accelerated);
    }

    #[test]
    fn memory_budget_is_enforced() {
        let input = ramp();
        let backend = AcceleratedBackend::new(1, Some(256)).unwrap();
        let err = backend
            .affine_transform(input.view(), &AffineMap::identity(), [6, 5, 4], 0f32)
            .unwrap_err();
        assert!(err.is_resource());
    }

    #[test]
    fn empty_volumes_are_rejected() {
        let empty = Array3::<f32>::zeros((0, 5, 4));
        let input = ramp();
        for backend in backends() {
            assert!(matches!(
                backend.affine_transform(empty.view(), &AffineMap::identity(), [6, 5, 4], 0f32),
                Err(BackendError::EmptyInput([0, 5, 4]))
            ));
            assert!(matches!(
                backend.affine_transform(input.view(), &AffineMap::identity(), [6, 0, 4], 0f32),
                Err(BackendError::EmptyOutput([6, 0, 4]))
            ));
        }
    }

    #[test]
    fn selection() {
        let mut settings = ComputeSettings::default();
        settings.backend = BackendKind::Host;
        assert_eq!(select(&settings).unwrap().name(), "host");
        settings.backend = BackendKind::Accelerated;
        settings.threads = 1;
        assert_eq!(select(&settings).unwrap().name(), "accelerated");
    }
}
