use ndarray::{ArrayView3, Axis, Zip};

use super::{check_shapes, kernels, ComputeBackend, Result};
use crate::{
    geometry::AffineMap,
    volume::{Shape, Volume},
};

/// Sequential backend running on the calling thread
#[derive(Debug, Default, Clone, Copy)]
pub struct HostBackend;

impl ComputeBackend for HostBackend {
    fn name(&self) -> &'static str {
        "host"
    }

    fn affine_transform(
        &self,
        input: ArrayView3<f32>,
        map: &AffineMap,
        output_shape: Shape,
        fill_value: f32,
    ) -> Result<Volume> {
        check_shapes(&input, output_shape)?;
        let mut output = Volume::zeros(output_shape);
        Zip::indexed(&mut output).for_each(|(a, b, c), value| {
            let src = map.apply([a as f64, b as f64, c as f64]);
            *value = kernels::trilinear(&input, src, fill_value);
        });
        Ok(output)
    }

    fn maximum_filter(&self, input: ArrayView3<f32>, radius: [usize; 3]) -> Result<Volume> {
        let mut filtered = input.to_owned();
        for (axis, &r) in radius.iter().enumerate() {
            if r == 0 {
                continue;
            }
            let mut output = filtered.clone();
            Zip::from(filtered.lanes(Axis(axis)))
                .and(output.lanes_mut(Axis(axis)))
                .for_each(|lane, out| kernels::lane_maximum(lane, out, r));
            filtered = output;
        }
        Ok(filtered)
    }
}
