use ndarray::{ArrayView3, Axis, Zip};
use rayon::{ThreadPool, ThreadPoolBuilder};

use super::{check_shapes, kernels, BackendError, ComputeBackend, Result};
use crate::{
    geometry::AffineMap,
    volume::{Shape, Volume},
};

/// Data-parallel backend with its own worker pool and memory budget
///
/// Every call "uploads" its input and allocates its output inside the
/// budget; a call that would not fit fails with [BackendError::Resource]
/// before any allocation.
pub struct AcceleratedBackend {
    pool: ThreadPool,
    memory_budget: Option<usize>,
}
impl AcceleratedBackend {
    /// Creates a pool of `threads` workers (one per core if 0)
    pub fn new(threads: usize, memory_budget: Option<usize>) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("lsm-accel-{i}"))
            .build()?;
        log::debug!(
            "accelerated backend: {} workers, memory budget: {:?} bytes",
            pool.current_num_threads(),
            memory_budget
        );
        Ok(Self {
            pool,
            memory_budget,
        })
    }
    pub fn memory_budget(&self) -> Option<usize> {
        self.memory_budget
    }
    fn reserve(&self, n_input: usize, n_output: usize) -> Result<()> {
        let requested = (n_input + n_output) * std::mem::size_of::<f32>();
        match self.memory_budget {
            Some(budget) if requested > budget => Err(BackendError::Resource {
                backend: self.name(),
                requested,
                budget,
            }),
            _ => Ok(()),
        }
    }
}
impl std::fmt::Debug for AcceleratedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceleratedBackend")
            .field("threads", &self.pool.current_num_threads())
            .field("memory_budget", &self.memory_budget)
            .finish()
    }
}

impl ComputeBackend for AcceleratedBackend {
    fn name(&self) -> &'static str {
        "accelerated"
    }

    fn affine_transform(
        &self,
        input: ArrayView3<f32>,
        map: &AffineMap,
        output_shape: Shape,
        fill_value: f32,
    ) -> Result<Volume> {
        check_shapes(&input, output_shape)?;
        self.reserve(input.len(), output_shape.iter().product())?;
        let mut output = Volume::zeros(output_shape);
        self.pool.install(|| {
            Zip::indexed(&mut output).par_for_each(|(a, b, c), value| {
                let src = map.apply([a as f64, b as f64, c as f64]);
                *value = kernels::trilinear(&input, src, fill_value);
            })
        });
        Ok(output)
    }

    fn maximum_filter(&self, input: ArrayView3<f32>, radius: [usize; 3]) -> Result<Volume> {
        // input, working copy and output
        self.reserve(input.len(), 2 * input.len())?;
        let mut filtered = input.to_owned();
        self.pool.install(|| {
            for (axis, &r) in radius.iter().enumerate() {
                if r == 0 {
                    continue;
                }
                let mut output = filtered.clone();
                Zip::from(filtered.lanes(Axis(axis)))
                    .and(output.lanes_mut(Axis(axis)))
                    .par_for_each(|lane, out| kernels::lane_maximum(lane, out, r));
                filtered = output;
            }
        });
        Ok(filtered)
    }
}
