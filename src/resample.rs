//! Chunked affine resampling
//!
//! A volume too large for the backend memory is split into slabs along a
//! source axis that the affine map sends onto a single destination axis.
//! Each slab is resampled on its own with a one-voxel halo, so that the
//! reassembled volume does not depend on the number of chunks.

use ndarray::{ArrayView3, Axis, Slice};

use crate::{
    backend::ComputeBackend,
    config::ConfigError,
    error::Result,
    geometry::{AffineMap, GeometryError, ScanGeometry},
    volume::{Shape, Volume, VoxelScale},
};

/// Splits `n` into `num_chunks` contiguous ranges, the first ones taking the remainder
fn slab_bounds(n: usize, num_chunks: usize) -> Vec<(usize, usize)> {
    let (size, remainder) = (n / num_chunks, n % num_chunks);
    let mut start = 0;
    (0..num_chunks)
        .map(|k| {
            let end = start + size + usize::from(k < remainder);
            let bounds = (start, end);
            start = end;
            bounds
        })
        .collect()
}

/// Slab holding the source coordinate `c`
fn owner(slabs: &[(usize, usize)], c: f64) -> usize {
    let index = c.floor();
    if index < 0f64 {
        return 0;
    }
    let index = index as usize;
    slabs
        .iter()
        .position(|&(start, end)| (start..end).contains(&index))
        .unwrap_or(slabs.len() - 1)
}

/// Resamples `volume` onto a grid of `output_shape` through `map` (destination to source)
///
/// The volume is processed in `num_chunks` slabs; `num_chunks` larger than
/// the chunk axis extent is clamped to it.
pub fn resample(
    backend: &dyn ComputeBackend,
    volume: ArrayView3<f32>,
    map: &AffineMap,
    output_shape: Shape,
    fill_value: f32,
    num_chunks: usize,
) -> Result<Volume> {
    if num_chunks == 0 {
        return Err(ConfigError::OutOfRange {
            field: "deskew.num_chunks",
            reason: "must be at least 1".to_string(),
        }
        .into());
    }
    let (n0, n1, n2) = volume.dim();
    let input_shape = [n0, n1, n2];
    if input_shape.iter().chain(&output_shape).any(|&n| n == 0) {
        return Err(GeometryError::ShapeTooSmall(input_shape).into());
    }
    if num_chunks == 1 {
        return Ok(backend.affine_transform(volume, map, output_shape, fill_value)?);
    }

    let (j, i) = map.separable_axis().ok_or(GeometryError::NoSeparableAxis)?;
    let n = input_shape[j];
    let num_chunks = num_chunks.min(n);
    let slabs = slab_bounds(n, num_chunks);
    let (m, t) = (map.coefficient(j, i), map.coefficient(j, 3));

    let mut owned: Vec<Option<(usize, usize)>> = vec![None; num_chunks];
    for d in 0..output_shape[i] {
        let k = owner(&slabs, m * d as f64 + t);
        owned[k] = Some(match owned[k] {
            Some((lo, _)) => (lo, d + 1),
            None => (d, d + 1),
        });
    }

    let order: Vec<usize> = if m > 0f64 {
        (0..num_chunks).collect()
    } else {
        (0..num_chunks).rev().collect()
    };
    log::info!(
        "Resampling {:?} into {:?} in {} chunks along source axis {}",
        input_shape,
        output_shape,
        num_chunks,
        j
    );

    let mut output = Volume::from_elem(output_shape, fill_value);
    for k in order {
        let Some((d_lo, d_hi)) = owned[k] else {
            log::debug!("chunk #{k} owns no destination slice");
            continue;
        };
        let (start, end) = slabs[k];
        let (lo, hi) = (start.saturating_sub(1), (end + 1).min(n));
        let slab = volume.slice_axis(Axis(j), Slice::from(lo..hi));

        let mut dest_origin = [0usize; 3];
        dest_origin[i] = d_lo;
        let mut src_origin = [0usize; 3];
        src_origin[j] = lo;
        let chunk_map = map.rebased(dest_origin, src_origin);

        let mut chunk_shape = output_shape;
        chunk_shape[i] = d_hi - d_lo;
        log::debug!(
            "chunk #{k}: source [{lo}, {hi}) -> destination [{d_lo}, {d_hi}) along axis {i}"
        );
        let chunk = backend.affine_transform(slab, &chunk_map, chunk_shape, fill_value)?;
        output
            .slice_axis_mut(Axis(i), Slice::from(d_lo..d_hi))
            .assign(&chunk);
    }
    Ok(output)
}

/// Averages groups of `factor` adjacent axis-0 slices, the last group may be short
pub fn average_slices(volume: ArrayView3<f32>, factor: usize) -> Result<Volume> {
    if factor == 0 {
        return Err(ConfigError::OutOfRange {
            field: "deskew.slice_average_factor",
            reason: "must be at least 1".to_string(),
        }
        .into());
    }
    if factor == 1 {
        return Ok(volume.to_owned());
    }
    let (n0, n1, n2) = volume.dim();
    let mut output = Volume::zeros((n0.div_ceil(factor), n1, n2));
    for (group, mut slice) in volume
        .axis_chunks_iter(Axis(0), factor)
        .zip(output.axis_iter_mut(Axis(0)))
    {
        if let Some(mean) = group.mean_axis(Axis(0)) {
            slice.assign(&mean);
        }
    }
    Ok(output)
}

/// Deskews a raw oblique-scan volume
///
/// Returns the deskewed volume, of shape [ScanGeometry::deskew_shape], and
/// its voxel scale.
pub fn deskew(
    backend: &dyn ComputeBackend,
    volume: ArrayView3<f32>,
    geometry: &ScanGeometry,
    fill_value: f32,
    num_chunks: usize,
) -> Result<(Volume, VoxelScale)> {
    let (n0, n1, n2) = volume.dim();
    let input_shape = [n0, n1, n2];
    let (_, scale) = geometry.deskew_shape(input_shape)?;
    let unaveraged_shape = geometry.unaveraged_shape(input_shape)?;
    let map = geometry.transform_matrix(input_shape)?;
    log::info!(
        "Deskewing {:?} (angle: {}°, shear: {:.4}) into {:?}",
        input_shape,
        geometry.light_sheet_angle_deg,
        geometry.shear(),
        unaveraged_shape
    );
    let resampled = resample(
        backend,
        volume,
        &map,
        unaveraged_shape,
        fill_value,
        num_chunks,
    )?;
    let deskewed = average_slices(resampled.view(), geometry.slice_average_factor)?;
    Ok((deskewed, scale))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{AcceleratedBackend, HostBackend},
        error::Error,
        volume::shape_of,
    };
    use approx::assert_relative_eq;
    use ndarray::Array3;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn noise(shape: (usize, usize, usize), seed: u64) -> Volume {
        let mut rng = StdRng::seed_from_u64(seed);
        Array3::from_shape_fn(shape, |_| rng.gen_range(0f32..100f32))
    }

    fn geometry(angle: f64, ratio: f64, keep_overhang: bool, average: usize) -> ScanGeometry {
        ScanGeometry {
            pixel_size: 0.116,
            light_sheet_angle_deg: angle,
            scan_step_to_pixel_ratio: ratio,
            keep_overhang,
            slice_average_factor: average,
        }
    }

    #[test]
    fn slabs() {
        assert_eq!(slab_bounds(10, 3), vec![(0, 4), (4, 7), (7, 10)]);
        assert_eq!(slab_bounds(4, 4), vec![(0, 1), (1, 2), (2, 3), (3, 4)]);
        let slabs = slab_bounds(10, 3);
        assert_eq!(owner(&slabs, -3.2), 0);
        assert_eq!(owner(&slabs, 4.0), 1);
        assert_eq!(owner(&slabs, 6.99), 1);
        assert_eq!(owner(&slabs, 12.0), 2);
    }

    #[test]
    fn deskewed_shape_matches_geometry() {
        let volume = noise((9, 7, 5), 1);
        for (angle, ratio, keep, average) in [
            (30f64, 0.5, true, 1),
            (30f64, 0.5, false, 2),
            (45f64, 1.35, true, 3),
            (12.5, 0.8, true, 4),
            (0f64, 1f64, false, 1),
        ] {
            let g = geometry(angle, ratio, keep, average);
            let (deskewed, scale) = deskew(&HostBackend, volume.view(), &g, 0f32, 1).unwrap();
            let (shape, expected_scale) = g.deskew_shape([9, 7, 5]).unwrap();
            assert_eq!(shape_of(&deskewed), shape);
            assert_eq!(scale, expected_scale);
        }
    }

    #[test]
    fn no_shear_returns_input() {
        let volume = noise((8, 6, 5), 2);
        let g = geometry(0f64, 1.35, true, 1);
        let (deskewed, _) = deskew(&HostBackend, volume.view(), &g, -1f32, 2).unwrap();
        assert_eq!(deskewed.dim(), volume.dim());
        for (a, b) in deskewed.iter().zip(volume.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-4);
        }
    }

    #[test]
    fn chunking_is_invisible() {
        let volume = noise((12, 9, 10), 3);
        let g = geometry(30f64, 0.5, true, 1);
        let backend = AcceleratedBackend::new(2, None).unwrap();
        let (reference, _) = deskew(&backend, volume.view(), &g, 80f32, 1).unwrap();
        for num_chunks in [2, 4] {
            let (chunked, _) = deskew(&backend, volume.view(), &g, 80f32, num_chunks).unwrap();
            assert_eq!(chunked.dim(), reference.dim());
            for (a, b) in chunked.iter().zip(reference.iter()) {
                assert_relative_eq!(a, b, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn chunking_with_reversed_axis() {
        let volume = noise((5, 4, 11), 4);
        let flip = AffineMap::from_rows([
            [1f64, 0.3, 0f64, -0.5],
            [0f64, 1f64, 0f64, 0f64],
            [0f64, 0f64, -1f64, 10f64],
        ])
        .unwrap();
        let reference = resample(&HostBackend, volume.view(), &flip, [6, 4, 11], 0f32, 1).unwrap();
        for num_chunks in [2, 3, 4, 50] {
            let chunked = resample(
                &HostBackend,
                volume.view(),
                &flip,
                [6, 4, 11],
                0f32,
                num_chunks,
            )
            .unwrap();
            for (a, b) in chunked.iter().zip(reference.iter()) {
                assert_relative_eq!(a, b, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn sheared_voxel_lands_on_its_tilt_row() {
        // k = sin(30°)/0.5 = 1: raw voxel (s, t, x) moves to (s + t, t, x)
        let mut volume = Volume::zeros((6, 5, 3));
        volume[[2, 3, 1]] = 10f32;
        let g = geometry(30f64, 0.5, true, 1);
        let (deskewed, _) = deskew(&HostBackend, volume.view(), &g, 0f32, 1).unwrap();
        assert_eq!(deskewed.dim(), (10, 5, 3));
        assert_relative_eq!(deskewed[[5, 3, 1]], 10f32, epsilon = 1e-4);
        assert_relative_eq!(deskewed.sum(), 10f32, epsilon = 1e-3);
    }

    #[test]
    fn zero_chunks_is_a_configuration_error() {
        let volume = noise((4, 4, 4), 5);
        let err = resample(
            &HostBackend,
            volume.view(),
            &AffineMap::identity(),
            [4, 4, 4],
            0f32,
            0,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn fully_mixed_map_cannot_be_chunked() {
        let volume = noise((4, 4, 4), 6);
        let mixed = AffineMap::from_rows([
            [1f64, 0.2, 0f64, 0f64],
            [0f64, 1f64, 0.2, 0f64],
            [0.2, 0f64, 1f64, 0f64],
        ])
        .unwrap();
        let err = resample(&HostBackend, volume.view(), &mixed, [4, 4, 4], 0f32, 2).unwrap_err();
        assert!(matches!(
            err,
            Error::Geometry(GeometryError::NoSeparableAxis)
        ));
        assert!(resample(&HostBackend, volume.view(), &mixed, [4, 4, 4], 0f32, 1).is_ok());
    }

    #[test]
    fn memory_exhaustion_is_not_retried() {
        let volume = noise((8, 8, 8), 7);
        // one chunk needs 2 x 512 floats
        let backend = AcceleratedBackend::new(1, Some(3000)).unwrap();
        let map = AffineMap::identity();
        let err = resample(&backend, volume.view(), &map, [8, 8, 8], 0f32, 1).unwrap_err();
        assert!(matches!(err, Error::Backend(ref e) if e.is_resource()));
        assert!(resample(&backend, volume.view(), &map, [8, 8, 8], 0f32, 4).is_ok());
    }

    #[test]
    fn slice_averaging() {
        let volume = Array3::from_shape_fn((5, 2, 2), |(i, _, _)| i as f32);
        let averaged = average_slices(volume.view(), 2).unwrap();
        assert_eq!(averaged.dim(), (3, 2, 2));
        assert_relative_eq!(averaged[[0, 0, 0]], 0.5);
        assert_relative_eq!(averaged[[1, 1, 1]], 2.5);
        assert_relative_eq!(averaged[[2, 0, 1]], 4f32);
        assert!(average_slices(volume.view(), 0).is_err());
    }
}
