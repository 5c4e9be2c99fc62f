//! Fourier-space deconvolution with a measured PSF
//!
//! The PSF is zero-padded to the shape of the data and its normalized
//! modulus transfer function `H` is applied as the Tikhonov-regularized
//! inverse filter `H / (H² + λ)`.

use ndarray::{s, Array3, ArrayView3, Axis, Zip};
use rustfft::{num_complex::Complex64, FftDirection, FftPlanner};

use crate::{
    config::DeconvolveSettings,
    geometry::GeometryError,
    volume::{Shape, Volume, VoxelScale},
};

/// Centres the PSF in a zero volume of shape `shape`
///
/// An odd padding puts the extra voxel after the PSF.
pub fn pad_psf(psf: ArrayView3<f32>, shape: Shape) -> Result<Volume, GeometryError> {
    let (p0, p1, p2) = psf.dim();
    let psf_shape = [p0, p1, p2];
    if shape.iter().any(|&n| n == 0) || (0..3).any(|k| psf_shape[k] > shape[k]) {
        return Err(GeometryError::ShapeTooSmall(shape));
    }
    let before = [0, 1, 2].map(|k| (shape[k] - psf_shape[k]) / 2);
    let mut padded = Volume::zeros(shape);
    padded
        .slice_mut(s![
            before[0]..before[0] + p0,
            before[1]..before[1] + p1,
            before[2]..before[2] + p2
        ])
        .assign(&psf);
    Ok(padded)
}

/// In-place n-dimensional FFT, one axis after the other
fn fft3(data: &mut Array3<Complex64>, direction: FftDirection) {
    let mut planner = FftPlanner::<f64>::new();
    for axis in 0..3 {
        let n = data.len_of(Axis(axis));
        let fft = planner.plan_fft(n, direction);
        Zip::from(data.lanes_mut(Axis(axis))).par_for_each(|mut lane| {
            let mut buffer: Vec<Complex64> = lane.iter().copied().collect();
            fft.process(&mut buffer);
            lane.iter_mut().zip(buffer).for_each(|(x, y)| *x = y);
        });
    }
    if let FftDirection::Inverse = direction {
        let norm = 1f64 / data.len() as f64;
        data.par_mapv_inplace(|x| x * norm);
    }
}

fn to_complex(volume: &ArrayView3<f32>) -> Array3<Complex64> {
    volume.mapv(|x| Complex64::new(x as f64, 0f64))
}

/// Modulus of the PSF spectrum normalized to 1
pub fn transfer_function(psf: ArrayView3<f32>, shape: Shape) -> Result<Array3<f64>, GeometryError> {
    let padded = pad_psf(psf, shape)?;
    let mut spectrum = to_complex(&padded.view());
    fft3(&mut spectrum, FftDirection::Forward);
    let modulus = spectrum.mapv(|x| x.norm());
    let max = modulus.iter().copied().fold(0f64, f64::max);
    Ok(if max > 0f64 {
        modulus / max
    } else {
        modulus
    })
}

/// Deconvolves `data` with `psf`
///
/// A PSF sampled with another voxel size is used as is after a warning.
pub fn deconvolve(
    data: ArrayView3<f32>,
    data_scale: &VoxelScale,
    psf: ArrayView3<f32>,
    psf_scale: &VoxelScale,
    settings: &DeconvolveSettings,
) -> Result<Volume, GeometryError> {
    if !data_scale.approx_eq(psf_scale, 1e-6) {
        log::warn!(
            "PSF voxel size {} does not match the data voxel size {}, consider resampling the PSF",
            psf_scale,
            data_scale
        );
    }
    let shape = {
        let (n0, n1, n2) = data.dim();
        [n0, n1, n2]
    };
    log::info!(
        "Deconvolving {:?} with a {:?} PSF (regularization: {})",
        shape,
        psf.dim(),
        settings.regularization_strength
    );
    let h = transfer_function(psf, shape)?;
    let lambda = settings.regularization_strength;

    let mut spectrum = to_complex(&data);
    fft3(&mut spectrum, FftDirection::Forward);
    Zip::from(&mut spectrum)
        .and(&h)
        .par_for_each(|x, &h| *x *= h / (h * h + lambda));
    fft3(&mut spectrum, FftDirection::Inverse);
    Ok(spectrum.mapv(|x| x.re as f32))
}
