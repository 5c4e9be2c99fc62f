//! Oblique-scan geometry
//!
//! A raw voxel `(s, t, x)` (SCAN, TILT, COVERSLIP) of a light-sheet volume
//! acquired with a sheet tilted by `θ` sits at the physical location
//!
//! ```text
//! P0 = s·step + t·px·sin θ
//! P1 = t·px·cos θ
//! P2 = x·px
//! ```
//!
//! where `px` is the pixel size and `step = ratio·px` the scan step.
//! The deskewed volume samples `P0` every `step`, `P1` every `px·cos θ` and
//! `P2` every `px`, so that every tilt row `t` is shifted along the scan axis
//! by `k·t` indices with `k = sin θ / ratio`.
//!
//! Affine maps go from the destination (deskewed) index frame to the source
//! (raw) index frame, the convention of the resampler.

use nalgebra::{Matrix3, Matrix4, Vector3, Vector4};
use serde::{Deserialize, Serialize};

use crate::volume::{Shape, VoxelScale};

/// Largest condition number accepted for the linear part of an [AffineMap]
pub const MAX_CONDITION_NUMBER: f64 = 1e12;

#[derive(Debug, thiserror::Error)]
pub enum GeometryError {
    #[error("invalid scan geometry parameter `{0}`: {1}")]
    Parameter(&'static str, f64),
    #[error("volume shape {0:?} is too small to be deskewed")]
    ShapeTooSmall(Shape),
    #[error("malformed affine matrix: {0}")]
    Malformed(String),
    #[error("the linear part of the affine matrix is singular")]
    Singular,
    #[error("the affine matrix is ill-conditioned (condition number: {0:e})")]
    IllConditioned(f64),
    #[error("the affine matrix shears every axis, the volume cannot be chunked")]
    NoSeparableAxis,
}
type Result<T> = std::result::Result<T, GeometryError>;

/// Light-sheet scan geometry
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanGeometry {
    /// Pixel size in the sample plane [µm]
    pub pixel_size: f64,
    /// Light-sheet angle [degree], `0` for a sheet orthogonal to the scan
    pub light_sheet_angle_deg: f64,
    /// Scan step over pixel size
    pub scan_step_to_pixel_ratio: f64,
    /// Keeps the sheared corners of the volume
    pub keep_overhang: bool,
    /// Number of adjacent deskewed slices averaged along the scan axis
    pub slice_average_factor: usize,
}
impl ScanGeometry {
    pub fn validate(&self) -> Result<()> {
        if !(self.pixel_size.is_finite() && self.pixel_size > 0f64) {
            return Err(GeometryError::Parameter("pixel_size", self.pixel_size));
        }
        if !(0f64..90f64).contains(&self.light_sheet_angle_deg) {
            return Err(GeometryError::Parameter(
                "light_sheet_angle_deg",
                self.light_sheet_angle_deg,
            ));
        }
        if !(self.scan_step_to_pixel_ratio.is_finite() && self.scan_step_to_pixel_ratio > 0f64) {
            return Err(GeometryError::Parameter(
                "scan_step_to_pixel_ratio",
                self.scan_step_to_pixel_ratio,
            ));
        }
        if self.slice_average_factor == 0 {
            return Err(GeometryError::Parameter("slice_average_factor", 0f64));
        }
        Ok(())
    }
    /// Scan indices a tilt row is displaced by
    pub fn shear(&self) -> f64 {
        shear(self.light_sheet_angle_deg, self.scan_step_to_pixel_ratio)
    }
    /// Raw volume voxel scale (SCAN, TILT, COVERSLIP)
    pub fn raw_voxel_scale(&self) -> Result<VoxelScale> {
        self.validate()?;
        VoxelScale::new([
            self.scan_step_to_pixel_ratio * self.pixel_size,
            self.pixel_size,
            self.pixel_size,
        ])
        .map_err(|_| GeometryError::Parameter("pixel_size", self.pixel_size))
    }
    /// See [deskew_shape]
    pub fn deskew_shape(&self, input_shape: Shape) -> Result<(Shape, VoxelScale)> {
        self.validate()?;
        deskew_shape(
            input_shape,
            self.light_sheet_angle_deg,
            self.scan_step_to_pixel_ratio,
            self.keep_overhang,
            self.slice_average_factor,
            self.pixel_size,
        )
    }
    /// Deskewed shape before slice averaging
    pub fn unaveraged_shape(&self, input_shape: Shape) -> Result<Shape> {
        self.validate()?;
        deskew_shape(
            input_shape,
            self.light_sheet_angle_deg,
            self.scan_step_to_pixel_ratio,
            self.keep_overhang,
            1,
            self.pixel_size,
        )
        .map(|(shape, _)| shape)
    }
    /// See [transform_matrix]
    pub fn transform_matrix(&self, input_shape: Shape) -> Result<AffineMap> {
        self.validate()?;
        transform_matrix(
            input_shape,
            self.light_sheet_angle_deg,
            self.scan_step_to_pixel_ratio,
            self.keep_overhang,
        )
    }
}

fn shear(angle_deg: f64, ratio: f64) -> f64 {
    angle_deg.to_radians().sin() / ratio
}

fn check_shape(shape: Shape) -> Result<()> {
    if shape.iter().any(|&n| n == 0) {
        Err(GeometryError::ShapeTooSmall(shape))
    } else {
        Ok(())
    }
}

/// Computes the deskewed volume shape and voxel scale
///
/// The scan extent is just large enough to hold the whole sheared volume
/// when `keep_overhang` is set, otherwise it is cropped to the raw scan
/// extent. The scan axis is then reduced by averaging `average_n_slices`
/// adjacent slices, which scales the scan component of the voxel size.
pub fn deskew_shape(
    input_shape: Shape,
    light_sheet_angle_deg: f64,
    scan_step_to_pixel_ratio: f64,
    keep_overhang: bool,
    average_n_slices: usize,
    pixel_size: f64,
) -> Result<(Shape, VoxelScale)> {
    check_shape(input_shape)?;
    if average_n_slices == 0 {
        return Err(GeometryError::Parameter("slice_average_factor", 0f64));
    }
    let [s, t, x] = input_shape;
    let k = shear(light_sheet_angle_deg, scan_step_to_pixel_ratio);
    let scan_extent = if keep_overhang {
        ((s - 1) as f64 + (t - 1) as f64 * k + 1e-9).floor() as usize + 1
    } else {
        s
    };
    let averaged_extent = scan_extent.div_ceil(average_n_slices);
    let theta = light_sheet_angle_deg.to_radians();
    let voxel_scale = VoxelScale::new([
        average_n_slices as f64 * scan_step_to_pixel_ratio * pixel_size,
        pixel_size * theta.cos(),
        pixel_size,
    ])
    .map_err(|_| GeometryError::Parameter("pixel_size", pixel_size))?;
    Ok(([averaged_extent, t, x], voxel_scale))
}

/// Computes the affine map from the deskewed frame to the raw frame
///
/// `s = a - k·b + shift`, `t = b`, `x = c`: with the overhang kept, `shift`
/// is 0 and every raw voxel lands at a non-negative deskewed index; when
/// cropping, the window is centred on the sheared scan extent.
pub fn transform_matrix(
    input_shape: Shape,
    light_sheet_angle_deg: f64,
    scan_step_to_pixel_ratio: f64,
    keep_overhang: bool,
) -> Result<AffineMap> {
    check_shape(input_shape)?;
    let t = input_shape[1];
    let k = shear(light_sheet_angle_deg, scan_step_to_pixel_ratio);
    let shift = if keep_overhang {
        0f64
    } else {
        ((t - 1) as f64 * k / 2f64 + 1e-9).floor()
    };
    AffineMap::from_rows([
        [1f64, -k, 0f64, shift],
        [0f64, 1f64, 0f64, 0f64],
        [0f64, 0f64, 1f64, 0f64],
    ])
}

/// Homogeneous 4x4 map from destination to source index coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineMap(Matrix4<f64>);
impl AffineMap {
    /// Validates and wraps a 4x4 homogeneous matrix
    pub fn new(matrix: Matrix4<f64>) -> Result<Self> {
        if matrix.iter().any(|x| !x.is_finite()) {
            return Err(GeometryError::Malformed("non-finite entry".into()));
        }
        let last_row = matrix.row(3);
        if last_row[0] != 0f64 || last_row[1] != 0f64 || last_row[2] != 0f64 || last_row[3] != 1f64
        {
            return Err(GeometryError::Malformed(format!(
                "last row must be (0,0,0,1), found ({}, {}, {}, {})",
                last_row[0], last_row[1], last_row[2], last_row[3]
            )));
        }
        let linear: Matrix3<f64> = matrix.fixed_view::<3, 3>(0, 0).into_owned();
        let singular_values = linear.svd(false, false).singular_values;
        let (min, max) = (singular_values.min(), singular_values.max());
        if min <= 0f64 || linear.determinant() == 0f64 {
            return Err(GeometryError::Singular);
        }
        let condition_number = max / min;
        if condition_number > MAX_CONDITION_NUMBER {
            return Err(GeometryError::IllConditioned(condition_number));
        }
        Ok(Self(matrix))
    }
    /// Builds the map from its 3 first rows, the last one being (0,0,0,1)
    pub fn from_rows(rows: [[f64; 4]; 3]) -> Result<Self> {
        let [r0, r1, r2] = rows;
        Self::new(Matrix4::new(
            r0[0], r0[1], r0[2], r0[3], r1[0], r1[1], r1[2], r1[3], r2[0], r2[1], r2[2], r2[3],
            0f64, 0f64, 0f64, 1f64,
        ))
    }
    pub fn identity() -> Self {
        Self(Matrix4::identity())
    }
    /// Pure translation: `src = dest + offset`
    pub fn translation(offset: [f64; 3]) -> Self {
        Self(Matrix4::new_translation(&Vector3::from(offset)))
    }
    pub fn matrix(&self) -> &Matrix4<f64> {
        &self.0
    }
    pub fn linear(&self) -> Matrix3<f64> {
        self.0.fixed_view::<3, 3>(0, 0).into_owned()
    }
    pub fn offset(&self) -> Vector3<f64> {
        self.0.fixed_view::<3, 1>(0, 3).into_owned()
    }
    /// Coefficient of the source axis `row` with respect to the destination axis `col`
    pub fn coefficient(&self, row: usize, col: usize) -> f64 {
        self.0[(row, col)]
    }
    /// Maps a destination coordinate to the source frame
    pub fn apply(&self, dest: [f64; 3]) -> [f64; 3] {
        let src = self.0 * Vector4::new(dest[0], dest[1], dest[2], 1f64);
        [src.x, src.y, src.z]
    }
    /// The source to destination map
    pub fn inverse(&self) -> Result<Self> {
        self.0
            .try_inverse()
            .ok_or(GeometryError::Singular)
            .map(Self)
    }
    /// Re-bases the map onto a destination sub-volume starting at `dest_origin`
    /// and a source sub-volume starting at `src_origin`
    pub(crate) fn rebased(&self, dest_origin: [usize; 3], src_origin: [usize; 3]) -> Self {
        let mut matrix = self.0;
        let shift = self.linear() * Vector3::from(dest_origin.map(|x| x as f64))
            - Vector3::from(src_origin.map(|x| x as f64));
        for k in 0..3 {
            matrix[(k, 3)] += shift[k];
        }
        Self(matrix)
    }
    /// Finds the highest source axis mapped one-to-one onto a single destination axis
    ///
    /// Returns `(source axis, destination axis)`: the source row has a single
    /// non-zero coefficient and no other source axis depends on that
    /// destination axis.
    pub fn separable_axis(&self) -> Option<(usize, usize)> {
        let linear = self.linear();
        (0..3).rev().find_map(|j| {
            let nonzero: Vec<usize> = (0..3).filter(|&i| linear[(j, i)] != 0f64).collect();
            match nonzero.as_slice() {
                &[i] if (0..3).all(|r| r == j || linear[(r, i)] == 0f64) => Some((j, i)),
                _ => None,
            }
        })
    }
}
