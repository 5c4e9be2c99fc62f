//! # Light-sheet deskew & PSF metrology
//!
//! Oblique-scan light-sheet microscopes record volumes in a sheared frame:
//! the scan axis is tilted with respect to the detection axis by the
//! light-sheet angle. This crate
//!  - derives the affine map and the shape of the deskewed volume from the
//!    scan geometry ([geometry]) and resamples large volumes chunk by chunk on
//!    a [backend] ([resample]),
//!  - measures the point-spread function of the microscope from images of
//!    sub-resolution beads: peak detection ([peaks]), patch extraction
//!    ([extract]), 3-D Gaussian fits and half-maximum widths ([fit]) and
//!    reports ([report]),
//!  - deconvolves volumes with a measured PSF ([deconvolve]).
//!
//! Volumes are read from and written to a directory [store]; the analysis is
//! driven from a JSON [config] through the [pipeline].
//!
//! ```no_run
//! use lightsheet_psf::{config::Settings, pipeline::{Passes, Pipeline}, store::Position};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::from_path("psf_settings.json")?;
//! let (volume, meta) = Position::open("beads/A/1/000000")?.read()?;
//! Pipeline::new(&settings)?.run(volume.view(), meta.scale, Passes::default(), "psf_report")?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod deconvolve;
pub mod error;
pub mod extract;
pub mod fit;
pub mod geometry;
pub mod peaks;
pub mod pipeline;
pub mod report;
pub mod resample;
pub mod store;
pub mod volume;

#[cfg(test)]
mod test_util;

pub use error::{Error, Result};
pub use geometry::{AffineMap, ScanGeometry};
pub use volume::{AxisLabels, Volume, VoxelScale};
