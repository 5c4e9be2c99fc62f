//! Analysis settings
//!
//! The settings are read once from a JSON document, validated and then passed
//! by reference through the pipeline. Validation happens before any
//! computation: a settings object that exists is a valid one.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::geometry::ScanGeometry;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read settings file {1:?}")]
    Read(#[source] io::Error, PathBuf),
    #[error("failed to parse settings")]
    Parse(#[from] serde_json::Error),
    #[error("invalid setting `{field}`: {reason}")]
    OutOfRange { field: &'static str, reason: String },
}
type Result<T> = std::result::Result<T, ConfigError>;

fn out_of_range<T>(field: &'static str, reason: impl ToString) -> Result<T> {
    Err(ConfigError::OutOfRange {
        field,
        reason: reason.to_string(),
    })
}

/// Scan geometry and resampling parameters of the deskew step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeskewSettings {
    /// Camera pixel size in the sample plane [µm]
    pub pixel_size: f64,
    /// Light-sheet angle [degree]
    pub light_sheet_angle_deg: f64,
    /// Scan step over pixel size
    pub scan_step_to_pixel_ratio: f64,
    pub keep_overhang: bool,
    #[serde(default = "one")]
    pub slice_average_factor: usize,
    /// Intensity given to voxels sampled outside the raw volume
    #[serde(default)]
    pub fill_value: f32,
    #[serde(default = "one")]
    pub num_chunks: usize,
}
fn one() -> usize {
    1
}
impl DeskewSettings {
    pub fn geometry(&self) -> ScanGeometry {
        ScanGeometry {
            pixel_size: self.pixel_size,
            light_sheet_angle_deg: self.light_sheet_angle_deg,
            scan_step_to_pixel_ratio: self.scan_step_to_pixel_ratio,
            keep_overhang: self.keep_overhang,
            slice_average_factor: self.slice_average_factor,
        }
    }
    fn validate(&self) -> Result<()> {
        self.geometry()
            .validate()
            .or_else(|e| out_of_range("deskew", e))?;
        if !self.fill_value.is_finite() {
            return out_of_range("deskew.fill_value", "must be finite");
        }
        if self.num_chunks == 0 {
            return out_of_range("deskew.num_chunks", "must be at least 1");
        }
        Ok(())
    }
}

/// Array computation backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Sequential host loops
    Host,
    /// Dedicated data-parallel pool with a memory budget
    #[default]
    Accelerated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ComputeSettings {
    pub backend: BackendKind,
    /// Worker threads of the accelerated backend, 0 for one per core
    pub threads: usize,
    /// Memory budget of the accelerated backend [MiB], unbounded if missing
    pub device_memory_mb: Option<u64>,
}
impl Default for ComputeSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            threads: 0,
            device_memory_mb: None,
        }
    }
}
impl ComputeSettings {
    /// Memory budget in bytes, `None` if unbounded or not addressable
    pub fn device_memory_bytes(&self) -> Option<usize> {
        self.device_memory_mb
            .and_then(|mb| usize::try_from(mb).ok())
            .and_then(|mb| mb.checked_mul(1 << 20))
    }
    fn validate(&self) -> Result<()> {
        match self.device_memory_mb {
            Some(0) => out_of_range("compute.device_memory_mb", "must be positive"),
            Some(mb) if self.device_memory_bytes().is_none() => out_of_range(
                "compute.device_memory_mb",
                format!("{mb} MiB overflows the addressable memory"),
            ),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DetectionSettings {
    /// Minimum distance between two beads [µm]
    pub min_distance: f64,
    /// Detection threshold in noise standard deviations above background
    pub threshold_sigma: f64,
    /// Minimum peak height as a fraction of the volume dynamic range
    pub min_prominence: f64,
    /// Widening of the search window along the scan axis of raw volumes
    pub raw_scan_elongation: f64,
    pub max_num_peaks: usize,
    /// Voxels ignored along each volume edge
    pub exclude_border: [usize; 3],
    pub sigma_clip_iterations: usize,
    pub sigma_clip_factor: f64,
}
impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            min_distance: 2.0,
            threshold_sigma: 5.0,
            min_prominence: 0.1,
            raw_scan_elongation: 3.0,
            max_num_peaks: 1000,
            exclude_border: [0; 3],
            sigma_clip_iterations: 5,
            sigma_clip_factor: 3.0,
        }
    }
}
impl DetectionSettings {
    fn validate(&self) -> Result<()> {
        if !(self.min_distance.is_finite() && self.min_distance > 0f64) {
            return out_of_range("detection.min_distance", "must be positive");
        }
        if !(self.threshold_sigma.is_finite() && self.threshold_sigma >= 0f64) {
            return out_of_range("detection.threshold_sigma", "must be non-negative");
        }
        if !(0f64..1f64).contains(&self.min_prominence) {
            return out_of_range("detection.min_prominence", "must be in [0,1[");
        }
        if !(self.raw_scan_elongation.is_finite() && self.raw_scan_elongation >= 1f64) {
            return out_of_range("detection.raw_scan_elongation", "must be at least 1");
        }
        if self.max_num_peaks == 0 {
            return out_of_range("detection.max_num_peaks", "must be at least 1");
        }
        if !(self.sigma_clip_factor.is_finite() && self.sigma_clip_factor > 0f64) {
            return out_of_range("detection.sigma_clip_factor", "must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ExtractionSettings {
    /// Bead patch size along each axis [µm]
    pub patch_size: [f64; 3],
}
impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            patch_size: [2.5, 2.0, 2.0],
        }
    }
}
impl ExtractionSettings {
    fn validate(&self) -> Result<()> {
        if self
            .patch_size
            .iter()
            .any(|p| !(p.is_finite() && *p > 0f64))
        {
            return out_of_range(
                "extraction.patch_size",
                format!("must be positive, found {:?}", self.patch_size),
            );
        }
        Ok(())
    }
}

/// Gaussian fit tolerances
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FitSettings {
    pub max_iterations: usize,
    /// Relative reduction of the cost below which the fit has converged
    pub ftol: f64,
    /// Relative parameter step below which the fit has converged
    pub xtol: f64,
}
impl Default for FitSettings {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            ftol: 1e-10,
            xtol: 1e-10,
        }
    }
}
impl FitSettings {
    fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return out_of_range("fit.max_iterations", "must be at least 1");
        }
        if !(self.ftol > 0f64 && self.ftol < 1f64) {
            return out_of_range("fit.ftol", "must be in ]0,1[");
        }
        if !(self.xtol > 0f64 && self.xtol < 1f64) {
            return out_of_range("fit.xtol", "must be in ]0,1[");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ReportSettings {
    /// Lower bound of a plausible FWHM per axis [µm]
    pub fwhm_min: [f64; 3],
    /// Upper bound of a plausible FWHM per axis [µm]
    pub fwhm_max: [f64; 3],
    /// Shows progress bars
    pub progress: bool,
}
impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            fwhm_min: [0f64; 3],
            fwhm_max: [5.0, 2.0, 2.0],
            progress: false,
        }
    }
}
impl ReportSettings {
    fn validate(&self) -> Result<()> {
        for k in 0..3 {
            if !(self.fwhm_min[k] >= 0f64 && self.fwhm_min[k] < self.fwhm_max[k]) {
                return out_of_range(
                    "report.fwhm_min/fwhm_max",
                    format!("axis {k}: expected 0 <= min < max"),
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeconvolveSettings {
    pub regularization_strength: f64,
}
impl DeconvolveSettings {
    fn validate(&self) -> Result<()> {
        if !(self.regularization_strength.is_finite() && self.regularization_strength > 0f64) {
            return out_of_range("deconvolve.regularization_strength", "must be positive");
        }
        Ok(())
    }
}

/// The complete analysis settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub deskew: Option<DeskewSettings>,
    #[serde(default)]
    pub compute: ComputeSettings,
    #[serde(default)]
    pub detection: DetectionSettings,
    #[serde(default)]
    pub extraction: ExtractionSettings,
    #[serde(default)]
    pub fit: FitSettings,
    #[serde(default)]
    pub report: ReportSettings,
    #[serde(default)]
    pub deconvolve: Option<DeconvolveSettings>,
}
impl Settings {
    /// Loads and validates the settings from a JSON file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents =
            fs::read_to_string(path).map_err(|e| ConfigError::Read(e, path.to_path_buf()))?;
        log::info!("Loading settings from {:?}", path);
        Self::from_json(&contents)
    }
    /// Parses and validates the settings from a JSON string
    pub fn from_json(contents: &str) -> Result<Self> {
        let settings: Settings = serde_json::from_str(contents)?;
        settings.validate()?;
        Ok(settings)
    }
    pub fn validate(&self) -> Result<()> {
        if let Some(deskew) = &self.deskew {
            deskew.validate()?;
        }
        self.compute.validate()?;
        self.detection.validate()?;
        self.extraction.validate()?;
        self.fit.validate()?;
        self.report.validate()?;
        if let Some(deconvolve) = &self.deconvolve {
            deconvolve.validate()?;
        }
        Ok(())
    }
    /// The deskew section, required by deskewing operations
    pub fn deskew(&self) -> Result<&DeskewSettings> {
        self.deskew.as_ref().ok_or(ConfigError::OutOfRange {
            field: "deskew",
            reason: "section is missing".to_string(),
        })
    }
    /// The deconvolve section, required by deconvolution
    pub fn deconvolve(&self) -> Result<&DeconvolveSettings> {
        self.deconvolve.as_ref().ok_or(ConfigError::OutOfRange {
            field: "deconvolve",
            reason: "section is missing".to_string(),
        })
    }
}
