//! PSF characterization pipeline
//!
//! [Pipeline::run] is the single entry point: it characterizes the raw
//! volume (detect, extract, fit, report) and, on request, deskews it and
//! characterizes the deskewed volume again with the geometry voxel size.
//! The two passes are reported independently; beads are not matched across
//! frames.

use std::path::Path;

use ndarray::ArrayView3;

use crate::{
    backend::{self, ComputeBackend},
    config::Settings,
    error::Result,
    extract::extract,
    fit::analyze,
    peaks::PeakDetector,
    report::ReportData,
    resample,
    volume::{AxisLabels, Volume, VoxelScale},
};

/// Characterization passes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Passes {
    /// The volume in the acquisition frame
    pub raw: bool,
    /// The deskewed volume
    pub deskewed: bool,
}
impl Default for Passes {
    fn default() -> Self {
        Self {
            raw: true,
            deskewed: false,
        }
    }
}

/// Reports of the passes that ran
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub raw: Option<ReportData>,
    pub deskewed: Option<ReportData>,
}

pub struct Pipeline<'a> {
    settings: &'a Settings,
    backend: Box<dyn ComputeBackend>,
}
impl<'a> Pipeline<'a> {
    /// Creates a pipeline with the backend selected in the settings
    pub fn new(settings: &'a Settings) -> Result<Self> {
        Ok(Self {
            settings,
            backend: backend::select(&settings.compute)?,
        })
    }
    pub fn with_backend(settings: &'a Settings, backend: Box<dyn ComputeBackend>) -> Self {
        Self { settings, backend }
    }
    pub fn settings(&self) -> &Settings {
        self.settings
    }
    pub fn backend(&self) -> &dyn ComputeBackend {
        self.backend.as_ref()
    }
    /// Voxel scale of a raw volume
    ///
    /// The scan geometry takes precedence over the volume metadata.
    pub fn raw_scale(&self, volume_scale: VoxelScale) -> Result<VoxelScale> {
        let Some(deskew) = &self.settings.deskew else {
            return Ok(volume_scale);
        };
        let calibration = deskew.geometry().raw_voxel_scale()?;
        if !calibration.approx_eq(&volume_scale, 1e-6) {
            log::warn!(
                "volume voxel size {} differs from the scan geometry voxel size {}, using the latter",
                volume_scale,
                calibration
            );
        }
        Ok(calibration)
    }
    /// Detects, extracts and fits the beads of a volume
    pub fn characterize(
        &self,
        volume: ArrayView3<f32>,
        scale: VoxelScale,
        axis_labels: AxisLabels,
    ) -> Result<ReportData> {
        log::info!(
            "Characterizing the PSF in the {} frame, voxel size: {}",
            axis_labels,
            scale
        );
        let peaks = PeakDetector::new(&self.settings.detection, scale).detect(
            self.backend(),
            volume.view(),
            axis_labels.is_raw(),
        )?;
        let beads = extract(
            volume.view(),
            &peaks,
            &scale,
            self.settings.extraction.patch_size,
        );
        let analyses = analyze(&beads.patches, &scale, self.settings);
        Ok(ReportData::new(
            &peaks,
            &beads,
            &analyses,
            scale,
            axis_labels,
            &self.settings.report,
        )?)
    }
    /// Deskews a raw volume with the settings geometry
    pub fn deskew(&self, volume: ArrayView3<f32>) -> Result<(Volume, VoxelScale)> {
        let deskew = self.settings.deskew()?;
        resample::deskew(
            self.backend(),
            volume,
            &deskew.geometry(),
            deskew.fill_value,
            deskew.num_chunks,
        )
    }
    /// Runs the requested passes on a raw volume, writing each report in its own directory
    ///
    /// The raw report goes to `output_dir/raw`, the deskewed one to `output_dir/deskewed`.
    pub fn run(
        &self,
        volume: ArrayView3<f32>,
        volume_scale: VoxelScale,
        passes: Passes,
        output_dir: impl AsRef<Path>,
    ) -> Result<PipelineReport> {
        let output_dir = output_dir.as_ref();
        if passes.deskewed {
            self.settings.deskew()?;
        }
        let mut report = PipelineReport::default();
        let raw_scale = self.raw_scale(volume_scale)?;
        if passes.raw {
            let data = self.characterize(volume.view(), raw_scale, AxisLabels::Raw)?;
            data.generate(output_dir.join("raw"))?;
            report.raw = Some(data);
        }
        if passes.deskewed {
            let (deskewed, scale) = self.deskew(volume.view())?;
            let data = self.characterize(deskewed.view(), scale, AxisLabels::Corrected)?;
            data.generate(output_dir.join("deskewed"))?;
            report.deskewed = Some(data);
        }
        Ok(report)
    }
}
