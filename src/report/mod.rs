//! PSF report
//!
//! [ReportData] pairs every extracted bead with its peak and its analysis
//! and summarizes the widths over the valid fits. [ReportData::generate]
//! writes the tables, the fitted-parameter document, a markdown report and,
//! with the `plot` feature, the FWHM histograms into a directory.

use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::Serialize;

use crate::{
    config::ReportSettings,
    extract::ExtractedBeads,
    fit::BeadAnalysis,
    peaks::Peak,
    volume::{AxisLabels, VoxelScale},
};

#[cfg(feature = "plot")]
mod plots;
mod tables;

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("failed to create the report directory {1:?}")]
    Directory(#[source] io::Error, PathBuf),
    #[error("failed to write {1:?}")]
    Write(#[source] io::Error, PathBuf),
    #[error("failed to write CSV table")]
    Csv(#[from] csv::Error),
    #[error("failed to serialize the PSF parameters")]
    Json(#[from] serde_json::Error),
    #[error("{0} bead patches but {1} analyses")]
    Misaligned(usize, usize),
    #[cfg(feature = "plot")]
    #[error("failed to draw {0:?}: {1}")]
    Plot(PathBuf, String),
}
type Result<T> = std::result::Result<T, ReportError>;

/// Descriptive statistics of one quantity
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Stats {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}
impl Stats {
    /// Statistics of the finite values, `None` if there is none
    pub fn from_values(values: &[f64]) -> Option<Self> {
        let mut values: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if values.is_empty() {
            return None;
        }
        values.sort_by(|a, b| a.total_cmp(b));
        let n = values.len();
        let mean = values.iter().sum::<f64>() / n as f64;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
        let median = if n % 2 == 0 {
            0.5 * (values[n / 2 - 1] + values[n / 2])
        } else {
            values[n / 2]
        };
        Some(Self {
            count: n,
            mean,
            median,
            std: var.sqrt(),
            min: values[0],
            max: values[n - 1],
        })
    }
}

/// One extracted bead
#[derive(Debug, Clone, Serialize)]
pub struct BeadRecord {
    pub id: usize,
    pub peak: Peak,
    /// Origin of the bead patch in the volume
    pub offset: [usize; 3],
    #[serde(flatten)]
    pub analysis: BeadAnalysis,
    pub outlier: bool,
}

/// Per-axis statistics over the valid fits
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub n_peaks: usize,
    pub n_beads: usize,
    pub n_dropped: usize,
    pub n_valid: usize,
    pub n_outliers: usize,
    /// Gaussian FWHM [µm]
    pub fwhm: [Option<Stats>; 3],
    /// Profile FWHM [µm]
    pub profile_fwhm: [Option<Stats>; 3],
}

/// Report contents
#[derive(Debug, Clone, Serialize)]
pub struct ReportData {
    pub axis_labels: AxisLabels,
    pub voxel_scale: VoxelScale,
    pub peaks: Vec<Peak>,
    pub beads: Vec<BeadRecord>,
    pub summary: Summary,
    #[serde(skip)]
    settings: ReportSettings,
}
impl ReportData {
    pub fn new(
        peaks: &[Peak],
        beads: &ExtractedBeads,
        analyses: &[BeadAnalysis],
        scale: VoxelScale,
        axis_labels: AxisLabels,
        settings: &ReportSettings,
    ) -> Result<Self> {
        if beads.len() != analyses.len() {
            return Err(ReportError::Misaligned(beads.len(), analyses.len()));
        }
        let records: Vec<BeadRecord> = beads
            .patches
            .iter()
            .zip(analyses)
            .enumerate()
            .map(|(id, (patch, analysis))| BeadRecord {
                id,
                peak: patch.peak,
                offset: patch.offset,
                analysis: *analysis,
                outlier: is_outlier(analysis, settings),
            })
            .collect();

        let valid: Vec<&BeadRecord> = records.iter().filter(|r| r.analysis.fit.valid).collect();
        let axis_stats = |value: &dyn Fn(&BeadRecord, usize) -> Option<f64>| {
            [0, 1, 2].map(|k| {
                let values: Vec<f64> = valid.iter().filter_map(|r| value(*r, k)).collect();
                Stats::from_values(&values)
            })
        };
        let summary = Summary {
            n_peaks: peaks.len(),
            n_beads: records.len(),
            n_dropped: beads.dropped,
            n_valid: valid.len(),
            n_outliers: records.iter().filter(|r| r.outlier).count(),
            fwhm: axis_stats(&|r: &BeadRecord, k: usize| Some(r.analysis.fit.fwhm[k])),
            profile_fwhm: axis_stats(&|r: &BeadRecord, k: usize| r.analysis.width.fwhm[k]),
        };
        log::info!(
            "{} beads ({} valid, {} outliers) out of {} peaks",
            summary.n_beads,
            summary.n_valid,
            summary.n_outliers,
            summary.n_peaks
        );
        Ok(Self {
            axis_labels,
            voxel_scale: scale,
            peaks: peaks.to_vec(),
            beads: records,
            summary,
            settings: settings.clone(),
        })
    }
    /// Beads with a valid fit inside the FWHM range
    pub fn inliers(&self) -> impl Iterator<Item = &BeadRecord> {
        self.beads
            .iter()
            .filter(|r| r.analysis.fit.valid && !r.outlier)
    }
    /// Writes the report files into `dir`, created if needed
    pub fn generate(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| ReportError::Directory(e, dir.to_path_buf()))?;
        tables::peaks(self, &dir.join("peaks.csv"))?;
        tables::gaussian_fit(self, &dir.join("gaussian_fit.csv"))?;
        tables::peak_width(self, &dir.join("peak_width.csv"))?;
        tables::summary(self, &dir.join("summary.csv"))?;

        let path = dir.join("psf_parameters.json");
        let file = File::create(&path).map_err(|e| ReportError::Write(e, path.clone()))?;
        serde_json::to_writer_pretty(file, self)?;

        let path = dir.join("report.md");
        let mut file = File::create(&path).map_err(|e| ReportError::Write(e, path.clone()))?;
        write!(file, "{}", self.markdown()).map_err(|e| ReportError::Write(e, path.clone()))?;

        #[cfg(feature = "plot")]
        for k in 0..3 {
            plots::fwhm_histogram(self, k, dir)?;
        }
        log::info!("Report written to {:?}", dir);
        Ok(())
    }
    /// Markdown report
    pub fn markdown(&self) -> String {
        let names = self.axis_labels.names();
        let s = &self.summary;
        format!(
            r#"# PSF report

Axes: {} ({} frame), voxel size: {}

| beads | |
|---|---|
| detected peaks | {} |
| extracted patches | {} |
| dropped at the edges | {} |
| valid fits | {} |
| outliers | {} |

Accepted FWHM range [µm]: {:?} to {:?}

## Gaussian FWHM [µm]

{}

## Profile FWHM [µm]

{}

## Beads

{}
"#,
            self.axis_labels,
            if self.axis_labels.is_raw() { "raw" } else { "corrected" },
            self.voxel_scale,
            s.n_peaks,
            s.n_beads,
            s.n_dropped,
            s.n_valid,
            s.n_outliers,
            self.settings.fwhm_min,
            self.settings.fwhm_max,
            tables::stats_markdown(&names, &s.fwhm),
            tables::stats_markdown(&names, &s.profile_fwhm),
            tables::beads_markdown(self),
        )
    }
}

fn is_outlier(analysis: &BeadAnalysis, settings: &ReportSettings) -> bool {
    let fit = &analysis.fit;
    !fit.valid
        || (0..3).any(|k| !(settings.fwhm_min[k]..=settings.fwhm_max[k]).contains(&fit.fwhm[k]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        extract::BeadPatch,
        fit::{GaussianFitResult, PeakWidthResult},
        volume::Volume,
    };
    use approx::assert_relative_eq;
    use tempfile::TempDir;

    fn analysis(fwhm: [f64; 3], valid: bool) -> BeadAnalysis {
        BeadAnalysis {
            fit: GaussianFitResult {
                center: [1.0, 2.0, 3.0],
                sigma: fwhm.map(|f| f / crate::fit::FWHM_PER_SIGMA),
                fwhm,
                amplitude: 100.0,
                background: 10.0,
                valid,
                rmse: 0.5,
                iterations: 7,
            },
            width: PeakWidthResult {
                fwhm: [Some(fwhm[0]), None, Some(fwhm[2])],
            },
        }
    }

    fn beads(n: usize) -> (Vec<Peak>, ExtractedBeads) {
        let peaks: Vec<Peak> = (0..n)
            .map(|k| Peak {
                index: [k + 3, 4, 5],
                intensity: 100f32 - k as f32,
            })
            .collect();
        let patches = peaks
            .iter()
            .map(|&peak| BeadPatch {
                data: Volume::zeros((3, 3, 3)),
                offset: [peak.index[0] - 1, 3, 4],
                peak,
            })
            .collect();
        (
            peaks,
            ExtractedBeads {
                patches,
                dropped: 1,
            },
        )
    }

    fn report() -> ReportData {
        let (mut peaks, beads) = beads(4);
        peaks.push(Peak {
            index: [0, 0, 0],
            intensity: 1f32,
        });
        let analyses = [
            analysis([1.0, 0.5, 0.4], true),
            analysis([3.0, 0.7, 0.6], true),
            analysis([9.0, 0.7, 0.6], true),
            analysis([f64::NAN; 3], false),
        ];
        ReportData::new(
            &peaks,
            &beads,
            &analyses,
            VoxelScale::new([0.2, 0.1, 0.1]).unwrap(),
            AxisLabels::Raw,
            &ReportSettings::default(),
        )
        .unwrap()
    }

    #[test]
    fn statistics() {
        let stats = Stats::from_values(&[1.0, 3.0, 2.0, f64::NAN, 6.0]).unwrap();
        assert_eq!(stats.count, 4);
        assert_relative_eq!(stats.mean, 3.0);
        assert_relative_eq!(stats.median, 2.5);
        assert_relative_eq!(stats.min, 1.0);
        assert_relative_eq!(stats.max, 6.0);
        assert_relative_eq!(stats.std, 3.5f64.sqrt());
        assert!(Stats::from_values(&[]).is_none());
    }

    #[test]
    fn records_and_summary() {
        let report = report();
        let s = &report.summary;
        assert_eq!((s.n_peaks, s.n_beads, s.n_dropped), (5, 4, 1));
        assert_eq!(s.n_valid, 3);
        // FWHM of 9µm is out of range, the invalid fit is an outlier too
        assert_eq!(s.n_outliers, 2);
        assert!(report.beads[2].outlier && report.beads[3].outlier);
        assert_eq!(report.inliers().count(), 2);
        let fwhm0 = s.fwhm[0].unwrap();
        assert_eq!(fwhm0.count, 3);
        assert_relative_eq!(fwhm0.median, 3.0);
        assert!(s.profile_fwhm[1].is_none());
        assert_eq!(s.profile_fwhm[2].unwrap().count, 3);
        for (k, record) in report.beads.iter().enumerate() {
            assert_eq!(record.id, k);
            assert_eq!(record.peak.index[0], k + 3);
            assert_eq!(record.offset[0], k + 2);
        }
    }

    #[test]
    fn misaligned_inputs() {
        let (peaks, beads) = beads(2);
        let result = ReportData::new(
            &peaks,
            &beads,
            &[analysis([1.0; 3], true)],
            VoxelScale::uniform(0.1).unwrap(),
            AxisLabels::Corrected,
            &ReportSettings::default(),
        );
        assert!(matches!(result, Err(ReportError::Misaligned(2, 1))));
    }

    #[test]
    fn report_files() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("report");
        let report = report();
        report.generate(&dir).unwrap();
        for file in [
            "peaks.csv",
            "gaussian_fit.csv",
            "peak_width.csv",
            "summary.csv",
            "psf_parameters.json",
            "report.md",
        ] {
            assert!(dir.join(file).is_file(), "{file}");
        }
        let mut rdr = csv::Reader::from_path(dir.join("gaussian_fit.csv")).unwrap();
        assert_eq!(rdr.records().count(), 4);
        let mut rdr = csv::Reader::from_path(dir.join("peaks.csv")).unwrap();
        assert_eq!(rdr.records().count(), 5);
        let json: serde_json::Value =
            serde_json::from_reader(File::open(dir.join("psf_parameters.json")).unwrap()).unwrap();
        assert_eq!(json["beads"].as_array().unwrap().len(), 4);
        assert_eq!(json["axis_labels"], "raw");
        let markdown = fs::read_to_string(dir.join("report.md")).unwrap();
        assert!(markdown.contains("| SCAN |"));
    }
}
