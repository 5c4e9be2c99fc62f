//! PSF fit engine
//!
//! Every bead patch gets a Gaussian fit and a model-free half-maximum width
//! measurement. A failed fit is kept as an invalid record, so the analyses
//! and the patches stay aligned.

use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};

use crate::{config::Settings, extract::BeadPatch, volume::VoxelScale};

pub mod gaussian;
pub mod width;

pub use gaussian::{fit_gaussian, GaussianFitResult, FWHM_PER_SIGMA};
pub use width::{peak_width, PeakWidthResult};

/// Gaussian fit and half-maximum widths of one bead
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeadAnalysis {
    pub fit: GaussianFitResult,
    pub width: PeakWidthResult,
}

fn progress_bar(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb.set_message("fitting beads");
    pb
}

/// Analyzes one bead
pub fn analyze_bead(patch: &BeadPatch, scale: &VoxelScale, settings: &Settings) -> BeadAnalysis {
    let fit = fit_gaussian(patch, scale, &settings.fit);
    let shape = patch.shape();
    let center = if fit.valid {
        let local = fit.local_index(patch, scale);
        [0, 1, 2].map(|k| (local[k].round().max(0f64) as usize).min(shape[k] - 1))
    } else {
        shape.map(|n| n / 2)
    };
    let width = peak_width(patch, scale, center);
    log::debug!(
        "bead {:?}: valid: {}, FWHM: {:.3?}, profile FWHM: {:.3?}",
        patch.peak.index,
        fit.valid,
        fit.fwhm,
        width.fwhm
    );
    BeadAnalysis { fit, width }
}

/// Analyzes the beads in order, one [BeadAnalysis] per patch
pub fn analyze(patches: &[BeadPatch], scale: &VoxelScale, settings: &Settings) -> Vec<BeadAnalysis> {
    let pb = settings.report.progress.then(|| progress_bar(patches.len()));
    let analyses: Vec<BeadAnalysis> = patches
        .iter()
        .map(|patch| {
            let analysis = analyze_bead(patch, scale, settings);
            if let Some(pb) = &pb {
                pb.inc(1);
            }
            analysis
        })
        .collect();
    if let Some(pb) = pb {
        pb.finish_with_message("beads fitted");
    }
    let n_valid = analyses.iter().filter(|a| a.fit.valid).count();
    log::info!("Fitted {} beads, {} valid", analyses.len(), n_valid);
    analyses
}
