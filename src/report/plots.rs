use std::path::Path;

use plotters::prelude::*;

use super::{ReportData, ReportError, Result};

const N_BINS: usize = 20;

/// Histogram of the Gaussian FWHM of the valid fits along axis `k`
pub fn fwhm_histogram(report: &ReportData, k: usize, dir: &Path) -> Result<()> {
    let name = report.axis_labels.names()[k];
    let path = dir.join(format!("fwhm_{}.svg", name.to_lowercase()));
    let values: Vec<f64> = report
        .beads
        .iter()
        .filter(|r| r.analysis.fit.valid)
        .map(|r| r.analysis.fit.fwhm[k])
        .filter(|v| v.is_finite())
        .collect();
    let to_err = |e: &dyn std::fmt::Display| ReportError::Plot(path.clone(), e.to_string());

    let max_value = |x: &[f64]| -> f64 { x.iter().cloned().fold(f64::NEG_INFINITY, f64::max) };
    let min_value = |x: &[f64]| -> f64 { x.iter().cloned().fold(f64::INFINITY, f64::min) };
    let (lo, hi) = if values.is_empty() {
        (report.settings.fwhm_min[k], report.settings.fwhm_max[k])
    } else {
        (min_value(&values), max_value(&values))
    };
    let width = ((hi - lo) / N_BINS as f64).max(1e-3);
    let mut counts = [0u32; N_BINS];
    for v in &values {
        let bin = (((v - lo) / width) as usize).min(N_BINS - 1);
        counts[bin] += 1;
    }
    let max_count = counts.iter().copied().max().unwrap_or(0).max(1);

    let plot = SVGBackend::new(&path, (768, 512)).into_drawing_area();
    plot.fill(&WHITE).map_err(|e| to_err(&e))?;
    let mut chart = ChartBuilder::on(&plot)
        .caption(format!("{name} FWHM"), ("sans-serif", 20))
        .set_label_area_size(LabelAreaPosition::Left, 40)
        .set_label_area_size(LabelAreaPosition::Bottom, 40)
        .margin(10)
        .build_cartesian_2d(lo..lo + width * N_BINS as f64, 0u32..max_count + 1)
        .map_err(|e| to_err(&e))?;
    chart
        .configure_mesh()
        .x_desc(format!("{name} FWHM [µm]"))
        .y_desc("Beads")
        .draw()
        .map_err(|e| to_err(&e))?;

    let color = colorous::TABLEAU10[k % colorous::TABLEAU10.len()];
    let rgb = RGBColor(color.r, color.g, color.b);
    chart
        .draw_series(counts.iter().enumerate().map(|(i, &count)| {
            let x0 = lo + i as f64 * width;
            Rectangle::new([(x0, 0), (x0 + width, count)], rgb.filled())
        }))
        .map_err(|e| to_err(&e))?;
    plot.present().map_err(|e| to_err(&e))?;
    log::debug!("FWHM histogram written to {:?}", path);
    Ok(())
}
