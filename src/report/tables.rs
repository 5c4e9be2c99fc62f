use std::path::Path;

use super::{ReportData, Result, Stats};

fn optional(value: Option<f64>) -> String {
    value.map(|v| format!("{v}")).unwrap_or_default()
}

/// All the detected peaks, extracted or not
pub fn peaks(report: &ReportData, path: &Path) -> Result<()> {
    let names = report.axis_labels.names();
    let mut wtr = csv::Writer::from_path(path)?;
    let mut header = vec![String::from("peak")];
    header.extend(names.iter().map(|n| format!("{n} index")));
    header.extend(names.iter().map(|n| format!("{n} [µm]")));
    header.push(String::from("intensity"));
    header.push(String::from("extracted"));
    wtr.write_record(&header)?;
    for (k, peak) in report.peaks.iter().enumerate() {
        let position = report
            .voxel_scale
            .to_physical(peak.index.map(|i| i as f64));
        let extracted = report.beads.iter().any(|r| r.peak.index == peak.index);
        let mut record = vec![format!("{k}")];
        record.extend(peak.index.iter().map(|i| format!("{i}")));
        record.extend(position.iter().map(|p| format!("{p}")));
        record.push(format!("{}", peak.intensity));
        record.push(format!("{extracted}"));
        wtr.write_record(&record)?;
    }
    wtr.flush().map_err(csv::Error::from)?;
    Ok(())
}

/// Gaussian fit parameters per bead
pub fn gaussian_fit(report: &ReportData, path: &Path) -> Result<()> {
    let names = report.axis_labels.names();
    let mut wtr = csv::Writer::from_path(path)?;
    let mut header = vec![String::from("bead")];
    header.extend(names.iter().map(|n| format!("{n} peak index")));
    header.extend(names.iter().map(|n| format!("{n} center [µm]")));
    header.extend(names.iter().map(|n| format!("{n} sigma [µm]")));
    header.extend(names.iter().map(|n| format!("{n} FWHM [µm]")));
    header.extend(
        ["amplitude", "background", "rmse", "iterations", "valid", "outlier"].map(String::from),
    );
    wtr.write_record(&header)?;
    for bead in &report.beads {
        let fit = &bead.analysis.fit;
        let mut record = vec![format!("{}", bead.id)];
        record.extend(bead.peak.index.iter().map(|i| format!("{i}")));
        record.extend(fit.center.iter().map(|x| format!("{x}")));
        record.extend(fit.sigma.iter().map(|x| format!("{x}")));
        record.extend(fit.fwhm.iter().map(|x| format!("{x}")));
        record.extend([
            format!("{}", fit.amplitude),
            format!("{}", fit.background),
            format!("{}", fit.rmse),
            format!("{}", fit.iterations),
            format!("{}", fit.valid),
            format!("{}", bead.outlier),
        ]);
        wtr.write_record(&record)?;
    }
    wtr.flush().map_err(csv::Error::from)?;
    Ok(())
}

/// Profile half-maximum widths per bead, empty where undefined
pub fn peak_width(report: &ReportData, path: &Path) -> Result<()> {
    let names = report.axis_labels.names();
    let mut wtr = csv::Writer::from_path(path)?;
    let mut header = vec![String::from("bead")];
    header.extend(names.iter().map(|n| format!("{n} FWHM [µm]")));
    wtr.write_record(&header)?;
    for bead in &report.beads {
        let mut record = vec![format!("{}", bead.id)];
        record.extend(bead.analysis.width.fwhm.iter().map(|w| optional(*w)));
        wtr.write_record(&record)?;
    }
    wtr.flush().map_err(csv::Error::from)?;
    Ok(())
}

/// FWHM statistics per axis
pub fn summary(report: &ReportData, path: &Path) -> Result<()> {
    let names = report.axis_labels.names();
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record([
        "quantity", "axis", "count", "mean", "median", "std", "min", "max",
    ])?;
    for (quantity, stats) in [
        ("gaussian FWHM [µm]", &report.summary.fwhm),
        ("profile FWHM [µm]", &report.summary.profile_fwhm),
    ] {
        for (name, stats) in names.iter().zip(stats) {
            let mut record = vec![quantity.to_string(), name.to_string()];
            match stats {
                Some(s) => record.extend([
                    format!("{}", s.count),
                    format!("{}", s.mean),
                    format!("{}", s.median),
                    format!("{}", s.std),
                    format!("{}", s.min),
                    format!("{}", s.max),
                ]),
                None => {
                    record.push(String::from("0"));
                    record.extend(std::iter::repeat(String::new()).take(5));
                }
            }
            wtr.write_record(&record)?;
        }
    }
    wtr.flush().map_err(csv::Error::from)?;
    Ok(())
}

/// Markdown table of per-axis statistics
pub fn stats_markdown(names: &[&str; 3], stats: &[Option<Stats>; 3]) -> String {
    let cell = |f: fn(&Stats) -> String| -> String {
        stats
            .iter()
            .map(|s| s.as_ref().map(f).unwrap_or_else(|| String::from("-")))
            .collect::<Vec<String>>()
            .join(" | ")
    };
    format!(
        r#"| | {} |
|---|---|---|---|
| count | {} |
| mean | {} |
| median | {} |
| std | {} |
| min | {} |
| max | {} |"#,
        names.join(" | "),
        cell(|s| format!("{}", s.count)),
        cell(|s| format!("{:.3}", s.mean)),
        cell(|s| format!("{:.3}", s.median)),
        cell(|s| format!("{:.3}", s.std)),
        cell(|s| format!("{:.3}", s.min)),
        cell(|s| format!("{:.3}", s.max)),
    )
}

/// Markdown table of the beads
pub fn beads_markdown(report: &ReportData) -> String {
    if report.beads.is_empty() {
        return String::from("No bead.");
    }
    let [a0, a1, a2] = report.axis_labels.names();
    let rows: Vec<String> = report
        .beads
        .iter()
        .map(|bead| {
            let fit = &bead.analysis.fit;
            format!(
                "| {} | {:?} | {:.3} | {:.3} | {:.3} | {} | {} |",
                bead.id,
                bead.peak.index,
                fit.fwhm[0],
                fit.fwhm[1],
                fit.fwhm[2],
                if fit.valid { "yes" } else { "no" },
                if bead.outlier { "yes" } else { "no" },
            )
        })
        .collect();
    format!(
        r#"| bead | peak | {a0} FWHM | {a1} FWHM | {a2} FWHM | valid | outlier |
|---|---|---|---|---|---|---|
{}"#,
        rows.join("\n")
    )
}
