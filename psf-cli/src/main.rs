use std::path::{Path, PathBuf};

use anyhow::Context;
use lightsheet_psf::{
    backend,
    config::Settings,
    deconvolve::deconvolve,
    pipeline::{Passes, Pipeline},
    resample,
    store::{Position, PositionKey, PositionMeta, Store},
    AxisLabels, Error,
};
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "lsm-psf",
    about = "Light-sheet deskewing and bead PSF characterization"
)]
enum Opt {
    /// Characterizes the PSF from a bead volume
    Psf {
        /// Input position directory
        #[structopt(short, long)]
        input: PathBuf,
        /// JSON settings file
        #[structopt(short, long)]
        config: PathBuf,
        /// Report directory
        #[structopt(short, long)]
        output: PathBuf,
        /// Characterizes the raw volume (default if no pass is given)
        #[structopt(long)]
        raw: bool,
        /// Characterizes the deskewed volume
        #[structopt(long)]
        deskewed: bool,
    },
    /// Deskews positions into an output store
    Deskew {
        /// Input position directories
        #[structopt(short, long, required = true)]
        input: Vec<PathBuf>,
        /// JSON settings file
        #[structopt(short, long)]
        config: PathBuf,
        /// Output store
        #[structopt(short, long)]
        output: PathBuf,
    },
    /// Deconvolves positions with a measured PSF
    Deconvolve {
        /// Input position directories
        #[structopt(short, long, required = true)]
        input: Vec<PathBuf>,
        /// PSF position directory
        #[structopt(short, long)]
        psf: PathBuf,
        /// JSON settings file
        #[structopt(short, long)]
        config: PathBuf,
        /// Output store
        #[structopt(short, long)]
        output: PathBuf,
    },
}

/// Position key made of the last 3 components of a position path
fn position_key(path: &Path) -> anyhow::Result<PositionKey> {
    let components: Vec<_> = path
        .components()
        .rev()
        .take(3)
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    let key = match components.as_slice() {
        [fov, col, row] => format!("{row}/{col}/{fov}"),
        _ => path.to_string_lossy().into_owned(),
    };
    Ok(key.parse::<PositionKey>().map_err(Error::from)?)
}

fn load_settings(path: &Path) -> anyhow::Result<Settings> {
    Settings::from_path(path)
        .map_err(Error::from)
        .with_context(|| format!("loading {:?}", path))
}

fn read_position(path: &Path) -> anyhow::Result<(lightsheet_psf::Volume, PositionMeta)> {
    Position::open(path)
        .and_then(|position| position.read())
        .map_err(Error::from)
        .with_context(|| format!("reading {:?}", path))
}

fn psf(
    input: PathBuf,
    config: PathBuf,
    output: PathBuf,
    raw: bool,
    deskewed: bool,
) -> anyhow::Result<()> {
    let settings = load_settings(&config)?;
    let (volume, meta) = read_position(&input)?;
    let passes = Passes {
        raw: raw || !deskewed,
        deskewed,
    };
    let report = Pipeline::new(&settings)?.run(volume.view(), meta.scale, passes, &output)?;
    for data in [report.raw, report.deskewed].into_iter().flatten() {
        log::info!(
            "{} frame: {} beads, {} valid fits, {} outliers",
            data.axis_labels,
            data.summary.n_beads,
            data.summary.n_valid,
            data.summary.n_outliers
        );
    }
    println!("PSF report written to {:?}", output);
    Ok(())
}

fn deskew(input: Vec<PathBuf>, config: PathBuf, output: PathBuf) -> anyhow::Result<()> {
    let settings = load_settings(&config)?;
    let deskew = settings.deskew().map_err(Error::from)?;
    let backend = backend::select(&settings.compute).map_err(Error::from)?;
    let store = Store::create(&output).map_err(Error::from)?;
    for path in input {
        let key = position_key(&path)?;
        let (volume, meta) = read_position(&path)?;
        let (deskewed, scale) = resample::deskew(
            backend.as_ref(),
            volume.view(),
            &deskew.geometry(),
            deskew.fill_value,
            deskew.num_chunks,
        )
        .with_context(|| format!("deskewing {key}"))?;
        let meta = PositionMeta {
            scale,
            axis_labels: AxisLabels::Corrected,
            channel_names: meta.channel_names,
        };
        store
            .create_position(&key, &meta)
            .and_then(|position| position.write(&deskewed, &meta))
            .map_err(Error::from)?;
        println!("{key} deskewed into {:?}", store.root());
    }
    Ok(())
}

fn deconvolve_positions(
    input: Vec<PathBuf>,
    psf: PathBuf,
    config: PathBuf,
    output: PathBuf,
) -> anyhow::Result<()> {
    let settings = load_settings(&config)?;
    let deconvolve_settings = settings.deconvolve().map_err(Error::from)?;
    let (psf_volume, psf_meta) = read_position(&psf)?;
    let store = Store::create(&output).map_err(Error::from)?;
    for path in input {
        let key = position_key(&path)?;
        let (volume, meta) = read_position(&path)?;
        let deconvolved = deconvolve(
            volume.view(),
            &meta.scale,
            psf_volume.view(),
            &psf_meta.scale,
            deconvolve_settings,
        )
        .map_err(Error::from)
        .with_context(|| format!("deconvolving {key}"))?;
        store
            .create_position(&key, &meta)
            .and_then(|position| position.write(&deconvolved, &meta))
            .map_err(Error::from)?;
        println!("{key} deconvolved into {:?}", store.root());
    }
    Ok(())
}

fn run(opt: Opt) -> anyhow::Result<()> {
    match opt {
        Opt::Psf {
            input,
            config,
            output,
            raw,
            deskewed,
        } => psf(input, config, output, raw, deskewed),
        Opt::Deskew {
            input,
            config,
            output,
        } => deskew(input, config, output),
        Opt::Deconvolve {
            input,
            psf,
            config,
            output,
        } => deconvolve_positions(input, psf, config, output),
    }
}

fn main() {
    env_logger::init();
    let opt = Opt::from_args();
    if let Err(err) = run(opt) {
        let code = err
            .chain()
            .find_map(|e| e.downcast_ref::<Error>())
            .map_or(1, Error::exit_code);
        eprintln!("Error: {:?}", err);
        std::process::exit(code);
    }
}
