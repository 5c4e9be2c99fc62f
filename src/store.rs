//! Volume store
//!
//! A store is a directory tree `root/<row>/<col>/<fov>/`, one leaf per field
//! of view (position). A position holds its volume in `data.npy`, a C-order
//! `f32` 3-D array, and its metadata in `meta.json`.

use std::{
    fmt,
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    str::FromStr,
};

use glob::glob;
use ndarray::ShapeBuilder;
use npyz::WriterBuilder;
use serde::{Deserialize, Serialize};

use crate::volume::{shape_of, AxisLabels, Volume, VoxelScale};

const DATA: &str = "data.npy";
const META: &str = "meta.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0:?} is not a store position")]
    NotFound(PathBuf),
    #[error("I/O error on {1:?}")]
    Io(#[source] io::Error, PathBuf),
    #[error("failed to read or write the array {1:?}")]
    Npy(#[source] io::Error, PathBuf),
    #[error("expected a 3-D array in {1:?}, found shape {0:?}")]
    Shape(Vec<u64>, PathBuf),
    #[error("invalid metadata in {1:?}")]
    Meta(#[source] serde_json::Error, PathBuf),
    #[error("invalid position key {0:?}, expected <row>/<col>/<fov>")]
    Key(String),
    #[error("non UTF-8 store path {0:?}")]
    Path(PathBuf),
    #[error("invalid position search pattern")]
    Pattern(#[from] glob::PatternError),
    #[error("failed to list the store positions")]
    Glob(#[from] glob::GlobError),
}
type Result<T> = std::result::Result<T, StoreError>;

/// Position metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionMeta {
    pub scale: VoxelScale,
    pub axis_labels: AxisLabels,
    #[serde(default)]
    pub channel_names: Vec<String>,
}

/// Position location in a store: `<row>/<col>/<fov>`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PositionKey {
    pub row: String,
    pub col: String,
    pub fov: String,
}
impl PositionKey {
    pub fn new(row: impl Into<String>, col: impl Into<String>, fov: impl Into<String>) -> Self {
        Self {
            row: row.into(),
            col: col.into(),
            fov: fov.into(),
        }
    }
    fn relative_path(&self) -> PathBuf {
        Path::new(&self.row).join(&self.col).join(&self.fov)
    }
}
impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.row, self.col, self.fov)
    }
}
impl FromStr for PositionKey {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim_matches('/').split('/').collect();
        match parts.as_slice() {
            &[row, col, fov] if !row.is_empty() && !col.is_empty() && !fov.is_empty() => {
                Ok(Self::new(row, col, fov))
            }
            _ => Err(StoreError::Key(s.to_string())),
        }
    }
}

/// A volume store rooted at a directory
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}
impl Store {
    /// Opens an existing store
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(StoreError::NotFound(root));
        }
        Ok(Self { root })
    }
    /// Opens a store, creating its root directory if needed
    pub fn create(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| StoreError::Io(e, root.clone()))?;
        Ok(Self { root })
    }
    pub fn root(&self) -> &Path {
        &self.root
    }
    /// Keys of the positions holding metadata, sorted
    pub fn positions(&self) -> Result<Vec<PositionKey>> {
        let root = self
            .root
            .to_str()
            .ok_or_else(|| StoreError::Path(self.root.clone()))?;
        let pattern = format!("{}/*/*/*/{META}", glob::Pattern::escape(root));
        let mut keys = Vec::new();
        for entry in glob(&pattern)? {
            let path = entry?;
            let relative = path
                .parent()
                .and_then(|p| p.strip_prefix(&self.root).ok())
                .and_then(|p| p.to_str())
                .ok_or_else(|| StoreError::Path(path.clone()))?;
            keys.push(relative.replace(std::path::MAIN_SEPARATOR, "/").parse()?);
        }
        keys.sort();
        Ok(keys)
    }
    /// An existing position
    pub fn position(&self, key: &PositionKey) -> Result<Position> {
        Position::open(self.root.join(key.relative_path()))
    }
    /// Creates the position directory and writes its metadata
    pub fn create_position(&self, key: &PositionKey, meta: &PositionMeta) -> Result<Position> {
        let path = self.root.join(key.relative_path());
        fs::create_dir_all(&path).map_err(|e| StoreError::Io(e, path.clone()))?;
        let position = Position { path };
        position.write_meta(meta)?;
        Ok(position)
    }
}

/// A field of view of a store
#[derive(Debug, Clone)]
pub struct Position {
    path: PathBuf,
}
impl Position {
    /// Opens a position directory
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.join(META).is_file() {
            return Err(StoreError::NotFound(path));
        }
        Ok(Self { path })
    }
    pub fn path(&self) -> &Path {
        &self.path
    }
    pub fn meta(&self) -> Result<PositionMeta> {
        let path = self.path.join(META);
        let file = File::open(&path).map_err(|e| StoreError::Io(e, path.clone()))?;
        serde_json::from_reader(file).map_err(|e| StoreError::Meta(e, path))
    }
    fn write_meta(&self, meta: &PositionMeta) -> Result<()> {
        let path = self.path.join(META);
        let file = File::create(&path).map_err(|e| StoreError::Io(e, path.clone()))?;
        serde_json::to_writer_pretty(file, meta).map_err(|e| StoreError::Meta(e, path))
    }
    /// Reads the volume and its metadata
    pub fn read(&self) -> Result<(Volume, PositionMeta)> {
        let meta = self.meta()?;
        let path = self.path.join(DATA);
        let bytes = fs::read(&path).map_err(|e| StoreError::Io(e, path.clone()))?;
        let npy = npyz::NpyFile::new(&bytes[..]).map_err(|e| StoreError::Npy(e, path.clone()))?;
        let shape = npy.shape().to_vec();
        let &[n0, n1, n2] = shape.as_slice() else {
            return Err(StoreError::Shape(shape.clone(), path));
        };
        let dim = (n0 as usize, n1 as usize, n2 as usize);
        let fortran = matches!(npy.order(), npyz::Order::Fortran);
        let data: Vec<f32> = npy
            .into_vec()
            .map_err(|e| StoreError::Npy(e, path.clone()))?;
        let volume = if fortran {
            Volume::from_shape_vec(dim.f(), data)
        } else {
            Volume::from_shape_vec(dim, data)
        }
        .map_err(|_| StoreError::Shape(shape, path.clone()))?;
        log::info!(
            "Read {:?} volume from {:?}, voxel scale: {}",
            shape_of(&volume),
            path,
            meta.scale
        );
        Ok((volume, meta))
    }
    /// Writes the volume in C order and replaces the metadata
    pub fn write(&self, volume: &Volume, meta: &PositionMeta) -> Result<()> {
        let path = self.path.join(DATA);
        let file = File::create(&path).map_err(|e| StoreError::Io(e, path.clone()))?;
        let mut file = BufWriter::new(file);
        let shape = shape_of(volume).map(|n| n as u64);
        let npy_err = |e: io::Error| StoreError::Npy(e, path.clone());
        let mut writer = npyz::WriteOptions::new()
            .default_dtype()
            .shape(&shape)
            .writer(&mut file)
            .begin_nd()
            .map_err(npy_err)?;
        // logical iteration order is C order
        writer.extend(volume.iter().copied()).map_err(npy_err)?;
        writer.finish().map_err(npy_err)?;
        file.flush().map_err(npy_err)?;
        self.write_meta(meta)?;
        log::info!("Wrote {:?} volume to {:?}", shape, path);
        Ok(())
    }
}
