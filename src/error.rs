use crate::{
    backend::BackendError, config::ConfigError, geometry::GeometryError, report::ReportError,
    store::StoreError, volume::ScaleError,
};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("configuration error")]
    Config(#[from] ConfigError),
    #[error("geometry error")]
    Geometry(#[from] GeometryError),
    #[error("compute backend error")]
    Backend(#[from] BackendError),
    #[error("error in the `store` module")]
    Store(#[from] StoreError),
    #[error("error in the `report` module")]
    Report(#[from] ReportError),
    #[error("invalid voxel scale")]
    Scale(#[from] ScaleError),
}
impl Error {
    /// Process exit code of the error class
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 2,
            Error::Geometry(_) => 3,
            Error::Backend(e) if e.is_resource() => 4,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
