//! Rectification engine interface.
//!
//! The batch driver only assembles calls through these traits. [`FrameEngine`]
//! is the built-in implementation.

mod dem;
mod frame;
mod ortho;
mod overview;

pub use dem::Dem;
pub use frame::{FrameCamera, FrameEngine};
pub use ortho::OrthoImage;
pub use overview::overview_path;

use crate::{config::OrthoConfig, geometry::GeoTransform};
use nalgebra::Vector3;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid camera: {0}")]
    InvalidCamera(String),
    #[error("could not read {}: {reason}", path.display())]
    Read { path: PathBuf, reason: String },
    #[error("could not write {}: {reason}", path.display())]
    Write { path: PathBuf, reason: String },
    #[error("{} exists and overwrite is disabled", path.display())]
    OutputExists { path: PathBuf },
    #[error("image footprint does not overlap the DEM")]
    NoOverlap,
    #[error("ortho grid of {width}x{height} pixels exceeds the limit of {limit} pixels")]
    GridTooLarge { width: u64, height: u64, limit: u64 },
    #[error("{0}")]
    Other(String),
}

/// Everything needed to construct a camera for one image.
#[derive(Clone, Debug, PartialEq)]
pub struct CameraParams {
    pub focal_len: f64,
    pub sensor_size: [f64; 2],
    /// Image size in pixels as (width, height).
    pub pixel_dims: (u32, u32),
    pub transform: GeoTransform,
    /// (easting, northing, altitude).
    pub position: Vector3<f64>,
    /// (omega, phi, kappa) in radians.
    pub orientation: Vector3<f64>,
}

/// Builds cameras from interior and exterior orientation.
pub trait RectificationEngine {
    type Camera: Orthorectify;

    /// Pure construction, no I/O.
    fn build_camera(&self, params: CameraParams) -> Result<Self::Camera, EngineError>;
}

pub trait Orthorectify {
    type Artifact: BuildOverviews;

    /// Rectify `src` onto `dem`, writing to `output`.
    ///
    /// When `output` is `None` the engine chooses the location.
    fn orthorectify(
        &self,
        src: &Path,
        dem: &Path,
        options: &OrthoConfig,
        output: Option<&Path>,
    ) -> Result<Self::Artifact, EngineError>;
}

pub trait BuildOverviews {
    /// Location of the rectified image.
    fn path(&self) -> &Path;

    fn build_overviews(&self) -> Result<(), EngineError>;
}
