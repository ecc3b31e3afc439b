use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort a whole batch.
///
/// Every variant is raised before the first image is touched, except
/// [`Error::Report`] which can only happen once the batch has finished.
/// Failures scoped to a single image are [`crate::batch::SkipReason`]s instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("config file {} does not exist", path.display())]
    ConfigNotFound { path: PathBuf },

    #[error("could not parse config file {}: {reason}", path.display())]
    ConfigParse { path: PathBuf, reason: String },

    #[error("invalid configuration: {reason}")]
    ConfigValidation { reason: String },

    #[error("could not write config to {}: {reason}", path.display())]
    ConfigWrite { path: PathBuf, reason: String },

    #[error("could not find any source image(s) matching {pattern}")]
    NoMatch { pattern: String },

    #[error("DEM file {} does not exist", path.display())]
    DemNotFound { path: PathBuf },

    #[error("camera position and orientation file {} does not exist", path.display())]
    PoseFileNotFound { path: PathBuf },

    #[error("ortho directory {} is not a valid directory", path.display())]
    InvalidOutputDir { path: PathBuf },

    #[error("could not read camera position and orientation file {}: {reason}", path.display())]
    PoseFileRead { path: PathBuf, reason: String },

    #[error("{}:{line}: {reason}", path.display())]
    PoseTableParse {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("could not start worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("could not write batch report to {}: {reason}", path.display())]
    Report { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
