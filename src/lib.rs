//! Batch Orthorectification
//!
//! Drives a set of aerial images, each with a recorded camera position and
//! orientation, through a rectification engine onto a shared DEM. Images are
//! processed independently: a failure in one is logged and recorded in the
//! [`batch::BatchReport`] while the rest of the batch carries on.

pub mod batch;
pub mod config;
pub mod engine;
#[allow(missing_docs)]
pub mod error;
pub mod geometry;
pub mod input;
pub mod logging;
pub mod pose;

pub use batch::{BatchArgs, BatchReport, ImageOutcome, RunOutcome, SkipReason, run};
pub use config::{CameraConfig, Config, ConfigDocument, OrthoConfig};
pub use engine::{FrameEngine, RectificationEngine};
pub use error::Error;
pub use logging::{LogConfig, Verbosity};
