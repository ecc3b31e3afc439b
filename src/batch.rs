//! The batch driver: resolves a run's inputs and drives every image through
//! the rectification engine, isolating failures per image.

use crate::{
    config::{Config, ConfigDocument},
    engine::{BuildOverviews, CameraParams, EngineError, Orthorectify, RectificationEngine},
    error::Error,
    geometry::{GeometryError, SourceImage},
    input::{self, Inputs},
    logging::LogConfig,
    pose::{PoseNotFound, PoseTable},
};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use std::{
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn};

/// Why an image was skipped. Never aborts the batch.
#[derive(Debug, Error)]
pub enum SkipReason {
    #[error(transparent)]
    PoseNotFound(#[from] PoseNotFound),

    #[error("could not read source image: {0}")]
    Io(#[from] GeometryError),

    #[error("could not build camera: {0}")]
    Camera(#[source] EngineError),

    #[error("could not orthorectify: {0}")]
    Rectify(#[source] EngineError),

    #[error("could not build overviews: {0}")]
    Overviews(#[source] EngineError),
}

impl SkipReason {
    /// Short machine-readable name of the failed stage.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PoseNotFound(_) => "pose_not_found",
            Self::Io(_) => "io",
            Self::Camera(_) => "camera",
            Self::Rectify(_) => "rectify",
            Self::Overviews(_) => "overviews",
        }
    }
}

/// Terminal state of one image.
#[derive(Debug)]
pub enum ImageOutcome {
    Succeeded,
    Skipped(SkipReason),
}

impl ImageOutcome {
    pub fn is_succeeded(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub fn skip_reason(&self) -> Option<&SkipReason> {
        match self {
            Self::Succeeded => None,
            Self::Skipped(reason) => Some(reason),
        }
    }
}

impl From<Result<(), SkipReason>> for ImageOutcome {
    fn from(result: Result<(), SkipReason>) -> Self {
        match result {
            Ok(()) => Self::Succeeded,
            Err(reason) => Self::Skipped(reason),
        }
    }
}

/// Outcome and timing of one image.
#[derive(Debug)]
pub struct ImageReport {
    pub path: PathBuf,
    pub outcome: ImageOutcome,
    pub started: DateTime<Utc>,
    pub elapsed: Duration,
    /// Time spent building overviews, if they were built.
    pub overviews: Option<Duration>,
}

impl ImageReport {
    pub fn seconds(&self) -> f64 {
        self.elapsed.as_secs_f64()
    }
}

/// Per image entries of the JSON report.
#[derive(Serialize)]
struct ReportEntry<'a> {
    path: &'a Path,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    started: DateTime<Utc>,
    seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    overview_seconds: Option<f64>,
}

impl<'a> From<&'a ImageReport> for ReportEntry<'a> {
    fn from(report: &'a ImageReport) -> Self {
        let reason = report.outcome.skip_reason();
        Self {
            path: &report.path,
            status: match reason {
                None => "succeeded",
                Some(_) => "skipped",
            },
            reason: reason.map(SkipReason::kind),
            message: reason.map(ToString::to_string),
            started: report.started,
            seconds: report.seconds(),
            overview_seconds: report.overviews.as_ref().map(Duration::as_secs_f64),
        }
    }
}

/// Outcomes of every image of a batch, in processing order.
#[derive(Debug, Default)]
pub struct BatchReport {
    images: Vec<ImageReport>,
}

impl BatchReport {
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.images
            .iter()
            .filter(|image| image.outcome.is_succeeded())
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.len() - self.succeeded()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ImageReport> {
        self.images.iter()
    }

    /// Outcome of the image at `path`, if it was part of the batch.
    pub fn outcome(&self, path: &Path) -> Option<&ImageOutcome> {
        self.images
            .iter()
            .find(|image| image.path == path)
            .map(|image| &image.outcome)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        let entries: Vec<ReportEntry> = self.images.iter().map(ReportEntry::from).collect();
        serde_json::to_string_pretty(&entries)
    }

    pub fn write(&self, path: &Path) -> Result<(), Error> {
        let report_error = |reason: String| Error::Report {
            path: path.to_path_buf(),
            reason,
        };
        let entries: Vec<ReportEntry> = self.images.iter().map(ReportEntry::from).collect();
        let file = File::create(path).map_err(|err| report_error(err.to_string()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &entries)
            .map_err(|err| report_error(err.to_string()))?;

        info!("Wrote batch report to {}", path.display());
        Ok(())
    }
}

/// The shared, read-only state of a batch.
pub struct Batch<'a, E> {
    engine: &'a E,
    config: &'a Config,
    poses: &'a PoseTable,
    dem: &'a Path,
    ortho_dir: Option<&'a Path>,
    log: LogConfig,
}

impl<'a, E> Batch<'a, E>
where
    E: RectificationEngine + Sync,
{
    pub fn new(
        engine: &'a E,
        config: &'a Config,
        poses: &'a PoseTable,
        dem: &'a Path,
        ortho_dir: Option<&'a Path>,
        log: LogConfig,
    ) -> Self {
        Self {
            engine,
            config,
            poses,
            dem,
            ortho_dir,
            log,
        }
    }

    /// Process every image in order. With `jobs` above one, images are
    /// processed on a pool of that many threads.
    pub fn run(&self, images: &[PathBuf], jobs: usize) -> Result<BatchReport, Error> {
        let images: Vec<ImageReport> = match jobs {
            0 | 1 => images.iter().map(|src| self.process(src)).collect(),
            jobs => {
                let pool = rayon::ThreadPoolBuilder::new().num_threads(jobs).build()?;
                pool.install(|| images.par_iter().map(|src| self.process(src)).collect())
            }
        };

        Ok(BatchReport { images })
    }

    /// Drive one image to a terminal state.
    pub fn process(&self, src: &Path) -> ImageReport {
        let name = src
            .file_name()
            .unwrap_or(src.as_os_str())
            .to_string_lossy()
            .into_owned();
        let span = info_span!("image", name = %name);
        let _enter = span.enter();

        info!("Orthorectifying {name}");
        let started = Utc::now();
        let clock = Instant::now();
        let result = self.rectify(src);
        let elapsed = clock.elapsed();

        let report = ImageReport {
            path: src.to_path_buf(),
            overviews: result.as_ref().ok().copied().flatten(),
            outcome: ImageOutcome::from(result.map(|_| ())),
            started,
            elapsed,
        };
        match report.outcome.skip_reason() {
            None => info!("Completed in {:.2} secs", report.seconds()),
            Some(reason) => error!("Skipping {name}: {reason}"),
        }
        report
    }

    /// Returns the time spent on overviews, if they were built.
    fn rectify(&self, src: &Path) -> Result<Option<Duration>, SkipReason> {
        let stem = src.file_stem().unwrap_or_default().to_string_lossy();
        let pose = self.poses.lookup(&stem)?;

        let source = SourceImage::read(src)?;
        let params = CameraParams {
            focal_len: self.config.camera.focal_len,
            sensor_size: self.config.camera.sensor_size,
            pixel_dims: source.dimensions(),
            transform: source.transform,
            position: pose.position(),
            orientation: pose.orientation(),
        };
        if self.log.driver_debug() {
            debug!(?params, "building camera");
        }
        let camera = self.engine.build_camera(params).map_err(SkipReason::Camera)?;

        let output = self.ortho_dir.map(|dir| input::ortho_path(src, Some(dir)));
        let ortho = camera
            .orthorectify(src, self.dem, &self.config.ortho, output.as_deref())
            .map_err(SkipReason::Rectify)?;

        if !self.config.ortho.build_ovw {
            return Ok(None);
        }
        info!("Building overviews for {}", ortho.path().display());
        let clock = Instant::now();
        ortho.build_overviews().map_err(SkipReason::Overviews)?;
        let elapsed = clock.elapsed();
        info!("Completed in {:.2} secs", elapsed.as_secs_f64());

        Ok(Some(elapsed))
    }
}

/// Everything a run needs from the command line.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchArgs {
    pub src_patterns: Vec<String>,
    pub dem: PathBuf,
    pub pose_file: PathBuf,
    pub ortho_dir: Option<PathBuf>,
    pub read_conf: Option<PathBuf>,
    pub write_conf: Option<PathBuf>,
    /// Number of images processed at once.
    pub jobs: usize,
    /// Where to write a JSON report of the batch.
    pub report: Option<PathBuf>,
    pub log: LogConfig,
}

/// How a successful run ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// The configuration was written and nothing else was done.
    ConfigWritten(PathBuf),
    Completed(BatchReport),
}

/// Run a batch end to end.
///
/// Any returned error aborts the batch. Failures of single images are
/// recorded in the report instead.
pub fn run<E>(args: &BatchArgs, engine: &E) -> Result<RunOutcome, Error>
where
    E: RectificationEngine + Sync,
{
    let document = ConfigDocument::load(args.read_conf.as_deref())?;
    if let Some(path) = &args.write_conf {
        document.write(path)?;
        return Ok(RunOutcome::ConfigWritten(path.clone()));
    }
    let config = document.to_config()?;

    let inputs = Inputs::resolve(
        &args.src_patterns,
        &args.dem,
        &args.pose_file,
        args.ortho_dir.as_deref(),
    )?;
    let poses = PoseTable::load(&inputs.pose_file)?;
    let images: Vec<PathBuf> = inputs.images.into_iter().collect();
    info!("Processing {} image(s)", images.len());

    let report = Batch::new(
        engine,
        &config,
        &poses,
        &inputs.dem,
        inputs.ortho_dir.as_deref(),
        args.log,
    )
    .run(&images, args.jobs)?;

    match report.skipped() {
        0 => info!("Orthorectified {} image(s)", report.succeeded()),
        skipped => warn!(
            "Orthorectified {} image(s), skipped {skipped}",
            report.succeeded()
        ),
    }
    if let Some(path) = &args.report {
        report.write(path)?;
    }

    Ok(RunOutcome::Completed(report))
}
