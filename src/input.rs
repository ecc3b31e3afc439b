//! Resolution and validation of the paths a batch reads and writes.

use crate::error::Error;
use glob::Pattern;
use std::{
    collections::BTreeSet,
    fs,
    path::{Component, Path, PathBuf},
};
use tracing::{debug, warn};

/// Suffix appended to a source stem to name its ortho image.
pub const ORTHO_SUFFIX: &str = "_ORTHO.tif";

/// Expand `patterns` into the set of source image files they match.
///
/// Each pattern is split into a parent directory and a file name, and the
/// file name is matched as a glob against the entries of the parent. Only the
/// file name may contain wildcards. Fails with [`Error::NoMatch`] on the first
/// pattern that matches nothing.
pub fn resolve_images<S: AsRef<str>>(patterns: &[S]) -> Result<BTreeSet<PathBuf>, Error> {
    let mut images = BTreeSet::new();
    for pattern in patterns {
        let matches = expand(pattern.as_ref())?;
        if matches.is_empty() {
            return Err(Error::NoMatch {
                pattern: pattern.as_ref().to_string(),
            });
        }
        debug!(pattern = pattern.as_ref(), count = matches.len(), "resolved pattern");
        images.extend(matches);
    }

    Ok(images)
}

fn expand(pattern: &str) -> Result<Vec<PathBuf>, Error> {
    let no_match = || Error::NoMatch {
        pattern: pattern.to_string(),
    };

    let path = Path::new(pattern);
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(no_match)?;
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    let glob = Pattern::new(name).map_err(|_| no_match())?;

    let search_dir = match parent.as_os_str().is_empty() {
        true => Path::new("."),
        false => parent,
    };
    let entries = match fs::read_dir(search_dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(Vec::new()),
    };

    let mut matches = Vec::new();
    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        let is_match = file_name.to_str().is_some_and(|name| glob.matches(name));
        if is_match && entry.file_type()?.is_file() {
            matches.push(normalize(&parent.join(file_name)));
        }
    }

    Ok(matches)
}

/// `path` without `.` components, so `./a.tif` and `a.tif` compare equal.
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|component| !matches!(component, Component::CurDir))
        .collect()
}

pub fn validate_dem(path: &Path) -> Result<(), Error> {
    match path.exists() {
        true => Ok(()),
        false => Err(Error::DemNotFound {
            path: path.to_path_buf(),
        }),
    }
}

pub fn validate_pose_file(path: &Path) -> Result<(), Error> {
    match path.exists() {
        true => Ok(()),
        false => Err(Error::PoseFileNotFound {
            path: path.to_path_buf(),
        }),
    }
}

/// Make sure `dir` can receive ortho images, creating it if it is missing.
pub fn prepare_output_dir(dir: Option<&Path>) -> Result<(), Error> {
    let Some(dir) = dir else {
        return Ok(());
    };

    if !dir.exists() {
        warn!("Creating ortho directory {}", dir.display());
        fs::create_dir_all(dir)?;
    }

    match dir.is_dir() {
        true => Ok(()),
        false => Err(Error::InvalidOutputDir {
            path: dir.to_path_buf(),
        }),
    }
}

/// Returns the ortho image path for `src`.
///
/// The image is placed in `ortho_dir` when given, otherwise beside `src`.
pub fn ortho_path(src: &Path, ortho_dir: Option<&Path>) -> PathBuf {
    let stem = src.file_stem().unwrap_or_default().to_string_lossy();
    let name = format!("{stem}{ORTHO_SUFFIX}");
    match ortho_dir {
        Some(dir) => dir.join(name),
        None => src.with_file_name(name),
    }
}

/// Paths of a batch, checked and ready to use.
#[derive(Clone, Debug, PartialEq)]
pub struct Inputs {
    pub images: BTreeSet<PathBuf>,
    pub dem: PathBuf,
    pub pose_file: PathBuf,
    pub ortho_dir: Option<PathBuf>,
}

impl Inputs {
    /// Run every input check, in order, before any image is processed.
    pub fn resolve<S: AsRef<str>>(
        patterns: &[S],
        dem: &Path,
        pose_file: &Path,
        ortho_dir: Option<&Path>,
    ) -> Result<Self, Error> {
        let images = resolve_images(patterns)?;
        validate_dem(dem)?;
        validate_pose_file(pose_file)?;
        prepare_output_dir(ortho_dir)?;

        Ok(Self {
            images,
            dem: dem.to_path_buf(),
            pose_file: pose_file.to_path_buf(),
            ortho_dir: ortho_dir.map(Path::to_path_buf),
        })
    }
}
