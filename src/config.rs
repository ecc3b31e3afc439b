//! Declarative run configuration.
//!
//! A configuration document is loaded untyped first so that it can be
//! exported verbatim with `--write-conf`, even when it would not validate.
//! [`ConfigDocument::to_config`] then checks it against the typed schema.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::{collections::BTreeMap, fs, path::Path};
use tracing::{debug, info};

/// The shipped `config.yaml`, used when no config path is given.
pub const DEFAULT_CONFIG: &str = include_str!("../config.yaml");

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DocumentFormat {
    Yaml,
    Json,
}

impl DocumentFormat {
    fn of(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .as_deref()
        {
            Some("json") => Self::Json,
            _ => Self::Yaml,
        }
    }
}

/// A configuration document as it was read, before validation.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigDocument {
    value: Value,
}

impl ConfigDocument {
    /// Read the document at `path`, or the built-in [`DEFAULT_CONFIG`] when
    /// `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let Some(path) = path else {
            debug!("using built-in config");
            return Self::parse(DEFAULT_CONFIG, DocumentFormat::Yaml, Path::new("config.yaml"));
        };
        if !path.exists() {
            return Err(Error::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let text = fs::read_to_string(path).map_err(|err| Error::ConfigParse {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        let document = Self::parse(&text, DocumentFormat::of(path), path)?;
        debug!(path = %path.display(), "read config");
        Ok(document)
    }

    fn parse(text: &str, format: DocumentFormat, path: &Path) -> Result<Self, Error> {
        let parse_error = |reason: String| Error::ConfigParse {
            path: path.to_path_buf(),
            reason,
        };
        let value: Value = match format {
            DocumentFormat::Yaml => {
                serde_yaml::from_str(text).map_err(|err| parse_error(err.to_string()))?
            }
            DocumentFormat::Json => {
                serde_json::from_str(text).map_err(|err| parse_error(err.to_string()))?
            }
        };
        Ok(Self { value })
    }

    /// Serialize the document to `path`, as JSON if it has a `.json` extension
    /// and as YAML otherwise.
    pub fn write(&self, path: &Path) -> Result<(), Error> {
        let write_error = |reason: String| Error::ConfigWrite {
            path: path.to_path_buf(),
            reason,
        };
        let text = match DocumentFormat::of(path) {
            DocumentFormat::Yaml => {
                serde_yaml::to_string(&self.value).map_err(|err| write_error(err.to_string()))?
            }
            DocumentFormat::Json => serde_json::to_string_pretty(&self.value)
                .map_err(|err| write_error(err.to_string()))?,
        };
        fs::write(path, text).map_err(|err| write_error(err.to_string()))?;

        info!("Wrote config to {}", path.display());
        Ok(())
    }

    /// Validate the document against the typed schema.
    pub fn to_config(&self) -> Result<Config, Error> {
        let config: Config =
            serde_yaml::from_value(self.value.clone()).map_err(|err| Error::ConfigValidation {
                reason: err.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }
}

impl TryFrom<&Config> for ConfigDocument {
    type Error = Error;

    fn try_from(config: &Config) -> Result<Self, Self::Error> {
        let value = serde_yaml::to_value(config).map_err(|err| Error::ConfigValidation {
            reason: err.to_string(),
        })?;
        Ok(Self { value })
    }
}

/// Validated run configuration.
///
/// Keys other than `camera` and `ortho` are kept in `extra` and handed to the
/// engine untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub camera: CameraConfig,
    pub ortho: OrthoConfig,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Config {
    fn validate(&self) -> Result<(), Error> {
        let invalid = |reason: &str| {
            Err(Error::ConfigValidation {
                reason: reason.to_string(),
            })
        };

        if !is_positive(self.camera.focal_len) {
            return invalid("camera.focal_len must be a positive number");
        }
        if !self.camera.sensor_size.iter().copied().all(is_positive) {
            return invalid("camera.sensor_size must contain two positive numbers");
        }
        if !self.ortho.resolution.iter().copied().all(is_positive) {
            return invalid("ortho.resolution must contain two positive numbers");
        }
        if self.ortho.dem_band == 0 {
            return invalid("ortho.dem_band is 1-based and must be at least 1");
        }
        if self.ortho.tile_size.contains(&0) {
            return invalid("ortho.tile_size must contain two non-zero sizes");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera: CameraConfig::default(),
            ortho: OrthoConfig::default(),
            extra: BTreeMap::new(),
        }
    }
}

fn is_positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

/// Camera interior parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Focal length, in the same units as `sensor_size`.
    pub focal_len: f64,

    /// Physical sensor (width, height).
    pub sensor_size: [f64; 2],

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Rectification options.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrthoConfig {
    #[serde(default)]
    pub dem_interp: Interpolation,

    /// 1-based band index into the DEM.
    #[serde(default = "default_dem_band")]
    pub dem_band: u32,

    #[serde(default)]
    pub interp: Interpolation,

    /// Ortho pixel size (x, y) in DEM units.
    #[serde(default = "default_resolution")]
    pub resolution: [f64; 2],

    #[serde(default)]
    pub compress: Compression,

    #[serde(default = "default_tile_size")]
    pub tile_size: [u32; 2],

    #[serde(default)]
    pub nodata: u8,

    #[serde(default = "default_overwrite")]
    pub overwrite: bool,

    /// Build an overview pyramid for each ortho image.
    pub build_ovw: bool,

    #[serde(default)]
    pub overview_resampling: OverviewResampling,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            focal_len: 0.12,
            sensor_size: [0.2304, 0.1392],
            extra: BTreeMap::new(),
        }
    }
}

impl Default for OrthoConfig {
    fn default() -> Self {
        Self {
            dem_interp: Interpolation::default(),
            dem_band: default_dem_band(),
            interp: Interpolation::default(),
            resolution: default_resolution(),
            compress: Compression::default(),
            tile_size: default_tile_size(),
            nodata: 0,
            overwrite: default_overwrite(),
            build_ovw: true,
            overview_resampling: OverviewResampling::default(),
            extra: BTreeMap::new(),
        }
    }
}

fn default_dem_band() -> u32 {
    1
}

fn default_resolution() -> [f64; 2] {
    [0.5, 0.5]
}

fn default_tile_size() -> [u32; 2] {
    [256, 256]
}

fn default_overwrite() -> bool {
    true
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    Nearest,
    #[default]
    Bilinear,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    None,
    #[default]
    Deflate,
    Lzw,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverviewResampling {
    Nearest,
    #[default]
    Average,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn shipped_config_matches_default() {
        let config = ConfigDocument::load(None).unwrap().to_config().unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn default_does_not_depend_on_the_filesystem() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("exported.yaml");

        ConfigDocument::load(None).unwrap().write(&target).unwrap();

        assert_eq!(
            ConfigDocument::load(Some(&target)).unwrap().to_config().unwrap(),
            Config::default()
        );
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.yaml");
        assert!(matches!(
            ConfigDocument::load(Some(&path)),
            Err(Error::ConfigNotFound { path: p }) if p == path
        ));
    }

    #[test]
    fn malformed_yaml_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "bad.yaml", "camera: [unclosed");
        assert!(matches!(
            ConfigDocument::load(Some(&path)),
            Err(Error::ConfigParse { .. })
        ));
    }

    #[rstest]
    #[case("ortho:\n  build_ovw: true\n", "camera")]
    #[case("camera:\n  focal_len: 0.1\n  sensor_size: [0.2, 0.1]\n", "ortho")]
    #[case(
        "camera:\n  focal_len: 0.1\n  sensor_size: [0.2, 0.1]\northo:\n  interp: bilinear\n",
        "build_ovw"
    )]
    #[case(
        "camera:\n  focal_len: -0.1\n  sensor_size: [0.2, 0.1]\northo:\n  build_ovw: false\n",
        "focal_len"
    )]
    #[case(
        "camera:\n  focal_len: 0.1\n  sensor_size: [0.2, 0.1]\northo:\n  build_ovw: false\n  dem_band: 0\n",
        "dem_band"
    )]
    fn invalid_documents_name_the_field(#[case] contents: &str, #[case] field: &str) {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "config.yaml", contents);
        let document = ConfigDocument::load(Some(&path)).unwrap();

        match document.to_config() {
            Err(Error::ConfigValidation { reason }) => assert!(
                reason.contains(field),
                "expected `{field}` in `{reason}`"
            ),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn optional_ortho_fields_take_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "config.yaml",
            "camera:\n  focal_len: 0.1\n  sensor_size: [0.2, 0.1]\northo:\n  build_ovw: false\n",
        );
        let config = ConfigDocument::load(Some(&path))
            .unwrap()
            .to_config()
            .unwrap();

        assert!(!config.ortho.build_ovw);
        assert_eq!(config.ortho.resolution, [0.5, 0.5]);
        assert_eq!(config.ortho.interp, Interpolation::Bilinear);
        assert_eq!(config.ortho.compress, Compression::Deflate);
        assert_eq!(config.ortho.dem_band, 1);
    }

    #[test]
    fn unknown_keys_pass_through() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "config.yaml",
            "camera:\n  focal_len: 0.1\n  sensor_size: [0.2, 0.1]\n  maker: acme\n\
             ortho:\n  build_ovw: false\n  driver: GTiff\nnotes: survey 7\n",
        );
        let config = ConfigDocument::load(Some(&path))
            .unwrap()
            .to_config()
            .unwrap();

        assert_eq!(
            config.camera.extra.get("maker"),
            Some(&Value::String("acme".into()))
        );
        assert_eq!(
            config.ortho.extra.get("driver"),
            Some(&Value::String("GTiff".into()))
        );
        assert_eq!(
            config.extra.get("notes"),
            Some(&Value::String("survey 7".into()))
        );
    }

    #[rstest]
    #[case("copy.yaml")]
    #[case("copy.yml")]
    #[case("copy.json")]
    fn written_document_reloads_equal(#[case] name: &str) {
        let dir = TempDir::new().unwrap();
        let document = ConfigDocument::load(None).unwrap();
        let path = dir.path().join(name);

        document.write(&path).unwrap();

        assert_eq!(ConfigDocument::load(Some(&path)).unwrap(), document);
    }

    #[test]
    fn invalid_document_can_still_be_written() {
        let dir = TempDir::new().unwrap();
        let source = write_file(&dir, "partial.yaml", "ortho:\n  build_ovw: true\n");
        let target = dir.path().join("out.yaml");

        let document = ConfigDocument::load(Some(&source)).unwrap();
        document.write(&target).unwrap();

        assert_eq!(ConfigDocument::load(Some(&target)).unwrap(), document);
        assert!(document.to_config().is_err());
    }

    #[test]
    fn default_config_converts_to_document() {
        let document = ConfigDocument::try_from(&Config::default()).unwrap();
        assert_eq!(document.to_config().unwrap(), Config::default());
    }

    #[rstest]
    #[case("a.json", DocumentFormat::Json)]
    #[case("a.JSON", DocumentFormat::Json)]
    #[case("a.yaml", DocumentFormat::Yaml)]
    #[case("a", DocumentFormat::Yaml)]
    fn format_follows_extension(#[case] name: &str, #[case] format: DocumentFormat) {
        assert_eq!(DocumentFormat::of(Path::new(name)), format);
    }
}
