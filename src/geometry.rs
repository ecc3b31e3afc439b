//! Raster georeferencing: affine geotransforms, GeoTIFF tags and the source
//! image descriptor read before rectification.

use std::{
    fs::File,
    io::{BufReader, Read, Seek, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tiff::{
    decoder::Decoder,
    encoder::{DirectoryEncoder, TiffKind},
    tags::Tag,
};
use tracing::debug;

#[derive(Debug, Error)]
pub enum GeometryError {
    #[error("could not read image: {0}")]
    Image(#[from] image::ImageError),
    #[error("could not read GeoTIFF tags: {0}")]
    Tiff(#[from] tiff::TiffError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid georeferencing: {0}")]
    InvalidTransform(String),
}

/// Affine map from pixel (col, row) to ground (x, y).
///
/// Follows the `x = a * col + b * row + c`, `y = d * col + e * row + f`
/// convention. Pixel (0, 0) is the outer corner of the first pixel.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GeoTransform {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl GeoTransform {
    pub fn new(a: f64, b: f64, c: f64, d: f64, e: f64, f: f64) -> Self {
        Self { a, b, c, d, e, f }
    }

    /// The transform of a raster without georeferencing.
    pub fn identity() -> Self {
        Self::new(1.0, 0.0, 0.0, 0.0, 1.0, 0.0)
    }

    /// A north-up transform with its top-left corner at (`x`, `y`).
    pub fn north_up(x: f64, y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self::new(pixel_width, 0.0, x, 0.0, -pixel_height, y)
    }

    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.a * col + self.b * row + self.c,
            self.d * col + self.e * row + self.f,
        )
    }

    /// Returns the ground to pixel transform, or `None` if `self` is singular.
    pub fn inverse(&self) -> Option<Self> {
        let det = self.a * self.e - self.b * self.d;
        if det == 0.0 || !det.is_finite() {
            return None;
        }

        let a = self.e / det;
        let b = -self.b / det;
        let d = -self.d / det;
        let e = self.a / det;
        Some(Self::new(
            a,
            b,
            -(a * self.c + b * self.f),
            d,
            e,
            -(d * self.c + e * self.f),
        ))
    }

    pub fn is_rotated(&self) -> bool {
        self.b != 0.0 || self.d != 0.0
    }

    /// The same grid with its origin moved to pixel (`col`, `row`).
    pub fn shifted(&self, col: f64, row: f64) -> Self {
        let (c, f) = self.apply(col, row);
        Self { c, f, ..*self }
    }

    fn from_tie_point(tie_point: &[f64], scale: &[f64]) -> Result<Self, GeometryError> {
        if tie_point.len() < 6 || scale.len() < 2 {
            return Err(GeometryError::InvalidTransform(
                "tie point or pixel scale is truncated".into(),
            ));
        }
        let (i, j, x, y) = (tie_point[0], tie_point[1], tie_point[3], tie_point[4]);
        let (sx, sy) = (scale[0], scale[1]);
        Ok(Self::new(sx, 0.0, x - i * sx, 0.0, -sy, y + j * sy))
    }

    fn from_model_transformation(matrix: &[f64]) -> Result<Self, GeometryError> {
        if matrix.len() < 16 {
            return Err(GeometryError::InvalidTransform(
                "model transformation is not a 4x4 matrix".into(),
            ));
        }
        Ok(Self::new(
            matrix[0], matrix[1], matrix[3], matrix[4], matrix[5], matrix[7],
        ))
    }
}

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const MODEL_TRANSFORMATION: u16 = 34264;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GEO_DOUBLE_PARAMS: u16 = 34736;
const GEO_ASCII_PARAMS: u16 = 34737;
const GDAL_NODATA: u16 = 42113;

const GT_RASTER_TYPE_GEO_KEY: u16 = 1025;
const RASTER_PIXEL_IS_POINT: u16 = 2;

fn tag(code: u16) -> Tag {
    Tag::from_u16_exhaustive(code)
}

/// Georeferencing carried by a GeoTIFF image directory.
///
/// `transform` always maps pixel corners. Rasters tagged PixelIsPoint store
/// their model tags at pixel centres and are shifted by half a pixel on read
/// and write.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct GeoTags {
    pub transform: Option<GeoTransform>,
    pub key_directory: Option<Vec<u16>>,
    pub double_params: Option<Vec<f64>>,
    pub ascii_params: Option<String>,
    pub nodata: Option<String>,
}

impl GeoTags {
    /// Returns true if the GeoKey directory marks the raster PixelIsPoint.
    pub fn pixel_is_point(&self) -> bool {
        let Some(keys) = &self.key_directory else {
            return false;
        };
        // A 4 entry header, then (key, location, count, value) per key.
        keys.get(4..)
            .unwrap_or_default()
            .chunks_exact(4)
            .any(|key| {
                key[0] == GT_RASTER_TYPE_GEO_KEY && key[1] == 0 && key[3] == RASTER_PIXEL_IS_POINT
            })
    }

    /// Read the tags of the current image of `decoder`.
    pub fn read<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<Self, GeometryError> {
        let scale = decoder
            .find_tag(tag(MODEL_PIXEL_SCALE))?
            .map(|v| v.into_f64_vec())
            .transpose()?;
        let tie_point = decoder
            .find_tag(tag(MODEL_TIEPOINT))?
            .map(|v| v.into_f64_vec())
            .transpose()?;
        let matrix = decoder
            .find_tag(tag(MODEL_TRANSFORMATION))?
            .map(|v| v.into_f64_vec())
            .transpose()?;

        let transform = match (matrix, tie_point, scale) {
            (Some(matrix), _, _) => Some(GeoTransform::from_model_transformation(&matrix)?),
            (None, Some(tie_point), Some(scale)) => {
                Some(GeoTransform::from_tie_point(&tie_point, &scale)?)
            }
            _ => None,
        };

        let mut tags = Self {
            transform,
            key_directory: decoder
                .find_tag(tag(GEO_KEY_DIRECTORY))?
                .map(|v| v.into_u16_vec())
                .transpose()?,
            double_params: decoder
                .find_tag(tag(GEO_DOUBLE_PARAMS))?
                .map(|v| v.into_f64_vec())
                .transpose()?,
            ascii_params: decoder
                .find_tag(tag(GEO_ASCII_PARAMS))?
                .map(|v| v.into_string())
                .transpose()?
                .map(|text| text.trim_end_matches('\0').to_string()),
            nodata: decoder
                .find_tag(tag(GDAL_NODATA))?
                .map(|v| v.into_string())
                .transpose()?
                .map(|text| text.trim_end_matches('\0').trim().to_string()),
        };
        if tags.pixel_is_point() {
            tags.transform = tags.transform.map(|t| t.shifted(-0.5, -0.5));
        }
        Ok(tags)
    }

    /// Write the tags into the image directory of `encoder`.
    pub fn write<W: Write + Seek, K: TiffKind>(
        &self,
        encoder: &mut DirectoryEncoder<'_, W, K>,
    ) -> Result<(), GeometryError> {
        if let Some(transform) = self.transform {
            let transform = match self.pixel_is_point() {
                true => transform.shifted(0.5, 0.5),
                false => transform,
            };
            match transform.is_rotated() {
                false => {
                    encoder.write_tag(
                        tag(MODEL_PIXEL_SCALE),
                        &[transform.a, -transform.e, 0.0][..],
                    )?;
                    encoder.write_tag(
                        tag(MODEL_TIEPOINT),
                        &[0.0, 0.0, 0.0, transform.c, transform.f, 0.0][..],
                    )?;
                }
                true => {
                    let t = transform;
                    encoder.write_tag(
                        tag(MODEL_TRANSFORMATION),
                        &[
                            t.a, t.b, 0.0, t.c, t.d, t.e, 0.0, t.f, 0.0, 0.0, 0.0, 0.0, 0.0,
                            0.0, 0.0, 1.0,
                        ][..],
                    )?;
                }
            }
        }
        if let Some(keys) = &self.key_directory {
            encoder.write_tag(tag(GEO_KEY_DIRECTORY), &keys[..])?;
        }
        if let Some(doubles) = &self.double_params {
            encoder.write_tag(tag(GEO_DOUBLE_PARAMS), &doubles[..])?;
        }
        if let Some(ascii) = &self.ascii_params {
            encoder.write_tag(tag(GEO_ASCII_PARAMS), ascii.as_str())?;
        }
        if let Some(nodata) = &self.nodata {
            encoder.write_tag(tag(GDAL_NODATA), nodata.as_str())?;
        }
        Ok(())
    }
}

/// A source image's path, georeferencing and pixel size.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceImage {
    pub path: PathBuf,
    pub transform: GeoTransform,
    pub width: u32,
    pub height: u32,
}

impl SourceImage {
    /// Read the geometry of the image at `path` without decoding its pixels.
    ///
    /// Images without georeferencing (including non-TIFF formats) get the
    /// identity transform.
    pub fn read(path: &Path) -> Result<Self, GeometryError> {
        let (width, height) = image::image_dimensions(path)?;

        let transform = match image::ImageFormat::from_path(path) {
            Ok(image::ImageFormat::Tiff) => {
                let mut decoder = Decoder::new(BufReader::new(File::open(path)?))?;
                GeoTags::read(&mut decoder)?.transform
            }
            _ => None,
        };
        let transform = transform.unwrap_or_else(|| {
            debug!(path = %path.display(), "no georeferencing, using identity transform");
            GeoTransform::identity()
        });

        Ok(Self {
            path: path.to_path_buf(),
            transform,
            width,
            height,
        })
    }

    /// Image size in pixels as (width, height).
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
