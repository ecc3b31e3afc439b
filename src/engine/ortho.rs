//! Resampling a source image onto a north-up ground grid and writing it as a
//! GeoTIFF.

use super::{BuildOverviews, EngineError, dem::Dem, frame::FrameCamera, overview};
use crate::{
    config::{Compression, Interpolation, OrthoConfig, OverviewResampling},
    geometry::{GeoTags, GeoTransform, GeometryError},
};
use image::DynamicImage;
use nalgebra::{Vector2, Vector3};
use rayon::prelude::*;
use std::{
    fs::File,
    io::{BufWriter, Seek, Write},
    path::{Path, PathBuf},
    time::Instant,
};
use tiff::{
    encoder::{
        TiffEncoder,
        colortype::{self, ColorType},
        compression::{self as tiff_compression, Compression as TiffCompression},
    },
    tags::Tag,
};
use tracing::{debug, info};

const NEW_SUBFILE_TYPE: u16 = 254;

/// Largest ortho grid, in pixels, that is allocated.
pub(crate) const MAX_GRID_PIXELS: u64 = 1 << 28;

/// Pixels of an interleaved 8-bit raster.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Raster<'a> {
    pub width: u32,
    pub height: u32,
    pub bands: usize,
    pub data: &'a [u8],
}

impl Raster<'_> {
    pub fn pixel(&self, col: u32, row: u32) -> &[u8] {
        let start = (row as usize * self.width as usize + col as usize) * self.bands;
        &self.data[start..start + self.bands]
    }
}

/// A rectified image that has been written to disk.
#[derive(Clone, Debug)]
pub struct OrthoImage {
    path: PathBuf,
    width: u32,
    height: u32,
    bands: usize,
    data: Vec<u8>,
    transform: GeoTransform,
    nodata: u8,
    compress: Compression,
    tile_size: [u32; 2],
    resampling: OverviewResampling,
}

impl OrthoImage {
    /// Size in pixels as (width, height).
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn transform(&self) -> GeoTransform {
        self.transform
    }

    pub fn nodata(&self) -> u8 {
        self.nodata
    }

    pub(crate) fn raster(&self) -> Raster<'_> {
        Raster {
            width: self.width,
            height: self.height,
            bands: self.bands,
            data: &self.data,
        }
    }

    pub(crate) fn compress(&self) -> Compression {
        self.compress
    }

    pub(crate) fn resampling(&self) -> OverviewResampling {
        self.resampling
    }

    /// Smallest dimension an overview level may have.
    pub(crate) fn min_overview_size(&self) -> u32 {
        self.tile_size[0].min(self.tile_size[1]).max(1)
    }

    /// Fraction of pixels that hold image data.
    pub fn coverage(&self) -> f64 {
        let raster = self.raster();
        let valid = (0..self.height)
            .flat_map(|row| (0..self.width).map(move |col| (col, row)))
            .filter(|&(col, row)| !is_nodata(raster.pixel(col, row), self.nodata))
            .count();
        valid as f64 / (self.width as f64 * self.height as f64)
    }
}

impl BuildOverviews for OrthoImage {
    fn path(&self) -> &Path {
        &self.path
    }

    fn build_overviews(&self) -> Result<(), EngineError> {
        overview::build(self)
    }
}

pub(crate) fn is_nodata(pixel: &[u8], nodata: u8) -> bool {
    pixel.iter().all(|&v| v == nodata)
}

/// Ground grid of an ortho image.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Grid {
    pub transform: GeoTransform,
    pub width: u32,
    pub height: u32,
}

/// Grid covering the part of the DEM that `camera` can see, snapped to
/// `resolution`.
pub(crate) fn footprint(
    camera: &FrameCamera,
    dem: &Dem,
    resolution: [f64; 2],
) -> Result<Grid, EngineError> {
    let (z_min, z_max) = dem
        .height_range()
        .ok_or_else(|| EngineError::Other("DEM has no valid elevations".into()))?;
    let (width, height) = camera.dimensions();
    let (right, bottom) = (width as f64 - 0.5, height as f64 - 0.5);

    // The footprint lies between the corner rays' intersections with the
    // lowest and highest terrain.
    let mut bounds = (f64::MAX, f64::MAX, f64::MIN, f64::MIN);
    for corner in [
        Vector2::new(-0.5, -0.5),
        Vector2::new(right, -0.5),
        Vector2::new(right, bottom),
        Vector2::new(-0.5, bottom),
    ] {
        for z in [z_min, z_max] {
            let ground = camera.unproject(&corner, z).ok_or_else(|| {
                EngineError::Other(format!(
                    "ray through image corner ({}, {}) does not reach the ground",
                    corner.x, corner.y
                ))
            })?;
            bounds = (
                bounds.0.min(ground.x),
                bounds.1.min(ground.y),
                bounds.2.max(ground.x),
                bounds.3.max(ground.y),
            );
        }
    }

    let dem_bounds = dem.bounds();
    let x_min = bounds.0.max(dem_bounds.0);
    let y_min = bounds.1.max(dem_bounds.1);
    let x_max = bounds.2.min(dem_bounds.2);
    let y_max = bounds.3.min(dem_bounds.3);
    if x_min >= x_max || y_min >= y_max {
        return Err(EngineError::NoOverlap);
    }

    let [res_x, res_y] = resolution;
    let x_min = (x_min / res_x).floor() * res_x;
    let y_max = (y_max / res_y).ceil() * res_y;
    let width = ((x_max - x_min) / res_x).ceil().max(1.0);
    let height = ((y_max - y_min) / res_y).ceil().max(1.0);
    if width * height > MAX_GRID_PIXELS as f64 {
        return Err(EngineError::GridTooLarge {
            width: width as u64,
            height: height as u64,
            limit: MAX_GRID_PIXELS,
        });
    }

    Ok(Grid {
        transform: GeoTransform::north_up(x_min, y_max, res_x, res_y),
        width: width as u32,
        height: height as u32,
    })
}

/// Decoded source pixels.
struct Source {
    width: u32,
    height: u32,
    bands: usize,
    data: Vec<u8>,
}

impl Source {
    fn new(image: DynamicImage) -> Self {
        let (width, height) = (image.width(), image.height());
        if image.color().has_color() {
            Self {
                width,
                height,
                bands: 3,
                data: image.into_rgb8().into_raw(),
            }
        } else {
            Self {
                width,
                height,
                bands: 1,
                data: image.into_luma8().into_raw(),
            }
        }
    }

    fn at(&self, col: u32, row: u32, band: usize) -> f64 {
        self.data[(row as usize * self.width as usize + col as usize) * self.bands + band] as f64
    }

    /// Sample at pixel coordinates `pixel`, writing one value per band into
    /// `out`. Returns false if `pixel` is outside the image.
    fn sample(&self, pixel: &Vector2<f64>, interp: Interpolation, out: &mut [u8]) -> bool {
        let (w, h) = (self.width as f64, self.height as f64);
        if !(-0.5..w - 0.5).contains(&pixel.x) || !(-0.5..h - 0.5).contains(&pixel.y) {
            return false;
        }

        match interp {
            Interpolation::Nearest => {
                let col = pixel.x.round().clamp(0.0, w - 1.0) as u32;
                let row = pixel.y.round().clamp(0.0, h - 1.0) as u32;
                for (band, value) in out.iter_mut().enumerate() {
                    *value = self.at(col, row, band) as u8;
                }
            }
            Interpolation::Bilinear => {
                let fx = pixel.x.clamp(0.0, w - 1.0);
                let fy = pixel.y.clamp(0.0, h - 1.0);
                let (x0, y0) = (fx.floor() as u32, fy.floor() as u32);
                let (x1, y1) = ((x0 + 1).min(self.width - 1), (y0 + 1).min(self.height - 1));
                let (tx, ty) = (fx - x0 as f64, fy - y0 as f64);

                for (band, value) in out.iter_mut().enumerate() {
                    let top = self.at(x0, y0, band) * (1.0 - tx) + self.at(x1, y0, band) * tx;
                    let bottom = self.at(x0, y1, band) * (1.0 - tx) + self.at(x1, y1, band) * tx;
                    *value = (top * (1.0 - ty) + bottom * ty).round().clamp(0.0, 255.0) as u8;
                }
            }
        }
        true
    }
}

pub(crate) fn rectify(
    camera: &FrameCamera,
    src: &Path,
    dem_path: &Path,
    options: &OrthoConfig,
    output: &Path,
) -> Result<OrthoImage, EngineError> {
    if output.exists() && !options.overwrite {
        return Err(EngineError::OutputExists {
            path: output.to_path_buf(),
        });
    }
    let started = Instant::now();

    let dem = Dem::read(dem_path, options.dem_band)?;
    let grid = footprint(camera, &dem, options.resolution)?;
    debug!(
        "ortho grid {}x{} at {:?}",
        grid.width, grid.height, grid.transform
    );

    let source = image::open(src)
        .map(Source::new)
        .map_err(|err| EngineError::Read {
            path: src.to_path_buf(),
            reason: err.to_string(),
        })?;
    if (source.width, source.height) != camera.dimensions() {
        return Err(EngineError::InvalidCamera(format!(
            "camera is {:?} pixels but {} is {}x{}",
            camera.dimensions(),
            src.display(),
            source.width,
            source.height
        )));
    }

    let bands = source.bands;
    let row_len = grid.width as usize * bands;
    let mut data = vec![options.nodata; row_len * grid.height as usize];

    data.par_chunks_mut(row_len)
        .enumerate()
        .for_each(|(row, line)| {
            for (col, out) in line.chunks_mut(bands).enumerate() {
                let (x, y) = grid.transform.apply(col as f64 + 0.5, row as f64 + 0.5);
                let Some(z) = dem.sample(x, y, options.dem_interp) else {
                    continue;
                };
                let Some(pixel) = camera.project(&Vector3::new(x, y, z)) else {
                    continue;
                };
                source.sample(&pixel, options.interp, out);
            }
        });

    let ortho = OrthoImage {
        path: output.to_path_buf(),
        width: grid.width,
        height: grid.height,
        bands,
        data,
        transform: grid.transform,
        nodata: options.nodata,
        compress: options.compress,
        tile_size: options.tile_size,
        resampling: options.overview_resampling,
    };

    let tags = GeoTags {
        transform: Some(grid.transform),
        nodata: Some(options.nodata.to_string()),
        ..dem.geo_tags().clone()
    };
    write_geotiff(output, &ortho.raster(), options.compress, options.tile_size[1], &tags)?;

    if camera.log().engine_debug() {
        debug!(
            "{:.1}% of {} holds image data",
            ortho.coverage() * 100.0,
            output.display()
        );
    }
    info!(
        "Wrote {} in {:.2} secs",
        output.display(),
        started.elapsed().as_secs_f64()
    );

    Ok(ortho)
}

pub(crate) fn write_geotiff(
    path: &Path,
    raster: &Raster,
    compress: Compression,
    rows_per_strip: u32,
    tags: &GeoTags,
) -> Result<(), EngineError> {
    let write_error = |reason: String| EngineError::Write {
        path: path.to_path_buf(),
        reason,
    };

    let file = File::create(path).map_err(|err| write_error(err.to_string()))?;
    let mut encoder =
        TiffEncoder::new(BufWriter::new(file)).map_err(|err| write_error(err.to_string()))?;
    write_page(&mut encoder, raster, compress, rows_per_strip, tags, false)
        .map_err(|err| write_error(err.to_string()))
}

/// Append `raster` as a new image directory of `encoder`.
///
/// `reduced` marks the page as a reduced resolution copy of another image.
pub(crate) fn write_page<W: Write + Seek>(
    encoder: &mut TiffEncoder<W>,
    raster: &Raster,
    compress: Compression,
    rows_per_strip: u32,
    tags: &GeoTags,
    reduced: bool,
) -> Result<(), GeometryError> {
    let page = Page {
        raster,
        rows_per_strip: rows_per_strip.clamp(1, raster.height.max(1)),
        tags,
        reduced,
    };
    match compress {
        Compression::None => page.write(encoder, tiff_compression::Uncompressed),
        Compression::Deflate => page.write(encoder, tiff_compression::Deflate::default()),
        Compression::Lzw => page.write(encoder, tiff_compression::Lzw),
    }
}

struct Page<'a> {
    raster: &'a Raster<'a>,
    rows_per_strip: u32,
    tags: &'a GeoTags,
    reduced: bool,
}

impl Page<'_> {
    fn write<W: Write + Seek, D: TiffCompression>(
        &self,
        encoder: &mut TiffEncoder<W>,
        compression: D,
    ) -> Result<(), GeometryError> {
        match self.raster.bands {
            3 => self.write_as::<W, colortype::RGB8, D>(encoder, compression),
            _ => self.write_as::<W, colortype::Gray8, D>(encoder, compression),
        }
    }

    fn write_as<W: Write + Seek, C: ColorType<Inner = u8>, D: TiffCompression>(
        &self,
        encoder: &mut TiffEncoder<W>,
        compression: D,
    ) -> Result<(), GeometryError> {
        let mut image = encoder.new_image_with_compression::<C, D>(
            self.raster.width,
            self.raster.height,
            compression,
        )?;
        image.rows_per_strip(self.rows_per_strip)?;
        if self.reduced {
            image
                .encoder()
                .write_tag(Tag::from_u16_exhaustive(NEW_SUBFILE_TYPE), 1u32)?;
        }
        self.tags.write(image.encoder())?;
        image.write_data(self.raster.data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{engine::CameraParams, logging::LogConfig};
    use approx::assert_relative_eq;
    use rstest::rstest;
    use std::io::BufReader;
    use tempfile::TempDir;
    use tiff::decoder::{Decoder, DecodingResult};

    /// Flat 100x100 m DEM at 50 m with 1 m cells, top-left at (1000, 2100).
    fn flat_dem() -> Dem {
        Dem::new(
            100,
            100,
            vec![50.0; 100 * 100],
            GeoTransform::north_up(1000.0, 2100.0, 1.0, 1.0),
            None,
        )
        .unwrap()
    }

    /// Nadir camera 100 m above the DEM centre seeing a 20x10 m patch.
    fn nadir_camera() -> FrameCamera {
        FrameCamera::new(
            CameraParams {
                focal_len: 0.1,
                sensor_size: [0.02, 0.01],
                pixel_dims: (20, 10),
                transform: GeoTransform::identity(),
                position: Vector3::new(1050.0, 2050.0, 150.0),
                orientation: Vector3::zeros(),
            },
            LogConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn footprint_of_nadir_camera() {
        let grid = footprint(&nadir_camera(), &flat_dem(), [0.5, 0.5]).unwrap();

        assert_eq!(grid.transform, GeoTransform::north_up(1040.0, 2055.0, 0.5, 0.5));
        assert_eq!((grid.width, grid.height), (40, 20));
    }

    #[test]
    fn footprint_is_clipped_to_dem() {
        let dem = Dem::new(
            10,
            10,
            vec![50.0; 100],
            GeoTransform::north_up(1045.0, 2060.0, 1.0, 1.0),
            None,
        )
        .unwrap();
        let grid = footprint(&nadir_camera(), &dem, [1.0, 1.0]).unwrap();

        assert_eq!(grid.transform, GeoTransform::north_up(1045.0, 2055.0, 1.0, 1.0));
        assert_eq!((grid.width, grid.height), (10, 5));
    }

    #[test]
    fn footprint_outside_dem() {
        let dem = Dem::new(
            10,
            10,
            vec![50.0; 100],
            GeoTransform::north_up(5000.0, 5000.0, 1.0, 1.0),
            None,
        )
        .unwrap();
        assert!(matches!(
            footprint(&nadir_camera(), &dem, [1.0, 1.0]),
            Err(EngineError::NoOverlap)
        ));
    }

    #[test]
    fn oversized_grid_is_refused() {
        // 20x10 m at 0.1 mm is 2e10 pixels.
        let result = footprint(&nadir_camera(), &flat_dem(), [1e-4, 1e-4]);

        assert!(matches!(
            result,
            Err(EngineError::GridTooLarge { limit: MAX_GRID_PIXELS, .. })
        ));
    }

    #[rstest]
    #[case(Interpolation::Nearest, Vector2::new(0.4, 0.0), Some(10))]
    #[case(Interpolation::Bilinear, Vector2::new(0.5, 0.0), Some(15))]
    #[case(Interpolation::Bilinear, Vector2::new(0.5, 0.5), Some(25))]
    #[case(Interpolation::Nearest, Vector2::new(-0.6, 0.0), None)]
    #[case(Interpolation::Bilinear, Vector2::new(0.0, 1.5), None)]
    fn source_sampling(
        #[case] interp: Interpolation,
        #[case] pixel: Vector2<f64>,
        #[case] expected: Option<u8>,
    ) {
        let source = Source {
            width: 2,
            height: 2,
            bands: 1,
            data: vec![10, 20, 30, 40],
        };
        let mut out = [0u8];
        let inside = source.sample(&pixel, interp, &mut out);

        assert_eq!(inside.then_some(out[0]), expected);
    }

    fn read_back(path: &Path) -> (u32, u32, Vec<u8>, GeoTags) {
        let mut decoder = Decoder::new(BufReader::new(File::open(path).unwrap())).unwrap();
        let (width, height) = decoder.dimensions().unwrap();
        let tags = GeoTags::read(&mut decoder).unwrap();
        let DecodingResult::U8(data) = decoder.read_image().unwrap() else {
            panic!("expected 8-bit samples");
        };
        (width, height, data, tags)
    }

    #[rstest]
    #[case(Compression::None)]
    #[case(Compression::Deflate)]
    #[case(Compression::Lzw)]
    fn geotiff_is_readable(#[case] compress: Compression) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.tif");
        let data: Vec<u8> = (0..60).collect();
        let raster = Raster {
            width: 5,
            height: 4,
            bands: 3,
            data: &data,
        };
        let tags = GeoTags {
            transform: Some(GeoTransform::north_up(10.0, 20.0, 0.5, 0.5)),
            nodata: Some("0".into()),
            ..Default::default()
        };

        write_geotiff(&path, &raster, compress, 2, &tags).unwrap();

        assert_eq!(read_back(&path), (5, 4, data, tags));
    }

    fn write_dem(path: &Path, dem: &Dem) {
        let (x_min, _, x_max, _) = dem.bounds();
        let width = (x_max - x_min) as u32;
        let mut encoder = TiffEncoder::new(BufWriter::new(File::create(path).unwrap())).unwrap();
        let mut image = encoder
            .new_image::<colortype::Gray32Float>(width, width)
            .unwrap();
        dem.geo_tags().write(image.encoder()).unwrap();
        image
            .write_data(&vec![50.0f32; (width * width) as usize])
            .unwrap();
    }

    #[test]
    fn rectifies_nadir_image() {
        let dir = TempDir::new().unwrap();
        let (src, dem_path, output) = (
            dir.path().join("img.png"),
            dir.path().join("dem.tif"),
            dir.path().join("img_ORTHO.tif"),
        );
        image::GrayImage::from_fn(20, 10, |x, _| image::Luma([10 + x as u8])).save(&src).unwrap();
        write_dem(&dem_path, &flat_dem());
        let options = OrthoConfig {
            interp: Interpolation::Nearest,
            resolution: [1.0, 1.0],
            ..Default::default()
        };

        let ortho = rectify(&nadir_camera(), &src, &dem_path, &options, &output).unwrap();

        assert_eq!(ortho.dimensions(), (20, 10));
        assert_eq!(ortho.raster().bands, 1);
        assert_relative_eq!(ortho.coverage(), 1.0);
        // Columns run west to east like the source.
        assert_eq!(ortho.raster().pixel(0, 0), &[10]);
        assert_eq!(ortho.raster().pixel(19, 9), &[29]);

        let (width, height, data, tags) = read_back(&output);
        assert_eq!((width, height), (20, 10));
        assert_eq!(data, ortho.raster().data);
        assert_eq!(tags.transform, Some(ortho.transform()));
        assert_eq!(tags.nodata.as_deref(), Some("0"));
    }

    #[test]
    fn existing_output_is_kept_without_overwrite() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("img_ORTHO.tif");
        std::fs::write(&output, b"keep").unwrap();
        let options = OrthoConfig {
            overwrite: false,
            ..Default::default()
        };

        let result = rectify(
            &nadir_camera(),
            &dir.path().join("img.png"),
            &dir.path().join("dem.tif"),
            &options,
            &output,
        );

        assert!(matches!(result, Err(EngineError::OutputExists { .. })));
        assert_eq!(std::fs::read(&output).unwrap(), b"keep");
    }

}
