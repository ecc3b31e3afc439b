use super::EngineError;
use crate::{
    config::Interpolation,
    geometry::{GeoTags, GeoTransform},
};
use std::{fs::File, io::BufReader, path::Path};
use tiff::decoder::{Decoder, DecodingResult};

/// A single band of elevations on a georeferenced grid.
#[derive(Clone, Debug)]
pub struct Dem {
    width: usize,
    height: usize,
    heights: Vec<f32>,
    transform: GeoTransform,
    inverse: GeoTransform,
    nodata: Option<f32>,
    tags: GeoTags,
}

impl Dem {
    pub fn new(
        width: usize,
        height: usize,
        heights: Vec<f32>,
        transform: GeoTransform,
        nodata: Option<f32>,
    ) -> Result<Self, EngineError> {
        if heights.len() != width * height || heights.is_empty() {
            return Err(EngineError::Other(format!(
                "expected {} elevations for a {width}x{height} DEM but got {}",
                width * height,
                heights.len()
            )));
        }
        let inverse = transform
            .inverse()
            .ok_or_else(|| EngineError::Other("DEM geotransform is singular".into()))?;

        Ok(Self {
            width,
            height,
            heights,
            transform,
            inverse,
            nodata,
            tags: GeoTags {
                transform: Some(transform),
                nodata: nodata.map(|value| value.to_string()),
                ..Default::default()
            },
        })
    }

    /// Read `band` (1-based) of the GeoTIFF at `path`.
    pub fn read(path: &Path, band: u32) -> Result<Self, EngineError> {
        let read_error = |reason: String| EngineError::Read {
            path: path.to_path_buf(),
            reason,
        };

        let file = File::open(path).map_err(|err| read_error(err.to_string()))?;
        let mut decoder =
            Decoder::new(BufReader::new(file)).map_err(|err| read_error(err.to_string()))?;
        let (width, height) = decoder
            .dimensions()
            .map_err(|err| read_error(err.to_string()))?;
        let tags = GeoTags::read(&mut decoder).map_err(|err| read_error(err.to_string()))?;
        let transform = tags
            .transform
            .ok_or_else(|| read_error("DEM has no georeferencing".into()))?;
        let samples = decoder
            .read_image()
            .map_err(|err| read_error(err.to_string()))
            .and_then(|result| into_f32(result).map_err(read_error))?;

        let (width, height) = (width as usize, height as usize);
        let bands = samples.len() / (width * height).max(1);
        if band == 0 || band as usize > bands {
            return Err(read_error(format!(
                "band {band} requested but the DEM has {bands} band(s)"
            )));
        }
        let heights = samples
            .into_iter()
            .skip(band as usize - 1)
            .step_by(bands)
            .collect();
        let nodata = tags
            .nodata
            .as_deref()
            .and_then(|text| text.parse::<f32>().ok());

        let mut dem = Self::new(width, height, heights, transform, nodata)?;
        dem.tags = tags;
        Ok(dem)
    }

    pub(crate) fn geo_tags(&self) -> &GeoTags {
        &self.tags
    }

    /// Ground extent as (min_x, min_y, max_x, max_y).
    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        let (w, h) = (self.width as f64, self.height as f64);
        let corners = [
            self.transform.apply(0.0, 0.0),
            self.transform.apply(w, 0.0),
            self.transform.apply(0.0, h),
            self.transform.apply(w, h),
        ];
        corners.iter().fold(
            (f64::MAX, f64::MAX, f64::MIN, f64::MIN),
            |(x0, y0, x1, y1), &(x, y)| (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
        )
    }

    /// Lowest and highest valid elevation, or `None` if every cell is nodata.
    pub fn height_range(&self) -> Option<(f64, f64)> {
        self.heights
            .iter()
            .filter(|&&h| self.is_valid(h))
            .fold(None, |range, &h| {
                let h = h as f64;
                Some(match range {
                    None => (h, h),
                    Some((lo, hi)) => (h.min(lo), h.max(hi)),
                })
            })
    }

    fn is_valid(&self, height: f32) -> bool {
        height.is_finite() && self.nodata != Some(height)
    }

    fn at(&self, col: usize, row: usize) -> Option<f64> {
        let height = self.heights[row * self.width + col];
        self.is_valid(height).then_some(height as f64)
    }

    /// Elevation at ground position (`x`, `y`), or `None` outside the grid or
    /// on nodata.
    pub fn sample(&self, x: f64, y: f64, interp: Interpolation) -> Option<f64> {
        let (col, row) = self.inverse.apply(x, y);
        if !(0.0..self.width as f64).contains(&col) || !(0.0..self.height as f64).contains(&row) {
            return None;
        }
        let nearest = self.at(col as usize, row as usize);

        match interp {
            Interpolation::Nearest => nearest,
            Interpolation::Bilinear => {
                // Interpolate between cell centres, clamping at the border.
                let fx = (col - 0.5).clamp(0.0, (self.width - 1) as f64);
                let fy = (row - 0.5).clamp(0.0, (self.height - 1) as f64);
                let (x0, y0) = (fx.floor() as usize, fy.floor() as usize);
                let (x1, y1) = ((x0 + 1).min(self.width - 1), (y0 + 1).min(self.height - 1));
                let (tx, ty) = (fx - x0 as f64, fy - y0 as f64);

                match (
                    self.at(x0, y0),
                    self.at(x1, y0),
                    self.at(x0, y1),
                    self.at(x1, y1),
                ) {
                    (Some(h00), Some(h10), Some(h01), Some(h11)) => {
                        let top = h00 + (h10 - h00) * tx;
                        let bottom = h01 + (h11 - h01) * tx;
                        Some(top + (bottom - top) * ty)
                    }
                    _ => nearest,
                }
            }
        }
    }
}

fn into_f32(result: DecodingResult) -> Result<Vec<f32>, String> {
    Ok(match result {
        DecodingResult::U8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(|h| h as f32).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(|h| h as f32).collect(),
        DecodingResult::F32(v) => v,
        DecodingResult::F64(v) => v.into_iter().map(|h| h as f32).collect(),
        _ => return Err("unsupported DEM sample format".into()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;

    /// 3x2 DEM with 10 m cells, top-left at (1000, 2000).
    fn dem(nodata: Option<f32>) -> Dem {
        Dem::new(
            3,
            2,
            vec![10.0, 20.0, 30.0, 40.0, 50.0, -9999.0],
            GeoTransform::north_up(1000.0, 2000.0, 10.0, 10.0),
            nodata,
        )
        .unwrap()
    }

    #[rstest]
    #[case(1005.0, 1995.0, Some(10.0))]
    #[case(1015.0, 1985.0, Some(50.0))]
    #[case(999.0, 1995.0, None)]
    #[case(1005.0, 2001.0, None)]
    #[case(1025.0, 1985.0, None)]
    fn nearest_sampling(#[case] x: f64, #[case] y: f64, #[case] expected: Option<f64>) {
        assert_eq!(
            dem(Some(-9999.0)).sample(x, y, Interpolation::Nearest),
            expected
        );
    }

    #[test]
    fn bilinear_between_centres() {
        let h = dem(None)
            .sample(1010.0, 1995.0, Interpolation::Bilinear)
            .unwrap();
        assert_relative_eq!(h, 15.0);

        let h = dem(None)
            .sample(1010.0, 1990.0, Interpolation::Bilinear)
            .unwrap();
        assert_relative_eq!(h, 30.0);
    }

    #[test]
    fn bilinear_falls_back_next_to_nodata() {
        let h = dem(Some(-9999.0))
            .sample(1016.0, 1986.0, Interpolation::Bilinear)
            .unwrap();
        assert_relative_eq!(h, 50.0);
    }

    #[test]
    fn bounds_and_range() {
        assert_eq!(dem(None).bounds(), (1000.0, 1980.0, 1030.0, 2000.0));
        assert_eq!(dem(Some(-9999.0)).height_range(), Some((10.0, 50.0)));
    }

    #[test]
    fn mismatched_size_is_rejected() {
        assert!(Dem::new(2, 2, vec![0.0; 3], GeoTransform::identity(), None).is_err());
    }
}
