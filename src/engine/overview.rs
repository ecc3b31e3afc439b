//! Reduced resolution copies of an ortho image, stored beside it in a
//! multi-page `.ovr` TIFF.

use super::{
    BuildOverviews, EngineError,
    ortho::{OrthoImage, Raster, is_nodata, write_page},
};
use crate::{
    config::OverviewResampling,
    geometry::{GeoTags, GeoTransform},
};
use std::{
    ffi::OsString,
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
};
use tiff::encoder::TiffEncoder;
use tracing::debug;

/// Location of the overviews of the image at `ortho`.
pub fn overview_path(ortho: &Path) -> PathBuf {
    let mut path = OsString::from(ortho.as_os_str());
    path.push(".ovr");
    PathBuf::from(path)
}

/// Decimation factors 2, 4, 8, ... for which the larger dimension stays at or
/// above `min_size`, stopping once a level is a single pixel.
pub(crate) fn factors(width: u32, height: u32, min_size: u32) -> Vec<u32> {
    let largest = width.max(height);
    (1..u32::BITS)
        .map(|level| 1u32 << level)
        .take_while(|&factor| largest.div_ceil(factor / 2) > 1)
        .take_while(|&factor| largest.div_ceil(factor) >= min_size)
        .collect()
}

/// Reduce `raster` by `factor` in both directions.
pub(crate) fn reduce(
    raster: &Raster,
    factor: u32,
    nodata: u8,
    resampling: OverviewResampling,
) -> (u32, u32, Vec<u8>) {
    let width = raster.width.div_ceil(factor);
    let height = raster.height.div_ceil(factor);
    let bands = raster.bands;
    let mut data = Vec::with_capacity(width as usize * height as usize * bands);

    for row in 0..height {
        for col in 0..width {
            let cols = col * factor..((col + 1) * factor).min(raster.width);
            let rows = row * factor..((row + 1) * factor).min(raster.height);

            match resampling {
                OverviewResampling::Nearest => {
                    let centre_col = (cols.start + factor / 2).min(cols.end - 1);
                    let centre_row = (rows.start + factor / 2).min(rows.end - 1);
                    data.extend_from_slice(raster.pixel(centre_col, centre_row));
                }
                OverviewResampling::Average => {
                    let mut sums = vec![0u64; bands];
                    let mut count = 0u64;
                    for r in rows {
                        for c in cols.clone() {
                            let pixel = raster.pixel(c, r);
                            if is_nodata(pixel, nodata) {
                                continue;
                            }
                            for (sum, &value) in sums.iter_mut().zip(pixel) {
                                *sum += value as u64;
                            }
                            count += 1;
                        }
                    }

                    if count == 0 {
                        data.extend(std::iter::repeat_n(nodata, bands));
                    } else {
                        data.extend(sums.iter().map(|&sum| ((sum + count / 2) / count) as u8));
                    }
                }
            }
        }
    }

    (width, height, data)
}

fn scaled(transform: GeoTransform, factor: u32) -> GeoTransform {
    let f = factor as f64;
    GeoTransform::new(
        transform.a * f,
        transform.b * f,
        transform.c,
        transform.d * f,
        transform.e * f,
        transform.f,
    )
}

pub(crate) fn build(image: &OrthoImage) -> Result<(), EngineError> {
    let (width, height) = image.dimensions();
    let min_size = image.min_overview_size();
    let factors = factors(width, height, min_size);
    if factors.is_empty() {
        debug!(
            "{}x{} is below {min_size} pixels, no overviews needed",
            width, height
        );
        return Ok(());
    }

    let path = overview_path(image.path());
    let write_error = |reason: String| EngineError::Write {
        path: path.clone(),
        reason,
    };
    let file = File::create(&path).map_err(|err| write_error(err.to_string()))?;
    let mut encoder =
        TiffEncoder::new(BufWriter::new(file)).map_err(|err| write_error(err.to_string()))?;

    let raster = image.raster();
    for &factor in &factors {
        let (width, height, data) = reduce(&raster, factor, image.nodata(), image.resampling());
        let level = Raster {
            width,
            height,
            bands: raster.bands,
            data: &data,
        };
        let tags = GeoTags {
            transform: Some(scaled(image.transform(), factor)),
            nodata: Some(image.nodata().to_string()),
            ..Default::default()
        };
        write_page(&mut encoder, &level, image.compress(), min_size, &tags, true)
            .map_err(|err| write_error(err.to_string()))?;
    }
    debug!(?factors, "wrote {}", path.display());

    Ok(())
}
