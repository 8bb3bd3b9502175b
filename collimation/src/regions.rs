//! Bias subtraction, gain correction, and analysis-window extraction.

use hartmann_math::median;
use ndarray::{s, Array2, ArrayView2, Zip};

use crate::config::{CameraCalibration, CameraRegions, ConfigError, Rect};
use crate::frame::Frame;

fn check_fits(
    camera: &str,
    region: String,
    rect: Rect,
    rows: usize,
    cols: usize,
) -> Result<(), ConfigError> {
    if rect.fits_within(rows, cols) {
        Ok(())
    } else {
        Err(ConfigError::RegionOutOfBounds {
            camera: camera.to_string(),
            region,
            rect,
            rows,
            cols,
        })
    }
}

/// Bias level of each quadrant: the median of its overscan rectangle.
pub fn bias_levels(
    camera: &str,
    data: ArrayView2<u16>,
    regions: &CameraRegions,
) -> Result<[f64; 4], ConfigError> {
    let (rows, cols) = data.dim();
    let mut levels = [0.0; 4];

    for (q, rect) in regions.bias.iter().enumerate() {
        check_fits(camera, format!("bias quadrant {}", q + 1), *rect, rows, cols)?;

        let samples: Vec<f64> = data
            .slice(s![rect.y0..rect.y1, rect.x0..rect.x1])
            .iter()
            .map(|&v| f64::from(v))
            .collect();

        levels[q] = median(samples).ok_or_else(|| {
            ConfigError::Invalid(format!("{camera}: bias quadrant {} is empty", q + 1))
        })?;
    }

    Ok(levels)
}

/// Bias-subtracted, gain-corrected pixels inside `analysis`.
///
/// `analysis` is in assembled-image coordinates. A window that spans quadrant
/// boundaries is corrected piecewise with each quadrant's own gain and bias.
pub fn extract_region(
    camera: &str,
    frame: &Frame,
    regions: &CameraRegions,
    calibration: &CameraCalibration,
    analysis: Rect,
) -> Result<Array2<f64>, ConfigError> {
    let data = frame.data();
    let (rows, cols) = data.dim();

    for (q, rect) in regions.data.iter().enumerate() {
        check_fits(camera, format!("data quadrant {}", q + 1), *rect, rows, cols)?;
    }

    let (assembled_rows, assembled_cols) = regions.assembled_dim();
    if analysis.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "{camera}: analysis region {analysis} is empty"
        )));
    }
    check_fits(
        camera,
        "analysis".to_string(),
        analysis,
        assembled_rows,
        assembled_cols,
    )?;

    let bias = bias_levels(camera, data, regions)?;
    let mut out = Array2::zeros((analysis.height(), analysis.width()));

    for (q, placed) in regions.assembled_quadrants().iter().enumerate() {
        let Some(overlap) = analysis.intersect(placed) else {
            continue;
        };

        let raw = regions.data[q];
        let src = overlap.relative_to(placed.y0, placed.x0);
        let dst = overlap.relative_to(analysis.y0, analysis.x0);
        let gain = calibration.gain[q];
        let level = bias[q];

        Zip::from(out.slice_mut(s![dst.y0..dst.y1, dst.x0..dst.x1]))
            .and(data.slice(s![
                raw.y0 + src.y0..raw.y0 + src.y1,
                raw.x0 + src.x0..raw.x0 + src.x1
            ]))
            .for_each(|o, &r| *o = gain * (f64::from(r) - level));
    }

    Ok(out)
}

/// Extract the configured analysis region, or `override_region` when given.
pub fn extract_analysis_region(
    camera: &str,
    frame: &Frame,
    regions: &CameraRegions,
    calibration: &CameraCalibration,
    override_region: Option<Rect>,
) -> Result<Array2<f64>, ConfigError> {
    let analysis = override_region.unwrap_or(regions.analysis);
    extract_region(camera, frame, regions, calibration, analysis)
}
