//! Cubic-convolution resampling along the row axis.
//!
//! Uses the Keys kernel with `a = -0.5`, which reproduces the input exactly at
//! integer shifts and is continuous in the shift parameter. That continuity is
//! what makes the correlation curve smooth enough for a parabolic peak fit.

use ndarray::{Array2, ArrayView2, Axis};

const KEYS_A: f64 = -0.5;

fn keys_kernel(x: f64) -> f64 {
    let x = x.abs();
    if x <= 1.0 {
        (KEYS_A + 2.0) * x.powi(3) - (KEYS_A + 3.0) * x.powi(2) + 1.0
    } else if x < 2.0 {
        KEYS_A * (x.powi(3) - 5.0 * x.powi(2) + 8.0 * x - 4.0)
    } else {
        0.0
    }
}

/// Interpolation weights for samples `floor(p) - 1 ..= floor(p) + 2`, where
/// `t = p - floor(p)`.
pub fn cubic_weights(t: f64) -> [f64; 4] {
    [
        keys_kernel(1.0 + t),
        keys_kernel(t),
        keys_kernel(1.0 - t),
        keys_kernel(2.0 - t),
    ]
}

/// Translate an image by `shift` rows.
///
/// `out[i, j] = data[i - shift, j]`, interpolated between rows. Samples that
/// fall outside the image contribute zero, so the first and last
/// `ceil(|shift|) + 1` rows are attenuated and should be masked by callers.
pub fn shift_rows(data: ArrayView2<f64>, shift: f64) -> Array2<f64> {
    let rows = data.nrows() as i64;
    let mut out = Array2::zeros(data.raw_dim());

    for (i, mut out_row) in out.axis_iter_mut(Axis(0)).enumerate() {
        let pos = i as f64 - shift;
        let base = pos.floor();
        let weights = cubic_weights(pos - base);

        for (k, &w) in weights.iter().enumerate() {
            if w == 0.0 {
                continue;
            }
            let src = base as i64 - 1 + k as i64;
            if (0..rows).contains(&src) {
                out_row.scaled_add(w, &data.row(src as usize));
            }
        }
    }

    out
}
