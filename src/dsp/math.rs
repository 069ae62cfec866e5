/*
Small numeric helpers shared by the analysis stages.

The principal-argument and normalisation helpers follow the QM DSP Library maths
routines:
    - https://github.com/c4dm/qm-dsp/tree/master/maths
*/

use std::f64::consts::PI;

fn modulus(x: f64, y: f64) -> f64 {
    let a = f64::floor(x / y);
    x - (y * a)
}

/// Maps an angle onto (-pi, pi].
pub fn princarg(ang: f64) -> f64 {
    modulus(ang + PI, -2.0 * PI) + PI
}

/// Subtracts the mean over `[i - m, i + m]` from every value and clamps at zero.
///
/// The divisor is always `2m + 1`, so values near the edges are compared against
/// a zero-padded average. `m == 0` leaves the data untouched.
pub fn subtract_local_average(data: &mut [f64], m: usize) {
    if data.is_empty() || m == 0 {
        return;
    }

    let len = data.len();
    let norm = (2 * m + 1) as f64;
    let averages: Vec<f64> = (0..len)
        .map(|i| {
            let first = i.saturating_sub(m);
            let last = (i + m + 1).min(len);
            data[first..last].iter().sum::<f64>() / norm
        })
        .collect();

    data.iter_mut()
        .zip(averages.iter())
        .for_each(|(d, avg)| *d = (*d - avg).max(0.0));
}

/// Index and value of the maximum. Ties resolve to the earliest index.
pub fn argmax(data: &[f64]) -> Option<(usize, f64)> {
    data.iter()
        .copied()
        .enumerate()
        .fold(None, |best, (i, x)| match best {
            Some((_, b)) if x <= b => best,
            _ => Some((i, x)),
        })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NormalizeType {
    None,
    UnitSum,
    UnitMax,
    UnitL2,
}

pub fn normalize(data: &mut [f64], normalize_type: NormalizeType) {
    match normalize_type {
        NormalizeType::None => {}

        NormalizeType::UnitSum => {
            let sum = data.iter().sum::<f64>();
            if sum != 0.0 {
                data.iter_mut().for_each(|x| *x /= sum);
            }
        }

        NormalizeType::UnitMax => {
            let max = data
                .iter()
                .map(|x| x.abs())
                .max_by(|a, b| a.total_cmp(b))
                .unwrap_or(0.0);
            if max != 0.0 {
                data.iter_mut().for_each(|x| *x /= max);
            }
        }

        NormalizeType::UnitL2 => {
            let norm = data.iter().map(|x| x * x).sum::<f64>().sqrt();
            if norm != 0.0 {
                data.iter_mut().for_each(|x| *x /= norm);
            }
        }
    };
}

/// Piecewise-linear interpolation of `(xs, ys)` at `x`, extrapolating linearly
/// from the outermost segment. `xs` must be strictly monotonic, in either
/// direction.
pub fn interp_linear(xs: &[f64], ys: &[f64], x: f64) -> f64 {
    debug_assert_eq!(xs.len(), ys.len());
    match xs.len() {
        0 => return 0.0,
        1 => return ys[0],
        _ => {}
    }

    let ascending = xs[xs.len() - 1] > xs[0];
    let before = |a: f64, b: f64| if ascending { a < b } else { a > b };

    // Segment whose right end is the first knot not before x.
    let right = xs
        .iter()
        .position(|&knot| !before(knot, x))
        .unwrap_or(xs.len() - 1)
        .clamp(1, xs.len() - 1);
    let left = right - 1;

    let (x0, x1) = (xs[left], xs[right]);
    let (y0, y1) = (ys[left], ys[right]);
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}

/// Resamples a curve sampled at `from_rate` onto a grid at `to_rate` by linear
/// interpolation. The output spans the same duration.
pub fn resample_linear(data: &[f64], from_rate: f64, to_rate: f64) -> Vec<f64> {
    if data.is_empty() {
        return Vec::new();
    }

    let out_len = (data.len() as f64 * to_rate / from_rate).round() as usize;
    let step = from_rate / to_rate;
    let last = data.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos.floor() as usize;
            if idx >= last {
                return data[last];
            }
            let frac = pos - idx as f64;
            data[idx] * (1.0 - frac) + data[idx + 1] * frac
        })
        .collect()
}

/// Median of a non-empty slice. Even-length inputs average the middle pair.
pub fn median(data: &[f64]) -> Option<f64> {
    if data.is_empty() {
        return None;
    }
    let mut sorted = data.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    })
}
