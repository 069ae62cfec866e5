/*
Time-tempo representations of a novelty curve.

All three estimators share the framing of the novelty curve: it is padded
by `N / 2` zeros on both sides and cut into windows of `N` frames every `H`
frames, giving `floor((L + 2 * (N / 2) - N) / H) + 1` columns.
*/

use std::f64::consts::PI;

use rustfft::num_complex::Complex64;

use crate::config::{TempogramConfig, FEATURE_RATE};
use crate::dsp::math;
use crate::error::Result;

/// Resolution of the cyclic tempo axis.
pub const CYCLIC_BINS_PER_OCTAVE: usize = 40;

named_enum! {
    pub enum TempogramMethod {
        Fourier => "fourier",
        Autocorr => "autocorr",
        /// Octave-folded Fourier tempogram.
        Cyclic => "cyclic",
    }
}

/// A K x M matrix of tempo rows over time.
#[derive(Clone, Debug, PartialEq)]
pub struct Tempogram {
    rows: Vec<Vec<f64>>,
    tempo_axis: Vec<f64>,
}

impl Tempogram {
    pub fn new(rows: Vec<Vec<f64>>, tempo_axis: Vec<f64>) -> Self {
        debug_assert_eq!(rows.len(), tempo_axis.len());
        Tempogram { rows, tempo_axis }
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    /// Tempo in BPM of every row.
    pub fn tempo_axis(&self) -> &[f64] {
        &self.tempo_axis
    }

    pub fn num_frames(&self) -> usize {
        self.rows.first().map_or(0, Vec::len)
    }
}

/// Integer BPM axis `theta_min..=theta_max`.
pub fn linear_axis(theta_min: u32, theta_max: u32) -> Vec<f64> {
    (theta_min..=theta_max).map(f64::from).collect()
}

/// Number of whole octaves folded into a cyclic tempogram.
pub fn cyclic_octaves(theta_min: u32, theta_max: u32) -> usize {
    (theta_max as f64 / theta_min as f64).log2().floor().max(0.0) as usize
}

/// One octave starting at `theta_min`, [`CYCLIC_BINS_PER_OCTAVE`] log-spaced bins.
pub fn cyclic_axis(theta_min: u32) -> Vec<f64> {
    (0..CYCLIC_BINS_PER_OCTAVE)
        .map(|k| theta_min as f64 * 2f64.powf(k as f64 / CYCLIC_BINS_PER_OCTAVE as f64))
        .collect()
}

/// The tempo axis an artifact with these parameters carries.
pub fn tempo_axis(config: &TempogramConfig) -> Vec<f64> {
    match config.method {
        TempogramMethod::Fourier | TempogramMethod::Autocorr => {
            linear_axis(config.theta_min, config.theta_max)
        }
        TempogramMethod::Cyclic => cyclic_axis(config.theta_min),
    }
}

pub fn compute_tempogram(novelty: &[f64], config: &TempogramConfig) -> Result<Tempogram> {
    config.validate()?;
    let theta = linear_axis(config.theta_min, config.theta_max);

    let tempogram = match config.method {
        TempogramMethod::Fourier => {
            Tempogram::new(fourier(novelty, config.window, config.hop, &theta), theta)
        }
        TempogramMethod::Autocorr => Tempogram::new(
            autocorr(novelty, config.window, config.hop, &theta),
            theta,
        ),
        TempogramMethod::Cyclic => {
            let fourier = Tempogram::new(fourier(novelty, config.window, config.hop, &theta), theta);
            fold_cyclic(&fourier, config.theta_min, config.theta_max)
        }
    };
    log::debug!(
        "{} tempogram: {} x {}",
        config.method,
        tempogram.rows.len(),
        tempogram.num_frames()
    );
    Ok(tempogram)
}

/// Pads `x` by `n / 2` zeros per side and returns the padded signal and the
/// number of windows of length `n` at hop `h`.
fn frame(x: &[f64], n: usize, h: usize) -> (Vec<f64>, usize) {
    let pad = n / 2;
    let mut padded = vec![0.0; x.len() + 2 * pad];
    padded[pad..pad + x.len()].copy_from_slice(x);
    let count = padded.len().saturating_sub(n) / h + 1;
    // Windows reaching past the padded signal read zeros.
    padded.resize(((count - 1) * h + n).max(padded.len()), 0.0);
    (padded, count)
}

/// Magnitude of the Hann-windowed projection onto a complex exponential at
/// every tempo of `theta`.
pub fn fourier(novelty: &[f64], n: usize, h: usize, theta: &[f64]) -> Vec<Vec<f64>> {
    let (padded, count) = frame(novelty, n, h);
    let window: Vec<f64> = apodize::hanning_iter(n).collect();

    theta
        .iter()
        .map(|&bpm| {
            let omega = bpm / 60.0 / FEATURE_RATE;
            let kernel: Vec<Complex64> = window
                .iter()
                .enumerate()
                .map(|(t, w)| Complex64::from_polar(*w, -2.0 * PI * omega * t as f64))
                .collect();

            (0..count)
                .map(|m| {
                    let frame = &padded[m * h..m * h + n];
                    frame
                        .iter()
                        .zip(kernel.iter())
                        .map(|(x, k)| *k * *x)
                        .sum::<Complex64>()
                        .norm()
                })
                .collect()
        })
        .collect()
}

/// Rectangular-window local autocorrelation, mapped from lag onto `theta`.
pub fn autocorr(novelty: &[f64], n: usize, h: usize, theta: &[f64]) -> Vec<Vec<f64>> {
    let (padded, count) = frame(novelty, n, h);
    let (theta_min, theta_max) = match (theta.first(), theta.last()) {
        (Some(&lo), Some(&hi)) => (lo, hi),
        _ => return Vec::new(),
    };
    let lag_min = ((FEATURE_RATE * 60.0 / theta_max).ceil() as usize).max(1);
    let lag_max = ((FEATURE_RATE * 60.0 / theta_min).ceil() as usize).min(n - 1);
    let lag_bpm: Vec<f64> = (lag_min..=lag_max)
        .map(|lag| FEATURE_RATE * 60.0 / lag as f64)
        .collect();

    let mut rows = vec![vec![0.0; count]; theta.len()];
    let mut lags = vec![0.0; lag_bpm.len()];
    for m in 0..count {
        let frame = &padded[m * h..m * h + n];
        for (lag, r) in (lag_min..=lag_max).zip(lags.iter_mut()) {
            *r = frame[..n - lag]
                .iter()
                .zip(frame[lag..].iter())
                .map(|(a, b)| a * b)
                .sum();
        }
        for (row, &bpm) in rows.iter_mut().zip(theta.iter()) {
            row[m] = math::interp_linear(&lag_bpm, &lags, bpm);
        }
    }
    rows
}

/// Folds a Fourier tempogram onto one octave starting at `theta_min`.
///
/// The linear tempo rows are interpolated onto a log axis spanning
/// `cyclic_octaves` octaves, and bins one octave apart are averaged.
pub fn fold_cyclic(fourier: &Tempogram, theta_min: u32, theta_max: u32) -> Tempogram {
    let octaves = cyclic_octaves(theta_min, theta_max).max(1);
    let bins = CYCLIC_BINS_PER_OCTAVE;
    let frames = fourier.num_frames();
    let log_axis: Vec<f64> = (0..octaves * bins)
        .map(|k| theta_min as f64 * 2f64.powf(k as f64 / bins as f64))
        .collect();

    let mut rows = vec![vec![0.0; frames]; bins];
    let mut column = vec![0.0; fourier.rows.len()];
    for m in 0..frames {
        column
            .iter_mut()
            .zip(fourier.rows.iter())
            .for_each(|(c, row)| *c = row[m]);

        for (b, row) in rows.iter_mut().enumerate() {
            let sum: f64 = log_axis[b..]
                .iter()
                .step_by(bins)
                .map(|&bpm| math::interp_linear(&fourier.tempo_axis, &column, bpm))
                .sum();
            row[m] = sum / octaves as f64;
        }
    }

    Tempogram::new(rows, cyclic_axis(theta_min))
}
