/*
Onset-strength (novelty) curves.

The phase-deviation and complex-domain measures follow the detection functions
of the QM DSP Library:
    - https://github.com/c4dm/qm-dsp/blob/master/dsp/onsets/DetectionFunction.cpp
Every curve is post-processed the same way: local-average subtraction,
rectification, peak normalisation and resampling onto the 100 Hz feature grid.
*/

use rustfft::num_complex::Complex64;

use crate::config::{NoveltyConfig, ANALYSIS_SAMPLE_RATE, FEATURE_RATE};
use crate::dsp::math::{self, NormalizeType};
use crate::dsp::rateconversion;
use crate::dsp::stft::Spectrogram;
use crate::error::Result;

named_enum! {
    /// Onset detection method.
    pub enum NoveltyMethod {
        /// Log-compressed local energy, differentiated.
        Energy => "energy",
        /// Log-compressed spectral flux.
        Spectrum => "spectrum",
        /// Second-order phase deviation.
        Phase => "phase",
        /// Distance to a phase-extrapolated steady-state spectrum.
        Complex => "complex",
    }
}

/// Computes a novelty curve at [`FEATURE_RATE`] from mono `samples`.
///
/// Audio at any other rate than [`ANALYSIS_SAMPLE_RATE`] is resampled first.
pub fn compute_novelty(samples: &[f64], sample_rate: u32, config: &NoveltyConfig) -> Result<Vec<f64>> {
    config.validate()?;

    let resampled;
    let samples = if sample_rate == ANALYSIS_SAMPLE_RATE {
        samples
    } else {
        resampled = rateconversion::resample(samples, sample_rate, ANALYSIS_SAMPLE_RATE)?;
        &resampled
    };

    let spec = Spectrogram::compute(samples, ANALYSIS_SAMPLE_RATE, config.n_fft, config.hop);
    let mut curves = compute_novelty_curves(&spec, &[config.method], config.gamma, config.local_average);
    Ok(curves.pop().unwrap_or_default())
}

/// Computes one curve per method from a single shared transform.
pub fn compute_novelty_curves(
    spec: &Spectrogram,
    methods: &[NoveltyMethod],
    gamma: f64,
    local_average: usize,
) -> Vec<Vec<f64>> {
    // Magnitudes are shared by three of the four methods.
    let magnitudes: Vec<Vec<f64>> = spec
        .frames()
        .iter()
        .map(|frame| frame.iter().map(|x| x.norm()).collect())
        .collect();

    methods
        .iter()
        .map(|&method| {
            let mut curve = match method {
                NoveltyMethod::Energy => energy(spec, gamma),
                NoveltyMethod::Spectrum => spectral_flux(&magnitudes, gamma),
                NoveltyMethod::Phase => phase_deviation(spec),
                NoveltyMethod::Complex => complex_domain(spec, &magnitudes, gamma),
            };
            log::debug!("{} novelty: {} frames", method, curve.len());
            post_process(&mut curve, local_average);
            math::resample_linear(&curve, spec.frame_rate(), FEATURE_RATE)
        })
        .collect()
}

fn compress(x: f64, gamma: f64) -> f64 {
    (1.0 + gamma * x).ln()
}

/// Half-wave rectified forward difference; the final frame has no successor
/// and scores zero.
fn rectified_diff(data: &[f64]) -> Vec<f64> {
    let mut diff: Vec<f64> = data.windows(2).map(|w| (w[1] - w[0]).max(0.0)).collect();
    diff.resize(data.len(), 0.0);
    diff
}

fn energy(spec: &Spectrogram, gamma: f64) -> Vec<f64> {
    let n = spec.n_fft() as f64;
    let last = spec.num_bins() - 1;

    // Parseval over the half spectrum: interior bins stand for two.
    let compressed: Vec<f64> = spec
        .frames()
        .iter()
        .map(|frame| {
            let e: f64 = frame
                .iter()
                .enumerate()
                .map(|(k, x)| {
                    let weight = if k == 0 || k == last { 1.0 } else { 2.0 };
                    weight * x.norm_sqr()
                })
                .sum();
            compress(e / n, gamma)
        })
        .collect();

    rectified_diff(&compressed)
}

fn spectral_flux(magnitudes: &[Vec<f64>], gamma: f64) -> Vec<f64> {
    let mut flux: Vec<f64> = magnitudes
        .windows(2)
        .map(|w| {
            w[0].iter()
                .zip(w[1].iter())
                .map(|(prev, cur)| (compress(*cur, gamma) - compress(*prev, gamma)).max(0.0))
                .sum()
        })
        .collect();
    flux.resize(magnitudes.len(), 0.0);
    flux
}

fn phase_deviation(spec: &Spectrogram) -> Vec<f64> {
    let phases: Vec<Vec<f64>> = spec
        .frames()
        .iter()
        .map(|frame| frame.iter().map(|x| x.arg()).collect())
        .collect();

    let mut dev: Vec<f64> = phases
        .windows(3)
        .map(|w| {
            w[0].iter()
                .zip(w[1].iter().zip(w[2].iter()))
                .map(|(old, (history, theta))| math::princarg(theta - 2.0 * history + old).abs())
                .sum()
        })
        .collect();
    dev.resize(phases.len(), 0.0);
    dev
}

fn complex_domain(spec: &Spectrogram, magnitudes: &[Vec<f64>], gamma: f64) -> Vec<f64> {
    let frames = spec.frames();
    let mut out = vec![0.0; frames.len()];

    for t in 2..frames.len() {
        out[t] = frames[t]
            .iter()
            .zip(frames[t - 1].iter().zip(frames[t - 2].iter()))
            .zip(magnitudes[t].iter().zip(magnitudes[t - 1].iter()))
            .filter(|(_, (mag, prev_mag))| mag >= prev_mag)
            .map(|((cur, (prev, old)), (mag, prev_mag))| {
                let target = 2.0 * prev.arg() - old.arg();
                let predicted = Complex64::from_polar(compress(*prev_mag, gamma), target);
                let observed = Complex64::from_polar(compress(*mag, gamma), cur.arg());
                (observed - predicted).norm()
            })
            .sum();
    }
    out
}

fn post_process(curve: &mut [f64], local_average: usize) {
    math::subtract_local_average(curve, local_average);
    curve.iter_mut().for_each(|x| *x = x.max(0.0));
    math::normalize(curve, NormalizeType::UnitMax);
}
