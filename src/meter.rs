/*
Bar and beat numbering of a beat sequence.

The grid is anchored on a hand-placed downbeat marker: the first beat at or
after the marker becomes beat 1 of bar 1. Beats before it are dropped.
*/

use std::path::Path;

use crate::dsp::filter::ZeroPhaseBand;
use crate::error::{Error, Result};
use crate::npy::Array;

/// Beats-per-bar values considered when inferring the meter from audio.
pub const BEATS_PER_BAR_CANDIDATES: [u32; 3] = [2, 3, 4];

/// Half-width of the audio window analysed around each beat, in seconds.
const BEAT_WINDOW: f64 = 0.15;
const LOW_BAND: (f64, f64) = (30.0, 250.0);
const HIGH_CUT: f64 = 1600.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GridPoint {
    pub time: f64,
    pub bar: u32,
    pub beat: u32,
}

/// Index of the first beat at or after `anchor`.
pub fn anchor_index(beats: &[f64], anchor: f64) -> Option<usize> {
    beats.iter().position(|&t| t >= anchor)
}

pub fn label_grid(beats: &[f64], anchor: f64, beats_per_bar: u32) -> Vec<GridPoint> {
    let first = match anchor_index(beats, anchor) {
        Some(first) => first,
        None => return Vec::new(),
    };
    let beats_per_bar = beats_per_bar.max(1);

    beats[first..]
        .iter()
        .enumerate()
        .map(|(k, &time)| {
            let k = k as u32;
            GridPoint {
                time,
                bar: 1 + k / beats_per_bar,
                beat: 1 + k % beats_per_bar,
            }
        })
        .collect()
}

/// Low-band (kick and bass) and high-band (hi-hat) RMS in a window around
/// each beat.
pub fn beat_band_energies(beats: &[f64], samples: &[f64], sample_rate: u32) -> (Vec<f64>, Vec<f64>) {
    let sr = sample_rate as f64;
    let low_band = ZeroPhaseBand::new(sr, Some(LOW_BAND.0), Some(LOW_BAND.1));
    let high_band = ZeroPhaseBand::new(sr, Some(HIGH_CUT), None);

    beats
        .iter()
        .map(|&t| {
            let start = (((t - BEAT_WINDOW).max(0.0) * sr).ceil() as usize).min(samples.len());
            let end = (((t + BEAT_WINDOW) * sr).ceil() as usize).min(samples.len());
            let segment = &samples[start..end.max(start)];
            (low_band.rms(segment), high_band.rms(segment))
        })
        .unzip()
}

fn std_dev(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mean = data.iter().sum::<f64>() / data.len() as f64;
    (data.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / data.len() as f64).sqrt()
}

fn mean(data: &[f64]) -> f64 {
    data.iter().sum::<f64>() / data.len() as f64
}

/// Picks the beats-per-bar under which downbeats carry the most low-band
/// and the least high-band energy. `beats` must start at the anchor.
///
/// Ties and degenerate inputs resolve to the smallest candidate.
pub fn infer_beats_per_bar(beats: &[f64], samples: &[f64], sample_rate: u32) -> u32 {
    let (low, high) = beat_band_energies(beats, samples, sample_rate);
    let low_scale = std_dev(&low) + 1e-10;
    let high_scale = std_dev(&high) + 1e-10;
    let low: Vec<f64> = low.iter().map(|x| x / low_scale).collect();
    let high: Vec<f64> = high.iter().map(|x| x / high_scale).collect();

    let mut best = (BEATS_PER_BAR_CANDIDATES[0], f64::NEG_INFINITY);
    for &candidate in &BEATS_PER_BAR_CANDIDATES {
        let is_downbeat = |i: usize| i % candidate as usize == 0;
        let split = |values: &[f64]| -> (Vec<f64>, Vec<f64>) {
            let (down, other): (Vec<_>, Vec<_>) =
                values.iter().enumerate().partition(|(i, _)| is_downbeat(*i));
            (
                down.into_iter().map(|(_, v)| *v).collect(),
                other.into_iter().map(|(_, v)| *v).collect(),
            )
        };

        let (down_low, other_low) = split(&low);
        let (down_high, other_high) = split(&high);
        if down_low.is_empty() || other_low.is_empty() {
            continue;
        }

        let score = (mean(&down_low) - mean(&other_low)) + (mean(&other_high) - mean(&down_high));
        log::debug!("{} beats per bar scores {:.4}", candidate, score);
        if score > best.1 {
            best = (candidate, score);
        }
    }
    best.0
}

pub fn grid_to_array(grid: &[GridPoint]) -> Array {
    let rows: Vec<Vec<f64>> = grid
        .iter()
        .map(|p| vec![p.time, p.bar as f64, p.beat as f64])
        .collect();
    Array::from_rows(&rows, 3)
}

/// Reads a `[time, bar, beat]` grid back from an array.
pub fn grid_from_array(array: &Array, path: &Path) -> Result<Vec<GridPoint>> {
    match array.shape() {
        [_, 3] => {}
        [0] => return Ok(Vec::new()),
        shape => {
            return Err(Error::format(
                path,
                format!("expected an n x 3 meter grid, got shape {:?}", shape),
            ))
        }
    }

    array
        .rows()
        .map(|row| {
            let (bar, beat) = (row[1], row[2]);
            if bar < 1.0 || beat < 1.0 || bar.fract() != 0.0 || beat.fract() != 0.0 {
                return Err(Error::format(path, format!("invalid bar/beat {} {}", bar, beat)));
            }
            Ok(GridPoint {
                time: row[0],
                bar: bar as u32,
                beat: beat as u32,
            })
        })
        .collect()
}
