/*
Pitch-class profiles aggregated over metric subdivisions.

Frame-level chroma is computed at the analysis rate with either the
constant-Q filterbank or a plain STFT, optionally reweighted by frame
accents, and then collapsed into one column per beat subdivision of the
meter grid.
*/

use crate::config::{ChromagramConfig, ANALYSIS_SAMPLE_RATE};
use crate::dsp::constantq::{CqtChroma, PITCH_CLASSES};
use crate::dsp::math::{self, NormalizeType};
use crate::dsp::rateconversion;
use crate::dsp::stft::Spectrogram;
use crate::error::Result;
use crate::npy::Array;

/// MIDI pitch of the lowest constant-Q bin (C2).
const CQT_LOWEST_PITCH: f64 = 36.0;
const CQT_OCTAVES: u32 = 6;
const CQT_BINS_PER_OCTAVE: u32 = 36;

/// Window of the STFT backend and of the accent measures.
const STFT_FRAME: usize = 2048;
const CONCERT_A: f64 = 440.0;
/// STFT bins below C1 carry no usable pitch.
const STFT_LOWEST_FREQ: f64 = 32.7;

pub type Chroma = [f64; PITCH_CLASSES];

named_enum! {
    /// Frame-level chroma backend.
    pub enum ChromaType {
        Cqt => "cqt",
        Stft => "stft",
    }
}

named_enum! {
    /// How the frames inside one subdivision are combined.
    pub enum Aggregate {
        Mean => "mean",
        Median => "median",
        /// Mean weighted by the weight source raised to the weight power.
        Weighted => "weighted",
    }
}

named_enum! {
    /// Treatment of frame loudness before aggregation.
    pub enum AccentMode {
        /// Raw frame chroma.
        Preserve => "preserve",
        /// Every frame scaled to unit L2 norm.
        Normalize => "normalize",
        /// Unit-norm frames scaled by the weight source raised to the weight power.
        Weighted => "weighted",
    }
}

named_enum! {
    pub enum WeightSource {
        Rms => "rms",
        Onset => "onset",
    }
}

pub fn frequency_for_pitch(midi_pitch: f64) -> f64 {
    CONCERT_A * 2f64.powf((midi_pitch - 69.0) / 12.0)
}

/// Number of frames at hop `hop` for a signal of `len` samples.
fn frame_count(len: usize, hop: usize) -> usize {
    1 + len / hop
}

/// Copies the `size` samples centred on `centre` into `out`, zero-padding
/// outside the signal.
fn centred_frame(samples: &[f64], centre: usize, out: &mut [f64]) {
    let half = out.len() / 2;
    for (i, x) in out.iter_mut().enumerate() {
        *x = (centre + i)
            .checked_sub(half)
            .and_then(|idx| samples.get(idx))
            .copied()
            .unwrap_or(0.0);
    }
}

/// Chroma of every frame centred on a multiple of `hop`.
pub fn frame_chroma(samples: &[f64], sample_rate: u32, chroma_type: ChromaType, hop: usize) -> Vec<Chroma> {
    match chroma_type {
        ChromaType::Cqt => {
            let mut cqt = CqtChroma::new(
                sample_rate as f64,
                frequency_for_pitch(CQT_LOWEST_PITCH),
                CQT_OCTAVES,
                CQT_BINS_PER_OCTAVE,
            );
            let mut frame = vec![0.0; cqt.frame_size()];
            (0..frame_count(samples.len(), hop))
                .map(|t| {
                    centred_frame(samples, t * hop, &mut frame);
                    cqt.process(&frame)
                })
                .collect()
        }
        ChromaType::Stft => {
            let spec = Spectrogram::compute(samples, sample_rate, STFT_FRAME, hop);
            let classes: Vec<Option<usize>> = (0..spec.num_bins())
                .map(|k| {
                    let freq = spec.bin_frequency(k);
                    (freq >= STFT_LOWEST_FREQ).then(|| {
                        let pitch = 69.0 + 12.0 * (freq / CONCERT_A).log2();
                        (pitch.round() as i64).rem_euclid(PITCH_CLASSES as i64) as usize
                    })
                })
                .collect();

            spec.frames()
                .iter()
                .map(|bins| {
                    let mut chroma = [0.0; PITCH_CLASSES];
                    for (x, class) in bins.iter().zip(classes.iter()) {
                        if let Some(c) = class {
                            chroma[*c] += x.norm();
                        }
                    }
                    chroma
                })
                .collect()
        }
    }
}

/// Accent strength of every frame, scaled so the loudest frame is 1.
pub fn frame_weights(samples: &[f64], sample_rate: u32, source: WeightSource, hop: usize) -> Vec<f64> {
    let mut weights: Vec<f64> = match source {
        WeightSource::Rms => {
            let mut frame = vec![0.0; STFT_FRAME];
            (0..frame_count(samples.len(), hop))
                .map(|t| {
                    centred_frame(samples, t * hop, &mut frame);
                    (frame.iter().map(|x| x * x).sum::<f64>() / STFT_FRAME as f64).sqrt()
                })
                .collect()
        }
        WeightSource::Onset => {
            let spec = Spectrogram::compute(samples, sample_rate, STFT_FRAME, hop);
            let mut flux = vec![0.0; spec.num_frames()];
            for (t, pair) in spec.frames().windows(2).enumerate() {
                flux[t + 1] = pair[0]
                    .iter()
                    .zip(pair[1].iter())
                    .map(|(prev, cur)| (cur.norm() - prev.norm()).max(0.0))
                    .sum();
            }
            flux
        }
    };
    math::normalize(&mut weights, NormalizeType::UnitMax);
    weights
}

/// Sub-bins per beat: two at or below the threshold tempo, one above it.
pub fn subdivisions_per_beat(tempo_bpm: f64, bpm_threshold: f64) -> usize {
    if tempo_bpm <= bpm_threshold {
        2
    } else {
        1
    }
}

/// Global tempo from the median inter-beat interval.
pub fn grid_tempo(beat_times: &[f64]) -> Option<f64> {
    let intervals: Vec<f64> = beat_times.windows(2).map(|w| w[1] - w[0]).collect();
    math::median(&intervals)
        .filter(|&ibi| ibi > 0.0)
        .map(|ibi| 60.0 / ibi)
}

/// `[start, end)` of every sub-bin between consecutive beats.
pub fn sub_bins(beat_times: &[f64], per_beat: usize) -> Vec<(f64, f64)> {
    beat_times
        .windows(2)
        .flat_map(|w| {
            let (start, width) = (w[0], (w[1] - w[0]) / per_beat as f64);
            (0..per_beat).map(move |s| (start + s as f64 * width, start + (s + 1) as f64 * width))
        })
        .collect()
}

fn aggregate(frames: &[&Chroma], weights: &[f64], how: Aggregate) -> Chroma {
    let mut out = [0.0; PITCH_CLASSES];
    match how {
        Aggregate::Mean => {
            for (c, o) in out.iter_mut().enumerate() {
                *o = frames.iter().map(|f| f[c]).sum::<f64>() / frames.len() as f64;
            }
        }
        Aggregate::Median => {
            for (c, o) in out.iter_mut().enumerate() {
                let values: Vec<f64> = frames.iter().map(|f| f[c]).collect();
                *o = math::median(&values).unwrap_or(0.0);
            }
        }
        Aggregate::Weighted => {
            let total: f64 = weights.iter().sum();
            if total <= 0.0 {
                return aggregate(frames, weights, Aggregate::Mean);
            }
            for (c, o) in out.iter_mut().enumerate() {
                *o = frames
                    .iter()
                    .zip(weights.iter())
                    .map(|(f, w)| f[c] * w)
                    .sum::<f64>()
                    / total;
            }
        }
    }
    out
}

/// A 12 x M chromagram, one column per retained sub-bin.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricChromagram {
    columns: Vec<Chroma>,
    per_beat: usize,
    dropped: usize,
}

impl MetricChromagram {
    pub fn columns(&self) -> &[Chroma] {
        &self.columns
    }

    pub fn per_beat(&self) -> usize {
        self.per_beat
    }

    /// Sub-bins rejected for covering too few frames.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Pitch classes as rows, sub-bins as columns.
    pub fn to_array(&self) -> Array {
        let rows: Vec<Vec<f64>> = (0..PITCH_CLASSES)
            .map(|c| self.columns.iter().map(|col| col[c]).collect())
            .collect();
        Array::from_rows(&rows, self.columns.len())
    }
}

/// Aggregates frame chroma of `samples` over the subdivisions of
/// `beat_times`.
pub fn compute_chromagram(
    samples: &[f64],
    sample_rate: u32,
    beat_times: &[f64],
    config: &ChromagramConfig,
) -> Result<MetricChromagram> {
    config.validate()?;

    let resampled;
    let samples = if sample_rate == ANALYSIS_SAMPLE_RATE {
        samples
    } else {
        resampled = rateconversion::resample(samples, sample_rate, ANALYSIS_SAMPLE_RATE)?;
        &resampled
    };
    let sr = ANALYSIS_SAMPLE_RATE;
    let hop = config.hop_length;

    let mut chroma = frame_chroma(samples, sr, config.chroma_type, hop);
    let uses_weights =
        config.accent_mode == AccentMode::Weighted || config.aggregate == Aggregate::Weighted;
    let weights: Vec<f64> = if uses_weights {
        frame_weights(samples, sr, config.weight_source, hop)
            .into_iter()
            .map(|w| w.powf(config.weight_power))
            .collect()
    } else {
        vec![1.0; chroma.len()]
    };

    match config.accent_mode {
        AccentMode::Preserve => {}
        AccentMode::Normalize => chroma
            .iter_mut()
            .for_each(|c| math::normalize(c, NormalizeType::UnitL2)),
        AccentMode::Weighted => chroma.iter_mut().zip(weights.iter()).for_each(|(c, w)| {
            math::normalize(c, NormalizeType::UnitL2);
            c.iter_mut().for_each(|x| *x *= w);
        }),
    }

    let per_beat = grid_tempo(beat_times)
        .map(|tempo| subdivisions_per_beat(tempo, config.bpm_threshold))
        .unwrap_or(1);
    let frame_rate = sr as f64 / hop as f64;

    let mut columns = Vec::new();
    let mut dropped = 0;
    for (start, end) in sub_bins(beat_times, per_beat) {
        let first = ((start * frame_rate).ceil().max(0.0) as usize).min(chroma.len());
        let last = ((end * frame_rate).ceil().max(0.0) as usize).min(chroma.len());
        let frames: Vec<&Chroma> = chroma[first..last.max(first)].iter().collect();

        if frames.len() < config.min_frames_per_bin.max(1) {
            dropped += 1;
            continue;
        }
        columns.push(aggregate(&frames, &weights[first..first + frames.len()], config.aggregate));
    }

    if dropped > 0 {
        log::warn!(
            "dropped {} of {} sub-bins with fewer than {} frames",
            dropped,
            dropped + columns.len(),
            config.min_frames_per_bin
        );
    }

    Ok(MetricChromagram {
        columns,
        per_beat,
        dropped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    const SR: u32 = ANALYSIS_SAMPLE_RATE;

    fn tone(midi_pitch: f64, seconds: f64) -> Vec<f64> {
        let freq = frequency_for_pitch(midi_pitch);
        (0..(seconds * SR as f64) as usize)
            .map(|i| 0.5 * (2.0 * PI * freq * i as f64 / SR as f64).sin())
            .collect()
    }

    fn peak_class(c: &Chroma) -> usize {
        math::argmax(c).map(|(i, _)| i).unwrap()
    }

    #[test]
    fn stft_backend_finds_pitch_class() {
        let frames = frame_chroma(&tone(57.0, 1.0), SR, ChromaType::Stft, 512);
        assert_eq!(frames.len(), 1 + SR as usize / 512);
        assert_eq!(peak_class(&frames[frames.len() / 2]), 9);
    }

    #[test]
    fn cqt_backend_finds_pitch_class() {
        let frames = frame_chroma(&tone(64.0, 2.0), SR, ChromaType::Cqt, 4096);
        assert_eq!(peak_class(&frames[frames.len() / 2]), 4);
    }

    #[test]
    fn subdivision_follows_tempo_threshold() {
        let slow: Vec<f64> = (0..5).map(|i| i as f64 * 0.5).collect();
        assert_eq!(grid_tempo(&slow), Some(120.0));
        assert_eq!(subdivisions_per_beat(120.0, 180.0), 2);
        assert_eq!(subdivisions_per_beat(200.0, 180.0), 1);
        assert_eq!(subdivisions_per_beat(180.0, 180.0), 2);

        let bins = sub_bins(&slow, 2);
        assert_eq!(bins.len(), 8);
        assert_eq!(bins[1], (0.25, 0.5));
    }

    #[test]
    fn shape_is_twelve_by_subdivisions() {
        let audio = tone(60.0, 3.0);
        let beats: Vec<f64> = (0..5).map(|i| 0.25 + i as f64 * 0.5).collect();
        let config = ChromagramConfig {
            chroma_type: ChromaType::Stft,
            ..Default::default()
        };
        let chromagram = compute_chromagram(&audio, SR, &beats, &config).unwrap();
        assert_eq!(chromagram.per_beat(), 2);
        assert_eq!(chromagram.dropped(), 0);
        let array = chromagram.to_array();
        assert_eq!(array.shape(), &[12, 8]);
        assert!(chromagram.columns().iter().all(|c| peak_class(c) == 0));
    }

    #[test]
    fn fast_tempo_uses_whole_beats() {
        let audio = tone(62.0, 3.0);
        let beats: Vec<f64> = (0..9).map(|i| 0.2 + i as f64 * 0.3).collect();
        let config = ChromagramConfig {
            chroma_type: ChromaType::Stft,
            bpm_threshold: 150.0,
            ..Default::default()
        };
        let chromagram = compute_chromagram(&audio, SR, &beats, &config).unwrap();
        assert_eq!(chromagram.per_beat(), 1);
        assert_eq!(chromagram.columns().len(), 8);
    }

    #[test]
    fn starved_sub_bins_are_dropped() {
        let audio = tone(60.0, 2.0);
        // 0.02 s sub-bins hold one or two 256-sample frames.
        let mut beats = vec![0.5, 1.0];
        beats.push(1.04);
        let config = ChromagramConfig {
            chroma_type: ChromaType::Stft,
            min_frames_per_bin: 5,
            bpm_threshold: 1000.0,
            ..Default::default()
        };
        let chromagram = compute_chromagram(&audio, SR, &beats, &config).unwrap();
        assert_eq!(chromagram.per_beat(), 2);
        assert_eq!(chromagram.columns().len(), 2);
        assert_eq!(chromagram.dropped(), 2);
    }

    #[test]
    fn normalize_mode_gives_unit_frames() {
        let mut audio = tone(60.0, 2.0);
        audio[..SR as usize].iter_mut().for_each(|x| *x *= 0.1);
        let beats = vec![0.0, 1.0, 2.0];
        let base = ChromagramConfig {
            chroma_type: ChromaType::Stft,
            bpm_threshold: 10.0,
            ..Default::default()
        };

        let preserved = compute_chromagram(&audio, SR, &beats, &base).unwrap();
        let normalized = compute_chromagram(
            &audio,
            SR,
            &beats,
            &ChromagramConfig {
                accent_mode: AccentMode::Normalize,
                ..base.clone()
            },
        )
        .unwrap();

        let norm = |c: &Chroma| c.iter().map(|x| x * x).sum::<f64>().sqrt();
        let p = preserved.columns();
        let n = normalized.columns();
        assert!(norm(&p[1]) > 5.0 * norm(&p[0]));
        assert_relative_eq!(norm(&n[1]), norm(&n[0]), max_relative = 0.05);
    }

    #[test]
    fn weighted_aggregate_without_energy_falls_back_to_mean() {
        let frames = [[1.0; PITCH_CLASSES], [3.0; PITCH_CLASSES]];
        let refs: Vec<&Chroma> = frames.iter().collect();
        assert_eq!(aggregate(&refs, &[0.0, 0.0], Aggregate::Weighted)[0], 2.0);
        assert_eq!(aggregate(&refs, &[1.0, 3.0], Aggregate::Weighted)[0], 2.5);
        assert_eq!(aggregate(&refs, &[1.0, 1.0], Aggregate::Median)[5], 2.0);
    }

    #[test]
    fn weights_peak_at_one() {
        let weights = frame_weights(&tone(60.0, 1.0), SR, WeightSource::Onset, 256);
        assert_relative_eq!(weights.iter().cloned().fold(0.0, f64::max), 1.0);
        let weights = frame_weights(&vec![0.0; 1000], SR, WeightSource::Rms, 256);
        assert!(weights.iter().all(|&w| w == 0.0));
    }
}
