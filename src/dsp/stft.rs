/*
Short-time Fourier transform shared by the novelty methods and the STFT chroma
backend.

The framing and the centre-zero phase convention come from the QM DSP Library
phase vocoder:
    - https://github.com/c4dm/qm-dsp/blob/master/dsp/phasevocoder/PhaseVocoder.cpp
*/

use rustfft::num_complex::Complex64;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// A centred, Hann-windowed STFT holding the non-negative half spectrum of
/// every frame.
///
/// The signal is zero-padded by `n_fft / 2` on both sides so that frame `t` is
/// centred on sample `t * hop`.
pub struct Spectrogram {
    n_fft: usize,
    hop: usize,
    sample_rate: u32,
    frames: Vec<Vec<Complex64>>,
}

struct FrameTransform {
    frame_size: usize,
    half_size: usize,

    window: Vec<f64>,
    freq: Vec<Complex64>,

    fft: Arc<dyn Fft<f64>>,
    fft_scratch: Vec<Complex64>,
}

impl FrameTransform {
    fn new(frame_size: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(frame_size);
        let fft_scratch = vec![Complex64::default(); fft.get_inplace_scratch_len()];

        FrameTransform {
            frame_size,
            half_size: frame_size / 2 + 1,

            window: apodize::hanning_iter(frame_size).collect(),
            freq: vec![Complex64::default(); frame_size],

            fft,
            fft_scratch,
        }
    }

    fn process(&mut self, frame: &[f64]) -> Vec<Complex64> {
        debug_assert!(frame.len() >= self.frame_size);

        // The vocoder places the "zero" of the phases in the centre of the
        // windowed frame, so rotate by half a frame before transforming.
        let half = self.frame_size / 2;
        for i in 0..self.frame_size {
            let src = (i + half) % self.frame_size;
            self.freq[i] = Complex64::new(frame[src] * self.window[src], 0.0);
        }

        self.fft
            .process_with_scratch(&mut self.freq, &mut self.fft_scratch);
        self.freq[..self.half_size].to_vec()
    }
}

impl Spectrogram {
    pub fn compute(samples: &[f64], sample_rate: u32, n_fft: usize, hop: usize) -> Self {
        assert!(n_fft >= 2 && hop >= 1);

        let pad = n_fft / 2;
        let mut padded = vec![0.0; samples.len() + 2 * pad];
        padded[pad..pad + samples.len()].copy_from_slice(samples);

        let num_frames = 1 + samples.len() / hop;
        let mut transform = FrameTransform::new(n_fft);
        let mut scratch = vec![0.0; n_fft];

        let frames = (0..num_frames)
            .map(|t| {
                let start = t * hop;
                let end = (start + n_fft).min(padded.len());
                scratch.iter_mut().for_each(|x| *x = 0.0);
                scratch[..end - start].copy_from_slice(&padded[start..end]);
                transform.process(&scratch)
            })
            .collect();

        Spectrogram {
            n_fft,
            hop,
            sample_rate,
            frames,
        }
    }

    pub fn n_fft(&self) -> usize {
        self.n_fft
    }

    pub fn hop(&self) -> usize {
        self.hop
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frames per second.
    pub fn frame_rate(&self) -> f64 {
        self.sample_rate as f64 / self.hop as f64
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn num_bins(&self) -> usize {
        self.n_fft / 2 + 1
    }

    pub fn frames(&self) -> &[Vec<Complex64>] {
        &self.frames
    }

    /// Centre frequency of bin `k` in Hz.
    pub fn bin_frequency(&self, k: usize) -> f64 {
        k as f64 * self.sample_rate as f64 / self.n_fft as f64
    }
}
