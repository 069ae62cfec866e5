/*
Sparse-kernel constant-Q transform and the pitch-class filterbank built on it.

Based on the QM DSP Library constant-Q and chromagram code:
    - https://github.com/c4dm/qm-dsp/blob/master/dsp/chromagram/ConstantQ.cpp
    - https://github.com/c4dm/qm-dsp/blob/master/dsp/chromagram/Chromagram.cpp
*/

use std::{f64::consts::PI, sync::Arc};

use rustfft::{num_complex::Complex64, num_traits::Zero, Fft, FftPlanner};

pub const PITCH_CLASSES: usize = 12;

/// Kernel magnitude below which spectral kernel entries are discarded.
const KERNEL_THRESHOLD: f64 = 0.0054;

pub struct ConstantQ {
    fft_length: usize,
    num_bins: usize,

    kernel: SparseKernel,
}

/// Non-zero entries of the spectral kernel as (fft bin, cq bin, value) columns.
struct SparseKernel {
    fft_bins: Vec<usize>,
    cq_bins: Vec<usize>,
    values: Vec<Complex64>,
}

impl ConstantQ {
    /// `fs` sample rate, `f_min` lowest bin centre, `octaves` span, `bpo` bins per octave.
    pub fn new(fs: f64, f_min: f64, octaves: u32, bpo: u32) -> Self {
        let q = 1.0 / (f64::powf(2.0, 1.0 / bpo as f64) - 1.0);
        let num_bins = (bpo * octaves) as usize;
        let fft_length = ((q * fs / f_min).ceil() as usize).next_power_of_two();

        let kernel = Self::build_kernel(fs, f_min, bpo, q, fft_length, num_bins);

        ConstantQ {
            fft_length,
            num_bins,
            kernel,
        }
    }

    pub fn fft_length(&self) -> usize {
        self.fft_length
    }

    pub fn num_bins(&self) -> usize {
        self.num_bins
    }

    fn build_kernel(
        fs: f64,
        f_min: f64,
        bpo: u32,
        q: f64,
        fft_length: usize,
        num_bins: usize,
    ) -> SparseKernel {
        let mut kernel = SparseKernel {
            fft_bins: Vec::new(),
            cq_bins: Vec::new(),
            values: Vec::new(),
        };

        let mut planner = FftPlanner::<f64>::new();
        let fft = planner.plan_fft_forward(fft_length);
        let mut fft_scratch = vec![Complex64::default(); fft.get_inplace_scratch_len()];
        let mut atom = vec![Complex64::zero(); fft_length];
        let square_threshold = KERNEL_THRESHOLD.powi(2);

        // Each bin's temporal atom is a Hamming-shaped complex sinusoid; its
        // spectrum, thresholded, becomes one sparse row of the kernel.
        for j in (0..num_bins).rev() {
            atom.iter_mut().for_each(|x| *x = Complex64::zero());

            let samples_per_cycle = fs / (f_min * f64::powf(2.0, j as f64 / bpo as f64));
            let atom_length = ((q * samples_per_cycle).ceil() as usize).min(fft_length);
            let origin = fft_length / 2 - atom_length / 2;

            let hamming = apodize::hamming_iter(atom_length);
            atom.iter_mut()
                .enumerate()
                .skip(origin)
                .take(atom_length)
                .zip(hamming)
                .for_each(|((i, x), w)| {
                    *x = Complex64::cis((2.0 * PI * i as f64) / samples_per_cycle) * w
                        / atom_length as f64
                });

            // Frames are fftshifted before transforming, so the atom is too.
            let half = fft_length / 2;
            for i in 0..half {
                atom.swap(i, i + half);
            }

            fft.process_with_scratch(&mut atom, &mut fft_scratch);

            for (i, x) in atom.iter().enumerate() {
                if x.norm_sqr() <= square_threshold {
                    continue;
                }
                kernel.fft_bins.push(i);
                kernel.cq_bins.push(j);
                kernel.values.push(x.conj() / fft_length as f64);
            }
        }

        kernel
    }

    /// Projects a full-length spectrum onto the constant-Q bins.
    pub fn process(&self, fft: &[Complex64], cq: &mut [Complex64]) {
        cq.iter_mut()
            .take(self.num_bins)
            .for_each(|x| *x = Complex64::zero());

        let kernel = &self.kernel;
        for ((&col, &row), &val) in kernel
            .fft_bins
            .iter()
            .zip(kernel.cq_bins.iter())
            .zip(kernel.values.iter())
        {
            if col == 0 {
                continue;
            }
            cq[row] += val * fft[self.fft_length - col];
        }
    }
}

/// Frame-wise pitch-class energies from a constant-Q transform whose lowest
/// bin sits on a C.
pub struct CqtChroma {
    bpo: u32,
    frame_size: usize,

    constant_q: ConstantQ,

    window: Vec<f64>,
    fft: Arc<dyn Fft<f64>>,
    fft_data: Vec<Complex64>,
    fft_scratch: Vec<Complex64>,
    cq_data: Vec<Complex64>,
}

impl CqtChroma {
    /// `f_min` must be the frequency of a C for row 0 of the output to be C.
    pub fn new(fs: f64, f_min: f64, octaves: u32, bpo: u32) -> Self {
        assert!(bpo % PITCH_CLASSES as u32 == 0);

        let constant_q = ConstantQ::new(fs, f_min, octaves, bpo);
        let frame_size = constant_q.fft_length();

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(frame_size);
        let fft_scratch = vec![Complex64::default(); fft.get_inplace_scratch_len()];

        CqtChroma {
            bpo,
            frame_size,

            cq_data: vec![Complex64::default(); constant_q.num_bins()],
            constant_q,

            window: apodize::hamming_iter(frame_size).collect(),
            fft,
            fft_data: vec![Complex64::default(); frame_size],
            fft_scratch,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Folds one frame of `frame_size` samples into 12 pitch-class magnitudes.
    pub fn process(&mut self, frame: &[f64]) -> [f64; PITCH_CLASSES] {
        self.fft_data
            .iter_mut()
            .zip(frame.iter().zip(self.window.iter()))
            .for_each(|(x, (s, w))| *x = Complex64::new(s * w, 0.0));

        let half = self.frame_size / 2;
        for i in 0..half {
            self.fft_data.swap(i, i + half);
        }

        self.fft
            .process_with_scratch(&mut self.fft_data, &mut self.fft_scratch);
        self.constant_q.process(&self.fft_data, &mut self.cq_data);

        let bins_per_semitone = (self.bpo as usize / PITCH_CLASSES) as f64;
        let mut chroma = [0.0; PITCH_CLASSES];
        for (j, cq) in self.cq_data.iter().enumerate() {
            let semitone = (j as f64 / bins_per_semitone).round() as usize;
            chroma[semitone % PITCH_CLASSES] += cq.norm();
        }
        chroma
    }
}
