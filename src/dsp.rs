/*
Signal-processing kernels used by the analysis stages. The spectral pieces are
adapted from the QM DSP Library (https://github.com/c4dm/qm-dsp).
*/

pub mod constantq;
pub mod filter;
pub mod math;
pub mod rateconversion;
pub mod stft;
