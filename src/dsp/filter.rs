/*
Second-order IIR sections used to split audio into frequency bands.

Coefficients follow the RBJ audio-EQ cookbook; filtering runs in transposed
direct form, the same state layout the decimator uses.
*/

use std::f64::consts::PI;

#[derive(Clone, Copy, Debug)]
pub struct Biquad {
    b: [f64; 3],
    a: [f64; 3],
}

impl Biquad {
    const Q: f64 = std::f64::consts::FRAC_1_SQRT_2;

    pub fn lowpass(sample_rate: f64, cutoff: f64) -> Self {
        let (cos_w, alpha) = Self::prewarp(sample_rate, cutoff);
        let b1 = 1.0 - cos_w;
        Self::normalized([b1 / 2.0, b1, b1 / 2.0], [1.0 + alpha, -2.0 * cos_w, 1.0 - alpha])
    }

    pub fn highpass(sample_rate: f64, cutoff: f64) -> Self {
        let (cos_w, alpha) = Self::prewarp(sample_rate, cutoff);
        let b1 = 1.0 + cos_w;
        Self::normalized(
            [b1 / 2.0, -b1, b1 / 2.0],
            [1.0 + alpha, -2.0 * cos_w, 1.0 - alpha],
        )
    }

    fn prewarp(sample_rate: f64, cutoff: f64) -> (f64, f64) {
        let w = 2.0 * PI * cutoff / sample_rate;
        (w.cos(), w.sin() / (2.0 * Self::Q))
    }

    fn normalized(b: [f64; 3], a: [f64; 3]) -> Self {
        Biquad {
            b: [b[0] / a[0], b[1] / a[0], b[2] / a[0]],
            a: [1.0, a[1] / a[0], a[2] / a[0]],
        }
    }

    pub fn process(&self, data: &mut [f64]) {
        let (mut s1, mut s2) = (0.0, 0.0);
        for x in data.iter_mut() {
            let input = *x;
            let output = self.b[0] * input + s1;
            s1 = self.b[1] * input - self.a[1] * output + s2;
            s2 = self.b[2] * input - self.a[2] * output;
            *x = output;
        }
    }
}

/// A cascade of biquads applied forwards and then backwards, giving a
/// zero-phase response with doubled attenuation.
#[derive(Clone, Debug, Default)]
pub struct ZeroPhaseBand {
    stages: Vec<Biquad>,
}

impl ZeroPhaseBand {
    pub fn new(sample_rate: f64, low_hz: Option<f64>, high_hz: Option<f64>) -> Self {
        let mut stages = Vec::new();
        if let Some(low) = low_hz {
            stages.push(Biquad::highpass(sample_rate, low));
        }
        if let Some(high) = high_hz {
            stages.push(Biquad::lowpass(sample_rate, high));
        }
        ZeroPhaseBand { stages }
    }

    pub fn apply(&self, signal: &[f64]) -> Vec<f64> {
        let mut out = signal.to_vec();
        for stage in &self.stages {
            stage.process(&mut out);
            out.reverse();
            stage.process(&mut out);
            out.reverse();
        }
        out
    }

    /// Root-mean-square level of the band-limited signal.
    pub fn rms(&self, signal: &[f64]) -> f64 {
        if signal.is_empty() {
            return 0.0;
        }
        let filtered = self.apply(signal);
        (filtered.iter().map(|x| x * x).sum::<f64>() / filtered.len() as f64).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freq: f64, sr: f64, len: usize) -> Vec<f64> {
        (0..len)
            .map(|i| (2.0 * PI * freq * i as f64 / sr).sin())
            .collect()
    }

    #[test]
    fn lowpass_separates_bass_from_treble() {
        let sr = 22050.0;
        let band = ZeroPhaseBand::new(sr, Some(30.0), Some(250.0));
        let bass = band.rms(&tone(80.0, sr, 4410));
        let treble = band.rms(&tone(4000.0, sr, 4410));
        assert!(bass > 0.5, "bass {}", bass);
        assert!(treble < 0.01, "treble {}", treble);
    }

    #[test]
    fn highpass_only_band() {
        let sr = 22050.0;
        let band = ZeroPhaseBand::new(sr, Some(1600.0), None);
        assert!(band.rms(&tone(100.0, sr, 4410)) < 0.01);
        assert!(band.rms(&tone(5000.0, sr, 4410)) > 0.5);
    }

    #[test]
    fn empty_band_is_passthrough() {
        let band = ZeroPhaseBand::default();
        assert_eq!(band.apply(&[1.0, -1.0]), vec![1.0, -1.0]);
        assert_eq!(band.rms(&[]), 0.0);
    }
}
