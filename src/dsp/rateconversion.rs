/*
Sample-rate conversion onto the analysis rate.

The power-of-two decimator uses the anti-aliasing filters of the QM DSP Library:
    - https://github.com/c4dm/qm-dsp/blob/master/dsp/rateconversion/Decimator.cpp
Other ratios go through rubato's band-limited sinc resampler.
*/

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use crate::error::{Error, Result};

/// Fast downsampler by a factor of 2, 4 or 8. An 8th-order IIR low-pass runs
/// over the input before every `factor`-th sample is kept.
pub struct Decimator {
    factor: usize,

    a: [f64; 8],
    b: [f64; 8],
    o: [f64; 7],
}

impl Decimator {
    /// Returns `None` for unsupported factors.
    pub fn new(factor: usize) -> Option<Self> {
        let (b, a) = match factor {
            8 => (
                [
                    0.060111378492136,
                    -0.257323420830598,
                    0.420583503165928,
                    -0.222750785197418,
                    -0.222750785197418,
                    0.420583503165928,
                    -0.257323420830598,
                    0.060111378492136,
                ],
                [
                    1.0,
                    -5.667654878577432,
                    14.062452278088417,
                    -19.737303840697738,
                    16.88969887460864,
                    -8.796600612325928,
                    2.577553446979888,
                    -0.326903916815751,
                ],
            ),
            4 => (
                [
                    0.1013330690491862,
                    -0.2447523353702363,
                    0.33622528590120965,
                    -0.13936581560633518,
                    -0.13936581560633382,
                    0.3362252859012087,
                    -0.2447523353702358,
                    0.10133306904918594,
                ],
                [
                    1.0,
                    -3.9035590278139427,
                    7.529937998062113,
                    -8.689080379317751,
                    6.457866709609918,
                    -3.024297943122363,
                    0.8304338513674838,
                    -0.09442080083780933,
                ],
            ),
            2 => (
                [
                    0.20898944260075727,
                    0.40011234879814367,
                    0.819741973072733,
                    1.0087419911682323,
                    1.0087419911682325,
                    0.8197419730727316,
                    0.40011234879814295,
                    0.2089894426007566,
                ],
                [
                    1.0,
                    0.007733118420835822,
                    1.9853971155964376,
                    0.19296739275341004,
                    1.2330748872852182,
                    0.18705341389316466,
                    0.23659265908013868,
                    0.032352924250533946,
                ],
            ),
            _ => return None,
        };

        Some(Decimator {
            factor,
            a,
            b,
            o: [0.0; 7],
        })
    }

    /// Filters and decimates a whole signal. The output has `len / factor` samples.
    pub fn process(&mut self, src: &[f64]) -> Vec<f64> {
        let out_len = src.len() / self.factor;
        let mut out = Vec::with_capacity(out_len);

        for (i, &input) in src.iter().enumerate().take(out_len * self.factor) {
            let output = self.filter(input);
            if i % self.factor == 0 {
                out.push(output);
            }
        }
        out
    }

    fn filter(&mut self, input: f64) -> f64 {
        let (a, b, o) = (&self.a, &self.b, &mut self.o);
        let output = input * b[0] + o[0];
        for k in 0..6 {
            o[k] = input * b[k + 1] - output * a[k + 1] + o[k + 1];
        }
        o[6] = input * b[7] - output * a[7];
        output
    }
}

/// Converts `input` from `from_rate` to `to_rate`.
///
/// Exact power-of-two reductions use [`Decimator`]; everything else goes
/// through a band-limited sinc resampler. The output has
/// `round(len * to_rate / from_rate)` samples and no added delay.
pub fn resample(input: &[f64], from_rate: u32, to_rate: u32) -> Result<Vec<f64>> {
    if from_rate == to_rate || input.is_empty() {
        return Ok(input.to_vec());
    }

    if from_rate % to_rate == 0 {
        if let Some(mut decimator) = Decimator::new((from_rate / to_rate) as usize) {
            return Ok(decimator.process(input));
        }
    }

    let failed = |reason: String| Error::Resample {
        from: from_rate,
        to: to_rate,
        reason,
    };
    let ratio = to_rate as f64 / from_rate as f64;
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler = SincFixedIn::<f64>::new(ratio, 1.0, params, input.len(), 1)
        .map_err(|e| failed(e.to_string()))?;

    let delay = resampler.output_delay();
    let mut out = resampler
        .process(&[input], None)
        .map_err(|e| failed(e.to_string()))?
        .remove(0);
    // Flush the samples still held back by the filter delay.
    let tail = resampler
        .process_partial::<&[f64]>(None, None)
        .map_err(|e| failed(e.to_string()))?
        .remove(0);
    out.extend(tail);

    let out_len = (input.len() as f64 * ratio).round() as usize;
    let mut out: Vec<f64> = out.into_iter().skip(delay).take(out_len).collect();
    out.resize(out_len, 0.0);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn tone(freq: f64, rate: u32, secs: f64) -> Vec<f64> {
        (0..(rate as f64 * secs) as usize)
            .map(|i| (2.0 * PI * freq * i as f64 / rate as f64).sin())
            .collect()
    }

    fn rms(x: &[f64]) -> f64 {
        (x.iter().map(|v| v * v).sum::<f64>() / x.len() as f64).sqrt()
    }

    #[test]
    fn unsupported_decimation_factor() {
        assert!(Decimator::new(3).is_none());
        assert!(Decimator::new(2).is_some());
    }

    #[test]
    fn halving_keeps_low_tone() {
        let input = tone(440.0, 44100, 1.0);
        let out = resample(&input, 44100, 22050).unwrap();
        assert_eq!(out.len(), 22050);
        // Skip the filter's settling time.
        assert_relative_eq!(rms(&out[2000..]), rms(&input[4000..]), max_relative = 0.1);
    }

    #[test]
    fn fractional_ratio_keeps_low_tone() {
        let input = tone(440.0, 48000, 0.5);
        let out = resample(&input, 48000, 22050).unwrap();
        assert_eq!(out.len(), (24000.0f64 * 22050.0 / 48000.0).round() as usize);
        let n = out.len();
        assert_relative_eq!(
            rms(&out[n / 4..3 * n / 4]),
            std::f64::consts::FRAC_1_SQRT_2,
            max_relative = 0.05
        );
    }

    #[test]
    fn fractional_ratio_rejects_tone_above_new_nyquist() {
        let input = tone(15000.0, 48000, 0.5);
        let out = resample(&input, 48000, 22050).unwrap();
        let n = out.len();
        assert!(rms(&out[n / 4..3 * n / 4]) < 0.05);
    }

    #[test]
    fn identity_rate_is_copy() {
        let input = vec![0.1, 0.2, 0.3];
        assert_eq!(resample(&input, 22050, 22050).unwrap(), input);
    }
}
