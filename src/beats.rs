/*
Beat tracking by dynamic programming over a novelty curve.

The recurrence is the one from Ellis, "Beat Tracking by Dynamic Programming"
(2007): every novelty frame is scored as the end of a beat chain, and chains are
extended from the best predecessor under a log-squared penalty on the deviation
of the inter-beat interval from the expected period.
*/

use crate::config::{BeatsConfig, ANALYSIS_SAMPLE_RATE, FEATURE_RATE};
use crate::dsp::math;
use crate::error::{Error, Result};
use crate::tempogram::Tempogram;

/// Dominant tempo of a tempogram: the row with the largest mean magnitude
/// among rows whose tempo lies in `[theta_min, theta_max]`. Ties resolve to
/// the earliest row.
pub fn estimate_tempo(tempogram: &Tempogram, theta_min: f64, theta_max: f64) -> Option<f64> {
    let profile: Vec<f64> = tempogram
        .rows()
        .iter()
        .zip(tempogram.tempo_axis())
        .map(|(row, &bpm)| {
            if bpm < theta_min || bpm > theta_max || row.is_empty() {
                f64::NEG_INFINITY
            } else {
                row.iter().map(|x| x.abs()).sum::<f64>() / row.len() as f64
            }
        })
        .collect();

    math::argmax(&profile)
        .filter(|(_, score)| score.is_finite())
        .map(|(idx, _)| tempogram.tempo_axis()[idx])
}

/// Expected inter-beat interval in novelty frames.
pub fn beat_period(tempo_bpm: f64) -> usize {
    ((FEATURE_RATE * 60.0 / tempo_bpm).round() as usize).max(1)
}

/// Returns beat positions as novelty frame indices, in increasing order.
///
/// Frame `n` scores `novelty[n]` plus the best predecessor score
/// `D[m] - factor * log2((n - m) / period)^2` over `n - m` in
/// `[period / 2, 2 * period]`. When no predecessor scores above zero a new
/// chain starts at `n`. The chain ending at the best-scoring frame is returned.
pub fn track_beats(novelty: &[f64], period: usize, factor: f64) -> Vec<usize> {
    if novelty.is_empty() {
        return Vec::new();
    }

    let period = period.clamp(1, novelty.len());
    let min_gap = (period + 1) / 2;
    let max_gap = 2 * period;
    let penalty: Vec<f64> = (0..=max_gap)
        .map(|gap| {
            if gap < min_gap {
                f64::NEG_INFINITY
            } else {
                -factor * (gap as f64 / period as f64).log2().powi(2)
            }
        })
        .collect();

    let mut score = vec![0.0; novelty.len()];
    let mut backlink: Vec<Option<usize>> = vec![None; novelty.len()];

    for n in 0..novelty.len() {
        let first = n.saturating_sub(max_gap);
        let mut best: Option<(usize, f64)> = None;
        for m in first..n.saturating_sub(min_gap - 1) {
            let candidate = score[m] + penalty[n - m];
            if best.map_or(true, |(_, b)| candidate > b) {
                best = Some((m, candidate));
            }
        }

        match best {
            Some((m, s)) if s > 0.0 => {
                score[n] = novelty[n] + s;
                backlink[n] = Some(m);
            }
            _ => score[n] = novelty[n],
        }
    }

    let mut beats = Vec::new();
    let mut cursor = math::argmax(&score).map(|(idx, _)| idx);
    while let Some(n) = cursor {
        beats.push(n);
        cursor = backlink[n];
    }
    beats.reverse();
    beats
}

/// Drops every beat followed by another within `min_gap` seconds, so the
/// later of two near-coincident beats survives.
pub fn collapse_close(beats: &[f64], min_gap: f64) -> Vec<f64> {
    let mut out: Vec<f64> = Vec::with_capacity(beats.len());
    for &t in beats {
        while out.last().map_or(false, |&prev| t - prev < min_gap) {
            out.pop();
        }
        out.push(t);
    }
    out
}

/// Beat instants in seconds for a novelty curve and its tempogram.
pub fn compute_beats(novelty: &[f64], tempogram: &Tempogram, config: &BeatsConfig) -> Result<Vec<f64>> {
    config.validate()?;

    let tempo = match config.tempo {
        Some(tempo) => tempo,
        None => estimate_tempo(
            tempogram,
            config.theta_min as f64,
            config.theta_max as f64,
        )
        .ok_or_else(|| {
            Error::InvalidParameter(format!(
                "tempogram has no tempo within [{}, {}] BPM",
                config.theta_min, config.theta_max
            ))
        })?,
    };

    let period = beat_period(tempo);
    log::debug!("tracking beats at {:.2} BPM ({} frames)", tempo, period);

    let frames = track_beats(novelty, period, config.factor);
    let seconds: Vec<f64> = frames.iter().map(|&n| n as f64 / FEATURE_RATE).collect();
    Ok(collapse_close(&seconds, 1.0 / ANALYSIS_SAMPLE_RATE as f64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tempogram::linear_axis;

    fn impulses(period: usize, len: usize, offset: usize) -> Vec<f64> {
        (0..len)
            .map(|i| if i >= offset && (i - offset) % period == 0 { 1.0 } else { 0.0 })
            .collect()
    }

    #[test]
    fn follows_regular_pulse() {
        let novelty = impulses(50, 1000, 7);
        let beats = track_beats(&novelty, 50, 1.0);
        let expected: Vec<usize> = (7..1000).step_by(50).collect();
        assert_eq!(beats, expected);
    }

    #[test]
    fn strictly_increasing_on_noise() {
        // Deterministic pseudo-random novelty.
        let mut state = 12345u64;
        let novelty: Vec<f64> = (0..3000)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                (state >> 33) as f64 / (1u64 << 31) as f64
            })
            .collect();
        for factor in [0.0, 1.0, 100.0] {
            let beats = track_beats(&novelty, 43, factor);
            assert!(!beats.is_empty());
            assert!(beats.windows(2).all(|w| w[1] > w[0]));
        }
    }

    #[test]
    fn large_factor_enforces_period() {
        // A strong off-grid onset tempts a low factor into a short interval.
        let mut novelty = impulses(50, 600, 0);
        novelty[330] = 1.0;
        novelty[350] = 0.0;
        let strict = track_beats(&novelty, 50, 1000.0);
        let gaps: Vec<usize> = strict.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps.iter().all(|&g| (40..=60).contains(&g)), "{:?}", gaps);
    }

    #[test]
    fn ties_prefer_earliest_predecessor() {
        // Without a penalty, frames 0, 2, 5, 7 and 10 are equally good
        // predecessors of the onset at 15.
        let mut novelty = vec![0.0; 20];
        novelty[0] = 1.0;
        novelty[2] = 1.0;
        novelty[15] = 1.0;
        assert_eq!(track_beats(&novelty, 10, 0.0), vec![0, 15]);
    }

    #[test]
    fn empty_novelty() {
        assert!(track_beats(&[], 50, 1.0).is_empty());
    }

    #[test]
    fn period_longer_than_novelty() {
        let novelty = impulses(50, 200, 3);
        let beats = track_beats(&novelty, usize::MAX, 1.0);
        assert!(!beats.is_empty());
        assert!(beats.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn tiny_forced_tempo_is_rejected() {
        let novelty = impulses(60, 600, 0);
        let tg = Tempogram::new(vec![vec![1.0; 4]], vec![200.0]);
        let config = BeatsConfig {
            tempo: Some(1e-20),
            ..Default::default()
        };
        assert!(matches!(
            compute_beats(&novelty, &tg, &config),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn collapse_keeps_later() {
        let beats = [1.0, 1.00001, 2.0, 3.0];
        assert_eq!(collapse_close(&beats, 1.0 / 22050.0), vec![1.00001, 2.0, 3.0]);
    }

    #[test]
    fn tempo_from_tempogram_rows() {
        let axis = linear_axis(100, 103);
        let rows = vec![
            vec![1.0, 1.0],
            vec![3.0, 1.0],
            vec![2.0, 2.0],
            vec![0.0, 0.0],
        ];
        let tg = Tempogram::new(rows, axis);
        // Rows 1 and 2 tie on the mean; the earlier one wins.
        assert_eq!(estimate_tempo(&tg, 40.0, 320.0), Some(101.0));
        assert_eq!(estimate_tempo(&tg, 102.0, 320.0), Some(102.0));
        assert_eq!(estimate_tempo(&tg, 200.0, 320.0), None);
    }

    #[test]
    fn forced_tempo_overrides_estimate() {
        let novelty = impulses(60, 1200, 0);
        let tg = Tempogram::new(vec![vec![1.0; 4]], vec![200.0]);
        let config = BeatsConfig {
            tempo: Some(100.0),
            ..Default::default()
        };
        let beats = compute_beats(&novelty, &tg, &config).unwrap();
        assert_relative_eq!(beats[1] - beats[0], 0.6, epsilon = 1e-9);
    }
}
