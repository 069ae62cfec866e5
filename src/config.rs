/*
Stage parameters and the on-disk data layout.

Every stage receives its configuration explicitly; the `Default` impls carry
the command-line defaults.
*/

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::artifact::Stage;
use crate::chromagram::{AccentMode, Aggregate, ChromaType, WeightSource};
use crate::error::{Error, Result};
use crate::novelty::NoveltyMethod;
use crate::tempogram::TempogramMethod;

/// Sample rate every spectral stage analyses audio at.
pub const ANALYSIS_SAMPLE_RATE: u32 = 22050;

/// Frame rate of novelty curves and everything derived from them.
pub const FEATURE_RATE: f64 = 100.0;

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidParameter(msg.into())
}

fn check_theta(theta_min: u32, theta_max: u32) -> Result<()> {
    if theta_min == 0 {
        return Err(invalid("theta-min must be positive"));
    }
    if theta_min >= theta_max {
        return Err(invalid(format!(
            "theta range must be increasing, got [{}, {}]",
            theta_min, theta_max
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct NoveltyConfig {
    pub method: NoveltyMethod,
    /// STFT window length N in samples.
    pub n_fft: usize,
    /// STFT hop H in samples.
    pub hop: usize,
    /// Logarithmic compression factor.
    pub gamma: f64,
    /// Half-width M, in frames, of the local average that is subtracted.
    pub local_average: usize,
    /// Crop the audio to start at this marker before analysis.
    pub start_marker: Option<String>,
    /// Crop the audio to end at this marker before analysis.
    pub end_marker: Option<String>,
}

impl Default for NoveltyConfig {
    fn default() -> Self {
        Self {
            method: NoveltyMethod::Spectrum,
            n_fft: 1024,
            hop: 256,
            gamma: 100.0,
            local_average: 10,
            start_marker: None,
            end_marker: None,
        }
    }
}

impl NoveltyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_fft < 2 {
            return Err(invalid(format!("N must be at least 2, got {}", self.n_fft)));
        }
        if self.hop == 0 || self.hop > self.n_fft {
            return Err(invalid(format!(
                "H must be in [1, N={}], got {}",
                self.n_fft, self.hop
            )));
        }
        if !self.gamma.is_finite() || self.gamma < 0.0 {
            return Err(invalid(format!(
                "gamma must be finite and non-negative, got {}",
                self.gamma
            )));
        }
        Ok(())
    }

    /// Whether a marker file is needed to run this configuration.
    pub fn uses_markers(&self) -> bool {
        self.start_marker.is_some() || self.end_marker.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TempogramConfig {
    pub method: TempogramMethod,
    /// Analysis window length N in novelty frames.
    pub window: usize,
    /// Hop H in novelty frames.
    pub hop: usize,
    pub theta_min: u32,
    pub theta_max: u32,
}

impl Default for TempogramConfig {
    fn default() -> Self {
        Self {
            method: TempogramMethod::Fourier,
            window: 500,
            hop: 1,
            theta_min: 40,
            theta_max: 320,
        }
    }
}

impl TempogramConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window < 2 {
            return Err(invalid(format!("N must be at least 2, got {}", self.window)));
        }
        if self.hop == 0 {
            return Err(invalid("H must be at least 1"));
        }
        check_theta(self.theta_min, self.theta_max)?;

        if self.method == TempogramMethod::Autocorr {
            let max_lag = (FEATURE_RATE * 60.0 / self.theta_min as f64).ceil() as usize;
            if max_lag >= self.window {
                return Err(invalid(format!(
                    "autocorrelation window N={} cannot resolve {} BPM (needs N > {})",
                    self.window, self.theta_min, max_lag
                )));
            }
        }
        if self.method == TempogramMethod::Cyclic && self.theta_max < 2 * self.theta_min {
            return Err(invalid(
                "cyclic tempogram needs a theta range of at least one octave",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BeatsConfig {
    /// Weight of the tempo-deviation penalty against novelty peaks.
    pub factor: f64,
    pub theta_min: u32,
    pub theta_max: u32,
    /// Replaces tempo estimation entirely when set.
    pub tempo: Option<f64>,
}

impl Default for BeatsConfig {
    fn default() -> Self {
        Self {
            factor: 1.0,
            theta_min: 40,
            theta_max: 320,
            tempo: None,
        }
    }
}

impl BeatsConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.factor.is_finite() || self.factor < 0.0 {
            return Err(invalid(format!(
                "factor must be finite and non-negative, got {}",
                self.factor
            )));
        }
        check_theta(self.theta_min, self.theta_max)?;
        if let Some(tempo) = self.tempo {
            if !tempo.is_finite() || tempo <= 0.0 {
                return Err(invalid(format!("tempo must be positive, got {}", tempo)));
            }
            if tempo < f64::from(self.theta_min) || tempo > f64::from(self.theta_max) {
                return Err(invalid(format!(
                    "tempo {} is outside the {}..={} BPM range",
                    tempo, self.theta_min, self.theta_max
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MeterConfig {
    /// Fixed beats per bar. When unset it is inferred from the audio.
    pub beats_per_bar: Option<u32>,
}

impl MeterConfig {
    pub fn validate(&self) -> Result<()> {
        match self.beats_per_bar {
            Some(0) => Err(invalid("beats-per-bar must be at least 1")),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChromagramConfig {
    pub chroma_type: ChromaType,
    /// Chroma frame hop in samples at the analysis rate.
    pub hop_length: usize,
    /// Beats faster than this get fewer sub-bins.
    pub bpm_threshold: f64,
    pub aggregate: Aggregate,
    pub accent_mode: AccentMode,
    pub weight_source: WeightSource,
    pub weight_power: f64,
    /// Sub-bins covering fewer frames than this are dropped.
    pub min_frames_per_bin: usize,
}

impl Default for ChromagramConfig {
    fn default() -> Self {
        Self {
            chroma_type: ChromaType::Cqt,
            hop_length: 256,
            bpm_threshold: 180.0,
            aggregate: Aggregate::Mean,
            accent_mode: AccentMode::Preserve,
            weight_source: WeightSource::Rms,
            weight_power: 1.0,
            min_frames_per_bin: 2,
        }
    }
}

impl ChromagramConfig {
    pub fn validate(&self) -> Result<()> {
        if self.hop_length == 0 {
            return Err(invalid("hop-length must be at least 1"));
        }
        if !self.bpm_threshold.is_finite() || self.bpm_threshold <= 0.0 {
            return Err(invalid(format!(
                "bpm-threshold must be positive, got {}",
                self.bpm_threshold
            )));
        }
        if !self.weight_power.is_finite() || self.weight_power < 0.0 {
            return Err(invalid(format!(
                "weight-power must be finite and non-negative, got {}",
                self.weight_power
            )));
        }
        Ok(())
    }
}

/// Where inputs are read from and artifacts are written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DataLayout { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Canonical raw audio.
    pub fn raw_audio_dir(&self) -> PathBuf {
        self.root.join("raw").join("audio")
    }

    pub fn markers_dir(&self) -> PathBuf {
        self.root.join("annotations").join("markers")
    }

    pub fn derived_dir(&self) -> PathBuf {
        self.root.join("derived")
    }

    pub fn stage_dir(&self, stage: Stage) -> PathBuf {
        self.derived_dir().join(stage.dir_name())
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs").join("derived")
    }

    pub fn marker_file(&self, track: &str) -> PathBuf {
        self.markers_dir().join(format!("{}_markers.json", track))
    }

    pub fn audio_file(&self, track: &str) -> PathBuf {
        self.raw_audio_dir().join(format!("{}.wav", track))
    }
}

impl Default for DataLayout {
    fn default() -> Self {
        DataLayout::new("data")
    }
}
