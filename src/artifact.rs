/*
Parameter-addressed artifact identities.

Every derived file is named by its [`ArtifactKey`]: the track plus the
ordered parameter values of the stage that produced it. Keys are rendered to
and parsed from file stems, and an [`ArtifactIndex`] maps tracks to the keys
present in a stage directory.
*/

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::chromagram::{AccentMode, Aggregate, ChromaType, WeightSource};
use crate::config::{ChromagramConfig, NoveltyConfig, TempogramConfig};
use crate::error::{Error, Result};
use crate::novelty::NoveltyMethod;
use crate::tempogram::TempogramMethod;

pub const EXTENSION: &str = "npy";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Novelty,
    Tempogram,
    Beats,
    Meter,
    Chromagram,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Novelty,
        Stage::Tempogram,
        Stage::Beats,
        Stage::Meter,
        Stage::Chromagram,
    ];

    pub fn dir_name(self) -> &'static str {
        match self {
            Stage::Novelty => "novelty",
            Stage::Tempogram => "tempogram",
            Stage::Beats => "beats",
            Stage::Meter => "meter",
            Stage::Chromagram => "chromagram",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// The parameters that name an artifact, per stage.
#[derive(Clone, Debug, PartialEq)]
pub enum Params {
    Novelty(NoveltyConfig),
    Tempogram(TempogramConfig),
    Beats,
    Meter,
    Chromagram(ChromagramConfig),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ArtifactKey {
    pub track: String,
    pub params: Params,
}

/// Renders a float so that whole numbers keep a trailing `.0`.
fn fmt_float(x: f64) -> String {
    let text = x.to_string();
    if text.contains('.') || !x.is_finite() {
        text
    } else {
        format!("{}.0", text)
    }
}

fn parse_fields<const N: usize>(text: &str) -> Option<[&str; N]> {
    let fields: Vec<&str> = text.split('-').collect();
    fields.try_into().ok()
}

impl ArtifactKey {
    pub fn novelty(track: impl Into<String>, config: &NoveltyConfig) -> Self {
        ArtifactKey {
            track: track.into(),
            params: Params::Novelty(config.clone()),
        }
    }

    pub fn tempogram(track: impl Into<String>, config: &TempogramConfig) -> Self {
        ArtifactKey {
            track: track.into(),
            params: Params::Tempogram(config.clone()),
        }
    }

    pub fn beats(track: impl Into<String>) -> Self {
        ArtifactKey {
            track: track.into(),
            params: Params::Beats,
        }
    }

    pub fn meter(track: impl Into<String>) -> Self {
        ArtifactKey {
            track: track.into(),
            params: Params::Meter,
        }
    }

    pub fn chromagram(track: impl Into<String>, config: &ChromagramConfig) -> Self {
        ArtifactKey {
            track: track.into(),
            params: Params::Chromagram(config.clone()),
        }
    }

    pub fn stage(&self) -> Stage {
        match self.params {
            Params::Novelty(_) => Stage::Novelty,
            Params::Tempogram(_) => Stage::Tempogram,
            Params::Beats => Stage::Beats,
            Params::Meter => Stage::Meter,
            Params::Chromagram(_) => Stage::Chromagram,
        }
    }

    pub fn file_stem(&self) -> String {
        let track = &self.track;
        match &self.params {
            Params::Novelty(c) => {
                let mut stem = format!(
                    "{}_novelty_{}_{}-{}-{}-{}",
                    track,
                    c.method,
                    c.n_fft,
                    c.hop,
                    fmt_float(c.gamma),
                    c.local_average
                );
                if let Some(start) = &c.start_marker {
                    stem.push_str("_from-");
                    stem.push_str(start);
                }
                if let Some(end) = &c.end_marker {
                    stem.push_str("_to-");
                    stem.push_str(end);
                }
                stem
            }
            Params::Tempogram(c) => format!(
                "{}_tempogram_{}_{}-{}-{}-{}",
                track, c.method, c.window, c.hop, c.theta_min, c.theta_max
            ),
            Params::Beats => format!("{}_beats", track),
            Params::Meter => format!("{}_meter", track),
            Params::Chromagram(c) => format!(
                "{}_chromagram_metric_{}_{}-{}-{}-{}-{}-{}-{}",
                track,
                c.chroma_type,
                c.hop_length,
                fmt_float(c.bpm_threshold),
                c.aggregate,
                c.accent_mode,
                c.weight_source,
                fmt_float(c.weight_power),
                c.min_frames_per_bin
            ),
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.{}", self.file_stem(), EXTENSION)
    }

    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(self.file_name())
    }

    /// Recovers a key from a file stem. Returns `None` for names no stage
    /// would produce.
    pub fn parse(stem: &str) -> Option<Self> {
        if let Some(track) = stem.strip_suffix("_beats") {
            return Some(ArtifactKey::beats(track));
        }
        if let Some(track) = stem.strip_suffix("_meter") {
            return Some(ArtifactKey::meter(track));
        }
        if let Some(at) = stem.rfind("_chromagram_metric_") {
            let params = Self::parse_chromagram(&stem[at + "_chromagram_metric_".len()..])?;
            return Some(ArtifactKey::chromagram(&stem[..at], &params));
        }
        if let Some(at) = stem.rfind("_tempogram_") {
            let params = Self::parse_tempogram(&stem[at + "_tempogram_".len()..])?;
            return Some(ArtifactKey::tempogram(&stem[..at], &params));
        }
        if let Some(at) = stem.rfind("_novelty_") {
            let params = Self::parse_novelty(&stem[at + "_novelty_".len()..])?;
            return Some(ArtifactKey::novelty(&stem[..at], &params));
        }
        None
    }

    /// Parses the stem of `path`, failing with a format error when the name
    /// is not an artifact of `stage`.
    pub fn from_path(path: &Path, stage: Stage) -> Result<Self> {
        path.file_stem()
            .and_then(|s| s.to_str())
            .and_then(Self::parse)
            .filter(|key| key.stage() == stage)
            .ok_or_else(|| Error::format(path, format!("not a {} artifact name", stage)))
    }

    fn parse_novelty(rest: &str) -> Option<NoveltyConfig> {
        let (rest, end_marker) = match rest.rfind("_to-") {
            Some(at) => (&rest[..at], Some(rest[at + 4..].to_string())),
            None => (rest, None),
        };
        let (rest, start_marker) = match rest.find("_from-") {
            Some(at) => (&rest[..at], Some(rest[at + 6..].to_string())),
            None => (rest, None),
        };

        let (method, fields) = rest.split_once('_')?;
        let [n, h, gamma, m] = parse_fields(fields)?;
        Some(NoveltyConfig {
            method: method.parse().ok()?,
            n_fft: n.parse().ok()?,
            hop: h.parse().ok()?,
            gamma: gamma.parse().ok()?,
            local_average: m.parse().ok()?,
            start_marker,
            end_marker,
        })
    }

    fn parse_tempogram(rest: &str) -> Option<TempogramConfig> {
        let (method, fields) = rest.split_once('_')?;
        let [n, h, tmin, tmax] = parse_fields(fields)?;
        Some(TempogramConfig {
            method: method.parse::<TempogramMethod>().ok()?,
            window: n.parse().ok()?,
            hop: h.parse().ok()?,
            theta_min: tmin.parse().ok()?,
            theta_max: tmax.parse().ok()?,
        })
    }

    fn parse_chromagram(rest: &str) -> Option<ChromagramConfig> {
        let (chroma_type, fields) = rest.split_once('_')?;
        let [hop, bpm, aggregate, accent, source, power, min_frames] = parse_fields(fields)?;
        Some(ChromagramConfig {
            chroma_type: chroma_type.parse::<ChromaType>().ok()?,
            hop_length: hop.parse().ok()?,
            bpm_threshold: bpm.parse().ok()?,
            aggregate: aggregate.parse::<Aggregate>().ok()?,
            accent_mode: accent.parse::<AccentMode>().ok()?,
            weight_source: source.parse::<WeightSource>().ok()?,
            weight_power: power.parse().ok()?,
            min_frames_per_bin: min_frames.parse().ok()?,
        })
    }

    pub fn novelty_method(&self) -> Option<NoveltyMethod> {
        match &self.params {
            Params::Novelty(c) => Some(c.method),
            _ => None,
        }
    }

    pub fn tempogram_method(&self) -> Option<TempogramMethod> {
        match &self.params {
            Params::Tempogram(c) => Some(c.method),
            _ => None,
        }
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_stem())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    pub key: ArtifactKey,
    pub path: PathBuf,
}

/// The artifacts of one stage present on disk, grouped by track and sorted by
/// file name within each track.
#[derive(Clone, Debug, Default)]
pub struct ArtifactIndex {
    by_track: BTreeMap<String, Vec<Entry>>,
}

impl ArtifactIndex {
    /// Scans `dir` for artifacts of `stage`. A missing directory yields an
    /// empty index; files with foreign names are ignored.
    pub fn scan(dir: &Path, stage: Stage) -> Result<Self> {
        let mut index = ArtifactIndex::default();
        let read_dir = match std::fs::read_dir(dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(index),
            Err(e) => return Err(Error::io(dir, e)),
        };

        for entry in read_dir {
            let path = entry.map_err(|e| Error::io(dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            match ArtifactKey::from_path(&path, stage) {
                Ok(key) => index.insert(key, path),
                Err(_) => log::debug!("ignoring {} while indexing {}", path.display(), stage),
            }
        }

        index.sort();
        Ok(index)
    }

    pub fn insert(&mut self, key: ArtifactKey, path: PathBuf) {
        self.by_track
            .entry(key.track.clone())
            .or_default()
            .push(Entry { key, path });
    }

    fn sort(&mut self) {
        for entries in self.by_track.values_mut() {
            entries.sort_by_key(|e| e.key.file_stem());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_track.is_empty()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &str> {
        self.by_track.keys().map(String::as_str)
    }

    /// Every artifact, ordered by track then file name.
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.by_track.values().flatten()
    }

    pub fn get(&self, track: &str) -> &[Entry] {
        self.by_track.get(track).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn first(&self, track: &str) -> Option<&Entry> {
        self.get(track).first()
    }

    pub fn find(&self, key: &ArtifactKey) -> Option<&Entry> {
        self.get(&key.track).iter().find(|e| &e.key == key)
    }

    pub fn contains(&self, key: &ArtifactKey) -> bool {
        self.find(key).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn novelty_name_matches_documented_form() {
        let config = NoveltyConfig {
            method: NoveltyMethod::Energy,
            gamma: 5.0,
            local_average: 0,
            ..Default::default()
        };
        let key = ArtifactKey::novelty("YTB-001", &config);
        assert_eq!(key.file_name(), "YTB-001_novelty_energy_1024-256-5.0-0.npy");
        assert_eq!(
            ArtifactKey::novelty("t", &NoveltyConfig::default()).file_stem(),
            "t_novelty_spectrum_1024-256-100.0-10"
        );
    }

    #[test]
    fn every_stage_parses_back() {
        let keys = [
            ArtifactKey::novelty(
                "my_track",
                &NoveltyConfig {
                    gamma: 0.25,
                    start_marker: Some("HEAD_IN_START".into()),
                    end_marker: Some("END".into()),
                    ..Default::default()
                },
            ),
            ArtifactKey::tempogram(
                "my_track",
                &TempogramConfig {
                    method: TempogramMethod::Cyclic,
                    ..Default::default()
                },
            ),
            ArtifactKey::beats("my_track"),
            ArtifactKey::meter("my_track"),
            ArtifactKey::chromagram("my_track", &ChromagramConfig::default()),
        ];
        for key in keys {
            assert_eq!(ArtifactKey::parse(&key.file_stem()), Some(key.clone()));
        }
    }

    #[test]
    fn chromagram_name() {
        let key = ArtifactKey::chromagram("t", &ChromagramConfig::default());
        assert_eq!(
            key.file_stem(),
            "t_chromagram_metric_cqt_256-180.0-mean-preserve-rms-1.0-2"
        );
    }

    #[test]
    fn any_parameter_changes_the_name() {
        let base = TempogramConfig::default();
        let variants = [
            TempogramConfig { window: 400, ..base.clone() },
            TempogramConfig { hop: 2, ..base.clone() },
            TempogramConfig { theta_min: 30, ..base.clone() },
            TempogramConfig { theta_max: 300, ..base.clone() },
            TempogramConfig { method: TempogramMethod::Autocorr, ..base.clone() },
        ];
        let name = ArtifactKey::tempogram("t", &base).file_stem();
        for v in &variants {
            assert_ne!(ArtifactKey::tempogram("t", v).file_stem(), name);
        }
    }

    #[test]
    fn rejects_foreign_names() {
        assert_eq!(ArtifactKey::parse("readme"), None);
        assert_eq!(ArtifactKey::parse("t_novelty_loud_1-2-3.0-4"), None);
        assert_eq!(ArtifactKey::parse("t_tempogram_fourier_1-2-3"), None);
        assert!(ArtifactKey::from_path(Path::new("/x/t_beats.npy"), Stage::Meter).is_err());
    }

    #[test]
    fn index_groups_by_track_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "b_novelty_spectrum_1024-256-100.0-10.npy",
            "a_novelty_spectrum_1024-256-100.0-10.npy",
            "a_novelty_energy_1024-256-100.0-10.npy",
            "notes.txt",
            "a_beats.npy",
        ] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }

        let index = ArtifactIndex::scan(dir.path(), Stage::Novelty).unwrap();
        assert_eq!(index.tracks().collect::<Vec<_>>(), ["a", "b"]);
        assert_eq!(
            index.first("a").unwrap().key.novelty_method(),
            Some(NoveltyMethod::Energy)
        );
        assert_eq!(index.get("a").len(), 2);
        assert!(index.get("c").is_empty());
    }

    #[test]
    fn missing_dir_is_empty_index() {
        let index = ArtifactIndex::scan(Path::new("/nonexistent/dir"), Stage::Beats).unwrap();
        assert!(index.is_empty());
    }
}
