/*
Batch driver: resolves inputs, skips satisfied artifacts and runs the
remaining units of work in parallel.

Every unit reads its declared inputs, computes, and writes exactly one
artifact named by its [`ArtifactKey`]. Units never read each other's
output within a batch, so they run across files without coordination.
*/

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rayon::prelude::*;
use serde::Serialize;

use crate::artifact::{ArtifactIndex, ArtifactKey, Params, Stage};
use crate::audio::{self, Recording};
use crate::beats;
use crate::chromagram;
use crate::config::{
    BeatsConfig, ChromagramConfig, DataLayout, MeterConfig, NoveltyConfig, TempogramConfig,
    ANALYSIS_SAMPLE_RATE,
};
use crate::error::{Error, Result};
use crate::markers::{MarkerFile, HEAD_IN_START};
use crate::meter;
use crate::novelty;
use crate::npy::Array;
use crate::tempogram::{self, Tempogram, TempogramMethod};

const AUDIO_EXTENSION: &str = "wav";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunOptions {
    /// Resolve and report, but never write.
    pub dry_run: bool,
    /// Recompute artifacts that already exist.
    pub force: bool,
    /// Write a JSON run log next to the derived artifacts.
    pub write_log: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            dry_run: false,
            force: false,
            write_log: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Written,
    CacheHit,
    /// Would be written; only reported in dry runs.
    Planned,
    Skipped,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ItemReport {
    pub track: String,
    pub input: String,
    pub output: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Further artifacts written (or planned) alongside `output`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub companions: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BatchReport {
    pub stage: Stage,
    pub dry_run: bool,
    pub items: Vec<ItemReport>,
}

impl BatchReport {
    fn count(&self, status: ItemStatus) -> usize {
        self.items.iter().filter(|i| i.status == status).count()
    }

    pub fn written(&self) -> usize {
        self.count(ItemStatus::Written)
    }

    pub fn cache_hits(&self) -> usize {
        self.count(ItemStatus::CacheHit)
    }

    pub fn planned(&self) -> usize {
        self.count(ItemStatus::Planned)
    }

    pub fn skipped(&self) -> usize {
        self.count(ItemStatus::Skipped)
    }

    pub fn failed(&self) -> usize {
        self.count(ItemStatus::Failed)
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    /// 0 when nothing failed outright, skips included; 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    pub fn summary(&self) -> String {
        if self.items.is_empty() {
            return format!("{}: nothing to do", self.stage);
        }
        format!(
            "{}: {} item(s), {} written, {} up to date, {} planned, {} skipped, {} failed{}",
            self.stage,
            self.items.len(),
            self.written(),
            self.cache_hits(),
            self.planned(),
            self.skipped(),
            self.failed(),
            if self.dry_run { " [dry run]" } else { "" }
        )
    }
}

#[derive(Serialize)]
struct RunLog<'a> {
    stage: Stage,
    finished_at: u64,
    dry_run: bool,
    written: usize,
    cache_hits: usize,
    skipped: usize,
    failed: usize,
    items: &'a [ItemReport],
}

/// One input and the artifact it produces.
struct Unit {
    track: String,
    input: PathBuf,
    /// Key of the input when it is itself an artifact.
    source: Option<ArtifactKey>,
    key: ArtifactKey,
    /// Parameters the output name does not carry, kept in a record file beside
    /// the output. An existing output only counts as current when they match.
    record: Option<serde_json::Value>,
    /// Artifacts written alongside the output unless they already exist.
    companions: Vec<ArtifactKey>,
}

impl Unit {
    fn report(&self, status: ItemStatus, detail: Option<String>) -> ItemReport {
        ItemReport {
            track: self.track.clone(),
            input: self.input.display().to_string(),
            output: self.key.file_name(),
            status,
            detail,
            companions: Vec::new(),
        }
    }
}

/// The artifact a unit computes and any companions it produced on the way.
struct Output {
    array: Array,
    companions: Vec<(ArtifactKey, Array)>,
}

impl From<Array> for Output {
    fn from(array: Array) -> Self {
        Output {
            array,
            companions: Vec::new(),
        }
    }
}

enum Outcome {
    Written(Vec<String>),
    CacheHit,
    Planned(Vec<String>),
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Writes `array` to `key`'s path in `dir` through a temporary sibling, so a
/// crash never leaves a truncated artifact under the final name.
fn write_artifact(dir: &Path, key: &ArtifactKey, array: &Array) -> Result<PathBuf> {
    let path = key.path_in(dir);
    let tmp = dir.join(format!(".{}.partial", key.file_name()));
    fs::write(&tmp, array.to_bytes()).map_err(|e| Error::io(&tmp, e))?;
    fs::rename(&tmp, &path).map_err(|e| Error::io(&path, e))?;
    Ok(path)
}

fn record_path(dir: &Path, key: &ArtifactKey) -> PathBuf {
    dir.join(format!("{}.params.json", key.file_stem()))
}

fn record_matches(dir: &Path, unit: &Unit) -> bool {
    let expected = match &unit.record {
        Some(expected) => expected,
        None => return true,
    };
    fs::read(record_path(dir, &unit.key))
        .ok()
        .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).ok())
        .map_or(false, |found| &found == expected)
}

fn remove_record(dir: &Path, key: &ArtifactKey) -> Result<()> {
    let path = record_path(dir, key);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(&path, e)),
    }
}

fn write_record(dir: &Path, key: &ArtifactKey, record: &serde_json::Value) -> Result<()> {
    let path = record_path(dir, key);
    let tmp = dir.join(format!(".{}.partial", key.file_stem()));
    let bytes = serde_json::to_vec_pretty(record).map_err(|e| Error::io(&path, e.into()))?;
    fs::write(&tmp, bytes).map_err(|e| Error::io(&tmp, e))?;
    fs::rename(&tmp, &path).map_err(|e| Error::io(&path, e))
}

/// Decodes an input recording at the analysis rate.
fn load_recording(path: &Path) -> Result<Recording> {
    let recording = Recording::load(path, ANALYSIS_SAMPLE_RATE)?;
    log::debug!(
        "{}: {:.2} s decoded from {} Hz",
        recording.track(),
        recording.duration_secs(),
        recording.native_rate()
    );
    Ok(recording)
}

fn read_curve(path: &Path) -> Result<Vec<f64>> {
    let array = Array::read(path)?;
    match array.ndim() {
        1 => Ok(array.into_data()),
        n => Err(Error::format(path, format!("expected a 1-D curve, got {} dimensions", n))),
    }
}

fn read_matrix(path: &Path) -> Result<Vec<Vec<f64>>> {
    let array = Array::read(path)?;
    match array.shape() {
        [_, _] => Ok(array.rows().map(<[f64]>::to_vec).collect()),
        shape => Err(Error::format(path, format!("expected a 2-D array, got shape {:?}", shape))),
    }
}

/// Sorted audio files in the canonical raw-audio directory.
fn list_audio(dir: &Path) -> Result<Vec<PathBuf>> {
    let read_dir = match fs::read_dir(dir) {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io(dir, e)),
    };

    let mut files = Vec::new();
    for entry in read_dir {
        let path = entry.map_err(|e| Error::io(dir, e))?.path();
        if path.extension().and_then(|e| e.to_str()) == Some(AUDIO_EXTENSION) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Explicit artifact inputs, or every artifact of `stage` when none are given.
/// Explicit names that are not artifacts of `stage` fail the batch up front.
fn artifact_inputs(layout: &DataLayout, inputs: &[PathBuf], stage: Stage) -> Result<Vec<(PathBuf, ArtifactKey)>> {
    if inputs.is_empty() {
        let index = ArtifactIndex::scan(&layout.stage_dir(stage), stage)?;
        return Ok(index
            .entries()
            .map(|e| (e.path.clone(), e.key.clone()))
            .collect());
    }
    inputs
        .iter()
        .map(|path| ArtifactKey::from_path(path, stage).map(|key| (path.clone(), key)))
        .collect()
}

fn audio_inputs(layout: &DataLayout, inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    if inputs.is_empty() {
        list_audio(&layout.raw_audio_dir())
    } else {
        Ok(inputs.to_vec())
    }
}

fn log_item(stage: Stage, item: &ItemReport) {
    let detail = item.detail.as_deref().unwrap_or("");
    let outputs = std::iter::once(item.output.as_str())
        .chain(item.companions.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(", ");
    match item.status {
        ItemStatus::Written => log::info!("{} {}: wrote {}", stage, item.track, outputs),
        ItemStatus::CacheHit => log::info!("{} {}: {} is up to date", stage, item.track, item.output),
        ItemStatus::Planned => log::info!("{} {}: would write {}", stage, item.track, outputs),
        ItemStatus::Skipped => log::warn!("{} {}: skipped, {}", stage, item.track, detail),
        ItemStatus::Failed => log::error!("{} {}: failed, {}", stage, item.track, detail),
    }
}

fn write_run_log(layout: &DataLayout, report: &BatchReport) -> Result<PathBuf> {
    let dir = layout.logs_dir();
    fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;

    let finished_at = unix_now();
    let path = dir.join(format!("{}-{}.json", report.stage, finished_at));
    let log = RunLog {
        stage: report.stage,
        finished_at,
        dry_run: report.dry_run,
        written: report.written(),
        cache_hits: report.cache_hits(),
        skipped: report.skipped(),
        failed: report.failed(),
        items: &report.items,
    };
    let file = fs::File::create(&path).map_err(|e| Error::io(&path, e))?;
    serde_json::to_writer_pretty(file, &log).map_err(|e| Error::io(&path, e.into()))?;
    Ok(path)
}

/// Runs `units` of `stage`. `prepare` resolves a unit's dependencies without
/// heavy work, so dry runs classify skips exactly like real runs; `compute`
/// produces the artifact.
fn execute<J, P, C>(
    stage: Stage,
    layout: &DataLayout,
    existing: &ArtifactIndex,
    units: Vec<Unit>,
    opts: &RunOptions,
    prepare: P,
    compute: C,
) -> Result<BatchReport>
where
    P: Fn(&Unit) -> Result<J> + Sync,
    C: Fn(&Unit, J) -> Result<Output> + Sync,
{
    let out_dir = layout.stage_dir(stage);
    if !opts.dry_run && !units.is_empty() {
        fs::create_dir_all(&out_dir).map_err(|e| Error::io(&out_dir, e))?;
    }

    // Only the first unit naming a given artifact runs.
    let mut claimed = HashSet::new();
    let units: Vec<(Unit, bool)> = units
        .into_iter()
        .map(|unit| {
            let first = claimed.insert(unit.key.file_stem());
            (unit, first)
        })
        .collect();

    let run = |unit: &Unit| -> Result<Outcome> {
        fs::metadata(&unit.input).map_err(|e| Error::io(&unit.input, e))?;
        let pending: Vec<&ArtifactKey> = unit
            .companions
            .iter()
            .filter(|key| opts.force || !existing.contains(key))
            .collect();
        if !opts.force
            && pending.is_empty()
            && existing.contains(&unit.key)
            && record_matches(&out_dir, unit)
        {
            return Ok(Outcome::CacheHit);
        }

        let job = prepare(unit)?;
        let companion_names = pending.iter().map(|key| key.file_name()).collect();
        if opts.dry_run {
            return Ok(Outcome::Planned(companion_names));
        }

        let output = compute(unit, job)?;
        for (key, array) in &output.companions {
            if pending.contains(&key) {
                write_artifact(&out_dir, key, array)?;
            }
        }
        if unit.record.is_some() {
            remove_record(&out_dir, &unit.key)?;
        }
        write_artifact(&out_dir, &unit.key, &output.array)?;
        if let Some(record) = &unit.record {
            write_record(&out_dir, &unit.key, record)?;
        }
        Ok(Outcome::Written(companion_names))
    };

    let items: Vec<ItemReport> = units
        .par_iter()
        .map(|(unit, first)| {
            if !first {
                return unit.report(
                    ItemStatus::Skipped,
                    Some(format!("{} is produced by an earlier input", unit.key.file_name())),
                );
            }
            match run(unit) {
                Ok(Outcome::Written(companions)) => ItemReport {
                    companions,
                    ..unit.report(ItemStatus::Written, None)
                },
                Ok(Outcome::CacheHit) => unit.report(ItemStatus::CacheHit, None),
                Ok(Outcome::Planned(companions)) => ItemReport {
                    companions,
                    ..unit.report(ItemStatus::Planned, None)
                },
                Err(e) if e.is_skip() => unit.report(ItemStatus::Skipped, Some(e.to_string())),
                Err(e) => unit.report(ItemStatus::Failed, Some(e.to_string())),
            }
        })
        .collect();

    items.iter().for_each(|item| log_item(stage, item));

    let report = BatchReport {
        stage,
        dry_run: opts.dry_run,
        items,
    };
    log::info!("{}", report.summary());

    if opts.write_log && !opts.dry_run && !report.items.is_empty() {
        match write_run_log(layout, &report) {
            Ok(path) => log::debug!("run log written to {}", path.display()),
            Err(e) => log::warn!("could not write run log: {}", e),
        }
    }
    Ok(report)
}

pub fn run_novelty(
    layout: &DataLayout,
    inputs: &[PathBuf],
    config: &NoveltyConfig,
    opts: &RunOptions,
) -> Result<BatchReport> {
    config.validate()?;
    let stage = Stage::Novelty;
    let existing = ArtifactIndex::scan(&layout.stage_dir(stage), stage)?;

    let units = audio_inputs(layout, inputs)?
        .into_iter()
        .map(|input| {
            let track = audio::track_name(&input);
            Unit {
                key: ArtifactKey::novelty(track.as_str(), config),
                track,
                input,
                source: None,
                record: None,
                companions: Vec::new(),
            }
        })
        .collect();

    execute(
        stage,
        layout,
        &existing,
        units,
        opts,
        |unit| {
            if !config.uses_markers() {
                return Ok((None, None));
            }
            let markers = MarkerFile::load(&layout.marker_file(&unit.track), &unit.track)?;
            markers.region(
                &unit.track,
                config.start_marker.as_deref(),
                config.end_marker.as_deref(),
            )
        },
        |unit, (start, end)| {
            let recording = load_recording(&unit.input)?.crop(start, end);
            let curve = novelty::compute_novelty(recording.samples(), recording.sample_rate(), config)?;
            Ok(Array::from_vec(curve).into())
        },
    )
}

fn tempogram_array(tempogram: &Tempogram) -> Array {
    Array::from_rows(tempogram.rows(), tempogram.num_frames())
}

pub fn run_tempogram(
    layout: &DataLayout,
    inputs: &[PathBuf],
    config: &TempogramConfig,
    opts: &RunOptions,
) -> Result<BatchReport> {
    config.validate()?;
    let stage = Stage::Tempogram;
    let existing = ArtifactIndex::scan(&layout.stage_dir(stage), stage)?;

    // The cyclic tempogram folds the Fourier one, which is kept too.
    let fourier_config = TempogramConfig {
        method: TempogramMethod::Fourier,
        ..config.clone()
    };
    let cyclic = config.method == TempogramMethod::Cyclic;

    let units = artifact_inputs(layout, inputs, Stage::Novelty)?
        .into_iter()
        .map(|(input, source)| {
            let companions = if cyclic {
                vec![ArtifactKey::tempogram(source.track.as_str(), &fourier_config)]
            } else {
                Vec::new()
            };
            Unit {
                track: source.track.clone(),
                key: ArtifactKey::tempogram(source.track.as_str(), config),
                input,
                source: Some(source),
                record: None,
                companions,
            }
        })
        .collect();

    execute(
        stage,
        layout,
        &existing,
        units,
        opts,
        |_| Ok(()),
        |unit, ()| {
            let curve = read_curve(&unit.input)?;
            if !cyclic {
                return Ok(tempogram_array(&tempogram::compute_tempogram(&curve, config)?).into());
            }

            let fourier = tempogram::compute_tempogram(&curve, &fourier_config)?;
            let folded = tempogram::fold_cyclic(&fourier, config.theta_min, config.theta_max);
            Ok(Output {
                array: tempogram_array(&folded),
                companions: vec![(
                    ArtifactKey::tempogram(unit.track.as_str(), &fourier_config),
                    tempogram_array(&fourier),
                )],
            })
        },
    )
}

/// Rebuilds a tempogram with the tempo axis its name describes.
fn load_tempogram(path: &Path, key: &ArtifactKey) -> Result<Tempogram> {
    let params = match &key.params {
        Params::Tempogram(params) => params,
        _ => return Err(Error::format(path, "not a tempogram")),
    };
    let rows = read_matrix(path)?;
    let axis = tempogram::tempo_axis(params);
    if rows.len() != axis.len() {
        return Err(Error::format(
            path,
            format!("{} rows do not match a {}-bin tempo axis", rows.len(), axis.len()),
        ));
    }
    Ok(Tempogram::new(rows, axis))
}

pub fn run_beats(
    layout: &DataLayout,
    inputs: &[PathBuf],
    config: &BeatsConfig,
    opts: &RunOptions,
) -> Result<BatchReport> {
    config.validate()?;
    let stage = Stage::Beats;
    let existing = ArtifactIndex::scan(&layout.stage_dir(stage), stage)?;
    let novelty = ArtifactIndex::scan(&layout.stage_dir(Stage::Novelty), Stage::Novelty)?;

    let mut sources = artifact_inputs(layout, inputs, Stage::Tempogram)?;
    if inputs.is_empty() {
        // A cyclic tempo axis spans a single octave, so linear ones go first.
        sources.sort_by_key(|(_, key)| {
            (key.track.clone(), key.tempogram_method() == Some(TempogramMethod::Cyclic))
        });
    }

    let units = sources
        .into_iter()
        .map(|(input, source)| Unit {
            track: source.track.clone(),
            key: ArtifactKey::beats(source.track.as_str()),
            record: Some(serde_json::json!({
                "tempogram": source.file_name(),
                "config": config,
            })),
            input,
            source: Some(source),
            companions: Vec::new(),
        })
        .collect();

    execute(
        stage,
        layout,
        &existing,
        units,
        opts,
        |unit| {
            let candidates = novelty.get(&unit.track);
            let entry = candidates.first().ok_or_else(|| Error::MismatchedIdentity {
                track: unit.track.clone(),
                stage: Stage::Novelty,
            })?;
            if candidates.len() > 1 {
                log::info!(
                    "{}: {} novelty artifacts, using {}",
                    unit.track,
                    candidates.len(),
                    entry.key
                );
            }
            Ok(entry.path.clone())
        },
        |unit, novelty_path| {
            let source = unit
                .source
                .as_ref()
                .ok_or_else(|| Error::format(&unit.input, "not a tempogram"))?;
            let tempogram = load_tempogram(&unit.input, source)?;
            let curve = read_curve(&novelty_path)?;
            let beats = beats::compute_beats(&curve, &tempogram, config)?;
            Ok(Array::from_vec(beats).into())
        },
    )
}

pub fn run_meter(
    layout: &DataLayout,
    inputs: &[PathBuf],
    config: &MeterConfig,
    opts: &RunOptions,
) -> Result<BatchReport> {
    config.validate()?;
    let stage = Stage::Meter;
    let existing = ArtifactIndex::scan(&layout.stage_dir(stage), stage)?;

    let units = artifact_inputs(layout, inputs, Stage::Beats)?
        .into_iter()
        .map(|(input, source)| Unit {
            track: source.track.clone(),
            key: ArtifactKey::meter(source.track.as_str()),
            record: Some(serde_json::json!({
                "beats": source.file_name(),
                "config": config,
            })),
            input,
            source: Some(source),
            companions: Vec::new(),
        })
        .collect();

    execute(
        stage,
        layout,
        &existing,
        units,
        opts,
        |unit| {
            let markers = MarkerFile::load(&layout.marker_file(&unit.track), &unit.track)?;
            let anchor = markers
                .position(HEAD_IN_START)
                .ok_or_else(|| Error::missing(&unit.track, format!("{} marker", HEAD_IN_START)))?;

            // Meter inference listens to the recording.
            let audio = match config.beats_per_bar {
                Some(_) => None,
                None => {
                    let path = layout.audio_file(&unit.track);
                    if !path.exists() {
                        return Err(Error::missing(
                            &unit.track,
                            format!("raw audio {}", path.display()),
                        ));
                    }
                    Some(path)
                }
            };
            Ok((anchor, audio))
        },
        |unit, (anchor, audio)| {
            let beat_times = read_curve(&unit.input)?;
            let first = meter::anchor_index(&beat_times, anchor).ok_or_else(|| {
                Error::missing(&unit.track, format!("beats at or after {}", HEAD_IN_START))
            })?;

            let beats_per_bar = match (config.beats_per_bar, audio) {
                (Some(n), _) => n,
                (None, Some(path)) => {
                    let recording = load_recording(&path)?;
                    let n = meter::infer_beats_per_bar(
                        &beat_times[first..],
                        recording.samples(),
                        recording.sample_rate(),
                    );
                    log::info!("{}: inferred {} beats per bar", unit.track, n);
                    n
                }
                (None, None) => meter::BEATS_PER_BAR_CANDIDATES[0],
            };

            let grid = meter::label_grid(&beat_times, anchor, beats_per_bar);
            Ok(meter::grid_to_array(&grid).into())
        },
    )
}

pub fn run_chromagram(
    layout: &DataLayout,
    inputs: &[PathBuf],
    config: &ChromagramConfig,
    opts: &RunOptions,
) -> Result<BatchReport> {
    config.validate()?;
    let stage = Stage::Chromagram;
    let existing = ArtifactIndex::scan(&layout.stage_dir(stage), stage)?;
    let meters = ArtifactIndex::scan(&layout.stage_dir(Stage::Meter), Stage::Meter)?;

    let units = audio_inputs(layout, inputs)?
        .into_iter()
        .map(|input| {
            let track = audio::track_name(&input);
            Unit {
                key: ArtifactKey::chromagram(track.as_str(), config),
                track,
                input,
                source: None,
                record: None,
                companions: Vec::new(),
            }
        })
        .collect();

    execute(
        stage,
        layout,
        &existing,
        units,
        opts,
        |unit| {
            meters
                .first(&unit.track)
                .map(|entry| entry.path.clone())
                .ok_or_else(|| Error::MismatchedIdentity {
                    track: unit.track.clone(),
                    stage: Stage::Meter,
                })
        },
        |unit, meter_path| {
            let grid = meter::grid_from_array(&Array::read(&meter_path)?, &meter_path)?;
            let beat_times: Vec<f64> = grid.iter().map(|p| p.time).collect();
            let recording = load_recording(&unit.input)?;
            let chromagram = chromagram::compute_chromagram(
                recording.samples(),
                recording.sample_rate(),
                &beat_times,
                config,
            )?;
            Ok(chromagram.to_array().into())
        },
    )
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CleanReport {
    pub dry_run: bool,
    pub removed: Vec<PathBuf>,
    pub failures: Vec<(PathBuf, String)>,
}

impl CleanReport {
    pub fn exit_code(&self) -> i32 {
        if self.failures.is_empty() {
            0
        } else {
            1
        }
    }
}

/// Empties every derived stage directory and the derived run logs. Raw audio
/// and annotations are never touched.
pub fn clean_derived(layout: &DataLayout, dry_run: bool) -> CleanReport {
    let mut report = CleanReport {
        dry_run,
        ..Default::default()
    };
    let dirs = Stage::ALL
        .iter()
        .map(|&stage| layout.stage_dir(stage))
        .chain(std::iter::once(layout.logs_dir()));

    for dir in dirs {
        let read_dir = match fs::read_dir(&dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                report.failures.push((dir, e.to_string()));
                continue;
            }
        };

        for entry in read_dir {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    report.failures.push((dir.clone(), e.to_string()));
                    continue;
                }
            };
            if dry_run {
                log::info!("would remove {}", path.display());
                report.removed.push(path);
                continue;
            }

            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match removed {
                Ok(()) => {
                    log::debug!("removed {}", path.display());
                    report.removed.push(path);
                }
                Err(e) => {
                    log::error!("could not remove {}: {}", path.display(), e);
                    report.failures.push((path, e.to_string()));
                }
            }
        }
    }

    log::info!(
        "clean derived: {} {} item(s), {} failure(s)",
        if dry_run { "would remove" } else { "removed" },
        report.removed.len(),
        report.failures.len()
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> (tempfile::TempDir, DataLayout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(dir.path());
        (dir, layout)
    }

    fn write_npy(path: &Path, array: &Array) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, array.to_bytes()).unwrap();
    }

    #[test]
    fn invalid_parameters_abort_before_any_work() {
        let (_dir, layout) = layout();
        let config = TempogramConfig {
            theta_min: 300,
            theta_max: 100,
            ..Default::default()
        };
        let err = run_tempogram(&layout, &[], &config, &RunOptions::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
        assert!(!layout.derived_dir().exists());
    }

    #[test]
    fn empty_batch_is_nothing_to_do() {
        let (_dir, layout) = layout();
        let report = run_beats(&layout, &[], &BeatsConfig::default(), &RunOptions::default()).unwrap();
        assert!(report.items.is_empty());
        assert_eq!(report.exit_code(), 0);
        assert!(report.summary().contains("nothing to do"));
        assert!(!layout.logs_dir().exists());
    }

    #[test]
    fn tempogram_from_novelty_then_cache_hit() {
        let (_dir, layout) = layout();
        let curve: Vec<f64> = (0..600).map(|i| if i % 50 == 0 { 1.0 } else { 0.0 }).collect();
        let novelty_key = ArtifactKey::novelty("t", &NoveltyConfig::default());
        write_npy(
            &novelty_key.path_in(&layout.stage_dir(Stage::Novelty)),
            &Array::from_vec(curve),
        );

        let config = TempogramConfig::default();
        let opts = RunOptions::default();
        let first = run_tempogram(&layout, &[], &config, &opts).unwrap();
        assert_eq!(first.written(), 1);

        let path = ArtifactKey::tempogram("t", &config).path_in(&layout.stage_dir(Stage::Tempogram));
        let array = Array::read(&path).unwrap();
        assert_eq!(array.shape(), &[281, 601]);
        let bytes = fs::read(&path).unwrap();

        let second = run_tempogram(&layout, &[], &config, &opts).unwrap();
        assert_eq!(second.cache_hits(), 1);
        assert_eq!(second.written(), 0);

        let forced = run_tempogram(&layout, &[], &config, &RunOptions { force: true, ..opts }).unwrap();
        assert_eq!(forced.written(), 1);
        assert_eq!(fs::read(&path).unwrap(), bytes);
    }

    #[test]
    fn cyclic_also_keeps_fourier() {
        let (_dir, layout) = layout();
        let novelty_key = ArtifactKey::novelty("t", &NoveltyConfig::default());
        write_npy(
            &novelty_key.path_in(&layout.stage_dir(Stage::Novelty)),
            &Array::from_vec(vec![0.5; 300]),
        );

        let config = TempogramConfig {
            method: TempogramMethod::Cyclic,
            ..Default::default()
        };
        let fourier_name = ArtifactKey::tempogram(
            "t",
            &TempogramConfig {
                method: TempogramMethod::Fourier,
                ..config.clone()
            },
        )
        .file_name();

        let dry = RunOptions {
            dry_run: true,
            ..Default::default()
        };
        let plan = run_tempogram(&layout, &[], &config, &dry).unwrap();
        assert_eq!(plan.items[0].companions, vec![fourier_name.clone()]);

        let report = run_tempogram(&layout, &[], &config, &RunOptions::default()).unwrap();
        assert_eq!(report.written(), 1);
        assert_eq!(report.items[0].companions, vec![fourier_name.clone()]);

        let index = ArtifactIndex::scan(&layout.stage_dir(Stage::Tempogram), Stage::Tempogram).unwrap();
        assert_eq!(index.get("t").len(), 2);
        let cyclic = Array::read(&ArtifactKey::tempogram("t", &config).path_in(&layout.stage_dir(Stage::Tempogram))).unwrap();
        assert_eq!(cyclic.shape()[0], tempogram::CYCLIC_BINS_PER_OCTAVE);

        let logs: Vec<PathBuf> = fs::read_dir(layout.logs_dir())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        let json: serde_json::Value = serde_json::from_slice(&fs::read(&logs[0]).unwrap()).unwrap();
        assert_eq!(json["items"][0]["companions"][0], fourier_name.as_str());

        let again = run_tempogram(&layout, &[], &config, &RunOptions::default()).unwrap();
        assert_eq!(again.cache_hits(), 1);
        assert!(again.items[0].companions.is_empty());
    }

    #[test]
    fn cyclic_rebuilds_missing_fourier() {
        let (_dir, layout) = layout();
        write_npy(
            &ArtifactKey::novelty("t", &NoveltyConfig::default()).path_in(&layout.stage_dir(Stage::Novelty)),
            &Array::from_vec(vec![0.5; 300]),
        );
        let config = TempogramConfig {
            method: TempogramMethod::Cyclic,
            ..Default::default()
        };
        run_tempogram(&layout, &[], &config, &RunOptions::default()).unwrap();

        let fourier = ArtifactKey::tempogram(
            "t",
            &TempogramConfig {
                method: TempogramMethod::Fourier,
                ..config.clone()
            },
        )
        .path_in(&layout.stage_dir(Stage::Tempogram));
        fs::remove_file(&fourier).unwrap();

        let report = run_tempogram(&layout, &[], &config, &RunOptions::default()).unwrap();
        assert_eq!(report.written(), 1);
        assert!(fourier.exists());
    }

    #[test]
    fn beats_without_novelty_is_a_skip() {
        let (_dir, layout) = layout();
        let key = ArtifactKey::tempogram("lonely", &TempogramConfig::default());
        write_npy(
            &key.path_in(&layout.stage_dir(Stage::Tempogram)),
            &Array::from_rows(&vec![vec![1.0; 4]; 281], 4),
        );

        let report = run_beats(&layout, &[], &BeatsConfig::default(), &RunOptions::default()).unwrap();
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.exit_code(), 0);
        assert!(!ArtifactKey::beats("lonely")
            .path_in(&layout.stage_dir(Stage::Beats))
            .exists());
    }

    fn beats_inputs(layout: &DataLayout) {
        let curve: Vec<f64> = (0..600).map(|i| if i % 50 == 0 { 1.0 } else { 0.0 }).collect();
        write_npy(
            &ArtifactKey::novelty("t", &NoveltyConfig::default()).path_in(&layout.stage_dir(Stage::Novelty)),
            &Array::from_vec(curve),
        );
        write_npy(
            &ArtifactKey::tempogram("t", &TempogramConfig::default()).path_in(&layout.stage_dir(Stage::Tempogram)),
            &Array::from_rows(&vec![vec![1.0; 4]; 281], 4),
        );
    }

    fn beat_gap(layout: &DataLayout) -> f64 {
        let path = ArtifactKey::beats("t").path_in(&layout.stage_dir(Stage::Beats));
        let beats = Array::read(&path).unwrap();
        beats.data()[1] - beats.data()[0]
    }

    #[test]
    fn beats_rerun_when_parameters_change() {
        let (_dir, layout) = layout();
        beats_inputs(&layout);
        let opts = RunOptions::default();

        let at = |tempo: f64| BeatsConfig {
            tempo: Some(tempo),
            ..Default::default()
        };
        let report = run_beats(&layout, &[], &at(120.0), &opts).unwrap();
        assert_eq!(report.written(), 1);
        assert_relative_eq!(beat_gap(&layout), 0.5, epsilon = 1e-9);

        let report = run_beats(&layout, &[], &at(60.0), &opts).unwrap();
        assert_eq!(report.written(), 1);
        assert_relative_eq!(beat_gap(&layout), 1.0, epsilon = 1e-9);

        let report = run_beats(&layout, &[], &at(60.0), &opts).unwrap();
        assert_eq!(report.cache_hits(), 1);

        let report = run_beats(&layout, &[], &BeatsConfig { factor: 5.0, ..at(60.0) }, &opts).unwrap();
        assert_eq!(report.written(), 1);

        let report = run_beats(&layout, &[], &BeatsConfig { theta_min: 50, factor: 5.0, ..at(60.0) }, &opts).unwrap();
        assert_eq!(report.written(), 1);
    }

    #[test]
    fn beats_prefer_linear_tempogram() {
        let (_dir, layout) = layout();
        beats_inputs(&layout);
        let cyclic = TempogramConfig {
            method: TempogramMethod::Cyclic,
            ..Default::default()
        };
        write_npy(
            &ArtifactKey::tempogram("t", &cyclic).path_in(&layout.stage_dir(Stage::Tempogram)),
            &Array::from_rows(&vec![vec![1.0; 4]; tempogram::CYCLIC_BINS_PER_OCTAVE], 4),
        );

        let report = run_beats(&layout, &[], &BeatsConfig::default(), &RunOptions::default()).unwrap();
        assert_eq!(report.written(), 1);
        assert_eq!(report.skipped(), 1);
        let written = report
            .items
            .iter()
            .find(|item| item.status == ItemStatus::Written)
            .unwrap();
        let fourier = ArtifactKey::tempogram("t", &TempogramConfig::default()).file_name();
        assert!(written.input.ends_with(&fourier), "{}", written.input);
    }

    #[test]
    fn mismatched_tempogram_rows_fail() {
        let (_dir, layout) = layout();
        let tempogram_key = ArtifactKey::tempogram("t", &TempogramConfig::default());
        write_npy(
            &tempogram_key.path_in(&layout.stage_dir(Stage::Tempogram)),
            &Array::from_rows(&vec![vec![1.0; 4]; 10], 4),
        );
        write_npy(
            &ArtifactKey::novelty("t", &NoveltyConfig::default()).path_in(&layout.stage_dir(Stage::Novelty)),
            &Array::from_vec(vec![0.0; 400]),
        );

        let report = run_beats(&layout, &[], &BeatsConfig::default(), &RunOptions::default()).unwrap();
        assert_eq!(report.failed(), 1);
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn meter_without_marker_is_a_skip() {
        let (_dir, layout) = layout();
        write_npy(
            &ArtifactKey::beats("t").path_in(&layout.stage_dir(Stage::Beats)),
            &Array::from_vec(vec![0.5, 1.0, 1.5]),
        );
        let config = MeterConfig { beats_per_bar: Some(4) };
        let report = run_meter(&layout, &[], &config, &RunOptions::default()).unwrap();
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.exit_code(), 0);
        assert!(!layout.stage_dir(Stage::Meter).join("t_meter.npy").exists());
    }

    #[test]
    fn meter_with_marker_and_fixed_bar_length() {
        let (_dir, layout) = layout();
        write_npy(
            &ArtifactKey::beats("t").path_in(&layout.stage_dir(Stage::Beats)),
            &Array::from_vec((0..10).map(|i| i as f64 * 0.5).collect()),
        );
        fs::create_dir_all(layout.markers_dir()).unwrap();
        fs::write(
            layout.marker_file("t"),
            r#"{"markers": [{"name": "HEAD_IN_START", "position": 0.9}]}"#,
        )
        .unwrap();

        let config = MeterConfig { beats_per_bar: Some(3) };
        let report = run_meter(&layout, &[], &config, &RunOptions::default()).unwrap();
        assert_eq!(report.written(), 1);

        let path = ArtifactKey::meter("t").path_in(&layout.stage_dir(Stage::Meter));
        let grid = meter::grid_from_array(&Array::read(&path).unwrap(), &path).unwrap();
        assert_eq!(grid.len(), 8);
        assert_eq!(grid[0].time, 1.0);
        assert_eq!((grid[3].bar, grid[3].beat), (2, 1));

        let again = run_meter(&layout, &[], &config, &RunOptions::default()).unwrap();
        assert_eq!(again.cache_hits(), 1);

        let config = MeterConfig { beats_per_bar: Some(4) };
        let report = run_meter(&layout, &[], &config, &RunOptions::default()).unwrap();
        assert_eq!(report.written(), 1);
        let grid = meter::grid_from_array(&Array::read(&path).unwrap(), &path).unwrap();
        assert_eq!((grid[3].bar, grid[3].beat), (1, 4));
        assert_eq!((grid[4].bar, grid[4].beat), (2, 1));
    }

    #[test]
    fn dry_run_writes_nothing() {
        let (_dir, layout) = layout();
        write_npy(
            &ArtifactKey::novelty("t", &NoveltyConfig::default()).path_in(&layout.stage_dir(Stage::Novelty)),
            &Array::from_vec(vec![0.0; 300]),
        );
        let opts = RunOptions {
            dry_run: true,
            ..Default::default()
        };
        let report = run_tempogram(&layout, &[], &TempogramConfig::default(), &opts).unwrap();
        assert_eq!(report.planned(), 1);
        assert!(!layout.stage_dir(Stage::Tempogram).exists());
        assert!(!layout.logs_dir().exists());
    }

    #[test]
    fn missing_explicit_input_fails() {
        let (dir, layout) = layout();
        let missing = dir.path().join("gone.wav");
        let report = run_novelty(&layout, &[missing], &NoveltyConfig::default(), &RunOptions::default()).unwrap();
        assert_eq!(report.failed(), 1);
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn run_log_is_written() {
        let (_dir, layout) = layout();
        write_npy(
            &ArtifactKey::novelty("t", &NoveltyConfig::default()).path_in(&layout.stage_dir(Stage::Novelty)),
            &Array::from_vec(vec![0.0; 300]),
        );
        run_tempogram(&layout, &[], &TempogramConfig::default(), &RunOptions::default()).unwrap();

        let logs: Vec<PathBuf> = fs::read_dir(layout.logs_dir())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(logs.len(), 1);
        let json: serde_json::Value = serde_json::from_slice(&fs::read(&logs[0]).unwrap()).unwrap();
        assert_eq!(json["stage"], "tempogram");
        assert_eq!(json["items"][0]["status"], "written");
    }

    #[test]
    fn clean_spares_inputs() {
        let (_dir, layout) = layout();
        write_npy(
            &ArtifactKey::beats("t").path_in(&layout.stage_dir(Stage::Beats)),
            &Array::from_vec(vec![1.0]),
        );
        fs::create_dir_all(layout.logs_dir()).unwrap();
        fs::write(layout.logs_dir().join("beats-1.json"), "{}").unwrap();
        fs::create_dir_all(layout.raw_audio_dir()).unwrap();
        fs::write(layout.raw_audio_dir().join("t.wav"), b"RIFF").unwrap();

        let preview = clean_derived(&layout, true);
        assert_eq!(preview.removed.len(), 2);
        assert!(layout.stage_dir(Stage::Beats).join("t_beats.npy").exists());

        let report = clean_derived(&layout, false);
        assert_eq!(report.removed.len(), 2);
        assert_eq!(report.exit_code(), 0);
        assert!(!layout.stage_dir(Stage::Beats).join("t_beats.npy").exists());
        assert!(layout.raw_audio_dir().join("t.wav").exists());
    }
}
