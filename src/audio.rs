/*
Audio decoding, mono mixdown and conversion to the analysis rate.
*/

use std::path::Path;

use symphonia::core::{
    audio::SampleBuffer,
    codecs::{self, DecoderOptions},
    errors::Error as SymphoniaError,
    formats::FormatOptions,
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};

use crate::dsp::rateconversion;
use crate::error::{Error, Result};

/// A mono recording at a fixed sample rate.
#[derive(Debug, Clone)]
pub struct Recording {
    track: String,
    samples: Vec<f64>,
    sample_rate: u32,
    native_rate: u32,
}

impl Recording {
    pub fn new(track: impl Into<String>, samples: Vec<f64>, sample_rate: u32) -> Self {
        Recording {
            track: track.into(),
            samples,
            sample_rate,
            native_rate: sample_rate,
        }
    }

    /// Decodes `path`, mixes it down to mono and resamples it to `target_rate`.
    pub fn load(path: &Path, target_rate: u32) -> Result<Self> {
        let track = track_name(path);
        let (samples, native_rate) = decode_mono(path)?;
        log::debug!(
            "decoded {}: {} samples at {} Hz",
            path.display(),
            samples.len(),
            native_rate
        );

        let samples = rateconversion::resample(&samples, native_rate, target_rate)?;
        Ok(Recording {
            track,
            samples,
            sample_rate: target_rate,
            native_rate,
        })
    }

    pub fn track(&self) -> &str {
        &self.track
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn native_rate(&self) -> u32 {
        self.native_rate
    }

    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Keeps only `[start, end)` seconds. Bounds are clamped to the recording.
    pub fn crop(mut self, start: Option<f64>, end: Option<f64>) -> Self {
        let to_index = |secs: f64| {
            ((secs.max(0.0) * self.sample_rate as f64) as usize).min(self.samples.len())
        };
        let first = start.map(to_index).unwrap_or(0);
        let last = end.map(to_index).unwrap_or(self.samples.len()).max(first);
        self.samples.truncate(last);
        self.samples.drain(..first);
        self
    }
}

/// The file stem, which identifies a track across every stage.
pub fn track_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn decode_error(path: &Path, reason: impl ToString) -> Error {
    Error::Decode {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Decodes the first audio track of `path` to mono `f64` samples.
fn decode_mono(path: &Path) -> Result<(Vec<f64>, u32)> {
    let src = std::fs::File::open(path).map_err(|e| Error::io(path, e))?;
    let mss = MediaSourceStream::new(Box::new(src), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let meta_opts: MetadataOptions = Default::default();
    let fmt_opts: FormatOptions = Default::default();
    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &fmt_opts, &meta_opts)
        .map_err(|e| decode_error(path, e))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != codecs::CODEC_TYPE_NULL)
        .ok_or_else(|| decode_error(path, "no supported audio tracks"))?;

    let dec_opts: DecoderOptions = Default::default();
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &dec_opts)
        .map_err(|e| decode_error(path, e))?;

    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate;
    let mut sample_buf: Option<SampleBuffer<f32>> = None;
    let mut mono = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            // Symphonia reports end of stream as an IO error.
            Err(SymphoniaError::IoError(_)) => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(err) => return Err(decode_error(path, err)),
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                sample_rate.get_or_insert(spec.rate);

                let buf = sample_buf.get_or_insert_with(|| {
                    SampleBuffer::<f32>::new(decoded.capacity() as u64, spec)
                });

                let channel_count = spec.channels.count().max(1);
                buf.copy_interleaved_ref(decoded);
                mono.extend(
                    buf.samples()
                        .chunks_exact(channel_count)
                        .map(|x| x.iter().map(|&s| s as f64).sum::<f64>() / channel_count as f64),
                );
            }
            // Corrupt or truncated packets are skipped.
            Err(SymphoniaError::IoError(_)) | Err(SymphoniaError::DecodeError(_)) => continue,
            Err(err) => return Err(decode_error(path, err)),
        }
    }

    let sample_rate = sample_rate.ok_or_else(|| decode_error(path, "unknown sample rate"))?;
    Ok((mono, sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crop_clamps_to_bounds() {
        let rec = Recording::new("t", (0..100).map(|i| i as f64).collect(), 10);
        let cropped = rec.clone().crop(Some(2.0), Some(5.0));
        assert_eq!(cropped.samples().len(), 30);
        assert_eq!(cropped.samples()[0], 20.0);

        let cropped = rec.clone().crop(Some(-1.0), Some(50.0));
        assert_eq!(cropped.samples().len(), 100);

        let cropped = rec.crop(Some(8.0), Some(3.0));
        assert!(cropped.samples().is_empty());
    }

    #[test]
    fn track_name_is_stem() {
        assert_eq!(track_name(Path::new("/a/b/YTB-001.wav")), "YTB-001");
    }

    #[test]
    fn decodes_and_resamples_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("YTB-042.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 48000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..48000 {
            let s = ((i as f64 * 2.0 * std::f64::consts::PI * 440.0 / 48000.0).sin() * 8000.0) as i16;
            writer.write_sample(s).unwrap();
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();

        let rec = Recording::load(&path, 22050).unwrap();
        assert_eq!(rec.track(), "YTB-042");
        assert_eq!(rec.native_rate(), 48000);
        assert_eq!(rec.sample_rate(), 22050);
        assert_relative_eq!(rec.duration_secs(), 1.0, epsilon = 1e-3);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = Recording::load(Path::new("/nonexistent/x.wav"), 22050).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }
}
