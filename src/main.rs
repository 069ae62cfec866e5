use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use dijon::chromagram::{AccentMode, Aggregate, ChromaType, WeightSource};
use dijon::novelty::NoveltyMethod;
use dijon::pipeline::{self, BatchReport};
use dijon::tempogram::TempogramMethod;
use dijon::{
    BeatsConfig, ChromagramConfig, DataLayout, Error, MeterConfig, NoveltyConfig, RunOptions,
    TempogramConfig,
};

/// Rhythm and harmony features for a corpus of recordings, one stage at a time.
#[derive(Parser, Debug)]
#[command(name = "dijon", version)]
struct Cli {
    /// Root of the data tree (raw/, annotations/, derived/, logs/).
    #[arg(long, global = true, default_value = "data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Report what would be done without writing anything.
    #[arg(long)]
    dry_run: bool,

    /// Recompute artifacts that already exist.
    #[arg(long)]
    force: bool,

    /// Do not write a run log.
    #[arg(long)]
    no_log: bool,
}

impl RunArgs {
    fn options(&self) -> RunOptions {
        RunOptions {
            dry_run: self.dry_run,
            force: self.force,
            write_log: !self.no_log,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Onset novelty curves from raw audio.
    Novelty {
        /// Audio files. Defaults to every .wav under raw/audio.
        files: Vec<PathBuf>,
        #[arg(long = "type", default_value_t = NoveltyMethod::Spectrum)]
        method: NoveltyMethod,
        /// STFT window length in samples.
        #[arg(long = "n", default_value_t = 1024)]
        n_fft: usize,
        /// STFT hop in samples.
        #[arg(long = "h", default_value_t = 256)]
        hop: usize,
        #[arg(long, default_value_t = 100.0)]
        gamma: f64,
        /// Half-width of the subtracted local average, in frames.
        #[arg(long = "m", default_value_t = 10)]
        local_average: usize,
        /// Start analysis at this marker.
        #[arg(long)]
        start_marker: Option<String>,
        /// End analysis at this marker.
        #[arg(long)]
        end_marker: Option<String>,
        #[command(flatten)]
        run: RunArgs,
    },

    /// Tempograms from novelty curves.
    Tempogram {
        /// Novelty artifacts. Defaults to all of them.
        files: Vec<PathBuf>,
        #[arg(long = "type", default_value_t = TempogramMethod::Fourier)]
        method: TempogramMethod,
        /// Window length in novelty frames.
        #[arg(long = "n", default_value_t = 500)]
        window: usize,
        /// Hop in novelty frames.
        #[arg(long = "h", default_value_t = 1)]
        hop: usize,
        #[arg(long, default_value_t = 40)]
        theta_min: u32,
        #[arg(long, default_value_t = 320)]
        theta_max: u32,
        #[command(flatten)]
        run: RunArgs,
    },

    /// Beat instants from tempograms and their novelty curves.
    Beats {
        /// Tempogram artifacts. Defaults to all of them.
        files: Vec<PathBuf>,
        #[arg(long, default_value_t = 1.0)]
        factor: f64,
        #[arg(long, default_value_t = 40)]
        theta_min: u32,
        #[arg(long, default_value_t = 320)]
        theta_max: u32,
        /// Track at this tempo instead of estimating one.
        #[arg(long)]
        tempo: Option<f64>,
        #[command(flatten)]
        run: RunArgs,
    },

    /// Bar and beat numbering anchored on the HEAD_IN_START marker.
    Meter {
        /// Beats artifacts. Defaults to all of them.
        files: Vec<PathBuf>,
        /// Inferred from the audio when omitted.
        #[arg(long)]
        beats_per_bar: Option<u32>,
        #[command(flatten)]
        run: RunArgs,
    },

    /// Beat-synchronous chromagrams from raw audio and meter grids.
    Chromagram {
        /// Audio files. Defaults to every .wav under raw/audio.
        files: Vec<PathBuf>,
        #[arg(long, default_value_t = ChromaType::Cqt)]
        chroma_type: ChromaType,
        #[arg(long, default_value_t = 180.0)]
        bpm_threshold: f64,
        #[arg(long, default_value_t = Aggregate::Mean)]
        aggregate: Aggregate,
        #[arg(long, default_value_t = AccentMode::Preserve)]
        accent_mode: AccentMode,
        #[arg(long, default_value_t = WeightSource::Rms)]
        weight_source: WeightSource,
        #[arg(long, default_value_t = 1.0)]
        weight_power: f64,
        /// Chroma frame hop in samples.
        #[arg(long, default_value_t = 256)]
        hop_length: usize,
        #[arg(long, default_value_t = 2)]
        min_frames_per_bin: usize,
        #[command(flatten)]
        run: RunArgs,
    },

    /// Remove generated files.
    Clean {
        #[command(subcommand)]
        target: CleanTarget,
    },
}

#[derive(Subcommand, Debug)]
enum CleanTarget {
    /// Every derived artifact and run log. Raw audio and annotations are kept.
    Derived {
        #[arg(long)]
        dry_run: bool,
    },
}

fn finish(report: BatchReport) -> i32 {
    println!("{}", report.summary());
    report.exit_code()
}

fn run(cli: Cli) -> Result<i32> {
    let layout = DataLayout::new(cli.data_dir);

    let code = match cli.command {
        Command::Novelty {
            files,
            method,
            n_fft,
            hop,
            gamma,
            local_average,
            start_marker,
            end_marker,
            run,
        } => {
            let config = NoveltyConfig {
                method,
                n_fft,
                hop,
                gamma,
                local_average,
                start_marker,
                end_marker,
            };
            finish(pipeline::run_novelty(&layout, &files, &config, &run.options()).context("novelty")?)
        }
        Command::Tempogram {
            files,
            method,
            window,
            hop,
            theta_min,
            theta_max,
            run,
        } => {
            let config = TempogramConfig {
                method,
                window,
                hop,
                theta_min,
                theta_max,
            };
            finish(pipeline::run_tempogram(&layout, &files, &config, &run.options()).context("tempogram")?)
        }
        Command::Beats {
            files,
            factor,
            theta_min,
            theta_max,
            tempo,
            run,
        } => {
            let config = BeatsConfig {
                factor,
                theta_min,
                theta_max,
                tempo,
            };
            finish(pipeline::run_beats(&layout, &files, &config, &run.options()).context("beats")?)
        }
        Command::Meter {
            files,
            beats_per_bar,
            run,
        } => {
            let config = MeterConfig { beats_per_bar };
            finish(pipeline::run_meter(&layout, &files, &config, &run.options()).context("meter")?)
        }
        Command::Chromagram {
            files,
            chroma_type,
            bpm_threshold,
            aggregate,
            accent_mode,
            weight_source,
            weight_power,
            hop_length,
            min_frames_per_bin,
            run,
        } => {
            let config = ChromagramConfig {
                chroma_type,
                hop_length,
                bpm_threshold,
                aggregate,
                accent_mode,
                weight_source,
                weight_power,
                min_frames_per_bin,
            };
            finish(pipeline::run_chromagram(&layout, &files, &config, &run.options()).context("chromagram")?)
        }
        Command::Clean {
            target: CleanTarget::Derived { dry_run },
        } => {
            let report = pipeline::clean_derived(&layout, dry_run);
            println!(
                "clean derived: {} {} item(s), {} failure(s)",
                if dry_run { "would remove" } else { "removed" },
                report.removed.len(),
                report.failures.len()
            );
            report.exit_code()
        }
    };
    Ok(code)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let code = match run(Cli::parse()) {
        Ok(code) => code,
        Err(err) => {
            log::error!("{:#}", err);
            match err.downcast_ref::<Error>() {
                Some(Error::InvalidParameter(_)) => 2,
                _ => 1,
            }
        }
    };
    process::exit(code);
}
