//! Streaming wake-word detector: stdin PCM in, detection events out.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use nix::sys::signal::Signal;

use voz::detector::ModelSpec;
use voz::dsp::DspConfig;
use voz::features::{self, FeatureStageConfig, AUDIO_BUFFER_SIZE};
use voz::input::{AudioSource, InputConfig, InputProcessor};
use voz::output::{prediction_line, ready_line, OutputFormat};
use voz::rollbuf::SyncRollBuffer;
use voz::sigpipe::{SignalEvent, SignalPipe};
use voz::{detector, WakeWordPrediction};

const PREDICTION_QUEUE: usize = 32;
const MAIN_POLL: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "voz-oww", version, about = "Streaming wake-word detector")]
struct Args {
    /// Input stream format
    #[arg(long, default_value = "raw")]
    audio: AudioSource,

    /// Event output format
    #[arg(long, default_value = "json")]
    output: OutputFormat,

    /// Pace input to wall-clock audio time (file playback)
    #[arg(long)]
    sync: bool,

    /// Pre-amplification factor
    #[arg(long, default_value_t = 1.0)]
    preamp: f32,

    /// Noise suppression level, 0 (off) to 4
    #[arg(long, default_value_t = 0)]
    noiser: u8,

    /// Auto-gain target, 0 (off) to 31
    #[arg(long, default_value_t = 0)]
    autogain: u8,

    /// Directory holding the mel and embedding base models
    #[arg(long, default_value = "models")]
    modelsdir: PathBuf,

    /// Stop after N frames and log the realtime factor
    #[arg(long)]
    bench: Option<u64>,

    /// Wake-word models: path[:name[:threshold[:patience]]]
    #[arg(required = true, value_name = "MODELSPEC")]
    models: Vec<String>,
}

fn emit(line: &str) -> Result<()> {
    let mut out = std::io::stdout().lock();
    writeln!(out, "{}", line)?;
    out.flush()?;
    Ok(())
}

fn run(args: Args) -> Result<()> {
    let specs = args
        .models
        .iter()
        .map(|m| ModelSpec::parse(m))
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("bad model spec")?;

    let dsp = DspConfig {
        preamp: args.preamp,
        noise_level: args.noiser,
        autogain: args.autogain,
        vad: false,
    }
    .clamped();

    let predictions = Arc::new(SyncRollBuffer::<WakeWordPrediction>::new(
        PREDICTION_QUEUE,
        false,
    ));
    let (wake_handle, wake_rx) = detector::spawn(specs, Arc::clone(&predictions));
    let features_buf = wake_rx
        .recv()
        .context("wake-word stage died during setup")?
        .context("loading wake-word models")?;

    let audio_buf = Arc::new(SyncRollBuffer::<i16>::new(AUDIO_BUFFER_SIZE, false));
    let stage_cfg = FeatureStageConfig {
        mel_model: args.modelsdir.join("melspectrogram.tflite"),
        embedding_model: args.modelsdir.join("embedding_model.tflite"),
    };
    let (features_handle, features_rx) =
        features::spawn(stage_cfg, Arc::clone(&audio_buf), features_buf);
    features_rx
        .recv()
        .context("feature stage died during setup")?
        .context("loading base models")?;

    let input = InputProcessor::new(
        InputConfig {
            source: args.audio,
            sync: args.sync,
            dsp,
            bench_frames: args.bench,
        },
        Arc::clone(&audio_buf),
    );
    let control = input.control();
    let capture_handle = input.spawn();

    let signals = SignalPipe::install(&[Signal::SIGINT, Signal::SIGTERM, Signal::SIGUSR1])
        .context("installing signal handlers")?;

    emit(&ready_line(args.output, true))?;

    loop {
        for ev in signals.drain() {
            match ev {
                SignalEvent::Stop => control.stop(),
                SignalEvent::Reset => control.reset(),
                SignalEvent::ChildExited => {}
            }
        }
        let mut guard = predictions.wait_at_least_timeout(1, MAIN_POLL);
        let status = guard.status();
        let batch: Vec<WakeWordPrediction> = guard.get().to_vec();
        guard.shift(batch.len());
        if status.reset {
            guard.release_and_signal();
        } else {
            guard.release();
        }
        for p in &batch {
            emit(&prediction_line(args.output, p))?;
        }
        if status.cancel && batch.is_empty() {
            break;
        }
    }

    emit(&ready_line(args.output, false))?;

    // teardown flows upstream to downstream
    control.stop();
    capture_handle.join().ok();
    features_handle.join().ok();
    wake_handle.join().ok();
    Ok(())
}

fn main() {
    env_logger::init();
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = match e.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };
    if let Err(e) = run(args) {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}
