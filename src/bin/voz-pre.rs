//! Audio preprocessor: stdin PCM in, cleaned PCM out, one chunk at a time.
//! With `--vad` every output chunk is prefixed by the packed VAD byte.

use std::io::{Read, Write};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;

use voz::dsp::{AudioProcessor, DspConfig};
use voz::input::AudioSource;
use voz::output::OutputFormat;
use voz::wav::{WavHeader, WAV_HEADER_LEN};
use voz::CHUNK_SIZE;

const CHUNK_BYTES: usize = CHUNK_SIZE * 2;
const TIMING_LOG_EVERY: u64 = 100;

#[derive(Parser)]
#[command(name = "voz-pre", version, about = "Streaming audio preprocessor")]
struct Args {
    /// Input stream format
    #[arg(long, default_value = "raw")]
    audio: AudioSource,

    /// Accepted for interface parity with voz-oww; the stream is binary
    #[arg(long, default_value = "machine", hide = true)]
    #[allow(dead_code)]
    output: OutputFormat,

    /// Pre-amplification factor
    #[arg(long, default_value_t = 1.0)]
    preamp: f32,

    /// Noise suppression level, 0 (off) to 4
    #[arg(long, default_value_t = 0)]
    noiser: u8,

    /// Auto-gain target, 0 (off) to 31
    #[arg(long, default_value_t = 0)]
    autogain: u8,

    /// Prefix every output chunk with its VAD byte
    #[arg(long)]
    vad: bool,

    /// Log per-chunk processing time
    #[arg(long)]
    timming: bool,
}

/// Fill `buf` completely; Ok(false) on clean EOF at a chunk boundary.
fn read_chunk(input: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = input.read(&mut buf[filled..]).context("read stdin")?;
        if n == 0 {
            if filled > 0 {
                log::debug!("dropping {} trailing bytes of a partial chunk", filled);
            }
            return Ok(false);
        }
        filled += n;
    }
    Ok(true)
}

fn run(args: Args) -> Result<()> {
    let dsp_cfg = DspConfig {
        preamp: args.preamp,
        noise_level: args.noiser,
        autogain: args.autogain,
        vad: args.vad,
    }
    .clamped();
    let mut dsp = AudioProcessor::from_config(&dsp_cfg);

    let stdin = std::io::stdin();
    let mut input = stdin.lock();
    let stdout = std::io::stdout();
    let mut output = stdout.lock();

    if args.audio == AudioSource::Wav {
        let mut raw = [0u8; WAV_HEADER_LEN];
        input.read_exact(&mut raw).context("read wav header")?;
        let header = WavHeader::parse(&raw);
        header.check_compatible()?;
    }

    let mut bytes = [0u8; CHUNK_BYTES];
    let mut chunk = [0i16; CHUNK_SIZE];
    let mut chunks: u64 = 0;
    let mut busy_us: u64 = 0;

    while read_chunk(&mut input, &mut bytes)? {
        for (i, s) in chunk.iter_mut().enumerate() {
            *s = i16::from_le_bytes([bytes[2 * i], bytes[2 * i + 1]]);
        }

        let started = Instant::now();
        let vad_byte = match dsp.as_mut() {
            Some(p) => p.process_chunk(&mut chunk)?,
            None => 0,
        };
        if args.timming {
            let us = started.elapsed().as_micros() as u64;
            busy_us += us;
            log::debug!("chunk {} processed in {}us", chunks, us);
        }

        for (i, &s) in chunk.iter().enumerate() {
            bytes[2 * i..2 * i + 2].copy_from_slice(&s.to_le_bytes());
        }
        if args.vad {
            output.write_all(&[vad_byte]).context("write vad byte")?;
        }
        output.write_all(&bytes).context("write chunk")?;
        output.flush().context("flush chunk")?;

        chunks += 1;
        if args.timming && chunks % TIMING_LOG_EVERY == 0 {
            log::info!(
                "{} chunks, avg {}us per 80ms chunk",
                chunks,
                busy_us / chunks
            );
        }
    }

    if args.timming && chunks > 0 {
        log::info!(
            "done: {} chunks, avg {}us per 80ms chunk",
            chunks,
            busy_us / chunks
        );
    }
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
