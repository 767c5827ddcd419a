//! Capture side of the detector pipeline: poll a descriptor for PCM bytes,
//! cut them into 80ms chunks, run the DSP chain in place and hand the chunks
//! to the audio roll-buffer.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};

use crate::dsp::{AudioProcessor, DspConfig};
use crate::error::{Result, VozError};
use crate::rollbuf::SyncRollBuffer;
use crate::wav::{WavHeader, WAV_HEADER_LEN};
use crate::{CHUNK_SIZE, CHUNK_TIME_MS, FRAME_CHUNKS};

const CHUNK_BYTES: usize = CHUNK_SIZE * 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioSource {
    Raw,
    Wav,
}

impl std::str::FromStr for AudioSource {
    type Err = VozError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "raw" => Ok(AudioSource::Raw),
            "wav" => Ok(AudioSource::Wav),
            other => Err(VozError::Config(format!("unknown audio source '{other}'"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InputConfig {
    pub source: AudioSource,
    /// Pace chunk delivery to wall-clock audio time (file playback).
    pub sync: bool,
    pub dsp: DspConfig,
    /// Stop after this many 320ms frames and log the realtime factor.
    pub bench_frames: Option<u64>,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            source: AudioSource::Raw,
            sync: false,
            dsp: DspConfig::default(),
            bench_frames: None,
        }
    }
}

struct Flags {
    stop: AtomicBool,
    reset: AtomicBool,
}

/// Handle for poking the capture loop from another thread.
#[derive(Clone)]
pub struct CaptureControl {
    flags: Arc<Flags>,
}

impl CaptureControl {
    pub fn stop(&self) {
        self.flags.stop.store(true, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.flags.reset.store(true, Ordering::Relaxed);
    }
}

pub struct InputProcessor {
    cfg: InputConfig,
    flags: Arc<Flags>,
    output: Arc<SyncRollBuffer<i16>>,
}

impl InputProcessor {
    pub fn new(cfg: InputConfig, output: Arc<SyncRollBuffer<i16>>) -> Self {
        Self {
            cfg,
            flags: Arc::new(Flags {
                stop: AtomicBool::new(false),
                reset: AtomicBool::new(false),
            }),
            output,
        }
    }

    pub fn control(&self) -> CaptureControl {
        CaptureControl {
            flags: Arc::clone(&self.flags),
        }
    }

    /// Run the capture loop on stdin in its own thread.
    pub fn spawn(self) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("capture".into())
            .spawn(move || self.run(0))
            .expect("spawn capture thread")
    }

    /// The capture loop. Public so tests can drive it over a pipe.
    pub fn run(mut self, fd: RawFd) {
        if let Err(e) = self.capture_loop(fd) {
            log::error!("capture: {}", e);
        }
        self.output.cancel();
    }

    fn capture_loop(&mut self, fd: RawFd) -> Result<()> {
        if self.cfg.source == AudioSource::Wav {
            let mut raw = [0u8; WAV_HEADER_LEN];
            read_exact_fd(fd, &mut raw)?;
            let header = WavHeader::parse(&raw);
            header.check_compatible()?;
            log::debug!("wav stream, {} samples declared", header.num_samples());
        }

        let mut dsp = AudioProcessor::from_config(&self.cfg.dsp);
        if dsp.is_some() {
            log::info!(
                "dsp active: preamp={} noiser={} autogain={} vad={}",
                self.cfg.dsp.preamp,
                self.cfg.dsp.noise_level,
                self.cfg.dsp.autogain,
                self.cfg.dsp.vad
            );
        }

        let chunk_time = Duration::from_millis(CHUNK_TIME_MS);
        let bench_chunks = self.cfg.bench_frames.map(|f| f * FRAME_CHUNKS as u64);
        let started = Instant::now();
        let mut last_chunk = Instant::now();
        let mut bytes = [0u8; CHUNK_BYTES];
        let mut chunk = [0i16; CHUNK_SIZE];
        let mut filled = 0usize;
        let mut chunks: u64 = 0;
        let mut overruns: u64 = 0;

        loop {
            if self.flags.stop.load(Ordering::Relaxed) {
                break;
            }
            if self.flags.reset.swap(false, Ordering::Relaxed) {
                // discard the partial chunk along with the buffered audio
                filled = 0;
                self.output.reset();
            }

            let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
            let n = match poll(&mut fds, CHUNK_TIME_MS as i32) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                continue; // timeout, re-check flags
            }

            let got = match nix::unistd::read(fd, &mut bytes[filled..]) {
                Ok(got) => got,
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => continue,
                Err(e) => return Err(e.into()),
            };
            if got == 0 {
                break; // EOF
            }
            filled += got;
            if filled < CHUNK_BYTES {
                continue;
            }
            filled = 0;

            for (i, s) in chunk.iter_mut().enumerate() {
                *s = i16::from_le_bytes([bytes[2 * i], bytes[2 * i + 1]]);
            }
            if let Some(p) = dsp.as_mut() {
                p.process_chunk(&mut chunk)?;
            }
            if self.output.append(&chunk) > 0 {
                overruns += 1;
            }
            chunks += 1;

            if self.cfg.sync {
                let elapsed = last_chunk.elapsed();
                let budget = chunk_time
                    .saturating_sub(elapsed)
                    .saturating_sub(Duration::from_micros(1));
                if !budget.is_zero() {
                    std::thread::sleep(budget);
                }
                last_chunk = Instant::now();
            }

            if let Some(limit) = bench_chunks {
                if chunks >= limit {
                    let wall = started.elapsed().as_secs_f64();
                    let audio = chunks as f64 * CHUNK_TIME_MS as f64 / 1000.0;
                    log::info!(
                        "bench: {:.2}s audio in {:.2}s wall ({:.2}x realtime)",
                        audio,
                        wall,
                        audio / wall.max(f64::EPSILON)
                    );
                    break;
                }
            }
        }

        log::debug!("capture done: {} chunks, {} overruns", chunks, overruns);
        Ok(())
    }
}

/// Fill `buf` from `fd`, polling between short reads. EOF before the buffer
/// is full is an error.
pub fn read_exact_fd(fd: RawFd, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0usize;
    while filled < buf.len() {
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, CHUNK_TIME_MS as i32) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
        match nix::unistd::read(fd, &mut buf[filled..]) {
            Ok(0) => {
                return Err(VozError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream ended mid-record",
                )))
            }
            Ok(n) => filled += n,
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
