//! The bridge's control plane: one poll loop multiplexing the UART, the
//! signal pipe and the supervised child's stdout/stderr, plus the
//! Idle/WakeWord/Preprocessor state machine commanded over the wire.

use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use serialport::TTYPort;

use crate::error::{Result, VozError};
use crate::gpio::{GpioCmd, GpioController, LineSpec};
use crate::sigpipe::{SignalEvent, SignalPipe};
use crate::CHUNK_SIZE;

use super::catalog::Catalog;
use super::child::{ChildOutput, Supervisor};
use super::event::{AudioConfPayload, Event, StatusPayload, WwConfPayload, WwMatchPayload};
use super::frame::{encode, FrameReader};

pub const BAUD_RATE: u32 = 576_000;
pub const READ_TIMEOUT: Duration = Duration::from_millis(200);
const POLL_TIMEOUT_MS: i32 = 500;
const WATCHDOG_PERIOD: Duration = Duration::from_secs(30);
const CHILD_SETTLE: Duration = Duration::from_millis(750);
const CHUNK_BYTES: usize = CHUNK_SIZE * 2;

pub const EXIT_OK: i32 = 0;
pub const EXIT_RESTART: i32 = 1;
pub const EXIT_RESTART_RETRY: i32 = 2;
pub const EXIT_FATAL: i32 = 5;
pub const EXIT_REQUESTED: i32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    Idle = 0,
    WakeWord = 1,
    Preprocessor = 2,
}

impl TryFrom<u8> for Mode {
    type Error = VozError;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Mode::Idle),
            1 => Ok(Mode::WakeWord),
            2 => Ok(Mode::Preprocessor),
            other => Err(VozError::Config(format!("unknown mode {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub device: String,
    pub ww_model_dir: PathBuf,
    pub base_model_dir: PathBuf,
    pub led: Option<LineSpec>,
    pub int: Option<LineSpec>,
}

/// Assemble the child command line for a mode from the current audio
/// configuration and catalog.
pub fn child_args(
    mode: Mode,
    audio: &AudioConfPayload,
    catalog: &Catalog,
    base_model_dir: &Path,
) -> Vec<String> {
    let mut args = vec![
        format!("--preamp={}", audio.preamp),
        format!("--noiser={}", audio.noiser),
        format!("--autogain={}", audio.autogain),
    ];
    match mode {
        Mode::Idle => Vec::new(),
        Mode::WakeWord => {
            args.push("--output=machine".to_string());
            args.push(format!("--modelsdir={}", base_model_dir.display()));
            args.extend(catalog.model_args());
            args
        }
        Mode::Preprocessor => {
            if audio.vad != 0 {
                args.push("--vad".to_string());
            }
            args
        }
    }
}

fn sibling_exe(name: &str) -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.join(name)))
        .filter(|p| p.exists())
        .unwrap_or_else(|| PathBuf::from(name))
}

fn open_port(device: &str) -> Result<TTYPort> {
    serialport::new(device, BAUD_RATE)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(READ_TIMEOUT)
        .open_native()
        .map_err(|e| {
            VozError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("{}: {}", device, e),
            ))
        })
}

pub struct Controller {
    cfg: ControllerConfig,
    port: TTYPort,
    reader: FrameReader,
    catalog: Catalog,
    audio: AudioConfPayload,
    mode: Mode,
    child: Option<Supervisor>,
    gpio: GpioController,
    refrac: u32,
    frames_in: u32,
    frames_dropped: u32,
    ready: bool,
    error_code: u8,
    io_failed: bool,
}

impl Controller {
    pub fn new(cfg: ControllerConfig) -> Result<Self> {
        let port = open_port(&cfg.device)?;
        let catalog = Catalog::scan(&cfg.ww_model_dir)?;
        if catalog.is_empty() {
            log::warn!("no wake-word models under {}", cfg.ww_model_dir.display());
        }
        let gpio = GpioController::spawn(cfg.led.as_ref(), cfg.int.as_ref())?;
        Ok(Self {
            cfg,
            port,
            reader: FrameReader::new(),
            catalog,
            audio: AudioConfPayload {
                preamp: 1.0,
                noiser: 0,
                autogain: 0,
                vad: 0,
            },
            mode: Mode::Idle,
            child: None,
            gpio,
            refrac: 0,
            frames_in: 0,
            frames_dropped: 0,
            ready: false,
            error_code: 0,
            io_failed: false,
        })
    }

    fn status_payload(&self) -> StatusPayload {
        StatusPayload {
            mode: self.mode as u8,
            error_kind: self.error_code,
            ready: self.ready as u8,
            frames_in: self.frames_in,
            frames_dropped: self.frames_dropped,
            ww_mask: self.catalog.mask(),
        }
    }

    fn send(&mut self, ev: &Event) {
        use std::io::Write;
        if let Err(e) = self.port.write_all(&encode(ev)) {
            log::error!("uart write: {}", e);
            self.io_failed = true;
        }
    }

    fn send_status(&mut self) {
        let status = Event::Status(self.status_payload());
        self.send(&status);
    }

    fn send_ww_list(&mut self) {
        for i in 0..self.catalog.len() {
            if let Some(payload) = self.catalog.status_payload(i) {
                self.send(&Event::WwStatus(payload));
            }
        }
        self.send_status();
    }

    /// Stop the current child, apply the configuration and bring up whatever
    /// the new mode needs, then report.
    fn change_mode(&mut self, mode: Mode) {
        if let Some(child) = self.child.take() {
            let code = child.stop();
            log::info!("child stopped with {:?}", code);
        }
        self.ready = false;
        self.refrac = 0;
        self.gpio.send(GpioCmd::Off);
        self.mode = Mode::Idle;

        if mode != Mode::Idle {
            let program = sibling_exe(match mode {
                Mode::WakeWord => "voz-oww",
                Mode::Preprocessor => "voz-pre",
                Mode::Idle => unreachable!(),
            });
            let args = child_args(mode, &self.audio, &self.catalog, &self.cfg.base_model_dir);
            log::info!("starting {} {}", program.display(), args.join(" "));
            match Supervisor::spawn(&program, &args) {
                Ok(child) => {
                    self.child = Some(child);
                    self.error_code = 0;
                    self.mode = mode;
                    // let the models load before the host starts streaming
                    std::thread::sleep(CHILD_SETTLE);
                }
                Err(e) => {
                    log::error!("mode change: {}", e);
                    self.error_code = e.code();
                }
            }
        }
        self.send_status();
    }

    fn forward_audio(&mut self, payload: &[u8]) {
        self.frames_in = self.frames_in.wrapping_add(1);
        if self.refrac > 0 {
            self.refrac -= 1;
            self.frames_dropped = self.frames_dropped.wrapping_add(1);
            return;
        }
        let res = match self.child.as_mut() {
            Some(child) => child.feed_audio(payload),
            None => return,
        };
        if let Err(e) = res {
            log::error!("audio forward: {}", e);
            self.error_code = e.code();
            self.change_mode(Mode::Idle);
        }
    }

    fn apply_ww_conf(&mut self, conf: WwConfPayload) {
        match self.catalog.apply_conf(&conf) {
            Ok(()) => {
                if let Some(payload) = self.catalog.status_payload(conf.index as usize) {
                    self.send(&Event::WwStatus(payload));
                }
                if self.mode == Mode::WakeWord {
                    // restart so the child picks up the new catalog
                    self.change_mode(Mode::WakeWord);
                } else {
                    self.send_status();
                }
            }
            Err(e) => {
                log::warn!("ww conf: {}", e);
                self.error_code = e.code();
                self.send_status();
            }
        }
    }

    fn handle_event(&mut self, ev: Event) -> Option<i32> {
        match ev {
            Event::Nop => {}
            Event::Status(_) => self.send_status(),
            Event::Mode(m) => match Mode::try_from(m) {
                Ok(mode) => self.change_mode(mode),
                Err(e) => {
                    log::warn!("{}", e);
                    self.error_code = e.code();
                    self.send_status();
                }
            },
            Event::Config(conf) => {
                self.audio = conf;
                let mode = self.mode;
                if mode != Mode::Idle {
                    self.change_mode(mode);
                } else {
                    self.send_status();
                }
            }
            Event::Audio(payload) => self.forward_audio(&payload),
            Event::BAudio(_, payload) => self.forward_audio(&payload),
            Event::Areset(refrac) => {
                self.refrac = refrac as u32;
                if let Some(child) = self.child.as_ref() {
                    if let Err(e) = child.signal_reset() {
                        log::warn!("{}", e);
                    }
                }
            }
            Event::Reboot => return Some(EXIT_RESTART),
            Event::WwList(clear) => {
                if clear {
                    self.catalog.clear_enabled();
                }
                self.send_ww_list();
            }
            Event::WwConf(conf) => self.apply_ww_conf(conf),
            Event::WwStatus(_) | Event::WwMatch(_) => {
                log::warn!("host sent a device-to-host event, ignoring");
            }
        }
        None
    }

    fn drain_uart(&mut self) -> Option<i32> {
        let mut buf = [0u8; 512];
        match nix::unistd::read(self.port.as_raw_fd(), &mut buf) {
            Ok(0) => {}
            Ok(n) => self.reader.push(&buf[..n]),
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => {}
            Err(e) => {
                log::error!("uart read: {}", e);
                return Some(EXIT_RESTART);
            }
        }
        loop {
            match self.reader.next_event() {
                Ok(Some(ev)) => {
                    if let Some(code) = self.handle_event(ev) {
                        return Some(code);
                    }
                }
                Ok(None) => break,
                Err(e) => log::warn!("{}", e),
            }
        }
        None
    }

    fn drain_child_stdout(&mut self) -> Result<bool> {
        let mode = self.mode;
        match mode {
            Mode::Idle => Ok(false),
            Mode::WakeWord => {
                let (events, eof) = match self.child.as_mut() {
                    Some(child) => child.read_stdout_lines()?,
                    None => return Ok(false),
                };
                for ev in events {
                    match ev {
                        ChildOutput::Ready(ready) => {
                            self.ready = ready;
                            self.gpio
                                .send(if ready { GpioCmd::On } else { GpioCmd::Off });
                            self.send_status();
                        }
                        ChildOutput::Match { name, score, count } => {
                            let index = self.catalog.index_for_name(&name).unwrap_or(0);
                            log::info!("match: {} score {:.3} count {}", name, score, count);
                            self.send(&Event::WwMatch(WwMatchPayload {
                                index,
                                score,
                                count,
                            }));
                            self.gpio.send(GpioCmd::Int);
                            self.gpio.send(GpioCmd::Blink);
                        }
                    }
                }
                Ok(eof)
            }
            Mode::Preprocessor => {
                let vad = self.audio.vad != 0;
                let record_len = CHUNK_BYTES + vad as usize;
                let (records, eof) = match self.child.as_mut() {
                    Some(child) => child.read_stdout_records(record_len)?,
                    None => return Ok(false),
                };
                for rec in records {
                    let ev = if vad {
                        Event::BAudio(rec[0], rec[1..].to_vec())
                    } else {
                        Event::Audio(rec)
                    };
                    self.send(&ev);
                }
                Ok(eof)
            }
        }
    }

    fn reap_child(&mut self) {
        if let Some(mut child) = self.child.take() {
            // pick up whatever the child said on its way out
            let _ = child.relay_stderr();
            let code = child.stop();
            log::info!("child exited with {:?}", code);
            if code != Some(0) {
                self.error_code = VozError::ChildIo("child exited abnormally".into()).code();
            }
        }
        self.ready = false;
        self.gpio.send(GpioCmd::Off);
        self.mode = Mode::Idle;
        self.send_status();
    }

    /// The poll loop. Returns the process exit code.
    pub fn run(&mut self, signals: &SignalPipe) -> i32 {
        log::info!(
            "bridge up on {} ({} catalog entries)",
            self.cfg.device,
            self.catalog.len()
        );
        self.send_status();
        let mut last_watchdog = Instant::now();
        let mut watchdog_base = 0u32;

        loop {
            let uart_fd = self.port.as_raw_fd();
            let child_out = self.child.as_ref().and_then(|c| c.stdout_fd());
            let child_err = self.child.as_ref().and_then(|c| c.stderr_fd());

            let mut fds = vec![
                PollFd::new(uart_fd, PollFlags::POLLIN),
                PollFd::new(signals.fd(), PollFlags::POLLIN),
            ];
            if let Some(fd) = child_out {
                fds.push(PollFd::new(fd, PollFlags::POLLIN));
            }
            if let Some(fd) = child_err {
                fds.push(PollFd::new(fd, PollFlags::POLLIN));
            }

            match poll(&mut fds, POLL_TIMEOUT_MS) {
                Ok(_) => {}
                Err(Errno::EINTR) => {}
                Err(e) => {
                    log::error!("poll: {}", e);
                    return EXIT_RESTART;
                }
            }
            let wants = PollFlags::POLLIN | PollFlags::POLLHUP;
            let hit = |i: usize| {
                fds.get(i)
                    .and_then(|f| f.revents())
                    .map(|r| r.intersects(wants))
                    .unwrap_or(false)
            };
            let uart_ready = hit(0);
            let signal_ready = hit(1);
            let mut idx = 2;
            let stdout_ready = child_out.is_some() && hit(idx);
            if child_out.is_some() {
                idx += 1;
            }
            let stderr_ready = child_err.is_some() && hit(idx);

            if signal_ready {
                for ev in signals.drain() {
                    match ev {
                        SignalEvent::Stop => {
                            log::info!("shutdown requested");
                            self.change_mode(Mode::Idle);
                            return EXIT_REQUESTED;
                        }
                        SignalEvent::Reset => {
                            if let Some(child) = self.child.as_ref() {
                                let _ = child.signal_reset();
                            }
                        }
                        SignalEvent::ChildExited => {
                            log::debug!("sigchld, pipe eof will follow");
                        }
                    }
                }
            }

            if uart_ready {
                if let Some(code) = self.drain_uart() {
                    self.change_mode(Mode::Idle);
                    return code;
                }
            }

            let mut child_eof = false;
            if stdout_ready {
                match self.drain_child_stdout() {
                    Ok(eof) => child_eof = eof,
                    Err(e) => {
                        log::error!("{}", e);
                        self.error_code = e.code();
                        child_eof = true;
                    }
                }
            }
            if stderr_ready {
                if let Some(child) = self.child.as_mut() {
                    if let Err(e) = child.relay_stderr() {
                        log::warn!("{}", e);
                    }
                }
            }
            if child_eof {
                self.reap_child();
            }

            if self.io_failed {
                log::error!("uart unusable, giving up");
                self.change_mode(Mode::Idle);
                return EXIT_RESTART;
            }

            if last_watchdog.elapsed() >= WATCHDOG_PERIOD {
                let period_frames = self.frames_in.wrapping_sub(watchdog_base);
                log::info!(
                    "watchdog: mode {:?}, {} frames in the last {}s, {} dropped total",
                    self.mode,
                    period_frames,
                    WATCHDOG_PERIOD.as_secs(),
                    self.frames_dropped
                );
                watchdog_base = self.frames_in;
                last_watchdog = Instant::now();
                self.send_status();
            }
        }
    }
}
