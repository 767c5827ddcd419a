//! Status LED and host-interrupt lines, driven by a single worker thread.
//!
//! Commands go through a roll-buffer so callers in the poll loop never block
//! on a sleeping blink. The interrupt line idles high and pulses low.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use gpio_cdev::{Chip, LineHandle, LineRequestFlags};

use crate::error::{Result, VozError};
use crate::rollbuf::SyncRollBuffer;

const BLINK_MS: u64 = 350;
const INT_PULSE_MS: u64 = 10;
const QUEUE_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpioCmd {
    On,
    Off,
    Blink,
    Int,
    Quit,
}

/// A `gpiochipN:line` option value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineSpec {
    pub chip: String,
    pub line: u32,
}

impl std::str::FromStr for LineSpec {
    type Err = VozError;

    fn from_str(s: &str) -> Result<Self> {
        let (chip, line) = s
            .split_once(':')
            .ok_or_else(|| VozError::Config(format!("bad gpio spec '{s}', want chip:line")))?;
        let line = line
            .parse::<u32>()
            .map_err(|_| VozError::Config(format!("bad gpio line in '{s}'")))?;
        if chip.is_empty() {
            return Err(VozError::Config(format!("bad gpio chip in '{s}'")));
        }
        Ok(Self {
            chip: chip.to_string(),
            line,
        })
    }
}

impl LineSpec {
    fn device_path(&self) -> String {
        if self.chip.starts_with('/') {
            self.chip.clone()
        } else {
            format!("/dev/{}", self.chip)
        }
    }
}

struct Lines {
    led: Option<LineHandle>,
    int: Option<LineHandle>,
}

fn request_lines(led: Option<&LineSpec>, int: Option<&LineSpec>) -> Result<Lines> {
    // the two lines may live on the same chip; open each chip once
    let mut chips: HashMap<String, Chip> = HashMap::new();
    let mut request = |spec: &LineSpec, default: u8, label: &str| -> Result<LineHandle> {
        let path = spec.device_path();
        let chip = match chips.entry(path.clone()) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(v) => {
                let c = Chip::new(&path)
                    .map_err(|e| VozError::Config(format!("gpio chip {}: {}", path, e)))?;
                v.insert(c)
            }
        };
        let line = chip
            .get_line(spec.line)
            .map_err(|e| VozError::Config(format!("gpio line {}:{}: {}", path, spec.line, e)))?;
        line.request(LineRequestFlags::OUTPUT, default, label)
            .map_err(|e| VozError::Config(format!("gpio request {}:{}: {}", path, spec.line, e)))
    };
    let led = led.map(|s| request(s, 0, "voz-led")).transpose()?;
    let int = int.map(|s| request(s, 1, "voz-int")).transpose()?;
    Ok(Lines { led, int })
}

fn set(line: &Option<LineHandle>, value: u8) {
    if let Some(l) = line {
        if let Err(e) = l.set_value(value) {
            log::warn!("gpio set: {}", e);
        }
    }
}

fn worker(lines: Lines, queue: Arc<SyncRollBuffer<GpioCmd>>) {
    loop {
        let mut guard = queue.wait_any();
        if guard.status().cancel {
            guard.release();
            break;
        }
        let cmd = match guard.get().first().copied() {
            Some(c) => c,
            None => {
                guard.release();
                continue;
            }
        };
        guard.shift(1);
        guard.release();

        match cmd {
            GpioCmd::On => set(&lines.led, 1),
            GpioCmd::Off => set(&lines.led, 0),
            GpioCmd::Blink => {
                set(&lines.led, 1);
                std::thread::sleep(Duration::from_millis(BLINK_MS));
                set(&lines.led, 0);
            }
            GpioCmd::Int => {
                set(&lines.int, 0);
                std::thread::sleep(Duration::from_millis(INT_PULSE_MS));
                set(&lines.int, 1);
            }
            GpioCmd::Quit => break,
        }
    }
    set(&lines.led, 0);
    set(&lines.int, 1);
}

pub struct GpioController {
    queue: Arc<SyncRollBuffer<GpioCmd>>,
    handle: Option<JoinHandle<()>>,
}

impl GpioController {
    /// Request the configured lines and start the worker. Lines left
    /// unconfigured make their commands no-ops; the worker still runs so the
    /// command path is identical either way.
    pub fn spawn(led: Option<&LineSpec>, int: Option<&LineSpec>) -> Result<Self> {
        let lines = request_lines(led, int)?;
        let queue = Arc::new(SyncRollBuffer::new(QUEUE_DEPTH, false));
        let worker_queue = Arc::clone(&queue);
        let handle = std::thread::Builder::new()
            .name("gpio".into())
            .spawn(move || worker(lines, worker_queue))
            .expect("spawn gpio thread");
        Ok(Self {
            queue,
            handle: Some(handle),
        })
    }

    pub fn send(&self, cmd: GpioCmd) {
        self.queue.append_one(cmd);
    }
}

impl Drop for GpioController {
    fn drop(&mut self) {
        self.queue.append_one(GpioCmd::Quit);
        self.queue.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
