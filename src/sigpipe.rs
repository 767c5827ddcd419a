//! Self-pipe signal delivery.
//!
//! The handler does one async-signal-safe thing: it writes the signal number
//! into a non-blocking pipe. The owning main loop polls the read end next to
//! its other descriptors and decides what to do. No handler ever touches
//! process state directly.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::error::Result;

static PIPE_WR: AtomicI32 = AtomicI32::new(-1);

extern "C" fn forward_signal(sig: libc::c_int) {
    let fd = PIPE_WR.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = sig as u8;
        // best effort; a full pipe just means the loop is already behind
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// What a drained signal byte means to a main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    Stop,
    Reset,
    ChildExited,
}

pub struct SignalPipe {
    read_fd: RawFd,
}

impl SignalPipe {
    /// Install handlers for `signals` and return the pipe to poll.
    /// May be called once per process.
    pub fn install(signals: &[Signal]) -> Result<Self> {
        let (rd, wr) = nix::unistd::pipe()?;
        fcntl(rd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
        fcntl(wr, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
        PIPE_WR.store(wr, Ordering::Relaxed);

        let action = SigAction::new(
            SigHandler::Handler(forward_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for sig in signals {
            unsafe {
                sigaction(*sig, &action)?;
            }
        }
        Ok(Self { read_fd: rd })
    }

    pub fn fd(&self) -> RawFd {
        self.read_fd
    }

    /// Drain every pending signal byte without blocking.
    pub fn drain(&self) -> Vec<SignalEvent> {
        let mut events = Vec::new();
        let mut buf = [0u8; 16];
        loop {
            match nix::unistd::read(self.read_fd, &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for &b in &buf[..n] {
                        if b == Signal::SIGUSR1 as i32 as u8 {
                            events.push(SignalEvent::Reset);
                        } else if b == Signal::SIGCHLD as i32 as u8 {
                            events.push(SignalEvent::ChildExited);
                        } else {
                            events.push(SignalEvent::Stop);
                        }
                    }
                }
                Err(_) => break,
            }
        }
        events
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        let wr = PIPE_WR.swap(-1, Ordering::Relaxed);
        if wr >= 0 {
            let _ = nix::unistd::close(wr);
        }
        let _ = nix::unistd::close(self.read_fd);
    }
}
