//! Supervised child process: the bridge runs the detector or the
//! preprocessor as a child, feeds audio into its stdin and harvests its
//! stdout/stderr without blocking the poll loop.

use std::io::Write;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::error::{Result, VozError};

const REAP_TIMEOUT: Duration = Duration::from_secs(1);

/// A parsed line of the child detector's machine-format stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum ChildOutput {
    Ready(bool),
    Match { name: String, score: f32, count: u8 },
}

pub struct Supervisor {
    child: Child,
    stdout_buf: Vec<u8>,
    stderr_buf: Vec<u8>,
    raw_buf: Vec<u8>,
}

impl Supervisor {
    /// Spawn `program` with piped stdio; stdout and stderr are switched to
    /// non-blocking so the poll loop can drain them opportunistically.
    pub fn spawn(program: &Path, args: &[String]) -> Result<Self> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| VozError::ChildIo(format!("spawn {}: {}", program.display(), e)))?;

        let sup = Self {
            child,
            stdout_buf: Vec::new(),
            stderr_buf: Vec::new(),
            raw_buf: Vec::new(),
        };
        for fd in [sup.stdout_fd(), sup.stderr_fd()].into_iter().flatten() {
            fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
                .map_err(|e| VozError::ChildIo(format!("set non-blocking: {}", e)))?;
        }
        log::info!("child {} up, pid {}", program.display(), sup.pid());
        Ok(sup)
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn stdout_fd(&self) -> Option<RawFd> {
        self.child.stdout.as_ref().map(|s| s.as_raw_fd())
    }

    pub fn stderr_fd(&self) -> Option<RawFd> {
        self.child.stderr.as_ref().map(|s| s.as_raw_fd())
    }

    /// Write one audio frame to the child's stdin.
    pub fn feed_audio(&mut self, bytes: &[u8]) -> Result<()> {
        let stdin = self
            .child
            .stdin
            .as_mut()
            .ok_or_else(|| VozError::ChildIo("child stdin already closed".into()))?;
        stdin
            .write_all(bytes)
            .map_err(|e| VozError::ChildIo(format!("feed child: {}", e)))
    }

    /// Forward a reset to the child pipeline.
    pub fn signal_reset(&self) -> Result<()> {
        kill(Pid::from_raw(self.pid() as i32), Signal::SIGUSR1)
            .map_err(|e| VozError::ChildIo(format!("signal child: {}", e)))?;
        Ok(())
    }

    fn drain_fd(fd: RawFd, into: &mut Vec<u8>) -> Result<bool> {
        let mut chunk = [0u8; 1024];
        loop {
            match nix::unistd::read(fd, &mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => into.extend_from_slice(&chunk[..n]),
                Err(Errno::EAGAIN) => return Ok(false),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(VozError::ChildIo(format!("read child pipe: {}", e))),
            }
        }
    }

    /// Drain and parse detector stdout lines. Returns the parsed events and
    /// whether the pipe reached EOF.
    pub fn read_stdout_lines(&mut self) -> Result<(Vec<ChildOutput>, bool)> {
        let fd = match self.stdout_fd() {
            Some(fd) => fd,
            None => return Ok((Vec::new(), true)),
        };
        let eof = Self::drain_fd(fd, &mut self.stdout_buf)?;
        let mut events = Vec::new();
        while let Some(pos) = self.stdout_buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.stdout_buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            if let Some(ev) = parse_child_line(line.trim()) {
                events.push(ev);
            }
        }
        Ok((events, eof))
    }

    /// Drain preprocessor stdout into fixed-size records (VAD byte plus one
    /// cleaned chunk). Returns complete records and the EOF flag.
    pub fn read_stdout_records(&mut self, record_len: usize) -> Result<(Vec<Vec<u8>>, bool)> {
        let fd = match self.stdout_fd() {
            Some(fd) => fd,
            None => return Ok((Vec::new(), true)),
        };
        let eof = Self::drain_fd(fd, &mut self.raw_buf)?;
        let mut records = Vec::new();
        while self.raw_buf.len() >= record_len {
            records.push(self.raw_buf.drain(..record_len).collect());
        }
        Ok((records, eof))
    }

    /// Relay child stderr to our own stderr, line by line. Returns the EOF
    /// flag.
    pub fn relay_stderr(&mut self) -> Result<bool> {
        let fd = match self.stderr_fd() {
            Some(fd) => fd,
            None => return Ok(true),
        };
        let eof = Self::drain_fd(fd, &mut self.stderr_buf)?;
        while let Some(pos) = self.stderr_buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.stderr_buf.drain(..=pos).collect();
            eprintln!("child: {}", String::from_utf8_lossy(&line[..line.len() - 1]));
        }
        if eof && !self.stderr_buf.is_empty() {
            eprintln!("child: {}", String::from_utf8_lossy(&self.stderr_buf));
            self.stderr_buf.clear();
        }
        Ok(eof)
    }

    /// Close stdin and reap. Escalates to SIGKILL when the child ignores the
    /// EOF for too long. Returns the exit code when one is available.
    pub fn stop(mut self) -> Option<i32> {
        drop(self.child.stdin.take());
        let deadline = Instant::now() + REAP_TIMEOUT;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => return status.code(),
                Ok(None) => {
                    if Instant::now() >= deadline {
                        log::warn!("child {} ignored shutdown, killing", self.child.id());
                        let _ = self.child.kill();
                        return self.child.wait().ok().and_then(|s| s.code());
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) => {
                    log::warn!("reap child: {}", e);
                    return None;
                }
            }
        }
    }
}

fn parse_child_line(line: &str) -> Option<ChildOutput> {
    if line.is_empty() {
        return None;
    }
    match line.split_once(':') {
        Some(("R", rest)) => match rest {
            "0" => Some(ChildOutput::Ready(false)),
            "1" => Some(ChildOutput::Ready(true)),
            _ => {
                log::warn!("unparsable ready line '{}'", line);
                None
            }
        },
        Some(("P", rest)) => {
            let mut parts = rest.rsplitn(3, ':');
            let count = parts.next()?.parse::<u8>().ok();
            let score = parts.next()?.parse::<f32>().ok();
            let name = parts.next()?;
            match (score, count) {
                (Some(score), Some(count)) => Some(ChildOutput::Match {
                    name: name.to_string(),
                    score,
                    count,
                }),
                _ => {
                    log::warn!("unparsable match line '{}'", line);
                    None
                }
            }
        }
        _ => {
            log::warn!("unknown child line '{}'", line);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_machine_lines() {
        assert_eq!(parse_child_line("R:1"), Some(ChildOutput::Ready(true)));
        assert_eq!(parse_child_line("R:0"), Some(ChildOutput::Ready(false)));
        assert_eq!(
            parse_child_line("P:ok_voz:0.8125:2"),
            Some(ChildOutput::Match {
                name: "ok_voz".into(),
                score: 0.8125,
                count: 2
            })
        );
        // names may themselves contain separators
        assert_eq!(
            parse_child_line("P:hey:there:0.5:1"),
            Some(ChildOutput::Match {
                name: "hey:there".into(),
                score: 0.5,
                count: 1
            })
        );
        assert_eq!(parse_child_line("X:whatever"), None);
        assert_eq!(parse_child_line("R:9"), None);
        assert_eq!(parse_child_line(""), None);
    }

    #[test]
    fn spawn_feed_and_stop_a_child() {
        let mut sup = Supervisor::spawn(Path::new("cat"), &[]).unwrap();
        let first_pid = sup.pid();
        sup.feed_audio(b"R:1\n").unwrap();
        // give cat a moment to echo
        std::thread::sleep(Duration::from_millis(100));
        let (events, _eof) = sup.read_stdout_lines().unwrap();
        assert_eq!(events, vec![ChildOutput::Ready(true)]);
        assert_eq!(sup.stop(), Some(0));

        // a replacement child gets its own pid
        let sup2 = Supervisor::spawn(Path::new("cat"), &[]).unwrap();
        assert_ne!(sup2.pid(), first_pid);
        assert_eq!(sup2.stop(), Some(0));
    }

    #[test]
    fn record_reader_cuts_fixed_sizes() {
        let mut sup = Supervisor::spawn(Path::new("cat"), &[]).unwrap();
        sup.feed_audio(&[7u8; 10]).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let (records, _eof) = sup.read_stdout_records(4).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], vec![7u8; 4]);
        sup.stop();
    }
}
