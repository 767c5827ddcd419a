use thiserror::Error;

/// Reason a serial frame was rejected by the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormatKind {
    /// Leading bytes had to be discarded before a start-of-header was found.
    NoSoh,
    /// Event id complement or header checksum mismatch.
    HeaderIntegrity,
    /// Declared payload size exceeds the protocol maximum.
    PayloadTooBig,
    /// Payload size does not match the fixed size of the event.
    InvalidPayloadLen,
    PayloadChecksum,
    UnknownEvent,
    /// Stream ended in the middle of a frame.
    IncompleteEvent,
}

impl std::fmt::Display for FrameFormatKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FrameFormatKind::NoSoh => "no start-of-header",
            FrameFormatKind::HeaderIntegrity => "header integrity",
            FrameFormatKind::PayloadTooBig => "payload too big",
            FrameFormatKind::InvalidPayloadLen => "invalid payload length",
            FrameFormatKind::PayloadChecksum => "payload checksum",
            FrameFormatKind::UnknownEvent => "unknown event",
            FrameFormatKind::IncompleteEvent => "incomplete event",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum VozError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("model not runnable: {0}")]
    NotRunnable(String),
    #[error("tensor allocation: {0}")]
    TensorAlloc(String),
    #[error("tensor runtime: {0}")]
    TensorRuntime(String),
    #[error("frame format: {0}")]
    FrameFormat(FrameFormatKind),
    #[error("config: {0}")]
    Config(String),
    #[error("child i/o: {0}")]
    ChildIo(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl VozError {
    /// One-byte kind code carried in the serial Status payload.
    pub fn code(&self) -> u8 {
        match self {
            VozError::Io(_) => 1,
            VozError::NotRunnable(_) | VozError::TensorAlloc(_) => 2,
            VozError::TensorRuntime(_) => 3,
            VozError::FrameFormat(_) => 4,
            VozError::Config(_) => 5,
            VozError::ChildIo(_) => 6,
            VozError::Internal(_) => 7,
        }
    }
}

impl From<nix::Error> for VozError {
    fn from(e: nix::Error) -> Self {
        VozError::Io(std::io::Error::from_raw_os_error(e as i32))
    }
}

pub type Result<T> = std::result::Result<T, VozError>;
