//! tcpx error types.

use std::fmt;

#[derive(Debug)]
pub enum EngineError {
    /// Operation is illegal in the current state (send before connect,
    /// double start, use after close, double buffer release).
    InvalidState(&'static str),
    /// The caller passed something the engine cannot act on.
    InvalidArgument(String),
    /// Recoverable saturation: command queue full or pending-send slot
    /// occupied. The caller should retry later.
    Backpressure(&'static str),
    /// Allocation of buffers or rings failed.
    ResourceExhausted(&'static str),
    /// The submission queue stayed full through the retry budget.
    /// Surfaced upward as backpressure.
    QueueFull,
    /// Requested capability does not exist on this backend or platform.
    Unsupported(&'static str),
    /// io_uring setup failed.
    RingSetup(i32),
    /// Buffer or file registration with the kernel failed.
    Registration(i32),
    /// Selector (reactor) creation or registration failed.
    Selector(i32),
    /// OS error with errno.
    Os(i32),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidState(what) => write!(f, "invalid state: {}", what),
            Self::InvalidArgument(what) => write!(f, "invalid argument: {}", what),
            Self::Backpressure(what) => write!(f, "backpressure: {}", what),
            Self::ResourceExhausted(what) => write!(f, "resource exhausted: {}", what),
            Self::QueueFull => write!(f, "submission queue full"),
            Self::Unsupported(what) => write!(f, "unsupported: {}", what),
            Self::RingSetup(e) => write!(f, "io_uring setup: errno {}", e),
            Self::Registration(e) => write!(f, "kernel registration: errno {}", e),
            Self::Selector(e) => write!(f, "selector: errno {}", e),
            Self::Os(e) => write!(f, "OS error: errno {}", e),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        Self::Os(e.raw_os_error().unwrap_or(-1))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
