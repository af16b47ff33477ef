//! # tcpx-backend — Concrete I/O backends
//!
//! The implementations behind the `tcpx-core` capability contract:
//!
//! | Contract            | Implementation    | Notes                          |
//! |---------------------|-------------------|--------------------------------|
//! | `IoBackend` (fast)  | `RingBackend`     | io_uring; Linux only           |
//! | `IoBackend` (safe)  | `ReactorBackend`  | mio selector; every platform   |
//! | Buffer pool         | `BufferPool`      | arena + lock-free free list    |
//!
//! [`create_backend`] is the only place backend kinds are interpreted.

pub mod pool;
pub mod reactor;
pub mod sock;

#[cfg(target_os = "linux")]
pub mod buf_ring;
#[cfg(target_os = "linux")]
pub mod uring;

use std::sync::Arc;

use tcpx_core::{BackendKind, EngineConfig, EngineError, EngineStats, IoBackend, Result};

pub use pool::BufferPool;
pub use reactor::ReactorBackend;
#[cfg(target_os = "linux")]
pub use uring::RingBackend;

/// Build the configured backend. `stats` is shared with the caller so one
/// snapshot covers submissions and completions alike.
pub fn create_backend(
    cfg: &EngineConfig,
    stats: Arc<EngineStats>,
) -> Result<Box<dyn IoBackend>> {
    cfg.validate()?;
    match cfg.backend {
        BackendKind::Reactor => Ok(Box::new(ReactorBackend::new(
            cfg.connection_timeout,
            stats,
        )?)),
        BackendKind::Uring => create_uring(cfg, stats),
        BackendKind::Xdp => Err(EngineError::Unsupported("XDP backend is reserved")),
        BackendKind::Dpdk => Err(EngineError::Unsupported("DPDK backend is reserved")),
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn create_uring(cfg: &EngineConfig, stats: Arc<EngineStats>) -> Result<Box<dyn IoBackend>> {
            Ok(Box::new(RingBackend::new(cfg, stats)?))
        }
    } else {
        fn create_uring(_cfg: &EngineConfig, _stats: Arc<EngineStats>) -> Result<Box<dyn IoBackend>> {
            Err(EngineError::Unsupported("io_uring backend requires Linux"))
        }
    }
}
