//! Engine configuration.

use std::time::Duration;

use crate::backend::BackendKind;
use crate::error::{EngineError, Result};

/// Receive/send buffer strategy for the ring backend. `Standard` is the
/// safe default; the others are fast paths that silently fall back when
/// the kernel rejects them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    Standard,
    Fixed,
    ZeroCopy,
    BufferRing,
}

/// Kernel submission-queue polling (ring backend only).
#[derive(Debug, Clone, Copy)]
pub struct SubmissionPoll {
    pub enabled: bool,
    /// CPU to pin the kernel poll thread to; -1 for none.
    pub cpu: i32,
    /// Idle budget before the kernel thread sleeps, in microseconds.
    pub idle_us: u32,
}

impl Default for SubmissionPoll {
    fn default() -> Self {
        Self { enabled: false, cpu: -1, idle_us: 500 }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub backend: BackendKind,
    /// Pool of pre-allocated off-heap buffers.
    pub buffers_enabled: bool,
    pub buffer_count: u32,
    pub buffer_size: u32,
    pub connection_timeout: Duration,
    /// CPU to pin the poller thread to; -1 for none.
    pub cpu_affinity: i32,
    pub submission_poll: SubmissionPoll,
    pub buffer_mode: BufferMode,
    /// Payloads below this go through the standard path even when
    /// `ZeroCopy` is selected.
    pub zero_copy_min_bytes: u32,
    /// Pending-send ring size P; bounds in-flight sends. Power of two.
    pub pending_sends: u32,
    /// Command queue depth. Power of two.
    pub command_queue_depth: u32,
    /// io_uring submission queue depth.
    pub ring_depth: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Uring,
            buffers_enabled: true,
            buffer_count: 256,
            buffer_size: 65536,
            connection_timeout: Duration::from_secs(5),
            cpu_affinity: -1,
            submission_poll: SubmissionPoll::default(),
            buffer_mode: BufferMode::Standard,
            zero_copy_min_bytes: 4096,
            pending_sends: 1024,
            command_queue_depth: 4096,
            ring_depth: 4096,
        }
    }
}

impl EngineConfig {
    /// A reactor-backend configuration, for platforms or deployments where
    /// io_uring is unavailable.
    pub fn reactor() -> Self {
        Self { backend: BackendKind::Reactor, ..Self::default() }
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffers_enabled && (self.buffer_count == 0 || self.buffer_size == 0) {
            return Err(EngineError::InvalidArgument(
                "buffer pool needs a non-zero count and size".into(),
            ));
        }
        if !self.pending_sends.is_power_of_two() {
            return Err(EngineError::InvalidArgument(
                "pending_sends must be a power of two".into(),
            ));
        }
        if !self.command_queue_depth.is_power_of_two() {
            return Err(EngineError::InvalidArgument(
                "command_queue_depth must be a power of two".into(),
            ));
        }
        if self.buffer_mode != BufferMode::Standard && !self.buffers_enabled {
            return Err(EngineError::InvalidArgument(
                "fixed, zero-copy and buffer-ring modes require the buffer pool".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        EngineConfig::default().validate().unwrap();
        EngineConfig::reactor().validate().unwrap();
    }

    #[test]
    fn fast_paths_require_the_pool() {
        let cfg = EngineConfig {
            buffers_enabled: false,
            buffer_mode: BufferMode::ZeroCopy,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn queue_sizes_must_be_powers_of_two() {
        let cfg = EngineConfig { pending_sends: 1000, ..EngineConfig::default() };
        assert!(cfg.validate().is_err());
    }
}
