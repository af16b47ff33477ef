//! # tcpx-core — Trait definitions and shared types for tcpx
//!
//! This crate defines the boundaries between the three layers of the
//! transport engine. Each trait models one capability dimension:
//!
//! - [`backend::IoBackend`] — the I/O capability contract. Two concrete
//!   variants exist in `tcpx-backend`: a batched io_uring ring backend and a
//!   portable readiness-based reactor backend. Reserved kinds (XDP, DPDK)
//!   are enumerated but rejected at construction.
//! - [`handler::EventHandler`] — the application-facing completion sink.
//! - [`buffer::Buffer`] — the handle type for pool-owned off-heap buffers.
//!
//! Every component of tcpx depends on types from this crate, never on
//! concrete backends. Swapping a backend is a configuration change, not a
//! code change.

pub mod backend;
pub mod buffer;
pub mod completion;
pub mod config;
pub mod errno;
pub mod error;
pub mod handler;
pub mod stats;
pub mod token;

pub use backend::{BackendKind, ConnState, Features, IoBackend, RecvMode, SendMode};
pub use buffer::Buffer;
pub use completion::Completion;
pub use config::{BufferMode, EngineConfig, SubmissionPoll};
pub use errno::{classify, ErrnoClass, CONNECTION_CLOSED};
pub use error::{EngineError, Result};
pub use handler::EventHandler;
pub use stats::{EngineStats, StatsSnapshot};
pub use token::TokenCounter;
