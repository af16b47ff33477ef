//! # tcpx-transport — The transport runtime
//!
//! [`Transport`] implements a single logical TCP connection on top of any
//! `tcpx-core` backend: a poller thread owns the backend and mediates
//! between application threads and the kernel through a lock-free MPSC
//! command queue, a pending-send slot ring, and reference-counted pool
//! buffers.
//!
//! ```no_run
//! use tcpx_core::{EngineConfig, EventHandler};
//! use tcpx_transport::Transport;
//!
//! struct Printer;
//! impl EventHandler for Printer {
//!     fn on_data_received(&mut self, data: &[u8]) {
//!         println!("got {} bytes", data.len());
//!     }
//! }
//!
//! let transport = Transport::new(EngineConfig::reactor()).unwrap();
//! transport.start(Printer).unwrap();
//! let _token = transport.connect("127.0.0.1:9000".parse().unwrap()).unwrap();
//! ```

mod command;
mod pending;
mod poller;
mod transport;

pub use transport::{Health, Transport};
