//! Commands crossing from application threads to the poller.

use std::net::SocketAddrV4;

use tcpx_core::Buffer;

/// One entry on the MPSC command queue. The send variant carries its
/// buffer by value; the buffer already holds the token, so no allocation
/// happens on the send path.
pub(crate) enum Command {
    Send(Buffer),
    Connect(SocketAddrV4, u64),
    /// Shutdown sentinel; spun into the queue if it is momentarily full.
    Close,
}
