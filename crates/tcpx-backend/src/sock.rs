//! Raw socket plumbing shared by both backends.
//!
//! Client sockets are non-blocking with TCP_NODELAY and SO_KEEPALIVE;
//! listeners get SO_REUSEADDR + SO_REUSEPORT and a backlog of 128.
//! IPv4 only; the address family is isolated here so IPv6 can be added
//! without touching the backends.

use std::net::{SocketAddr, SocketAddrV4};
use std::os::unix::io::RawFd;

use tcpx_core::{EngineError, Result};

pub const LISTEN_BACKLOG: i32 = 128;

pub fn errno() -> i32 {
    // Safety: errno location is always valid on the calling thread.
    unsafe { *libc::__errno_location() }
}

fn set_opt(fd: RawFd, level: i32, opt: i32) -> Result<()> {
    let one: i32 = 1;
    // Safety: fd is a socket we created; option payload is a valid i32.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(EngineError::Os(errno()));
    }
    Ok(())
}

fn new_socket() -> Result<RawFd> {
    // Safety: plain socket(2) call.
    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(EngineError::Os(errno()));
    }
    Ok(fd)
}

/// Non-blocking client socket with the latency options applied.
pub fn client_socket() -> Result<RawFd> {
    let fd = new_socket()?;
    if let Err(e) = configure_client(fd) {
        close_fd(fd);
        return Err(e);
    }
    Ok(fd)
}

/// Apply the client options to an existing socket (e.g. one the kernel
/// just accepted).
pub fn configure_client(fd: RawFd) -> Result<()> {
    set_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY)?;
    set_opt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE)
}

/// Bound, listening server socket.
pub fn listener_socket(addr: SocketAddrV4) -> Result<RawFd> {
    let fd = new_socket()?;
    let setup = (|| {
        set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR)?;
        set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT)?;
        let sa = sockaddr_in(addr);
        // Safety: sa is a fully initialized sockaddr_in.
        let rc = unsafe {
            libc::bind(
                fd,
                &sa as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(EngineError::Os(errno()));
        }
        // Safety: fd is bound.
        if unsafe { libc::listen(fd, LISTEN_BACKLOG) } != 0 {
            return Err(EngineError::Os(errno()));
        }
        Ok(())
    })();
    if let Err(e) = setup {
        close_fd(fd);
        return Err(e);
    }
    Ok(fd)
}

pub fn close_fd(fd: RawFd) {
    if fd >= 0 {
        // Safety: we own the fd.
        unsafe {
            libc::close(fd);
        }
    }
}

pub fn sockaddr_in(addr: SocketAddrV4) -> libc::sockaddr_in {
    // Safety: sockaddr_in is plain old data.
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = addr.port().to_be();
    sa.sin_addr.s_addr = u32::from_ne_bytes(addr.ip().octets());
    sa
}

fn addr_from_raw(sa: &libc::sockaddr_in) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(
        sa.sin_addr.s_addr.to_ne_bytes().into(),
        u16::from_be(sa.sin_port),
    ))
}

pub fn local_addr(fd: RawFd) -> Option<SocketAddr> {
    name_of(fd, false)
}

pub fn peer_addr(fd: RawFd) -> Option<SocketAddr> {
    name_of(fd, true)
}

fn name_of(fd: RawFd, peer: bool) -> Option<SocketAddr> {
    if fd < 0 {
        return None;
    }
    // Safety: out-params sized for sockaddr_in.
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        let p = &mut sa as *mut _ as *mut libc::sockaddr;
        if peer {
            libc::getpeername(fd, p, &mut len)
        } else {
            libc::getsockname(fd, p, &mut len)
        }
    };
    if rc != 0 {
        return None;
    }
    Some(addr_from_raw(&sa))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn sockaddr_round_trip() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 9000);
        let sa = sockaddr_in(addr);
        assert_eq!(u16::from_be(sa.sin_port), 9000);
        assert_eq!(addr_from_raw(&sa), SocketAddr::V4(addr));
    }

    #[test]
    fn listener_binds_and_reports_its_address() {
        let fd = listener_socket(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        let local = local_addr(fd).unwrap();
        assert!(local.port() > 0);
        close_fd(fd);
    }

    #[test]
    fn client_socket_is_nonblocking() {
        let fd = client_socket().unwrap();
        // Safety: fcntl F_GETFL on an owned fd.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        assert!(flags & libc::O_NONBLOCK != 0);
        close_fd(fd);
    }
}
