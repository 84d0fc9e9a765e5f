//! The shared listen socket
//!
//! The supervisor binds exactly one socket before any worker exists and hands
//! the descriptor to each worker at a fixed number. Workers only ever accept
//! on it; the kernel arbitrates concurrent accepts across processes.

use crate::error::SupervisorError;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use tokio::net::TcpSocket;
use tracing::info;

/// Descriptor number the listen socket occupies inside every worker
pub const LISTEN_FD: RawFd = 3;

/// The bound listen socket, owned by the supervisor
#[derive(Debug)]
pub struct ListenSocket {
    listener: std::net::TcpListener,
    addr: SocketAddr,
    backlog: u32,
}

impl ListenSocket {
    /// Bind and listen. Must be called from within a Tokio runtime.
    pub fn bind(addr: SocketAddr, backlog: u32) -> Result<Self, SupervisorError> {
        let bind_err = |source: io::Error| SupervisorError::Bind {
            addr: addr.to_string(),
            source,
        };

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_err)?;

        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;
        let listener = socket.listen(backlog).map_err(bind_err)?;
        let listener = listener.into_std().map_err(bind_err)?;
        let addr = listener.local_addr().map_err(bind_err)?;

        info!(%addr, backlog, "Listen socket bound");

        Ok(Self {
            listener,
            addr,
            backlog,
        })
    }

    /// The bound address (port 0 resolved to the real port)
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn backlog(&self) -> u32 {
        self.backlog
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    /// Arrange for the socket to appear as [`LISTEN_FD`] in the spawned child.
    pub(crate) fn install_in_child(&self, cmd: &mut tokio::process::Command) {
        let fd = self.as_raw_fd();

        // SAFETY: the closure runs between fork and exec and only calls
        // async-signal-safe functions (fcntl, dup2).
        unsafe {
            cmd.pre_exec(move || {
                if fd == LISTEN_FD {
                    let flags = libc::fcntl(fd, libc::F_GETFD);
                    if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                } else if libc::dup2(fd, LISTEN_FD) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    /// Close the supervisor's copy of the socket
    pub fn close(self) {
        info!(addr = %self.addr, "Listen socket closed");
        drop(self.listener);
    }
}

/// Adopt a listen socket inherited from the supervisor.
///
/// Must be called from within a Tokio runtime. Fails if `fd` is not a socket.
pub fn inherited_listener(fd: RawFd) -> io::Result<tokio::net::TcpListener> {
    // SAFETY: the descriptor was installed by the supervisor for this process
    // and nothing else in the worker owns it.
    let listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    listener.local_addr()?;
    listener.set_nonblocking(true)?;
    tokio::net::TcpListener::from_std(listener)
}
