//! Socket option policy.
//!
//! Every socket the multiplexer touches (outbound connects and adopted
//! inbound sockets) is configured through one [`SocketOptions`] value before
//! it is switched to non-blocking mode.

use socket2::Socket;
use std::io;
use std::time::Duration;

/// Option set applied to new sockets.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(deny_unknown_fields, default))]
pub struct SocketOptions {
    /// Disable Nagle's algorithm (TCP_NODELAY).
    pub nodelay: bool,

    /// Enable SO_KEEPALIVE.
    pub keepalive: bool,

    /// Enable SO_REUSEADDR.
    pub reuse_address: bool,

    /// SO_SNDBUF, if overridden.
    pub send_buffer_size: Option<usize>,

    /// SO_RCVBUF, if overridden.
    pub recv_buffer_size: Option<usize>,

    /// SO_LINGER, if overridden.
    pub linger: Option<Duration>,

    /// Listen backlog for callers that bind their own acceptor socket.
    pub backlog: u32,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive: false,
            reuse_address: true,
            send_buffer_size: None,
            recv_buffer_size: None,
            linger: None,
            backlog: 4096,
        }
    }
}

impl SocketOptions {
    /// Apply the option set to a socket.
    ///
    /// Called before the socket is set non-blocking, so option errors
    /// surface ahead of any registration.
    pub fn configure(&self, socket: &Socket) -> io::Result<()> {
        socket.set_reuse_address(self.reuse_address)?;
        socket.set_nodelay(self.nodelay)?;
        socket.set_keepalive(self.keepalive)?;
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(size) = self.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(linger) = self.linger {
            socket.set_linger(Some(linger))?;
        }
        Ok(())
    }

    /// Listen backlog for acceptor sockets.
    pub fn backlog(&self) -> u32 {
        self.backlog
    }
}
