//! UDP endpoint for the reactor.
//!
//! Wraps a `socket2` socket with the small contract the connection driver
//! needs: bind, fix a peer, send, and receive with a bounded wait. The
//! receive timeout is the reactor's only suspension point.

use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Transport-level failures, mapped from the raw io errors.
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("socket creation failed: {0}")]
    Create(std::io::Error),

    #[error("bind to {addr} failed: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("send failed: {0}")]
    Send(std::io::Error),

    #[error("receive failed: {0}")]
    Receive(std::io::Error),

    #[error("peer address is not a usable socket address")]
    InvalidAddress,

    #[error("socket option: {0}")]
    Option(std::io::Error),
}

/// One UDP socket carrying one SRT connection.
pub struct UdpEndpoint {
    inner: Socket,
}

impl UdpEndpoint {
    /// Binds a datagram socket on `addr`.
    pub fn bind(addr: SocketAddr) -> Result<Self, SocketError> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket =
            Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(SocketError::Create)?;
        socket.set_reuse_address(true).map_err(SocketError::Option)?;
        socket
            .bind(&addr.into())
            .map_err(|source| SocketError::Bind { addr, source })?;
        Ok(UdpEndpoint { inner: socket })
    }

    /// Fixes the peer; `send` and `recv` then apply to that address only.
    pub fn connect(&self, addr: SocketAddr) -> Result<(), SocketError> {
        self.inner
            .connect(&addr.into())
            .map_err(|source| SocketError::Connect { addr, source })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        self.inner
            .local_addr()
            .map_err(SocketError::Option)?
            .as_socket()
            .ok_or(SocketError::InvalidAddress)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<(), SocketError> {
        self.inner
            .set_nonblocking(nonblocking)
            .map_err(SocketError::Option)
    }

    pub fn set_buffer_sizes(&self, send: usize, recv: usize) -> Result<(), SocketError> {
        self.inner
            .set_send_buffer_size(send)
            .map_err(SocketError::Option)?;
        self.inner
            .set_recv_buffer_size(recv)
            .map_err(SocketError::Option)
    }

    /// Sends one datagram to the connected peer.
    pub fn send(&self, datagram: &[u8]) -> Result<usize, SocketError> {
        self.inner.send(datagram).map_err(SocketError::Send)
    }

    /// Sends one datagram to an explicit address (pre-connect handshake).
    pub fn send_to(&self, datagram: &[u8], addr: SocketAddr) -> Result<usize, SocketError> {
        self.inner
            .send_to(datagram, &addr.into())
            .map_err(SocketError::Send)
    }

    /// Waits up to `timeout` for one datagram. `Ok(None)` on timeout.
    ///
    /// A zero timeout is clamped to one millisecond; zero would put the
    /// socket into blocking mode.
    pub fn recv_timeout(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<(usize, SocketAddr)>, SocketError> {
        let timeout = timeout.max(Duration::from_millis(1));
        self.inner
            .set_read_timeout(Some(timeout))
            .map_err(SocketError::Option)?;

        let uninit =
            unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
        match self.inner.recv_from(uninit) {
            Ok((len, addr)) => {
                let addr = addr.as_socket().ok_or(SocketError::InvalidAddress)?;
                Ok(Some((len, addr)))
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(SocketError::Receive(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn bind_assigns_a_port() {
        let endpoint = UdpEndpoint::bind(local()).unwrap();
        assert!(endpoint.local_addr().unwrap().port() > 0);
    }

    #[test]
    fn datagram_roundtrip_with_timeout() {
        let a = UdpEndpoint::bind(local()).unwrap();
        let b = UdpEndpoint::bind(local()).unwrap();
        let b_addr = b.local_addr().unwrap();

        a.send_to(b"ping", b_addr).unwrap();
        let mut buf = [0u8; 64];
        let (len, from) = b
            .recv_timeout(&mut buf, Duration::from_millis(500))
            .unwrap()
            .expect("datagram should arrive");
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[test]
    fn timeout_returns_none() {
        let endpoint = UdpEndpoint::bind(local()).unwrap();
        let mut buf = [0u8; 64];
        let got = endpoint
            .recv_timeout(&mut buf, Duration::from_millis(20))
            .unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn connected_send_reaches_peer() {
        let a = UdpEndpoint::bind(local()).unwrap();
        let b = UdpEndpoint::bind(local()).unwrap();
        a.connect(b.local_addr().unwrap()).unwrap();
        a.send(b"hello").unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = b
            .recv_timeout(&mut buf, Duration::from_millis(500))
            .unwrap()
            .expect("datagram should arrive");
        assert_eq!(&buf[..len], b"hello");
    }
}
