//! Copyright (c) 2024-2025 Prefork Contributors
//!
//! This file is part of Prefork
//!
//! This program is free software: you can redistribute it and/or modify
//! it under the terms of the GNU Affero General Public License as published by
//! the Free Software Foundation, either version 3 of the License, or
//! (at your option) any later version.
//!
//! This program is distributed in the hope that it will be useful
//! but WITHOUT ANY WARRANTY; without even the implied warranty of
//! MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
//! GNU Affero General Public License for more details.
//!
//! You should have received a copy of the GNU Affero General Public License
//! along with this program.  If not, see <http://www.gnu.org/licenses/>.

use std::io;
use std::net::SocketAddr as StdSockAddr;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::pin::Pin;
use std::task::{Context, Poll};

use socket2::{Domain, SockAddr, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use super::sockopt::{set_ipv6_only, set_reuse_addr, set_reuse_port};
use crate::error::SupervisorError;
use crate::network::socket::ListenerUri;

const LISTENER_BACKLOG: u32 = 65535;

/// the main listener type, lives in the worker which accepts on it
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl From<TcpListener> for Listener {
    fn from(l: TcpListener) -> Self {
        Self::Tcp(l)
    }
}

impl From<UnixListener> for Listener {
    fn from(l: UnixListener) -> Self {
        Self::Unix(l)
    }
}

impl Listener {
    /// accept one downstream connection
    pub async fn accept(&self) -> io::Result<Stream> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                // nodelay by default
                let _ = stream.set_nodelay(true);
                Ok(Stream::Tcp(stream))
            }
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Stream::Unix(stream))
            }
        }
    }

    /// bound tcp address, `None` for unix listeners
    pub fn tcp_local_addr(&self) -> Option<StdSockAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            Listener::Unix(_) => None,
        }
    }
}

/// one accepted downstream connection
#[derive(Debug)]
pub enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            Stream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Stream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            Stream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Stream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Stream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Stream::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Stream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Stream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// a listening socket owned by the parent for fd distribution
///
/// the parent never accepts on it, the descriptor is what matters
#[derive(Debug)]
pub enum CachedListener {
    Tcp(std::net::TcpListener),
    Unix(std::os::unix::net::UnixListener),
}

impl CachedListener {
    /// the descriptor that rides to workers in ancillary data
    pub fn raw_fd(&self) -> RawFd {
        match self {
            CachedListener::Tcp(listener) => listener.as_raw_fd(),
            CachedListener::Unix(listener) => listener.as_raw_fd(),
        }
    }

    /// bound tcp address, `None` for unix listeners
    pub fn tcp_local_addr(&self) -> Option<StdSockAddr> {
        match self {
            CachedListener::Tcp(listener) => listener.local_addr().ok(),
            CachedListener::Unix(_) => None,
        }
    }
}

fn bind_failed(uri: &ListenerUri, e: io::Error) -> SupervisorError {
    SupervisorError::BindFailed {
        uri: uri.to_string(),
        reason: e.to_string(),
    }
}

/// parent-side bind, the result goes into the listener cache
///
/// tcp sockets get reuseaddr so a restarted supervisor can rebind an
/// address with sockets still in TIME-WAIT, ipv6 addresses are limited
/// to ipv6 traffic, stale unix socket files are removed before binding
pub fn bind_cached(uri: &ListenerUri) -> Result<CachedListener, SupervisorError> {
    match uri {
        ListenerUri::Tcp(address) => {
            let domain = if address.is_ipv6() {
                Domain::IPV6
            } else {
                Domain::IPV4
            };
            let socket = Socket::new(domain, Type::STREAM, None).map_err(|e| bind_failed(uri, e))?;
            set_reuse_addr(socket.as_raw_fd(), true).map_err(|e| bind_failed(uri, e))?;
            if address.is_ipv6() {
                set_ipv6_only(socket.as_raw_fd(), true).map_err(|e| bind_failed(uri, e))?;
            }
            socket
                .bind(&SockAddr::from(*address))
                .map_err(|e| bind_failed(uri, e))?;
            socket
                .listen(LISTENER_BACKLOG as i32)
                .map_err(|e| bind_failed(uri, e))?;
            Ok(CachedListener::Tcp(socket.into()))
        }
        ListenerUri::Unix(path) => {
            // remove stale socket file left behind by a previous run
            if path.exists() {
                std::fs::remove_file(path).map_err(|e| bind_failed(uri, e))?;
            }
            let socket =
                Socket::new(Domain::UNIX, Type::STREAM, None).map_err(|e| bind_failed(uri, e))?;
            let address = SockAddr::unix(path).map_err(|e| bind_failed(uri, e))?;
            socket.bind(&address).map_err(|e| bind_failed(uri, e))?;
            socket
                .listen(LISTENER_BACKLOG as i32)
                .map_err(|e| bind_failed(uri, e))?;
            Ok(CachedListener::Unix(socket.into()))
        }
    }
}

/// worker-side bind under the kernel port-reuse strategy
pub fn bind_reuse_port(uri: &ListenerUri) -> Result<Listener, SupervisorError> {
    let address = match uri {
        ListenerUri::Tcp(address) => *address,
        ListenerUri::Unix(_) => {
            return Err(SupervisorError::BindFailed {
                uri: uri.to_string(),
                reason: "port reuse is unavailable for unix-domain listeners".to_string(),
            })
        }
    };
    let domain = if address.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, None).map_err(|e| bind_failed(uri, e))?;
    set_reuse_addr(socket.as_raw_fd(), true).map_err(|e| bind_failed(uri, e))?;
    set_reuse_port(socket.as_raw_fd()).map_err(|e| bind_failed(uri, e))?;
    if address.is_ipv6() {
        set_ipv6_only(socket.as_raw_fd(), true).map_err(|e| bind_failed(uri, e))?;
    }
    socket
        .bind(&SockAddr::from(address))
        .map_err(|e| bind_failed(uri, e))?;
    socket
        .listen(LISTENER_BACKLOG as i32)
        .map_err(|e| bind_failed(uri, e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| bind_failed(uri, e))?;
    let listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(listener)
        .map(Listener::from)
        .map_err(|e| bind_failed(uri, e))
}

/// adopt a descriptor received over ipc as a usable listener
///
/// the descriptor must be an owned, listening socket of the family the
/// uri names, ownership transfers to the returned listener
pub fn from_passed_fd(uri: &ListenerUri, fd: RawFd) -> io::Result<Listener> {
    match uri {
        ListenerUri::Tcp(_) => {
            let listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
            listener.set_nonblocking(true)?;
            TcpListener::from_std(listener).map(Listener::from)
        }
        ListenerUri::Unix(_) => {
            let listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(fd) };
            listener.set_nonblocking(true)?;
            UnixListener::from_std(listener).map(Listener::from)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::IntoRawFd;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn cached_tcp_bind_reports_ephemeral_port() {
        let uri = ListenerUri::parse("tcp://127.0.0.1:0").unwrap();
        let cached = bind_cached(&uri).unwrap();
        let address = cached.tcp_local_addr().unwrap();
        assert_ne!(address.port(), 0);
        assert!(cached.raw_fd() >= 0);
    }

    #[test]
    fn cached_unix_bind_removes_stale_path() {
        let path = std::env::temp_dir().join(format!("prefork-stale-{}.sock", std::process::id()));
        std::fs::write(&path, b"stale").unwrap();
        let uri = ListenerUri::Unix(path.clone());
        let cached = bind_cached(&uri).unwrap();
        assert!(cached.raw_fd() >= 0);
        drop(cached);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn reuse_port_allows_two_binds() {
        let first = bind_reuse_port(&ListenerUri::parse("tcp://127.0.0.1:0").unwrap()).unwrap();
        let address = first.tcp_local_addr().unwrap();
        let uri = ListenerUri::Tcp(address);
        let _second = bind_reuse_port(&uri).unwrap();
    }

    #[test]
    fn reuse_port_rejects_unix() {
        let uri = ListenerUri::parse("unix:///tmp/does-not-matter.sock").unwrap();
        assert!(matches!(
            bind_reuse_port(&uri),
            Err(SupervisorError::BindFailed { .. })
        ));
    }

    #[tokio::test]
    async fn adopted_fd_accepts_connections() {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = std_listener.local_addr().unwrap();
        let uri = ListenerUri::Tcp(address);
        let listener = from_passed_fd(&uri, std_listener.into_raw_fd()).unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(address).await.unwrap();
            stream.write_all(b"hi").await.unwrap();
        });

        let mut accepted = listener.accept().await.unwrap();
        let mut buf = [0u8; 2];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        client.await.unwrap();
    }
}
