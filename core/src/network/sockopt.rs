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

use libc::{self, c_int, c_void, socklen_t};
use std::{io, mem, os::unix::io::RawFd};

/// wrapper used to set socket options
fn set_socket_option<T: Copy>(
    fd: RawFd,
    level: c_int,
    optname: c_int,
    value: &T,
) -> io::Result<()> {
    let result = unsafe {
        libc::setsockopt(
            fd,
            level,
            optname,
            value as *const T as *const c_void,
            mem::size_of::<T>() as socklen_t,
        )
    };

    if result == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Enable address reuse on a socket.
/// This lets a listener rebind an address that still has sockets in the
/// TIME-WAIT state.
pub fn set_reuse_addr(fd: RawFd, enable: bool) -> io::Result<()> {
    set_socket_option(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, &(enable as c_int))
}

/// Enable port reuse on a socket.
/// This allows multiple sockets to bind to the same port; the kernel
/// load-balances incoming connections across all of them.
pub fn set_reuse_port(fd: RawFd) -> io::Result<()> {
    set_socket_option(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, &(1 as c_int))
}

/// Set IPV6_V6ONLY flag (limit the socket to IPv6 communication only).
/// This is mostly useful when binding to `[::]`, which on most Unix
/// distributions will bind to both IPv4 and IPv6 addresses by default.
pub fn set_ipv6_only(fd: RawFd, enable: bool) -> io::Result<()> {
    set_socket_option(
        fd,
        libc::IPPROTO_IPV6,
        libc::IPV6_V6ONLY,
        &(enable as c_int),
    )
}

/// probe whether this platform accepts SO_REUSEPORT on a stream socket
pub fn reuse_port_supported() -> bool {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return false;
    }
    let supported = set_reuse_port(fd).is_ok();
    unsafe {
        libc::close(fd);
    }
    supported
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn reuse_options_apply_to_a_live_socket() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let fd = listener.as_raw_fd();
        set_reuse_addr(fd, true).unwrap();
        set_reuse_port(fd).unwrap();
    }

    #[test]
    fn probe_does_not_panic() {
        // value is platform dependent, the probe itself must be safe
        let _ = reuse_port_supported();
    }

    #[test]
    fn invalid_fd_reports_error() {
        assert!(set_reuse_addr(-1, true).is_err());
    }
}
