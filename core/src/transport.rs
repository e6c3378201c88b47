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

use std::collections::HashMap;
use std::net::SocketAddr as StdSockAddr;
use std::os::unix::io::RawFd;

use tracing::{debug, info};

use crate::error::SupervisorError;
use crate::network::listener::{bind_cached, CachedListener};
use crate::network::socket::ListenerUri;
use crate::network::sockopt::reuse_port_supported;

/// how listening sockets are shared across the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// every worker binds the address itself with SO_REUSEPORT, the
    /// kernel balances accepts
    ReusePort,
    /// the parent binds once and hands descriptors to workers over ipc
    FdPassing,
}

impl Strategy {
    /// pick the best strategy this platform supports
    pub fn detect() -> Self {
        if reuse_port_supported() {
            Strategy::ReusePort
        } else {
            Strategy::FdPassing
        }
    }
}

/// answer to one `obtain_listener` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// sentinel, the worker creates its own listener
    ReusePort,
    /// descriptor of the parent-owned listener to pass to the worker
    PassFd(RawFd),
}

/// owner of the shared-listener policy and the parent's listener cache
///
/// a uri entering the cache is bound exactly once for the lifetime of
/// the supervisor, later workers get the same descriptor
pub struct Transport {
    strategy: Strategy,
    listeners_cache: HashMap<ListenerUri, CachedListener>,
}

impl Transport {
    pub fn new(strategy: Strategy) -> Self {
        info!(strategy = ?strategy, "listener sharing strategy selected");
        Transport {
            strategy,
            listeners_cache: HashMap::new(),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// serve one bind request from a worker
    ///
    /// unix-domain uris always take the descriptor path, the kernel has
    /// no port reuse for them
    pub fn obtain_listener(&mut self, uri: &ListenerUri) -> Result<BindOutcome, SupervisorError> {
        if self.strategy == Strategy::ReusePort && !uri.is_unix() {
            return Ok(BindOutcome::ReusePort);
        }
        if let Some(cached) = self.listeners_cache.get(uri) {
            debug!(%uri, "serving listener from cache");
            return Ok(BindOutcome::PassFd(cached.raw_fd()));
        }
        let cached = bind_cached(uri)?;
        info!(%uri, fd = cached.raw_fd(), "listener bound by parent");
        let fd = cached.raw_fd();
        self.listeners_cache.insert(uri.clone(), cached);
        Ok(BindOutcome::PassFd(fd))
    }

    /// bound address of a cached tcp listener
    pub fn cached_tcp_addr(&self, uri: &ListenerUri) -> Option<StdSockAddr> {
        self.listeners_cache
            .get(uri)
            .and_then(|cached| cached.tcp_local_addr())
    }

    /// drop every cached listener, unix socket files included
    pub fn clear(&mut self) {
        for (uri, cached) in self.listeners_cache.drain() {
            if let ListenerUri::Unix(path) = &uri {
                let _ = std::fs::remove_file(path);
            }
            drop(cached);
        }
    }
}
