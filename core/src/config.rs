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

use std::path::PathBuf;
use std::time::Duration;

use crate::transport::Strategy;

/// how long a worker gets to connect back, drain on shutdown, etc.
pub const DEFAULT_WORKER_TIMEOUT: Duration = Duration::from_secs(5);

/// supervisor configuration
///
/// `worker_command` is the argv of the child program; on spawn the
/// supervisor inserts the ipc socket path as the first argument, ahead
/// of any arguments forwarded from the launcher.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// argv of the worker program
    pub worker_command: Vec<String>,
    /// number of workers the pool should hold
    pub worker_count: usize,
    /// deadline for worker start handshake and graceful stop
    pub worker_timeout: Duration,
    /// path of the parent's ipc listening socket
    pub ipc_socket_path: PathBuf,
    /// forced listener sharing strategy, `None` means autodetect
    pub strategy: Option<Strategy>,
}

impl SupervisorConfig {
    /// new configuration for the given worker argv
    pub fn new<S: Into<String>>(worker_command: Vec<S>) -> Self {
        SupervisorConfig {
            worker_command: worker_command.into_iter().map(Into::into).collect(),
            worker_count: 1,
            worker_timeout: DEFAULT_WORKER_TIMEOUT,
            ipc_socket_path: default_socket_path(),
            strategy: None,
        }
    }

    /// set the pool size
    pub fn with_workers(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// set the start/stop deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout = timeout;
        self
    }

    /// override the ipc socket path
    pub fn with_ipc_socket_path(mut self, path: PathBuf) -> Self {
        self.ipc_socket_path = path;
        self
    }

    /// force a listener sharing strategy instead of autodetection
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

/// per-process default under the OS temp directory
fn default_socket_path() -> PathBuf {
    std::env::temp_dir().join(format!("prefork-{}.sock", std::process::id()))
}
