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

use std::time::Duration;

use thiserror::Error;

/// errors raised on a single parent<->worker channel
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IpcError {
    /// the peer closed its end of the stream at a frame boundary
    #[error("ipc channel closed by peer")]
    ChannelClosed,

    /// the peer vanished mid-frame or the transport failed underneath us
    #[error("ipc peer gone: {0}")]
    PeerGone(String),

    /// the byte stream did not decode as a framed message
    #[error("malformed ipc frame: {0}")]
    MalformedFrame(String),

    /// any other i/o error on the stream
    #[error("ipc i/o error: {0}")]
    Io(String),
}

impl IpcError {
    /// closed & gone peers are the ordinary way a channel ends once the
    /// worker process exits, the rest indicate protocol trouble
    pub fn is_disconnect(&self) -> bool {
        matches!(self, IpcError::ChannelClosed | IpcError::PeerGone(_))
    }
}

impl From<std::io::Error> for IpcError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::ConnectionReset | ErrorKind::BrokenPipe | ErrorKind::ConnectionAborted => {
                IpcError::PeerGone(e.to_string())
            }
            _ => IpcError::Io(e.to_string()),
        }
    }
}

/// errors raised by the supervisor and its transport
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum SupervisorError {
    /// a listener uri could not be parsed
    #[error("invalid listener uri '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    /// binding a listening socket failed
    #[error("failed to bind {uri}: {reason}")]
    BindFailed { uri: String, reason: String },

    /// a worker never became part of the pool
    #[error("worker start failed: {reason}")]
    WorkerStartFailed { reason: String },

    /// a worker missed a start or stop deadline and was killed
    #[error("worker {pid} did not respond within {timeout:?}")]
    Timeout { pid: u32, timeout: Duration },

    /// replacing a dead worker failed, the pool is shutting down
    #[error("failed to respawn worker: {source}")]
    RespawnFailed {
        #[source]
        source: Box<SupervisorError>,
    },

    /// stop finished but some workers did not go down cleanly
    #[error("stop completed with {} worker failure(s)", failures.len())]
    StopFailed { failures: Vec<SupervisorError> },

    /// broadcast delivery failed for part of the pool
    #[error("broadcast failed for {} worker(s)", failures.len())]
    Broadcast { failures: Vec<(u64, IpcError)> },

    /// the caller violated an api precondition
    #[error("misuse: {0}")]
    Misuse(String),

    /// channel-level failure bubbling up
    #[error(transparent)]
    Ipc(#[from] IpcError),

    /// plain i/o failure outside any channel
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SupervisorError {
    fn from(e: std::io::Error) -> Self {
        SupervisorError::Io(e.to_string())
    }
}

impl SupervisorError {
    /// short stable label for logs
    pub fn as_label(&self) -> &'static str {
        match self {
            SupervisorError::InvalidUri { .. } => "invalid_uri",
            SupervisorError::BindFailed { .. } => "bind_failed",
            SupervisorError::WorkerStartFailed { .. } => "worker_start_failed",
            SupervisorError::Timeout { .. } => "timeout",
            SupervisorError::RespawnFailed { .. } => "respawn_failed",
            SupervisorError::StopFailed { .. } => "stop_failed",
            SupervisorError::Broadcast { .. } => "broadcast_failed",
            SupervisorError::Misuse(_) => "misuse",
            SupervisorError::Ipc(_) => "ipc",
            SupervisorError::Io(_) => "io",
        }
    }
}
