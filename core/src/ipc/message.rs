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

use serde::{Deserialize, Serialize};

/// one application message on the parent<->worker channel
///
/// encoded as a json record inside a length framed envelope, a listener
/// descriptor rides in the ancillary slot of the same send when a
/// `BindResponse` is not the port-reuse sentinel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    /// worker asks the parent for a listener
    BindRequest { uri: String },
    /// parent answers a bind request, `reuse_port` tells the worker to
    /// bind the address itself instead of adopting a descriptor
    BindResponse { uri: String, reuse_port: bool },
    /// parent could not produce a listener for the uri
    BindError { uri: String, message: String },
    /// worker finished initialization
    Ready,
    /// application defined notification, either direction
    Event {
        name: String,
        payload: serde_json::Value,
    },
    /// parent asks the worker to drain and exit
    Shutdown,
    /// final worker ack preceding exit
    Terminated,
}

impl Message {
    /// whether this message carries a descriptor in ancillary data
    pub fn expects_fd(&self) -> bool {
        matches!(
            self,
            Message::BindResponse {
                reuse_port: false,
                ..
            }
        )
    }
}
