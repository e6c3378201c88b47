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

use std::fmt;
use std::net::{SocketAddr as StdSockAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::SupervisorError;

/// typed listener address, parsed from a `tcp://` or `unix://` uri
///
/// this is the key of the parent's listener cache, so it must hash and
/// compare by the resolved address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenerUri {
    Tcp(StdSockAddr),
    Unix(PathBuf),
}

impl ListenerUri {
    /// parse a listener uri from its string form
    pub fn parse(raw: &str) -> Result<Self, SupervisorError> {
        if let Some(rest) = raw.strip_prefix("tcp://") {
            // resolve the host:port part, keep the first candidate
            let address = rest
                .to_socket_addrs()
                .map_err(|e| SupervisorError::InvalidUri {
                    uri: raw.to_string(),
                    reason: e.to_string(),
                })?
                .next()
                .ok_or_else(|| SupervisorError::InvalidUri {
                    uri: raw.to_string(),
                    reason: "address resolved to nothing".to_string(),
                })?;
            return Ok(ListenerUri::Tcp(address));
        }
        if let Some(rest) = raw.strip_prefix("unix://") {
            if rest.is_empty() {
                return Err(SupervisorError::InvalidUri {
                    uri: raw.to_string(),
                    reason: "empty socket path".to_string(),
                });
            }
            return Ok(ListenerUri::Unix(PathBuf::from(rest)));
        }
        Err(SupervisorError::InvalidUri {
            uri: raw.to_string(),
            reason: "expected tcp:// or unix:// scheme".to_string(),
        })
    }

    /// extract the tcp socket address from the type
    pub fn as_tcp(&self) -> Option<&StdSockAddr> {
        if let ListenerUri::Tcp(address) = self {
            Some(address)
        } else {
            None
        }
    }

    /// extract the unix socket path from the type
    pub fn as_unix(&self) -> Option<&PathBuf> {
        if let ListenerUri::Unix(path) = self {
            Some(path)
        } else {
            None
        }
    }

    /// unix-domain listeners cannot share a port via the kernel
    pub fn is_unix(&self) -> bool {
        matches!(self, ListenerUri::Unix(_))
    }
}

impl fmt::Display for ListenerUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerUri::Tcp(address) => write!(f, "tcp://{address}"),
            ListenerUri::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

impl FromStr for ListenerUri {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ListenerUri::parse(s)
    }
}
