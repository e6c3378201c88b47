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

//! pre-forking cluster supervisor
//!
//! a parent process spawns a pool of worker subprocesses that share a
//! set of listening sockets, either through kernel port reuse or by
//! descriptor passing over a private unix-domain channel. the parent
//! supervises worker lifetimes: it respawns workers that die, performs
//! serialized rolling restarts, broadcasts application events and tears
//! the pool down gracefully with a kill escalation deadline.
//!
//! the parent side revolves around [`Supervisor`], the worker side
//! around [`Worker`], which the user program constructs from the socket
//! path it receives as its first command line argument.

pub mod config;
pub mod error;
pub mod ipc;
pub mod network;
pub mod supervisor;
pub mod transport;
pub mod worker;

pub use config::SupervisorConfig;
pub use error::{IpcError, SupervisorError};
pub use ipc::message::Message;
pub use network::listener::{Listener, Stream};
pub use network::socket::ListenerUri;
pub use supervisor::signal::install_signal_handlers;
pub use supervisor::watcher::Supervisor;
pub use transport::Strategy;
pub use worker::handle::{WorkerExit, WorkerHandle, WorkerState};
pub use worker::runtime::Worker;
