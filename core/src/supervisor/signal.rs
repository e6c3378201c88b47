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

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::watcher::Supervisor;

/// wire INT/TERM to graceful stop and USR1 to rolling restart
///
/// best effort, platforms refusing a handler degrade silently, the
/// returned task alone does not keep the process alive
pub fn install_signal_handlers(supervisor: Supervisor) -> Option<JoinHandle<()>> {
    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("signal support unavailable: {e}");
            return None;
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("signal support unavailable: {e}");
            return None;
        }
    };
    let mut restart = match signal(SignalKind::user_defined1()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("signal support unavailable: {e}");
            return None;
        }
    };

    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = interrupt.recv() => {
                    info!("SIGINT: graceful stop");
                    if let Err(e) = supervisor.stop().await {
                        error!("stop failed: {e}");
                    }
                    break;
                }
                _ = terminate.recv() => {
                    info!("SIGTERM: graceful stop");
                    if let Err(e) = supervisor.stop().await {
                        error!("stop failed: {e}");
                    }
                    break;
                }
                _ = restart.recv() => {
                    info!("SIGUSR1: rolling restart");
                    if let Err(e) = supervisor.restart().await {
                        error!("restart failed: {e}");
                    }
                }
            }
        }
    }))
}
