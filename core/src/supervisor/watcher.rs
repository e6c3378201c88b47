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

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::join_all;
use tokio::net::UnixListener;
use tokio::process::Command;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::error::{IpcError, SupervisorError};
use crate::ipc::channel::IpcChannel;
use crate::ipc::message::Message;
use crate::network::socket::ListenerUri;
use crate::transport::{BindOutcome, Strategy, Transport};
use crate::worker::handle::{
    RunContext, Subscribers, WorkerDriver, WorkerExit, WorkerHandle, WorkerState,
};
use crate::worker::runtime::is_worker_process;

/// the pool supervisor
///
/// spawns workers, relays their lifecycle messages, restarts them when
/// they die and tears the pool down on request, cheap to clone
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

/// every mutable piece of supervisor state behind one mutex
///
/// transitions of `running`, the worker set, the ipc server and the
/// listener cache all happen on a single logical timeline
pub(crate) struct SupervisorState {
    running: bool,
    workers: Vec<Arc<WorkerHandle>>,
    // shared so the accept handshake can run without holding the lock
    ipc_server: Option<Arc<UnixListener>>,
    transport: Transport,
}

impl SupervisorState {
    pub(crate) fn new(transport: Transport) -> Self {
        SupervisorState {
            running: false,
            workers: Vec::new(),
            ipc_server: None,
            transport,
        }
    }

    /// serve one bind request from a worker run loop
    pub(crate) fn obtain_listener(
        &mut self,
        uri: &ListenerUri,
    ) -> Result<BindOutcome, SupervisorError> {
        self.transport.obtain_listener(uri)
    }
}

struct Inner {
    config: SupervisorConfig,
    state: Arc<Mutex<SupervisorState>>,
    // one worker in Starting at any instant, arrival order is the only
    // way to associate an accepted stream with its child
    start_gate: Semaphore,
    subscribers: Arc<Subscribers>,
    // one-shot per run, replaced when a stopped supervisor starts again
    done: StdMutex<CancellationToken>,
    run_error: StdMutex<Option<SupervisorError>>,
    next_worker_id: AtomicU64,
}

impl Supervisor {
    /// new idle supervisor
    ///
    /// refuses to exist inside a worker process
    pub fn new(config: SupervisorConfig) -> Result<Supervisor, SupervisorError> {
        if is_worker_process() {
            return Err(SupervisorError::Misuse(
                "cannot construct a supervisor inside a worker process".to_string(),
            ));
        }
        if config.worker_command.is_empty() {
            return Err(SupervisorError::Misuse(
                "worker command must not be empty".to_string(),
            ));
        }
        let strategy = config.strategy.unwrap_or_else(Strategy::detect);
        Ok(Supervisor {
            inner: Arc::new(Inner {
                config,
                state: Arc::new(Mutex::new(SupervisorState::new(Transport::new(strategy)))),
                start_gate: Semaphore::new(1),
                subscribers: Arc::new(Subscribers::new()),
                done: StdMutex::new(CancellationToken::new()),
                run_error: StdMutex::new(None),
                next_worker_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// subscribe to an application event coming up from any worker
    pub fn on_message<F>(&self, event: &str, handler: F)
    where
        F: Fn(u64, serde_json::Value) + Send + Sync + 'static,
    {
        self.inner.subscribers.subscribe(event, handler);
    }

    pub async fn is_running(&self) -> bool {
        self.inner.state.lock().await.running
    }

    /// pids of the current pool members
    pub async fn worker_pids(&self) -> Vec<u32> {
        let state = self.inner.state.lock().await;
        state.workers.iter().map(|w| w.pid()).collect()
    }

    /// pool members that reached `ready`
    pub async fn ready_count(&self) -> usize {
        let state = self.inner.state.lock().await;
        state
            .workers
            .iter()
            .filter(|w| w.state() == WorkerState::Ready)
            .count()
    }

    /// bring up a pool of `count` workers
    ///
    /// spawns are strictly serialized, a spawn failure tears the partial
    /// pool down and surfaces
    pub async fn start(&self, count: usize) -> Result<(), SupervisorError> {
        {
            let mut state = self.inner.state.lock().await;
            if state.running {
                return Err(SupervisorError::Misuse(
                    "start called while the pool is running".to_string(),
                ));
            }
            if count < 1 {
                return Err(SupervisorError::Misuse(
                    "worker count must be at least 1".to_string(),
                ));
            }
            let path = &self.inner.config.ipc_socket_path;
            if path.exists() {
                std::fs::remove_file(path)?;
            }
            let server = UnixListener::bind(path)?;
            state.ipc_server = Some(Arc::new(server));
            state.running = true;
            // fresh run, fresh completion
            let mut done = self.inner.done.lock().unwrap();
            if done.is_cancelled() {
                *done = CancellationToken::new();
            }
            *self.inner.run_error.lock().unwrap() = None;
        }
        info!(count, command = ?self.inner.config.worker_command, "starting worker pool");
        for _ in 0..count {
            if let Err(e) = self.spawn_worker().await {
                error!("pool start failed: {e}");
                let _ = self.stop().await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// spawn one worker and attach it to the pool
    ///
    /// boxed to break the spawn_worker/handle_exit mutual-recursion cycle
    /// at the type level, the compiler cannot otherwise resolve `Send` for
    /// the infinitely-nested `impl Future`
    fn spawn_worker(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<WorkerHandle>, SupervisorError>> + Send + '_>>
    {
        Box::pin(self.spawn_worker_inner())
    }

    async fn spawn_worker_inner(&self) -> Result<Arc<WorkerHandle>, SupervisorError> {
        let inner = &self.inner;
        let _permit = inner.start_gate.acquire().await.map_err(|_| {
            SupervisorError::WorkerStartFailed {
                reason: "start gate closed".to_string(),
            }
        })?;
        let server = {
            let state = inner.state.lock().await;
            if !state.running {
                return Err(SupervisorError::WorkerStartFailed {
                    reason: "supervisor is not running".to_string(),
                });
            }
            match &state.ipc_server {
                Some(server) => Arc::clone(server),
                None => {
                    return Err(SupervisorError::WorkerStartFailed {
                        reason: "ipc server is not listening".to_string(),
                    })
                }
            }
        };

        let config = &inner.config;
        let id = inner.next_worker_id.fetch_add(1, Ordering::SeqCst);
        let mut command = Command::new(&config.worker_command[0]);
        command
            // socket path first, the worker's own arguments follow
            .arg(&config.ipc_socket_path)
            .args(&config.worker_command[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command
            .spawn()
            .map_err(|e| SupervisorError::WorkerStartFailed {
                reason: format!("spawn of {} failed: {e}", config.worker_command[0]),
            })?;
        let pid = child.id().ok_or_else(|| SupervisorError::WorkerStartFailed {
            reason: "child exited before it could be registered".to_string(),
        })?;
        debug!(worker = id, pid, "worker spawned, awaiting connect-back");

        // the state lock is not held here, a concurrent stop is never
        // blocked behind the connect deadline
        let stream = match timeout(config.worker_timeout, server.accept()).await {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(SupervisorError::WorkerStartFailed {
                    reason: format!("ipc accept failed: {e}"),
                });
            }
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                warn!(worker = id, pid, "worker missed the connect deadline");
                return Err(SupervisorError::WorkerStartFailed {
                    reason: format!(
                        "worker {pid} did not connect within {:?}",
                        config.worker_timeout
                    ),
                });
            }
        };
        drop(server);

        let (channel, receiver) = IpcChannel::new(stream, Some(pid));
        let handle = WorkerHandle::new(id, pid, channel);
        {
            let mut state = inner.state.lock().await;
            if !state.running {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(SupervisorError::WorkerStartFailed {
                    reason: "supervisor stopped during start".to_string(),
                });
            }
            state.workers.push(Arc::clone(&handle));
        }

        let driver = WorkerDriver::new(Arc::clone(&handle), child, receiver);
        let ctx = RunContext {
            state: Arc::clone(&inner.state),
            subscribers: Arc::clone(&inner.subscribers),
        };
        // the exit hook must not keep the supervisor alive on its own
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let exit = driver.run(ctx).await;
            if let Some(inner) = weak.upgrade() {
                let supervisor = Supervisor { inner };
                supervisor.handle_exit(id, exit).await;
            }
        });
        info!(worker = id, pid, "worker attached");
        Ok(handle)
    }

    /// exit hook, fires once per worker when its run loop finishes
    async fn handle_exit(&self, id: u64, exit: WorkerExit) {
        let (removed, running) = {
            let mut state = self.inner.state.lock().await;
            let before = state.workers.len();
            state.workers.retain(|w| w.id() != id);
            (state.workers.len() != before, state.running)
        };
        if !removed {
            // stop or restart already detached it
            return;
        }
        if !running || exit.requested {
            debug!(worker = id, "worker detached");
            return;
        }
        if exit.clean() {
            info!(worker = id, "worker exited cleanly, respawning");
        } else if let Some(failure) = &exit.failure {
            error!(worker = id, "worker channel failed: {failure}, respawning");
        } else {
            error!(worker = id, status = ?exit.status, "worker died unexpectedly, respawning");
        }
        if let Err(e) = self.spawn_worker().await {
            let respawn = SupervisorError::RespawnFailed {
                source: Box::new(e),
            };
            error!("{respawn}");
            self.complete(Some(respawn));
            let _ = self.stop().await;
        }
    }

    /// tear the pool down
    ///
    /// idempotent, always resolves, escalates to SIGKILL for workers
    /// that miss the drain deadline
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let (workers, server) = {
            let mut state = self.inner.state.lock().await;
            state.running = false;
            let workers = std::mem::take(&mut state.workers);
            let server = state.ipc_server.take();
            (workers, server)
        };
        drop(server);
        let _ = std::fs::remove_file(&self.inner.config.ipc_socket_path);

        if !workers.is_empty() {
            info!(count = workers.len(), "stopping worker pool");
        }
        let drain_deadline = self.inner.config.worker_timeout;
        let results = join_all(
            workers
                .iter()
                .map(|worker| stop_worker(worker, drain_deadline)),
        )
        .await;
        let failures: Vec<SupervisorError> =
            results.into_iter().filter_map(|result| result.err()).collect();

        self.inner.state.lock().await.transport.clear();

        if failures.is_empty() {
            info!("worker pool stopped");
            self.complete(None);
            Ok(())
        } else {
            let err = SupervisorError::StopFailed { failures };
            error!("{err}");
            self.complete(Some(err.clone()));
            Err(err)
        }
    }

    /// rolling restart, replaces every pool member one at a time
    ///
    /// capacity stays at N-1 or better for the whole operation
    pub async fn restart(&self) -> Result<(), SupervisorError> {
        let snapshot = {
            let state = self.inner.state.lock().await;
            if !state.running {
                return Err(SupervisorError::Misuse(
                    "restart called while the pool is not running".to_string(),
                ));
            }
            state.workers.clone()
        };
        info!(count = snapshot.len(), "rolling restart");
        for worker in snapshot {
            let id = worker.id();
            if let Err(e) = worker.request_shutdown().await {
                debug!(worker = id, "shutdown request not delivered: {e}");
            }
            if timeout(self.inner.config.worker_timeout, worker.wait_exit())
                .await
                .is_err()
            {
                worker.kill();
                let _ = worker.wait_exit().await;
            }
            {
                let mut state = self.inner.state.lock().await;
                state.workers.retain(|w| w.id() != id);
            }
            if let Err(e) = self.spawn_worker().await {
                let respawn = SupervisorError::RespawnFailed {
                    source: Box::new(e),
                };
                error!("{respawn}");
                self.complete(Some(respawn.clone()));
                let _ = self.stop().await;
                return Err(respawn);
            }
        }
        info!("rolling restart complete");
        Ok(())
    }

    /// send an application event to every pool member
    ///
    /// best effort per worker, failures are collected instead of
    /// aborting delivery to the rest
    pub async fn broadcast(
        &self,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), SupervisorError> {
        let workers = {
            let state = self.inner.state.lock().await;
            state.workers.clone()
        };
        let sends = workers.iter().map(|worker| {
            let message = Message::Event {
                name: event.to_string(),
                payload: payload.clone(),
            };
            async move { worker.send(&message).await.map_err(|e| (worker.id(), e)) }
        });
        let failures: Vec<(u64, IpcError)> = join_all(sends)
            .await
            .into_iter()
            .filter_map(|result| result.err())
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            warn!(failed = failures.len(), "broadcast partially failed");
            Err(SupervisorError::Broadcast { failures })
        }
    }

    /// resolves when the supervisor's run is over
    ///
    /// the run ends on `stop` or on a failed respawn, whichever happens
    /// first, and reports the recorded error if there was one
    pub async fn wait(&self) -> Result<(), SupervisorError> {
        let done = self.inner.done.lock().unwrap().clone();
        done.cancelled().await;
        match self.inner.run_error.lock().unwrap().clone() {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// resolve the current run's completion exactly once, first error wins
    fn complete(&self, error: Option<SupervisorError>) {
        let done = self.inner.done.lock().unwrap().clone();
        if done.is_cancelled() {
            return;
        }
        {
            let mut slot = self.inner.run_error.lock().unwrap();
            if slot.is_none() {
                *slot = error;
            }
        }
        done.cancel();
    }
}

async fn stop_worker(
    worker: &Arc<WorkerHandle>,
    drain_deadline: Duration,
) -> Result<(), SupervisorError> {
    debug!(worker = worker.id(), "requesting graceful shutdown");
    if let Err(e) = worker.request_shutdown().await {
        debug!(worker = worker.id(), "shutdown request not delivered: {e}");
    }
    match timeout(drain_deadline, worker.wait_exit()).await {
        Ok(_) => Ok(()),
        Err(_) => {
            worker.kill();
            // SIGKILL closes the channel, the run loop reaps promptly
            let _ = worker.wait_exit().await;
            Err(SupervisorError::Timeout {
                pid: worker.pid(),
                timeout: drain_deadline,
            })
        }
    }
}
