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
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::IpcError;
use crate::ipc::channel::{IpcChannel, IpcReceiver};
use crate::ipc::message::Message;
use crate::network::socket::ListenerUri;
use crate::supervisor::watcher::SupervisorState;
use crate::transport::BindOutcome;

/// parent-side view of one worker's lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Ready,
    Stopping,
    Exited,
}

/// how a worker left the pool
#[derive(Debug, Clone)]
pub struct WorkerExit {
    /// exit status, `None` when the process could not be reaped
    pub status: Option<ExitStatus>,
    /// the parent asked for this exit
    pub requested: bool,
    /// channel-level failure observed before the exit, if any
    pub failure: Option<String>,
}

impl WorkerExit {
    /// a clean exit has a zero status and no channel failure
    pub fn clean(&self) -> bool {
        self.failure.is_none() && self.status.map(|s| s.success()).unwrap_or(false)
    }
}

type ParentEventHandler = Box<dyn Fn(u64, serde_json::Value) + Send + Sync>;

/// ordered per-event subscriber lists on the parent side
#[derive(Default)]
pub struct Subscribers {
    map: StdMutex<HashMap<String, Vec<ParentEventHandler>>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, event: &str, handler: F)
    where
        F: Fn(u64, serde_json::Value) + Send + Sync + 'static,
    {
        self.map
            .lock()
            .unwrap()
            .entry(event.to_string())
            .or_default()
            .push(Box::new(handler));
    }

    fn dispatch(&self, worker_id: u64, name: &str, payload: serde_json::Value) {
        let map = self.map.lock().unwrap();
        if let Some(list) = map.get(name) {
            for handler in list {
                handler(worker_id, payload.clone());
            }
        }
    }
}

/// everything a worker run loop needs from its supervisor
///
/// bind requests mutate the listener cache through the supervisor's
/// single state mutex
#[derive(Clone)]
pub struct RunContext {
    pub state: Arc<Mutex<SupervisorState>>,
    pub subscribers: Arc<Subscribers>,
}

/// parent-side object representing one live worker
pub struct WorkerHandle {
    id: u64,
    pid: u32,
    channel: IpcChannel,
    state: StdMutex<WorkerState>,
    shutdown_requested: AtomicBool,
    exited: CancellationToken,
    exit: StdMutex<Option<WorkerExit>>,
}

impl WorkerHandle {
    pub fn new(id: u64, pid: u32, channel: IpcChannel) -> Arc<Self> {
        Arc::new(WorkerHandle {
            id,
            pid,
            channel,
            state: StdMutex::new(WorkerState::Starting),
            shutdown_requested: AtomicBool::new(false),
            exited: CancellationToken::new(),
            exit: StdMutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// send one message down to the worker
    pub async fn send(&self, message: &Message) -> Result<(), IpcError> {
        self.channel.send(message).await
    }

    /// ask the worker to drain and exit
    pub async fn request_shutdown(&self) -> Result<(), IpcError> {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.set_state(WorkerState::Stopping);
        self.channel.send(&Message::Shutdown).await
    }

    /// forcible termination, the run loop reaps the process afterwards
    pub fn kill(&self) {
        match kill(Pid::from_raw(self.pid as i32), Signal::SIGKILL) {
            Ok(()) => warn!(worker = self.id, pid = self.pid, "worker killed"),
            Err(e) => debug!(worker = self.id, pid = self.pid, "kill skipped: {e}"),
        }
    }

    /// resolves once the worker exited and was reaped
    pub async fn wait_exit(&self) -> WorkerExit {
        self.exited.cancelled().await;
        self.exit.lock().unwrap().clone().unwrap_or(WorkerExit {
            status: None,
            requested: self.shutdown_requested(),
            failure: Some("exit record missing".to_string()),
        })
    }

    fn publish_exit(&self, exit: WorkerExit) {
        self.set_state(WorkerState::Exited);
        *self.exit.lock().unwrap() = Some(exit);
        self.exited.cancel();
    }
}

/// the moving parts of one worker, consumed by its run loop
pub struct WorkerDriver {
    handle: Arc<WorkerHandle>,
    child: Child,
    receiver: IpcReceiver,
}

impl WorkerDriver {
    pub fn new(handle: Arc<WorkerHandle>, child: Child, receiver: IpcReceiver) -> Self {
        WorkerDriver {
            handle,
            child,
            receiver,
        }
    }

    /// drive the worker until it exits, then reap it
    ///
    /// resolves with the exit record after stdout/stderr drained and the
    /// process was waited on
    pub async fn run(mut self, ctx: RunContext) -> WorkerExit {
        let handle = Arc::clone(&self.handle);
        let stdout_pump = self
            .child
            .stdout
            .take()
            .map(|out| spawn_pump(handle.id(), handle.pid(), out, false));
        let stderr_pump = self
            .child
            .stderr
            .take()
            .map(|err| spawn_pump(handle.id(), handle.pid(), err, true));

        let mut failure = None;
        loop {
            match self.receiver.recv().await {
                Ok(Some((message, fd))) => {
                    if let Some(stray) = fd {
                        // workers have no business sending descriptors up
                        warn!(worker = handle.id(), "closing unexpected descriptor");
                        unsafe {
                            libc::close(stray);
                        }
                    }
                    if let Err(e) = handle_message(&handle, &ctx, message).await {
                        if !handle.shutdown_requested() {
                            failure = Some(e.to_string());
                        }
                        break;
                    }
                }
                Ok(None) => {
                    debug!(worker = handle.id(), "worker closed the ipc channel");
                    break;
                }
                Err(e) => {
                    if !handle.shutdown_requested() {
                        failure = Some(e.to_string());
                    }
                    break;
                }
            }
        }

        let status = self.child.wait().await.ok();
        if let Some(pump) = stdout_pump {
            let _ = pump.await;
        }
        if let Some(pump) = stderr_pump {
            let _ = pump.await;
        }

        let exit = WorkerExit {
            status,
            requested: handle.shutdown_requested(),
            failure,
        };
        handle.publish_exit(exit.clone());
        exit
    }
}

async fn handle_message(
    handle: &Arc<WorkerHandle>,
    ctx: &RunContext,
    message: Message,
) -> Result<(), IpcError> {
    match message {
        Message::Ready => {
            handle.set_state(WorkerState::Ready);
            info!(worker = handle.id(), pid = handle.pid(), "worker ready");
        }
        Message::BindRequest { uri } => {
            answer_bind_request(handle, ctx, uri).await?;
        }
        Message::Event { name, payload } => {
            ctx.subscribers.dispatch(handle.id(), &name, payload);
        }
        Message::Terminated => {
            handle.set_state(WorkerState::Stopping);
            debug!(worker = handle.id(), "worker acknowledged shutdown");
        }
        other => {
            warn!(
                worker = handle.id(),
                "unexpected message from worker: {other:?}"
            );
        }
    }
    Ok(())
}

async fn answer_bind_request(
    handle: &Arc<WorkerHandle>,
    ctx: &RunContext,
    uri: String,
) -> Result<(), IpcError> {
    let parsed = match ListenerUri::parse(&uri) {
        Ok(parsed) => parsed,
        Err(e) => {
            error!(worker = handle.id(), %uri, "bind request rejected: {e}");
            return handle
                .send(&Message::BindError {
                    uri,
                    message: e.to_string(),
                })
                .await;
        }
    };
    let outcome = {
        let mut state = ctx.state.lock().await;
        state.obtain_listener(&parsed)
    };
    match outcome {
        Ok(BindOutcome::ReusePort) => {
            handle
                .send(&Message::BindResponse {
                    uri,
                    reuse_port: true,
                })
                .await
        }
        Ok(BindOutcome::PassFd(fd)) => {
            handle
                .channel
                .send_with_fd(
                    &Message::BindResponse {
                        uri,
                        reuse_port: false,
                    },
                    Some(fd),
                )
                .await
        }
        Err(e) => {
            error!(worker = handle.id(), %uri, "bind failed: {e}");
            handle
                .send(&Message::BindError {
                    uri,
                    message: e.to_string(),
                })
                .await
        }
    }
}

fn spawn_pump<R>(id: u64, pid: u32, reader: R, is_stderr: bool) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if is_stderr {
                        error!(worker = id, pid = pid, "{line}");
                    } else {
                        info!(worker = id, pid = pid, "{line}");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(worker = id, pid = pid, "output pump ended: {e}");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Strategy, Transport};
    use serde_json::json;
    use std::process::Stdio;
    use tokio::net::UnixStream;
    use tokio::process::Command;

    fn test_ctx(strategy: Strategy) -> RunContext {
        RunContext {
            state: Arc::new(Mutex::new(SupervisorState::new(Transport::new(strategy)))),
            subscribers: Arc::new(Subscribers::new()),
        }
    }

    fn echo_child() -> Child {
        Command::new("sh")
            .arg("-c")
            .arg("echo pump-out; echo pump-err >&2")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn run_reaps_the_child_and_publishes_a_clean_exit() {
        let (parent_stream, worker_stream) = UnixStream::pair().unwrap();
        let child = echo_child();
        let pid = child.id().unwrap();

        let (channel, receiver) = IpcChannel::new(parent_stream, Some(pid));
        let handle = WorkerHandle::new(1, pid, channel);
        assert_eq!(handle.state(), WorkerState::Starting);

        let (worker_channel, worker_rx) = IpcChannel::new(worker_stream, None);
        let ctx = test_ctx(Strategy::FdPassing);

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        ctx.subscribers.subscribe("pong", move |id, payload| {
            sink.lock().unwrap().push((id, payload));
        });

        let driver = WorkerDriver::new(Arc::clone(&handle), child, receiver);
        let run = tokio::spawn(driver.run(ctx));

        worker_channel.send(&Message::Ready).await.unwrap();
        worker_channel
            .send(&Message::Event {
                name: "pong".into(),
                payload: json!({"n": 1}),
            })
            .await
            .unwrap();
        drop(worker_channel);
        drop(worker_rx);

        let exit = run.await.unwrap();
        assert!(exit.clean(), "unexpected exit: {exit:?}");
        assert!(!exit.requested);
        assert_eq!(handle.state(), WorkerState::Exited);
        assert_eq!(seen.lock().unwrap().as_slice(), &[(1, json!({"n": 1}))]);

        // wait_exit resolves after the fact as well
        let again = handle.wait_exit().await;
        assert!(again.clean());
    }

    #[tokio::test]
    async fn bind_requests_are_answered_from_the_transport() {
        let (parent_stream, worker_stream) = UnixStream::pair().unwrap();
        let child = echo_child();
        let pid = child.id().unwrap();

        let (channel, receiver) = IpcChannel::new(parent_stream, Some(pid));
        let handle = WorkerHandle::new(7, pid, channel);
        let (worker_channel, mut worker_rx) = IpcChannel::new(worker_stream, None);

        let driver = WorkerDriver::new(Arc::clone(&handle), child, receiver);
        let run = tokio::spawn(driver.run(test_ctx(Strategy::FdPassing)));

        worker_channel
            .send(&Message::BindRequest {
                uri: "tcp://127.0.0.1:0".into(),
            })
            .await
            .unwrap();

        let (message, fd) = worker_rx.recv().await.unwrap().unwrap();
        match message {
            Message::BindResponse { reuse_port, .. } => assert!(!reuse_port),
            other => panic!("expected bind response, got {other:?}"),
        }
        let fd = fd.expect("descriptor expected");
        unsafe {
            libc::close(fd);
        }

        drop(worker_channel);
        drop(worker_rx);
        let exit = run.await.unwrap();
        assert!(exit.clean());
    }

    #[tokio::test]
    async fn requested_exits_swallow_channel_errors() {
        let (parent_stream, worker_stream) = UnixStream::pair().unwrap();
        let child = echo_child();
        let pid = child.id().unwrap();

        let (channel, receiver) = IpcChannel::new(parent_stream, Some(pid));
        let handle = WorkerHandle::new(2, pid, channel);
        let (worker_channel, mut worker_rx) = IpcChannel::new(worker_stream, None);

        let driver = WorkerDriver::new(Arc::clone(&handle), child, receiver);
        let run = tokio::spawn(driver.run(test_ctx(Strategy::FdPassing)));

        handle.request_shutdown().await.unwrap();
        let (message, _) = worker_rx.recv().await.unwrap().unwrap();
        assert_eq!(message, Message::Shutdown);

        drop(worker_channel);
        drop(worker_rx);
        let exit = run.await.unwrap();
        assert!(exit.requested);
        assert!(exit.failure.is_none());
    }
}
