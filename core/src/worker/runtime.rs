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

use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::net::UnixStream;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{IpcError, SupervisorError};
use crate::ipc::channel::{IpcChannel, IpcReceiver};
use crate::ipc::message::Message;
use crate::network::listener::{bind_reuse_port, from_passed_fd, Listener};
use crate::network::socket::ListenerUri;

/// process-scoped marker, set once this process attaches as a worker
static WORKER_PROCESS: AtomicBool = AtomicBool::new(false);

/// whether the current process is a worker attached to a supervisor
pub(crate) fn is_worker_process() -> bool {
    WORKER_PROCESS.load(Ordering::SeqCst)
}

type EventHandler = Box<dyn Fn(serde_json::Value) + Send + Sync>;

type BindReply = Result<(bool, Option<RawFd>), SupervisorError>;

/// the worker side of the cluster, handed to the user script
///
/// cheap to clone, every clone shares the channel to the parent
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    channel: IpcChannel,
    shutdown: CancellationToken,
    pending_binds: StdMutex<VecDeque<oneshot::Sender<BindReply>>>,
    handlers: StdMutex<HashMap<String, Vec<EventHandler>>>,
    // one bind round trip at a time, responses match requests by order
    bind_gate: Mutex<()>,
}

impl Worker {
    /// whether the current process is a worker attached to a supervisor
    pub fn is_worker() -> bool {
        is_worker_process()
    }

    /// connect back to the parent over the socket path received as the
    /// first command line argument
    pub async fn connect<P: AsRef<Path>>(socket_path: P) -> Result<Worker, SupervisorError> {
        let stream = UnixStream::connect(socket_path.as_ref())
            .await
            .map_err(|e| SupervisorError::Ipc(IpcError::from(e)))?;
        WORKER_PROCESS.store(true, Ordering::SeqCst);

        let (channel, receiver) = IpcChannel::new(stream, None);
        let inner = Arc::new(WorkerInner {
            channel,
            shutdown: CancellationToken::new(),
            pending_binds: StdMutex::new(VecDeque::new()),
            handlers: StdMutex::new(HashMap::new()),
            bind_gate: Mutex::new(()),
        });
        tokio::spawn(dispatch(Arc::clone(&inner), receiver));
        Ok(Worker { inner })
    }

    /// tell the parent initialization is done
    pub async fn ready(&self) -> Result<(), IpcError> {
        self.inner.channel.send(&Message::Ready).await
    }

    /// ask the parent for a listener on `uri`
    ///
    /// under kernel port reuse the worker binds the address itself,
    /// otherwise it adopts the descriptor the parent passed over
    pub async fn get_listener(&self, uri: &str) -> Result<Listener, SupervisorError> {
        let parsed = ListenerUri::parse(uri)?;
        let _gate = self.inner.bind_gate.lock().await;

        let (tx, rx) = oneshot::channel();
        self.inner.pending_binds.lock().unwrap().push_back(tx);
        if let Err(e) = self
            .inner
            .channel
            .send(&Message::BindRequest {
                uri: parsed.to_string(),
            })
            .await
        {
            // nothing went out, keep the response matching in sync
            self.inner.pending_binds.lock().unwrap().pop_back();
            return Err(SupervisorError::Ipc(e));
        }

        let reply = rx
            .await
            .map_err(|_| SupervisorError::Ipc(IpcError::ChannelClosed))?;
        let (reuse_port, fd) = reply?;
        if reuse_port {
            return bind_reuse_port(&parsed);
        }
        let fd = fd.ok_or_else(|| {
            SupervisorError::Ipc(IpcError::MalformedFrame(
                "bind response arrived without a descriptor".to_string(),
            ))
        })?;
        from_passed_fd(&parsed, fd).map_err(|e| SupervisorError::BindFailed {
            uri: parsed.to_string(),
            reason: e.to_string(),
        })
    }

    /// subscribe to an application event from the parent
    pub fn on_message<F>(&self, event: &str, handler: F)
    where
        F: Fn(serde_json::Value) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .lock()
            .unwrap()
            .entry(event.to_string())
            .or_default()
            .push(Box::new(handler));
    }

    /// emit an application event to the parent
    pub async fn send(&self, event: &str, payload: serde_json::Value) -> Result<(), IpcError> {
        self.inner
            .channel
            .send(&Message::Event {
                name: event.to_string(),
                payload,
            })
            .await
    }

    /// completes when the parent requests shutdown or goes away
    pub async fn await_shutdown(&self) {
        self.inner.shutdown.cancelled().await;
    }

    /// final ack preceding exit
    pub async fn notify_terminated(&self) -> Result<(), IpcError> {
        self.inner.channel.send(&Message::Terminated).await
    }
}

async fn dispatch(inner: Arc<WorkerInner>, mut receiver: IpcReceiver) {
    loop {
        match receiver.recv().await {
            Ok(Some((message, fd))) => match message {
                Message::BindResponse { reuse_port, .. } => {
                    complete_bind(&inner, Ok((reuse_port, fd)));
                }
                Message::BindError { uri, message } => {
                    complete_bind(
                        &inner,
                        Err(SupervisorError::BindFailed {
                            uri,
                            reason: message,
                        }),
                    );
                }
                Message::Event { name, payload } => {
                    let handlers = inner.handlers.lock().unwrap();
                    if let Some(list) = handlers.get(&name) {
                        for handler in list {
                            handler(payload.clone());
                        }
                    }
                }
                Message::Shutdown => {
                    debug!("shutdown requested by parent");
                    inner.shutdown.cancel();
                }
                other => {
                    debug!("ignoring unexpected message from parent: {other:?}");
                }
            },
            Ok(None) => {
                debug!("parent closed the ipc channel");
                break;
            }
            Err(e) => {
                warn!("ipc receive failed: {e}");
                break;
            }
        }
    }
    // a worker without a parent has nothing left to serve
    inner.shutdown.cancel();
    fail_pending_binds(&inner);
}

fn complete_bind(inner: &WorkerInner, reply: BindReply) {
    let sender = inner.pending_binds.lock().unwrap().pop_front();
    match sender {
        Some(tx) => {
            if let Err(unclaimed) = tx.send(reply) {
                close_reply_fd(unclaimed);
            }
        }
        None => {
            warn!("unsolicited bind response from parent");
            close_reply_fd(reply);
        }
    }
}

fn fail_pending_binds(inner: &WorkerInner) {
    let mut pending = inner.pending_binds.lock().unwrap();
    while let Some(tx) = pending.pop_front() {
        let _ = tx.send(Err(SupervisorError::Ipc(IpcError::ChannelClosed)));
    }
}

fn close_reply_fd(reply: BindReply) {
    if let Ok((_, Some(fd))) = reply {
        unsafe {
            libc::close(fd);
        }
    }
}
