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

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UnixStream;
use tokio::sync::Mutex;

use super::frame::{write_frame, FrameReader};
use super::message::Message;
use crate::error::IpcError;

/// who is on the other end of the channel
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    /// process id of the peer, `None` on the worker side
    pub pid: Option<u32>,
    /// when the channel was established
    pub created_at: Instant,
}

/// send half of one parent<->worker channel
///
/// concurrent senders are serialized by the internal mutex so receivers
/// observe whole frames in send order
pub struct IpcChannel {
    stream: Arc<UnixStream>,
    send_lock: Mutex<()>,
    peer: PeerIdentity,
}

/// receive half, single consumer
pub struct IpcReceiver {
    reader: FrameReader,
}

impl IpcChannel {
    /// wrap an established stream into a send half and a receive half
    pub fn new(stream: UnixStream, peer_pid: Option<u32>) -> (IpcChannel, IpcReceiver) {
        let stream = Arc::new(stream);
        let channel = IpcChannel {
            stream: Arc::clone(&stream),
            send_lock: Mutex::new(()),
            peer: PeerIdentity {
                pid: peer_pid,
                created_at: Instant::now(),
            },
        };
        let receiver = IpcReceiver {
            reader: FrameReader::new(stream),
        };
        (channel, receiver)
    }

    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    /// send one message
    pub async fn send(&self, message: &Message) -> Result<(), IpcError> {
        self.send_with_fd(message, None).await
    }

    /// send one message with a descriptor in the ancillary slot
    pub async fn send_with_fd(&self, message: &Message, fd: Option<RawFd>) -> Result<(), IpcError> {
        let payload =
            serde_json::to_vec(message).map_err(|e| IpcError::MalformedFrame(e.to_string()))?;
        let _guard = self.send_lock.lock().await;
        write_frame(&self.stream, &payload, fd).await
    }
}

impl IpcReceiver {
    /// next typed message, `None` once the peer closed its end
    ///
    /// a `BindResponse` that is not the port-reuse sentinel must carry a
    /// descriptor, its absence is a framing violation
    pub async fn recv(&mut self) -> Result<Option<(Message, Option<RawFd>)>, IpcError> {
        let bytes = match self.reader.next_frame().await? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let message: Message =
            serde_json::from_slice(&bytes).map_err(|e| IpcError::MalformedFrame(e.to_string()))?;
        let fd = if message.expects_fd() {
            match self.reader.take_fd() {
                Some(fd) => Some(fd),
                None => {
                    return Err(IpcError::MalformedFrame(
                        "bind response arrived without a descriptor".to_string(),
                    ))
                }
            }
        } else {
            None
        };
        Ok(Some((message, fd)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn channel_pair() -> (IpcChannel, IpcReceiver, IpcChannel, IpcReceiver) {
        let (a, b) = UnixStream::pair().unwrap();
        let (send_a, recv_a) = IpcChannel::new(a, Some(42));
        let (send_b, recv_b) = IpcChannel::new(b, None);
        (send_a, recv_a, send_b, recv_b)
    }

    #[tokio::test]
    async fn typed_messages_round_trip_in_order() {
        let (parent, _parent_rx, _worker, mut worker_rx) = channel_pair();

        parent.send(&Message::Shutdown).await.unwrap();
        parent
            .send(&Message::Event {
                name: "ping".into(),
                payload: json!(1),
            })
            .await
            .unwrap();

        let (first, fd) = worker_rx.recv().await.unwrap().unwrap();
        assert_eq!(first, Message::Shutdown);
        assert!(fd.is_none());

        let (second, _) = worker_rx.recv().await.unwrap().unwrap();
        assert!(matches!(second, Message::Event { name, .. } if name == "ping"));
    }

    #[tokio::test]
    async fn close_ends_the_receive_stream() {
        let (parent, parent_rx, _worker, mut worker_rx) = channel_pair();
        // both halves of the parent side must go away to close the stream
        drop(parent);
        drop(parent_rx);
        assert!(worker_rx.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn peer_identity_is_recorded() {
        let (parent, _parent_rx, worker, _worker_rx) = channel_pair();
        assert_eq!(parent.peer().pid, Some(42));
        assert_eq!(worker.peer().pid, None);
    }

    #[tokio::test]
    async fn fd_rides_with_its_bind_response() {
        use std::os::unix::io::{FromRawFd, IntoRawFd};

        let (parent, _parent_rx, _worker, mut worker_rx) = channel_pair();

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let fd = listener.into_raw_fd();

        parent
            .send_with_fd(
                &Message::BindResponse {
                    uri: format!("tcp://{address}"),
                    reuse_port: false,
                },
                Some(fd),
            )
            .await
            .unwrap();

        let (message, received) = worker_rx.recv().await.unwrap().unwrap();
        assert!(matches!(message, Message::BindResponse { .. }));
        let adopted = unsafe { std::net::TcpListener::from_raw_fd(received.unwrap()) };
        assert_eq!(adopted.local_addr().unwrap(), address);
        unsafe {
            libc::close(fd);
        }
    }
}
