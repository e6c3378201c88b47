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

use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use nix::sys::socket::{self, ControlMessage, ControlMessageOwned, MsgFlags, RecvMsg, UnixAddr};
use tokio::io::Interest;
use tokio::net::UnixStream;
use tracing::warn;

use crate::error::IpcError;

/// frames larger than this are considered corrupt
const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// the maximum descriptors one receive is prepared for
const MAX_FDS: usize = 8;

const READ_CHUNK: usize = 16 * 1024;

fn nix_to_io(e: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

/// write one length framed payload, optionally attaching a descriptor
///
/// the descriptor rides in the SCM_RIGHTS slot of the sendmsg carrying
/// the first bytes of the frame, the sender keeps its own copy
pub async fn write_frame(
    stream: &UnixStream,
    payload: &[u8],
    fd: Option<RawFd>,
) -> Result<(), IpcError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(IpcError::MalformedFrame(format!(
            "outbound frame of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_FRAME_LEN
        )));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);

    let mut sent = 0;
    let mut fd_pending = fd;
    while sent < frame.len() {
        stream.writable().await.map_err(IpcError::from)?;
        let result = stream.try_io(Interest::WRITABLE, || {
            let iov = [IoSlice::new(&frame[sent..])];
            let written = match fd_pending {
                Some(raw) => {
                    let fds = [raw];
                    let cmsg = [ControlMessage::ScmRights(&fds)];
                    socket::sendmsg(
                        stream.as_raw_fd(),
                        &iov,
                        &cmsg,
                        MsgFlags::empty(),
                        None::<&UnixAddr>,
                    )
                }
                None => socket::sendmsg(
                    stream.as_raw_fd(),
                    &iov,
                    &[],
                    MsgFlags::empty(),
                    None::<&UnixAddr>,
                ),
            }
            .map_err(nix_to_io)?;
            Ok(written)
        });
        match result {
            Ok(written) => {
                sent += written;
                if written > 0 {
                    // ancillary data went out with the first bytes
                    fd_pending = None;
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(IpcError::from(e)),
        }
    }
    Ok(())
}

/// buffered frame reader over one unix stream
///
/// every read goes through the descriptor-aware receive path, received
/// descriptors queue up until the frame they belong to is claimed
pub struct FrameReader {
    stream: Arc<UnixStream>,
    buf: Vec<u8>,
    fds: VecDeque<RawFd>,
}

impl FrameReader {
    pub fn new(stream: Arc<UnixStream>) -> Self {
        FrameReader {
            stream,
            buf: Vec::new(),
            fds: VecDeque::new(),
        }
    }

    /// next whole frame payload, `None` on clean close at a frame boundary
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, IpcError> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                return Ok(Some(frame));
            }
            let read = self.recv_chunk().await?;
            if read == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(IpcError::PeerGone(format!(
                    "peer closed with {} unframed byte(s) pending",
                    self.buf.len()
                )));
            }
        }
    }

    /// claim the oldest unclaimed descriptor
    pub fn take_fd(&mut self) -> Option<RawFd> {
        self.fds.pop_front()
    }

    fn parse_frame(&mut self) -> Result<Option<Vec<u8>>, IpcError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let mut header = [0u8; 4];
        header.copy_from_slice(&self.buf[..4]);
        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(IpcError::MalformedFrame(format!(
                "frame header announces {len} bytes, limit is {MAX_FRAME_LEN}"
            )));
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        let frame = self.buf[4..4 + len].to_vec();
        self.buf.drain(..4 + len);
        Ok(Some(frame))
    }

    async fn recv_chunk(&mut self) -> Result<usize, IpcError> {
        loop {
            self.stream.readable().await.map_err(IpcError::from)?;
            let mut chunk = [0u8; READ_CHUNK];
            let result = self.stream.try_io(Interest::READABLE, || {
                let mut iov = [IoSliceMut::new(&mut chunk)];
                let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_FDS]);
                let msg: RecvMsg<UnixAddr> = socket::recvmsg(
                    self.stream.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg_buf),
                    MsgFlags::empty(),
                )
                .map_err(nix_to_io)?;
                let mut fds = Vec::new();
                for cmsg in msg.cmsgs() {
                    if let ControlMessageOwned::ScmRights(received) = cmsg {
                        fds.extend(received);
                    } else {
                        warn!("unexpected control message on ipc stream: {cmsg:?}");
                    }
                }
                Ok((msg.bytes, fds))
            });
            match result {
                Ok((read, fds)) => {
                    self.buf.extend_from_slice(&chunk[..read]);
                    self.fds.extend(fds);
                    return Ok(read);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(IpcError::from(e)),
            }
        }
    }
}

impl Drop for FrameReader {
    fn drop(&mut self) {
        // descriptors nobody claimed must not leak
        for fd in self.fds.drain(..) {
            unsafe {
                libc::close(fd);
            }
        }
    }
}
