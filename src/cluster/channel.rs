//! Handle passing between master and workers.
//!
//! # Wire Format
//! ```text
//! worker → master   one JSON line: {"pid": 4242}\n
//! master → worker   per connection: 1 byte 'H' + SCM_RIGHTS carrying one fd
//! ```
//!
//! # Design Decisions
//! - The master drops its copy of the descriptor right after `sendmsg`; from
//!   then on the worker is the only owner of the connection.
//! - End of stream on the channel means the other side is gone.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWriteExt, Interest};
use tokio::net::{TcpStream, UnixStream};

/// Tag byte accompanying every transferred handle.
pub const HANDLE_TAG: u8 = b'H';

/// First message a worker sends after connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHello {
    pub pid: u32,
}

/// Why a connection could not be transferred.
#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    #[error("Failed to detach socket from the runtime: {0}")]
    Detach(#[source] io::Error),
    #[error("Worker channel is closed")]
    ChannelClosed,
    #[error("Failed to send handle: {0}")]
    Send(#[source] io::Error),
}

/// Master side of one worker's channel.
#[derive(Debug)]
pub struct WorkerChannel {
    stream: UnixStream,
}

impl WorkerChannel {
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Transfer `stream` to the worker.
    ///
    /// The local descriptor is closed before returning, whatever the outcome.
    pub async fn send_stream(&self, stream: TcpStream) -> Result<(), HandoffError> {
        let socket = stream.into_std().map_err(HandoffError::Detach)?;
        let fd = socket.as_raw_fd();
        let channel_fd = self.stream.as_raw_fd();
        let tag = [HANDLE_TAG];

        let sent = self
            .stream
            .async_io(Interest::WRITABLE, || {
                let iov = [IoSlice::new(&tag)];
                let fds = [fd];
                let cmsgs = [ControlMessage::ScmRights(&fds)];
                sendmsg::<()>(channel_fd, &iov, &cmsgs, MsgFlags::empty(), None).map_err(io::Error::from)
            })
            .await;

        drop(socket);

        match sent {
            Ok(0) => Err(HandoffError::ChannelClosed),
            Ok(_) => Ok(()),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::NotConnected
                ) =>
            {
                Err(HandoffError::ChannelClosed)
            }
            Err(e) => Err(HandoffError::Send(e)),
        }
    }

    /// Resolves when the worker hangs up.
    pub async fn closed(&self) {
        let mut scratch = [0u8; 64];
        loop {
            if self.stream.readable().await.is_err() {
                return;
            }
            match self.stream.try_read(&mut scratch) {
                Ok(0) => return,
                // Workers send nothing after the hello; ignore stray bytes.
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(_) => return,
            }
        }
    }
}

/// Worker side: receives connections from the master.
#[derive(Debug)]
pub struct HandleReceiver {
    stream: UnixStream,
}

impl HandleReceiver {
    /// Connect to the master's cluster socket and introduce this process.
    pub async fn connect(path: &Path) -> io::Result<Self> {
        let mut stream = UnixStream::connect(path).await?;
        let mut hello = serde_json::to_vec(&WorkerHello {
            pid: std::process::id(),
        })?;
        hello.push(b'\n');
        stream.write_all(&hello).await?;
        Ok(Self { stream })
    }

    /// Wrap an already-connected channel without sending a hello.
    pub fn from_stream(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Wait for the next connection. `Ok(None)` means the master hung up.
    pub async fn recv_stream(&self) -> io::Result<Option<TcpStream>> {
        let channel_fd = self.stream.as_raw_fd();
        let received = self
            .stream
            .async_io(Interest::READABLE, || recv_handle(channel_fd))
            .await?;

        match received {
            None => Ok(None),
            Some(fd) => {
                let socket = std::net::TcpStream::from(fd);
                socket.set_nonblocking(true)?;
                Ok(Some(TcpStream::from_std(socket)?))
            }
        }
    }
}

fn recv_handle(channel_fd: RawFd) -> io::Result<Option<OwnedFd>> {
    let mut tag = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut tag)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);

    let msg = recvmsg::<()>(channel_fd, &mut iov, Some(&mut cmsg_buffer), MsgFlags::empty())?;

    let mut handle = None;
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            for fd in fds {
                // SAFETY: the kernel installed this descriptor for us during
                // recvmsg and nothing else refers to it.
                let owned = unsafe { OwnedFd::from_raw_fd(fd) };
                if handle.is_none() {
                    handle = Some(owned);
                }
            }
        }
    }

    if msg.bytes == 0 {
        return Ok(None);
    }
    handle
        .map(Some)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "handle message carried no descriptor"))
}
