//! Reading and writing framed messages on a stream socket

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::socket::{MsgFlags, recv, send};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::{Duration, Instant};

use crate::wire::{HEADER_SIZE, Header, Message};

/// Largest payload accepted from a peer
pub const MAX_PAYLOAD: u32 = 16 * 1024 * 1024;

/// How long a blocking send waits for the peer to drain its socket
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

struct Pending {
    header: Header,
    data: Vec<u8>,
    filled: usize,
}

/// Incremental message reader.
///
/// Reads the header first and the payload second. Either read may stop
/// half-way with `EAGAIN`; the bytes received so far are kept and the next
/// call picks up where the last one stopped.
#[derive(Default)]
pub struct MessageReader {
    header: [u8; HEADER_SIZE],
    header_len: usize,
    body: Option<Pending>,
}

impl MessageReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no partially received message is buffered
    pub fn is_idle(&self) -> bool {
        self.header_len == 0 && self.body.is_none()
    }

    /// Non-blocking read of the next message.
    ///
    /// `EAGAIN` means "not complete yet, call again once readable".
    /// `ECONNRESET` means the peer closed the socket.
    pub fn read(&mut self, fd: BorrowedFd<'_>) -> Result<Message, Errno> {
        let pending = match self.body.as_mut() {
            Some(pending) => pending,
            None => {
                while self.header_len < HEADER_SIZE {
                    self.header_len += recv_some(fd, &mut self.header[self.header_len..])?;
                }
                self.header_len = 0;
                let header = Header::from_bytes(&self.header).map_err(|_| Errno::EBADMSG)?;
                if header.size > MAX_PAYLOAD {
                    return Err(Errno::EMSGSIZE);
                }
                self.body.insert(Pending {
                    header,
                    data: vec![0; header.size as usize],
                    filled: 0,
                })
            }
        };
        while pending.filled < pending.data.len() {
            pending.filled += recv_some(fd, &mut pending.data[pending.filled..])?;
        }
        let header = pending.header;
        let data = std::mem::take(&mut pending.data);
        self.body = None;
        Ok(Message {
            header,
            payload: (!data.is_empty()).then_some(data),
        })
    }

    /// Blocking read, waiting for readability between partial reads.
    ///
    /// Fails with `ETIMEDOUT` once `timeout` elapses without a whole message.
    pub fn read_blocking(
        &mut self,
        fd: BorrowedFd<'_>,
        timeout: Option<Duration>,
    ) -> Result<Message, Errno> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            match self.read(fd) {
                Err(Errno::EAGAIN) => {}
                other => return other,
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Errno::ETIMEDOUT);
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            wait_for(fd, PollFlags::POLLIN, remaining)?;
        }
    }
}

fn recv_some(fd: BorrowedFd<'_>, buf: &mut [u8]) -> Result<usize, Errno> {
    loop {
        match recv(fd.as_raw_fd(), buf, MsgFlags::MSG_DONTWAIT) {
            Ok(0) => return Err(Errno::ECONNRESET),
            Ok(n) => return Ok(n),
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err),
        }
    }
}

/// Write a whole message, waiting for buffer space when the socket is full
pub fn send_message(fd: BorrowedFd<'_>, message: &Message) -> Result<(), Errno> {
    let bytes = message.encode();
    let mut sent = 0;
    while sent < bytes.len() {
        match send(
            fd.as_raw_fd(),
            &bytes[sent..],
            MsgFlags::MSG_NOSIGNAL | MsgFlags::MSG_DONTWAIT,
        ) {
            Ok(n) => sent += n,
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => wait_for(fd, PollFlags::POLLOUT, Some(SEND_TIMEOUT))?,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Wait until `fd` reports any of `events`.
///
/// A hangup without the requested events is `ECONNRESET`; running out of time
/// is `ETIMEDOUT`. `None` waits forever.
pub fn wait_for(
    fd: BorrowedFd<'_>,
    events: PollFlags,
    timeout: Option<Duration>,
) -> Result<(), Errno> {
    let timeout = match timeout {
        Some(t) => {
            let ms = i32::try_from(t.as_millis()).unwrap_or(i32::MAX);
            PollTimeout::try_from(ms).unwrap_or(PollTimeout::NONE)
        }
        None => PollTimeout::NONE,
    };
    loop {
        let mut fds = [PollFd::new(fd, events)];
        match poll(&mut fds, timeout) {
            Ok(0) => return Err(Errno::ETIMEDOUT),
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err),
        }
        let revents = fds[0].revents().unwrap_or(PollFlags::empty());
        if revents.intersects(events) {
            return Ok(());
        }
        if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
            return Err(Errno::ECONNRESET);
        }
        if revents.contains(PollFlags::POLLNVAL) {
            return Err(Errno::EBADF);
        }
    }
}
