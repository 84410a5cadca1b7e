//! Connected local socket pairs with an enable gate.
//!
//! The service keeps the local end; the remote end is handed to a client
//! (over D-Bus or as a child's stdio). While a channel is disabled every
//! incoming byte is read and thrown away, so the kernel buffer never fills
//! and nothing is replayed once the channel is enabled again.

use nix::errno::Errno;
use nix::sys::socket::{MsgFlags, recv, send};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::Interest;
use tokio::net::UnixStream;
use tracing::{debug, warn};

nix::ioctl_read_bad!(fionread, libc::FIONREAD, libc::c_int);

const DISCARD_CHUNK: usize = 1024;

/// Outcome of waiting on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Bytes are waiting to be read
    Data,
    /// Bytes arrived while reads were not allowed and were dropped
    Discarded,
    /// The remote end is gone
    Closed,
}

pub struct Channel {
    local: Option<UnixStream>,
    remote: Option<OwnedFd>,
    enabled: AtomicBool,
    allow_reverse_read: bool,
    write_lock: tokio::sync::Mutex<()>,
    error: Option<String>,
}

impl Channel {
    /// Open a new pair. Must be called inside a Tokio runtime.
    ///
    /// Never fails; check [`Channel::is_valid`] before use. With
    /// `allow_reverse_read == false` the local end is write-only.
    pub fn new(allow_reverse_read: bool) -> Self {
        match Self::open() {
            Ok((local, remote)) => Self {
                local: Some(local),
                remote: Some(remote),
                enabled: AtomicBool::new(true),
                allow_reverse_read,
                write_lock: tokio::sync::Mutex::new(()),
                error: None,
            },
            Err(e) => {
                warn!("Failed to create socket pair: {}", e);
                Self {
                    local: None,
                    remote: None,
                    enabled: AtomicBool::new(false),
                    allow_reverse_read,
                    write_lock: tokio::sync::Mutex::new(()),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    fn open() -> io::Result<(UnixStream, OwnedFd)> {
        let (local, remote) = UnixStream::pair()?;
        let remote = remote.into_std()?;
        remote.set_nonblocking(false)?;
        Ok((local, OwnedFd::from(remote)))
    }

    pub fn is_valid(&self) -> bool {
        self.local.is_some()
    }

    /// Why construction failed, if it did
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Open or close the gate. Anything that arrived while closed is
    /// dropped before the gate opens.
    pub fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::AcqRel);
        if was != enabled || !enabled {
            let dropped = self.drain();
            if dropped > 0 {
                debug!("Discarded {} bytes from disabled channel", dropped);
            }
        }
    }

    /// Whether reads return data right now
    fn reads_allowed(&self) -> bool {
        self.allow_reverse_read && self.enabled()
    }

    fn local_raw(&self) -> Option<RawFd> {
        self.local.as_ref().map(|s| s.as_raw_fd())
    }

    /// Service-side end, used by the message codec
    pub fn local_fd(&self) -> Option<BorrowedFd<'_>> {
        self.local.as_ref().map(|s| s.as_fd())
    }

    /// Client-side end, still owned by the channel
    pub fn remote_fd(&self) -> Option<BorrowedFd<'_>> {
        self.remote.as_ref().map(|fd| fd.as_fd())
    }

    /// Give up the client-side end, e.g. to hand it to a child process
    pub fn take_remote(&mut self) -> Option<OwnedFd> {
        self.remote.take()
    }

    /// Non-blocking write. Returns the number of bytes written, 0 while
    /// disabled or when the socket is full.
    pub fn write(&self, data: &[u8]) -> usize {
        if !self.enabled() {
            return 0;
        }
        let Some(fd) = self.local_raw() else {
            return 0;
        };
        match send(fd, data, MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_NOSIGNAL) {
            Ok(n) => n,
            Err(Errno::EAGAIN) => 0,
            Err(e) => {
                warn!("Failed to write to channel: {}", e);
                0
            }
        }
    }

    /// Write all of `data`, waiting for buffer space. Concurrent callers are
    /// serialized so frames never interleave.
    pub async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        if !self.enabled() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "channel disabled"));
        }
        let local = self.stream()?;
        let _guard = self.write_lock.lock().await;
        let fd = local.as_raw_fd();
        let mut written = 0;
        while written < data.len() {
            local.writable().await?;
            let result = local.try_io(Interest::WRITABLE, || {
                send(
                    fd,
                    &data[written..],
                    MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_NOSIGNAL,
                )
                .map_err(io::Error::from)
            });
            match result {
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Bytes waiting to be read; 0 whenever reads are not allowed
    pub fn bytes_available(&self) -> usize {
        if !self.reads_allowed() {
            return 0;
        }
        let Some(fd) = self.local_raw() else {
            return 0;
        };
        let mut pending: libc::c_int = 0;
        // SAFETY: FIONREAD writes one c_int through the pointer.
        match unsafe { fionread(fd, &mut pending) } {
            Ok(_) => pending.max(0) as usize,
            Err(e) => {
                debug!("FIONREAD failed: {}", e);
                0
            }
        }
    }

    /// Read up to `max` bytes without blocking
    pub fn read(&self, max: usize) -> Vec<u8> {
        if !self.reads_allowed() {
            return Vec::new();
        }
        let Some(fd) = self.local_raw() else {
            return Vec::new();
        };
        let mut buf = vec![0; max];
        match recv(fd, &mut buf, MsgFlags::MSG_DONTWAIT) {
            Ok(n) => buf.truncate(n),
            Err(_) => buf.clear(),
        }
        buf
    }

    /// Read everything currently buffered
    pub fn read_all(&self) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let pending = self.bytes_available();
            if pending == 0 {
                return out;
            }
            let chunk = self.read(pending);
            if chunk.is_empty() {
                return out;
            }
            out.extend_from_slice(&chunk);
        }
    }

    /// Throw away whatever is buffered; returns the number of bytes dropped
    fn drain(&self) -> usize {
        let Some(fd) = self.local_raw() else {
            return 0;
        };
        let mut buf = [0u8; DISCARD_CHUNK];
        let mut total = 0;
        loop {
            match recv(fd, &mut buf, MsgFlags::MSG_DONTWAIT) {
                Ok(0) => return total,
                Ok(n) => total += n,
                Err(Errno::EINTR) => continue,
                Err(_) => return total,
            }
        }
    }

    fn stream(&self) -> io::Result<&UnixStream> {
        self.local
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "invalid channel"))
    }

    /// Wait until the channel needs attention.
    ///
    /// While reads are not allowed incoming bytes are dropped here and
    /// [`Readiness::Discarded`] is returned.
    pub async fn wait_readable(&self) -> io::Result<Readiness> {
        let local = self.stream()?;
        let fd = local.as_raw_fd();
        loop {
            local.readable().await?;
            if !self.reads_allowed() {
                let result = local.try_io(Interest::READABLE, || {
                    let mut buf = [0u8; DISCARD_CHUNK];
                    let mut total = 0;
                    loop {
                        match recv(fd, &mut buf, MsgFlags::MSG_DONTWAIT) {
                            Ok(0) => return Ok(None),
                            Ok(n) => total += n,
                            Err(Errno::EINTR) => continue,
                            Err(Errno::EAGAIN) if total > 0 => return Ok(Some(total)),
                            Err(e) => return Err(io::Error::from(e)),
                        }
                    }
                });
                match result {
                    Ok(None) => return Ok(Readiness::Closed),
                    Ok(Some(total)) => {
                        debug!("Discarded {} bytes from disabled channel", total);
                        return Ok(Readiness::Discarded);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e),
                }
            }
            let result = local.try_io(Interest::READABLE, || {
                let mut byte = [0u8; 1];
                recv(fd, &mut byte, MsgFlags::MSG_PEEK | MsgFlags::MSG_DONTWAIT)
                    .map_err(io::Error::from)
            });
            match result {
                Ok(0) => return Ok(Readiness::Closed),
                Ok(_) => return Ok(Readiness::Data),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream as StdUnixStream;
    use std::time::Duration;

    fn remote(channel: &mut Channel) -> StdUnixStream {
        let stream = StdUnixStream::from(channel.take_remote().unwrap());
        stream
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        stream
    }

    #[tokio::test]
    async fn test_new_channel_is_valid_and_enabled() {
        let channel = Channel::new(true);
        assert!(channel.is_valid());
        assert!(channel.enabled());
        assert!(channel.error().is_none());
        assert!(channel.remote_fd().is_some());
    }

    #[tokio::test]
    async fn test_write_reaches_remote() {
        let mut channel = Channel::new(true);
        let mut peer = remote(&mut channel);
        assert_eq!(channel.write(b"hello"), 5);
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_disabled_write_does_nothing() {
        let mut channel = Channel::new(true);
        let mut peer = remote(&mut channel);
        channel.set_enabled(false);
        assert_eq!(channel.write(b"hello"), 0);
        assert!(channel.write_all(b"hello").await.is_err());
        let mut buf = [0u8; 5];
        assert!(peer.read(&mut buf).is_err());
    }

    #[tokio::test]
    async fn test_disabled_channel_reports_nothing_and_never_replays() {
        let mut channel = Channel::new(true);
        let mut peer = remote(&mut channel);
        channel.set_enabled(false);
        peer.write_all(b"dropped").unwrap();
        assert_eq!(channel.bytes_available(), 0);
        assert!(channel.read(16).is_empty());
        assert!(channel.read_all().is_empty());

        channel.set_enabled(true);
        assert_eq!(channel.bytes_available(), 0);
        assert!(channel.read(16).is_empty());

        peer.write_all(b"kept").unwrap();
        assert_eq!(channel.bytes_available(), 4);
        assert_eq!(channel.read_all(), b"kept");
    }

    #[tokio::test]
    async fn test_read_all_drains_everything_buffered() {
        let mut channel = Channel::new(true);
        let mut peer = remote(&mut channel);
        let data: Vec<u8> = (0..20_000u32).map(|i| i as u8).collect();
        peer.write_all(&data).unwrap();
        assert_eq!(channel.bytes_available(), data.len());
        assert_eq!(channel.read_all(), data);
        assert_eq!(channel.bytes_available(), 0);
    }

    #[tokio::test]
    async fn test_write_only_channel_never_reads() {
        let mut channel = Channel::new(false);
        let mut peer = remote(&mut channel);
        peer.write_all(b"ignored").unwrap();
        assert_eq!(channel.bytes_available(), 0);
        assert!(channel.read(16).is_empty());
        assert_eq!(
            channel.wait_readable().await.unwrap(),
            Readiness::Discarded
        );
    }

    #[tokio::test]
    async fn test_wait_readable_states() {
        let mut channel = Channel::new(true);
        let mut peer = remote(&mut channel);
        peer.write_all(b"x").unwrap();
        assert_eq!(channel.wait_readable().await.unwrap(), Readiness::Data);
        assert_eq!(channel.read(1), b"x");

        channel.set_enabled(false);
        peer.write_all(b"yy").unwrap();
        assert_eq!(
            channel.wait_readable().await.unwrap(),
            Readiness::Discarded
        );

        drop(peer);
        assert_eq!(channel.wait_readable().await.unwrap(), Readiness::Closed);
    }

    #[tokio::test]
    async fn test_write_all_large_payload() {
        let mut channel = Channel::new(true);
        let mut peer = remote(&mut channel);
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let data = vec![0x5a; 512 * 1024];
        let expected = data.len();
        let reader = std::thread::spawn(move || {
            let mut buf = vec![0u8; expected];
            peer.read_exact(&mut buf).unwrap();
            buf
        });
        channel.write_all(&data).await.unwrap();
        assert_eq!(reader.join().unwrap(), data);
    }
}
