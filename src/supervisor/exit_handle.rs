//! Process exit handles
//!
//! Every supervised process gets a pidfd. All of them are registered with a
//! single mio poll on one watcher thread (the same way an X connection is
//! watched). The kernel makes a pidfd readable once its process exits, and
//! the thread then flips that handle's watch channel.

use nix::errno::Errno;
use nix::sys::signal::Signal;
use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

const WAKE: mio::Token = mio::Token(0);

fn pidfd_open(pid: i32) -> Result<OwnedFd, Errno> {
    // SAFETY: plain syscall; the returned descriptor is owned by us.
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
    if fd < 0 {
        return Err(Errno::last());
    }
    // SAFETY: `fd` is a freshly opened descriptor nobody else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

fn to_errno(err: io::Error) -> Errno {
    err.raw_os_error().map_or(Errno::UnknownErrno, Errno::from_raw)
}

struct Watched {
    pid: i32,
    pidfd: Arc<OwnedFd>,
    exited: watch::Sender<bool>,
}

/// State shared between the watcher thread and the handles
struct Shared {
    registry: mio::Registry,
    watched: Mutex<HashMap<mio::Token, Watched>>,
    next_token: AtomicUsize,
}

impl Shared {
    fn watched(&self) -> std::sync::MutexGuard<'_, HashMap<mio::Token, Watched>> {
        self.watched.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop watching `token`; returns the entry if it was still watched
    fn unwatch(&self, token: mio::Token) -> Option<Watched> {
        let watched = self.watched().remove(&token)?;
        let raw = watched.pidfd.as_raw_fd();
        if let Err(err) = self.registry.deregister(&mut mio::unix::SourceFd(&raw)) {
            debug!("Failed to deregister pidfd of {}: {}", watched.pid, err);
        }
        Some(watched)
    }
}

/// One thread watching the pidfds of every supervised process
pub struct ExitWatcher {
    shared: Arc<Shared>,
    waker: mio::Waker,
    task_guard: Option<oneshot::Receiver<()>>,
}

impl ExitWatcher {
    pub fn start() -> io::Result<Self> {
        let mut poll = mio::Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = mio::Waker::new(poll.registry(), WAKE)?;
        let shared = Arc::new(Shared {
            registry,
            watched: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(1),
        });
        let (guard, task_guard) = oneshot::channel::<()>();

        let thread_shared = shared.clone();
        std::thread::Builder::new()
            .name("exits".into())
            .spawn(move || {
                let mut events = mio::Events::with_capacity(64);
                loop {
                    if let Err(err) = poll.poll(&mut events, None) {
                        if err.kind() == io::ErrorKind::Interrupted {
                            continue;
                        }
                        warn!("Exit watcher poll failed: {:?}", err);
                        return;
                    }
                    if guard.is_closed() {
                        debug!("Exit watcher shutting down");
                        return;
                    }
                    for event in events.iter().filter(|event| event.token() != WAKE) {
                        if let Some(watched) = thread_shared.unwatch(event.token()) {
                            debug!("Process {} exited", watched.pid);
                            let _ = watched.exited.send(true);
                        }
                    }
                }
            })?;

        Ok(Self {
            shared,
            waker,
            task_guard: Some(task_guard),
        })
    }

    /// Start watching `pid`. Fails if the process does not exist.
    pub fn watch(&self, pid: i32) -> Result<ExitHandle, Errno> {
        let pidfd = Arc::new(pidfd_open(pid)?);
        let (tx, exited) = watch::channel(false);
        let token = mio::Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed));
        let raw = pidfd.as_raw_fd();
        self.shared.watched().insert(
            token,
            Watched {
                pid,
                pidfd: pidfd.clone(),
                exited: tx,
            },
        );
        let registered = self.shared.registry.register(
            &mut mio::unix::SourceFd(&raw),
            token,
            mio::Interest::READABLE,
        );
        if let Err(err) = registered {
            self.shared.watched().remove(&token);
            return Err(to_errno(err));
        }
        Ok(ExitHandle {
            pidfd,
            token,
            exited,
            watcher: self.shared.clone(),
        })
    }

    #[cfg(test)]
    fn watching(&self) -> usize {
        self.shared.watched().len()
    }
}

impl Drop for ExitWatcher {
    fn drop(&mut self) {
        drop(self.task_guard.take());
        if let Err(err) = self.waker.wake() {
            warn!("Failed to stop exit watcher: {}", err);
        }
    }
}

pub struct ExitHandle {
    pidfd: Arc<OwnedFd>,
    token: mio::Token,
    exited: watch::Receiver<bool>,
    watcher: Arc<Shared>,
}

impl ExitHandle {
    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Resolve once the process has exited
    pub async fn wait(&self) {
        let mut exited = self.exited.clone();
        let _ = exited.wait_for(|&exited| exited).await;
    }

    /// Deliver `signal` through the pidfd, so a recycled pid is never hit
    pub fn send_signal(&self, signal: Signal) -> Result<(), Errno> {
        if self.has_exited() {
            return Err(Errno::ESRCH);
        }
        // SAFETY: plain syscall on a descriptor we own; no siginfo is passed.
        let res = unsafe {
            libc::syscall(
                libc::SYS_pidfd_send_signal,
                self.pidfd.as_raw_fd(),
                signal as libc::c_int,
                std::ptr::null::<libc::siginfo_t>(),
                0,
            )
        };
        Errno::result(res).map(drop)
    }
}

impl Drop for ExitHandle {
    fn drop(&mut self) {
        self.watcher.unwatch(self.token);
    }
}
