//! Per-process supervisor entries

use nix::sys::signal::{Signal, killpg};
use nix::unistd::{Pid, getpgid};
use std::process::Child;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

use super::exit_handle::{ExitHandle, ExitWatcher};
use super::{ProcessState, SupervisorError};
use crate::channel::Channel;

/// One supervised process: exit handle, private channel, pause state.
///
/// Only constructed once both the exit handle and the channel are open, so
/// an entry always has both.
pub struct ChildEntry {
    pid: i32,
    pgid: i32,
    exit: ExitHandle,
    channel: Channel,
    state: Mutex<ProcessState>,
    /// Set when the daemon spawned the process and has to reap it
    child: Mutex<Option<Child>>,
}

impl ChildEntry {
    pub(super) fn new(
        pid: i32,
        pgid: i32,
        channel: Channel,
        child: Option<Child>,
        exits: &ExitWatcher,
    ) -> Result<Self, SupervisorError> {
        if !channel.is_valid() {
            return Err(SupervisorError::Channel(
                channel.error().unwrap_or("invalid channel").to_string(),
            ));
        }
        let exit = exits
            .watch(pid)
            .map_err(|source| SupervisorError::ExitHandle { pid, source })?;
        Ok(Self {
            pid,
            pgid,
            exit,
            channel,
            state: Mutex::new(ProcessState::Running),
            child: Mutex::new(child),
        })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn set_state(&self, state: ProcessState) {
        let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != state {
            debug!("Process {}: {:?} -> {:?}", self.pid, *current, state);
            *current = state;
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn has_exited(&self) -> bool {
        self.exit.has_exited()
    }

    pub async fn exited(&self) {
        self.exit.wait().await
    }

    /// Signal the process itself
    pub fn signal(&self, signal: Signal) -> Result<(), SupervisorError> {
        self.exit.send_signal(signal).map_err(|source| self.signal_error(source))
    }

    /// Signal the whole process group. A client left in the daemon's own
    /// group only gets the signal itself.
    pub fn signal_group(&self, signal: Signal) -> Result<(), SupervisorError> {
        if self.has_exited() {
            return Err(SupervisorError::NoSuchProcess(self.pid));
        }
        if getpgid(None).is_ok_and(|own| own.as_raw() == self.pgid) {
            debug!("Process {} shares our group, signalling it alone", self.pid);
            return self.signal(signal);
        }
        killpg(Pid::from_raw(self.pgid), signal).map_err(|source| self.signal_error(source))
    }

    fn signal_error(&self, source: nix::errno::Errno) -> SupervisorError {
        if source == nix::errno::Errno::ESRCH {
            SupervisorError::NoSuchProcess(self.pid)
        } else {
            SupervisorError::Signal {
                pid: self.pid,
                source,
            }
        }
    }

    /// Write to the process's channel; returns bytes written
    pub fn write(&self, data: &[u8]) -> usize {
        self.channel.write(data)
    }

    /// Drain the channel into the log
    pub fn read_socket(&self) {
        let data = self.channel.read_all();
        if data.is_empty() {
            return;
        }
        for line in String::from_utf8_lossy(&data).lines() {
            info!("[{}] {}", self.pid, line);
        }
    }

    /// Collect the exit status of a spawned process
    pub(super) fn reap(&self) {
        let Some(mut child) = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        match child.try_wait() {
            Ok(Some(status)) => info!("Process {} exited with {}", self.pid, status),
            Ok(None) => warn!("Process {} reported exit but is still running", self.pid),
            Err(e) => warn!("Failed to reap process {}: {}", self.pid, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::process::Command;
    use std::time::Duration;

    #[tokio::test]
    async fn test_entry_for_running_process() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id() as i32;
        let exits = ExitWatcher::start().unwrap();
        let entry = ChildEntry::new(pid, pid, Channel::new(true), None, &exits).unwrap();
        assert_eq!(entry.state(), ProcessState::Running);
        assert!(!entry.has_exited());
        entry.signal(Signal::SIGKILL).unwrap();
        tokio::time::timeout(Duration::from_secs(5), entry.exited())
            .await
            .unwrap();
        assert!(matches!(
            entry.signal(Signal::SIGTERM),
            Err(SupervisorError::NoSuchProcess(p)) if p == pid
        ));
        assert!(matches!(
            entry.signal_group(Signal::SIGTERM),
            Err(SupervisorError::NoSuchProcess(_))
        ));
        child.wait().unwrap();
    }

    #[tokio::test]
    async fn test_missing_process_is_refused() {
        let exits = ExitWatcher::start().unwrap();
        let result = ChildEntry::new(i32::MAX, i32::MAX, Channel::new(true), None, &exits);
        assert!(matches!(result, Err(SupervisorError::ExitHandle { .. })));
    }

    #[tokio::test]
    async fn test_write_and_read_socket() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id() as i32;
        let mut channel = Channel::new(true);
        let mut remote = UnixStream::from(channel.take_remote().unwrap());
        let exits = ExitWatcher::start().unwrap();
        let entry = ChildEntry::new(pid, pid, channel, None, &exits).unwrap();
        assert_eq!(entry.write(b"hi"), 2);
        remote.write_all(b"line one\nline two\n").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        entry.read_socket();
        assert_eq!(entry.channel().bytes_available(), 0);
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[tokio::test]
    async fn test_group_signal_never_reaches_own_group() {
        // Shares our process group; a group-wide SIGKILL would take the
        // test runner down with it
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id() as i32;
        let own = getpgid(None).unwrap().as_raw();
        let exits = ExitWatcher::start().unwrap();
        let entry = ChildEntry::new(pid, own, Channel::new(true), None, &exits).unwrap();
        entry.signal_group(Signal::SIGKILL).unwrap();
        tokio::time::timeout(Duration::from_secs(5), entry.exited())
            .await
            .unwrap();
        child.wait().unwrap();
    }
}
