//! Process control seam
//!
//! Pause/resume negotiation talks to processes only through this trait.

use nix::sys::signal::Signal;
use std::io;

use super::SupervisorError;
use super::child::ChildEntry;

pub trait ProcessControl: Send + Sync {
    fn signal_group(&self, entry: &ChildEntry, signal: Signal) -> Result<(), SupervisorError>;

    /// Whether the kernel reports the process as stopped
    fn is_stopped(&self, entry: &ChildEntry) -> io::Result<bool>;
}

/// Real signals, stop state from procfs
#[derive(Debug, Default)]
pub struct OsProcessControl;

impl ProcessControl for OsProcessControl {
    fn signal_group(&self, entry: &ChildEntry, signal: Signal) -> Result<(), SupervisorError> {
        entry.signal_group(signal)
    }

    fn is_stopped(&self, entry: &ChildEntry) -> io::Result<bool> {
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", entry.pid()))?;
        Ok(matches!(stat_state(&stat), Some('T' | 't')))
    }
}

/// State letter from `/proc/<pid>/stat`. The command name may itself contain
/// spaces and parentheses, so parse from the last `)`.
fn stat_state(stat: &str) -> Option<char> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().next()?.chars().next()
}
