//! Process Supervisor
//!
//! One [`ChildEntry`] per client process. Pausing and resuming go through a
//! two-step negotiation: the process group is asked politely (`SIGUSR2` to
//! pause, `SIGUSR1` to resume) and given a bounded time to acknowledge; if it
//! stays silent it is stopped or continued with `SIGSTOP`/`SIGCONT` and the
//! kernel is polled until it reports the new state. Process exit always wins
//! over a negotiation in flight.

pub mod acks;
pub mod child;
pub mod control;
pub mod exit_handle;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use std::collections::HashMap;
use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

use crate::channel::{Channel, Readiness};
use crate::config::SupervisorConfig;
pub use acks::AckRouter;
pub use child::ChildEntry;
pub use control::{OsProcessControl, ProcessControl};
use exit_handle::ExitWatcher;

const CONFIRM_POLL: Duration = Duration::from_millis(10);

/// Pause state of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Pausing,
    Paused,
    Resuming,
    Exited,
}

/// How a pause or resume concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The process acknowledged the request
    Cooperative,
    /// The process was stopped or continued by the kernel
    Forced,
    /// The process exited during the negotiation
    Exited,
    /// Already in the requested state
    Unchanged,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("no such process {0}")]
    NoSuchProcess(i32),
    #[error("failed to watch process {pid}: {source}")]
    ExitHandle { pid: i32, source: Errno },
    #[error("failed to open process channel: {0}")]
    Channel(String),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("failed to signal process {pid}: {source}")]
    Signal { pid: i32, source: Errno },
    #[error("process {pid} is {state:?}")]
    Busy { pid: i32, state: ProcessState },
    #[error("process {pid} did not reach {target:?}")]
    NotConfirmed { pid: i32, target: ProcessState },
}

#[derive(Debug, Clone, Copy)]
enum Transition {
    Pause,
    Resume,
}

impl Transition {
    fn from(self) -> ProcessState {
        match self {
            Self::Pause => ProcessState::Running,
            Self::Resume => ProcessState::Paused,
        }
    }

    fn during(self) -> ProcessState {
        match self {
            Self::Pause => ProcessState::Pausing,
            Self::Resume => ProcessState::Resuming,
        }
    }

    fn target(self) -> ProcessState {
        match self {
            Self::Pause => ProcessState::Paused,
            Self::Resume => ProcessState::Running,
        }
    }

    fn request(self) -> Signal {
        match self {
            Self::Pause => Signal::SIGUSR2,
            Self::Resume => Signal::SIGUSR1,
        }
    }

    fn fallback(self) -> Signal {
        match self {
            Self::Pause => Signal::SIGSTOP,
            Self::Resume => Signal::SIGCONT,
        }
    }

    fn stopped(self) -> bool {
        matches!(self, Self::Pause)
    }
}

type Entries = Arc<Mutex<HashMap<i32, Arc<ChildEntry>>>>;

pub struct Supervisor {
    config: SupervisorConfig,
    control: Arc<dyn ProcessControl>,
    acks: Arc<AckRouter>,
    exits: ExitWatcher,
    entries: Entries,
    finished_tx: mpsc::UnboundedSender<i32>,
}

impl Supervisor {
    /// The receiver yields the pid of every supervised process that exits
    pub fn new(
        config: SupervisorConfig,
        control: Arc<dyn ProcessControl>,
        acks: Arc<AckRouter>,
    ) -> io::Result<(Arc<Self>, mpsc::UnboundedReceiver<i32>)> {
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(Self {
            config,
            control,
            acks,
            exits: ExitWatcher::start()?,
            entries: Arc::new(Mutex::new(HashMap::new())),
            finished_tx,
        });
        Ok((supervisor, finished_rx))
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<i32, Arc<ChildEntry>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, pid: i32) -> Option<Arc<ChildEntry>> {
        self.entries().get(&pid).cloned()
    }

    pub fn pids(&self) -> Vec<i32> {
        self.entries().keys().copied().collect()
    }

    /// Start supervising an existing process. Returns the existing entry if
    /// the pid is already supervised.
    pub fn register(&self, pid: i32, pgid: i32) -> Result<Arc<ChildEntry>, SupervisorError> {
        if let Some(entry) = self.get(pid) {
            return Ok(entry);
        }
        let entry = ChildEntry::new(pid, pgid, Channel::new(true), None, &self.exits)
            .inspect_err(|e| warn!("Failed to register process {}: {}", pid, e))?;
        Ok(self.insert(entry))
    }

    /// Start `program` in its own process group with stdout and stderr
    /// going to its channel
    pub fn spawn(&self, program: &str, args: &[String]) -> Result<Arc<ChildEntry>, SupervisorError> {
        let mut channel = Channel::new(true);
        let Some(remote) = channel.take_remote() else {
            let error = channel.error().unwrap_or("invalid channel");
            return Err(SupervisorError::Channel(error.to_string()));
        };
        let spawn_error = |source| SupervisorError::Spawn {
            program: program.to_string(),
            source,
        };
        let stdout = remote.try_clone().map_err(spawn_error)?;
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(remote))
            .process_group(0)
            .spawn()
            .map_err(spawn_error)?;
        let pid = child.id() as i32;
        info!("Started {} as {}", program, pid);
        let entry = ChildEntry::new(pid, pid, channel, Some(child), &self.exits)?;
        Ok(self.insert(entry))
    }

    fn insert(&self, entry: ChildEntry) -> Arc<ChildEntry> {
        let entry = Arc::new(entry);
        self.entries().insert(entry.pid(), entry.clone());
        self.monitor(entry.clone());
        entry
    }

    /// Log the process's output until it exits, then report it finished
    fn monitor(&self, entry: Arc<ChildEntry>) {
        let entries = self.entries.clone();
        let finished = self.finished_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = entry.exited() => break,
                    readiness = entry.channel().wait_readable() => match readiness {
                        Ok(Readiness::Data) => entry.read_socket(),
                        Ok(Readiness::Discarded) => {}
                        Ok(Readiness::Closed) | Err(_) => {
                            entry.exited().await;
                            break;
                        }
                    },
                }
            }
            entry.read_socket();
            entry.reap();
            entry.set_state(ProcessState::Exited);
            entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&entry.pid());
            info!("Process {} finished", entry.pid());
            let _ = finished.send(entry.pid());
        });
    }

    pub async fn pause(&self, pid: i32) -> Result<Outcome, SupervisorError> {
        self.negotiate(pid, Transition::Pause).await
    }

    pub async fn resume(&self, pid: i32) -> Result<Outcome, SupervisorError> {
        self.negotiate(pid, Transition::Resume).await
    }

    async fn negotiate(&self, pid: i32, transition: Transition) -> Result<Outcome, SupervisorError> {
        let entry = self.get(pid).ok_or(SupervisorError::NoSuchProcess(pid))?;
        match entry.state() {
            state if state == transition.target() => return Ok(Outcome::Unchanged),
            ProcessState::Exited => return Err(SupervisorError::NoSuchProcess(pid)),
            state if state != transition.from() => {
                return Err(SupervisorError::Busy { pid, state });
            }
            _ => {}
        }
        entry.set_state(transition.during());

        let ack = self.acks.expect(pid, entry.pgid(), transition.request());
        if let Err(e) = self.control.signal_group(&entry, transition.request()) {
            self.acks.cancel(pid);
            entry.set_state(transition.from());
            return Err(e);
        }

        let acknowledged = tokio::select! {
            biased;
            _ = entry.exited() => {
                self.acks.cancel(pid);
                entry.set_state(ProcessState::Exited);
                return Ok(Outcome::Exited);
            }
            result = ack => result.is_ok(),
            _ = sleep(self.config.ack_timeout()) => false,
        };
        if acknowledged {
            debug!("Process {} acknowledged {:?}", pid, transition);
            entry.set_state(transition.target());
            return Ok(Outcome::Cooperative);
        }
        self.acks.cancel(pid);

        warn!(
            "Process {} did not acknowledge {:?}, sending {:?}",
            pid,
            transition,
            transition.fallback()
        );
        if let Err(e) = self.control.signal_group(&entry, transition.fallback()) {
            entry.set_state(transition.from());
            return Err(e);
        }
        tokio::select! {
            biased;
            _ = entry.exited() => {
                entry.set_state(ProcessState::Exited);
                Ok(Outcome::Exited)
            }
            confirmed = self.confirm(&entry, transition.stopped()) => {
                if confirmed {
                    entry.set_state(transition.target());
                    Ok(Outcome::Forced)
                } else {
                    error!("Process {} did not reach {:?}", pid, transition.target());
                    entry.set_state(transition.from());
                    Err(SupervisorError::NotConfirmed {
                        pid,
                        target: transition.target(),
                    })
                }
            }
        }
    }

    /// Poll until the kernel reports the wanted stop state, bounded by the
    /// stop timeout
    async fn confirm(&self, entry: &ChildEntry, stopped: bool) -> bool {
        let deadline = Instant::now() + self.config.stop_timeout();
        loop {
            match self.control.is_stopped(entry) {
                Ok(state) if state == stopped => return true,
                Ok(_) => {}
                Err(e) => debug!("Failed to read state of {}: {}", entry.pid(), e),
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(CONFIRM_POLL).await;
        }
    }

    /// `SIGTERM` the process group, `SIGKILL` it if it is still there after
    /// the grace period
    pub async fn terminate(&self, pid: i32) -> Result<(), SupervisorError> {
        let entry = self.get(pid).ok_or(SupervisorError::NoSuchProcess(pid))?;
        if matches!(
            entry.state(),
            ProcessState::Paused | ProcessState::Pausing | ProcessState::Resuming
        ) {
            let _ = self.control.signal_group(&entry, Signal::SIGCONT);
        }
        info!("Terminating process {}", pid);
        self.control.signal_group(&entry, Signal::SIGTERM)?;
        let grace = self.config.terminate_grace();
        if tokio::time::timeout(grace, entry.exited()).await.is_ok() {
            return Ok(());
        }
        warn!("Process {} ignored SIGTERM, killing", pid);
        match self.control.signal_group(&entry, Signal::SIGKILL) {
            Ok(()) | Err(SupervisorError::NoSuchProcess(_)) => {}
            Err(e) => return Err(e),
        }
        let _ = tokio::time::timeout(grace, entry.exited()).await;
        Ok(())
    }

    /// Terminate every supervised process
    pub async fn shutdown(self: &Arc<Self>) {
        let mut tasks = JoinSet::new();
        for pid in self.pids() {
            let this = self.clone();
            tasks.spawn(async move {
                if let Err(e) = this.terminate(pid).await {
                    debug!("Failed to terminate {}: {}", pid, e);
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }
}
