//! Pause/resume acknowledgements.
//!
//! A child confirms a pause (`SIGUSR2`) or resume (`SIGUSR1`) request by
//! sending the same signal back to the daemon. The sender's pid comes with
//! the signal, so each acknowledgement is matched to the negotiation it
//! belongs to: the exact pid first, then any pending entry whose process
//! group the sender belongs to (helpers forked by the client).
//!
//! The daemon's own pid and process group never count: a signal the daemon
//! sent to itself is not an acknowledgement from a client.

use nix::sys::signal::Signal;
use nix::unistd::{Pid, getpgid};
use signal_hook::consts::{SIGUSR1, SIGUSR2};
use signal_hook::iterator::exfiltrator::WithOrigin;
use signal_hook::iterator::{Handle, SignalsInfo};
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, info, trace};

struct Pending {
    pgid: i32,
    signal: Signal,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
pub struct AckRouter {
    pending: Mutex<HashMap<i32, Pending>>,
}

impl AckRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i32, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for `pid` (or its group) to echo `signal`. Replaces any earlier
    /// expectation for the same pid.
    pub fn expect(&self, pid: i32, pgid: i32, signal: Signal) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(pid, Pending { pgid, signal, tx });
        rx
    }

    pub fn cancel(&self, pid: i32) {
        self.lock().remove(&pid);
    }

    /// Route an acknowledgement from `origin`. Returns whether it matched.
    pub fn acknowledge(&self, origin: i32, signal: Signal) -> bool {
        if origin == std::process::id() as i32 {
            trace!("Ignoring {:?} from ourselves", signal);
            return false;
        }
        let own_group = getpgid(None).ok().map(Pid::as_raw);
        let mut pending = self.lock();
        let key = if pending.get(&origin).is_some_and(|p| p.signal == signal) {
            Some(origin)
        } else {
            let group = getpgid(Some(Pid::from_raw(origin))).ok().map(Pid::as_raw);
            pending
                .iter()
                .find(|(_, p)| {
                    Some(p.pgid) == group && Some(p.pgid) != own_group && p.signal == signal
                })
                .map(|(&pid, _)| pid)
        };
        match key.and_then(|pid| pending.remove(&pid).map(|p| (pid, p))) {
            Some((pid, p)) => {
                debug!("Process {} acknowledged {:?} (from {})", pid, signal, origin);
                let _ = p.tx.send(());
                true
            }
            None => {
                trace!("Unmatched {:?} from {}", signal, origin);
                false
            }
        }
    }

    /// Install the `SIGUSR1`/`SIGUSR2` handlers and route what arrives
    pub fn listen(self: &Arc<Self>) -> io::Result<AckListener> {
        let mut signals = SignalsInfo::<WithOrigin>::new([SIGUSR1, SIGUSR2])?;
        let handle = signals.handle();
        let router = Arc::clone(self);
        std::thread::Builder::new()
            .name("acks".into())
            .spawn(move || {
                for origin in signals.forever() {
                    let Some(process) = origin.process else {
                        trace!("Signal {} without sender information", origin.signal);
                        continue;
                    };
                    if let Ok(signal) = Signal::try_from(origin.signal) {
                        router.acknowledge(process.pid, signal);
                    }
                }
                debug!("Acknowledgement listener stopped");
            })?;
        info!("Listening for pause/resume acknowledgements");
        Ok(AckListener { handle })
    }
}

/// Stops the listener thread when dropped
pub struct AckListener {
    handle: Handle,
}

impl Drop for AckListener {
    fn drop(&mut self) {
        self.handle.close();
    }
}
