//! Session Service
//!
//! Ties the surface registry, the dispatcher and the supervisor together.
//! Every client process gets one connection, keyed by pid: a data channel
//! carrying repaint/move/info requests and keepalive pings, and a
//! write-only input channel carrying events while its surface has focus.

use blight_proto::socket::MessageReader;
use blight_proto::wire::{InfoRequest, Payload, cast};
use blight_proto::{
    BufferError, Message, MessageType, MoveCommand, PixelFormat, RawInputEvent, Rect,
    RepaintCommand, SurfaceInfo, WaveformMode,
};
use nix::errno::Errno;
use nix::unistd::{Pid, getpgid};
use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info, trace, warn};

use crate::channel::{Channel, Readiness};
use crate::compositor::{
    DispatchError, Dispatcher, FocusTarget, RegistryError, SurfaceId, SurfaceRegistry,
};
use crate::config::Config;
use crate::supervisor::{ChildEntry, Outcome, ProcessState, Supervisor, SupervisorError};

/// Waveform used to redraw what a vanished surface uncovered
const CLEANUP_WAVEFORM: WaveformMode = WaveformMode::Grayscale;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("process {0} has no open connection")]
    NoConnection(i32),
    #[error("{0}")]
    InvalidArgs(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error("failed to open channel: {0}")]
    Channel(String),
    #[error("failed to duplicate socket: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// errno sent back to a data-plane client whose request was refused
    pub fn errno(&self) -> Errno {
        match self {
            Self::NoConnection(_) => Errno::ENOTCONN,
            Self::InvalidArgs(_) => Errno::EINVAL,
            Self::Registry(RegistryError::UnknownSurface(_))
            | Self::Dispatch(DispatchError::Registry(RegistryError::UnknownSurface(_))) => {
                Errno::ENOENT
            }
            Self::Registry(RegistryError::NotOwner { .. })
            | Self::Dispatch(DispatchError::Registry(RegistryError::NotOwner { .. })) => {
                Errno::EPERM
            }
            Self::Buffer(
                BufferError::InvalidGeometry { .. }
                | BufferError::TooSmall { .. }
                | BufferError::Unsealed,
            ) => Errno::EINVAL,
            Self::Supervisor(SupervisorError::NoSuchProcess(_)) => Errno::ESRCH,
            _ => Errno::EIO,
        }
    }
}

#[derive(Default)]
struct Keepalive {
    next_id: u32,
    /// Ping still waiting for its ack, and when it was sent
    outstanding: Option<(u32, Instant)>,
}

/// One client process's sockets
pub struct ClientConnection {
    pid: i32,
    entry: Arc<ChildEntry>,
    data: Channel,
    input: Arc<Channel>,
    keepalive: Mutex<Keepalive>,
    shutdown: Notify,
}

impl ClientConnection {
    fn remote_data(&self) -> Result<OwnedFd, SessionError> {
        dup_remote(&self.data)
    }

    fn remote_input(&self) -> Result<OwnedFd, SessionError> {
        dup_remote(&self.input)
    }

    async fn send(&self, message: &Message) {
        if let Err(e) = self.data.write_all(&message.encode()).await {
            debug!("Failed to send {:?} to {}: {}", message.kind(), self.pid, e);
        }
    }

    fn keepalive(&self) -> std::sync::MutexGuard<'_, Keepalive> {
        self.keepalive.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn dup_remote(channel: &Channel) -> Result<OwnedFd, SessionError> {
    let fd = channel
        .remote_fd()
        .ok_or_else(|| SessionError::Channel("remote end already taken".to_string()))?;
    Ok(fd.try_clone_to_owned()?)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Session {
    config: Config,
    dispatcher: Arc<Dispatcher>,
    supervisor: Arc<Supervisor>,
    connections: Mutex<HashMap<i32, Arc<ClientConnection>>>,
}

impl Session {
    /// `finished` is the supervisor's exit notification stream
    pub fn new(
        config: Config,
        dispatcher: Arc<Dispatcher>,
        supervisor: Arc<Supervisor>,
        mut finished: mpsc::UnboundedReceiver<i32>,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            config,
            dispatcher,
            supervisor,
            connections: Mutex::new(HashMap::new()),
        });
        let weak = Arc::downgrade(&session);
        tokio::spawn(async move {
            while let Some(pid) = finished.recv().await {
                let Some(session) = weak.upgrade() else {
                    return;
                };
                session.close_connection(pid);
            }
        });
        session
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, SurfaceRegistry> {
        lock(self.dispatcher.registry())
    }

    pub fn connection(&self, pid: i32) -> Result<Arc<ClientConnection>, SessionError> {
        lock(&self.connections)
            .get(&pid)
            .cloned()
            .ok_or(SessionError::NoConnection(pid))
    }

    /// Open (or reopen) the data channel of `pid` and return the client end
    pub fn open(self: &Arc<Self>, pid: i32) -> Result<OwnedFd, SessionError> {
        if let Ok(connection) = self.connection(pid) {
            debug!("Reusing connection for {}", pid);
            return connection.remote_data();
        }
        let pgid = getpgid(Some(Pid::from_raw(pid)))
            .map_err(|_| SupervisorError::NoSuchProcess(pid))?
            .as_raw();
        let data = Channel::new(true);
        let input = Channel::new(false);
        for channel in [&data, &input] {
            if !channel.is_valid() {
                let error = channel.error().unwrap_or("invalid channel").to_string();
                return Err(SessionError::Channel(error));
            }
        }
        info!("Opening connection for {} (group {})", pid, pgid);
        let entry = self.supervisor.register(pid, pgid)?;
        let connection = Arc::new(ClientConnection {
            pid,
            entry,
            data,
            input: Arc::new(input),
            keepalive: Mutex::default(),
            shutdown: Notify::new(),
        });
        let fd = connection.remote_data()?;
        lock(&self.connections).insert(pid, connection.clone());
        tokio::spawn(self.clone().serve(connection));
        Ok(fd)
    }

    /// Client end of the input channel; requires an open connection
    pub fn open_input(&self, pid: i32) -> Result<OwnedFd, SessionError> {
        let fd = self.connection(pid)?.remote_input()?;
        info!("Opened input for {}", pid);
        Ok(fd)
    }

    /// Map a client buffer and put it on top of the stack with focus
    #[allow(clippy::too_many_arguments)]
    pub fn add_surface(
        &self,
        pid: i32,
        fd: OwnedFd,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
        stride: i32,
        format: i32,
    ) -> Result<SurfaceId, SessionError> {
        let connection = self.connection(pid)?;
        let format = PixelFormat::from_raw(format)
            .filter(|f| *f != PixelFormat::Invalid)
            .ok_or_else(|| SessionError::InvalidArgs(format!("unknown pixel format {}", format)))?;
        let id = self
            .registry()
            .create_surface(pid, fd, x, y, width, height, stride, format)?;
        if connection.entry.state() == ProcessState::Running {
            self.dispatcher.set_focus(Some(FocusTarget {
                surface: id,
                owner: pid,
                input: connection.input.clone(),
            }));
        }
        Ok(id)
    }

    pub fn remove_surface(&self, pid: i32, id: SurfaceId) -> Result<(), SessionError> {
        let rect = {
            let mut registry = self.registry();
            registry.owned(id, pid)?;
            registry.remove_surface(id)?.rect()
        };
        self.cleanup(&[rect]);
        Ok(())
    }

    /// Surface ids, bottom first
    pub fn surfaces(&self) -> Vec<u32> {
        self.registry().ids().into_iter().map(|id| id.0).collect()
    }

    pub fn raise(&self, id: SurfaceId) -> Result<(), SessionError> {
        let rect = {
            let mut registry = self.registry();
            registry.raise(id)?;
            registry.get(id).map(|s| s.rect())
        };
        if let Some(rect) = rect {
            self.dispatcher.repaint_screen(rect, CLEANUP_WAVEFORM)?;
        }
        Ok(())
    }

    pub fn lower(&self, id: SurfaceId) -> Result<(), SessionError> {
        let rect = {
            let mut registry = self.registry();
            registry.lower(id)?;
            registry.get(id).map(|s| s.rect())
        };
        if let Some(rect) = rect {
            self.dispatcher.repaint_screen(rect, CLEANUP_WAVEFORM)?;
        }
        Ok(())
    }

    /// Give input focus to a surface
    pub fn focus(&self, id: SurfaceId) -> Result<(), SessionError> {
        let owner = self
            .registry()
            .get(id)
            .map(|s| s.owner)
            .ok_or(RegistryError::UnknownSurface(id))?;
        let connection = self.connection(owner)?;
        self.dispatcher.set_focus(Some(FocusTarget {
            surface: id,
            owner,
            input: connection.input.clone(),
        }));
        Ok(())
    }

    /// Move focus to the topmost surface of a running client, if the
    /// focused one is gone or its client can no longer take input
    fn refocus(&self) {
        if let Some(current) = self.dispatcher.focused() {
            let alive = self.registry().get(current.surface).is_some();
            if alive && current.input.enabled() {
                return;
            }
        }
        let connections = lock(&self.connections).clone();
        let next = self
            .registry()
            .topmost(|s| {
                connections
                    .get(&s.owner)
                    .is_some_and(|c| c.input.enabled() && c.entry.state() == ProcessState::Running)
            })
            .map(|s| (s.id, s.owner));
        let target = next.and_then(|(surface, owner)| {
            connections.get(&owner).map(|c| FocusTarget {
                surface,
                owner,
                input: c.input.clone(),
            })
        });
        self.dispatcher.set_focus(target);
    }

    /// Pause a client. Its input is cut off first and focus moves away.
    pub async fn pause(&self, pid: i32) -> Result<Outcome, SessionError> {
        let connection = self.connection(pid).ok();
        if let Some(connection) = &connection {
            connection.input.set_enabled(false);
        }
        self.refocus();
        match self.supervisor.pause(pid).await {
            Ok(outcome) => {
                info!("Paused {} ({:?})", pid, outcome);
                Ok(outcome)
            }
            Err(e) => {
                if let Some(connection) = &connection {
                    connection.input.set_enabled(true);
                }
                Err(e.into())
            }
        }
    }

    pub async fn resume(&self, pid: i32) -> Result<Outcome, SessionError> {
        let outcome = self.supervisor.resume(pid).await?;
        if let Ok(connection) = self.connection(pid) {
            connection.keepalive().outstanding = None;
            connection.input.set_enabled(true);
        }
        self.refocus();
        info!("Resumed {} ({:?})", pid, outcome);
        Ok(outcome)
    }

    pub async fn terminate(&self, pid: i32) -> Result<(), SessionError> {
        Ok(self.supervisor.terminate(pid).await?)
    }

    /// Start a supervised program; returns its pid
    pub fn launch(&self, program: &str, args: &[String]) -> Result<i32, SessionError> {
        if program.is_empty() {
            return Err(SessionError::InvalidArgs("empty program".to_string()));
        }
        Ok(self.supervisor.spawn(program, args)?.pid())
    }

    /// Queue a repaint of a surface owned by `pid`
    pub fn repaint(
        &self,
        pid: i32,
        command: &RepaintCommand,
    ) -> Result<oneshot::Receiver<()>, SessionError> {
        let id = SurfaceId(command.surface_id);
        self.registry().owned(id, pid)?;
        let area = Rect::new(command.x, command.y, command.width, command.height);
        Ok(self
            .dispatcher
            .repaint(id, area, command.waveform, command.marker)?)
    }

    /// Queue a full repaint of a surface owned by `pid`
    pub fn repaint_surface(
        &self,
        pid: i32,
        id: SurfaceId,
        waveform: i32,
    ) -> Result<oneshot::Receiver<()>, SessionError> {
        let connection = self.connection(pid)?;
        let waveform = WaveformMode::from_raw(waveform)
            .ok_or_else(|| SessionError::InvalidArgs(format!("unknown waveform {}", waveform)))?;
        let area = {
            let registry = self.registry();
            let surface = registry.owned(id, connection.pid)?;
            Rect::new(0, 0, surface.buffer.width, surface.buffer.height)
        };
        Ok(self.dispatcher.repaint(id, area, waveform, 0)?)
    }

    /// A new descriptor for the buffer behind a surface owned by `pid`
    pub fn get_surface(&self, pid: i32, id: SurfaceId) -> Result<OwnedFd, SessionError> {
        let connection = self.connection(pid)?;
        let registry = self.registry();
        let surface = registry.owned(id, connection.pid)?;
        Ok(surface.buffer.fd().try_clone_to_owned()?)
    }

    pub fn move_surface(&self, pid: i32, command: &MoveCommand) -> Result<(), SessionError> {
        let id = SurfaceId(command.surface_id);
        self.registry().owned(id, pid)?;
        self.dispatcher.move_surface(id, command.x, command.y)?;
        Ok(())
    }

    pub fn surface_info(&self, pid: i32, id: SurfaceId) -> Result<SurfaceInfo, SessionError> {
        Ok(self.registry().owned(id, pid)?.buffer.info())
    }

    pub async fn wait_for_marker(&self, marker: u32) {
        self.dispatcher.wait_for_marker(marker).await
    }

    /// Forward an input event to the focused client
    pub fn dispatch_event(&self, device_id: u32, event: RawInputEvent) -> bool {
        self.dispatcher.dispatch_event(device_id, event)
    }

    /// Drop a client's connection and surfaces
    pub fn close_connection(&self, pid: i32) {
        let Some(connection) = lock(&self.connections).remove(&pid) else {
            return;
        };
        connection.shutdown.notify_one();
        let rects: Vec<Rect> = {
            let mut registry = self.registry();
            let rects = registry
                .surfaces_of(pid)
                .into_iter()
                .filter_map(|id| registry.get(id).map(|s| s.rect()))
                .collect();
            registry.remove_owned_by(pid);
            rects
        };
        info!("Closed connection for {} ({} surfaces)", pid, rects.len());
        self.cleanup(&rects);
    }

    /// Redraw areas uncovered by removed surfaces and fix up focus
    fn cleanup(&self, rects: &[Rect]) {
        for rect in rects {
            if let Err(e) = self.dispatcher.repaint_screen(*rect, CLEANUP_WAVEFORM) {
                warn!("Failed to queue repaint of {:?}: {}", rect, e);
            }
        }
        self.refocus();
    }

    /// Close every connection and terminate every supervised process
    pub async fn shutdown(&self) {
        let pids: Vec<i32> = lock(&self.connections).keys().copied().collect();
        for pid in pids {
            self.close_connection(pid);
        }
        self.supervisor.shutdown().await;
    }

    async fn serve(self: Arc<Self>, connection: Arc<ClientConnection>) {
        let mut reader = MessageReader::new();
        let mut keepalive = interval(self.config.keepalive.interval());
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        keepalive.tick().await;
        loop {
            tokio::select! {
                _ = connection.shutdown.notified() => break,
                _ = connection.entry.exited() => break,
                _ = keepalive.tick() => {
                    if !self.ping(&connection).await {
                        break;
                    }
                }
                readiness = connection.data.wait_readable() => match readiness {
                    Ok(Readiness::Data) => {
                        if !self.read_messages(&connection, &mut reader).await {
                            break;
                        }
                    }
                    Ok(Readiness::Discarded) => {}
                    Ok(Readiness::Closed) | Err(_) => break,
                },
            }
        }
        debug!("Stopped serving {}", connection.pid);
        self.close_connection(connection.pid);
    }

    /// Send a keepalive ping. Returns false when the last one went
    /// unanswered for too long.
    async fn ping(&self, connection: &ClientConnection) -> bool {
        // A paused client cannot answer
        if connection.entry.state() != ProcessState::Running {
            connection.keepalive().outstanding = None;
            return true;
        }
        let ping = {
            let mut keepalive = connection.keepalive();
            if let Some((id, sent)) = keepalive.outstanding {
                if sent.elapsed() >= self.config.keepalive.timeout() {
                    warn!("Connection {} did not answer ping {}", connection.pid, id);
                    return false;
                }
                return true;
            }
            keepalive.next_id = keepalive.next_id.wrapping_add(1).max(1);
            keepalive.outstanding = Some((keepalive.next_id, Instant::now()));
            Message::ping(keepalive.next_id)
        };
        trace!("Pinging {}", connection.pid);
        connection.send(&ping).await;
        true
    }

    /// Handle everything readable. Returns false if the connection has to
    /// be closed.
    async fn read_messages(
        self: &Arc<Self>,
        connection: &Arc<ClientConnection>,
        reader: &mut MessageReader,
    ) -> bool {
        loop {
            let Some(fd) = connection.data.local_fd() else {
                return false;
            };
            match reader.read(fd) {
                Ok(message) => self.handle_message(connection, message).await,
                Err(Errno::EAGAIN) => return true,
                Err(Errno::EMSGSIZE) => {
                    warn!("Connection {} sent an oversized message", connection.pid);
                    return false;
                }
                Err(e) => {
                    debug!("Connection {} read failed: {}", connection.pid, e);
                    return false;
                }
            }
        }
    }

    async fn handle_message(self: &Arc<Self>, connection: &Arc<ClientConnection>, message: Message) {
        trace!(
            "Message from {}: {:?} ack {} size {}",
            connection.pid,
            message.kind(),
            message.header.ack_id,
            message.header.size
        );
        let pid = connection.pid;
        let reply = match message.kind() {
            MessageType::Ping => message.reply(None),
            MessageType::Ack => {
                let mut keepalive = connection.keepalive();
                match keepalive.outstanding {
                    Some((id, _)) if id == message.header.ack_id => keepalive.outstanding = None,
                    _ => debug!("Unexpected ack {} from {}", message.header.ack_id, pid),
                }
                return;
            }
            MessageType::Repaint => {
                let result = message
                    .as_repaint()
                    .map_err(|e| SessionError::InvalidArgs(e.to_string()))
                    .and_then(|command| self.repaint(pid, &command));
                match result {
                    Ok(done) => {
                        // Ack once the panel has refreshed; keep reading meanwhile
                        let connection = connection.clone();
                        tokio::spawn(async move {
                            if done.await.is_ok() {
                                connection.send(&message.reply(None)).await;
                            }
                        });
                        return;
                    }
                    Err(e) => self.refuse(&message, pid, e),
                }
            }
            MessageType::Move => {
                let result = message
                    .as_move()
                    .map_err(|e| SessionError::InvalidArgs(e.to_string()))
                    .and_then(|command| self.move_surface(pid, &command));
                match result {
                    Ok(()) => message.reply(None),
                    Err(e) => self.refuse(&message, pid, e),
                }
            }
            MessageType::Info => {
                let result = cast::<InfoRequest>(Some(&message))
                    .map_err(|e| SessionError::InvalidArgs(e.to_string()))
                    .and_then(|request| self.surface_info(pid, SurfaceId(request.surface_id)));
                match result {
                    Ok(info) => message.reply(Some(info.to_bytes())),
                    Err(e) => self.refuse(&message, pid, e),
                }
            }
            kind => {
                warn!("Unexpected {:?} message from {}", kind, pid);
                message.reject(Errno::EINVAL as i32)
            }
        };
        connection.send(&reply).await;
    }

    fn refuse(&self, message: &Message, pid: i32, error: SessionError) -> Message {
        warn!("Refused {:?} from {}: {}", message.kind(), pid, error);
        message.reject(error.errno() as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::epdc::Headless;
    use crate::compositor::framebuffer::FrameBuffer;
    use crate::config::{KeepaliveConfig, SupervisorConfig};
    use crate::supervisor::{AckRouter, OsProcessControl};
    use blight_proto::client::{ClientError, Connection};
    use blight_proto::socket::send_message;
    use blight_proto::{Buffer, EventPacket, create_buffer};
    use std::os::fd::AsFd;
    use std::time::Duration;

    const TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

    fn session(keepalive: KeepaliveConfig) -> Arc<Session> {
        let config = Config {
            keepalive,
            supervisor: SupervisorConfig {
                ack_timeout_ms: 100,
                stop_timeout_ms: 1000,
                terminate_grace_ms: 1000,
            },
            ..Config::default()
        };
        let registry = Arc::new(Mutex::new(SurfaceRegistry::new()));
        let framebuffer = FrameBuffer::headless(64, 64, 64, PixelFormat::Grayscale8).unwrap();
        let dispatcher = Dispatcher::start(registry, framebuffer, Arc::new(Headless)).unwrap();
        let (supervisor, finished) = Supervisor::new(
            config.supervisor.clone(),
            Arc::new(OsProcessControl),
            AckRouter::new(),
        )
        .unwrap();
        Session::new(config, dispatcher, supervisor, finished)
    }

    fn quiet() -> KeepaliveConfig {
        KeepaliveConfig {
            interval_ms: 60_000,
            timeout_ms: 120_000,
        }
    }

    fn buffer(x: i32, y: i32) -> Buffer {
        create_buffer(x, y, 16, 16, 16, PixelFormat::Grayscale8).unwrap()
    }

    fn add(session: &Session, pid: i32, buffer: &Buffer) -> SurfaceId {
        let fd = buffer.fd().try_clone_to_owned().unwrap();
        session
            .add_surface(pid, fd, buffer.x, buffer.y, buffer.width, buffer.height, buffer.stride, 24)
            .unwrap()
    }

    fn me() -> i32 {
        std::process::id() as i32
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ping_is_acked_with_same_id() {
        let session = session(quiet());
        let fd = session.open(me()).unwrap();
        let reply = tokio::task::spawn_blocking(move || {
            send_message(fd.as_fd(), &Message::ping(7)).unwrap();
            MessageReader::new().read_blocking(fd.as_fd(), TIMEOUT).unwrap()
        })
        .await
        .unwrap();
        assert_eq!(reply.kind(), MessageType::Ack);
        assert_eq!(reply.header.ack_id, 7);
        session.close_connection(me());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reopen_reuses_connection() {
        let session = session(quiet());
        let _first = session.open(me()).unwrap();
        let _second = session.open(me()).unwrap();
        assert_eq!(lock(&session.connections).len(), 1);
        assert!(session.open_input(me()).is_ok());
        session.close_connection(me());
        assert!(matches!(session.open_input(me()), Err(SessionError::NoConnection(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_open_leaves_nothing_supervised() {
        let session = session(quiet());
        assert!(session.open(i32::MAX).is_err());
        assert!(session.connection(i32::MAX).is_err());
        assert!(session.supervisor.pids().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_add_surface_requires_connection_and_valid_format() {
        let session = session(quiet());
        let buffer = buffer(0, 0);
        let fd = buffer.fd().try_clone_to_owned().unwrap();
        assert!(matches!(
            session.add_surface(me(), fd, 0, 0, 16, 16, 16, 24),
            Err(SessionError::NoConnection(_))
        ));
        let _fd = session.open(me()).unwrap();
        let fd = buffer.fd().try_clone_to_owned().unwrap();
        assert!(matches!(
            session.add_surface(me(), fd, 0, 0, 16, 16, 16, 99),
            Err(SessionError::InvalidArgs(_))
        ));
        let fd = buffer.fd().try_clone_to_owned().unwrap();
        let err = session.add_surface(me(), fd, 0, 0, 16, 16, 1, 24).unwrap_err();
        assert_eq!(err.errno(), Errno::EINVAL);
        session.close_connection(me());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_repaint_removed_surface_is_refused() {
        let session = session(quiet());
        let fd = session.open(me()).unwrap();
        let first = buffer(0, 0);
        let second = buffer(16, 16);
        let a = add(&session, me(), &first);
        let b = add(&session, me(), &second);
        assert_ne!(a, b);
        assert_eq!(session.surfaces(), vec![a.0, b.0]);
        session.remove_surface(me(), a).unwrap();

        let (stale, fresh) = tokio::task::spawn_blocking(move || {
            let mut client = Connection::new(fd);
            let stale = client.repaint(a.0, 0, 0, 10, 10, WaveformMode::Mono, 4, TIMEOUT);
            let fresh = client.repaint(b.0, 0, 0, 10, 10, WaveformMode::Mono, 5, TIMEOUT);
            (stale, fresh)
        })
        .await
        .unwrap();
        assert!(matches!(
            stale,
            Err(ClientError::Rejected { errno: Errno::ENOENT, .. })
        ));
        fresh.unwrap();
        tokio::time::timeout(Duration::from_secs(5), session.wait_for_marker(5))
            .await
            .unwrap();
        session.close_connection(me());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_move_and_info_over_data_plane() {
        let session = session(quiet());
        let fd = session.open(me()).unwrap();
        let surface = buffer(0, 0);
        let id = add(&session, me(), &surface);
        let info = tokio::task::spawn_blocking(move || {
            let mut client = Connection::new(fd);
            client.move_surface(id.0, 8, 4, TIMEOUT).unwrap();
            let missing = client.surface_info(id.0 + 100, TIMEOUT);
            assert!(matches!(missing, Err(ClientError::Rejected { .. })));
            client.surface_info(id.0, TIMEOUT).unwrap()
        })
        .await
        .unwrap();
        assert_eq!((info.x, info.y), (8, 4));
        assert_eq!((info.width, info.height, info.stride), (16, 16, 16));
        assert_eq!(info.format, PixelFormat::Grayscale8);
        session.close_connection(me());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_surfaces_owned_by_other_client_are_protected() {
        let session = session(quiet());
        let _fd = session.open(me()).unwrap();
        let surface = buffer(0, 0);
        let id = add(&session, me(), &surface);
        let err = session.remove_surface(me() + 1, id).unwrap_err();
        assert_eq!(err.errno(), Errno::EPERM);
        let command = RepaintCommand {
            x: 0,
            y: 0,
            width: 1,
            height: 1,
            waveform: WaveformMode::Mono,
            marker: 0,
            surface_id: id.0,
        };
        assert!(matches!(
            session.repaint(me() + 1, &command),
            Err(SessionError::Registry(RegistryError::NotOwner { .. }))
        ));
        session.close_connection(me());
        assert!(session.surfaces().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_events_reach_focused_surface() {
        let session = session(quiet());
        let fd = session.open(me()).unwrap();
        let input = session.open_input(me()).unwrap();
        let event = RawInputEvent {
            kind: 3,
            code: 0,
            value: 100,
        };
        assert!(!session.dispatch_event(1, event));
        let surface = buffer(0, 0);
        let id = add(&session, me(), &surface);
        assert!(session.dispatch_event(1, event));
        let packet = tokio::task::spawn_blocking(move || {
            let mut client = Connection::new(fd).with_input(input);
            client.read_event(TIMEOUT).unwrap()
        })
        .await
        .unwrap();
        assert_eq!(
            packet,
            Some(EventPacket {
                device_id: 1,
                event
            })
        );
        session.remove_surface(me(), id).unwrap();
        assert!(!session.dispatch_event(1, event));
        session.close_connection(me());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unanswered_keepalive_closes_connection() {
        let session = session(KeepaliveConfig {
            interval_ms: 20,
            timeout_ms: 60,
        });
        let _fd = session.open(me()).unwrap();
        let surface = buffer(0, 0);
        add(&session, me(), &surface);
        let mut closed = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if session.connection(me()).is_err() {
                closed = true;
                break;
            }
        }
        assert!(closed);
        assert!(session.surfaces().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_answered_keepalive_keeps_connection() {
        let session = session(KeepaliveConfig {
            interval_ms: 20,
            timeout_ms: 200,
        });
        let fd = session.open(me()).unwrap();
        tokio::task::spawn_blocking(move || {
            let mut client = Connection::new(fd);
            let deadline = std::time::Instant::now() + Duration::from_millis(500);
            while std::time::Instant::now() < deadline {
                client.process_pending().unwrap();
                std::thread::sleep(Duration::from_millis(10));
            }
        })
        .await
        .unwrap();
        assert!(session.connection(me()).is_ok());
        session.close_connection(me());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pause_disables_input_and_moves_focus() {
        let session = session(quiet());
        let args = vec!["-c".to_string(), "trap '' USR1 USR2; exec sleep 30".to_string()];
        let pid = session.launch("sh", &args).unwrap();
        for _ in 0..500 {
            let comm = std::fs::read_to_string(format!("/proc/{}/comm", pid)).unwrap_or_default();
            if comm.trim() == "sleep" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let _fd = session.open(pid).unwrap();
        let surface = buffer(0, 0);
        let id = add(&session, pid, &surface);
        assert_eq!(session.dispatcher.focused().map(|f| f.surface), Some(id));

        assert_eq!(session.pause(pid).await.unwrap(), Outcome::Forced);
        let connection = session.connection(pid).unwrap();
        assert!(!connection.input.enabled());
        assert!(session.dispatcher.focused().is_none());

        assert_eq!(session.resume(pid).await.unwrap(), Outcome::Forced);
        assert!(connection.input.enabled());
        assert_eq!(session.dispatcher.focused().map(|f| f.surface), Some(id));

        session.shutdown().await;
        assert!(session.connection(pid).is_err());
    }

    fn sleeper() -> std::process::Child {
        std::process::Command::new("sleep").arg("30").spawn().unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_malformed_messages_are_refused_and_stream_stays_framed() {
        use std::io::Write;
        use std::os::unix::net::UnixStream;

        let session = session(quiet());
        let fd = session.open(me()).unwrap();
        let mut other = sleeper();
        let other_pid = other.id() as i32;
        let other_fd = session.open(other_pid).unwrap();

        tokio::task::spawn_blocking(move || {
            let mut raw = UnixStream::from(fd.try_clone().unwrap());
            let mut client = Connection::new(fd);

            // Unknown message type with a payload the daemon must skip
            let mut bytes = Vec::new();
            bytes.extend_from_slice(&99i32.to_ne_bytes());
            bytes.extend_from_slice(&900u32.to_ne_bytes());
            bytes.extend_from_slice(&4u32.to_ne_bytes());
            bytes.extend_from_slice(&[1, 2, 3, 4]);
            raw.write_all(&bytes).unwrap();
            assert!(matches!(
                client.wait_for_ack(900, TIMEOUT),
                Err(ClientError::Rejected { ack_id: 900, errno: Errno::EINVAL })
            ));

            // Repaint too short to hold a command
            let short = client.send(MessageType::Repaint, Some(vec![0; 3])).unwrap();
            assert!(matches!(
                client.wait_for_ack(short, TIMEOUT),
                Err(ClientError::Rejected { errno: Errno::EINVAL, .. })
            ));

            client.ping(TIMEOUT).unwrap();
            Connection::new(other_fd).ping(TIMEOUT).unwrap();
        })
        .await
        .unwrap();

        assert!(session.connection(me()).is_ok());
        assert!(session.connection(other_pid).is_ok());
        session.close_connection(me());
        session.close_connection(other_pid);
        other.kill().unwrap();
        other.wait().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_repaint_surface_is_owner_scoped() {
        let session = session(quiet());
        let surface = buffer(0, 0);
        let mut other = sleeper();
        let other_pid = other.id() as i32;

        assert!(matches!(
            session.repaint_surface(me(), SurfaceId(1), 1),
            Err(SessionError::NoConnection(_))
        ));
        let _fd = session.open(me()).unwrap();
        let _other_fd = session.open(other_pid).unwrap();
        let id = add(&session, me(), &surface);

        let done = session
            .repaint_surface(me(), id, WaveformMode::Mono.as_raw())
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), done)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            session.repaint_surface(me(), id, 42),
            Err(SessionError::InvalidArgs(_))
        ));
        let err = session.repaint_surface(other_pid, id, 1).unwrap_err();
        assert_eq!(err.errno(), Errno::EPERM);
        let err = session.repaint_surface(me(), SurfaceId(id.0 + 100), 1).unwrap_err();
        assert_eq!(err.errno(), Errno::ENOENT);

        session.close_connection(me());
        session.close_connection(other_pid);
        other.kill().unwrap();
        other.wait().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_get_surface_returns_the_same_buffer() {
        use std::os::unix::fs::MetadataExt;

        let session = session(quiet());
        let surface = buffer(0, 0);
        let mut other = sleeper();
        let other_pid = other.id() as i32;

        assert!(matches!(
            session.get_surface(me(), SurfaceId(1)),
            Err(SessionError::NoConnection(_))
        ));
        let _fd = session.open(me()).unwrap();
        let _other_fd = session.open(other_pid).unwrap();
        let id = add(&session, me(), &surface);

        let fd = session.get_surface(me(), id).unwrap();
        let original = std::fs::File::from(surface.fd().try_clone_to_owned().unwrap());
        let returned = std::fs::File::from(fd);
        assert_eq!(
            returned.metadata().unwrap().ino(),
            original.metadata().unwrap().ino()
        );
        assert!(matches!(
            session.get_surface(other_pid, id),
            Err(SessionError::Registry(RegistryError::NotOwner { .. }))
        ));
        assert!(matches!(
            session.get_surface(me(), SurfaceId(id.0 + 100)),
            Err(SessionError::Registry(RegistryError::UnknownSurface(_)))
        ));

        session.close_connection(me());
        session.close_connection(other_pid);
        other.kill().unwrap();
        other.wait().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unsealed_buffer_is_refused() {
        let session = session(quiet());
        let _fd = session.open(me()).unwrap();
        let file = tempfile::tempfile().unwrap();
        file.set_len(16 * 16).unwrap();
        let err = session
            .add_surface(me(), file.into(), 0, 0, 16, 16, 16, 24)
            .unwrap_err();
        assert!(matches!(err, SessionError::Buffer(BufferError::Unsealed)));
        assert_eq!(err.errno(), Errno::EINVAL);
        assert!(session.surfaces().is_empty());
        session.close_connection(me());
    }
}
