//! `org.blight.Display1.Compositor` object
//!
//! Clients are identified by the unix pid behind their bus name, so a
//! process can only ever open its own sockets and touch its own surfaces.

use std::sync::Arc;
use tracing::{debug, warn};
use zbus::fdo::{self, DBusProxy};
use zbus::message::Header;
use zbus::names::BusName;
use zbus::zvariant::OwnedFd;

use crate::compositor::{RegistryError, SurfaceId};
use crate::session::{Session, SessionError};
use crate::supervisor::SupervisorError;

pub struct CompositorInterface {
    session: Arc<Session>,
}

impl CompositorInterface {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

/// Pid of the process that sent the current call
async fn caller_pid(header: &Header<'_>, conn: &zbus::Connection) -> fdo::Result<i32> {
    let sender = header
        .sender()
        .ok_or_else(|| fdo::Error::AccessDenied("call has no sender".to_string()))?;
    let pid = DBusProxy::new(conn)
        .await?
        .get_connection_unix_process_id(BusName::from(sender.clone()))
        .await?;
    i32::try_from(pid).map_err(|_| fdo::Error::Failed(format!("bad caller pid {}", pid)))
}

impl From<SessionError> for fdo::Error {
    fn from(e: SessionError) -> Self {
        let message = e.to_string();
        match e {
            SessionError::NoConnection(_)
            | SessionError::Registry(RegistryError::NotOwner { .. }) => {
                fdo::Error::AccessDenied(message)
            }
            SessionError::InvalidArgs(_)
            | SessionError::Registry(RegistryError::UnknownSurface(_))
            | SessionError::Supervisor(SupervisorError::NoSuchProcess(_)) => {
                fdo::Error::InvalidArgs(message)
            }
            SessionError::Buffer(
                blight_proto::BufferError::InvalidGeometry { .. }
                | blight_proto::BufferError::TooSmall { .. }
                | blight_proto::BufferError::Unsealed,
            ) => fdo::Error::InvalidArgs(message),
            _ => fdo::Error::Failed(message),
        }
    }
}

#[zbus::interface(name = "org.blight.Display1.Compositor")]
impl CompositorInterface {
    /// Open (or reopen) the caller's data-plane socket
    async fn open(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> fdo::Result<OwnedFd> {
        let pid = caller_pid(&header, conn).await?;
        debug!("open() from {}", pid);
        Ok(OwnedFd::from(self.session.open(pid)?))
    }

    /// Read-only input socket of the caller
    async fn open_input(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> fdo::Result<OwnedFd> {
        let pid = caller_pid(&header, conn).await?;
        Ok(OwnedFd::from(self.session.open_input(pid)?))
    }

    #[allow(clippy::too_many_arguments)]
    async fn add_surface(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
        fd: OwnedFd,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
        stride: i32,
        format: i32,
    ) -> fdo::Result<u32> {
        let pid = caller_pid(&header, conn).await?;
        let id = self
            .session
            .add_surface(pid, fd.into(), x, y, width, height, stride, format)
            .inspect_err(|e| warn!("add_surface from {} failed: {}", pid, e))?;
        Ok(id.0)
    }

    async fn remove_surface(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
        id: u32,
    ) -> fdo::Result<()> {
        let pid = caller_pid(&header, conn).await?;
        Ok(self.session.remove_surface(pid, SurfaceId(id))?)
    }

    /// Queue a full redraw of one of the caller's surfaces
    async fn repaint(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
        id: u32,
        waveform: i32,
    ) -> fdo::Result<()> {
        let pid = caller_pid(&header, conn).await?;
        self.session.repaint_surface(pid, SurfaceId(id), waveform)?;
        Ok(())
    }

    /// The buffer behind one of the caller's surfaces
    async fn get_surface(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
        id: u32,
    ) -> fdo::Result<OwnedFd> {
        let pid = caller_pid(&header, conn).await?;
        Ok(OwnedFd::from(self.session.get_surface(pid, SurfaceId(id))?))
    }

    /// Return once a repaint carrying `marker` has reached the panel
    async fn wait_for_marker(&self, marker: u32) {
        self.session.wait_for_marker(marker).await
    }

    /// Surface ids in stacking order, bottom first
    async fn surfaces(&self) -> Vec<u32> {
        self.session.surfaces()
    }

    async fn raise(&self, id: u32) -> fdo::Result<()> {
        Ok(self.session.raise(SurfaceId(id))?)
    }

    async fn lower(&self, id: u32) -> fdo::Result<()> {
        Ok(self.session.lower(SurfaceId(id))?)
    }

    async fn focus(&self, id: u32) -> fdo::Result<()> {
        Ok(self.session.focus(SurfaceId(id))?)
    }

    async fn pause(&self, pid: i32) -> fdo::Result<()> {
        self.session.pause(pid).await?;
        Ok(())
    }

    async fn resume(&self, pid: i32) -> fdo::Result<()> {
        self.session.resume(pid).await?;
        Ok(())
    }

    async fn terminate(&self, pid: i32) -> fdo::Result<()> {
        Ok(self.session.terminate(pid).await?)
    }

    async fn launch(&self, program: String, args: Vec<String>) -> fdo::Result<i32> {
        Ok(self.session.launch(&program, &args)?)
    }

    #[zbus(property)]
    async fn pid(&self) -> i32 {
        std::process::id() as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        let denied: fdo::Error = SessionError::NoConnection(1).into();
        assert!(matches!(denied, fdo::Error::AccessDenied(_)));
        let unknown: fdo::Error =
            SessionError::Registry(RegistryError::UnknownSurface(SurfaceId(3))).into();
        assert!(matches!(unknown, fdo::Error::InvalidArgs(_)));
        let owner: fdo::Error = SessionError::Registry(RegistryError::NotOwner {
            surface: SurfaceId(3),
            pid: 9,
        })
        .into();
        assert!(matches!(owner, fdo::Error::AccessDenied(_)));
        let busy: fdo::Error = SessionError::Supervisor(SupervisorError::NoSuchProcess(4)).into();
        assert!(matches!(busy, fdo::Error::InvalidArgs(_)));
        let unsealed: fdo::Error = SessionError::Buffer(blight_proto::BufferError::Unsealed).into();
        assert!(matches!(unsealed, fdo::Error::InvalidArgs(_)));
        let failed: fdo::Error = SessionError::Channel("closed".to_string()).into();
        assert!(matches!(failed, fdo::Error::Failed(_)));
    }
}
