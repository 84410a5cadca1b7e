//! Control-plane access over D-Bus.
//!
//! Lets a client find the daemon without holding any socket yet, then hands
//! out the data-plane and input sockets and registers buffers as surfaces.
//! Helpers return `None` when the daemon is unavailable instead of blocking.

use std::os::fd::{AsFd, OwnedFd};
use zbus::fdo::DBusProxy;
use zbus::zvariant::Fd;
use zbus::{Connection, proxy};

use crate::buffer::Buffer;

/// Proxy for the session daemon's compositor interface
#[proxy(
    interface = "org.blight.Display1.Compositor",
    default_service = "org.blight.Display1",
    default_path = "/",
    gen_blocking = false
)]
pub trait Compositor {
    /// Open (or reopen) the caller's data-plane socket
    fn open(&self) -> zbus::Result<zbus::zvariant::OwnedFd>;

    /// Open the caller's read-only input socket; requires `open` first
    fn open_input(&self) -> zbus::Result<zbus::zvariant::OwnedFd>;

    /// Register a memfd-backed buffer as a surface
    fn add_surface(
        &self,
        fd: Fd<'_>,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
        stride: i32,
        format: i32,
    ) -> zbus::Result<u32>;

    fn remove_surface(&self, id: u32) -> zbus::Result<()>;

    /// Queue a full redraw of one of this process's surfaces
    fn repaint(&self, id: u32, waveform: i32) -> zbus::Result<()>;

    /// Buffer behind one of this process's surfaces
    fn get_surface(&self, id: u32) -> zbus::Result<zbus::zvariant::OwnedFd>;

    /// Return once a repaint carrying `marker` has been flushed
    fn wait_for_marker(&self, marker: u32) -> zbus::Result<()>;

    /// Surface ids in stacking order, bottom first
    fn surfaces(&self) -> zbus::Result<Vec<u32>>;

    fn raise(&self, id: u32) -> zbus::Result<()>;

    fn lower(&self, id: u32) -> zbus::Result<()>;

    fn focus(&self, id: u32) -> zbus::Result<()>;

    fn pause(&self, pid: i32) -> zbus::Result<()>;

    fn resume(&self, pid: i32) -> zbus::Result<()>;

    fn terminate(&self, pid: i32) -> zbus::Result<()>;

    /// Start a supervised process and return its pid
    fn launch(&self, program: &str, args: Vec<String>) -> zbus::Result<i32>;

    /// Pid of the daemon
    #[zbus(property)]
    fn pid(&self) -> zbus::Result<i32>;
}

/// Whether `name` currently has an owner on the bus
pub async fn has_service(conn: &Connection, name: &str) -> zbus::Result<bool> {
    let dbus = DBusProxy::new(conn).await?;
    let names = dbus.list_names().await?;
    Ok(names.iter().any(|owned| owned.as_str() == name))
}

/// Proxy to the daemon, `None` if it is not running
pub async fn connect(conn: &Connection) -> Option<CompositorProxy<'static>> {
    match has_service(conn, crate::SERVICE).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!("{} is not running", crate::SERVICE);
            return None;
        }
        Err(e) => {
            tracing::warn!("Failed to query bus names: {}", e);
            return None;
        }
    }
    CompositorProxy::new(conn)
        .await
        .inspect_err(|e| tracing::warn!("Failed to create compositor proxy: {}", e))
        .ok()
}

fn into_owned(fd: zbus::zvariant::OwnedFd) -> Option<OwnedFd> {
    fd.as_fd()
        .try_clone_to_owned()
        .inspect_err(|e| tracing::warn!("Failed to duplicate socket: {}", e))
        .ok()
}

/// Data-plane socket for this process
pub async fn service_open(proxy: &CompositorProxy<'_>) -> Option<OwnedFd> {
    match proxy.open().await {
        Ok(fd) => into_owned(fd),
        Err(e) => {
            tracing::warn!("Failed to open connection: {}", e);
            None
        }
    }
}

/// Input socket for this process
pub async fn service_input_open(proxy: &CompositorProxy<'_>) -> Option<OwnedFd> {
    match proxy.open_input().await {
        Ok(fd) => into_owned(fd),
        Err(e) => {
            tracing::warn!("Failed to open input connection: {}", e);
            None
        }
    }
}

/// Register `buffer` and return its surface id
pub async fn add_surface(proxy: &CompositorProxy<'_>, buffer: &Buffer) -> Option<u32> {
    let result = proxy
        .add_surface(
            Fd::from(buffer.fd()),
            buffer.x,
            buffer.y,
            buffer.width,
            buffer.height,
            buffer.stride,
            buffer.format.as_raw(),
        )
        .await;
    match result {
        Ok(id) => Some(id),
        Err(e) => {
            tracing::warn!("Failed to add surface: {}", e);
            None
        }
    }
}
