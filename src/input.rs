//! evdev input forwarding
//!
//! Reads kernel `input_event` records from the configured devices and hands
//! them to whichever client owns the focused surface. The index of a device
//! in the configuration is the device id clients see.

use anyhow::{Context, Result};
use blight_proto::RawInputEvent;
use bytemuck::{Pod, Zeroable};
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tracing::{info, trace, warn};

use crate::session::Session;

/// `struct input_event` as the kernel writes it
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct InputEvent {
    pub sec: libc::c_long,
    pub usec: libc::c_long,
    pub kind: u16,
    pub code: u16,
    pub value: i32,
}

pub const EVENT_SIZE: usize = mem::size_of::<InputEvent>();

impl InputEvent {
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        bytemuck::try_pod_read_unaligned(bytes.get(..EVENT_SIZE)?).ok()
    }

    pub fn raw(&self) -> RawInputEvent {
        RawInputEvent {
            kind: self.kind,
            code: self.code,
            value: self.value,
        }
    }
}

/// Start one reader per device
pub fn spawn_readers(session: &Arc<Session>, devices: &[PathBuf]) -> Vec<JoinHandle<()>> {
    devices
        .iter()
        .enumerate()
        .map(|(index, path)| {
            let session = session.clone();
            let path = path.clone();
            let device_id = index as u32;
            tokio::spawn(async move {
                if let Err(e) = forward(&session, device_id, &path).await {
                    warn!("Input device {:?} stopped: {:#}", path, e);
                }
            })
        })
        .collect()
}

async fn forward(session: &Session, device_id: u32, path: &Path) -> Result<()> {
    let mut device = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open input device {:?}", path))?;
    info!("Forwarding input from {:?} as device {}", path, device_id);
    let mut buf = [0u8; EVENT_SIZE];
    loop {
        device
            .read_exact(&mut buf)
            .await
            .context("Failed to read input event")?;
        let Some(event) = InputEvent::decode(&buf) else {
            continue;
        };
        trace!(
            "Device {}: type {} code {} value {}",
            device_id, event.kind, event.code, event.value
        );
        if !session.dispatch_event(device_id, event.raw()) {
            trace!("Dropped event from device {}", device_id);
        }
    }
}
