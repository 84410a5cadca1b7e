//! EPDC refresh driver
//!
//! Writing to framebuffer memory does not change what the panel shows; the
//! electrophoretic display controller has to be told which region to
//! refresh and with which waveform. Completion is reported per marker.

use blight_proto::{Rect, WaveformMode};
use bytemuck::{Pod, Zeroable};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;
use tracing::{debug, trace};

const UPDATE_MODE_PARTIAL: u32 = 0;
const UPDATE_MODE_FULL: u32 = 1;
const TEMP_USE_AMBIENT: i32 = 0x1000;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct MxcfbRect {
    pub top: u32,
    pub left: u32,
    pub width: u32,
    pub height: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct MxcfbAltBufferData {
    pub phys_addr: u32,
    pub width: u32,
    pub height: u32,
    pub alt_update_region: MxcfbRect,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct MxcfbUpdateData {
    pub update_region: MxcfbRect,
    pub waveform_mode: u32,
    pub update_mode: u32,
    pub update_marker: u32,
    pub temp: i32,
    pub flags: u32,
    pub dither_mode: i32,
    pub quant_bit: i32,
    pub alt_buffer_data: MxcfbAltBufferData,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct MxcfbUpdateMarkerData {
    pub update_marker: u32,
    pub collision_test: u32,
}

nix::ioctl_write_ptr!(mxcfb_send_update, b'F', 0x2e, MxcfbUpdateData);
nix::ioctl_readwrite!(
    mxcfb_wait_for_update_complete,
    b'F',
    0x2f,
    MxcfbUpdateMarkerData
);

/// Hands refresh requests to the panel
pub trait RefreshDriver: Send + Sync {
    /// Start refreshing `area`. `marker` is the hardware marker to wait on.
    fn send_update(
        &self,
        area: Rect,
        waveform: WaveformMode,
        full: bool,
        marker: u32,
    ) -> io::Result<()>;

    /// Block until the refresh tagged `marker` has finished
    fn wait_for_update(&self, marker: u32) -> io::Result<()>;
}

/// i.MX EPDC behind the framebuffer device
pub struct Epdc {
    device: File,
}

impl Epdc {
    pub fn open(path: &Path) -> io::Result<Self> {
        let device = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { device })
    }
}

fn update_data(area: Rect, waveform: WaveformMode, full: bool, marker: u32) -> MxcfbUpdateData {
    MxcfbUpdateData {
        update_region: MxcfbRect {
            top: area.y.max(0) as u32,
            left: area.x.max(0) as u32,
            width: area.width.max(0) as u32,
            height: area.height.max(0) as u32,
        },
        waveform_mode: waveform.as_raw() as u32,
        update_mode: if full {
            UPDATE_MODE_FULL
        } else {
            UPDATE_MODE_PARTIAL
        },
        update_marker: marker,
        temp: TEMP_USE_AMBIENT,
        ..MxcfbUpdateData::default()
    }
}

impl RefreshDriver for Epdc {
    fn send_update(
        &self,
        area: Rect,
        waveform: WaveformMode,
        full: bool,
        marker: u32,
    ) -> io::Result<()> {
        let data = update_data(area, waveform, full, marker);
        debug!(
            "Sending update {:?} waveform {:?} full {} marker {}",
            area, waveform, full, marker
        );
        // SAFETY: `data` is a fully initialized repr(C) struct matching the
        // kernel's layout and outlives the call.
        unsafe { mxcfb_send_update(self.device.as_raw_fd(), &data) }?;
        Ok(())
    }

    fn wait_for_update(&self, marker: u32) -> io::Result<()> {
        let mut data = MxcfbUpdateMarkerData {
            update_marker: marker,
            collision_test: 0,
        };
        // SAFETY: as above; the kernel writes back into `data`.
        unsafe { mxcfb_wait_for_update_complete(self.device.as_raw_fd(), &mut data) }?;
        trace!("Update {} complete", marker);
        Ok(())
    }
}

/// Driver for running without a panel; every refresh completes at once
#[derive(Debug, Default)]
pub struct Headless;

impl RefreshDriver for Headless {
    fn send_update(
        &self,
        area: Rect,
        waveform: WaveformMode,
        full: bool,
        marker: u32,
    ) -> io::Result<()> {
        trace!(
            "Headless update {:?} waveform {:?} full {} marker {}",
            area, waveform, full, marker
        );
        Ok(())
    }

    fn wait_for_update(&self, _marker: u32) -> io::Result<()> {
        Ok(())
    }
}
