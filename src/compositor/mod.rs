//! Compositor Module
//!
//! Surface bookkeeping, the framebuffer, panel refreshes and input routing.

pub mod dispatcher;
pub mod epdc;
pub mod framebuffer;
pub mod registry;

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::DisplayConfig;
pub use dispatcher::{DispatchError, Dispatcher, FocusTarget};
use epdc::{Epdc, Headless, RefreshDriver};
use framebuffer::FrameBuffer;
pub use registry::{RegistryError, SurfaceId, SurfaceRegistry};

/// Map the configured framebuffer and pick a refresh driver.
///
/// Falls back to a headless framebuffer when the device is missing, and to
/// the headless driver when EPDC refreshes are disabled or unavailable.
pub fn open_display(config: &DisplayConfig) -> Result<(FrameBuffer, Arc<dyn RefreshDriver>)> {
    let format = config.pixel_format();
    let stride = config.row_stride();
    if !config.framebuffer.exists() {
        warn!("Framebuffer {:?} not found, running headless", config.framebuffer);
        let framebuffer = FrameBuffer::headless(config.width, config.height, stride, format)?;
        return Ok((framebuffer, Arc::new(Headless)));
    }

    let framebuffer =
        FrameBuffer::open(&config.framebuffer, config.width, config.height, stride, format)?;
    if !config.epdc {
        info!("EPDC refreshes disabled");
        return Ok((framebuffer, Arc::new(Headless)));
    }
    match Epdc::open(&config.framebuffer) {
        Ok(epdc) => Ok((framebuffer, Arc::new(epdc))),
        Err(e) => {
            warn!("Failed to open EPDC on {:?}: {}", config.framebuffer, e);
            Ok((framebuffer, Arc::new(Headless)))
        }
    }
}
