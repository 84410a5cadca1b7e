//! Framebuffer Module
//!
//! The panel's scanout memory, mapped from the framebuffer device or from
//! anonymous memory when running headless.

use anyhow::{Context, Result, bail};
use blight_proto::{Buffer, PixelFormat, Rect};
use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::path::Path;
use tracing::{debug, info, warn};

pub struct FrameBuffer {
    memory: MmapMut,
    pub width: i32,
    pub height: i32,
    pub stride: i32,
    pub format: PixelFormat,
}

fn checked_len(width: i32, height: i32, stride: i32, format: PixelFormat) -> Result<usize> {
    let Some(bpp) = format.bytes_per_pixel().filter(|_| format.can_convert()) else {
        bail!("Unsupported framebuffer format {:?}", format);
    };
    if width <= 0 || height <= 0 || (stride as i64) < width as i64 * bpp as i64 {
        bail!(
            "Invalid framebuffer geometry: {}x{} with stride {}",
            width,
            height,
            stride
        );
    }
    Ok(height as usize * stride as usize)
}

impl FrameBuffer {
    /// Map the framebuffer device
    pub fn open(
        path: &Path,
        width: i32,
        height: i32,
        stride: i32,
        format: PixelFormat,
    ) -> Result<Self> {
        let len = checked_len(width, height, stride, format)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open framebuffer {:?}", path))?;
        let metadata = file.metadata()?;
        if metadata.is_file() && metadata.len() < len as u64 {
            bail!(
                "Framebuffer {:?} holds {} bytes, expected {}",
                path,
                metadata.len(),
                len
            );
        }
        // SAFETY: the device memory is only written by this process.
        let memory = unsafe { MmapOptions::new().len(len).map_mut(&file) }
            .with_context(|| format!("Failed to map framebuffer {:?}", path))?;
        info!("Mapped framebuffer {:?} ({}x{}, {:?})", path, width, height, format);
        Ok(Self {
            memory,
            width,
            height,
            stride,
            format,
        })
    }

    /// Framebuffer in plain memory, for running without a panel
    pub fn headless(width: i32, height: i32, stride: i32, format: PixelFormat) -> Result<Self> {
        let len = checked_len(width, height, stride, format)?;
        let memory = MmapMut::map_anon(len).context("Failed to allocate headless framebuffer")?;
        info!("Using headless framebuffer ({}x{}, {:?})", width, height, format);
        Ok(Self {
            memory,
            width,
            height,
            stride,
            format,
        })
    }

    pub fn rect(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }

    fn bpp(&self) -> usize {
        self.format.bytes_per_pixel().unwrap_or(1)
    }

    /// Copy the part of `buffer` inside `area` (screen coordinates) to the
    /// screen. Returns the rectangle actually drawn.
    pub fn blit(&mut self, buffer: &Buffer, area: Rect) -> Rect {
        let clip = area.intersect(&buffer.rect()).intersect(&self.rect());
        if clip.is_empty() {
            return clip;
        }
        let Some(src_bpp) = buffer.format.bytes_per_pixel() else {
            warn!("Cannot composite buffer format {:?}", buffer.format);
            return Rect::default();
        };
        let same_format = buffer.format == self.format;
        if !same_format && !buffer.format.can_convert() {
            warn!("Cannot convert {:?} to {:?}", buffer.format, self.format);
            return Rect::default();
        }

        let dst_bpp = self.bpp();
        let src = buffer.data();
        let width = clip.width as usize;
        for row in clip.y..clip.bottom() {
            let src_start = (row - buffer.y) as usize * buffer.stride as usize
                + (clip.x - buffer.x) as usize * src_bpp;
            let dst_start = row as usize * self.stride as usize + clip.x as usize * dst_bpp;
            let src_row = &src[src_start..src_start + width * src_bpp];
            let dst_row = &mut self.memory[dst_start..dst_start + width * dst_bpp];
            if same_format {
                dst_row.copy_from_slice(src_row);
                continue;
            }
            for (s, d) in src_row
                .chunks_exact(src_bpp)
                .zip(dst_row.chunks_exact_mut(dst_bpp))
            {
                if let Some(rgb) = buffer.format.to_rgb(s) {
                    self.format.write_rgb(rgb, d);
                }
            }
        }
        debug!("Blitted {:?}", clip);
        clip
    }

    /// Fill `area` with one colour
    pub fn fill(&mut self, area: Rect, rgb: [u8; 3]) {
        let clip = area.intersect(&self.rect());
        if clip.is_empty() {
            return;
        }
        let bpp = self.bpp();
        let mut px = vec![0u8; bpp];
        self.format.write_rgb(rgb, &mut px);
        for row in clip.y..clip.bottom() {
            let start = row as usize * self.stride as usize + clip.x as usize * bpp;
            let end = start + clip.width as usize * bpp;
            for d in self.memory[start..end].chunks_exact_mut(bpp) {
                d.copy_from_slice(&px);
            }
        }
    }

    /// Colour at a screen position
    #[cfg(test)]
    pub fn pixel(&self, x: i32, y: i32) -> Option<[u8; 3]> {
        if !self.rect().intersects(&Rect::new(x, y, 1, 1)) {
            return None;
        }
        let bpp = self.bpp();
        let start = y as usize * self.stride as usize + x as usize * bpp;
        self.format.to_rgb(&self.memory[start..start + bpp])
    }
}
