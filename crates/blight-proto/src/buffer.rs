//! Shared-memory pixel buffers

use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, SealFlag, fcntl};
use nix::sys::memfd::{MemFdCreateFlag, memfd_create};
use std::ffi::CString;
use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;

use crate::format::PixelFormat;
use crate::geometry::Rect;
use crate::wire::SurfaceInfo;

static BUFFER_COUNTER: AtomicU32 = AtomicU32::new(0);

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("invalid buffer geometry {width}x{height} with stride {stride}")]
    InvalidGeometry { width: i32, height: i32, stride: i32 },
    #[error("failed to allocate shared memory: {0}")]
    Alloc(#[from] Errno),
    #[error("failed to map buffer: {0}")]
    Map(#[from] std::io::Error),
    #[error("buffer file holds {actual} bytes, expected at least {expected}")]
    TooSmall { expected: u64, actual: u64 },
    #[error("buffer file is not sealed against shrinking")]
    Unsealed,
}

/// A pixel buffer backed by a sealed memfd.
///
/// The fd can be handed to another process, which maps the same memory. Each
/// side owns its own mapping; the memory lives until both are gone.
#[derive(Debug)]
pub struct Buffer {
    fd: OwnedFd,
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub stride: i32,
    pub format: PixelFormat,
    memory: MmapMut,
}

/// Allocate a new buffer of `stride * height` bytes
pub fn create_buffer(
    x: i32,
    y: i32,
    width: i32,
    height: i32,
    stride: i32,
    format: PixelFormat,
) -> Result<Buffer, BufferError> {
    let size = checked_size(width, height, stride, format)?;
    let name = format!(
        "blight-{}-{}",
        std::process::id(),
        BUFFER_COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    let name = CString::new(name).map_err(|_| Errno::EINVAL)?;
    let fd = memfd_create(
        &name,
        MemFdCreateFlag::MFD_CLOEXEC | MemFdCreateFlag::MFD_ALLOW_SEALING,
    )?;
    let file = File::from(fd);
    file.set_len(size as u64)?;
    fcntl(
        file.as_raw_fd(),
        FcntlArg::F_ADD_SEALS(SealFlag::F_SEAL_SHRINK | SealFlag::F_SEAL_GROW | SealFlag::F_SEAL_SEAL),
    )?;
    let fd = OwnedFd::from(file);
    let memory = map(&fd, size)?;
    tracing::debug!("Created {}x{} buffer ({} bytes)", width, height, size);
    Ok(Buffer {
        fd,
        x,
        y,
        width,
        height,
        stride,
        format,
        memory,
    })
}

fn checked_size(
    width: i32,
    height: i32,
    stride: i32,
    format: PixelFormat,
) -> Result<usize, BufferError> {
    let invalid = BufferError::InvalidGeometry {
        width,
        height,
        stride,
    };
    if width <= 0 || height <= 0 || stride <= 0 {
        return Err(invalid);
    }
    if let Some(bpp) = format.bytes_per_pixel() {
        if (stride as usize) < width as usize * bpp {
            return Err(invalid);
        }
    }
    (stride as usize)
        .checked_mul(height as usize)
        .ok_or(invalid)
}

fn map(fd: &OwnedFd, size: usize) -> Result<MmapMut, BufferError> {
    // SAFETY: the region is shared with the client by contract; nothing here
    // relies on its contents staying unchanged between reads.
    let memory = unsafe { MmapOptions::new().len(size).map_mut(fd) }?;
    Ok(memory)
}

impl Buffer {
    /// Map a buffer someone else allocated.
    ///
    /// The file behind `fd` must hold at least `stride * height` bytes and
    /// carry `F_SEAL_SHRINK`, so the owner can never cut the mapping short.
    pub fn from_fd(
        fd: OwnedFd,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
        stride: i32,
        format: PixelFormat,
    ) -> Result<Self, BufferError> {
        let size = checked_size(width, height, stride, format)?;
        let seals = fcntl(fd.as_raw_fd(), FcntlArg::F_GET_SEALS)
            .map(SealFlag::from_bits_truncate)
            .unwrap_or(SealFlag::empty());
        if !seals.contains(SealFlag::F_SEAL_SHRINK) {
            return Err(BufferError::Unsealed);
        }
        let file = File::from(fd);
        let actual = file.metadata()?.len();
        if actual < size as u64 {
            return Err(BufferError::TooSmall {
                expected: size as u64,
                actual,
            });
        }
        let fd = OwnedFd::from(file);
        let memory = map(&fd, size)?;
        Ok(Self {
            fd,
            x,
            y,
            width,
            height,
            stride,
            format,
            memory,
        })
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Mapped size in bytes
    pub fn size(&self) -> usize {
        self.memory.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.memory
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    /// On-screen rectangle covered by the buffer
    pub fn rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.width, self.height)
    }

    pub fn info(&self) -> SurfaceInfo {
        SurfaceInfo {
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
            stride: self.stride,
            format: self.format,
        }
    }
}
