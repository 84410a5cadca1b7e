//! Surface Registry
//!
//! Owns every surface the daemon knows about, keyed by id, plus the
//! stacking order (bottom to top).

use blight_proto::{Buffer, BufferError, PixelFormat, Rect};
use std::collections::HashMap;
use std::fmt;
use std::os::fd::OwnedFd;
use thiserror::Error;
use tracing::debug;

/// Identifier of a registered surface. Never 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u32);

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no surface with id {0}")]
    UnknownSurface(SurfaceId),
    #[error("surface {surface} does not belong to process {pid}")]
    NotOwner { surface: SurfaceId, pid: i32 },
}

/// A client buffer placed on screen
#[derive(Debug)]
pub struct Surface {
    pub id: SurfaceId,
    /// Pid of the connection that registered it
    pub owner: i32,
    pub buffer: Buffer,
}

impl Surface {
    /// Name used in logs and introspection
    pub fn name(&self) -> String {
        format!("connection/{}/surface/{}", self.owner, self.id)
    }

    pub fn rect(&self) -> Rect {
        self.buffer.rect()
    }
}

#[derive(Debug, Default)]
pub struct SurfaceRegistry {
    surfaces: HashMap<SurfaceId, Surface>,
    /// Bottom to top
    stacking: Vec<SurfaceId>,
    last_id: u32,
}

impl SurfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> SurfaceId {
        loop {
            self.last_id = self.last_id.wrapping_add(1);
            let id = SurfaceId(self.last_id);
            if self.last_id != 0 && !self.surfaces.contains_key(&id) {
                return id;
            }
        }
    }

    /// Register a mapped buffer on top of the stack
    pub fn add_surface(&mut self, owner: i32, buffer: Buffer) -> SurfaceId {
        let id = self.next_id();
        let surface = Surface { id, owner, buffer };
        debug!("Added {} at {:?}", surface.name(), surface.rect());
        self.surfaces.insert(id, surface);
        self.stacking.push(id);
        id
    }

    /// Map a client's memfd and register it
    #[allow(clippy::too_many_arguments)]
    pub fn create_surface(
        &mut self,
        owner: i32,
        fd: OwnedFd,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
        stride: i32,
        format: PixelFormat,
    ) -> Result<SurfaceId, BufferError> {
        let buffer = Buffer::from_fd(fd, x, y, width, height, stride, format)?;
        Ok(self.add_surface(owner, buffer))
    }

    pub fn remove_surface(&mut self, id: SurfaceId) -> Result<Surface, RegistryError> {
        let surface = self
            .surfaces
            .remove(&id)
            .ok_or(RegistryError::UnknownSurface(id))?;
        self.stacking.retain(|&s| s != id);
        debug!("Removed {}", surface.name());
        Ok(surface)
    }

    /// Drop every surface owned by `pid`, returning their ids
    pub fn remove_owned_by(&mut self, pid: i32) -> Vec<SurfaceId> {
        let ids = self.surfaces_of(pid);
        for id in &ids {
            self.surfaces.remove(id);
        }
        self.stacking.retain(|id| !ids.contains(id));
        ids
    }

    pub fn get(&self, id: SurfaceId) -> Option<&Surface> {
        self.surfaces.get(&id)
    }

    /// The surface, provided `pid` owns it
    pub fn owned(&self, id: SurfaceId, pid: i32) -> Result<&Surface, RegistryError> {
        let surface = self.get(id).ok_or(RegistryError::UnknownSurface(id))?;
        if surface.owner != pid {
            return Err(RegistryError::NotOwner { surface: id, pid });
        }
        Ok(surface)
    }

    /// Move a surface; returns the rectangle it covered before
    pub fn move_surface(&mut self, id: SurfaceId, x: i32, y: i32) -> Result<Rect, RegistryError> {
        let surface = self
            .surfaces
            .get_mut(&id)
            .ok_or(RegistryError::UnknownSurface(id))?;
        let old = surface.rect();
        surface.buffer.x = x;
        surface.buffer.y = y;
        Ok(old)
    }

    /// Ids owned by `pid`, bottom first
    pub fn surfaces_of(&self, pid: i32) -> Vec<SurfaceId> {
        self.stacking
            .iter()
            .copied()
            .filter(|id| self.surfaces.get(id).is_some_and(|s| s.owner == pid))
            .collect()
    }

    /// Ids in stacking order, bottom first
    pub fn ids(&self) -> Vec<SurfaceId> {
        self.stacking.clone()
    }

    /// Surfaces stacked above `id`, lowest first
    pub fn above(&self, id: SurfaceId) -> impl Iterator<Item = &Surface> {
        self.stacking
            .iter()
            .skip_while(move |&&s| s != id)
            .skip(1)
            .filter_map(|s| self.surfaces.get(s))
    }

    /// Bring to the top of the stack
    pub fn raise(&mut self, id: SurfaceId) -> Result<(), RegistryError> {
        if !self.surfaces.contains_key(&id) {
            return Err(RegistryError::UnknownSurface(id));
        }
        self.stacking.retain(|&s| s != id);
        self.stacking.push(id);
        Ok(())
    }

    /// Send to the bottom of the stack
    pub fn lower(&mut self, id: SurfaceId) -> Result<(), RegistryError> {
        if !self.surfaces.contains_key(&id) {
            return Err(RegistryError::UnknownSurface(id));
        }
        self.stacking.retain(|&s| s != id);
        self.stacking.insert(0, id);
        Ok(())
    }

    /// Topmost surface accepted by `filter`
    pub fn topmost(&self, filter: impl Fn(&Surface) -> bool) -> Option<&Surface> {
        self.stacking
            .iter()
            .rev()
            .filter_map(|id| self.surfaces.get(id))
            .find(|s| filter(s))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }
}
