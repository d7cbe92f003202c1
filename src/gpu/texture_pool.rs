//! Pool of GPU textures shared by every program group.

use super::{GpuContext, Texture, TextureFormat};
use crate::error::{Error, Result};
use tracing::{debug, trace};

/// Ownership state of a pooled texture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotState {
    Free,
    /// Handed out as a recyclable intermediate or output.
    PooledInUse,
    /// Owned by a single node for its lifetime; never recycled.
    Exclusive { owner: String },
}

struct Slot {
    texture: Texture,
    state: SlotState,
    pinned: bool,
}

/// Each texture is, at any moment, exactly one of free, pooled-in-use or
/// exclusively owned. Pinned textures are pooled-in-use and survive
/// [`TexturePool::reclaim`].
#[derive(Default)]
pub struct TexturePool {
    slots: Vec<Slot>,
}

impl TexturePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out a texture of the given shape, reusing a free one when possible.
    pub fn acquire(&mut self, gpu: &mut dyn GpuContext, width: u32, height: u32, format: TextureFormat) -> Result<Texture> {
        let slot = self.take_slot(gpu, width, height, format)?;
        self.slots[slot].state = SlotState::PooledInUse;
        Ok(self.slots[slot].texture)
    }

    /// Hand out a texture that belongs to `owner` until [`TexturePool::teardown`].
    pub fn acquire_exclusive(
        &mut self,
        gpu: &mut dyn GpuContext,
        owner: &str,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Result<Texture> {
        let slot = self.take_slot(gpu, width, height, format)?;
        self.slots[slot].state = SlotState::Exclusive {
            owner: owner.to_string(),
        };
        debug!("Texture {} is now owned by '{}'", self.slots[slot].texture, owner);
        Ok(self.slots[slot].texture)
    }

    /// Replace an exclusively owned texture with one of another shape.
    pub fn resize_exclusive(
        &mut self,
        gpu: &mut dyn GpuContext,
        texture: &Texture,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Result<Texture> {
        let index = self
            .index_of(texture)
            .ok_or_else(|| Error::NotFound(format!("{texture} is not pooled")))?;
        if !matches!(self.slots[index].state, SlotState::Exclusive { .. }) {
            return Err(Error::IllegalOperation(format!("{texture} is not exclusively owned")));
        }
        let current = self.slots[index].texture;
        if (current.width, current.height, current.format) == (width, height, format) {
            return Ok(current);
        }
        let replacement = gpu.create_texture(width, height, format)?;
        gpu.destroy_texture(&current);
        self.slots[index].texture = replacement;
        Ok(replacement)
    }

    fn take_slot(&mut self, gpu: &mut dyn GpuContext, width: u32, height: u32, format: TextureFormat) -> Result<usize> {
        let matching = self.slots.iter().position(|slot| {
            slot.state == SlotState::Free
                && slot.texture.format == format
                && (slot.texture.width, slot.texture.height) == (width, height)
        });
        if let Some(index) = matching {
            trace!("Reusing {}", self.slots[index].texture);
            return Ok(index);
        }

        let texture = gpu.create_texture(width, height, format)?;
        if let Some(index) = self.slots.iter().position(|slot| slot.state == SlotState::Free) {
            trace!("Resizing {} to {}x{}", self.slots[index].texture, width, height);
            gpu.destroy_texture(&self.slots[index].texture);
            self.slots[index].texture = texture;
            return Ok(index);
        }

        trace!("Allocated {}", texture);
        self.slots.push(Slot {
            texture,
            state: SlotState::Free,
            pinned: false,
        });
        Ok(self.slots.len() - 1)
    }

    fn index_of(&self, texture: &Texture) -> Option<usize> {
        self.slots.iter().position(|slot| slot.texture.id == texture.id)
    }

    /// Return a pooled texture. Pinned and exclusive textures are left alone.
    pub fn release(&mut self, texture: &Texture) {
        if let Some(index) = self.index_of(texture) {
            let slot = &mut self.slots[index];
            if slot.state == SlotState::PooledInUse && !slot.pinned {
                slot.state = SlotState::Free;
            }
        }
    }

    pub fn pin(&mut self, texture: &Texture) {
        if let Some(index) = self.index_of(texture) {
            self.slots[index].pinned = true;
        }
    }

    pub fn unpin(&mut self, texture: &Texture) {
        if let Some(index) = self.index_of(texture) {
            self.slots[index].pinned = false;
        }
    }

    pub fn is_pinned(&self, texture: &Texture) -> bool {
        self.index_of(texture).is_some_and(|index| self.slots[index].pinned)
    }

    /// Free every unpinned pooled texture. Called once a pipeline run ends.
    pub fn reclaim(&mut self) {
        for slot in &mut self.slots {
            if slot.state == SlotState::PooledInUse && !slot.pinned {
                slot.state = SlotState::Free;
            }
        }
    }

    pub fn state(&self, texture: &Texture) -> Option<SlotState> {
        self.index_of(texture).map(|index| self.slots[index].state.clone())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|slot| slot.state == SlotState::PooledInUse).count()
    }

    pub fn pinned(&self) -> usize {
        self.slots.iter().filter(|slot| slot.pinned).count()
    }

    /// Destroy every texture, whatever its state.
    pub fn teardown(&mut self, gpu: &mut dyn GpuContext) {
        for slot in self.slots.drain(..) {
            gpu.destroy_texture(&slot.texture);
        }
    }
}
