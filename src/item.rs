// Render items: drawable units and their handle store
//
// Handles are slotmap keys (slot index + generation counter), so a
// destroyed handle is detected instead of aliasing a reused slot.

use ash::vk;
use glam::Mat4;
use slotmap::{new_key_type, SlotMap};

use crate::backend::buffer::GpuBuffer;
use crate::error::{RendererError, Result};

new_key_type! {
    /// Opaque handle to a render item.
    pub struct RenderItemKey;
}

new_key_type! {
    /// Opaque handle to an uploaded texture.
    pub struct TextureKey;
}

/// Interleaved vertex layout consumed by the item pipeline.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 3],
    pub uv: [f32; 2],
}

/// Creation payload for a render item: raw byte spans, no format
/// negotiation beyond size. Indices are u32.
pub struct RenderItemDesc<'a> {
    pub vertices: &'a [u8],
    pub indices: &'a [u8],
    pub texture: Option<TextureKey>,
}

impl RenderItemDesc<'_> {
    /// Validate payloads before any GPU allocation is attempted.
    /// Returns the index count.
    pub fn validate(&self) -> Result<u32> {
        if self.vertices.is_empty() {
            return Err(RendererError::InvalidArguments("vertex payload must be non-empty"));
        }
        if self.indices.is_empty() {
            return Err(RendererError::InvalidArguments("index payload must be non-empty"));
        }
        if self.indices.len() % std::mem::size_of::<u32>() != 0 {
            return Err(RendererError::InvalidArguments(
                "index payload must be a whole number of u32 indices",
            ));
        }
        Ok((self.indices.len() / std::mem::size_of::<u32>()) as u32)
    }
}

/// One drawable unit: resident vertex/index buffers, index count, model
/// transform, and the descriptor set binding its texture.
pub struct RenderItem {
    pub vertex_buffer: GpuBuffer,
    pub index_buffer: GpuBuffer,
    pub index_count: u32,
    pub transform: Mat4,
    pub texture: Option<TextureKey>,
    pub descriptor_set: vk::DescriptorSet,
}

/// Generation-checked arena. Stale keys (double destroy, use after
/// destroy) are typed errors, never silent aliasing.
pub struct ItemStore<T> {
    items: SlotMap<RenderItemKey, T>,
}

impl<T> ItemStore<T> {
    pub fn new() -> Self {
        Self {
            items: SlotMap::with_key(),
        }
    }

    pub fn insert(&mut self, item: T) -> RenderItemKey {
        self.items.insert(item)
    }

    pub fn remove(&mut self, key: RenderItemKey) -> Result<T> {
        self.items.remove(key).ok_or(RendererError::StaleHandle)
    }

    pub fn get(&self, key: RenderItemKey) -> Result<&T> {
        self.items.get(key).ok_or(RendererError::StaleHandle)
    }

    pub fn get_mut(&mut self, key: RenderItemKey) -> Result<&mut T> {
        self.items.get_mut(key).ok_or(RendererError::StaleHandle)
    }

    pub fn iter(&self) -> impl Iterator<Item = (RenderItemKey, &T)> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Remove every item, returning them for teardown.
    pub fn drain(&mut self) -> Vec<T> {
        self.items.drain().map(|(_, item)| item).collect()
    }
}

impl<T> Default for ItemStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc<'a>(vertices: &'a [u8], indices: &'a [u8]) -> RenderItemDesc<'a> {
        RenderItemDesc {
            vertices,
            indices,
            texture: None,
        }
    }

    #[test]
    fn desc_validation_computes_index_count() {
        // 4 vertices at 16 bytes each, 6 u32 indices
        let vertices = [0u8; 64];
        let indices = [0u8; 24];
        assert_eq!(desc(&vertices, &indices).validate().unwrap(), 6);
    }

    #[test]
    fn desc_validation_rejects_empty_payloads() {
        let some = [0u8; 8];
        assert!(matches!(
            desc(&[], &some).validate(),
            Err(RendererError::InvalidArguments(_))
        ));
        assert!(matches!(
            desc(&some, &[]).validate(),
            Err(RendererError::InvalidArguments(_))
        ));
    }

    #[test]
    fn desc_validation_rejects_ragged_index_bytes() {
        let vertices = [0u8; 32];
        let indices = [0u8; 10];
        assert!(matches!(
            desc(&vertices, &indices).validate(),
            Err(RendererError::InvalidArguments(_))
        ));
    }

    #[test]
    fn store_create_then_destroy_leaves_nothing_live() {
        let mut store = ItemStore::new();
        let keys: Vec<_> = (0..8u32).map(|i| store.insert(i)).collect();
        assert_eq!(store.len(), 8);
        for key in keys {
            store.remove(key).unwrap();
        }
        assert!(store.is_empty());
    }

    #[test]
    fn double_destroy_is_a_stale_handle_error() {
        let mut store = ItemStore::new();
        let key = store.insert("mesh");
        assert_eq!(store.remove(key).unwrap(), "mesh");
        assert!(matches!(store.remove(key), Err(RendererError::StaleHandle)));
    }

    #[test]
    fn destroyed_key_does_not_alias_a_reused_slot() {
        let mut store = ItemStore::new();
        let old = store.insert(1u32);
        store.remove(old).unwrap();
        // The slot is reused with a bumped generation
        let new = store.insert(2u32);
        assert!(matches!(store.get(old), Err(RendererError::StaleHandle)));
        assert_eq!(*store.get(new).unwrap(), 2);
    }

    #[test]
    fn vertex_layout_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<Vertex>(), 32);
    }
}
