//! Capability interface to the graphics backend.
//!
//! The residency manager never talks to a graphics API directly. Everything it
//! needs (sparse textures, feedback resources, heaps, tile mapping updates,
//! feedback clears and decodes) goes through [`ResidencyDevice`] and
//! [`CommandList`], which the rendering frontend implements for its backend.
//! Resources are referred to by opaque handles minted by the device.

use serde::{Deserialize, Serialize};

use crate::core::{Error, Result, UVec2};

/// Size of one tile of physical memory, identical for every tiled format.
pub const TILE_SIZE_IN_BYTES: u64 = 64 * 1024;

/// Opaque handle to a texture created by the device
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TextureHandle(pub u64);

/// Opaque handle to a buffer created by the device
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferHandle(pub u64);

/// Opaque handle to a physical memory heap
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HeapHandle(pub u64);

/// Opaque handle to a sampler feedback capture resource
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeedbackHandle(pub u64);

/// Texel formats understood by the residency layer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextureFormat {
    R8Unorm,
    R32Float,
    Rgba8Unorm,
    Rgba16Float,
    Rgba32Float,
    Bc1Unorm,
    Bc3Unorm,
    Bc4Unorm,
    Bc5Unorm,
    Bc7Unorm,
}

impl TextureFormat {
    /// Whether the format is stored as 4x4 compressed blocks
    pub fn is_block_compressed(self) -> bool {
        matches!(
            self,
            Self::Bc1Unorm | Self::Bc3Unorm | Self::Bc4Unorm | Self::Bc5Unorm | Self::Bc7Unorm
        )
    }

    /// Bytes per texel, or per 4x4 block for compressed formats
    pub fn bytes_per_element(self) -> u32 {
        match self {
            Self::R8Unorm => 1,
            Self::R32Float | Self::Rgba8Unorm => 4,
            Self::Rgba16Float | Self::Bc1Unorm | Self::Bc4Unorm => 8,
            Self::Rgba32Float | Self::Bc3Unorm | Self::Bc5Unorm | Self::Bc7Unorm => 16,
        }
    }

    /// Standard tile shape in texels for a 64KB tile
    pub fn standard_tile_shape(self) -> UVec2 {
        if self.is_block_compressed() {
            // 64KB worth of blocks, 4x4 texels each
            match self.bytes_per_element() {
                8 => UVec2::new(512, 256),
                _ => UVec2::new(256, 256),
            }
        } else {
            match self.bytes_per_element() {
                1 => UVec2::new(256, 256),
                2 => UVec2::new(256, 128),
                4 => UVec2::new(128, 128),
                8 => UVec2::new(128, 64),
                _ => UVec2::new(64, 64),
            }
        }
    }
}

/// Description of a texture to create
#[derive(Clone, Debug, PartialEq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub format: TextureFormat,
    pub label: Option<&'static str>,
}

impl TextureDesc {
    pub fn new(width: u32, height: u32, mip_levels: u32, format: TextureFormat) -> Self {
        Self {
            width,
            height,
            mip_levels,
            format,
            label: None,
        }
    }

    /// Number of mips in a full chain for the given size
    pub fn full_mip_count(width: u32, height: u32) -> u32 {
        32 - width.max(height).max(1).leading_zeros()
    }

    /// Reject empty textures and mip chains longer than the full chain
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidDesc(format!("texture extent {}x{}", self.width, self.height)));
        }
        let full = Self::full_mip_count(self.width, self.height);
        if self.mip_levels == 0 || self.mip_levels > full {
            return Err(Error::InvalidDesc(format!(
                "{} mip levels for a {}x{} texture (1..={})",
                self.mip_levels, self.width, self.height, full
            )));
        }
        Ok(())
    }

    /// Texel extent of a mip, rounded up to whole blocks for compressed formats
    pub fn mip_extent(&self, mip: u32) -> UVec2 {
        let mut width = self.width.checked_shr(mip).unwrap_or(0).max(1);
        let mut height = self.height.checked_shr(mip).unwrap_or(0).max(1);
        if self.format.is_block_compressed() {
            width = width.div_ceil(4) * 4;
            height = height.div_ceil(4) * 4;
        }
        UVec2::new(width, height)
    }
}

/// Tile grid of one standard (non-packed) mip
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubresourceTiling {
    pub width_in_tiles: u32,
    pub height_in_tiles: u32,
}

/// Packed mip tail of a tiled texture
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PackedMipDesc {
    pub num_standard_mips: u32,
    pub num_packed_mips: u32,
    pub num_tiles_for_packed_mips: u32,
    pub start_tile_index_in_overall_resource: u32,
}

/// Tiling layout reported by the device for a reserved texture
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TextureTiling {
    pub num_tiles: u32,
    pub packed_mip_desc: PackedMipDesc,
    pub tile_shape: UVec2,
    pub subresources: Vec<SubresourceTiling>,
}

impl TextureTiling {
    /// Standard-swizzle tiling: a mip is standard while it covers at least one
    /// whole tile in both dimensions, everything below is packed.
    pub fn standard(desc: &TextureDesc) -> Self {
        let tile_shape = desc.format.standard_tile_shape();
        let mut subresources = Vec::new();
        let mut num_tiles = 0;

        let mut mip = 0;
        while mip < desc.mip_levels {
            let extent = desc.mip_extent(mip);
            if extent.x < tile_shape.x || extent.y < tile_shape.y {
                break;
            }
            let tiling = SubresourceTiling {
                width_in_tiles: extent.x.div_ceil(tile_shape.x),
                height_in_tiles: extent.y.div_ceil(tile_shape.y),
            };
            num_tiles += tiling.width_in_tiles * tiling.height_in_tiles;
            subresources.push(tiling);
            mip += 1;
        }

        let num_standard_mips = mip;
        let num_packed_mips = desc.mip_levels - num_standard_mips;
        let packed_bytes: u64 = (num_standard_mips..desc.mip_levels)
            .map(|m| {
                let extent = desc.mip_extent(m);
                let elements = if desc.format.is_block_compressed() {
                    (extent.x / 4) as u64 * (extent.y / 4) as u64
                } else {
                    extent.x as u64 * extent.y as u64
                };
                elements * desc.format.bytes_per_element() as u64
            })
            .sum();
        let num_tiles_for_packed_mips = packed_bytes.div_ceil(TILE_SIZE_IN_BYTES) as u32;

        Self {
            num_tiles: num_tiles + num_tiles_for_packed_mips,
            packed_mip_desc: PackedMipDesc {
                num_standard_mips,
                num_packed_mips,
                num_tiles_for_packed_mips,
                start_tile_index_in_overall_resource: num_tiles,
            },
            tile_shape,
            subresources,
        }
    }
}

/// A freshly created sparse texture and its tiling
#[derive(Clone, Debug)]
pub struct ReservedTexture {
    pub handle: TextureHandle,
    pub tiling: TextureTiling,
}

/// What a buffer is used for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferUsage {
    /// CPU readable destination of feedback decodes
    Readback,
    /// Placed buffer aliasing a whole heap, used to copy tile contents
    HeapAlias(HeapHandle),
}

/// Description of a buffer to create
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: BufferUsage,
    pub label: Option<&'static str>,
}

/// Location of one tile inside a sparse texture.
///
/// Packed tiles use `mip = first packed mip`, `x = packed tile ordinal`, `y = 0`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TiledCoordinate {
    pub mip: u32,
    pub x: u32,
    pub y: u32,
}

/// Physical location a tile is bound to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TileBinding {
    pub heap: HeapHandle,
    pub byte_offset: u64,
}

/// One tile mapping update; `binding: None` unmaps the tile
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileMapping {
    pub coord: TiledCoordinate,
    pub binding: Option<TileBinding>,
}

/// Resource creation, readback and tile mapping capabilities of the backend
pub trait ResidencyDevice {
    /// Create a reserved (sparse) texture and report its tiling
    fn create_reserved_texture(&self, desc: &TextureDesc) -> Result<ReservedTexture>;

    /// Create a min-mip feedback capture resource paired with `reserved`
    fn create_feedback_texture(&self, reserved: TextureHandle, mip_region: UVec2) -> Result<FeedbackHandle>;

    /// Create a regular (fully resident) texture
    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureHandle>;

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle>;

    fn create_heap(&self, size_in_bytes: u64) -> Result<HeapHandle>;

    fn destroy_texture(&self, texture: TextureHandle);

    fn destroy_feedback_texture(&self, feedback: FeedbackHandle);

    fn destroy_buffer(&self, buffer: BufferHandle);

    fn destroy_heap(&self, heap: HeapHandle);

    /// Map a CPU readable buffer, copy its contents into `out` and unmap it
    fn read_buffer(&self, buffer: BufferHandle, out: &mut Vec<u8>) -> Result<()>;

    /// Bind or unbind tiles of a reserved texture on the GPU timeline
    fn update_tile_mappings(&self, texture: TextureHandle, mappings: &[TileMapping]);
}

/// Commands recorded into the frame's command stream
pub trait CommandList {
    /// Reset a feedback resource to "nothing sampled"
    fn clear_feedback(&mut self, feedback: FeedbackHandle);

    /// Decode a feedback resource into one min-mip byte per region
    fn decode_feedback(&mut self, dst: BufferHandle, feedback: FeedbackHandle);

    fn copy_buffer(&mut self, dst: BufferHandle, dst_offset: u64, src: BufferHandle, src_offset: u64, size: u64);

    /// Upload the whole of mip 0 of `texture`
    fn write_texture(&mut self, texture: TextureHandle, data: &[u8], row_pitch: u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_tile_shapes() {
        assert_eq!(TextureFormat::Rgba8Unorm.standard_tile_shape(), UVec2::new(128, 128));
        assert_eq!(TextureFormat::Rgba32Float.standard_tile_shape(), UVec2::new(64, 64));
        assert_eq!(TextureFormat::Bc1Unorm.standard_tile_shape(), UVec2::new(512, 256));
        assert_eq!(TextureFormat::Bc7Unorm.standard_tile_shape(), UVec2::new(256, 256));
    }

    #[test]
    fn test_full_mip_count() {
        assert_eq!(TextureDesc::full_mip_count(1024, 1024), 11);
        assert_eq!(TextureDesc::full_mip_count(1024, 256), 11);
        assert_eq!(TextureDesc::full_mip_count(1, 1), 1);
    }

    #[test]
    fn test_standard_tiling_rgba8() {
        let desc = TextureDesc::new(1024, 1024, 11, TextureFormat::Rgba8Unorm);
        let tiling = TextureTiling::standard(&desc);

        // 1024, 512, 256, 128 are standard; 64 and below are packed
        assert_eq!(tiling.packed_mip_desc.num_standard_mips, 4);
        assert_eq!(tiling.packed_mip_desc.num_packed_mips, 7);
        assert_eq!(tiling.subresources[0], SubresourceTiling { width_in_tiles: 8, height_in_tiles: 8 });
        assert_eq!(tiling.subresources[3], SubresourceTiling { width_in_tiles: 1, height_in_tiles: 1 });
        assert_eq!(tiling.packed_mip_desc.start_tile_index_in_overall_resource, 64 + 16 + 4 + 1);
        assert_eq!(tiling.packed_mip_desc.num_tiles_for_packed_mips, 1);
        assert_eq!(tiling.num_tiles, 86);
    }

    #[test]
    fn test_validate_mip_chain() {
        assert!(TextureDesc::new(1024, 1024, 11, TextureFormat::Rgba8Unorm).validate().is_ok());
        assert!(TextureDesc::new(1024, 256, 1, TextureFormat::Rgba8Unorm).validate().is_ok());
        assert!(matches!(
            TextureDesc::new(1024, 1024, 12, TextureFormat::Rgba8Unorm).validate(),
            Err(Error::InvalidDesc(_))
        ));
        assert!(TextureDesc::new(1024, 1024, 40, TextureFormat::Rgba8Unorm).validate().is_err());
        assert!(TextureDesc::new(1024, 1024, 0, TextureFormat::Rgba8Unorm).validate().is_err());
        assert!(TextureDesc::new(0, 64, 1, TextureFormat::Rgba8Unorm).validate().is_err());
    }

    #[test]
    fn test_mip_extent_past_the_chain_is_one_texel() {
        let desc = TextureDesc::new(1024, 1024, 11, TextureFormat::Rgba8Unorm);
        assert_eq!(desc.mip_extent(10), UVec2::new(1, 1));
        assert_eq!(desc.mip_extent(40), UVec2::new(1, 1));
    }

    #[test]
    fn test_block_compressed_extent_rounds_up() {
        let desc = TextureDesc::new(100, 30, 3, TextureFormat::Bc7Unorm);
        assert_eq!(desc.mip_extent(0), UVec2::new(100, 32));
        assert_eq!(desc.mip_extent(2), UVec2::new(28, 8));
    }
}
