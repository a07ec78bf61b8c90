//! Sampler feedback driven tile residency for sparse textures

pub mod device;
pub mod tile;
pub mod tiled_texture;
pub mod tiled_texture_manager;
pub mod heap_allocator;
pub mod headless;
pub mod config;
pub mod feedback_texture;
pub mod texture_set;
pub mod feedback_manager;

pub use device::{
    BufferDesc, BufferHandle, BufferUsage, CommandList, FeedbackHandle, HeapHandle,
    PackedMipDesc, ReservedTexture, ResidencyDevice, SubresourceTiling,
    TextureDesc, TextureFormat, TextureHandle, TextureTiling,
    TileBinding, TileMapping, TiledCoordinate, TILE_SIZE_IN_BYTES,
};
pub use tile::{
    HeapId, TileAllocation, TileMove, TileRecord, TileState, TiledTextureId,
    MIN_MIP_NOT_SAMPLED,
};
pub use tiled_texture::{TiledTexture, TiledTextureDesc};
pub use tiled_texture_manager::{TileStatistics, TiledTextureManager};
pub use heap_allocator::{HeapAllocator, HeapResources};
pub use headless::{HeadlessCommand, HeadlessCommandList, HeadlessDevice};
pub use config::{FeedbackManagerDesc, FeedbackUpdateConfig, ResidencyConfig};
pub use feedback_texture::{FeedbackTexture, FeedbackTextureTileInfo};
pub use texture_set::FeedbackTextureSet;
pub use feedback_manager::{
    FeedbackManager, FeedbackManagerStats, FeedbackTextureCollection,
    FeedbackTextureUpdate, TextureStatistics,
};
