//! Feedback Texture - a sparse texture with its sampler feedback resources
//!
//! Owns the reserved texture, the feedback capture resource, one readback
//! buffer per frame in flight and the min-mip texture that shaders use to
//! clamp sampling. Handles are shared: cloning a [`FeedbackTexture`] adds a
//! reference, and dropping the last one unregisters the texture from its
//! manager, leaves every texture set and destroys the device resources.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::core::{Result, UVec2};
use super::device::{
    BufferDesc, BufferHandle, BufferUsage, FeedbackHandle, PackedMipDesc, ResidencyDevice, TextureDesc,
    TextureFormat, TextureHandle, TextureTiling,
};
use super::feedback_manager::{ManagerShared, TextureEntry};
use super::texture_set::SetInner;
use super::tile::TiledTextureId;
use super::tiled_texture::TiledTextureDesc;

/// Texel rectangle covered by a tile, for filling in its content
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeedbackTextureTileInfo {
    pub mip: u32,
    /// Texel offset within the mip
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub is_packed: bool,
}

/// Device resources owned by one feedback texture
#[derive(Clone, Debug)]
pub(crate) struct TextureResources {
    pub reserved: TextureHandle,
    pub feedback: FeedbackHandle,
    pub min_mip: TextureHandle,
    /// Decoded feedback destination, one per frame slot
    pub readback: Vec<BufferHandle>,
}

impl TextureResources {
    /// Create everything but the reserved texture. On failure nothing created here survives.
    fn create(
        device: &dyn ResidencyDevice,
        reserved: TextureHandle,
        tile_shape: UVec2,
        region_grid: UVec2,
        num_frames_in_flight: u32,
    ) -> Result<Self> {
        let feedback = device.create_feedback_texture(reserved, tile_shape)?;

        let mut min_mip_desc = TextureDesc::new(region_grid.x, region_grid.y, 1, TextureFormat::R32Float);
        min_mip_desc.label = Some("min_mip");
        let min_mip = device
            .create_texture(&min_mip_desc)
            .inspect_err(|_| device.destroy_feedback_texture(feedback))?;

        let mut resources = Self {
            reserved,
            feedback,
            min_mip,
            readback: Vec::with_capacity(num_frames_in_flight as usize),
        };
        for _ in 0..num_frames_in_flight {
            let desc = BufferDesc {
                size: (region_grid.x * region_grid.y) as u64,
                usage: BufferUsage::Readback,
                label: Some("feedback_readback"),
            };
            match device.create_buffer(&desc) {
                Ok(buffer) => resources.readback.push(buffer),
                Err(e) => {
                    resources.destroy_companions(device);
                    return Err(e);
                }
            }
        }
        Ok(resources)
    }

    fn destroy_companions(&self, device: &dyn ResidencyDevice) {
        for &buffer in &self.readback {
            device.destroy_buffer(buffer);
        }
        device.destroy_texture(self.min_mip);
        device.destroy_feedback_texture(self.feedback);
    }

    fn destroy(&self, device: &dyn ResidencyDevice) {
        self.destroy_companions(device);
        device.destroy_texture(self.reserved);
    }
}

pub(crate) struct TextureInner {
    manager: Weak<RefCell<ManagerShared>>,
    device: Rc<dyn ResidencyDevice>,
    id: TiledTextureId,
    desc: TextureDesc,
    tiling: TextureTiling,
    region_grid: UVec2,
    resources: TextureResources,
    /// Tile index -> texel rectangles; packed tiles list every packed mip
    tile_infos: Vec<Vec<FeedbackTextureTileInfo>>,
    sets: RefCell<Vec<Weak<SetInner>>>,
}

impl TextureInner {
    pub(crate) fn attach_set(&self, set: Weak<SetInner>) {
        {
            let mut sets = self.sets.borrow_mut();
            if !sets.iter().any(|s| s.ptr_eq(&set)) {
                sets.push(set);
            }
        }
        self.update_texture_sets();
    }

    pub(crate) fn detach_set(&self, set: *const SetInner) {
        self.sets.borrow_mut().retain(|s| s.as_ptr() != set);
        self.update_texture_sets();
    }

    fn live_sets(&self) -> Vec<Rc<SetInner>> {
        self.sets.borrow().iter().filter_map(Weak::upgrade).collect()
    }

    /// Whether this texture captures its own feedback: it belongs to no set,
    /// or it is the primary of at least one.
    pub(crate) fn needs_readback(&self) -> bool {
        let this: *const TextureInner = self;
        let sets = self.live_sets();
        sets.is_empty() || sets.iter().any(|s| s.is_primary(this))
    }

    /// Push the current readback eligibility to the manager
    pub(crate) fn update_texture_sets(&self) {
        let needs = self.needs_readback();
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        match manager.try_borrow_mut() {
            Ok(mut shared) => shared.set_needs_readback(self.id, needs),
            Err(_) => log::error!("Texture {} changed sets while the manager was busy", self.id),
        };
    }

    /// Ids of the textures following this one in the sets it is primary of
    pub(crate) fn followers(&self) -> Vec<TiledTextureId> {
        let this: *const TextureInner = self;
        let mut out: Vec<TiledTextureId> = self
            .live_sets()
            .iter()
            .filter(|s| s.is_primary(this))
            .flat_map(|s| s.member_ids())
            .filter(|&id| id != self.id)
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }
}

impl Drop for TextureInner {
    fn drop(&mut self) {
        let this: *const TextureInner = self;
        let sets = std::mem::take(self.sets.get_mut());
        for set in sets.iter().filter_map(Weak::upgrade) {
            set.forget_member(this);
            set.update_members();
        }

        if let Some(manager) = self.manager.upgrade() {
            match manager.try_borrow_mut() {
                Ok(mut shared) => shared.unregister(self.id),
                Err(_) => log::error!("Texture {} dropped while the manager was busy; tiles leak", self.id),
            }
        }

        self.resources.destroy(&*self.device);
        log::debug!("Destroyed feedback texture {}", self.id);
    }
}

/// Shared handle to a feedback texture
#[derive(Clone)]
pub struct FeedbackTexture {
    inner: Rc<TextureInner>,
}

impl FeedbackTexture {
    /// Create the device resources and register with the manager behind `shared`
    pub(crate) fn create(
        shared: &Rc<RefCell<ManagerShared>>,
        device: Rc<dyn ResidencyDevice>,
        desc: &TextureDesc,
        num_frames_in_flight: u32,
    ) -> Result<Self> {
        desc.validate()?;
        let reserved = device.create_reserved_texture(desc)?;
        let tiling = reserved.tiling;
        let tile_shape = tiling.tile_shape;
        let region_grid = UVec2::new(
            desc.width.div_ceil(tile_shape.x.max(1)),
            desc.height.div_ceil(tile_shape.y.max(1)),
        );

        let resources =
            TextureResources::create(&*device, reserved.handle, tile_shape, region_grid, num_frames_in_flight)
                .inspect_err(|_| device.destroy_texture(reserved.handle))?;

        let registered = shared
            .borrow_mut()
            .tiled
            .register_texture(TiledTextureDesc::from_tiling(desc.width, desc.height, &tiling));
        let id = match registered {
            Ok(id) => id,
            Err(e) => {
                resources.destroy(&*device);
                return Err(e);
            }
        };

        let tile_infos = compute_tile_infos(desc, &tiling);
        let inner = Rc::new(TextureInner {
            manager: Rc::downgrade(shared),
            device,
            id,
            desc: desc.clone(),
            tiling,
            region_grid,
            resources: resources.clone(),
            tile_infos,
            sets: RefCell::new(Vec::new()),
        });

        shared.borrow_mut().insert(
            id,
            TextureEntry {
                texture: Rc::downgrade(&inner),
                resources,
            },
        );

        log::info!(
            "Created feedback texture {} ({}x{}, {} mips, {} tiles)",
            id,
            inner.desc.width,
            inner.desc.height,
            inner.desc.mip_levels,
            inner.tiling.num_tiles
        );
        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Rc<TextureInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Rc<TextureInner> {
        &self.inner
    }

    /// Whether both handles refer to the same texture
    pub fn ptr_eq(&self, other: &FeedbackTexture) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn tiled_texture_id(&self) -> TiledTextureId {
        self.inner.id
    }

    pub fn desc(&self) -> &TextureDesc {
        &self.inner.desc
    }

    pub fn reserved_texture(&self) -> TextureHandle {
        self.inner.resources.reserved
    }

    pub fn feedback_texture(&self) -> FeedbackHandle {
        self.inner.resources.feedback
    }

    /// R32 float texture, one texel per region holding the finest resident mip
    pub fn min_mip_texture(&self) -> TextureHandle {
        self.inner.resources.min_mip
    }

    pub fn readback_buffer(&self, frame_slot: usize) -> Option<BufferHandle> {
        self.inner.resources.readback.get(frame_slot).copied()
    }

    /// Tile extent in texels
    pub fn tile_shape(&self) -> UVec2 {
        self.inner.tiling.tile_shape
    }

    pub fn packed_mip_desc(&self) -> PackedMipDesc {
        self.inner.tiling.packed_mip_desc
    }

    pub fn num_tiles(&self) -> u32 {
        self.inner.tiling.num_tiles
    }

    /// Feedback / min-mip region grid
    pub fn region_grid(&self) -> UVec2 {
        self.inner.region_grid
    }

    /// Texel rectangles of a tile. Packed tiles report every packed mip.
    pub fn tile_info(&self, tile_index: u32) -> &[FeedbackTextureTileInfo] {
        self.inner.tile_infos.get(tile_index as usize).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_tile_packed(&self, tile_index: u32) -> bool {
        let packed = self.inner.tiling.packed_mip_desc;
        packed.num_tiles_for_packed_mips > 0 && tile_index >= packed.start_tile_index_in_overall_resource
    }

    /// Number of texture sets this texture belongs to
    pub fn num_texture_sets(&self) -> usize {
        self.inner.live_sets().len()
    }

    /// Whether this texture decodes its own feedback (see texture sets)
    pub fn is_read_back(&self) -> bool {
        self.inner.needs_readback()
    }
}

impl std::fmt::Debug for FeedbackTexture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedbackTexture")
            .field("id", &self.inner.id)
            .field("width", &self.inner.desc.width)
            .field("height", &self.inner.desc.height)
            .finish()
    }
}

/// Texel rectangle of every tile, clipped to its mip
fn compute_tile_infos(desc: &TextureDesc, tiling: &TextureTiling) -> Vec<Vec<FeedbackTextureTileInfo>> {
    let shape = tiling.tile_shape;
    let mut infos = Vec::with_capacity(tiling.num_tiles as usize);

    for (mip, level) in tiling.subresources.iter().enumerate() {
        let extent = desc.mip_extent(mip as u32);
        for ty in 0..level.height_in_tiles {
            for tx in 0..level.width_in_tiles {
                let x = tx * shape.x;
                let y = ty * shape.y;
                infos.push(vec![FeedbackTextureTileInfo {
                    mip: mip as u32,
                    x,
                    y,
                    width: shape.x.min(extent.x.saturating_sub(x)),
                    height: shape.y.min(extent.y.saturating_sub(y)),
                    is_packed: false,
                }]);
            }
        }
    }

    let packed = tiling.packed_mip_desc;
    let first_packed = packed.num_standard_mips;
    let packed_mips: Vec<FeedbackTextureTileInfo> = (first_packed..first_packed + packed.num_packed_mips)
        .map(|mip| {
            let extent = desc.mip_extent(mip);
            FeedbackTextureTileInfo { mip, x: 0, y: 0, width: extent.x, height: extent.y, is_packed: true }
        })
        .collect();
    for _ in 0..packed.num_tiles_for_packed_mips {
        infos.push(packed_mips.clone());
    }
    infos
}
