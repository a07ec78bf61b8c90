//! Feedback Manager - per-frame residency orchestration
//!
//! The renderer drives four phases per frame, in order:
//! 1. [`FeedbackManager::begin_frame`] reads back feedback captured
//!    `num_frames_in_flight` frames ago, updates tile states, unmaps evicted
//!    tiles, sizes the heap pool and returns the tiles that need content.
//! 2. [`FeedbackManager::update_tile_mappings`] binds the tiles whose content
//!    is ready and refreshes the min-mip textures.
//! 3. [`FeedbackManager::resolve_feedback`] decodes this frame's captures.
//! 4. [`FeedbackManager::end_frame`] rotates the capture ring and snapshots stats.
//!
//! None of the phases fail; device errors are logged and the work is retried
//! on a later frame.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::{Rc, Weak};

use glam::UVec2;
use serde::Serialize;

use crate::core::time::{Clock, PhaseTimer, SystemClock};
use crate::core::Result;
use super::config::{FeedbackManagerDesc, FeedbackUpdateConfig};
use super::device::{
    CommandList, ResidencyDevice, TILE_SIZE_IN_BYTES, TextureDesc, TextureHandle, TileBinding, TileMapping,
};
use super::feedback_texture::{FeedbackTexture, FeedbackTextureTileInfo, TextureInner, TextureResources};
use super::heap_allocator::HeapAllocator;
use super::texture_set::FeedbackTextureSet;
use super::tile::{HeapId, TileMove, TiledTextureId};
use super::tiled_texture_manager::{TileStatistics, TiledTextureManager};

/// Tiles of one texture that got a heap slot and need their content
#[derive(Clone, Debug)]
pub struct FeedbackTextureUpdate {
    pub texture: FeedbackTexture,
    /// Texel rectangles to fill; the packed mips are listed once
    pub tiles: Vec<FeedbackTextureTileInfo>,
    pub tile_indices: Vec<u32>,
}

/// Tiles returned by `begin_frame`, and handed back to `update_tile_mappings`
/// once their content is in place
#[derive(Clone, Debug, Default)]
pub struct FeedbackTextureCollection {
    pub textures: Vec<FeedbackTextureUpdate>,
}

impl FeedbackTextureCollection {
    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }

    /// Total tile indices across all textures
    pub fn num_tiles(&self) -> usize {
        self.textures.iter().map(|t| t.tile_indices.len()).sum()
    }
}

/// Snapshot taken at the end of every frame
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct FeedbackManagerStats {
    pub frame_index: u64,
    pub heap_allocation_bytes: u64,
    pub heap_count: u32,
    pub free_tiles_in_heaps: u32,
    pub tiles_total: u32,
    pub tiles_requested: u32,
    pub tiles_allocated: u32,
    pub tiles_standby: u32,
    pub tiles_bound: u32,
    /// CPU seconds per phase
    pub cputime_begin_frame: f64,
    pub cputime_update_tile_mappings: f64,
    pub cputime_resolve: f64,
    /// CPU seconds spent inside the device's tile mapping calls
    pub cputime_device_tile_mappings: f64,
    pub num_update_tile_mappings_calls: u32,
}

/// Per-texture tile counts, for inspection tools
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TextureStatistics {
    pub id: TiledTextureId,
    pub width: u32,
    pub height: u32,
    pub tiles: TileStatistics,
}

pub(crate) struct TextureEntry {
    pub texture: Weak<TextureInner>,
    pub resources: TextureResources,
}

/// State reachable from texture and set handles
pub(crate) struct ManagerShared {
    pub tiled: TiledTextureManager,
    textures: BTreeMap<TiledTextureId, TextureEntry>,
    /// Textures that capture their own feedback, in capture order
    ring: VecDeque<TiledTextureId>,
    /// Textures captured in each frame slot, read back when the slot comes around
    to_readback: Vec<Vec<TiledTextureId>>,
    min_mip_dirty: BTreeSet<TiledTextureId>,
}

impl ManagerShared {
    fn new(desc: &FeedbackManagerDesc) -> Self {
        Self {
            tiled: TiledTextureManager::new(desc.heap_size_in_tiles),
            textures: BTreeMap::new(),
            ring: VecDeque::new(),
            to_readback: vec![Vec::new(); desc.num_frames_in_flight.max(1) as usize],
            min_mip_dirty: BTreeSet::new(),
        }
    }

    pub(crate) fn insert(&mut self, id: TiledTextureId, entry: TextureEntry) {
        self.textures.insert(id, entry);
        self.ring.push_back(id);
        self.min_mip_dirty.insert(id);
    }

    pub(crate) fn set_needs_readback(&mut self, id: TiledTextureId, needs: bool) {
        if !self.textures.contains_key(&id) {
            return;
        }
        let in_ring = self.ring.contains(&id);
        if needs && !in_ring {
            self.ring.push_back(id);
        } else if !needs && in_ring {
            self.ring.retain(|&t| t != id);
            for slot in &mut self.to_readback {
                slot.retain(|&t| t != id);
            }
        }
    }

    pub(crate) fn unregister(&mut self, id: TiledTextureId) {
        self.textures.remove(&id);
        self.ring.retain(|&t| t != id);
        for slot in &mut self.to_readback {
            slot.retain(|&t| t != id);
        }
        self.min_mip_dirty.remove(&id);
        self.tiled.unregister_texture(id);
    }
}

#[derive(Debug, Default)]
struct FrameTimers {
    begin_frame: PhaseTimer,
    update_tile_mappings: PhaseTimer,
    resolve: PhaseTimer,
}

/// Sampler feedback driven residency for a set of sparse textures
pub struct FeedbackManager {
    device: Rc<dyn ResidencyDevice>,
    desc: FeedbackManagerDesc,
    shared: Rc<RefCell<ManagerShared>>,
    heaps: HeapAllocator,
    clock: Rc<dyn Clock>,

    config: FeedbackUpdateConfig,
    frame_slot: usize,
    /// Defragmented tiles to rebind in `update_tile_mappings`
    pending_moves: Vec<TileMove>,

    timers: FrameTimers,
    device_mapping_seconds: f64,
    num_mapping_calls: u32,
    stats: FeedbackManagerStats,

    readback_scratch: Vec<u8>,
    min_mip_scratch: Vec<u8>,
    upload_scratch: Vec<u8>,
}

impl FeedbackManager {
    pub fn new(device: Rc<dyn ResidencyDevice>, desc: FeedbackManagerDesc) -> Self {
        Self::with_clock(device, desc, Rc::new(SystemClock::new()))
    }

    /// Create a manager stamping tiles with time from `clock`
    pub fn with_clock(device: Rc<dyn ResidencyDevice>, desc: FeedbackManagerDesc, clock: Rc<dyn Clock>) -> Self {
        let desc = FeedbackManagerDesc {
            num_frames_in_flight: desc.num_frames_in_flight.max(1),
            heap_size_in_tiles: desc.heap_size_in_tiles.max(1),
        };
        log::info!(
            "Feedback manager: {} frames in flight, {} tiles per heap",
            desc.num_frames_in_flight,
            desc.heap_size_in_tiles
        );
        Self {
            heaps: HeapAllocator::new(device.clone(), desc.heap_size_in_tiles, desc.num_frames_in_flight),
            shared: Rc::new(RefCell::new(ManagerShared::new(&desc))),
            device,
            desc,
            clock,
            config: FeedbackUpdateConfig::default(),
            frame_slot: 0,
            pending_moves: Vec::new(),
            timers: FrameTimers::default(),
            device_mapping_seconds: 0.0,
            num_mapping_calls: 0,
            stats: FeedbackManagerStats::default(),
            readback_scratch: Vec::new(),
            min_mip_scratch: Vec::new(),
            upload_scratch: Vec::new(),
        }
    }

    pub fn desc(&self) -> &FeedbackManagerDesc {
        &self.desc
    }

    /// Create a sparse texture tracked by this manager
    pub fn create_texture(&mut self, desc: &TextureDesc) -> Result<FeedbackTexture> {
        FeedbackTexture::create(&self.shared, self.device.clone(), desc, self.desc.num_frames_in_flight)
    }

    pub fn create_texture_set(&self) -> FeedbackTextureSet {
        FeedbackTextureSet::new()
    }

    pub fn num_textures(&self) -> usize {
        self.shared.borrow().textures.len()
    }

    /// Textures that capture their own feedback
    pub fn num_ring_textures(&self) -> usize {
        self.shared.borrow().ring.len()
    }

    /// Statistics of the last completed frame
    pub fn stats(&self) -> FeedbackManagerStats {
        self.stats
    }

    /// Policy of the current frame
    pub fn update_config(&self) -> &FeedbackUpdateConfig {
        &self.config
    }

    pub fn tile_statistics(&self) -> TileStatistics {
        self.shared.borrow().tiled.statistics()
    }

    pub fn texture_statistics(&self) -> Vec<TextureStatistics> {
        let shared = self.shared.borrow();
        shared
            .textures
            .keys()
            .filter_map(|&id| {
                let layout = shared.tiled.texture_layout(id)?;
                Some(TextureStatistics {
                    id,
                    width: layout.desc().width,
                    height: layout.desc().height,
                    tiles: shared.tiled.texture_statistics(id)?,
                })
            })
            .collect()
    }

    pub fn heap_allocator(&self) -> &HeapAllocator {
        &self.heaps
    }

    /// Handles of all live textures
    fn live_textures(&self) -> Vec<FeedbackTexture> {
        self.shared
            .borrow()
            .textures
            .values()
            .filter_map(|e| e.texture.upgrade())
            .map(FeedbackTexture::from_inner)
            .collect()
    }

    fn submit_mappings(&mut self, texture: TextureHandle, mappings: &[TileMapping]) {
        let mut timer = PhaseTimer::new();
        timer.begin();
        self.device.update_tile_mappings(texture, mappings);
        timer.end();
        self.device_mapping_seconds += timer.seconds();
        self.num_mapping_calls += 1;
    }

    /// Phase 1: process old feedback, arm new captures, size the heap pool and
    /// return the tiles that need content
    pub fn begin_frame(
        &mut self,
        cmd: &mut dyn CommandList,
        config: &FeedbackUpdateConfig,
    ) -> FeedbackTextureCollection {
        self.timers.begin_frame.begin();
        self.device_mapping_seconds = 0.0;
        self.num_mapping_calls = 0;
        self.config = *config;
        self.frame_slot = (config.frame_index % self.desc.num_frames_in_flight as u64) as usize;
        let slot = self.frame_slot;
        let now = self.clock.now_seconds();
        let timeout = config.tile_timeout_seconds;

        self.heaps.collect(config.frame_index);

        // declared before the borrow so that no texture can drop while it is held
        let textures = self.live_textures();
        let shared_rc = Rc::clone(&self.shared);
        let mut shared = shared_rc.borrow_mut();

        // feedback captured num_frames_in_flight frames ago
        let readback = std::mem::take(&mut shared.to_readback[slot]);
        for id in readback {
            let Some(texture) = textures.iter().find(|t| t.tiled_texture_id() == id) else {
                continue;
            };
            let Some(buffer) = texture.readback_buffer(slot) else {
                continue;
            };
            if let Err(e) = self.device.read_buffer(buffer, &mut self.readback_scratch) {
                log::warn!("Feedback readback of texture {} failed: {}", id, e);
                continue;
            }
            if let Err(e) = shared.tiled.update_with_feedback(id, &self.readback_scratch, now, timeout) {
                log::warn!("Feedback update of texture {} failed: {}", id, e);
                continue;
            }
            for follower in texture.inner().followers() {
                if let Err(e) = shared.tiled.match_primary_texture(id, follower, now, timeout) {
                    log::warn!("Texture {} could not follow {}: {}", follower, id, e);
                }
            }
        }

        // arm this frame's captures
        let limit = match config.max_textures_to_update {
            0 => shared.ring.len(),
            max => (max as usize).min(shared.ring.len()),
        };
        let selected: Vec<TiledTextureId> = shared.ring.iter().take(limit).copied().collect();
        for id in &selected {
            if let Some(entry) = shared.textures.get(id) {
                cmd.clear_feedback(entry.resources.feedback);
            }
        }
        shared.to_readback[slot] = selected;

        if config.trim_standby_tiles {
            shared.tiled.trim_standby_tiles(config.num_extra_standby_tiles);
        }

        // unmaps go out before any map of this frame
        let ids: Vec<TiledTextureId> = shared.textures.keys().copied().collect();
        for id in ids {
            let unmap = shared.tiled.tiles_to_unmap(id);
            if unmap.is_empty() {
                continue;
            }
            let (Some(coords), Some(entry)) = (shared.tiled.tile_coordinates(id), shared.textures.get(&id)) else {
                continue;
            };
            let reserved = entry.resources.reserved;
            let mappings: Vec<TileMapping> = unmap
                .iter()
                .map(|&index| TileMapping { coord: coords[index as usize], binding: None })
                .collect();
            self.submit_mappings(reserved, &mappings);
            shared.min_mip_dirty.insert(id);
            log::trace!("Unmapped {} tiles of texture {}", mappings.len(), id);
        }

        // heap pool
        shared.tiled.allocate_requested_tiles();
        let desired = shared.tiled.num_desired_heaps();
        let mut added = 0;
        while shared.tiled.num_heaps() < desired {
            match self.heaps.allocate() {
                Ok(heap_id) => {
                    shared.tiled.add_heap(heap_id);
                    added += 1;
                }
                Err(e) => {
                    log::warn!("Heap allocation failed, retrying next frame: {}", e);
                    break;
                }
            }
        }
        if added > 0 {
            shared.tiled.allocate_requested_tiles();
        }

        if config.release_empty_heaps {
            for heap_id in shared.tiled.empty_heaps() {
                if shared.tiled.remove_heap(heap_id) {
                    self.heaps.release(heap_id, config.frame_index);
                }
            }
        }

        let mut results = FeedbackTextureCollection::default();
        for texture in &textures {
            let tiles = shared.tiled.tiles_to_map(texture.tiled_texture_id());
            if !tiles.is_empty() {
                results.textures.push(build_update(texture, tiles));
            }
        }

        self.pending_moves.clear();
        if config.defragment_heaps {
            let moves = shared.tiled.defragment_tiles(config.defrag_tiles_per_frame);
            for m in &moves {
                let (Some(src), Some(dst)) = (self.heaps.heap(m.from.heap_id), self.heaps.heap(m.to.heap_id)) else {
                    continue;
                };
                cmd.copy_buffer(
                    dst.buffer,
                    m.to.heap_tile_index as u64 * TILE_SIZE_IN_BYTES,
                    src.buffer,
                    m.from.heap_tile_index as u64 * TILE_SIZE_IN_BYTES,
                    TILE_SIZE_IN_BYTES,
                );
            }
            self.pending_moves = moves;
        }

        drop(shared);
        self.timers.begin_frame.end();
        log::debug!(
            "Frame {}: {} tiles to fill in {} textures, {} heaps",
            config.frame_index,
            results.num_tiles(),
            results.textures.len(),
            self.heaps.heap_count()
        );
        results
    }

    /// Phase 2: bind tiles whose content is ready and refresh min-mip textures
    pub fn update_tile_mappings(&mut self, cmd: &mut dyn CommandList, tiles_ready: &FeedbackTextureCollection) {
        self.timers.update_tile_mappings.begin();

        let shared_rc = Rc::clone(&self.shared);
        let mut shared = shared_rc.borrow_mut();

        let mut ready: BTreeMap<TiledTextureId, Vec<u32>> = BTreeMap::new();
        for update in &tiles_ready.textures {
            ready
                .entry(update.texture.tiled_texture_id())
                .or_default()
                .extend_from_slice(&update.tile_indices);
        }
        for m in self.pending_moves.drain(..) {
            ready.entry(m.texture_id).or_default().push(m.tile_index);
        }

        for (id, mut indices) in ready {
            let Some(reserved) = shared.textures.get(&id).map(|e| e.resources.reserved) else {
                continue;
            };
            indices.sort_unstable();
            indices.dedup();
            if let Err(e) = shared.tiled.update_tiles_mapping(id, &indices) {
                log::warn!("Tile mapping update of texture {} failed: {}", id, e);
                continue;
            }

            let mut by_heap: BTreeMap<HeapId, Vec<TileMapping>> = BTreeMap::new();
            if let (Some(coords), Some(allocations)) =
                (shared.tiled.tile_coordinates(id), shared.tiled.tile_allocations(id))
            {
                for &index in &indices {
                    // the tile may have lost its slot since it was handed out
                    let Some(Some(allocation)) = allocations.get(index as usize) else {
                        continue;
                    };
                    let Some(heap) = self.heaps.heap(allocation.heap_id) else {
                        continue;
                    };
                    by_heap.entry(allocation.heap_id).or_default().push(TileMapping {
                        coord: coords[index as usize],
                        binding: Some(TileBinding {
                            heap: heap.heap,
                            byte_offset: allocation.heap_tile_index as u64 * TILE_SIZE_IN_BYTES,
                        }),
                    });
                }
            }
            for mappings in by_heap.values() {
                self.submit_mappings(reserved, mappings);
            }
            shared.min_mip_dirty.insert(id);
        }

        let dirty = std::mem::take(&mut shared.min_mip_dirty);
        for id in dirty {
            let Some(min_mip) = shared.textures.get(&id).map(|e| e.resources.min_mip) else {
                continue;
            };
            let Some(grid) = shared.tiled.texture_layout(id).map(|l| l.region_grid()) else {
                continue;
            };
            if let Err(e) = shared.tiled.write_min_mip_data(id, &mut self.min_mip_scratch) {
                log::warn!("Min-mip data of texture {} unavailable: {}", id, e);
                continue;
            }
            let row_pitch = encode_min_mip_rows(&self.min_mip_scratch, grid, &mut self.upload_scratch);
            cmd.write_texture(min_mip, &self.upload_scratch, row_pitch);
        }

        drop(shared);
        self.timers.update_tile_mappings.end();
    }

    /// Phase 3: decode this frame's feedback captures into the readback buffers
    pub fn resolve_feedback(&mut self, cmd: &mut dyn CommandList) {
        self.timers.resolve.begin();
        {
            let shared = self.shared.borrow();
            for id in &shared.to_readback[self.frame_slot] {
                let Some(entry) = shared.textures.get(id) else {
                    continue;
                };
                if let Some(&buffer) = entry.resources.readback.get(self.frame_slot) {
                    cmd.decode_feedback(buffer, entry.resources.feedback);
                }
            }
        }
        self.timers.resolve.end();
    }

    /// Phase 4: rotate the capture ring and snapshot statistics
    pub fn end_frame(&mut self) {
        let tiles = {
            let mut shared = self.shared.borrow_mut();
            let max = self.config.max_textures_to_update as usize;
            let len = shared.ring.len();
            if max > 0 && len > 0 {
                shared.ring.rotate_left(max % len);
            }
            shared.tiled.statistics()
        };

        self.stats = FeedbackManagerStats {
            frame_index: self.config.frame_index,
            heap_allocation_bytes: self.heaps.total_allocated_bytes(),
            heap_count: self.heaps.heap_count(),
            free_tiles_in_heaps: tiles.free_tiles_in_heaps,
            tiles_total: tiles.tiles_total,
            tiles_requested: tiles.tiles_requested,
            tiles_allocated: tiles.tiles_allocated,
            tiles_standby: tiles.tiles_standby,
            tiles_bound: tiles.tiles_bound,
            cputime_begin_frame: self.timers.begin_frame.seconds(),
            cputime_update_tile_mappings: self.timers.update_tile_mappings.seconds(),
            cputime_resolve: self.timers.resolve.seconds(),
            cputime_device_tile_mappings: self.device_mapping_seconds,
            num_update_tile_mappings_calls: self.num_mapping_calls,
        };
    }
}

/// Describe newly allocated tiles for the content producer
fn build_update(texture: &FeedbackTexture, tile_indices: Vec<u32>) -> FeedbackTextureUpdate {
    let mut tiles = Vec::with_capacity(tile_indices.len());
    let mut packed_listed = false;
    for &index in &tile_indices {
        if texture.is_tile_packed(index) {
            if packed_listed {
                continue;
            }
            packed_listed = true;
        }
        tiles.extend_from_slice(texture.tile_info(index));
    }
    FeedbackTextureUpdate {
        texture: texture.clone(),
        tiles,
        tile_indices,
    }
}

/// Lay out min-mip bytes as R32 float rows with a 256-byte aligned pitch.
/// Returns the row pitch.
fn encode_min_mip_rows(values: &[u8], grid: UVec2, out: &mut Vec<u8>) -> u32 {
    let width = grid.x.max(1) as usize;
    let row_pitch = (grid.x * std::mem::size_of::<f32>() as u32).next_multiple_of(256);
    out.clear();
    out.resize(row_pitch as usize * grid.y as usize, 0);

    let mut row = Vec::with_capacity(width);
    for (y, chunk) in values.chunks(width).take(grid.y as usize).enumerate() {
        row.clear();
        row.extend(chunk.iter().map(|&v| v as f32));
        let bytes: &[u8] = bytemuck::cast_slice(&row);
        let start = y * row_pitch as usize;
        out[start..start + bytes.len()].copy_from_slice(bytes);
    }
    row_pitch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::ManualClock;
    use crate::residency::device::{TextureFormat, TiledCoordinate};
    use crate::residency::headless::{HeadlessCommand, HeadlessCommandList, HeadlessDevice};
    use crate::residency::tile::MIN_MIP_NOT_SAMPLED;

    struct Harness {
        device: Rc<HeadlessDevice>,
        clock: Rc<ManualClock>,
        manager: FeedbackManager,
        config: FeedbackUpdateConfig,
        frame: u64,
    }

    impl Harness {
        fn new(num_frames_in_flight: u32, heap_size_in_tiles: u32) -> Self {
            let device = Rc::new(HeadlessDevice::new());
            let clock = Rc::new(ManualClock::new(0.0));
            let manager = FeedbackManager::with_clock(
                device.clone(),
                FeedbackManagerDesc { num_frames_in_flight, heap_size_in_tiles },
                clock.clone(),
            );
            let config = FeedbackUpdateConfig {
                defragment_heaps: false,
                trim_standby_tiles: false,
                ..Default::default()
            };
            Self { device, clock, manager, config, frame: 0 }
        }

        /// 1024x1024 rgba32f: 64x64 tiles, 5 regular mips (341 tiles) and one packed tile
        fn texture(&mut self) -> FeedbackTexture {
            self.manager
                .create_texture(&TextureDesc::new(1024, 1024, 11, TextureFormat::Rgba32Float))
                .unwrap()
        }

        /// Run one frame. `sampled` writes feedback between clearing and resolving it.
        fn frame(&mut self, sampled: &[(&FeedbackTexture, Vec<u8>)]) -> FeedbackTextureCollection {
            let mut cmd = HeadlessCommandList::new();
            self.config.frame_index = self.frame;
            let results = self.manager.begin_frame(&mut cmd, &self.config);
            self.manager.update_tile_mappings(&mut cmd, &results);
            cmd.submit(&self.device);

            for (texture, min_mips) in sampled {
                self.device.write_feedback(texture.feedback_texture(), min_mips);
            }
            self.manager.resolve_feedback(&mut cmd);
            cmd.submit(&self.device);
            self.manager.end_frame();

            self.frame += 1;
            self.clock.advance(1.0);
            results
        }
    }

    fn floats(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    fn full_residency(texture: &FeedbackTexture) -> Vec<u8> {
        let grid = texture.region_grid();
        vec![0; (grid.x * grid.y) as usize]
    }

    fn nothing_sampled(texture: &FeedbackTexture) -> Vec<u8> {
        let grid = texture.region_grid();
        vec![MIN_MIP_NOT_SAMPLED; (grid.x * grid.y) as usize]
    }

    #[test]
    fn test_full_residency_through_frames() {
        let mut h = Harness::new(2, 64);
        let texture = h.texture();
        let full = full_residency(&texture);

        // the packed tile is mapped right away
        let first = h.frame(&[(&texture, full.clone())]);
        assert_eq!(first.textures.len(), 1);
        assert_eq!(first.textures[0].tile_indices, vec![341]);
        assert_eq!(first.textures[0].tiles.len(), 6);
        assert_eq!(
            h.device.mapped_tiles(texture.reserved_texture())[0].0,
            TiledCoordinate { mip: 5, x: 0, y: 0 }
        );

        // feedback of frame 0 is read back in frame 2
        let second = h.frame(&[(&texture, full.clone())]);
        assert!(second.is_empty());
        let third = h.frame(&[(&texture, full.clone())]);
        assert_eq!(third.num_tiles(), 341);

        let stats = h.manager.stats();
        assert_eq!(stats.tiles_allocated, 342);
        assert_eq!(stats.tiles_bound, 342);
        assert_eq!(stats.tiles_total, 342);
        assert_eq!(stats.heap_count, 6);
        assert_eq!(stats.heap_allocation_bytes, 6 * 64 * TILE_SIZE_IN_BYTES);
        assert_eq!(h.device.mapped_tiles(texture.reserved_texture()).len(), 342);

        // min-mip texture now reports mip 0 everywhere
        let (data, pitch) = h.device.texture_data(texture.min_mip_texture()).unwrap();
        assert_eq!(pitch, 256);
        assert!(floats(&data[..64]).iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_bindings_point_at_heap_slots() {
        let mut h = Harness::new(1, 16);
        let texture = h.texture();
        h.frame(&[]);

        let mapped = h.device.mapped_tiles(texture.reserved_texture());
        assert_eq!(mapped.len(), 1);
        let resources = h.manager.heap_allocator().heap(1).unwrap();
        assert_eq!(mapped[0].1, TileBinding { heap: resources.heap, byte_offset: 0 });
    }

    #[test]
    fn test_timeout_unmaps_and_releases_heaps() {
        let mut h = Harness::new(1, 64);
        h.config.tile_timeout_seconds = 2.5;
        let texture = h.texture();
        let full = full_residency(&texture);
        let idle = nothing_sampled(&texture);

        h.frame(&[(&texture, full)]);
        h.frame(&[(&texture, idle.clone())]);
        assert_eq!(h.manager.stats().tiles_allocated, 342);
        let heaps_at_peak = h.device.live_heaps();

        // standby until the timeout passes
        h.frame(&[(&texture, idle.clone())]);
        assert_eq!(h.manager.stats().tiles_standby, 341);
        h.frame(&[(&texture, idle.clone())]);
        h.frame(&[(&texture, idle.clone())]);

        let stats = h.manager.stats();
        assert_eq!(stats.tiles_standby, 0);
        assert_eq!(stats.tiles_allocated, 1);
        assert_eq!(h.device.mapped_tiles(texture.reserved_texture()).len(), 1);
        assert_eq!(stats.heap_count, 1);

        // released heaps are destroyed once their frame slot comes around
        h.frame(&[]);
        assert!(h.device.live_heaps() < heaps_at_peak);
        assert_eq!(h.device.live_heaps(), 1);
    }

    #[test]
    fn test_trim_unmaps_excess_standby_tiles() {
        let mut h = Harness::new(1, 512);
        h.config.tile_timeout_seconds = 100.0;
        h.config.trim_standby_tiles = true;
        h.config.num_extra_standby_tiles = 41;
        let texture = h.texture();

        h.frame(&[(&texture, full_residency(&texture))]);
        h.frame(&[(&texture, nothing_sampled(&texture))]);
        h.frame(&[]);

        let stats = h.manager.stats();
        assert_eq!(stats.tiles_standby, 41);
        assert_eq!(h.device.mapped_tiles(texture.reserved_texture()).len(), 42);
    }

    #[test]
    fn test_unmaps_submitted_before_maps() {
        let mut h = Harness::new(1, 512);
        h.config.tile_timeout_seconds = 100.0;
        h.config.trim_standby_tiles = true;
        h.config.num_extra_standby_tiles = 0;
        let texture = h.texture();
        let reserved = texture.reserved_texture();

        // 16x16 regions: sample the left half, then the right half
        let left: Vec<u8> = (0..256).map(|r| if r % 16 < 8 { 0 } else { MIN_MIP_NOT_SAMPLED }).collect();
        let right: Vec<u8> = (0..256).map(|r| if r % 16 >= 8 { 0 } else { MIN_MIP_NOT_SAMPLED }).collect();
        h.frame(&[(&texture, left)]);
        h.frame(&[(&texture, right)]);
        h.device.take_mapping_log();

        // one frame trims the left half and maps the right half
        h.frame(&[]);
        let log = h.device.take_mapping_log();
        let unbinds: Vec<usize> = log
            .iter()
            .enumerate()
            .filter(|(_, (tex, m))| *tex == reserved && m.binding.is_none())
            .map(|(i, _)| i)
            .collect();
        let binds: Vec<usize> = log
            .iter()
            .enumerate()
            .filter(|(_, (tex, m))| *tex == reserved && m.binding.is_some())
            .map(|(i, _)| i)
            .collect();

        // mip 0..=3 tiles of each half; the mip 4 tile is shared
        assert_eq!(unbinds.len(), 128 + 32 + 8 + 2);
        assert_eq!(binds.len(), 128 + 32 + 8 + 2);
        assert!(unbinds.iter().max() < binds.iter().min());
        assert_eq!(h.device.mapped_tiles(reserved).len(), 170 + 2);
    }

    #[test]
    fn test_followers_track_primary() {
        let mut h = Harness::new(1, 512);
        let primary = h.texture();
        let follower = h.texture();
        let set = h.manager.create_texture_set();
        set.add_texture(&primary);
        set.add_texture(&follower);

        let mut requests = nothing_sampled(&primary);
        requests[0] = 0;
        h.frame(&[(&primary, requests)]);
        let results = h.frame(&[]);

        assert_eq!(results.textures.len(), 2);
        assert_eq!(results.textures[0].tile_indices, results.textures[1].tile_indices);
        assert_eq!(results.textures[0].tile_indices.len(), 5);
    }

    #[test]
    fn test_round_robin_captures() {
        let mut h = Harness::new(1, 64);
        h.config.max_textures_to_update = 1;
        let textures = [h.texture(), h.texture(), h.texture()];

        let mut cleared = Vec::new();
        for frame in 0..6 {
            let mut cmd = HeadlessCommandList::new();
            h.config.frame_index = frame;
            let results = h.manager.begin_frame(&mut cmd, &h.config);
            let clears: Vec<_> = cmd
                .commands()
                .iter()
                .filter_map(|c| match c {
                    HeadlessCommand::ClearFeedback(f) => Some(*f),
                    _ => None,
                })
                .collect();
            assert_eq!(clears.len(), 1);
            cleared.push(clears[0]);
            h.manager.update_tile_mappings(&mut cmd, &results);
            h.manager.resolve_feedback(&mut cmd);
            cmd.submit(&h.device);
            h.manager.end_frame();
        }

        let expected: Vec<_> = (0..6).map(|i| textures[i % 3].feedback_texture()).collect();
        assert_eq!(cleared, expected);
    }

    #[test]
    fn test_heap_failure_retried_next_frame() {
        let mut h = Harness::new(1, 16);
        let texture = h.texture();
        h.device.fail_next_heaps(1);

        let first = h.frame(&[]);
        assert!(first.is_empty());
        assert_eq!(h.manager.stats().tiles_requested, 1);

        let second = h.frame(&[]);
        assert_eq!(second.num_tiles(), 1);
        assert_eq!(h.device.mapped_tiles(texture.reserved_texture()).len(), 1);
    }

    #[test]
    fn test_unready_tiles_stay_unbound() {
        let mut h = Harness::new(1, 512);
        let texture = h.texture();

        let mut cmd = HeadlessCommandList::new();
        h.config.frame_index = 0;
        let results = h.manager.begin_frame(&mut cmd, &h.config);
        assert_eq!(results.num_tiles(), 1);
        // content not ready: hand back nothing
        h.manager.update_tile_mappings(&mut cmd, &FeedbackTextureCollection::default());
        cmd.submit(&h.device);
        h.manager.end_frame();

        assert!(h.device.mapped_tiles(texture.reserved_texture()).is_empty());
        assert_eq!(h.manager.stats().tiles_bound, 0);
        let (data, _) = h.device.texture_data(texture.min_mip_texture()).unwrap();
        assert_eq!(floats(&data[..4]), vec![5.0]);
    }

    #[test]
    fn test_defragmentation_copies_and_rebinds() {
        let mut h = Harness::new(1, 16);
        h.config.tile_timeout_seconds = 0.5;
        // 256x256 rgba32f: 16 + 4 + 1 regular tiles, 4x4 regions
        let texture = h
            .manager
            .create_texture(&TextureDesc::new(256, 256, 9, TextureFormat::Rgba32Float))
            .unwrap();

        h.frame(&[(&texture, full_residency(&texture))]);
        let partial: Vec<u8> = (0..16).map(|r| if r >= 8 { 0 } else { 1 }).collect();
        h.frame(&[(&texture, partial)]);
        assert_eq!(h.manager.stats().heap_count, 2);

        h.config.defragment_heaps = true;
        let mut cmd = HeadlessCommandList::new();
        h.config.frame_index = 2;
        let results = h.manager.begin_frame(&mut cmd, &h.config);
        let copies = cmd
            .commands()
            .iter()
            .filter(|c| matches!(c, HeadlessCommand::CopyBuffer { .. }))
            .count();
        assert_eq!(copies, 6);
        h.manager.update_tile_mappings(&mut cmd, &results);
        cmd.submit(&h.device);
        h.manager.end_frame();

        let heap1 = h.manager.heap_allocator().heap(1).unwrap().heap;
        let mapped = h.device.mapped_tiles(texture.reserved_texture());
        assert_eq!(mapped.len(), 14);
        assert!(mapped.iter().all(|(_, b)| b.heap == heap1));

        // the emptied heap goes away on the next frame
        h.frame(&[]);
        assert_eq!(h.manager.stats().heap_count, 1);
    }

    #[test]
    fn test_dropped_texture_is_forgotten() {
        let mut h = Harness::new(2, 64);
        let texture = h.texture();
        h.frame(&[(&texture, full_residency(&texture))]);
        drop(texture);

        assert_eq!(h.manager.num_textures(), 0);
        assert_eq!(h.manager.num_ring_textures(), 0);
        h.frame(&[]);
        h.frame(&[]);
        assert_eq!(h.manager.stats().tiles_total, 0);
    }

    #[test]
    fn test_encode_min_mip_rows() {
        let mut out = Vec::new();
        let pitch = encode_min_mip_rows(&[0, 1, 2, 3, 4, 5], UVec2::new(3, 2), &mut out);
        assert_eq!(pitch, 256);
        assert_eq!(out.len(), 512);
        assert_eq!(floats(&out[256..268]), vec![3.0, 4.0, 5.0]);
    }
}
