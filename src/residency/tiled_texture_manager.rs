//! Tiled Texture Manager - desired vs. resident tiles for every registered texture
//!
//! Feedback turns into per-tile states, `Requested` tiles get slots in the
//! heap pool, and the map / unmap lists are drained by the orchestrator which
//! issues the actual tile mapping updates. The manager owns the slot tables of
//! all heaps; the physical heaps themselves belong to the heap allocator.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::core::{Error, Result};
use super::device::TiledCoordinate;
use super::tile::{
    HeapId, MIN_MIP_NOT_SAMPLED, TileAllocation, TileMove, TileRecord, TileState, TiledTextureId,
};
use super::tiled_texture::{TiledTexture, TiledTextureDesc};

/// Slot table of one heap
#[derive(Debug)]
struct HeapSlots {
    id: HeapId,
    /// Free slot indices, lowest index popped first
    free_slots: Vec<u32>,
    /// Tile occupying each slot
    owners: Vec<Option<(TiledTextureId, u32)>>,
}

impl HeapSlots {
    fn new(id: HeapId, capacity: u32) -> Self {
        Self {
            id,
            free_slots: (0..capacity).rev().collect(),
            owners: vec![None; capacity as usize],
        }
    }

    fn occupied(&self) -> u32 {
        (self.owners.len() - self.free_slots.len()) as u32
    }
}

/// Per-texture bookkeeping
#[derive(Debug)]
struct TextureState {
    layout: TiledTexture,
    tiles: Vec<TileRecord>,
    /// Last request map applied, one min-mip byte per region
    requested_mips: Vec<u8>,
    tiles_to_map: Vec<u32>,
    tiles_to_unmap: Vec<u32>,
}

/// Tile and heap counters across all textures
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TileStatistics {
    pub textures: u32,
    pub tiles_total: u32,
    /// Wanted but still waiting for a slot
    pub tiles_requested: u32,
    /// Holding a heap slot (mapped or standby)
    pub tiles_allocated: u32,
    pub tiles_standby: u32,
    pub tiles_bound: u32,
    pub heaps: u32,
    pub free_tiles_in_heaps: u32,
}

/// Tile residency bookkeeping for all registered textures
pub struct TiledTextureManager {
    heap_size_in_tiles: u32,
    textures: BTreeMap<TiledTextureId, TextureState>,
    next_texture_id: TiledTextureId,
    heaps: Vec<HeapSlots>,
    /// Mapped-but-undesired tiles
    standby: BTreeSet<(TiledTextureId, u32)>,
    /// Requested tiles left without a slot by the last allocation pass
    unmet_tiles: u32,
}

impl TiledTextureManager {
    /// Create a manager whose heaps all hold `heap_size_in_tiles` tiles
    pub fn new(heap_size_in_tiles: u32) -> Self {
        Self {
            heap_size_in_tiles: heap_size_in_tiles.max(1),
            textures: BTreeMap::new(),
            next_texture_id: 1,
            heaps: Vec::new(),
            standby: BTreeSet::new(),
            unmet_tiles: 0,
        }
    }

    pub fn heap_size_in_tiles(&self) -> u32 {
        self.heap_size_in_tiles
    }

    /// Register a texture; its packed tiles are requested right away
    pub fn register_texture(&mut self, desc: TiledTextureDesc) -> Result<TiledTextureId> {
        let layout = TiledTexture::new(desc)?;

        let mut tiles = vec![TileRecord::default(); layout.total_tiles() as usize];
        for tile in &mut tiles[layout.first_packed_tile_index() as usize..] {
            tile.state = TileState::Requested;
        }

        let id = self.next_texture_id;
        self.next_texture_id = self.next_texture_id.checked_add(1).unwrap_or(1);

        log::debug!(
            "Registered tiled texture {}: {} tiles ({} packed), {}x{} regions",
            id,
            layout.total_tiles(),
            layout.desc().packed_tiles,
            layout.region_grid().x,
            layout.region_grid().y
        );

        let requested_mips = vec![MIN_MIP_NOT_SAMPLED; layout.num_regions()];
        self.textures.insert(
            id,
            TextureState {
                layout,
                tiles,
                requested_mips,
                tiles_to_map: Vec::new(),
                tiles_to_unmap: Vec::new(),
            },
        );
        Ok(id)
    }

    /// Drop all bookkeeping for a texture, returning its slots to the heaps.
    /// No unmap operations are produced.
    pub fn unregister_texture(&mut self, id: TiledTextureId) -> bool {
        let Some(state) = self.textures.remove(&id) else {
            return false;
        };
        for (index, tile) in state.tiles.iter().enumerate() {
            if let Some(allocation) = tile.allocation {
                free_slot(&mut self.heaps, allocation);
            }
            self.standby.remove(&(id, index as u32));
        }
        log::debug!("Unregistered tiled texture {}", id);
        true
    }

    pub fn num_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn contains(&self, id: TiledTextureId) -> bool {
        self.textures.contains_key(&id)
    }

    /// Apply a decoded min-mip request map (one byte per region) to a texture
    pub fn update_with_feedback(
        &mut self,
        id: TiledTextureId,
        min_mips: &[u8],
        now: f32,
        timeout_seconds: f32,
    ) -> Result<()> {
        let state = self.textures.get_mut(&id).ok_or(Error::UnknownTexture(id))?;
        state.requested_mips.clear();
        state.requested_mips.extend_from_slice(min_mips);
        state.requested_mips.resize(state.layout.num_regions(), MIN_MIP_NOT_SAMPLED);

        apply_requests(id, state, &mut self.standby, &mut self.heaps, now, timeout_seconds);
        Ok(())
    }

    /// Give `follower` the request map last applied to `primary`
    pub fn match_primary_texture(
        &mut self,
        primary: TiledTextureId,
        follower: TiledTextureId,
        now: f32,
        timeout_seconds: f32,
    ) -> Result<()> {
        if primary == follower {
            return Ok(());
        }
        let source = self.textures.get(&primary).ok_or(Error::UnknownTexture(primary))?;
        let requests = source.requested_mips.clone();
        let source_grid = source.layout.region_grid();

        let state = self.textures.get_mut(&follower).ok_or(Error::UnknownTexture(follower))?;
        state.requested_mips = state.layout.resample_requests(&requests, source_grid);

        apply_requests(follower, state, &mut self.standby, &mut self.heaps, now, timeout_seconds);
        Ok(())
    }

    /// Hand out free heap slots to requested tiles.
    ///
    /// Packed tiles go first, then regular tiles from the coarsest mip down,
    /// each into the fullest heap that still has room.
    pub fn allocate_requested_tiles(&mut self) {
        let Self { textures, heaps, .. } = self;
        let mut unmet = 0u32;

        let max_regular_mips = textures.values().map(|t| t.layout.regular_mips()).max().unwrap_or(0);

        // packed pass, then one pass per mip, coarse to fine
        let passes = std::iter::once(None).chain((0..max_regular_mips).rev().map(Some));
        for pass in passes {
            for (&id, state) in textures.iter_mut() {
                let range = match pass {
                    None => state.layout.first_packed_tile_index()..state.layout.total_tiles(),
                    Some(mip) => match mip_tile_range(&state.layout, mip) {
                        Some(range) => range,
                        None => continue,
                    },
                };
                for index in range {
                    let tile = &mut state.tiles[index as usize];
                    if tile.state != TileState::Requested {
                        continue;
                    }
                    let Some(allocation) = take_slot(heaps, id, index) else {
                        unmet += 1;
                        continue;
                    };
                    log::trace!(
                        "Tile {}:{} -> heap {} slot {}",
                        id,
                        index,
                        allocation.heap_id,
                        allocation.heap_tile_index
                    );
                    tile.state = TileState::Mapped;
                    tile.allocation = Some(allocation);
                    tile.bound = false;
                    state.tiles_to_map.push(index);
                }
            }
        }

        self.unmet_tiles = unmet;
    }

    /// Heaps needed to satisfy every request seen by the last allocation pass
    pub fn num_desired_heaps(&self) -> u32 {
        self.heaps.len() as u32 + self.unmet_tiles.div_ceil(self.heap_size_in_tiles)
    }

    /// Requested tiles that found no slot in the last allocation pass
    pub fn num_unmet_tiles(&self) -> u32 {
        self.unmet_tiles
    }

    /// Heaps with no occupied slot
    pub fn empty_heaps(&self) -> Vec<HeapId> {
        self.heaps.iter().filter(|h| h.occupied() == 0).map(|h| h.id).collect()
    }

    /// Make a newly created heap available for allocation
    pub fn add_heap(&mut self, heap_id: HeapId) {
        if self.heaps.iter().any(|h| h.id == heap_id) {
            log::warn!("Heap {} added twice", heap_id);
            return;
        }
        self.heaps.push(HeapSlots::new(heap_id, self.heap_size_in_tiles));
    }

    /// Withdraw an empty heap. Returns false if the heap is unknown or still backs tiles.
    pub fn remove_heap(&mut self, heap_id: HeapId) -> bool {
        match self.heaps.iter().position(|h| h.id == heap_id) {
            Some(pos) if self.heaps[pos].occupied() == 0 => {
                self.heaps.swap_remove(pos);
                true
            }
            _ => false,
        }
    }

    pub fn num_heaps(&self) -> u32 {
        self.heaps.len() as u32
    }

    /// Drain the tiles that received a slot and still wait to be bound
    pub fn tiles_to_map(&mut self, id: TiledTextureId) -> Vec<u32> {
        let Some(state) = self.textures.get_mut(&id) else {
            return Vec::new();
        };
        let mut out = std::mem::take(&mut state.tiles_to_map);
        out.retain(|&index| {
            let tile = &state.tiles[index as usize];
            tile.allocation.is_some() && !tile.bound
        });
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Drain the tiles that lost their slot
    pub fn tiles_to_unmap(&mut self, id: TiledTextureId) -> Vec<u32> {
        let Some(state) = self.textures.get_mut(&id) else {
            return Vec::new();
        };
        let mut out = std::mem::take(&mut state.tiles_to_unmap);
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Mark tiles as bound in the texture once their content is in place
    pub fn update_tiles_mapping(&mut self, id: TiledTextureId, tile_indices: &[u32]) -> Result<()> {
        let state = self.textures.get_mut(&id).ok_or(Error::UnknownTexture(id))?;
        for &index in tile_indices {
            if let Some(tile) = state.tiles.get_mut(index as usize) {
                if tile.allocation.is_some() {
                    tile.bound = true;
                }
            }
        }
        Ok(())
    }

    /// Evict the oldest standby tiles beyond `num_extra_standby_tiles`.
    /// Returns the number of evicted tiles.
    pub fn trim_standby_tiles(&mut self, num_extra_standby_tiles: u32) -> u32 {
        let budget = num_extra_standby_tiles as usize;
        if self.standby.len() <= budget {
            return 0;
        }

        let mut candidates: Vec<(f32, TiledTextureId, u32)> = self
            .standby
            .iter()
            .filter_map(|&(id, index)| {
                let tile = self.textures.get(&id)?.tiles.get(index as usize)?;
                Some((tile.last_touched, id, index))
            })
            .collect();
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        let excess = self.standby.len() - budget;
        let mut evicted = 0;
        for &(_, id, index) in candidates.iter().take(excess) {
            if let Some(state) = self.textures.get_mut(&id) {
                evict_tile(id, index, state, &mut self.standby, &mut self.heaps);
                evicted += 1;
            }
        }
        log::debug!("Trimmed {} standby tiles ({} remain)", evicted, self.standby.len());
        evicted
    }

    /// Move up to `max_tiles` bound tiles out of the emptiest heap into fuller ones.
    ///
    /// The caller copies the tile contents and rebinds the moved tiles.
    pub fn defragment_tiles(&mut self, max_tiles: u32) -> Vec<TileMove> {
        let mut moves = Vec::new();

        while (moves.len() as u32) < max_tiles {
            let Some((source, slot)) = self.defrag_source() else {
                break;
            };
            let source_occupied = self.heaps[source].occupied();
            let target = self
                .heaps
                .iter()
                .enumerate()
                .filter(|(i, h)| *i != source && !h.free_slots.is_empty() && h.occupied() >= source_occupied)
                .max_by(|(_, a), (_, b)| a.occupied().cmp(&b.occupied()).then(b.id.cmp(&a.id)))
                .map(|(i, _)| i);
            let Some(target) = target else {
                break;
            };

            let Some((id, index)) = self.heaps[source].owners[slot as usize] else {
                break;
            };
            let from = TileAllocation { heap_id: self.heaps[source].id, heap_tile_index: slot };
            free_slot(&mut self.heaps, from);

            let Some(to_slot) = self.heaps[target].free_slots.pop() else {
                break;
            };
            self.heaps[target].owners[to_slot as usize] = Some((id, index));
            let to = TileAllocation { heap_id: self.heaps[target].id, heap_tile_index: to_slot };

            if let Some(tile) = self.textures.get_mut(&id).and_then(|s| s.tiles.get_mut(index as usize)) {
                tile.allocation = Some(to);
            }
            moves.push(TileMove { texture_id: id, tile_index: index, from, to });
        }

        if !moves.is_empty() {
            log::debug!("Defragmented {} tiles", moves.len());
        }
        moves
    }

    /// Heap with the fewest occupied slots that holds a bound tile, and that tile's slot
    fn defrag_source(&self) -> Option<(usize, u32)> {
        let mut best: Option<(usize, u32, u32)> = None;
        for (i, heap) in self.heaps.iter().enumerate() {
            let occupied = heap.occupied();
            if occupied == 0 || best.is_some_and(|(_, n, _)| occupied >= n) {
                continue;
            }
            let movable = heap.owners.iter().enumerate().find_map(|(slot, owner)| {
                let (id, index) = (*owner)?;
                let tile = self.textures.get(&id)?.tiles.get(index as usize)?;
                tile.bound.then_some(slot as u32)
            });
            if let Some(slot) = movable {
                best = Some((i, occupied, slot));
            }
        }
        best.map(|(i, _, slot)| (i, slot))
    }

    /// Write the per-region finest resident mip of a texture, one byte per region.
    ///
    /// A region reports mip `m` when its covering tiles at `m` and every coarser
    /// regular mip are bound; otherwise the packed tail (`regular_mips`). A
    /// texture without a packed tail falls back to its coarsest regular mip.
    pub fn write_min_mip_data(&self, id: TiledTextureId, out: &mut Vec<u8>) -> Result<()> {
        let state = self.textures.get(&id).ok_or(Error::UnknownTexture(id))?;
        let layout = &state.layout;
        let grid = layout.region_grid();
        let regular_mips = layout.regular_mips();
        let coarsest = if layout.desc().packed_tiles > 0 {
            regular_mips
        } else {
            regular_mips.saturating_sub(1)
        };

        out.clear();
        out.reserve(layout.num_regions());
        for ry in 0..grid.y {
            for rx in 0..grid.x {
                let mut value = coarsest;
                for mip in (0..regular_mips).rev() {
                    if !state.tiles[layout.covering_tile(mip, rx, ry) as usize].is_resident() {
                        break;
                    }
                    value = mip;
                }
                out.push(value.min(u8::MAX as u32) as u8);
            }
        }
        Ok(())
    }

    /// Indices of the tiles feedback currently wants (requested or mapped)
    pub fn desired_tile_indices(&self, id: TiledTextureId) -> Option<Vec<u32>> {
        let state = self.textures.get(&id)?;
        let first_packed = state.layout.first_packed_tile_index() as usize;
        Some(
            state.tiles[..first_packed]
                .iter()
                .enumerate()
                .filter(|(_, t)| t.state.is_desired())
                .map(|(i, _)| i as u32)
                .collect(),
        )
    }

    pub fn tile(&self, id: TiledTextureId, tile_index: u32) -> Option<&TileRecord> {
        self.textures.get(&id)?.tiles.get(tile_index as usize)
    }

    pub fn tile_coordinates(&self, id: TiledTextureId) -> Option<&[TiledCoordinate]> {
        Some(self.textures.get(&id)?.layout.coordinates())
    }

    /// Heap slot of every tile of a texture
    pub fn tile_allocations(&self, id: TiledTextureId) -> Option<Vec<Option<TileAllocation>>> {
        Some(self.textures.get(&id)?.tiles.iter().map(|t| t.allocation).collect())
    }

    pub fn texture_layout(&self, id: TiledTextureId) -> Option<&TiledTexture> {
        Some(&self.textures.get(&id)?.layout)
    }

    /// Occupied slots in a heap, None if the heap is unknown
    pub fn heap_occupancy(&self, heap_id: HeapId) -> Option<u32> {
        self.heaps.iter().find(|h| h.id == heap_id).map(HeapSlots::occupied)
    }

    pub fn statistics(&self) -> TileStatistics {
        let mut stats = TileStatistics {
            textures: self.textures.len() as u32,
            heaps: self.heaps.len() as u32,
            free_tiles_in_heaps: self.heaps.iter().map(|h| h.free_slots.len() as u32).sum(),
            tiles_standby: self.standby.len() as u32,
            ..Default::default()
        };
        for state in self.textures.values() {
            count_tiles(&state.tiles, &mut stats);
        }
        stats
    }

    /// Tile counters of one texture; heap fields are left at zero
    pub fn texture_statistics(&self, id: TiledTextureId) -> Option<TileStatistics> {
        let state = self.textures.get(&id)?;
        let mut stats = TileStatistics {
            textures: 1,
            ..Default::default()
        };
        count_tiles(&state.tiles, &mut stats);
        stats.tiles_standby = state.tiles.iter().filter(|t| t.state == TileState::Standby).count() as u32;
        Some(stats)
    }
}

fn count_tiles(tiles: &[TileRecord], stats: &mut TileStatistics) {
    stats.tiles_total += tiles.len() as u32;
    for tile in tiles {
        match tile.state {
            TileState::Requested => stats.tiles_requested += 1,
            TileState::Mapped | TileState::Standby => stats.tiles_allocated += 1,
            TileState::Unmapped => {}
        }
        if tile.bound {
            stats.tiles_bound += 1;
        }
    }
}

/// Tile index range of a regular mip
fn mip_tile_range(layout: &TiledTexture, mip: u32) -> Option<std::ops::Range<u32>> {
    let level = layout.desc().levels.get(mip as usize)?;
    let start = layout.tile_index(mip, 0, 0)?;
    Some(start..start + level.width_in_tiles * level.height_in_tiles)
}

/// Update tile states of one texture from its stored request map
fn apply_requests(
    id: TiledTextureId,
    state: &mut TextureState,
    standby: &mut BTreeSet<(TiledTextureId, u32)>,
    heaps: &mut [HeapSlots],
    now: f32,
    timeout_seconds: f32,
) {
    let desired = state.layout.desired_tiles(&state.requested_mips);

    for (index, wanted) in desired.into_iter().enumerate() {
        let index = index as u32;
        let tile = &mut state.tiles[index as usize];
        if wanted {
            tile.last_touched = now;
            match tile.state {
                TileState::Unmapped => tile.state = TileState::Requested,
                TileState::Standby => {
                    tile.state = TileState::Mapped;
                    standby.remove(&(id, index));
                }
                TileState::Requested | TileState::Mapped => {}
            }
            continue;
        }

        match tile.state {
            TileState::Requested => tile.state = TileState::Unmapped,
            TileState::Mapped => {
                tile.state = TileState::Standby;
                standby.insert((id, index));
            }
            TileState::Unmapped | TileState::Standby => {}
        }
        if tile.state == TileState::Standby && tile.idle_seconds(now) > timeout_seconds {
            evict_tile(id, index, state, standby, heaps);
        }
    }
}

/// Release the slot of a standby tile and queue its unmap
fn evict_tile(
    id: TiledTextureId,
    index: u32,
    state: &mut TextureState,
    standby: &mut BTreeSet<(TiledTextureId, u32)>,
    heaps: &mut [HeapSlots],
) {
    let tile = &mut state.tiles[index as usize];
    if let Some(allocation) = tile.allocation.take() {
        free_slot(heaps, allocation);
    }
    tile.state = TileState::Unmapped;
    tile.bound = false;
    standby.remove(&(id, index));
    state.tiles_to_unmap.push(index);
    log::trace!("Evicted tile {}:{}", id, index);
}

fn free_slot(heaps: &mut [HeapSlots], allocation: TileAllocation) {
    if let Some(heap) = heaps.iter_mut().find(|h| h.id == allocation.heap_id) {
        heap.owners[allocation.heap_tile_index as usize] = None;
        heap.free_slots.push(allocation.heap_tile_index);
    }
}

/// Take a slot from the fullest heap with room
fn take_slot(heaps: &mut [HeapSlots], id: TiledTextureId, index: u32) -> Option<TileAllocation> {
    let heap = heaps
        .iter_mut()
        .filter(|h| !h.free_slots.is_empty())
        .max_by(|a, b| a.occupied().cmp(&b.occupied()).then(b.id.cmp(&a.id)))?;
    let slot = heap.free_slots.pop()?;
    heap.owners[slot as usize] = Some((id, index));
    Some(TileAllocation { heap_id: heap.id, heap_tile_index: slot })
}
