//! Tile records - per-tile residency state tracked by the tiled texture manager

use serde::{Deserialize, Serialize};

/// Identifier of a texture registered with the tiled texture manager (never 0)
pub type TiledTextureId = u32;

/// Identifier of a heap handed out by the heap allocator (never 0)
pub type HeapId = u32;

/// Feedback value meaning "no texel of this region was sampled"
pub const MIN_MIP_NOT_SAMPLED: u8 = 0xFF;

/// Residency state of a tile
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TileState {
    /// No backing memory, not wanted
    #[default]
    Unmapped,
    /// Wanted, waiting for a heap slot
    Requested,
    /// Holds a heap slot and is wanted
    Mapped,
    /// Holds a heap slot but is no longer wanted; reclaimable until evicted
    Standby,
}

impl TileState {
    /// Whether a tile in this state owns a heap slot
    pub fn holds_slot(self) -> bool {
        matches!(self, Self::Mapped | Self::Standby)
    }

    /// Whether feedback currently wants this tile
    pub fn is_desired(self) -> bool {
        matches!(self, Self::Requested | Self::Mapped)
    }
}

/// Heap slot backing a tile
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileAllocation {
    pub heap_id: HeapId,
    pub heap_tile_index: u32,
}

/// Bookkeeping for a single tile
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TileRecord {
    pub state: TileState,
    pub allocation: Option<TileAllocation>,
    /// Content has been reported ready and the tile is bound in the texture
    pub bound: bool,
    /// Timestamp (seconds) of the last time feedback wanted this tile
    pub last_touched: f32,
}

impl TileRecord {
    /// Time since feedback last wanted this tile
    pub fn idle_seconds(&self, now: f32) -> f32 {
        now - self.last_touched
    }

    /// Whether the tile is resident and usable for sampling
    pub fn is_resident(&self) -> bool {
        self.bound && self.state.holds_slot()
    }
}

/// A tile relocated from one heap slot to another by defragmentation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileMove {
    pub texture_id: TiledTextureId,
    pub tile_index: u32,
    pub from: TileAllocation,
    pub to: TileAllocation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(!TileState::Unmapped.holds_slot());
        assert!(!TileState::Requested.holds_slot());
        assert!(TileState::Mapped.holds_slot());
        assert!(TileState::Standby.holds_slot());

        assert!(TileState::Requested.is_desired());
        assert!(TileState::Mapped.is_desired());
        assert!(!TileState::Standby.is_desired());
    }

    #[test]
    fn test_residency_requires_binding() {
        let mut record = TileRecord {
            state: TileState::Mapped,
            allocation: Some(TileAllocation { heap_id: 1, heap_tile_index: 0 }),
            bound: false,
            last_touched: 2.0,
        };
        assert!(!record.is_resident());
        record.bound = true;
        assert!(record.is_resident());
        assert_eq!(record.idle_seconds(5.0), 3.0);
    }
}
