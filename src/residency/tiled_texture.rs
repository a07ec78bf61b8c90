//! Tile layout of a registered texture.
//!
//! Tiles are numbered mip 0 row-major, then mip 1, and so on; the packed mip
//! tail follows the last regular mip. Feedback and the min-mip map both use
//! one region per mip 0 tile.

use crate::core::{Error, Result, UVec2};
use super::device::{SubresourceTiling, TextureTiling, TiledCoordinate};
use super::tile::MIN_MIP_NOT_SAMPLED;

/// Geometry needed to register a texture with the tiled texture manager
#[derive(Clone, Debug, PartialEq)]
pub struct TiledTextureDesc {
    pub width: u32,
    pub height: u32,
    /// Tile extent in texels
    pub tile_shape: UVec2,
    /// Tile grid of every regular mip, finest first
    pub levels: Vec<SubresourceTiling>,
    pub packed_mip_levels: u32,
    pub packed_tiles: u32,
}

impl TiledTextureDesc {
    /// Build from the tiling reported by the device
    pub fn from_tiling(width: u32, height: u32, tiling: &TextureTiling) -> Self {
        Self {
            width,
            height,
            tile_shape: tiling.tile_shape,
            levels: tiling.subresources.clone(),
            packed_mip_levels: tiling.packed_mip_desc.num_packed_mips,
            packed_tiles: tiling.packed_mip_desc.num_tiles_for_packed_mips,
        }
    }

    /// Full mip chain with every mip at least one tile large standard, the rest packed
    pub fn with_full_chain(width: u32, height: u32, tile_shape: UVec2, mip_levels: u32, packed_tiles: u32) -> Self {
        let mut levels = Vec::new();
        for mip in 0..mip_levels {
            let w = width.checked_shr(mip).unwrap_or(0).max(1);
            let h = height.checked_shr(mip).unwrap_or(0).max(1);
            if w < tile_shape.x || h < tile_shape.y {
                break;
            }
            levels.push(SubresourceTiling {
                width_in_tiles: w.div_ceil(tile_shape.x),
                height_in_tiles: h.div_ceil(tile_shape.y),
            });
        }
        let packed_mip_levels = mip_levels - levels.len() as u32;
        Self {
            width,
            height,
            tile_shape,
            levels,
            packed_mip_levels,
            packed_tiles: if packed_mip_levels > 0 { packed_tiles } else { 0 },
        }
    }
}

/// Validated tile layout with precomputed coordinates
#[derive(Clone, Debug)]
pub struct TiledTexture {
    desc: TiledTextureDesc,
    level_offsets: Vec<u32>,
    coordinates: Vec<TiledCoordinate>,
    region_grid: UVec2,
}

impl TiledTexture {
    pub fn new(desc: TiledTextureDesc) -> Result<Self> {
        if desc.width == 0 || desc.height == 0 {
            return Err(Error::InvalidDesc("texture has zero extent".into()));
        }
        if desc.tile_shape.x == 0 || desc.tile_shape.y == 0 {
            return Err(Error::InvalidDesc("tile shape has zero extent".into()));
        }
        if desc.levels.len() > u8::MAX as usize {
            return Err(Error::InvalidDesc(format!("{} regular mips", desc.levels.len())));
        }
        if desc.levels.iter().any(|l| l.width_in_tiles == 0 || l.height_in_tiles == 0) {
            return Err(Error::InvalidDesc("regular mip with an empty tile grid".into()));
        }

        let mut level_offsets = Vec::with_capacity(desc.levels.len());
        let mut coordinates = Vec::new();
        for (mip, level) in desc.levels.iter().enumerate() {
            level_offsets.push(coordinates.len() as u32);
            for y in 0..level.height_in_tiles {
                for x in 0..level.width_in_tiles {
                    coordinates.push(TiledCoordinate { mip: mip as u32, x, y });
                }
            }
        }
        let packed_mip = desc.levels.len() as u32;
        for i in 0..desc.packed_tiles {
            coordinates.push(TiledCoordinate { mip: packed_mip, x: i, y: 0 });
        }

        let region_grid = UVec2::new(
            desc.width.div_ceil(desc.tile_shape.x),
            desc.height.div_ceil(desc.tile_shape.y),
        );

        Ok(Self {
            desc,
            level_offsets,
            coordinates,
            region_grid,
        })
    }

    pub fn desc(&self) -> &TiledTextureDesc {
        &self.desc
    }

    pub fn regular_mips(&self) -> u32 {
        self.desc.levels.len() as u32
    }

    pub fn first_packed_tile_index(&self) -> u32 {
        self.coordinates.len() as u32 - self.desc.packed_tiles
    }

    pub fn total_tiles(&self) -> u32 {
        self.coordinates.len() as u32
    }

    pub fn is_packed(&self, tile_index: u32) -> bool {
        tile_index >= self.first_packed_tile_index()
    }

    /// Coordinates of every tile, indexed by tile index
    pub fn coordinates(&self) -> &[TiledCoordinate] {
        &self.coordinates
    }

    /// Index of the regular tile at `(mip, x, y)`
    pub fn tile_index(&self, mip: u32, x: u32, y: u32) -> Option<u32> {
        let level = self.desc.levels.get(mip as usize)?;
        if x >= level.width_in_tiles || y >= level.height_in_tiles {
            return None;
        }
        Some(self.level_offsets[mip as usize] + y * level.width_in_tiles + x)
    }

    /// Feedback / min-mip region grid
    pub fn region_grid(&self) -> UVec2 {
        self.region_grid
    }

    pub fn num_regions(&self) -> usize {
        (self.region_grid.x * self.region_grid.y) as usize
    }

    /// Index of the tile at `mip` covering region `(rx, ry)`
    pub fn covering_tile(&self, mip: u32, rx: u32, ry: u32) -> u32 {
        let level = self.desc.levels[mip as usize];
        let x = (rx >> mip).min(level.width_in_tiles - 1);
        let y = (ry >> mip).min(level.height_in_tiles - 1);
        self.level_offsets[mip as usize] + y * level.width_in_tiles + x
    }

    /// Regular tiles wanted by a per-region min-mip request map.
    ///
    /// A region asking for mip `m` wants its covering tile at `m` and at every
    /// coarser regular mip. Missing entries count as not sampled.
    pub fn desired_tiles(&self, requests: &[u8]) -> Vec<bool> {
        let mut desired = vec![false; self.first_packed_tile_index() as usize];
        let regular_mips = self.regular_mips();
        for ry in 0..self.region_grid.y {
            for rx in 0..self.region_grid.x {
                let region = (ry * self.region_grid.x + rx) as usize;
                let requested = requests.get(region).copied().unwrap_or(MIN_MIP_NOT_SAMPLED);
                if requested == MIN_MIP_NOT_SAMPLED {
                    continue;
                }
                for mip in (requested as u32)..regular_mips {
                    desired[self.covering_tile(mip, rx, ry) as usize] = true;
                }
            }
        }
        desired
    }

    /// Resample a request map of another layout onto this region grid (nearest region)
    pub fn resample_requests(&self, requests: &[u8], source_grid: UVec2) -> Vec<u8> {
        if source_grid == self.region_grid {
            let mut out = requests.to_vec();
            out.resize(self.num_regions(), MIN_MIP_NOT_SAMPLED);
            return out;
        }
        let mut out = Vec::with_capacity(self.num_regions());
        for ry in 0..self.region_grid.y {
            let sy = (ry as u64 * source_grid.y as u64 / self.region_grid.y as u64) as u32;
            for rx in 0..self.region_grid.x {
                let sx = (rx as u64 * source_grid.x as u64 / self.region_grid.x as u64) as u32;
                let index = (sy * source_grid.x + sx) as usize;
                out.push(requests.get(index).copied().unwrap_or(MIN_MIP_NOT_SAMPLED));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout_1024() -> TiledTexture {
        TiledTexture::new(TiledTextureDesc::with_full_chain(1024, 1024, UVec2::new(64, 64), 11, 1)).unwrap()
    }

    #[test]
    fn test_full_chain_layout() {
        let tex = layout_1024();
        // 1024..64 are regular: 256 + 64 + 16 + 4 + 1
        assert_eq!(tex.regular_mips(), 5);
        assert_eq!(tex.first_packed_tile_index(), 341);
        assert_eq!(tex.total_tiles(), 342);
        assert!(tex.is_packed(341));
        assert!(!tex.is_packed(340));
        assert_eq!(tex.region_grid(), UVec2::new(16, 16));
        assert_eq!(tex.coordinates()[341], TiledCoordinate { mip: 5, x: 0, y: 0 });
    }

    #[test]
    fn test_tile_index_and_coordinates_agree() {
        let tex = layout_1024();
        let index = tex.tile_index(1, 3, 5).unwrap();
        assert_eq!(tex.coordinates()[index as usize], TiledCoordinate { mip: 1, x: 3, y: 5 });
        assert_eq!(tex.tile_index(1, 8, 0), None);
        assert_eq!(tex.tile_index(9, 0, 0), None);
    }

    #[test]
    fn test_desired_tiles_include_coarser_mips() {
        let tex = layout_1024();
        let mut requests = vec![MIN_MIP_NOT_SAMPLED; tex.num_regions()];
        // region (5, 6) wants mip 2
        requests[6 * 16 + 5] = 2;
        let desired = tex.desired_tiles(&requests);
        let wanted: Vec<u32> = desired.iter().enumerate().filter(|(_, d)| **d).map(|(i, _)| i as u32).collect();

        assert_eq!(wanted.len(), 3);
        assert!(wanted.contains(&tex.tile_index(2, 1, 1).unwrap()));
        assert!(wanted.contains(&tex.tile_index(3, 0, 0).unwrap()));
        assert!(wanted.contains(&tex.tile_index(4, 0, 0).unwrap()));
    }

    #[test]
    fn test_short_request_map_is_not_sampled() {
        let tex = layout_1024();
        let desired = tex.desired_tiles(&[0]);
        assert_eq!(desired.iter().filter(|d| **d).count(), 5);
    }

    #[test]
    fn test_resample_requests_to_coarser_grid() {
        let small = TiledTexture::new(TiledTextureDesc::with_full_chain(512, 512, UVec2::new(64, 64), 10, 1)).unwrap();
        let mut requests = vec![MIN_MIP_NOT_SAMPLED; 256];
        requests[0] = 0;
        let resampled = small.resample_requests(&requests, UVec2::new(16, 16));
        assert_eq!(resampled.len(), 64);
        assert_eq!(resampled[0], 0);
        assert!(resampled[1..].iter().all(|v| *v == MIN_MIP_NOT_SAMPLED));
    }

    #[test]
    fn test_invalid_desc_rejected() {
        let desc = TiledTextureDesc::with_full_chain(0, 64, UVec2::new(64, 64), 1, 0);
        assert!(TiledTexture::new(desc).is_err());
    }
}
