//! Heap Allocator - pool of fixed-size physical heaps with deferred release
//!
//! A released heap may still be referenced by GPU work of the frames in
//! flight, so its device resources are parked on the ring slot of the frame
//! that released it and only destroyed when that slot comes around again.

use std::rc::Rc;

use crate::core::Result;
use super::device::{BufferDesc, BufferHandle, BufferUsage, HeapHandle, ResidencyDevice, TILE_SIZE_IN_BYTES};
use super::tile::HeapId;

/// Device resources backing one heap
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapResources {
    pub heap: HeapHandle,
    /// Buffer aliasing the whole heap, source / destination of tile copies
    pub buffer: BufferHandle,
}

/// Pool of equally sized heaps
pub struct HeapAllocator {
    device: Rc<dyn ResidencyDevice>,
    heap_size_in_tiles: u32,
    /// Live heaps, indexed by `id - 1`
    heaps: Vec<Option<HeapResources>>,
    /// Ids whose deferred release completed
    free_ids: Vec<HeapId>,
    /// Released heaps waiting for their frame slot to come around
    pending_release: Vec<Vec<(HeapId, HeapResources)>>,
    total_allocated_bytes: u64,
    num_active: u32,
}

impl HeapAllocator {
    pub fn new(device: Rc<dyn ResidencyDevice>, heap_size_in_tiles: u32, num_frames_in_flight: u32) -> Self {
        let num_frames_in_flight = num_frames_in_flight.max(1);
        Self {
            device,
            heap_size_in_tiles: heap_size_in_tiles.max(1),
            heaps: Vec::new(),
            free_ids: Vec::new(),
            pending_release: vec![Vec::new(); num_frames_in_flight as usize],
            total_allocated_bytes: 0,
            num_active: 0,
        }
    }

    fn heap_size_in_bytes(&self) -> u64 {
        self.heap_size_in_tiles as u64 * TILE_SIZE_IN_BYTES
    }

    /// Create a heap and its aliasing buffer
    pub fn allocate(&mut self) -> Result<HeapId> {
        let size = self.heap_size_in_bytes();
        let heap = self.device.create_heap(size)?;
        let buffer = match self.device.create_buffer(&BufferDesc {
            size,
            usage: BufferUsage::HeapAlias(heap),
            label: Some("heap_alias"),
        }) {
            Ok(buffer) => buffer,
            Err(e) => {
                self.device.destroy_heap(heap);
                return Err(e);
            }
        };

        let resources = HeapResources { heap, buffer };
        let id = match self.free_ids.pop() {
            Some(id) => {
                self.heaps[(id - 1) as usize] = Some(resources);
                id
            }
            None => {
                self.heaps.push(Some(resources));
                self.heaps.len() as HeapId
            }
        };

        self.total_allocated_bytes += size;
        self.num_active += 1;
        log::info!(
            "Allocated heap {} ({} tiles, {}MB total)",
            id,
            self.heap_size_in_tiles,
            self.total_allocated_bytes / 1024 / 1024
        );
        Ok(id)
    }

    /// Retire a heap now; its resources are destroyed when ring slot
    /// `frame_index % num_frames_in_flight` is next collected.
    pub fn release(&mut self, id: HeapId, frame_index: u64) -> bool {
        let Some(resources) = id
            .checked_sub(1)
            .and_then(|i| self.heaps.get_mut(i as usize))
            .and_then(Option::take)
        else {
            log::warn!("Release of unknown heap {}", id);
            return false;
        };

        let slot = (frame_index % self.pending_release.len() as u64) as usize;
        self.pending_release[slot].push((id, resources));
        self.num_active -= 1;
        log::info!("Released heap {} (destroyed after frame slot {} wraps)", id, slot);
        true
    }

    /// Destroy the heaps parked on the ring slot of `frame_index`
    pub fn collect(&mut self, frame_index: u64) {
        let slot = (frame_index % self.pending_release.len() as u64) as usize;
        let size = self.heap_size_in_bytes();
        for (id, resources) in self.pending_release[slot].drain(..) {
            self.device.destroy_buffer(resources.buffer);
            self.device.destroy_heap(resources.heap);
            self.total_allocated_bytes -= size;
            self.free_ids.push(id);
            log::debug!("Destroyed heap {}", id);
        }
    }

    /// Resources of a live heap
    pub fn heap(&self, id: HeapId) -> Option<HeapResources> {
        let index = id.checked_sub(1)? as usize;
        self.heaps.get(index).copied().flatten()
    }

    /// Bytes of all heaps not yet destroyed, including those pending release
    pub fn total_allocated_bytes(&self) -> u64 {
        self.total_allocated_bytes
    }

    /// Live heaps
    pub fn heap_count(&self) -> u32 {
        self.num_active
    }

    pub fn num_pending_release(&self) -> usize {
        self.pending_release.iter().map(Vec::len).sum()
    }

    pub fn heap_size_in_tiles(&self) -> u32 {
        self.heap_size_in_tiles
    }
}

impl Drop for HeapAllocator {
    fn drop(&mut self) {
        let live = self.heaps.drain(..).flatten();
        let pending = self.pending_release.drain(..).flatten().map(|(_, r)| r);
        for resources in live.chain(pending).collect::<Vec<_>>() {
            self.device.destroy_buffer(resources.buffer);
            self.device.destroy_heap(resources.heap);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::residency::headless::HeadlessDevice;

    fn allocator(device: &Rc<HeadlessDevice>, frames: u32) -> HeapAllocator {
        HeapAllocator::new(device.clone(), 4, frames)
    }

    #[test]
    fn test_allocate_tracks_bytes() {
        let device = Rc::new(HeadlessDevice::new());
        let mut heaps = allocator(&device, 2);

        let a = heaps.allocate().unwrap();
        let b = heaps.allocate().unwrap();
        assert_ne!(a, b);
        assert_eq!(heaps.heap_count(), 2);
        assert_eq!(heaps.total_allocated_bytes(), 2 * 4 * TILE_SIZE_IN_BYTES);
        assert_eq!(device.live_heaps(), 2);
        assert!(heaps.heap(a).is_some());
        assert!(heaps.heap(0).is_none());
    }

    #[test]
    fn test_no_premature_id_reuse() {
        let device = Rc::new(HeadlessDevice::new());
        let mut heaps = allocator(&device, 3);

        let a = heaps.allocate().unwrap();
        assert!(heaps.release(a, 7));
        assert!(heaps.heap(a).is_none());
        assert_eq!(heaps.heap_count(), 0);

        // frames 8 and 9 collect other slots
        for frame in 8..10 {
            heaps.collect(frame);
            let b = heaps.allocate().unwrap();
            assert_ne!(b, a);
        }
        assert_eq!(device.live_heaps(), 3);

        // frame 10 wraps back to the slot of frame 7
        heaps.collect(10);
        assert_eq!(device.live_heaps(), 2);
        assert_eq!(heaps.allocate().unwrap(), a);
    }

    #[test]
    fn test_release_unknown_heap() {
        let device = Rc::new(HeadlessDevice::new());
        let mut heaps = allocator(&device, 2);
        assert!(!heaps.release(0, 0));
        assert!(!heaps.release(5, 0));

        let a = heaps.allocate().unwrap();
        assert!(heaps.release(a, 0));
        assert!(!heaps.release(a, 0));
    }

    #[test]
    fn test_allocation_failure_leaves_pool_unchanged() {
        let device = Rc::new(HeadlessDevice::new());
        let mut heaps = allocator(&device, 2);
        device.fail_next_heaps(1);

        assert!(heaps.allocate().is_err());
        assert_eq!(heaps.heap_count(), 0);
        assert_eq!(heaps.total_allocated_bytes(), 0);
        assert_eq!(heaps.allocate().unwrap(), 1);
    }

    #[test]
    fn test_drop_destroys_everything() {
        let device = Rc::new(HeadlessDevice::new());
        {
            let mut heaps = allocator(&device, 2);
            let a = heaps.allocate().unwrap();
            heaps.allocate().unwrap();
            heaps.release(a, 1);
        }
        assert_eq!(device.live_heaps(), 0);
        assert_eq!(device.live_buffers(), 0);
    }
}
