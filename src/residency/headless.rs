//! Headless device - in-memory implementation of the residency capabilities
//!
//! Records resources, tile mappings and buffer contents instead of talking to
//! a GPU. Used by the tests, the benchmark and the `residency_sim` binary.
//! Feedback is produced by calling [`HeadlessDevice::record_sample`] or
//! [`HeadlessDevice::write_feedback`] in place of a shader.

use std::cell::RefCell;
use std::collections::BTreeMap;

use crate::core::{Error, Result, UVec2};
use super::device::{
    BufferDesc, BufferHandle, CommandList, FeedbackHandle, HeapHandle, ReservedTexture, ResidencyDevice,
    TextureDesc, TextureHandle, TextureTiling, TileBinding, TileMapping, TiledCoordinate,
};
use super::tile::MIN_MIP_NOT_SAMPLED;

#[derive(Debug)]
struct TextureRecord {
    desc: TextureDesc,
    reserved: bool,
    mappings: BTreeMap<TiledCoordinate, TileBinding>,
    data: Vec<u8>,
    row_pitch: u32,
}

#[derive(Debug)]
struct FeedbackRecord {
    grid: UVec2,
    min_mips: Vec<u8>,
}

#[derive(Debug)]
struct BufferRecord {
    desc: BufferDesc,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct DeviceState {
    next_handle: u64,
    textures: BTreeMap<u64, TextureRecord>,
    feedback: BTreeMap<u64, FeedbackRecord>,
    buffers: BTreeMap<u64, BufferRecord>,
    heaps: BTreeMap<u64, u64>,
    fail_heaps: u32,
    fail_textures: u32,
    fail_buffers: u32,
    mapping_calls: u64,
    /// Every tile mapping applied, in submission order
    mapping_log: Vec<(TextureHandle, TileMapping)>,
}

impl DeviceState {
    fn mint(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn take_texture_failure(&mut self) -> Result<()> {
        if self.fail_textures > 0 {
            self.fail_textures -= 1;
            return Err(Error::Device("injected texture creation failure".into()));
        }
        Ok(())
    }
}

/// Recording implementation of [`ResidencyDevice`]
#[derive(Debug, Default)]
pub struct HeadlessDevice {
    state: RefCell<DeviceState>,
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` heap creations fail
    pub fn fail_next_heaps(&self, count: u32) {
        self.state.borrow_mut().fail_heaps = count;
    }

    /// Make the next `count` texture creations (reserved or regular) fail
    pub fn fail_next_textures(&self, count: u32) {
        self.state.borrow_mut().fail_textures = count;
    }

    /// Make the next `count` buffer creations fail
    pub fn fail_next_buffers(&self, count: u32) {
        self.state.borrow_mut().fail_buffers = count;
    }

    /// Overwrite the contents of a feedback resource, one min-mip byte per region
    pub fn write_feedback(&self, feedback: FeedbackHandle, min_mips: &[u8]) {
        let mut state = self.state.borrow_mut();
        if let Some(record) = state.feedback.get_mut(&feedback.0) {
            let len = record.min_mips.len();
            record.min_mips.clear();
            record.min_mips.extend(min_mips.iter().copied().take(len));
            record.min_mips.resize(len, MIN_MIP_NOT_SAMPLED);
        }
    }

    /// Record that region `(x, y)` was sampled at `mip`, keeping the finest mip
    pub fn record_sample(&self, feedback: FeedbackHandle, x: u32, y: u32, mip: u8) {
        let mut state = self.state.borrow_mut();
        if let Some(record) = state.feedback.get_mut(&feedback.0) {
            if x < record.grid.x && y < record.grid.y {
                let entry = &mut record.min_mips[(y * record.grid.x + x) as usize];
                *entry = (*entry).min(mip);
            }
        }
    }

    /// Region grid of a feedback resource
    pub fn feedback_grid(&self, feedback: FeedbackHandle) -> Option<UVec2> {
        self.state.borrow().feedback.get(&feedback.0).map(|r| r.grid)
    }

    pub fn feedback_contents(&self, feedback: FeedbackHandle) -> Option<Vec<u8>> {
        self.state.borrow().feedback.get(&feedback.0).map(|r| r.min_mips.clone())
    }

    /// Current tile bindings of a reserved texture
    pub fn mapped_tiles(&self, texture: TextureHandle) -> Vec<(TiledCoordinate, TileBinding)> {
        self.state
            .borrow()
            .textures
            .get(&texture.0)
            .map(|t| t.mappings.iter().map(|(c, b)| (*c, *b)).collect())
            .unwrap_or_default()
    }

    /// Last upload into a texture and its row pitch
    pub fn texture_data(&self, texture: TextureHandle) -> Option<(Vec<u8>, u32)> {
        let state = self.state.borrow();
        let record = state.textures.get(&texture.0)?;
        Some((record.data.clone(), record.row_pitch))
    }

    pub fn texture_desc(&self, texture: TextureHandle) -> Option<TextureDesc> {
        self.state.borrow().textures.get(&texture.0).map(|t| t.desc.clone())
    }

    pub fn buffer_desc(&self, buffer: BufferHandle) -> Option<BufferDesc> {
        self.state.borrow().buffers.get(&buffer.0).map(|b| b.desc)
    }

    /// Write bytes into a buffer, growing its backing store as needed
    pub fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        let mut state = self.state.borrow_mut();
        if let Some(record) = state.buffers.get_mut(&buffer.0) {
            write_bytes(&mut record.data, offset, data);
        }
    }

    /// `len` bytes of a buffer from `offset`; unwritten bytes read as zero
    pub fn buffer_bytes(&self, buffer: BufferHandle, offset: u64, len: usize) -> Vec<u8> {
        let state = self.state.borrow();
        let mut out = vec![0; len];
        if let Some(record) = state.buffers.get(&buffer.0) {
            let start = (offset as usize).min(record.data.len());
            let end = (start + len).min(record.data.len());
            out[..end - start].copy_from_slice(&record.data[start..end]);
        }
        out
    }

    pub fn live_heaps(&self) -> usize {
        self.state.borrow().heaps.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.borrow().buffers.len()
    }

    pub fn live_textures(&self) -> usize {
        self.state.borrow().textures.len()
    }

    pub fn live_feedback_textures(&self) -> usize {
        self.state.borrow().feedback.len()
    }

    /// Number of `update_tile_mappings` calls so far
    pub fn num_mapping_calls(&self) -> u64 {
        self.state.borrow().mapping_calls
    }

    /// Drain the ordered log of tile mappings applied since the last call
    pub fn take_mapping_log(&self) -> Vec<(TextureHandle, TileMapping)> {
        std::mem::take(&mut self.state.borrow_mut().mapping_log)
    }

    fn clear_feedback(&self, feedback: FeedbackHandle) {
        if let Some(record) = self.state.borrow_mut().feedback.get_mut(&feedback.0) {
            record.min_mips.fill(MIN_MIP_NOT_SAMPLED);
        }
    }

    fn decode_feedback(&self, dst: BufferHandle, feedback: FeedbackHandle) {
        let mut state = self.state.borrow_mut();
        let Some(min_mips) = state.feedback.get(&feedback.0).map(|r| r.min_mips.clone()) else {
            log::warn!("Decode of unknown feedback resource {:?}", feedback);
            return;
        };
        if let Some(record) = state.buffers.get_mut(&dst.0) {
            record.data = min_mips;
        }
    }

    fn copy_buffer(&self, dst: BufferHandle, dst_offset: u64, src: BufferHandle, src_offset: u64, size: u64) {
        let bytes = self.buffer_bytes(src, src_offset, size as usize);
        self.write_buffer(dst, dst_offset, &bytes);
    }

    fn write_texture(&self, texture: TextureHandle, data: Vec<u8>, row_pitch: u32) {
        if let Some(record) = self.state.borrow_mut().textures.get_mut(&texture.0) {
            record.data = data;
            record.row_pitch = row_pitch;
        }
    }
}

fn write_bytes(dst: &mut Vec<u8>, offset: u64, data: &[u8]) {
    let start = offset as usize;
    if dst.len() < start + data.len() {
        dst.resize(start + data.len(), 0);
    }
    dst[start..start + data.len()].copy_from_slice(data);
}

impl ResidencyDevice for HeadlessDevice {
    fn create_reserved_texture(&self, desc: &TextureDesc) -> Result<ReservedTexture> {
        desc.validate()?;
        let mut state = self.state.borrow_mut();
        state.take_texture_failure()?;
        let tiling = TextureTiling::standard(desc);
        let handle = state.mint();
        state.textures.insert(
            handle,
            TextureRecord {
                desc: desc.clone(),
                reserved: true,
                mappings: BTreeMap::new(),
                data: Vec::new(),
                row_pitch: 0,
            },
        );
        Ok(ReservedTexture { handle: TextureHandle(handle), tiling })
    }

    fn create_feedback_texture(&self, reserved: TextureHandle, mip_region: UVec2) -> Result<FeedbackHandle> {
        let mut state = self.state.borrow_mut();
        let desc = match state.textures.get(&reserved.0) {
            Some(record) if record.reserved => record.desc.clone(),
            _ => return Err(Error::Device(format!("{:?} is not a reserved texture", reserved))),
        };
        if mip_region.x == 0 || mip_region.y == 0 {
            return Err(Error::Device("feedback mip region has zero extent".into()));
        }
        let grid = UVec2::new(desc.width.div_ceil(mip_region.x), desc.height.div_ceil(mip_region.y));
        let handle = state.mint();
        state.feedback.insert(
            handle,
            FeedbackRecord {
                grid,
                min_mips: vec![MIN_MIP_NOT_SAMPLED; (grid.x * grid.y) as usize],
            },
        );
        Ok(FeedbackHandle(handle))
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureHandle> {
        desc.validate()?;
        let mut state = self.state.borrow_mut();
        state.take_texture_failure()?;
        let handle = state.mint();
        state.textures.insert(
            handle,
            TextureRecord {
                desc: desc.clone(),
                reserved: false,
                mappings: BTreeMap::new(),
                data: Vec::new(),
                row_pitch: 0,
            },
        );
        Ok(TextureHandle(handle))
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle> {
        let mut state = self.state.borrow_mut();
        if state.fail_buffers > 0 {
            state.fail_buffers -= 1;
            return Err(Error::Device("injected buffer creation failure".into()));
        }
        let handle = state.mint();
        state.buffers.insert(handle, BufferRecord { desc: *desc, data: Vec::new() });
        Ok(BufferHandle(handle))
    }

    fn create_heap(&self, size_in_bytes: u64) -> Result<HeapHandle> {
        let mut state = self.state.borrow_mut();
        if state.fail_heaps > 0 {
            state.fail_heaps -= 1;
            return Err(Error::Device("injected heap creation failure".into()));
        }
        let handle = state.mint();
        state.heaps.insert(handle, size_in_bytes);
        Ok(HeapHandle(handle))
    }

    fn destroy_texture(&self, texture: TextureHandle) {
        if self.state.borrow_mut().textures.remove(&texture.0).is_none() {
            log::warn!("Destroy of unknown texture {:?}", texture);
        }
    }

    fn destroy_feedback_texture(&self, feedback: FeedbackHandle) {
        if self.state.borrow_mut().feedback.remove(&feedback.0).is_none() {
            log::warn!("Destroy of unknown feedback resource {:?}", feedback);
        }
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        if self.state.borrow_mut().buffers.remove(&buffer.0).is_none() {
            log::warn!("Destroy of unknown buffer {:?}", buffer);
        }
    }

    fn destroy_heap(&self, heap: HeapHandle) {
        if self.state.borrow_mut().heaps.remove(&heap.0).is_none() {
            log::warn!("Destroy of unknown heap {:?}", heap);
        }
    }

    fn read_buffer(&self, buffer: BufferHandle, out: &mut Vec<u8>) -> Result<()> {
        let state = self.state.borrow();
        let record = state
            .buffers
            .get(&buffer.0)
            .ok_or_else(|| Error::Device(format!("read of unknown buffer {:?}", buffer)))?;
        out.clear();
        out.extend_from_slice(&record.data);
        Ok(())
    }

    fn update_tile_mappings(&self, texture: TextureHandle, mappings: &[TileMapping]) {
        let mut state = self.state.borrow_mut();
        state.mapping_calls += 1;
        let DeviceState { textures, mapping_log, .. } = &mut *state;
        let Some(record) = textures.get_mut(&texture.0) else {
            log::warn!("Tile mapping update for unknown texture {:?}", texture);
            return;
        };
        for mapping in mappings {
            mapping_log.push((texture, *mapping));
            match mapping.binding {
                Some(binding) => record.mappings.insert(mapping.coord, binding),
                None => record.mappings.remove(&mapping.coord),
            };
        }
    }
}

/// A command recorded by [`HeadlessCommandList`]
#[derive(Clone, Debug, PartialEq)]
pub enum HeadlessCommand {
    ClearFeedback(FeedbackHandle),
    DecodeFeedback { dst: BufferHandle, feedback: FeedbackHandle },
    CopyBuffer { dst: BufferHandle, dst_offset: u64, src: BufferHandle, src_offset: u64, size: u64 },
    WriteTexture { texture: TextureHandle, data: Vec<u8>, row_pitch: u32 },
}

/// Command list that records commands and replays them on [`HeadlessDevice`]
#[derive(Debug, Default)]
pub struct HeadlessCommandList {
    commands: Vec<HeadlessCommand>,
}

impl HeadlessCommandList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> &[HeadlessCommand] {
        &self.commands
    }

    /// Execute and clear the recorded commands
    pub fn submit(&mut self, device: &HeadlessDevice) {
        for command in self.commands.drain(..) {
            match command {
                HeadlessCommand::ClearFeedback(feedback) => device.clear_feedback(feedback),
                HeadlessCommand::DecodeFeedback { dst, feedback } => device.decode_feedback(dst, feedback),
                HeadlessCommand::CopyBuffer { dst, dst_offset, src, src_offset, size } => {
                    device.copy_buffer(dst, dst_offset, src, src_offset, size)
                }
                HeadlessCommand::WriteTexture { texture, data, row_pitch } => {
                    device.write_texture(texture, data, row_pitch)
                }
            }
        }
    }
}

impl CommandList for HeadlessCommandList {
    fn clear_feedback(&mut self, feedback: FeedbackHandle) {
        self.commands.push(HeadlessCommand::ClearFeedback(feedback));
    }

    fn decode_feedback(&mut self, dst: BufferHandle, feedback: FeedbackHandle) {
        self.commands.push(HeadlessCommand::DecodeFeedback { dst, feedback });
    }

    fn copy_buffer(&mut self, dst: BufferHandle, dst_offset: u64, src: BufferHandle, src_offset: u64, size: u64) {
        self.commands.push(HeadlessCommand::CopyBuffer { dst, dst_offset, src, src_offset, size });
    }

    fn write_texture(&mut self, texture: TextureHandle, data: &[u8], row_pitch: u32) {
        self.commands.push(HeadlessCommand::WriteTexture { texture, data: data.to_vec(), row_pitch });
    }
}
