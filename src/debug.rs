//! Debug server integration
//!
//! The frame loop publishes residency state into [`SharedDebugState`] after
//! every frame and picks up policy overrides before the next one. The debug
//! server thread only ever touches the shared state.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tilestream_debug::{
    DebugCommand, DebugHandler, DebugResponse, DebugServer, ResponseData, StatsInfo, TextureInfo,
    UpdateConfigInfo,
};

use crate::residency::{FeedbackManager, FeedbackManagerStats, FeedbackUpdateConfig};

/// State exchanged between the frame loop and the debug server
#[derive(Debug, Default)]
pub struct SharedDebugState {
    pub stats: StatsInfo,
    pub update_config: UpdateConfigInfo,
    pub textures: Vec<TextureInfo>,
    /// Policy requested by a client, applied before the next frame
    pub pending_config: Option<UpdateConfigInfo>,
}

pub type SharedDebugStateHandle = Arc<Mutex<SharedDebugState>>;

/// Lock the shared state, recovering it if a holder panicked
pub fn lock_state(state: &Mutex<SharedDebugState>) -> MutexGuard<'_, SharedDebugState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SharedDebugState {
    /// Publish the last completed frame of `manager`
    pub fn publish(&mut self, manager: &FeedbackManager) {
        self.stats = stats_info(&manager.stats());
        self.update_config = config_info(manager.update_config());
        self.textures = manager
            .texture_statistics()
            .into_iter()
            .map(|t| TextureInfo {
                id: t.id,
                width: t.width,
                height: t.height,
                tiles_total: t.tiles.tiles_total,
                tiles_allocated: t.tiles.tiles_allocated,
                tiles_standby: t.tiles.tiles_standby,
            })
            .collect();
    }

    /// Copy a pending override into `config`. Returns true if one was applied.
    pub fn apply_overrides(&mut self, config: &mut FeedbackUpdateConfig) -> bool {
        let Some(info) = self.pending_config.take() else {
            return false;
        };
        config.max_textures_to_update = info.max_textures_to_update;
        config.tile_timeout_seconds = info.tile_timeout_seconds;
        config.defragment_heaps = info.defragment_heaps;
        config.trim_standby_tiles = info.trim_standby_tiles;
        config.release_empty_heaps = info.release_empty_heaps;
        config.num_extra_standby_tiles = info.num_extra_standby_tiles;
        config.defrag_tiles_per_frame = info.defrag_tiles_per_frame;
        self.update_config = info;
        log::info!("Applied debug policy override: {:?}", self.update_config);
        true
    }
}

fn stats_info(stats: &FeedbackManagerStats) -> StatsInfo {
    StatsInfo {
        frame: stats.frame_index,
        heap_allocation_bytes: stats.heap_allocation_bytes,
        heap_count: stats.heap_count,
        free_tiles_in_heaps: stats.free_tiles_in_heaps,
        tiles_total: stats.tiles_total,
        tiles_requested: stats.tiles_requested,
        tiles_allocated: stats.tiles_allocated,
        tiles_standby: stats.tiles_standby,
        cputime_begin_frame_ms: stats.cputime_begin_frame * 1000.0,
        cputime_update_tile_mappings_ms: stats.cputime_update_tile_mappings * 1000.0,
        cputime_resolve_ms: stats.cputime_resolve * 1000.0,
    }
}

fn config_info(config: &FeedbackUpdateConfig) -> UpdateConfigInfo {
    UpdateConfigInfo {
        max_textures_to_update: config.max_textures_to_update,
        tile_timeout_seconds: config.tile_timeout_seconds,
        defragment_heaps: config.defragment_heaps,
        trim_standby_tiles: config.trim_standby_tiles,
        release_empty_heaps: config.release_empty_heaps,
        num_extra_standby_tiles: config.num_extra_standby_tiles,
        defrag_tiles_per_frame: config.defrag_tiles_per_frame,
    }
}

/// Answers debug clients from the shared state
pub struct ResidencyDebugHandler {
    state: SharedDebugStateHandle,
}

impl ResidencyDebugHandler {
    pub fn new(state: SharedDebugStateHandle) -> Self {
        Self { state }
    }
}

impl DebugHandler for ResidencyDebugHandler {
    fn handle_command(&mut self, cmd: DebugCommand) -> DebugResponse {
        match cmd {
            DebugCommand::Ping => DebugResponse::pong(),

            DebugCommand::GetStats => {
                let s = lock_state(&self.state);
                DebugResponse::ok(ResponseData::Stats(s.stats.clone()))
            }

            DebugCommand::GetUpdateConfig => {
                let s = lock_state(&self.state);
                let info = s.pending_config.clone().unwrap_or_else(|| s.update_config.clone());
                DebugResponse::ok(ResponseData::UpdateConfig(info))
            }

            DebugCommand::ListTextures => {
                let s = lock_state(&self.state);
                DebugResponse::ok(ResponseData::Textures { textures: s.textures.clone() })
            }

            DebugCommand::SetUpdateConfig {
                max_textures_to_update,
                tile_timeout_seconds,
                defragment_heaps,
                trim_standby_tiles,
                release_empty_heaps,
                num_extra_standby_tiles,
                defrag_tiles_per_frame,
            } => {
                if tile_timeout_seconds.is_some_and(|t| !t.is_finite() || t < 0.0) {
                    return DebugResponse::error("tile_timeout_seconds must be a non-negative number");
                }

                let mut s = lock_state(&self.state);
                let mut info = s.pending_config.clone().unwrap_or_else(|| s.update_config.clone());
                let mut changed = Vec::new();
                if let Some(v) = max_textures_to_update {
                    info.max_textures_to_update = v;
                    changed.push(format!("max_textures_to_update={}", v));
                }
                if let Some(v) = tile_timeout_seconds {
                    info.tile_timeout_seconds = v;
                    changed.push(format!("tile_timeout_seconds={}", v));
                }
                if let Some(v) = defragment_heaps {
                    info.defragment_heaps = v;
                    changed.push(format!("defragment_heaps={}", v));
                }
                if let Some(v) = trim_standby_tiles {
                    info.trim_standby_tiles = v;
                    changed.push(format!("trim_standby_tiles={}", v));
                }
                if let Some(v) = release_empty_heaps {
                    info.release_empty_heaps = v;
                    changed.push(format!("release_empty_heaps={}", v));
                }
                if let Some(v) = num_extra_standby_tiles {
                    info.num_extra_standby_tiles = v;
                    changed.push(format!("num_extra_standby_tiles={}", v));
                }
                if let Some(v) = defrag_tiles_per_frame {
                    info.defrag_tiles_per_frame = v;
                    changed.push(format!("defrag_tiles_per_frame={}", v));
                }

                if changed.is_empty() {
                    return DebugResponse::none();
                }
                s.pending_config = Some(info);
                DebugResponse::ok(ResponseData::ParamsUpdated { description: changed.join(", ") })
            }
        }
    }
}

/// Run the debug server on its own thread with a dedicated tokio runtime
pub fn spawn_debug_server(state: SharedDebugStateHandle, port: u16) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(e) => {
                log::error!("Failed to create tokio runtime for the debug server: {}", e);
                return;
            }
        };
        rt.block_on(async {
            let handler = Arc::new(tokio::sync::Mutex::new(ResidencyDebugHandler::new(state)));
            let _server = DebugServer::start(handler, port);
            log::info!("Debug server started on port {}", port);
            // Keep runtime alive forever
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            }
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;
    use crate::residency::{
        FeedbackManagerDesc, HeadlessCommandList, HeadlessDevice, TextureDesc, TextureFormat,
    };

    fn handler() -> (SharedDebugStateHandle, ResidencyDebugHandler) {
        let state = SharedDebugStateHandle::default();
        let handler = ResidencyDebugHandler::new(state.clone());
        (state, handler)
    }

    #[test]
    fn test_ping() {
        let (_, mut handler) = handler();
        assert!(matches!(
            handler.handle_command(DebugCommand::Ping),
            DebugResponse::Ok { data: ResponseData::Pong { .. } }
        ));
    }

    #[test]
    fn test_publish_and_query() {
        let device = Rc::new(HeadlessDevice::new());
        let mut manager = FeedbackManager::new(device.clone(), FeedbackManagerDesc::default());
        let _texture = manager
            .create_texture(&TextureDesc::new(1024, 1024, 11, TextureFormat::Rgba32Float))
            .unwrap();

        let mut cmd = HeadlessCommandList::new();
        let config = FeedbackUpdateConfig { frame_index: 4, ..Default::default() };
        let results = manager.begin_frame(&mut cmd, &config);
        manager.update_tile_mappings(&mut cmd, &results);
        manager.resolve_feedback(&mut cmd);
        cmd.submit(&device);
        manager.end_frame();

        let (state, mut handler) = handler();
        lock_state(&state).publish(&manager);

        match handler.handle_command(DebugCommand::GetStats) {
            DebugResponse::Ok { data: ResponseData::Stats(stats) } => {
                assert_eq!(stats.frame, 4);
                assert_eq!(stats.heap_count, 1);
                assert_eq!(stats.tiles_total, 342);
                assert_eq!(stats.tiles_allocated, 1);
            }
            other => panic!("unexpected response {:?}", other),
        }

        match handler.handle_command(DebugCommand::ListTextures) {
            DebugResponse::Ok { data: ResponseData::Textures { textures } } => {
                assert_eq!(textures.len(), 1);
                assert_eq!(textures[0].width, 1024);
                assert_eq!(textures[0].tiles_total, 342);
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_override_applied_on_next_frame() {
        let (state, mut handler) = handler();
        lock_state(&state).update_config = config_info(&FeedbackUpdateConfig::default());

        let response = handler.handle_command(DebugCommand::SetUpdateConfig {
            max_textures_to_update: None,
            tile_timeout_seconds: Some(4.0),
            defragment_heaps: Some(false),
            trim_standby_tiles: None,
            release_empty_heaps: None,
            num_extra_standby_tiles: None,
            defrag_tiles_per_frame: None,
        });
        match response {
            DebugResponse::Ok { data: ResponseData::ParamsUpdated { description } } => {
                assert_eq!(description, "tile_timeout_seconds=4, defragment_heaps=false");
            }
            other => panic!("unexpected response {:?}", other),
        }

        let mut config = FeedbackUpdateConfig { frame_index: 9, ..Default::default() };
        assert!(lock_state(&state).apply_overrides(&mut config));
        assert_eq!(config.tile_timeout_seconds, 4.0);
        assert!(!config.defragment_heaps);
        assert_eq!(config.frame_index, 9);
        assert_eq!(config.num_extra_standby_tiles, 1000);

        // consumed
        assert!(!lock_state(&state).apply_overrides(&mut config));
    }

    #[test]
    fn test_invalid_timeout_rejected() {
        let (state, mut handler) = handler();
        let response = handler.handle_command(DebugCommand::SetUpdateConfig {
            max_textures_to_update: None,
            tile_timeout_seconds: Some(-1.0),
            defragment_heaps: None,
            trim_standby_tiles: None,
            release_empty_heaps: None,
            num_extra_standby_tiles: None,
            defrag_tiles_per_frame: None,
        });
        assert!(matches!(response, DebugResponse::Error { .. }));
        assert!(lock_state(&state).pending_config.is_none());
    }
}
