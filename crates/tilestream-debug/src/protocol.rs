//! Debug protocol - JSON command/response definitions

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Commands sent from a debug client to the debug server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "params")]
pub enum DebugCommand {
    /// Get residency statistics of the last completed frame
    GetStats,
    /// Get the per-frame update policy currently in effect
    GetUpdateConfig,
    /// Override parts of the per-frame update policy (only specified fields are updated)
    SetUpdateConfig {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_textures_to_update: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tile_timeout_seconds: Option<f32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        defragment_heaps: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trim_standby_tiles: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        release_empty_heaps: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        num_extra_standby_tiles: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        defrag_tiles_per_frame: Option<u32>,
    },
    /// List registered textures with their tile counts
    ListTextures,
    /// Ping (health check)
    Ping,
}

/// Responses from debug server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum DebugResponse {
    #[serde(rename = "ok")]
    Ok { data: ResponseData },
    #[serde(rename = "error")]
    Error { message: String },
}

/// Response data variants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseData {
    None,
    Pong { message: String },
    Stats(StatsInfo),
    UpdateConfig(UpdateConfigInfo),
    Textures { textures: Vec<TextureInfo> },
    ParamsUpdated { description: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsInfo {
    pub frame: u64,
    pub heap_allocation_bytes: u64,
    pub heap_count: u32,
    pub free_tiles_in_heaps: u32,
    pub tiles_total: u32,
    pub tiles_requested: u32,
    pub tiles_allocated: u32,
    pub tiles_standby: u32,
    pub cputime_begin_frame_ms: f64,
    pub cputime_update_tile_mappings_ms: f64,
    pub cputime_resolve_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateConfigInfo {
    pub max_textures_to_update: u32,
    pub tile_timeout_seconds: f32,
    pub defragment_heaps: bool,
    pub trim_standby_tiles: bool,
    pub release_empty_heaps: bool,
    pub num_extra_standby_tiles: u32,
    pub defrag_tiles_per_frame: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextureInfo {
    pub id: u32,
    pub width: u32,
    pub height: u32,
    pub tiles_total: u32,
    pub tiles_allocated: u32,
    pub tiles_standby: u32,
}

/// Failure to decode a command line
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty command line")]
    Empty,
    #[error("invalid command JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Parse one line of the line-delimited protocol
pub fn parse_command(line: &str) -> Result<DebugCommand, ProtocolError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(ProtocolError::Empty);
    }
    Ok(serde_json::from_str(trimmed)?)
}

impl DebugResponse {
    pub fn ok(data: ResponseData) -> Self {
        Self::Ok { data }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self::Error {
            message: msg.into(),
        }
    }

    pub fn pong() -> Self {
        Self::ok(ResponseData::Pong {
            message: "pong".into(),
        })
    }

    pub fn none() -> Self {
        Self::ok(ResponseData::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unit_command() {
        let cmd = parse_command(r#"{"cmd":"GetStats"}"#).unwrap();
        assert!(matches!(cmd, DebugCommand::GetStats));
    }

    #[test]
    fn test_parse_partial_update() {
        let cmd = parse_command(
            r#"{"cmd":"SetUpdateConfig","params":{"defragment_heaps":true,"tile_timeout_seconds":2.5}}"#,
        )
        .unwrap();
        match cmd {
            DebugCommand::SetUpdateConfig {
                defragment_heaps,
                tile_timeout_seconds,
                max_textures_to_update,
                ..
            } => {
                assert_eq!(defragment_heaps, Some(true));
                assert_eq!(tile_timeout_seconds, Some(2.5));
                assert_eq!(max_textures_to_update, None);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse_command("   "), Err(ProtocolError::Empty)));
        assert!(matches!(parse_command("{nope"), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn test_response_shape() {
        let json = serde_json::to_string(&DebugResponse::pong()).unwrap();
        assert_eq!(json, r#"{"status":"ok","data":{"message":"pong"}}"#);

        let json = serde_json::to_string(&DebugResponse::error("bad")).unwrap();
        assert_eq!(json, r#"{"status":"error","message":"bad"}"#);
    }
}
