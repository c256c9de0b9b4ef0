// Wire types for the Protect REST API.
//
// Every model keeps a `#[serde(flatten)]` catch-all so firmware additions
// are never silently dropped. Timestamps are millisecond epochs, as sent
// by the NVR.

use serde::{Deserialize, Serialize};

/// Full NVR state snapshot from `GET /bootstrap`.
///
/// Replaced wholesale on every fetch. `last_update_id` is the cursor used
/// to resume the realtime update stream after a reconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bootstrap {
    pub nvr: Nvr,

    /// Opaque cursor marking the point in the realtime stream already observed.
    pub last_update_id: String,

    /// Pre-signed key for snapshot/download URLs.
    #[serde(default)]
    pub access_key: Option<String>,

    #[serde(default)]
    pub cameras: Vec<Camera>,

    #[serde(flatten)]
    pub extra: serde_json::Value,
}

/// NVR descriptor embedded in the bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Nvr {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub ports: Option<NvrPorts>,

    #[serde(flatten)]
    pub extra: serde_json::Value,
}

impl Nvr {
    /// Display name fallback chain: name, then host, then id.
    pub fn display_name(&self) -> Option<&str> {
        self.name
            .as_deref()
            .or(self.host.as_deref())
            .or(self.id.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NvrPorts {
    #[serde(default)]
    pub rtsp: Option<u16>,

    #[serde(flatten)]
    pub extra: serde_json::Value,
}

/// One physical camera's last-known server-side state.
///
/// May lag the server between polls/events -- the realtime stream delivers
/// the deltas.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Camera {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    /// Hardware type string, e.g. `"UVC G4 Doorbell"`.
    #[serde(default, rename = "type")]
    pub camera_type: Option<String>,

    #[serde(default)]
    pub channels: Vec<CameraChannel>,

    #[serde(default)]
    pub recording_settings: Option<RecordingSettings>,

    #[serde(default)]
    pub is_recording: Option<bool>,

    #[serde(default)]
    pub is_mic_enabled: Option<bool>,

    #[serde(default)]
    pub mic_volume: Option<i64>,

    #[serde(default)]
    pub is_connected: Option<bool>,

    #[serde(default)]
    pub is_dark: Option<bool>,

    #[serde(default)]
    pub last_motion: Option<i64>,

    #[serde(default)]
    pub last_ring: Option<i64>,

    #[serde(flatten)]
    pub extra: serde_json::Value,
}

impl Camera {
    /// `true` for doorbell hardware, which has a 4:3 sensor instead of 16:9.
    pub fn is_doorbell(&self) -> bool {
        self.camera_type
            .as_deref()
            .is_some_and(|t| t.contains("Doorbell"))
    }

    /// Snapshot height for a requested width, honouring the sensor's
    /// aspect ratio (doorbells are 4:3, everything else 16:9).
    pub fn snapshot_height(&self, width: u32) -> u32 {
        if self.is_doorbell() {
            width / 4 * 3
        } else {
            width / 16 * 9
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraChannel {
    #[serde(default)]
    pub is_rtsp_enabled: bool,

    #[serde(default)]
    pub rtsp_alias: Option<String>,

    #[serde(flatten)]
    pub extra: serde_json::Value,
}

/// Recording settings sub-object. PATCHed back to the NVR whole, with only
/// `mode` rewritten, so unknown sibling fields must survive the round trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSettings {
    pub mode: String,

    #[serde(flatten)]
    pub extra: serde_json::Value,
}

/// One entry from `GET /events?type=motion`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MotionEvent {
    #[serde(default)]
    pub camera: Option<String>,

    #[serde(default)]
    pub start: Option<i64>,

    #[serde(default)]
    pub end: Option<i64>,

    #[serde(default)]
    pub score: Option<i64>,

    #[serde(default)]
    pub thumbnail: Option<String>,

    #[serde(default)]
    pub heatmap: Option<String>,

    #[serde(flatten)]
    pub extra: serde_json::Value,
}
