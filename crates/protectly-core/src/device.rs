// ── Camera device registry ──
//
// Paired cameras live in a registry keyed by the NVR's camera id. The
// dispatcher looks devices up here when a realtime update arrives;
// updates for cameras that were never paired are dropped at the door.
//
// `DeviceProxy` is the seam to the embedding application: it mirrors the
// NVR-side camera state (capabilities in home-automation terms) and is
// what the dispatcher writes through. `Trigger`s are the flows fired at
// the automation layer.

use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

/// Motion metadata attached to a motion-start trigger when available.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MotionDetail {
    pub score: Option<i64>,
    pub thumbnail: Option<String>,
    pub heatmap: Option<String>,
}

/// An automation flow fired by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    MotionStarted {
        device_id: String,
        at: i64,
        detail: MotionDetail,
    },
    MotionEnded {
        device_id: String,
        at: i64,
    },
    DoorbellRang {
        device_id: String,
        at: i64,
    },
    ConnectionChanged {
        device_id: String,
        connected: bool,
    },
}

impl Trigger {
    pub fn device_id(&self) -> &str {
        match self {
            Self::MotionStarted { device_id, .. }
            | Self::MotionEnded { device_id, .. }
            | Self::DoorbellRang { device_id, .. }
            | Self::ConnectionChanged { device_id, .. } => device_id,
        }
    }
}

/// Where fired triggers go. The embedding application implements this
/// (or uses [`ChannelTriggerSink`]) to route triggers into its flows.
pub trait TriggerSink: Send + Sync {
    fn fire(&self, trigger: Trigger);
}

/// Broadcast-channel trigger sink.
#[derive(Debug)]
pub struct ChannelTriggerSink {
    tx: broadcast::Sender<Trigger>,
}

impl ChannelTriggerSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Trigger> {
        self.tx.subscribe()
    }
}

impl TriggerSink for ChannelTriggerSink {
    fn fire(&self, trigger: Trigger) {
        // Send errors just mean no active subscribers right now.
        let _ = self.tx.send(trigger);
    }
}

// ── DeviceProxy ──────────────────────────────────────────────────────

/// Mirror of one paired camera's automation-facing state.
///
/// The dispatcher writes NVR state changes through these methods; the
/// `last_*` accessors feed its event deduplication.
pub trait DeviceProxy: Send + Sync {
    /// The NVR camera id this device is paired to.
    fn id(&self) -> &str;

    /// Timestamp (ms) of the newest motion event already handled.
    fn last_motion_at(&self) -> Option<i64>;

    /// Timestamp (ms) of the newest ring event already handled.
    fn last_ring_at(&self) -> Option<i64>;

    /// Last known connection state, if any update has been seen.
    fn connected(&self) -> Option<bool>;

    /// Whether a motion started event is still open.
    fn motion_active(&self) -> bool;

    /// Record a motion timestamp without treating it as a new event.
    /// Used to seed the baseline from the first observed value.
    fn seed_motion_at(&self, at: i64);

    /// Record a ring timestamp without treating it as a new event.
    fn seed_ring_at(&self, at: i64);

    fn on_motion_start(&self, at: i64, detail: &MotionDetail);
    fn on_motion_end(&self, at: i64);
    fn on_doorbell_ring(&self, at: i64);
    fn on_connection(&self, connected: bool);
    fn on_recording(&self, recording: bool);
    fn on_recording_mode(&self, mode: &str);
    fn on_mic_enabled(&self, enabled: bool);
    fn on_mic_volume(&self, volume: i64);
    fn on_dark(&self, dark: bool);
}

/// Lookup seam used by the dispatcher.
pub trait DeviceRegistry: Send + Sync {
    fn lookup_device(&self, id: &str) -> Option<Arc<dyn DeviceProxy>>;
}

/// Concurrent device table keyed by camera id.
#[derive(Default)]
pub struct DeviceTable {
    devices: DashMap<String, Arc<dyn DeviceProxy>>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device under its camera id, replacing any previous
    /// registration (re-pairing).
    pub fn register(&self, device: Arc<dyn DeviceProxy>) {
        debug!(device_id = device.id(), "registering device");
        self.devices.insert(device.id().to_owned(), device);
    }

    /// Remove a device (unpairing). Updates for it drop from then on.
    pub fn unregister(&self, id: &str) -> Option<Arc<dyn DeviceProxy>> {
        debug!(device_id = id, "unregistering device");
        self.devices.remove(id).map(|(_, device)| device)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl DeviceRegistry for DeviceTable {
    fn lookup_device(&self, id: &str) -> Option<Arc<dyn DeviceProxy>> {
        self.devices.get(id).map(|entry| Arc::clone(entry.value()))
    }
}

// ── CameraDevice ─────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
struct CameraState {
    motion_active: bool,
    last_motion_at: Option<i64>,
    last_ring_at: Option<i64>,
    connected: Option<bool>,
    recording: Option<bool>,
    recording_mode: Option<String>,
    mic_enabled: Option<bool>,
    mic_volume: Option<i64>,
    dark: Option<bool>,
}

/// In-memory [`DeviceProxy`] tracking one camera's automation state.
#[derive(Debug)]
pub struct CameraDevice {
    id: String,
    state: Mutex<CameraState>,
}

impl CameraDevice {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(CameraState::default()),
        }
    }

    pub fn recording(&self) -> Option<bool> {
        self.lock().recording
    }

    pub fn recording_mode(&self) -> Option<String> {
        self.lock().recording_mode.clone()
    }

    pub fn mic_enabled(&self) -> Option<bool> {
        self.lock().mic_enabled
    }

    pub fn mic_volume(&self) -> Option<i64> {
        self.lock().mic_volume
    }

    pub fn dark(&self) -> Option<bool> {
        self.lock().dark
    }

    fn lock(&self) -> MutexGuard<'_, CameraState> {
        // Plain data; a poisoned lock can't leave it torn.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl DeviceProxy for CameraDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn last_motion_at(&self) -> Option<i64> {
        self.lock().last_motion_at
    }

    fn last_ring_at(&self) -> Option<i64> {
        self.lock().last_ring_at
    }

    fn connected(&self) -> Option<bool> {
        self.lock().connected
    }

    fn motion_active(&self) -> bool {
        self.lock().motion_active
    }

    fn seed_motion_at(&self, at: i64) {
        self.lock().last_motion_at = Some(at);
    }

    fn seed_ring_at(&self, at: i64) {
        self.lock().last_ring_at = Some(at);
    }

    fn on_motion_start(&self, at: i64, _detail: &MotionDetail) {
        let mut state = self.lock();
        state.motion_active = true;
        state.last_motion_at = Some(at);
    }

    fn on_motion_end(&self, at: i64) {
        let mut state = self.lock();
        state.motion_active = false;
        // The dedup cursor only ever moves forward.
        state.last_motion_at = Some(state.last_motion_at.map_or(at, |last| last.max(at)));
    }

    fn on_doorbell_ring(&self, at: i64) {
        self.lock().last_ring_at = Some(at);
    }

    fn on_connection(&self, connected: bool) {
        self.lock().connected = Some(connected);
    }

    fn on_recording(&self, recording: bool) {
        self.lock().recording = Some(recording);
    }

    fn on_recording_mode(&self, mode: &str) {
        self.lock().recording_mode = Some(mode.to_owned());
    }

    fn on_mic_enabled(&self, enabled: bool) {
        self.lock().mic_enabled = Some(enabled);
    }

    fn on_mic_volume(&self, volume: i64) {
        self.lock().mic_volume = Some(volume);
    }

    fn on_dark(&self, dark: bool) {
        self.lock().dark = Some(dark);
    }
}
