// protectly-core: Domain layer between protectly-api and consumers
// (home-automation integrations). Owns the controller lifecycle, the
// camera device registry, and realtime event dispatch.

pub mod config;
pub mod controller;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod settings;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::{ControllerConfig, NvrCredentials, TlsVerification};
pub use controller::{ConnectionState, ProtectController};
pub use device::{
    CameraDevice, ChannelTriggerSink, DeviceProxy, DeviceRegistry, DeviceTable, MotionDetail,
    Trigger, TriggerSink,
};
pub use dispatch::EventDispatcher;
pub use error::CoreError;
pub use settings::{MemorySettingsStore, SettingsStore, StoredCredentials, SETTING_CREDENTIALS};

// Wire types are part of the public surface (camera snapshots, motion
// events). Re-export them so consumers don't need protectly-api directly.
pub use protectly_api::models::{Bootstrap, Camera, MotionEvent, Nvr, RecordingSettings};
