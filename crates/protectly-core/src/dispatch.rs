// ── Realtime event dispatch ──
//
// Turns decoded camera update packets into device state changes and
// automation triggers. The dedup rules here are what keep the realtime
// stream and the REST motion poll from double-firing flows:
//
//   - motion/ring timestamps fire only when STRICTLY newer than the last
//     handled value; the first observed value seeds the baseline without
//     firing (events from before the integration started are history,
//     not news)
//   - level fields (recording, mic, dark, recording mode) are applied on
//     every update
//   - connection state is applied on every update but triggers only on
//     an actual change

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, trace};

use protectly_api::frames::UpdatePacket;
use protectly_api::models::MotionEvent;

use crate::device::{DeviceProxy, DeviceRegistry, MotionDetail, Trigger, TriggerSink};

/// Fan-out point between the realtime stream and the automation layer:
/// routes camera updates to registered devices and fires triggers.
pub struct EventDispatcher {
    registry: Arc<dyn DeviceRegistry>,
    sink: Arc<dyn TriggerSink>,
}

impl EventDispatcher {
    pub fn new(registry: Arc<dyn DeviceRegistry>, sink: Arc<dyn TriggerSink>) -> Self {
        Self { registry, sink }
    }

    /// Dispatch one realtime update packet.
    ///
    /// Updates for unregistered cameras are dropped. Non-camera packets
    /// are ignored (the listener filters them already; this is the
    /// contract, not an optimization).
    pub fn dispatch(&self, packet: &UpdatePacket) {
        if !packet.is_camera_update() {
            return;
        }
        let Some(payload) = packet.payload.as_json() else {
            trace!(id = %packet.action.id, "camera update without a JSON payload, dropping");
            return;
        };
        let Some(device) = self.registry.lookup_device(&packet.action.id) else {
            debug!(device_id = %packet.action.id, "update for an unpaired camera, dropping");
            return;
        };

        self.apply_levels(&*device, payload);

        if let Some(last_motion) = payload.get("lastMotion").and_then(Value::as_i64) {
            // Only an explicit isMotionDetected=true opens a motion; an
            // absent flag means the motion is already over.
            if payload.get("isMotionDetected").and_then(Value::as_bool) == Some(true) {
                self.apply_motion_start(&*device, last_motion, motion_detail(payload));
            } else {
                self.apply_motion_end(&*device, last_motion);
            }
        }
        if let Some(last_ring) = payload.get("lastRing").and_then(Value::as_i64) {
            self.apply_ring(&*device, last_ring);
        }
    }

    /// Dispatch one motion event from the REST motion poll.
    ///
    /// Same dedup rules as the realtime path, so a motion seen on the
    /// socket never re-fires when the poll catches up with it.
    pub fn dispatch_motion_event(&self, event: &MotionEvent) {
        let Some(camera_id) = event.camera.as_deref() else {
            return;
        };
        let Some(device) = self.registry.lookup_device(camera_id) else {
            return;
        };

        let detail = MotionDetail {
            score: event.score,
            thumbnail: event.thumbnail.clone(),
            heatmap: event.heatmap.clone(),
        };

        // An open event (no end yet) is a motion start; a completed one
        // ends any motion currently active on the device.
        match (event.start, event.end) {
            (Some(start), None) => self.apply_motion_start(&*device, start, detail),
            (_, Some(end)) => self.apply_motion_end(&*device, end),
            (None, None) => {}
        }
    }

    // ── Level-triggered fields ───────────────────────────────────────

    fn apply_levels(&self, device: &dyn DeviceProxy, payload: &Value) {
        if let Some(recording) = payload.get("isRecording").and_then(Value::as_bool) {
            device.on_recording(recording);
        }
        if let Some(enabled) = payload.get("isMicEnabled").and_then(Value::as_bool) {
            device.on_mic_enabled(enabled);
        }
        if let Some(volume) = payload.get("micVolume").and_then(Value::as_i64) {
            device.on_mic_volume(volume);
        }
        if let Some(dark) = payload.get("isDark").and_then(Value::as_bool) {
            device.on_dark(dark);
        }
        if let Some(mode) = payload
            .pointer("/recordingSettings/mode")
            .and_then(Value::as_str)
        {
            device.on_recording_mode(mode);
        }
        if let Some(connected) = payload.get("isConnected").and_then(Value::as_bool) {
            let changed = device.connected() != Some(connected);
            device.on_connection(connected);
            if changed {
                self.sink.fire(Trigger::ConnectionChanged {
                    device_id: device.id().to_owned(),
                    connected,
                });
            }
        }
    }

    // ── Edge-triggered events ────────────────────────────────────────

    fn apply_motion_start(&self, device: &dyn DeviceProxy, at: i64, detail: MotionDetail) {
        match device.last_motion_at() {
            None => {
                trace!(device_id = device.id(), at, "seeding motion baseline");
                device.seed_motion_at(at);
            }
            Some(last) if at > last => {
                debug!(device_id = device.id(), at, "motion detected");
                device.on_motion_start(at, &detail);
                self.sink.fire(Trigger::MotionStarted {
                    device_id: device.id().to_owned(),
                    at,
                    detail,
                });
            }
            // Replay or out-of-order delivery; already handled.
            Some(_) => {}
        }
    }

    fn apply_motion_end(&self, device: &dyn DeviceProxy, at: i64) {
        match device.last_motion_at() {
            None => {
                trace!(device_id = device.id(), at, "seeding motion baseline");
                device.seed_motion_at(at);
            }
            Some(last) if at > last => {
                if device.motion_active() {
                    debug!(device_id = device.id(), at, "motion ended");
                    device.on_motion_end(at);
                    self.sink.fire(Trigger::MotionEnded {
                        device_id: device.id().to_owned(),
                        at,
                    });
                } else {
                    // The start happened before we were watching; just
                    // advance the cursor.
                    device.seed_motion_at(at);
                }
            }
            // Replay or out-of-order delivery; the cursor never moves
            // backwards.
            Some(_) => {}
        }
    }

    fn apply_ring(&self, device: &dyn DeviceProxy, at: i64) {
        match device.last_ring_at() {
            None => {
                trace!(device_id = device.id(), at, "seeding ring baseline");
                device.seed_ring_at(at);
            }
            Some(last) if at > last => {
                debug!(device_id = device.id(), at, "doorbell rang");
                device.on_doorbell_ring(at);
                self.sink.fire(Trigger::DoorbellRang {
                    device_id: device.id().to_owned(),
                    at,
                });
            }
            Some(_) => {}
        }
    }
}

fn motion_detail(payload: &Value) -> MotionDetail {
    MotionDetail {
        score: payload.get("score").and_then(Value::as_i64),
        thumbnail: payload
            .get("thumbnail")
            .and_then(Value::as_str)
            .map(str::to_owned),
        heatmap: payload
            .get("heatmap")
            .and_then(Value::as_str)
            .map(str::to_owned),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use pretty_assertions::assert_eq;
    use protectly_api::frames::{ActionFrame, UpdatePayload};

    use crate::device::{CameraDevice, DeviceTable};

    #[derive(Default)]
    struct RecordingSink {
        fired: Mutex<Vec<Trigger>>,
    }

    impl RecordingSink {
        fn take(&self) -> Vec<Trigger> {
            std::mem::take(&mut self.fired.lock().unwrap())
        }
    }

    impl TriggerSink for RecordingSink {
        fn fire(&self, trigger: Trigger) {
            self.fired.lock().unwrap().push(trigger);
        }
    }

    struct Fixture {
        dispatcher: EventDispatcher,
        device: Arc<CameraDevice>,
        sink: Arc<RecordingSink>,
    }

    fn fixture() -> Fixture {
        let table = Arc::new(DeviceTable::new());
        let device = Arc::new(CameraDevice::new("cam-1"));
        table.register(Arc::clone(&device) as Arc<dyn DeviceProxy>);

        let sink = Arc::new(RecordingSink::default());
        let dispatcher = EventDispatcher::new(
            Arc::clone(&table) as Arc<dyn DeviceRegistry>,
            Arc::clone(&sink) as Arc<dyn TriggerSink>,
        );

        Fixture {
            dispatcher,
            device,
            sink,
        }
    }

    fn camera_update(id: &str, payload: serde_json::Value) -> UpdatePacket {
        UpdatePacket {
            action: ActionFrame {
                action: "update".into(),
                id: id.into(),
                model_key: "camera".into(),
                new_update_id: None,
            },
            payload: UpdatePayload::Json(payload),
        }
    }

    #[test]
    fn first_motion_seeds_the_baseline_without_firing() {
        let fx = fixture();

        fx.dispatcher
            .dispatch(&camera_update("cam-1", serde_json::json!({ "lastMotion": 100 })));

        assert_eq!(fx.device.last_motion_at(), Some(100));
        assert!(!fx.device.motion_active());
        assert_eq!(fx.sink.take(), vec![]);
    }

    #[test]
    fn strictly_newer_motion_fires_once_with_detail() {
        let fx = fixture();
        fx.device.seed_motion_at(100);

        let payload = serde_json::json!({
            "lastMotion": 200,
            "isMotionDetected": true,
            "score": 91,
            "thumbnail": "e-abc/thumbnail",
            "heatmap": "e-abc/heatmap",
        });
        fx.dispatcher.dispatch(&camera_update("cam-1", payload.clone()));

        let fired = fx.sink.take();
        assert_eq!(fired.len(), 1);
        assert!(matches!(
            &fired[0],
            Trigger::MotionStarted { at: 200, detail, .. }
                if detail.score == Some(91)
                    && detail.thumbnail.as_deref() == Some("e-abc/thumbnail")
                    && detail.heatmap.as_deref() == Some("e-abc/heatmap")
        ));
        assert!(fx.device.motion_active());

        // A replay of the same timestamp fires nothing.
        fx.dispatcher.dispatch(&camera_update("cam-1", payload));
        assert_eq!(fx.sink.take(), vec![]);
        assert!(fx.device.motion_active());
    }

    #[test]
    fn motion_end_flag_closes_an_active_motion() {
        let fx = fixture();
        fx.device.seed_motion_at(100);

        fx.dispatcher.dispatch(&camera_update(
            "cam-1",
            serde_json::json!({ "lastMotion": 200, "isMotionDetected": true }),
        ));
        assert!(fx.device.motion_active());
        fx.sink.take();

        fx.dispatcher.dispatch(&camera_update(
            "cam-1",
            serde_json::json!({ "lastMotion": 250, "isMotionDetected": false }),
        ));
        assert_eq!(
            fx.sink.take(),
            vec![Trigger::MotionEnded {
                device_id: "cam-1".into(),
                at: 250,
            }]
        );
        assert!(!fx.device.motion_active());

        // Ending again is a no-op.
        fx.dispatcher.dispatch(&camera_update(
            "cam-1",
            serde_json::json!({ "lastMotion": 250, "isMotionDetected": false }),
        ));
        assert_eq!(fx.sink.take(), vec![]);
    }

    #[test]
    fn older_motion_never_fires_a_start() {
        let fx = fixture();
        fx.device.seed_motion_at(300);

        fx.dispatcher.dispatch(&camera_update(
            "cam-1",
            serde_json::json!({ "lastMotion": 200, "isMotionDetected": true }),
        ));

        assert_eq!(fx.sink.take(), vec![]);
        assert_eq!(fx.device.last_motion_at(), Some(300));
    }

    #[test]
    fn stale_motion_end_never_regresses_the_cursor() {
        let fx = fixture();
        fx.device.seed_motion_at(100);

        fx.dispatcher.dispatch(&camera_update(
            "cam-1",
            serde_json::json!({ "lastMotion": 200, "isMotionDetected": true }),
        ));
        assert_eq!(fx.sink.take().len(), 1);
        assert!(fx.device.motion_active());

        // An out-of-order end from before the current motion: dropped,
        // the motion stays open and the cursor stays put.
        fx.dispatcher.dispatch(&camera_update(
            "cam-1",
            serde_json::json!({ "lastMotion": 150, "isMotionDetected": false }),
        ));
        assert_eq!(fx.sink.take(), vec![]);
        assert!(fx.device.motion_active());
        assert_eq!(fx.device.last_motion_at(), Some(200));

        // So a replay of the original start still cannot re-fire.
        fx.dispatcher.dispatch(&camera_update(
            "cam-1",
            serde_json::json!({ "lastMotion": 200, "isMotionDetected": true }),
        ));
        assert_eq!(fx.sink.take(), vec![]);
    }

    #[test]
    fn timestamp_without_a_detection_flag_is_an_end() {
        let fx = fixture();
        fx.device.seed_motion_at(100);

        fx.dispatcher.dispatch(&camera_update(
            "cam-1",
            serde_json::json!({ "lastMotion": 200, "isMotionDetected": true }),
        ));
        assert_eq!(fx.sink.take().len(), 1);

        fx.dispatcher
            .dispatch(&camera_update("cam-1", serde_json::json!({ "lastMotion": 260 })));
        assert_eq!(
            fx.sink.take(),
            vec![Trigger::MotionEnded {
                device_id: "cam-1".into(),
                at: 260,
            }]
        );
        assert!(!fx.device.motion_active());

        // With no motion open, a newer bare timestamp only advances the
        // cursor.
        fx.dispatcher
            .dispatch(&camera_update("cam-1", serde_json::json!({ "lastMotion": 300 })));
        assert_eq!(fx.sink.take(), vec![]);
        assert_eq!(fx.device.last_motion_at(), Some(300));
    }

    #[test]
    fn ring_fires_only_when_strictly_newer() {
        let fx = fixture();

        // Baseline seed, no trigger.
        fx.dispatcher
            .dispatch(&camera_update("cam-1", serde_json::json!({ "lastRing": 100 })));
        assert_eq!(fx.sink.take(), vec![]);

        fx.dispatcher
            .dispatch(&camera_update("cam-1", serde_json::json!({ "lastRing": 150 })));
        assert_eq!(
            fx.sink.take(),
            vec![Trigger::DoorbellRang {
                device_id: "cam-1".into(),
                at: 150,
            }]
        );

        // Replay: nothing.
        fx.dispatcher
            .dispatch(&camera_update("cam-1", serde_json::json!({ "lastRing": 150 })));
        assert_eq!(fx.sink.take(), vec![]);
    }

    #[test]
    fn level_fields_apply_on_every_update() {
        let fx = fixture();

        fx.dispatcher.dispatch(&camera_update(
            "cam-1",
            serde_json::json!({
                "isRecording": true,
                "isMicEnabled": false,
                "micVolume": 42,
                "isDark": true,
                "recordingSettings": { "mode": "motion" },
            }),
        ));

        assert_eq!(fx.device.recording(), Some(true));
        assert_eq!(fx.device.mic_enabled(), Some(false));
        assert_eq!(fx.device.mic_volume(), Some(42));
        assert_eq!(fx.device.dark(), Some(true));
        assert_eq!(fx.device.recording_mode(), Some("motion".into()));
        // None of these are trigger-bearing.
        assert_eq!(fx.sink.take(), vec![]);
    }

    #[test]
    fn connection_triggers_only_on_change() {
        let fx = fixture();

        fx.dispatcher
            .dispatch(&camera_update("cam-1", serde_json::json!({ "isConnected": true })));
        // First observation is a change from "unknown".
        assert_eq!(fx.sink.take().len(), 1);

        fx.dispatcher
            .dispatch(&camera_update("cam-1", serde_json::json!({ "isConnected": true })));
        assert_eq!(fx.sink.take(), vec![]);

        fx.dispatcher
            .dispatch(&camera_update("cam-1", serde_json::json!({ "isConnected": false })));
        assert_eq!(
            fx.sink.take(),
            vec![Trigger::ConnectionChanged {
                device_id: "cam-1".into(),
                connected: false,
            }]
        );
    }

    #[test]
    fn updates_for_unpaired_cameras_are_dropped() {
        let fx = fixture();

        fx.dispatcher
            .dispatch(&camera_update("cam-2", serde_json::json!({ "lastRing": 999 })));

        assert_eq!(fx.sink.take(), vec![]);
        assert_eq!(fx.device.last_ring_at(), None);
    }

    #[test]
    fn polled_motion_events_share_the_dedup_state() {
        let fx = fixture();
        fx.device.seed_motion_at(100);

        // An open motion event from the REST poll starts motion.
        let open: MotionEvent = serde_json::from_value(serde_json::json!({
            "camera": "cam-1",
            "start": 150,
            "score": 87,
        }))
        .unwrap();
        fx.dispatcher.dispatch_motion_event(&open);

        let fired = fx.sink.take();
        assert_eq!(fired.len(), 1);
        assert!(matches!(
            &fired[0],
            Trigger::MotionStarted { at: 150, detail, .. } if detail.score == Some(87)
        ));

        // The realtime path sees the same motion; nothing new fires.
        fx.dispatcher
            .dispatch(&camera_update("cam-1", serde_json::json!({ "lastMotion": 150 })));
        assert_eq!(fx.sink.take(), vec![]);

        // The completed event from the next poll ends it.
        let completed: MotionEvent = serde_json::from_value(serde_json::json!({
            "camera": "cam-1",
            "start": 150,
            "end": 180,
        }))
        .unwrap();
        fx.dispatcher.dispatch_motion_event(&completed);
        assert_eq!(
            fx.sink.take(),
            vec![Trigger::MotionEnded {
                device_id: "cam-1".into(),
                at: 180,
            }]
        );
    }
}
