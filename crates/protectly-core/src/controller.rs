// ── Controller abstraction ──
//
// Full lifecycle management for a Protect NVR connection: login,
// bootstrap, periodic session refresh, the realtime update stream, and
// the camera operations consumers call.
//
// Ordering invariant: the update listener never connects before a
// bootstrap has been fetched -- the resume watch channel starts at
// `None` and every bootstrap fetch publishes exactly one fresh
// `ResumeState`, which is also what tears down a live socket when the
// resume cursor rotates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use secrecy::SecretString;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use protectly_api::client::PROTECT_API_PREFIX;
use protectly_api::frames::UpdatePacket;
use protectly_api::models::{Bootstrap, Camera, MotionEvent, Nvr};
use protectly_api::realtime::{self, ResumeState, UpdateListener};
use protectly_api::transport::{TlsMode, TransportConfig};
use protectly_api::ProtectClient;
use url::Url;

use crate::config::{ControllerConfig, NvrCredentials, TlsVerification};
use crate::device::{DeviceRegistry, TriggerSink};
use crate::dispatch::EventDispatcher;
use crate::error::CoreError;
use crate::settings::{SettingsStore, StoredCredentials, SETTING_CREDENTIALS};

/// RTSP port when the bootstrap doesn't say otherwise.
const DEFAULT_RTSP_PORT: u16 = 7447;

// ── ConnectionState ──────────────────────────────────────────────

/// Connection state observable by consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

// ── ProtectController ────────────────────────────────────────────

/// The main entry point for consumers.
///
/// Cheaply cloneable via `Arc`. Owns the session, the realtime update
/// stream, and event dispatch into the device registry.
#[derive(Clone)]
pub struct ProtectController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    config: ControllerConfig,
    client: ProtectClient,
    dispatcher: EventDispatcher,
    settings: Option<Arc<dyn SettingsStore>>,
    bootstrap: RwLock<Option<Arc<Bootstrap>>>,
    resume_tx: watch::Sender<Option<ResumeState>>,
    connection_state: watch::Sender<ConnectionState>,
    /// Set while connect() has succeeded and disconnect() hasn't run.
    /// The refresh task no-ops (but keeps rescheduling) when unset.
    session_active: AtomicBool,
    /// Cancels the background tasks. disconnect() burns the current
    /// token, so connect() mints a fresh one before spawning.
    cancel: std::sync::Mutex<CancellationToken>,
    listener: Mutex<Option<UpdateListener>>,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ProtectController {
    /// Create a controller from configuration. Does NOT connect --
    /// call [`connect()`](Self::connect) to log in and start background
    /// tasks.
    pub fn new(
        config: ControllerConfig,
        registry: Arc<dyn DeviceRegistry>,
        sink: Arc<dyn TriggerSink>,
    ) -> Result<Self, CoreError> {
        let transport = TransportConfig {
            tls: tls_to_transport(&config.tls),
            timeout: config.timeout,
        };
        let client = ProtectClient::new(config.url.clone(), &transport)?;

        let dispatcher = EventDispatcher::new(registry, sink);
        let (resume_tx, _) = watch::channel(None);
        let (connection_state, _) = watch::channel(ConnectionState::Disconnected);

        Ok(Self {
            inner: Arc::new(ControllerInner {
                config,
                client,
                dispatcher,
                settings: None,
                bootstrap: RwLock::new(None),
                resume_tx,
                connection_state,
                session_active: AtomicBool::new(false),
                cancel: std::sync::Mutex::new(CancellationToken::new()),
                listener: Mutex::new(None),
                task_handles: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Attach a settings store. Credentials are then read from it at
    /// every login (falling back to the config), and a credential change
    /// triggers an immediate re-login.
    ///
    /// Must be called before [`connect()`](Self::connect).
    pub fn with_settings(mut self, settings: Arc<dyn SettingsStore>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.settings = Some(settings),
            // Clones exist already; attaching now couldn't take effect.
            None => warn!("settings store attached after the controller was shared, ignoring"),
        }
        self
    }

    /// Access the controller configuration.
    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    // ── Connection lifecycle ─────────────────────────────────────

    /// Connect to the NVR.
    ///
    /// Logs in, fetches the bootstrap, and spawns background tasks
    /// (session refresh, realtime listener, event dispatch, settings
    /// watcher).
    pub async fn connect(&self) -> Result<(), CoreError> {
        let _ = self
            .inner
            .connection_state
            .send(ConnectionState::Connecting);

        if let Err(e) = self.establish_session().await {
            let _ = self.inner.connection_state.send(ConnectionState::Failed);
            return Err(e);
        }
        self.inner.session_active.store(true, Ordering::SeqCst);

        // Spawn background tasks unless they are already running (a
        // repeat connect() on a live controller reuses them).
        let mut listener_guard = self.inner.listener.lock().await;
        if listener_guard.is_none() {
            let cancel = self.renew_cancel_token();
            let listener = UpdateListener::spawn(
                self.inner.resume_tx.subscribe(),
                self.inner.config.listener.clone(),
                cancel.child_token(),
            );
            let packets = listener.subscribe();
            *listener_guard = Some(listener);
            drop(listener_guard);

            let mut handles = self.inner.task_handles.lock().await;
            handles.push(tokio::spawn(dispatch_task(
                self.clone(),
                packets,
                cancel.child_token(),
            )));
            handles.push(tokio::spawn(refresh_task(
                self.clone(),
                cancel.child_token(),
            )));
            if let Some(store) = &self.inner.settings {
                handles.push(tokio::spawn(settings_task(
                    self.clone(),
                    store.subscribe(),
                    cancel.child_token(),
                )));
            }
        }

        let _ = self.inner.connection_state.send(ConnectionState::Connected);
        info!("connected to the NVR");
        Ok(())
    }

    /// Disconnect from the NVR.
    ///
    /// Cancels background tasks, drops the session token wholesale, and
    /// resets the state to [`Disconnected`](ConnectionState::Disconnected).
    pub async fn disconnect(&self) {
        self.inner.session_active.store(false, Ordering::SeqCst);
        self.cancel_token().cancel();

        if let Some(listener) = self.inner.listener.lock().await.take() {
            listener.shutdown();
        }

        let mut handles = self.inner.task_handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        drop(handles);

        self.inner.client.invalidate_session();
        self.inner.resume_tx.send_replace(None);
        let _ = self
            .inner
            .connection_state
            .send(ConnectionState::Disconnected);
        debug!("disconnected");
    }

    /// Log in and fetch a fresh bootstrap.
    ///
    /// This is the whole session-establishment path; the periodic
    /// refresh and the credential-change hook both run it.
    pub async fn establish_session(&self) -> Result<(), CoreError> {
        let creds = self.credentials();
        self.inner
            .client
            .login(&creds.username, &creds.password)
            .await?;
        self.refresh_bootstrap().await?;
        Ok(())
    }

    /// Fetch the bootstrap, capture the access key, and publish the
    /// resume state for the realtime listener.
    ///
    /// Exactly one resume publication per fetch: a live socket is torn
    /// down and reconnected with the fresh `lastUpdateId` cursor.
    pub async fn refresh_bootstrap(&self) -> Result<Arc<Bootstrap>, CoreError> {
        let bootstrap: Bootstrap = self.inner.client.get_json("bootstrap", &[]).await?;
        self.inner
            .client
            .set_access_key(bootstrap.access_key.clone());

        let cookie = self
            .inner
            .client
            .cookie()
            .ok_or(CoreError::AuthenticationFailed {
                message: "session token vanished during bootstrap".into(),
            })?;
        let updates_url = realtime::updates_url(self.inner.client.base_url(), &bootstrap.last_update_id)?;

        let bootstrap = Arc::new(bootstrap);
        *self.write_bootstrap() = Some(Arc::clone(&bootstrap));

        self.inner.resume_tx.send_replace(Some(ResumeState {
            updates_url,
            cookie,
        }));

        debug!(
            cameras = bootstrap.cameras.len(),
            last_update_id = %bootstrap.last_update_id,
            "bootstrap refreshed"
        );
        Ok(bootstrap)
    }

    // ── State observation ────────────────────────────────────────

    /// Subscribe to connection state changes.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection_state.subscribe()
    }

    /// The last fetched bootstrap, if any.
    pub fn bootstrap(&self) -> Option<Arc<Bootstrap>> {
        self.read_bootstrap().clone()
    }

    /// Display name of the NVR from the last bootstrap.
    pub fn nvr_name(&self) -> Option<String> {
        self.read_bootstrap()
            .as_ref()
            .and_then(|b| b.nvr.display_name().map(str::to_owned))
    }

    // ── Camera operations ────────────────────────────────────────

    /// List all cameras known to the NVR.
    pub async fn get_cameras(&self) -> Result<Vec<Camera>, CoreError> {
        self.with_session_retry(|| self.inner.client.get_json("cameras", &[]))
            .await
    }

    /// Fetch one camera by id.
    pub async fn find_camera(&self, id: &str) -> Result<Camera, CoreError> {
        let resource = format!("cameras/{id}");
        match self
            .with_session_retry(|| self.inner.client.get_json(&resource, &[]))
            .await
        {
            Ok(camera) => Ok(camera),
            Err(CoreError::Api {
                status: Some(404), ..
            }) => Err(CoreError::CameraNotFound {
                identifier: id.to_owned(),
            }),
            Err(e) => Err(e),
        }
    }

    /// Fetch the NVR descriptor.
    pub async fn get_server(&self) -> Result<Nvr, CoreError> {
        self.with_session_retry(|| self.inner.client.get_json("nvr", &[]))
            .await
    }

    /// Fetch today's motion events.
    pub async fn get_motion_events(&self) -> Result<Vec<MotionEvent>, CoreError> {
        let (start, end) = today_window();
        let params = [
            ("start", start.to_string()),
            ("end", end.to_string()),
            ("type", "motion".into()),
        ];
        self.with_session_retry(|| self.inner.client.get_json("events", &params))
            .await
    }

    /// Fetch today's motion events and run them through the dispatcher.
    ///
    /// Shares dedup state with the realtime stream, so this is safe to
    /// call on a timer alongside it.
    pub async fn poll_motion_events(&self) -> Result<(), CoreError> {
        let events = self.get_motion_events().await?;
        for event in &events {
            self.inner.dispatcher.dispatch_motion_event(event);
        }
        Ok(())
    }

    /// Change a camera's recording mode (`"always"`, `"motion"`, `"never"`).
    ///
    /// The NVR wants the whole `recordingSettings` object back, so the
    /// current one is fetched and only `mode` rewritten.
    pub async fn set_recording_mode(&self, camera_id: &str, mode: &str) -> Result<(), CoreError> {
        let camera = self.find_camera(camera_id).await?;
        let mut settings = camera
            .recording_settings
            .ok_or_else(|| CoreError::OperationFailed {
                message: format!("camera {camera_id} has no recording settings"),
            })?;
        settings.mode = mode.to_owned();

        let resource = format!("cameras/{camera_id}");
        let payload = serde_json::json!({ "recordingSettings": settings });
        self.with_session_retry(|| self.inner.client.patch(&resource, &payload))
            .await?;
        info!(camera_id, mode, "recording mode changed");
        Ok(())
    }

    /// Change a camera's microphone volume (0-100).
    pub async fn set_mic_volume(&self, camera_id: &str, volume: i64) -> Result<(), CoreError> {
        let resource = format!("cameras/{camera_id}");
        let payload = serde_json::json!({ "micVolume": volume });
        self.with_session_retry(|| self.inner.client.patch(&resource, &payload))
            .await?;
        info!(camera_id, volume, "microphone volume changed");
        Ok(())
    }

    /// Fetch a JPEG snapshot at the given width; height follows the
    /// camera's aspect ratio.
    pub async fn snapshot(&self, camera_id: &str, width: u32) -> Result<Vec<u8>, CoreError> {
        let camera = self.find_camera(camera_id).await?;
        let height = camera.snapshot_height(width);
        let resource = format!("cameras/{camera_id}/snapshot");
        let params = [
            ("w", width.to_string()),
            ("h", height.to_string()),
            ("force", "true".into()),
        ];
        self.with_session_retry(|| self.inner.client.download(&resource, &params))
            .await
    }

    /// Build a direct snapshot URL (for image entities that fetch on
    /// their own). Carries the pre-signed access key and a cache-busting
    /// timestamp.
    pub fn snapshot_url(&self, camera: &Camera, width: u32) -> Result<Url, CoreError> {
        let access_key = self
            .inner
            .client
            .access_key()
            .ok_or(CoreError::NotBootstrapped)?;

        let mut url = self
            .inner
            .client
            .base_url()
            .join(&format!("{PROTECT_API_PREFIX}/cameras/{}/snapshot", camera.id))
            .map_err(|e| CoreError::Config {
                message: format!("Invalid snapshot URL: {e}"),
            })?;
        url.query_pairs_mut()
            .append_pair("accessKey", &access_key)
            .append_pair("w", &width.to_string())
            .append_pair("h", &camera.snapshot_height(width).to_string())
            .append_pair("force", "true")
            .append_pair("ts", &chrono::Utc::now().timestamp_millis().to_string());
        Ok(url)
    }

    /// RTSP stream URL for a camera, from its first RTSP-enabled
    /// channel. `None` when RTSP is disabled on every channel.
    pub async fn stream_url(&self, camera_id: &str) -> Result<Option<String>, CoreError> {
        let camera = self.find_camera(camera_id).await?;
        let Some(alias) = camera
            .channels
            .iter()
            .find(|c| c.is_rtsp_enabled)
            .and_then(|c| c.rtsp_alias.clone())
        else {
            return Ok(None);
        };

        let bootstrap = self.bootstrap().ok_or(CoreError::NotBootstrapped)?;
        let host = bootstrap
            .nvr
            .host
            .clone()
            .or_else(|| self.inner.client.base_url().host_str().map(str::to_owned))
            .ok_or_else(|| CoreError::Config {
                message: "NVR host unknown".into(),
            })?;
        let port = bootstrap
            .nvr
            .ports
            .as_ref()
            .and_then(|p| p.rtsp)
            .unwrap_or(DEFAULT_RTSP_PORT);

        Ok(Some(format!("rtsp://{host}:{port}/{alias}")))
    }

    // ── Helpers ──────────────────────────────────────────────────

    /// Credentials for login: settings store first, config fallback.
    fn credentials(&self) -> NvrCredentials {
        if let Some(store) = &self.inner.settings {
            if let Some(value) = store.get(SETTING_CREDENTIALS) {
                match serde_json::from_value::<StoredCredentials>(value) {
                    Ok(stored) => {
                        return NvrCredentials {
                            username: stored.username,
                            password: SecretString::from(stored.password),
                        };
                    }
                    Err(e) => warn!(error = %e, "stored credentials are malformed, using config"),
                }
            }
        }
        self.inner.config.credentials.clone()
    }

    /// Run a client call, logging in again and retrying once if it
    /// failed because the session expired server-side. Errors from a
    /// controller that was never connected pass through untouched.
    async fn with_session_retry<T, F, Fut>(&self, op: F) -> Result<T, CoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, protectly_api::Error>>,
    {
        match op().await {
            Ok(value) => Ok(value),
            Err(e) if e.is_auth_expired() && self.inner.session_active.load(Ordering::SeqCst) => {
                info!(error = %e, "session expired, logging in again");
                self.establish_session().await?;
                Ok(op().await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn cancel_token(&self) -> CancellationToken {
        self.inner
            .cancel
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Current token, or a fresh one if disconnect() cancelled it.
    fn renew_cancel_token(&self) -> CancellationToken {
        let mut cancel = self
            .inner
            .cancel
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if cancel.is_cancelled() {
            *cancel = CancellationToken::new();
        }
        cancel.clone()
    }

    fn read_bootstrap(&self) -> RwLockReadGuard<'_, Option<Arc<Bootstrap>>> {
        self.inner
            .bootstrap
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_bootstrap(&self) -> RwLockWriteGuard<'_, Option<Arc<Bootstrap>>> {
        self.inner
            .bootstrap
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

// ── Background tasks ─────────────────────────────────────────────

/// Re-establish the session and bootstrap on a fixed cadence.
///
/// The cookie expires server-side; refreshing before that keeps the
/// realtime stream and REST calls alive indefinitely. The task never
/// stops rescheduling -- a failed refresh is retried at the next tick.
async fn refresh_task(controller: ProtectController, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(controller.inner.config.session_refresh_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if !controller.inner.session_active.load(Ordering::SeqCst) {
                    debug!("no active session, skipping refresh");
                    continue;
                }
                match controller.establish_session().await {
                    Ok(()) => {
                        debug!("session refreshed");
                        let _ = controller.inner.connection_state.send(ConnectionState::Connected);
                    }
                    Err(e) => {
                        warn!(error = %e, "session refresh failed, will retry at the next interval");
                        let _ = controller.inner.connection_state.send(ConnectionState::Failed);
                    }
                }
            }
        }
    }
}

/// Feed decoded realtime packets into the dispatcher.
async fn dispatch_task(
    controller: ProtectController,
    mut packets: broadcast::Receiver<Arc<UpdatePacket>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            packet = packets.recv() => match packet {
                Ok(packet) => controller.inner.dispatcher.dispatch(&packet),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event dispatch fell behind the update stream");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

/// Re-login immediately when the stored credentials change.
async fn settings_task(
    controller: ProtectController,
    mut changes: broadcast::Receiver<String>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            key = changes.recv() => match key {
                Ok(key) if key == SETTING_CREDENTIALS => {
                    info!("credentials changed, re-establishing the session");
                    if let Err(e) = controller.establish_session().await {
                        warn!(error = %e, "re-login with the new credentials failed");
                        let _ = controller.inner.connection_state.send(ConnectionState::Failed);
                    } else {
                        let _ = controller.inner.connection_state.send(ConnectionState::Connected);
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────

fn tls_to_transport(tls: &TlsVerification) -> TlsMode {
    match tls {
        TlsVerification::SystemDefaults => TlsMode::System,
        TlsVerification::CustomCa(path) => TlsMode::CustomCa(path.clone()),
        TlsVerification::DangerAcceptInvalid => TlsMode::DangerAcceptInvalid,
    }
}

/// Millisecond window covering the local calendar day.
fn today_window() -> (i64, i64) {
    let now = chrono::Local::now();
    let date = now.date_naive();
    let start = date
        .and_hms_opt(0, 0, 0)
        .and_then(|dt| dt.and_local_timezone(chrono::Local).earliest())
        .map_or_else(|| now.timestamp_millis(), |dt| dt.timestamp_millis());
    let end = date
        .and_hms_milli_opt(23, 59, 59, 999)
        .and_then(|dt| dt.and_local_timezone(chrono::Local).latest())
        .map_or_else(|| now.timestamp_millis(), |dt| dt.timestamp_millis());
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::device::{ChannelTriggerSink, DeviceTable};

    fn controller() -> ProtectController {
        let config = ControllerConfig::new(
            "https://10.0.0.2".parse().unwrap(),
            "ubnt",
            SecretString::from("pw"),
        );
        ProtectController::new(
            config,
            Arc::new(DeviceTable::new()),
            Arc::new(ChannelTriggerSink::new(16)),
        )
        .unwrap()
    }

    #[test]
    fn starts_disconnected_without_a_bootstrap() {
        let controller = controller();
        assert_eq!(
            *controller.connection_state().borrow(),
            ConnectionState::Disconnected
        );
        assert!(controller.bootstrap().is_none());
        assert!(controller.nvr_name().is_none());
    }

    #[test]
    fn snapshot_url_requires_an_access_key() {
        let controller = controller();
        let camera: Camera = serde_json::from_value(serde_json::json!({ "id": "cam-1" })).unwrap();

        assert!(matches!(
            controller.snapshot_url(&camera, 1920),
            Err(CoreError::NotBootstrapped)
        ));
    }

    #[test]
    fn snapshot_url_carries_geometry_and_key() {
        let controller = controller();
        controller.inner.client.set_access_key(Some("key-1".into()));

        let camera: Camera = serde_json::from_value(serde_json::json!({
            "id": "cam-1",
            "type": "UVC G4 Doorbell",
        }))
        .unwrap();

        let url = controller.snapshot_url(&camera, 1600).unwrap();
        assert_eq!(url.path(), "/proxy/protect/api/cameras/cam-1/snapshot");
        let query = url.query().unwrap();
        assert!(query.contains("accessKey=key-1"));
        assert!(query.contains("w=1600"));
        // Doorbells are 4:3.
        assert!(query.contains("h=1200"));
        assert!(query.contains("force=true"));
        assert!(query.contains("ts="));
    }

    #[test]
    fn today_window_is_ordered_and_spans_now() {
        let (start, end) = today_window();
        let now = chrono::Local::now().timestamp_millis();
        assert!(start <= now);
        assert!(now <= end);
        assert!(end - start < 24 * 60 * 60 * 1000 + 1000);
    }

    #[test]
    fn credentials_prefer_the_settings_store() {
        let settings = Arc::new(crate::settings::MemorySettingsStore::new());
        settings.set(
            SETTING_CREDENTIALS,
            serde_json::json!({ "username": "other", "password": "pw2" }),
        );

        let config = ControllerConfig::new(
            "https://10.0.0.2".parse().unwrap(),
            "ubnt",
            SecretString::from("pw"),
        );
        let controller = ProtectController::new(
            config,
            Arc::new(DeviceTable::new()),
            Arc::new(ChannelTriggerSink::new(16)),
        )
        .unwrap()
        .with_settings(settings);

        assert_eq!(controller.credentials().username, "other");
    }
}
