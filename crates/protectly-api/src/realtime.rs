//! Realtime update listener with auto-reconnect.
//!
//! Maintains the persistent socket to the NVR's update-events endpoint and
//! streams decoded [`UpdatePacket`]s through a [`tokio::sync::broadcast`]
//! channel. Handles heartbeat liveness, application keepalive pings, and
//! reconnection with exponential backoff + jitter.
//!
//! Connection ordering is enforced through the resume channel: the loop
//! never dials before a bootstrap has published a [`ResumeState`], and a
//! newly published state (fresh `lastUpdateId` cursor) tears down the live
//! socket so the stream resumes from the new cursor.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use tokio_tungstenite::{Connector, connect_async_tls_with_config};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::error::Error;
use crate::frames::{UpdatePacket, decode_update_packet};

// ── Constants ────────────────────────────────────────────────────────

const PACKET_CHANNEL_CAPACITY: usize = 1024;

/// Path of the realtime update-events endpoint on a UniFi OS console.
pub const UPDATES_PATH: &str = "/proxy/protect/ws/updates";

/// The connection is presumed dead after this long without inbound traffic.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// How often we send an application-level keepalive ping.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

// ── ResumeState ──────────────────────────────────────────────────────

/// Everything needed to (re)connect the update stream.
///
/// Published by the session manager after every bootstrap fetch; the
/// `updates_url` already carries the `lastUpdateId` resume cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeState {
    pub updates_url: Url,
    pub cookie: String,
}

/// Build the update-events URL for an NVR base URL and resume cursor.
///
/// `https` maps to `wss` (`http` to `ws`, for test servers).
pub fn updates_url(base: &Url, last_update_id: &str) -> Result<Url, Error> {
    let mut url = base.join(UPDATES_PATH).map_err(Error::InvalidUrl)?;
    let scheme = match base.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => {
            return Err(Error::Connection(format!(
                "unsupported base URL scheme: {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| Error::Connection("failed to set websocket scheme".into()))?;
    url.query_pairs_mut()
        .append_pair("lastUpdateId", last_update_id);
    Ok(url)
}

// ── ReconnectConfig ──────────────────────────────────────────────────

/// Exponential backoff configuration for reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Maximum reconnection attempts before giving up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

// ── ListenerConfig ───────────────────────────────────────────────────

/// Tuning knobs for the update listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Liveness window: no inbound traffic for this long kills the socket.
    pub heartbeat_interval: Duration,

    /// Application keepalive ping cadence, independent of the heartbeat.
    pub keepalive_interval: Duration,

    pub reconnect: ReconnectConfig,

    /// Skip TLS certificate verification (self-signed NVR cert). Default.
    pub insecure_tls: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            keepalive_interval: KEEPALIVE_INTERVAL,
            reconnect: ReconnectConfig::default(),
            insecure_tls: true,
        }
    }
}

// ── UpdateListener ───────────────────────────────────────────────────

/// Handle to the running update stream.
///
/// Drop all receivers and call [`shutdown`](Self::shutdown) to tear down
/// the background task.
pub struct UpdateListener {
    packet_rx: broadcast::Receiver<Arc<UpdatePacket>>,
    cancel: CancellationToken,
}

impl UpdateListener {
    /// Spawn the reconnection loop.
    ///
    /// Returns immediately; no connection is attempted until `resume_rx`
    /// holds a value. Subscribe to consume decoded camera updates.
    pub fn spawn(
        resume_rx: watch::Receiver<Option<ResumeState>>,
        config: ListenerConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (packet_tx, packet_rx) = broadcast::channel(PACKET_CHANNEL_CAPACITY);

        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            listen_loop(resume_rx, packet_tx, config, task_cancel).await;
        });

        Self { packet_rx, cancel }
    }

    /// Get a new broadcast receiver for the packet stream.
    ///
    /// Multiple consumers can subscribe concurrently. A consumer that
    /// falls behind receives [`broadcast::error::RecvError::Lagged`].
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<UpdatePacket>> {
        self.packet_rx.resubscribe()
    }

    /// Signal the background task to shut down.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

// ── Background reconnection loop ─────────────────────────────────────

/// Why a connection ended without an error.
enum Disconnect {
    /// Server closed the stream, or we were cancelled.
    Closed,
    /// A bootstrap published a fresh resume cursor; reconnect with it.
    CursorRotated,
}

/// Main loop: wait for a resume cursor → connect → read → reconnect.
async fn listen_loop(
    mut resume_rx: watch::Receiver<Option<ResumeState>>,
    packet_tx: broadcast::Sender<Arc<UpdatePacket>>,
    config: ListenerConfig,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        // Never connect before the first successful bootstrap.
        let Some(state) = wait_for_resume(&mut resume_rx, &cancel).await else {
            break;
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = connect_and_read(&state, &packet_tx, &cancel, &mut resume_rx, &config) => {
                match result {
                    Ok(Disconnect::CursorRotated) => {
                        info!("resume cursor rotated, reconnecting with the new cursor");
                        attempt = 0;
                    }
                    Ok(Disconnect::Closed) => {
                        if cancel.is_cancelled() {
                            break;
                        }
                        info!("update stream disconnected cleanly, reconnecting");
                        attempt = 0;
                    }
                    Err(e) => {
                        warn!(error = %e, attempt, "update stream error");

                        if let Some(max) = config.reconnect.max_retries {
                            if attempt >= max {
                                warn!(max_retries = max, "reconnection limit reached, giving up");
                                break;
                            }
                        }

                        let delay = calculate_backoff(attempt, &config.reconnect);
                        debug!(delay_ms = delay.as_millis() as u64, attempt, "waiting before reconnect");

                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => break,
                            () = tokio::time::sleep(delay) => {}
                        }

                        attempt += 1;
                    }
                }
            }
        }
    }

    debug!("update listener loop exiting");
}

/// Block until a resume state is available (or we're shut down).
async fn wait_for_resume(
    resume_rx: &mut watch::Receiver<Option<ResumeState>>,
    cancel: &CancellationToken,
) -> Option<ResumeState> {
    loop {
        if let Some(state) = resume_rx.borrow_and_update().clone() {
            return Some(state);
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            changed = resume_rx.changed() => changed.ok()?,
        }
    }
}

// ── Single connection lifecycle ──────────────────────────────────────

/// Establish one connection and read until it drops.
///
/// Any inbound traffic resets the heartbeat deadline; hitting the deadline
/// drops the socket without a close handshake and surfaces as an error so
/// the reconnect path engages.
async fn connect_and_read(
    state: &ResumeState,
    packet_tx: &broadcast::Sender<Arc<UpdatePacket>>,
    cancel: &CancellationToken,
    resume_rx: &mut watch::Receiver<Option<ResumeState>>,
    config: &ListenerConfig,
) -> Result<Disconnect, Error> {
    info!(url = %state.updates_url, "connecting to the realtime update events endpoint");

    let uri: tungstenite::http::Uri = state
        .updates_url
        .as_str()
        .parse()
        .map_err(|e: tungstenite::http::uri::InvalidUri| Error::Connection(e.to_string()))?;

    let request = ClientRequestBuilder::new(uri).with_header("Cookie", &state.cookie);

    let connector = if config.insecure_tls && state.updates_url.scheme() == "wss" {
        Some(insecure_connector()?)
    } else {
        None
    };

    let (ws_stream, _response) = connect_async_tls_with_config(request, None, false, connector)
        .await
        .map_err(|e| Error::Connection(e.to_string()))?;

    info!("connected to the realtime update events endpoint");

    let (mut write, mut read) = ws_stream.split();

    let mut keepalive = tokio::time::interval_at(
        tokio::time::Instant::now() + config.keepalive_interval,
        config.keepalive_interval,
    );
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let heartbeat = tokio::time::sleep(config.heartbeat_interval);
    tokio::pin!(heartbeat);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(Disconnect::Closed),
            changed = resume_rx.changed() => {
                return if changed.is_ok() {
                    Ok(Disconnect::CursorRotated)
                } else {
                    Ok(Disconnect::Closed)
                };
            }
            () = &mut heartbeat => {
                return Err(Error::Connection(format!(
                    "no traffic within the heartbeat interval ({:?})",
                    config.heartbeat_interval
                )));
            }
            _ = keepalive.tick() => {
                write
                    .send(tungstenite::Message::Ping(tungstenite::Bytes::new()))
                    .await
                    .map_err(|e| Error::Connection(format!("keepalive ping failed: {e}")))?;
            }
            frame = read.next() => {
                heartbeat
                    .as_mut()
                    .reset(tokio::time::Instant::now() + config.heartbeat_interval);

                match frame {
                    Some(Ok(tungstenite::Message::Binary(data))) => {
                        handle_packet(&data, packet_tx);
                    }
                    Some(Ok(tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_))) => {
                        trace!("keepalive traffic");
                    }
                    Some(Ok(tungstenite::Message::Text(_))) => {
                        // The update protocol is binary-only.
                        trace!("ignoring text frame");
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        if let Some(ref cf) = frame {
                            info!(code = %cf.code, reason = %cf.reason, "close frame received");
                        } else {
                            info!("close frame received (no payload)");
                        }
                        return Ok(Disconnect::Closed);
                    }
                    Some(Err(e)) => return Err(Error::Connection(e.to_string())),
                    None => {
                        info!("update stream ended");
                        return Ok(Disconnect::Closed);
                    }
                    _ => {}
                }
            }
        }
    }
}

// ── Packet handling ──────────────────────────────────────────────────

/// Decode one binary message and broadcast it if it is a camera update.
///
/// Decode failures never kill the connection: log and drop the packet.
fn handle_packet(data: &[u8], packet_tx: &broadcast::Sender<Arc<UpdatePacket>>) {
    let packet = match decode_update_packet(data) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "unable to process a realtime update packet");
            return;
        }
    };

    if !packet.is_camera_update() {
        trace!(
            action = %packet.action.action,
            model_key = %packet.action.model_key,
            "dropping uninteresting update"
        );
        return;
    }

    // Send errors just mean no active subscribers right now.
    let _ = packet_tx.send(Arc::new(packet));
}

// ── TLS ──────────────────────────────────────────────────────────────

/// rustls connector that accepts any server certificate.
///
/// The NVR serves a self-signed certificate; this is the socket-side twin
/// of `TlsMode::DangerAcceptInvalid`.
fn insecure_connector() -> Result<Connector, Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertificateVerification(provider)))
        .with_no_client_auth();
    Ok(Connector::Rustls(Arc::new(config)))
}

/// Certificate verifier that accepts everything but still checks signatures.
#[derive(Debug)]
struct NoCertificateVerification(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls_pki_types::CertificateDer<'_>,
        _intermediates: &[rustls_pki_types::CertificateDer<'_>],
        _server_name: &rustls_pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls_pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls_pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls_pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

// ── Backoff calculation ──────────────────────────────────────────────

/// Exponential backoff with jitter.
///
/// `delay = min(initial * 2^attempt, max) + jitter`
///
/// Jitter is +-25% to spread out reconnection storms from multiple clients.
fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(attempt as i32);
    let capped = base.min(config.max_delay.as_secs_f64());

    // Deterministic "jitter" seeded from the attempt number.
    // Not cryptographically random, but good enough for backoff spread.
    let jitter_factor = 1.0 + 0.25 * ((f64::from(attempt) * 7.3).sin());
    let with_jitter = (capped * jitter_factor).max(0.0);

    Duration::from_secs_f64(with_jitter)
}

// ── Tests ────────────────────────────────────────────────────────────
