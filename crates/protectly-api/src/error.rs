use thiserror::Error;

/// Top-level error type for the `protectly-api` crate.
///
/// Covers every failure mode across the transport, session, and realtime
/// surfaces. `protectly-core` maps these into domain-level errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── Session ─────────────────────────────────────────────────────
    /// No server host has been configured.
    #[error("Invalid host: {0:?}")]
    InvalidHost(String),

    /// A request was attempted without a live session token.
    #[error("Not authenticated -- no session token present")]
    NotAuthenticated,

    /// Login was rejected, or succeeded without producing a session cookie.
    #[error("Invalid credentials: {message}")]
    InvalidCredentials { message: String },

    /// Session has expired (cookie expired or revoked server-side).
    #[error("Session expired -- re-authentication required")]
    SessionExpired,

    // ── Transport ───────────────────────────────────────────────────
    /// Non-200 response from the NVR. The body is not parsed.
    #[error("{method} {path} failed (status code: {status})")]
    HttpStatus {
        method: String,
        path: String,
        status: u16,
    },

    /// HTTP transport error (connection refused, DNS failure, timeout, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// TLS setup or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── Realtime ────────────────────────────────────────────────────
    /// Socket-level failure on the realtime updates connection.
    #[error("Realtime connection error: {0}")]
    Connection(String),

    /// A binary update frame failed protocol validation.
    ///
    /// Never fatal to the listener -- the offending packet is dropped.
    #[error("Malformed update frame: {0}")]
    MalformedFrame(String),

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// Returns `true` if this error indicates the session is no longer
    /// valid and re-authentication might resolve it.
    pub fn is_auth_expired(&self) -> bool {
        match self {
            Self::NotAuthenticated | Self::SessionExpired => true,
            Self::HttpStatus { status, .. } => *status == 401,
            _ => false,
        }
    }
}
