// ── Core error types ──
//
// User-facing errors from protectly-core. These are NOT API-specific --
// consumers never see raw HTTP status codes or frame-protocol failures.
// The `From<protectly_api::Error>` impl translates transport-layer
// errors into domain-appropriate variants.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot connect to NVR at {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("NVR disconnected")]
    NvrDisconnected,

    #[error("NVR connection timed out")]
    Timeout,

    // ── Data errors ──────────────────────────────────────────────────
    #[error("Camera not found: {identifier}")]
    CameraNotFound { identifier: String },

    #[error("NVR bootstrap has not been fetched yet")]
    NotBootstrapped,

    // ── Operation errors ─────────────────────────────────────────────
    #[error("Operation failed: {message}")]
    OperationFailed { message: String },

    // ── API errors (wrapped, not exposed raw) ────────────────────────
    #[error("API error: {message}")]
    Api {
        message: String,
        /// HTTP status code (if applicable).
        status: Option<u16>,
    },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<protectly_api::Error> for CoreError {
    fn from(err: protectly_api::Error) -> Self {
        match err {
            protectly_api::Error::InvalidHost(host) => CoreError::Config {
                message: format!("Invalid NVR host: {host}"),
            },
            protectly_api::Error::NotAuthenticated => CoreError::AuthenticationFailed {
                message: "No session token -- login required".into(),
            },
            protectly_api::Error::InvalidCredentials { message } => {
                CoreError::AuthenticationFailed { message }
            }
            protectly_api::Error::SessionExpired => CoreError::AuthenticationFailed {
                message: "Session expired -- re-authentication required".into(),
            },
            protectly_api::Error::HttpStatus {
                method,
                path,
                status,
            } => {
                if status == 401 || status == 403 {
                    CoreError::AuthenticationFailed {
                        message: format!("{method} {path} rejected (status code: {status})"),
                    }
                } else {
                    CoreError::Api {
                        message: format!("{method} {path} failed"),
                        status: Some(status),
                    }
                }
            }
            protectly_api::Error::Transport(ref e) => {
                if e.is_timeout() {
                    CoreError::Timeout
                } else if e.is_connect() {
                    CoreError::ConnectionFailed {
                        url: e
                            .url()
                            .map(|u| u.to_string())
                            .unwrap_or_else(|| "<unknown>".into()),
                        reason: e.to_string(),
                    }
                } else {
                    CoreError::Api {
                        message: e.to_string(),
                        status: e.status().map(|s| s.as_u16()),
                    }
                }
            }
            protectly_api::Error::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            protectly_api::Error::Tls(msg) => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("TLS error: {msg}"),
            },
            protectly_api::Error::Connection(reason) => CoreError::ConnectionFailed {
                url: String::new(),
                reason,
            },
            protectly_api::Error::MalformedFrame(msg) => {
                CoreError::Internal(format!("Malformed update frame: {msg}"))
            }
            protectly_api::Error::Deserialization { message, body: _ } => {
                CoreError::Internal(format!("Deserialization error: {message}"))
            }
        }
    }
}
