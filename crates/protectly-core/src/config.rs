// ── Runtime connection configuration ──
//
// These types describe *how* to reach a Protect NVR. They carry
// credential data and connection tuning, but never touch disk -- the
// embedding application constructs a `ControllerConfig` and hands it in.

use std::time::Duration;

use secrecy::SecretString;
use url::Url;

/// Local NVR account credentials.
///
/// Protect has no API-key auth on local consoles; a session cookie from
/// username/password login is the only way in.
#[derive(Debug, Clone)]
pub struct NvrCredentials {
    pub username: String,
    pub password: SecretString,
}

/// TLS verification strategy.
#[derive(Debug, Clone, Default)]
pub enum TlsVerification {
    /// System CA store (strict).
    SystemDefaults,
    /// Custom CA certificate file.
    CustomCa(std::path::PathBuf),
    /// Skip verification. Default -- consoles ship self-signed certs.
    #[default]
    DangerAcceptInvalid,
}

impl PartialEq for TlsVerification {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::SystemDefaults, Self::SystemDefaults) => true,
            (Self::CustomCa(a), Self::CustomCa(b)) => a == b,
            (Self::DangerAcceptInvalid, Self::DangerAcceptInvalid) => true,
            _ => false,
        }
    }
}

impl Eq for TlsVerification {}

/// Configuration for connecting to a single NVR.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// NVR console URL (e.g., `https://192.168.1.1`).
    pub url: Url,
    /// NVR account credentials.
    pub credentials: NvrCredentials,
    /// TLS verification strategy.
    pub tls: TlsVerification,
    /// Request timeout.
    pub timeout: Duration,
    /// How often the session is re-established and the bootstrap
    /// refetched. The cookie would otherwise expire under us.
    pub session_refresh_interval: Duration,
    /// Realtime update stream tuning.
    pub listener: protectly_api::realtime::ListenerConfig,
}

impl ControllerConfig {
    /// Config for an NVR at `url` with the given account.
    pub fn new(url: Url, username: impl Into<String>, password: SecretString) -> Self {
        Self {
            url,
            credentials: NvrCredentials {
                username: username.into(),
                password,
            },
            ..Self::default()
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            url: "https://192.168.1.1".parse().expect("static URL"),
            credentials: NvrCredentials {
                username: "ubnt".into(),
                password: SecretString::from(String::new()),
            },
            tls: TlsVerification::default(),
            timeout: Duration::from_secs(30),
            session_refresh_interval: Duration::from_secs(45 * 60),
            listener: protectly_api::realtime::ListenerConfig::default(),
        }
    }
}
