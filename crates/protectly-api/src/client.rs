// Protect REST client
//
// Wraps `reqwest::Client` with the NVR's URL layout and manual session
// token handling. The session cookie is NOT kept in a cookie jar: the NVR
// rotates it through `set-cookie` on arbitrary responses, and rotation has
// to be ignored when it races a newer login (see `TokenState::epoch`).

use std::sync::Mutex;
use std::time::Duration;

use reqwest::Method;
use reqwest::header::{ACCEPT, COOKIE, SET_COOKIE};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;
use url::Url;

use crate::error::Error;
use crate::transport::TransportConfig;

/// Path prefix for every Protect resource on a UniFi OS console.
///
/// Immutable per client -- the login endpoint lives outside it.
pub const PROTECT_API_PREFIX: &str = "/proxy/protect/api";

const LOGIN_PATH: &str = "/api/auth/login";
const CSRF_HEADER: &str = "x-csrf-token";

/// The NVR expects login to answer quickly on the local network; a slow
/// answer means a wrong host far more often than a slow console.
const LOGIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Session token state, replaced wholesale by login.
///
/// `epoch` increments on every login. A response may only rotate the
/// cookie if its request was issued under the current epoch -- a slow
/// in-flight request from before a refresh must never overwrite the
/// fresher token (last-write-wins, by issue order not arrival order).
#[derive(Debug, Default)]
struct TokenState {
    epoch: u64,
    cookie: Option<String>,
    csrf: Option<String>,
    access_key: Option<String>,
}

/// Authenticated HTTP client for the Protect REST API.
///
/// Owns the session cookie, CSRF token, and access key. All resource
/// requests require a live session token and fail with
/// [`Error::NotAuthenticated`] before any network I/O without one.
pub struct ProtectClient {
    http: reqwest::Client,
    base_url: Url,
    tokens: Mutex<TokenState>,
}

impl ProtectClient {
    /// Create a client for the NVR at `base_url` (e.g. `https://192.168.1.1`).
    pub fn new(base_url: Url, transport: &TransportConfig) -> Result<Self, Error> {
        if base_url.host_str().is_none_or(str::is_empty) {
            return Err(Error::InvalidHost(base_url.to_string()));
        }
        let http = transport.build_client()?;
        Ok(Self {
            http,
            base_url,
            tokens: Mutex::new(TokenState::default()),
        })
    }

    /// The NVR base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The current session cookie, if logged in.
    pub fn cookie(&self) -> Option<String> {
        self.lock_tokens().cookie.clone()
    }

    /// The current pre-signed access key, if a bootstrap has been fetched.
    pub fn access_key(&self) -> Option<String> {
        self.lock_tokens().access_key.clone()
    }

    /// Store the access key captured from a bootstrap snapshot.
    pub fn set_access_key(&self, access_key: Option<String>) {
        self.lock_tokens().access_key = access_key;
    }

    /// `true` when a session cookie is held.
    pub fn is_authenticated(&self) -> bool {
        self.lock_tokens().cookie.is_some()
    }

    /// Drop the session token, forcing re-authentication.
    pub fn invalidate_session(&self) {
        let mut tokens = self.lock_tokens();
        tokens.epoch += 1;
        tokens.cookie = None;
        tokens.csrf = None;
    }

    // ── Login ────────────────────────────────────────────────────────

    /// Authenticate with the NVR at `POST /api/auth/login`.
    ///
    /// On HTTP 200 the session cookie from `set-cookie` replaces the stored
    /// token wholesale; a 200 without one fails with
    /// [`Error::InvalidCredentials`], as do 401/403 rejections.
    pub async fn login(&self, username: &str, password: &SecretString) -> Result<(), Error> {
        let url = self.base_url.join(LOGIN_PATH).map_err(Error::InvalidUrl)?;
        debug!(%url, username, "logging in");

        let body = json!({
            "username": username,
            "password": password.expose_secret(),
        });

        let resp = self
            .http
            .post(url)
            .timeout(LOGIN_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(Error::Transport)?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::InvalidCredentials {
                message: format!("login rejected (status code: {})", status.as_u16()),
            });
        }
        if status != reqwest::StatusCode::OK {
            return Err(Error::HttpStatus {
                method: Method::POST.to_string(),
                path: LOGIN_PATH.into(),
                status: status.as_u16(),
            });
        }

        let cookie = last_header(resp.headers(), SET_COOKIE.as_str())
            .ok_or_else(|| Error::InvalidCredentials {
                message: "login response carried no set-cookie header".into(),
            })?;
        let csrf = last_header(resp.headers(), CSRF_HEADER);

        let mut tokens = self.lock_tokens();
        tokens.epoch += 1;
        tokens.cookie = Some(cookie);
        tokens.csrf = csrf;
        drop(tokens);

        debug!("login successful");
        Ok(())
    }

    // ── Resource requests ────────────────────────────────────────────

    /// GET a resource under the Protect prefix, returning the body text.
    ///
    /// The pre-signed `accessKey` is appended as a query parameter when one
    /// is held.
    pub async fn get(&self, resource: &str, params: &[(&str, String)]) -> Result<String, Error> {
        let resp = self
            .request(Method::GET, resource, params, None, false)
            .await?;
        resp.text().await.map_err(Error::Transport)
    }

    /// GET a resource and deserialize its JSON body.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        resource: &str,
        params: &[(&str, String)],
    ) -> Result<T, Error> {
        let body = self.get(resource, params).await?;
        serde_json::from_str(&body).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body,
        })
    }

    /// GET a binary resource (snapshots), returning the raw bytes.
    pub async fn download(
        &self,
        resource: &str,
        params: &[(&str, String)],
    ) -> Result<Vec<u8>, Error> {
        let resp = self
            .request(Method::GET, resource, params, None, true)
            .await?;
        Ok(resp.bytes().await.map_err(Error::Transport)?.to_vec())
    }

    /// POST a JSON payload to a resource, returning the body text.
    pub async fn post(&self, resource: &str, payload: &impl Serialize) -> Result<String, Error> {
        self.write(Method::POST, resource, payload).await
    }

    /// PUT a JSON payload to a resource, returning the body text.
    pub async fn put(&self, resource: &str, payload: &impl Serialize) -> Result<String, Error> {
        self.write(Method::PUT, resource, payload).await
    }

    /// PATCH a JSON payload to a resource, returning the body text.
    pub async fn patch(&self, resource: &str, payload: &impl Serialize) -> Result<String, Error> {
        self.write(Method::PATCH, resource, payload).await
    }

    async fn write(
        &self,
        method: Method,
        resource: &str,
        payload: &impl Serialize,
    ) -> Result<String, Error> {
        let body = serde_json::to_value(payload).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: String::new(),
        })?;
        let resp = self
            .request(method, resource, &[], Some(body), false)
            .await?;
        resp.text().await.map_err(Error::Transport)
    }

    /// Shared request path: session checks before any I/O, cookie header,
    /// status check, and `set-cookie` absorption on every response.
    async fn request(
        &self,
        method: Method,
        resource: &str,
        params: &[(&str, String)],
        body: Option<serde_json::Value>,
        is_binary: bool,
    ) -> Result<reqwest::Response, Error> {
        let (epoch, cookie, csrf) = {
            let tokens = self.lock_tokens();
            let cookie = tokens.cookie.clone().ok_or(Error::NotAuthenticated)?;
            (tokens.epoch, cookie, tokens.csrf.clone())
        };

        let url = self.resource_url(resource, params, &method)?;
        debug!(method = %method, %url, "request");

        let mut req = self
            .http
            .request(method.clone(), url.clone())
            .header(COOKIE, cookie)
            .header(ACCEPT, if is_binary { "*/*" } else { "application/json" });

        if let Some(body) = body {
            req = req.json(&body);
            // Write verbs through the UniFi OS proxy want the CSRF token.
            if let Some(csrf) = csrf {
                req = req.header(CSRF_HEADER, csrf);
            }
        }

        let resp = req.send().await.map_err(Error::Transport)?;
        self.absorb_headers(epoch, resp.headers());

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            return Err(Error::HttpStatus {
                method: method.to_string(),
                path: url.path().to_string(),
                status: status.as_u16(),
            });
        }
        Ok(resp)
    }

    /// Build `{base}/proxy/protect/api/{resource}` with query parameters.
    ///
    /// GET/download carry the pre-signed key as `accessKey`; PUT carries
    /// it as `apiKey` (that's what the NVR expects there). Other writes
    /// rely on the cookie header alone.
    fn resource_url(
        &self,
        resource: &str,
        params: &[(&str, String)],
        method: &Method,
    ) -> Result<Url, Error> {
        let mut url = self
            .base_url
            .join(&format!("{PROTECT_API_PREFIX}/{resource}"))
            .map_err(Error::InvalidUrl)?;

        let key_param = match *method {
            Method::GET => Some("accessKey"),
            Method::PUT => Some("apiKey"),
            _ => None,
        };

        {
            let mut query = url.query_pairs_mut();
            for (key, value) in params {
                query.append_pair(key, value);
            }
            if let Some(name) = key_param {
                if let Some(access_key) = self.lock_tokens().access_key.as_deref() {
                    query.append_pair(name, access_key);
                }
            }
        }
        Ok(url)
    }

    /// Absorb session-relevant response headers.
    ///
    /// Rotation is accepted only when no login happened since the request
    /// was issued -- stale responses must not clobber a fresh token.
    fn absorb_headers(&self, request_epoch: u64, headers: &reqwest::header::HeaderMap) {
        let cookie = last_header(headers, SET_COOKIE.as_str());
        let csrf = last_header(headers, CSRF_HEADER);
        if cookie.is_none() && csrf.is_none() {
            return;
        }

        let mut tokens = self.lock_tokens();
        if tokens.epoch != request_epoch {
            debug!("discarding token rotation from a stale response");
            return;
        }
        if cookie.is_some() {
            tokens.cookie = cookie;
        }
        if csrf.is_some() {
            tokens.csrf = csrf;
        }
    }

    fn lock_tokens(&self) -> std::sync::MutexGuard<'_, TokenState> {
        // Token state is plain data; a poisoned lock can't leave it torn.
        self.tokens
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Last value for a header name (header lookup is case-insensitive).
/// The NVR may send several `set-cookie` headers; the final one wins.
fn last_header(headers: &reqwest::header::HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(name)
        .iter()
        .next_back()
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ProtectClient {
        ProtectClient::new(
            Url::parse("https://10.0.0.2").unwrap(),
            &TransportConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn rejects_base_url_without_host() {
        let result = ProtectClient::new(
            Url::parse("data:text/plain,x").unwrap(),
            &TransportConfig::default(),
        );
        assert!(matches!(result, Err(Error::InvalidHost(_))));
    }

    #[tokio::test]
    async fn request_without_session_fails_before_io() {
        let client = client();
        let result = client.get("bootstrap", &[]).await;
        assert!(matches!(result, Err(Error::NotAuthenticated)));
    }

    #[test]
    fn resource_url_key_parameter_depends_on_the_verb() {
        let client = client();
        client.set_access_key(Some("key-1".into()));

        let url = client
            .resource_url(
                "cameras/cam1/snapshot",
                &[("w", "1920".into())],
                &Method::GET,
            )
            .unwrap();
        assert_eq!(url.path(), "/proxy/protect/api/cameras/cam1/snapshot");
        assert!(url.query().unwrap().contains("accessKey=key-1"));
        assert!(url.query().unwrap().contains("w=1920"));

        let put_url = client
            .resource_url("cameras/cam1", &[], &Method::PUT)
            .unwrap();
        assert!(put_url.query().unwrap().contains("apiKey=key-1"));

        let patch_url = client
            .resource_url("cameras/cam1", &[], &Method::PATCH)
            .unwrap();
        assert!(patch_url.query().is_none());
    }

    #[test]
    fn stale_response_cannot_rotate_cookie() {
        let client = client();

        // Simulate a login at epoch 1.
        {
            let mut tokens = client.lock_tokens();
            tokens.epoch = 1;
            tokens.cookie = Some("tok-new".into());
        }

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(SET_COOKIE, "tok-stale".parse().unwrap());

        // A response from a request issued at epoch 0 arrives late.
        client.absorb_headers(0, &headers);
        assert_eq!(client.cookie().as_deref(), Some("tok-new"));

        // A response from the current epoch rotates normally.
        client.absorb_headers(1, &headers);
        assert_eq!(client.cookie().as_deref(), Some("tok-stale"));
    }

    #[test]
    fn invalidate_session_clears_token_and_bumps_epoch() {
        let client = client();
        {
            let mut tokens = client.lock_tokens();
            tokens.cookie = Some("tok".into());
        }
        client.invalidate_session();
        assert!(!client.is_authenticated());

        // In-flight responses from before invalidation are ignored too.
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(SET_COOKIE, "tok-old".parse().unwrap());
        client.absorb_headers(0, &headers);
        assert!(client.cookie().is_none());
    }
}
