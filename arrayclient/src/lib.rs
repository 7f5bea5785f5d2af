//! Component B — Array Client (spec.md §4.B).
//!
//! The only crate in this workspace that speaks HTTP. `ArrayClient` is
//! stateful in exactly the two ways spec.md calls out: a detected API
//! major version and a cached session token (`auth::SessionCache`).

pub mod auth;
pub mod dialect;
pub mod error_map;
pub mod ops;
pub mod retry;

use std::{sync::Mutex, thread};

use log::{debug, trace, warn};
use reqwest::{
    blocking::{Client, Response},
    Method,
};
use serde_json::Value;
use vol_api::{config::PluginConfig, error::ArrayError};

pub use dialect::ApiVersion;

/// REST transport to a single array endpoint, version-negotiated and
/// session-authenticated on construction.
pub struct ArrayClient {
    http: Client,
    base_url: String,
    version: ApiVersion,
    credentials: vol_api::config::Credentials,
    session: Mutex<auth::SessionCache>,
    ssl_verify: bool,
}

impl ArrayClient {
    /// Builds a client for `config`, negotiating the API version and
    /// performing the initial login.
    pub fn new(config: &PluginConfig) -> Result<Self, ArrayError> {
        Self::with_base_url(format!("https://{}", config.portal), config)
    }

    /// Builds a client against an explicit `base_url` rather than deriving
    /// one from `config.portal`. Production code always goes through
    /// [`ArrayClient::new`]; this exists so tests can point the client at a
    /// local mock server without a TLS certificate.
    pub fn with_base_url(base_url: impl Into<String>, config: &PluginConfig) -> Result<Self, ArrayError> {
        let http = Client::builder()
            .danger_accept_invalid_certs(!config.ssl_verify)
            .build()
            .map_err(|e| ArrayError::Transport(e.to_string()))?;
        let base_url = base_url.into();

        let version = detect_version(&http, &base_url)?;
        debug!("Negotiated array API version {}", version.as_path_segment());

        let client = ArrayClient {
            http,
            base_url,
            version,
            credentials: config.credentials.clone(),
            session: Mutex::new(auth::SessionCache::default()),
            ssl_verify: config.ssl_verify,
        };
        client.ensure_session()?;
        Ok(client)
    }

    pub fn version(&self) -> ApiVersion {
        self.version
    }

    fn ensure_session(&self) -> Result<(), ArrayError> {
        let mut session = self.session.lock().expect("session cache mutex poisoned");
        if session.get().is_some() {
            return Ok(());
        }
        let token = auth::login(&self.http, &self.base_url, self.version, &self.credentials, self.ssl_verify)?;
        session.set(token);
        Ok(())
    }

    fn invalidate_session(&self) {
        self.session.lock().expect("session cache mutex poisoned").invalidate();
    }

    fn session_token(&self) -> Result<String, ArrayError> {
        self.ensure_session()?;
        Ok(self
            .session
            .lock()
            .expect("session cache mutex poisoned")
            .get()
            .expect("ensure_session just populated it")
            .to_owned())
    }

    /// The request pipeline (spec.md §4.B "Request pipeline"): attaches
    /// auth, sends, retries per the policy table, and returns parsed JSON
    /// (or `{}` for an empty body) on success.
    pub(crate) fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Value, ArrayError> {
        let idempotent = retry::is_idempotent(&method);
        let mut auth_retries = 0u32;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let token = self.session_token()?;
            let url = format!("{}{path}", self.base_url);
            trace!("{method} {url} (attempt {attempt})");

            let mut req = self.http.request(method.clone(), &url).header("x-auth-token", token);
            if !query.is_empty() {
                req = req.query(query);
            }
            if let Some(body) = body {
                req = req.json(body);
            }

            let resp = req.send().map_err(|e| ArrayError::Transport(e.to_string()))?;
            let status = resp.status().as_u16();

            if resp.status().is_success() {
                return parse_body(resp);
            }

            let value = parse_body(resp).unwrap_or_else(|_| Value::Null);
            let extracted = error_map::extract_error(self.version, &value);

            if status == 401 && auth_retries < retry::MAX_AUTH_RETRIES {
                warn!("Array session expired, re-authenticating");
                self.invalidate_session();
                auth_retries += 1;
                continue;
            }

            let classified = error_map::classify(status, extracted, idempotent);
            let retryable = matches!(classified, ArrayError::Transient { .. });

            if retryable && attempt < retry::MAX_ATTEMPTS {
                let delay = retry::backoff_delay(retry::BASE_RETRY_DELAY, attempt);
                warn!("Array request failed ({status}), retrying in {delay:?}");
                thread::sleep(delay);
                continue;
            }

            return Err(classified);
        }
    }
}

fn parse_body(resp: Response) -> Result<Value, ArrayError> {
    let bytes = resp.bytes().map_err(|e| ArrayError::Transport(e.to_string()))?;
    if bytes.is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_slice(&bytes).map_err(|e| ArrayError::Transport(format!("invalid JSON body: {e}")))
}

/// Version detection (spec.md §4.B "Version detection"): GET
/// `/api/api_version`, intersect with the preference order; fall back to
/// probing successive versions, then to the 2.x default.
fn detect_version(http: &Client, base_url: &str) -> Result<ApiVersion, ArrayError> {
    if let Ok(resp) = http.get(format!("{base_url}/api/api_version")).send() {
        if resp.status().is_success() {
            if let Ok(body) = resp.json::<ApiVersionResponse>() {
                if let Some(best) = best_advertised_version(&body.version) {
                    return Ok(best);
                }
            }
        }
    }

    for &candidate in ApiVersion::preference_order() {
        let probe_path = format!("{base_url}/api/{}/array", candidate.as_path_segment());
        if let Ok(resp) = http.get(&probe_path).send() {
            if resp.status().is_success() || resp.status().as_u16() == 401 {
                debug!("Version probe succeeded against {probe_path}");
                return Ok(candidate);
            }
        }
    }

    warn!("Could not negotiate an array API version; defaulting to {:?}", ApiVersion::DEFAULT_FALLBACK);
    Ok(ApiVersion::DEFAULT_FALLBACK)
}

#[derive(serde::Deserialize)]
struct ApiVersionResponse {
    version: Vec<String>,
}

fn best_advertised_version(advertised: &[String]) -> Option<ApiVersion> {
    let parsed: Vec<ApiVersion> = advertised.iter().filter_map(|v| ApiVersion::parse(v)).collect();
    ApiVersion::preference_order()
        .iter()
        .find(|pref| parsed.contains(pref))
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_newest_advertised_version() {
        let advertised = vec!["1.19".to_owned(), "2.23".to_owned(), "2.4".to_owned()];
        assert_eq!(best_advertised_version(&advertised), Some(ApiVersion::V2));
    }

    #[test]
    fn falls_back_to_v1_when_only_v1_advertised() {
        let advertised = vec!["1.19".to_owned()];
        assert_eq!(best_advertised_version(&advertised), Some(ApiVersion::V1));
    }

    #[test]
    fn empty_advertisement_list_yields_none() {
        assert_eq!(best_advertised_version(&[]), None);
    }
}

#[cfg(test)]
mod client_tests {
    use super::*;
    use vol_api::config::{Credentials, PluginConfig};

    fn test_config(portal: &str) -> PluginConfig {
        PluginConfig {
            portal: portal.to_owned(),
            credentials: Credentials::ApiToken { api_token: "test-token".to_owned() },
            ssl_verify: false,
            protocol: Default::default(),
            host_mode: Default::default(),
            cluster_name: "pve".to_owned(),
            device_timeout_secs: 60,
            pod: None,
        }
    }

    fn mock_login(server: &mut mockito::ServerGuard) -> mockito::Mock {
        server
            .mock("POST", "/api/2.x/login")
            .with_status(200)
            .with_header("x-auth-token", "sess-abc")
            .with_body("{}")
            .create()
    }

    #[test]
    fn negotiates_v2_from_api_version_and_logs_in() {
        let mut server = mockito::Server::new();
        let version_mock = server
            .mock("GET", "/api/api_version")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"version": ["1.19", "2.23"]}"#)
            .create();
        let login_mock = mock_login(&mut server);

        let client = ArrayClient::with_base_url(server.url(), &test_config("unused")).unwrap();

        assert_eq!(client.version(), ApiVersion::V2);
        version_mock.assert();
        login_mock.assert();
    }

    #[test]
    fn falls_back_to_default_when_api_version_endpoint_is_absent() {
        let mut server = mockito::Server::new();
        let version_mock = server.mock("GET", "/api/api_version").with_status(404).create();
        let v2_probe = server.mock("GET", "/api/2.x/array").with_status(401).create();
        let login_mock = mock_login(&mut server);

        let client = ArrayClient::with_base_url(server.url(), &test_config("unused")).unwrap();

        assert_eq!(client.version(), ApiVersion::V2);
        version_mock.assert();
        v2_probe.assert();
        login_mock.assert();
    }

    #[test]
    fn get_volume_returns_none_on_404() {
        let mut server = mockito::Server::new();
        server.mock("GET", "/api/api_version").with_status(404).create();
        server.mock("GET", "/api/2.x/array").with_status(401).create();
        mock_login(&mut server);
        let not_found = server
            .mock("GET", mockito::Matcher::Regex(r"^/api/2\.x/volumes".to_owned()))
            .with_status(404)
            .with_body(r#"{"errors": [{"message": "volume does not exist"}]}"#)
            .create();

        let client = ArrayClient::with_base_url(server.url(), &test_config("unused")).unwrap();
        let result = client.get_volume("pve-pure1-100-disk0").unwrap();

        assert_eq!(result, None);
        not_found.assert();
    }

    /// A 503 is retried up to `retry::MAX_ATTEMPTS` times rather than
    /// surfaced on the first failure. mockito has no built-in "fail N times
    /// then succeed" mock, so this asserts on the call count instead (every
    /// attempt hits the same always-503 mock) and on the final classified
    /// error, mirroring the teacher's `test_retriable_request_sender_retry_count`.
    #[test]
    fn request_retries_a_503_up_to_the_attempt_limit() {
        let mut server = mockito::Server::new();
        server.mock("GET", "/api/api_version").with_status(404).create();
        server.mock("GET", "/api/2.x/array").with_status(401).create();
        mock_login(&mut server);

        let busy = server
            .mock("GET", mockito::Matcher::Regex(r"^/api/2\.x/arrays/space".to_owned()))
            .with_status(503)
            .with_body(r#"{"errors": [{"message": "busy"}]}"#)
            .expect(retry::MAX_ATTEMPTS as usize)
            .create();

        let client = ArrayClient::with_base_url(server.url(), &test_config("unused")).unwrap();
        let err = client.array_info().unwrap_err();

        match err {
            ArrayError::Transient { status: 503, .. } => {}
            other => panic!("expected Transient(503), got {other:?}"),
        }
        busy.assert();
    }

    /// A 401 on an already-authenticated request triggers exactly one
    /// invalidate-and-reauthenticate cycle (`retry::MAX_AUTH_RETRIES`); a
    /// second consecutive 401 is surfaced as `AuthExpired` rather than
    /// retried again.
    #[test]
    fn session_expiry_reauthenticates_once_then_surfaces_auth_expired() {
        let mut server = mockito::Server::new();
        server.mock("GET", "/api/api_version").with_status(404).create();
        server.mock("GET", "/api/2.x/array").with_status(401).create();

        let login = server
            .mock("POST", "/api/2.x/login")
            .with_status(200)
            .with_header("x-auth-token", "sess-abc")
            .with_body("{}")
            .expect(2) // initial login + one reauth after the first 401
            .create();
        let unauthorized = server
            .mock("GET", mockito::Matcher::Regex(r"^/api/2\.x/arrays/space".to_owned()))
            .with_status(401)
            .with_body(r#"{"errors": [{"message": "session expired"}]}"#)
            .expect(2)
            .create();

        let client = ArrayClient::with_base_url(server.url(), &test_config("unused")).unwrap();
        let err = client.array_info().unwrap_err();

        match err {
            ArrayError::AuthExpired { .. } => {}
            other => panic!("expected AuthExpired, got {other:?}"),
        }
        login.assert();
        unauthorized.assert();
    }
}
