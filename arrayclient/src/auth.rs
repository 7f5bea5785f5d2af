//! Session authentication (spec.md §4.B "Authentication", §5
//! "Shared-resource policy", Design Notes "Global/process state").
//!
//! Two-stage per dialect: v2 exchanges an API token for an `x-auth-token`
//! session; v1 does the analogous dance against `/auth/session`. The token
//! is cached per-process and stamped with the minting PID so a forked
//! worker detects the stale cache and re-authenticates rather than reusing
//! a token that may not be safe to share post-fork.

use std::process;

use log::{debug, info};
use reqwest::blocking::Client;
use vol_api::{
    config::Credentials,
    error::ArrayError,
};

use crate::dialect::ApiVersion;

/// Process-wide session cache. One instance lives for the lifetime of the
/// `ArrayClient`; fork-awareness means it is still correct if the holding
/// process forks without recreating the client.
#[derive(Debug, Clone, Default)]
pub struct SessionCache {
    token: Option<String>,
    minted_by_pid: u32,
}

impl SessionCache {
    /// Returns the cached token only if it was minted by this process.
    pub fn get(&self) -> Option<&str> {
        if self.minted_by_pid == process::id() {
            self.token.as_deref()
        } else {
            None
        }
    }

    pub fn set(&mut self, token: String) {
        self.minted_by_pid = process::id();
        self.token = Some(token);
    }

    pub fn invalidate(&mut self) {
        self.token = None;
    }
}

/// Logs in against the array, returning a fresh `x-auth-token`. Bootstraps
/// a v2 API token from username+password via `/auth/apitoken` when the
/// configured credentials are not already a token.
pub fn login(
    client: &Client,
    base_url: &str,
    version: ApiVersion,
    credentials: &Credentials,
    ssl_verify_informational: bool,
) -> Result<String, ArrayError> {
    debug!("Authenticating against array API {} (ssl_verify={ssl_verify_informational})", version.as_path_segment());
    match version {
        ApiVersion::V2 => login_v2(client, base_url, credentials),
        ApiVersion::V1 => login_v1(client, base_url, credentials),
    }
}

fn login_v2(client: &Client, base_url: &str, credentials: &Credentials) -> Result<String, ArrayError> {
    let api_token = match credentials {
        Credentials::ApiToken { api_token } => api_token.clone(),
        Credentials::UserPass { username, password } => {
            bootstrap_v2_api_token(client, base_url, username, password)?
        }
    };

    let resp = client
        .post(format!("{base_url}/api/2.x/login"))
        .header("api-token", api_token)
        .send()
        .map_err(|e| ArrayError::Transport(e.to_string()))?;

    extract_session_token(resp)
}

fn bootstrap_v2_api_token(
    client: &Client,
    base_url: &str,
    username: &str,
    password: &str,
) -> Result<String, ArrayError> {
    let resp = client
        .post(format!("{base_url}/api/1.x/auth/apitoken"))
        .basic_auth(username, Some(password))
        .send()
        .map_err(|e| ArrayError::Transport(e.to_string()))?;

    if !resp.status().is_success() {
        return Err(ArrayError::Rejected {
            status: resp.status().as_u16(),
            message: "failed to bootstrap an API token from username/password".to_owned(),
        });
    }

    #[derive(serde::Deserialize)]
    struct ApiTokenResponse {
        api_token: String,
    }
    let parsed: ApiTokenResponse = resp
        .json()
        .map_err(|e| ArrayError::Transport(e.to_string()))?;
    Ok(parsed.api_token)
}

fn login_v1(client: &Client, base_url: &str, credentials: &Credentials) -> Result<String, ArrayError> {
    let (username, password) = match credentials {
        Credentials::UserPass { username, password } => (username.clone(), password.clone()),
        Credentials::ApiToken { api_token } => ("api-token".to_owned(), api_token.clone()),
    };

    let resp = client
        .post(format!("{base_url}/api/1.x/auth/session"))
        .basic_auth(username, Some(password))
        .send()
        .map_err(|e| ArrayError::Transport(e.to_string()))?;

    extract_session_token(resp)
}

fn extract_session_token(resp: reqwest::blocking::Response) -> Result<String, ArrayError> {
    if !resp.status().is_success() {
        return Err(ArrayError::Rejected {
            status: resp.status().as_u16(),
            message: "authentication was rejected by the array".to_owned(),
        });
    }
    let token = resp
        .headers()
        .get("x-auth-token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .ok_or_else(|| ArrayError::Transport("login response carried no x-auth-token header".to_owned()))?;
    info!("Array session established");
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_is_invisible_to_a_different_pid() {
        let mut cache = SessionCache::default();
        cache.set("tok".to_owned());
        assert_eq!(cache.get(), Some("tok"));
        // Simulate a fork: a cache stamped by a PID other than ours.
        cache.minted_by_pid = 0;
        assert_eq!(cache.get(), None);
    }

    #[test]
    fn invalidate_clears_token_without_clearing_pid_stamp() {
        let mut cache = SessionCache::default();
        cache.set("tok".to_owned());
        cache.invalidate();
        assert_eq!(cache.get(), None);
    }
}
