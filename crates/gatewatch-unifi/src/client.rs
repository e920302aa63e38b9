//! Controller sessions, URL construction, auth modes, and the
//! test-connection probe.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use gatewatch_store::Store;

use crate::{UnifiError, UnifiResult};

pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerType {
    /// UniFi OS gateway: API-key auth, classic + integration APIs.
    UnifiOs,
    /// Legacy self-hosted controller: cookie login, classic API only.
    SelfHosted,
}

impl ControllerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerType::UnifiOs => "unifi_os",
            ControllerType::SelfHosted => "self_hosted",
        }
    }

    pub fn from_config(raw: &str) -> Self {
        if raw == "self_hosted" {
            ControllerType::SelfHosted
        } else {
            ControllerType::UnifiOs
        }
    }
}

/// Feature toggles for the integration, persisted as `unifi_features`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Features {
    #[serde(default = "default_true")]
    pub client_names: bool,
    #[serde(default = "default_true")]
    pub device_discovery: bool,
    #[serde(default = "default_true")]
    pub network_config: bool,
    #[serde(default = "default_true")]
    pub firewall_management: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Features {
    fn default() -> Self {
        Self {
            client_names: true,
            device_discovery: true,
            network_config: true,
            firewall_management: true,
        }
    }
}

/// Resolved connection settings: env > config store > default.
#[derive(Debug, Clone, Default)]
pub(crate) struct ClientState {
    pub enabled: bool,
    pub host: String,
    pub api_key: String,
    pub site: String,
    pub verify_ssl: bool,
    pub controller_type: Option<ControllerType>,
    pub username: String,
    pub password: String,
    /// Legacy: resolved site `_id`; Modern: cached integration site UUID.
    pub site_id: Option<String>,
    pub site_uuid: Option<String>,
    pub features: Features,
    pub csrf_token: Option<String>,
}

impl ClientState {
    fn controller_type(&self) -> ControllerType {
        self.controller_type.unwrap_or(ControllerType::UnifiOs)
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct PollStatus {
    pub last_poll: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub client_count: usize,
    pub device_count: usize,
}

/// Settings view returned to the UI, with per-key source indicators.
#[derive(Debug, Serialize)]
pub struct UnifiSettings {
    pub enabled: bool,
    pub host: String,
    pub host_source: String,
    pub api_key_set: bool,
    pub api_key_source: String,
    pub site: String,
    pub verify_ssl: bool,
    pub poll_interval: u64,
    pub features: Features,
    pub controller_name: String,
    pub controller_version: String,
    pub controller_type: String,
    pub supports_firewall: bool,
    pub auth_mode: String,
    pub username_set: bool,
    pub status: serde_json::Value,
}

/// Discriminated test-connection result.
#[derive(Debug, Default, Serialize)]
pub struct TestOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl TestOutcome {
    fn failure(error: impl Into<String>, code: &str) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            error_code: Some(code.to_string()),
            ..Default::default()
        }
    }
}

pub struct UnifiClient {
    pub(crate) store: Store,
    pub(crate) state: RwLock<ClientState>,
    pub(crate) http: RwLock<Option<reqwest::Client>>,
    pub(crate) names: StdMutex<(HashMap<String, String>, HashMap<String, String>)>,
    pub(crate) poll_status: StdMutex<PollStatus>,
    pub(crate) poll_generation: std::sync::atomic::AtomicU64,
}

impl UnifiClient {
    pub async fn new(store: Store) -> Self {
        let client = Self {
            store,
            state: RwLock::new(ClientState::default()),
            http: RwLock::new(None),
            names: StdMutex::new((HashMap::new(), HashMap::new())),
            poll_status: StdMutex::new(PollStatus::default()),
            poll_generation: std::sync::atomic::AtomicU64::new(0),
        };
        if let Err(e) = client.resolve_config().await {
            warn!("Controller config resolution failed (store may not be ready): {e}");
        }
        client
    }

    pub async fn enabled(&self) -> bool {
        self.state.read().await.enabled
    }

    pub async fn features(&self) -> Features {
        self.state.read().await.features.clone()
    }

    pub async fn host(&self) -> String {
        self.state.read().await.host.clone()
    }

    // ── Config resolution ─────────────────────────────────────────────

    /// Load settings with env > config store > default precedence.
    pub async fn resolve_config(&self) -> gatewatch_core::Result<()> {
        let store = &self.store;

        let host = match std::env::var("UNIFI_HOST") {
            Ok(host) if !host.is_empty() => host,
            _ => store.get_config_or("unifi_host", String::new()).await,
        }
        .trim_end_matches('/')
        .to_string();

        let api_key = match std::env::var("UNIFI_API_KEY") {
            Ok(key) if !key.is_empty() => key,
            _ => store.get_encrypted_config("unifi_api_key").await,
        };

        let site = match std::env::var("UNIFI_SITE") {
            Ok(site) if !site.is_empty() => site,
            _ => store.get_config_or("unifi_site", "default".to_string()).await,
        };

        let verify_ssl = match std::env::var("UNIFI_VERIFY_SSL").ok().as_deref() {
            Some("false") | Some("0") | Some("no") => false,
            Some(_) => true,
            None => store.get_config_or("unifi_verify_ssl", true).await,
        };

        let mut features: Features = store.get_config_or("unifi_features", Features::default()).await;

        let controller_type = ControllerType::from_config(
            &store.get_config_or("unifi_controller_type", "unifi_os".to_string()).await,
        );
        let username = store.get_encrypted_config("unifi_username").await;
        let password = store.get_encrypted_config("unifi_password").await;
        let site_id = store.get_config::<String>("unifi_site_id").await.ok().flatten();

        // Legacy controllers have no integration API: no firewall writes
        if controller_type == ControllerType::SelfHosted {
            features.firewall_management = false;
        }

        let mut enabled = match std::env::var("UNIFI_ENABLED").ok().as_deref() {
            Some("true") | Some("1") | Some("yes") => true,
            Some("false") | Some("0") | Some("no") => false,
            _ => store.get_config_or("unifi_enabled", false).await,
        };

        let has_credentials = match controller_type {
            ControllerType::SelfHosted => !username.is_empty() && !password.is_empty(),
            ControllerType::UnifiOs => !api_key.is_empty(),
        };

        // Auto-enable when both env vars are present
        if !enabled
            && !host.is_empty()
            && !api_key.is_empty()
            && std::env::var("UNIFI_HOST").is_ok()
            && std::env::var("UNIFI_API_KEY").is_ok()
        {
            if store.set_config("unifi_enabled", &true).await.is_ok() {
                enabled = true;
                info!("Controller integration auto-enabled (UNIFI_HOST + UNIFI_API_KEY env vars detected)");
            }
        }

        let mut state = self.state.write().await;
        *state = ClientState {
            enabled: enabled && !host.is_empty() && has_credentials,
            host,
            api_key,
            site,
            verify_ssl,
            controller_type: Some(controller_type),
            username,
            password,
            site_id,
            site_uuid: None,
            features,
            csrf_token: None,
        };
        drop(state);

        // Session must be rebuilt with the new credentials
        *self.http.write().await = None;
        Ok(())
    }

    /// Re-read settings, drop the session and cached site ids, restart
    /// polling when enabled.
    pub async fn reload_config(self: std::sync::Arc<Self>) {
        if let Err(e) = self.resolve_config().await {
            warn!("Controller config reload failed: {e}");
            return;
        }
        let state = self.state.read().await;
        info!(
            "Controller config reloaded (enabled={}, host={})",
            state.enabled,
            if state.host.is_empty() { "(none)" } else { &state.host }
        );
        drop(state);
        self.start_polling().await;
    }

    /// Source indicator ("env" / "db" / "default") for a settings key.
    pub async fn config_source(&self, key: &str) -> String {
        let env_var = match key {
            "host" => Some("UNIFI_HOST"),
            "api_key" => Some("UNIFI_API_KEY"),
            "site" => Some("UNIFI_SITE"),
            "verify_ssl" => Some("UNIFI_VERIFY_SSL"),
            _ => None,
        };
        if let Some(var) = env_var {
            if std::env::var(var).map(|v| !v.is_empty()).unwrap_or(false) {
                return "env".to_string();
            }
        }
        let db_key = format!("unifi_{key}");
        match self.store.get_config_value(&db_key).await {
            Ok(Some(value)) if value != Value::String(String::new()) => "db".to_string(),
            _ => "default".to_string(),
        }
    }

    pub async fn poll_interval(&self) -> u64 {
        if let Ok(raw) = std::env::var("UNIFI_POLL_INTERVAL") {
            if let Ok(secs) = raw.parse::<u64>() {
                if secs > 0 {
                    return secs;
                }
            }
        }
        self.store.get_config_or("unifi_poll_interval", 300u64).await
    }

    /// Current settings + status view for the UI.
    pub async fn settings_info(&self) -> UnifiSettings {
        let state = self.state.read().await;
        let status = self.poll_status.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let controller_type = state.controller_type();
        UnifiSettings {
            enabled: state.enabled,
            host: state.host.clone(),
            host_source: self.config_source("host").await,
            api_key_set: !state.api_key.is_empty(),
            api_key_source: self.config_source("api_key").await,
            site: state.site.clone(),
            verify_ssl: state.verify_ssl,
            poll_interval: self.poll_interval().await,
            features: state.features.clone(),
            controller_name: self.store.get_config_or("unifi_controller_name", String::new()).await,
            controller_version: self
                .store
                .get_config_or("unifi_controller_version", String::new())
                .await,
            controller_type: controller_type.as_str().to_string(),
            supports_firewall: controller_type != ControllerType::SelfHosted,
            auth_mode: match controller_type {
                ControllerType::SelfHosted => "cookie",
                ControllerType::UnifiOs => "api_key",
            }
            .to_string(),
            username_set: !state.username.is_empty(),
            status: serde_json::json!({
                "connected": status.last_poll.is_some() && status.last_error.is_none(),
                "last_poll": status.last_poll.map(|t| t.to_rfc3339()),
                "last_error": status.last_error,
                "client_count": status.client_count,
                "device_count": status.device_count,
                "polling_paused": false,
            }),
        }
    }

    // ── Sessions ──────────────────────────────────────────────────────

    fn build_http(verify_ssl: bool, cookies: bool, api_key: Option<&str>) -> UnifiResult<reqwest::Client> {
        let mut headers = HeaderMap::new();
        if let Some(key) = api_key {
            if let Ok(value) = HeaderValue::from_str(key) {
                headers.insert("X-API-KEY", value);
            }
        }
        let mut builder = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(!verify_ssl)
            .default_headers(headers);
        if cookies {
            builder = builder.cookie_store(true);
        }
        Ok(builder.build()?)
    }

    /// Lazily create the persistent session, logging in when legacy.
    pub(crate) async fn session(&self) -> UnifiResult<reqwest::Client> {
        if let Some(client) = self.http.read().await.as_ref() {
            return Ok(client.clone());
        }

        let state = self.state.read().await;
        let (client, csrf) = match state.controller_type() {
            ControllerType::SelfHosted => {
                let client = Self::build_http(state.verify_ssl, true, None)?;
                let csrf = Self::login(
                    &client,
                    &state.host,
                    &state.username,
                    &state.password,
                )
                .await?;
                (client, csrf)
            }
            ControllerType::UnifiOs => {
                (Self::build_http(state.verify_ssl, false, Some(&state.api_key))?, None)
            }
        };
        drop(state);

        if let Some(csrf) = csrf {
            self.state.write().await.csrf_token = Some(csrf);
        }
        *self.http.write().await = Some(client.clone());
        Ok(client)
    }

    pub(crate) async fn drop_session(&self) {
        *self.http.write().await = None;
        let mut state = self.state.write().await;
        state.csrf_token = None;
    }

    /// Cookie login; returns the CSRF token when the controller sent one.
    async fn login(
        client: &reqwest::Client,
        host: &str,
        username: &str,
        password: &str,
    ) -> UnifiResult<Option<String>> {
        let response = client
            .post(format!("{host}/api/login"))
            .json(&serde_json::json!({
                "username": username,
                "password": password,
                "remember": true,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(UnifiError::Status {
                status: response.status().as_u16(),
                body: "login failed".to_string(),
            });
        }

        Ok(response
            .headers()
            .get("X-Csrf-Token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string))
    }

    /// Does a legacy response body signal an expired session?
    fn is_login_required(body: &Value) -> bool {
        body.pointer("/meta/msg").and_then(Value::as_str) == Some("api.err.LoginRequired")
    }

    // ── URL construction ──────────────────────────────────────────────

    pub(crate) async fn classic_url(&self, path: &str) -> String {
        let state = self.state.read().await;
        let path = path.trim_start_matches('/');
        match state.controller_type() {
            ControllerType::SelfHosted => {
                let site = state.site_id.as_deref().unwrap_or(&state.site);
                format!("{}/api/s/{}/{}", state.host, site, path)
            }
            ControllerType::UnifiOs => {
                format!("{}/proxy/network/api/s/{}/{}", state.host, state.site, path)
            }
        }
    }

    // ── Classic API ───────────────────────────────────────────────────

    /// Attach the legacy CSRF token captured at login, when present.
    async fn with_csrf(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.state.read().await.csrf_token.clone() {
            Some(csrf) => request.header("X-Csrf-Token", csrf),
            None => request,
        }
    }

    /// GET from the classic API, with one silent re-login on an expired
    /// legacy session.
    pub(crate) async fn get_classic(&self, path: &str) -> UnifiResult<Value> {
        let url = self.classic_url(path).await;
        let client = self.session().await?;
        let response = self.with_csrf(client.get(&url)).await.send().await?;

        let is_legacy = self.state.read().await.controller_type() == ControllerType::SelfHosted;
        if is_legacy {
            let status = response.status();
            let body: Value = if status.is_success() {
                response.json().await.unwrap_or(Value::Null)
            } else {
                Value::Null
            };

            let expired = matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
                || Self::is_login_required(&body);
            if expired {
                debug!("Legacy session expired, re-authenticating");
                self.drop_session().await;
                let client = self.session().await?;
                let retry = self.with_csrf(client.get(&url)).await.send().await?;
                if !retry.status().is_success() {
                    return Err(UnifiError::Status {
                        status: retry.status().as_u16(),
                        body: retry.text().await.unwrap_or_default(),
                    });
                }
                return Ok(retry.json().await?);
            }

            if !status.is_success() {
                return Err(UnifiError::Status {
                    status: status.as_u16(),
                    body: String::new(),
                });
            }
            return Ok(body);
        }

        if !response.status().is_success() {
            return Err(UnifiError::Status {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }

    // ── Integration API ───────────────────────────────────────────────

    fn check_integration_permissions(status: StatusCode) -> UnifiResult<()> {
        match status.as_u16() {
            401 => Err(UnifiError::Permission {
                status: 401,
                message: "Authentication failed. Check your API key.".to_string(),
            }),
            403 => Err(UnifiError::Permission {
                status: 403,
                message: "Insufficient permissions. Your API key must belong to a \
                          Local Admin account with Network permissions. Read-only \
                          or viewer API keys cannot access the Integration API."
                    .to_string(),
            }),
            _ => Ok(()),
        }
    }

    async fn require_modern(&self) -> UnifiResult<()> {
        if self.state.read().await.controller_type() == ControllerType::SelfHosted {
            return Err(UnifiError::NotSupportedOnLegacy);
        }
        Ok(())
    }

    /// GET from the integration API without a site prefix.
    pub(crate) async fn get_integration(&self, path: &str) -> UnifiResult<Value> {
        self.require_modern().await?;
        let host = self.state.read().await.host.clone();
        let url = format!("{host}/proxy/network{path}");
        let client = self.session().await?;
        let response = client.get(&url).send().await?;
        Self::check_integration_permissions(response.status())?;
        if !response.status().is_success() {
            return Err(UnifiError::Status {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }

    /// Map the classic site name to the integration API's site UUID.
    async fn discover_site_uuid(&self) -> UnifiResult<String> {
        self.require_modern().await?;
        if let Some(uuid) = self.state.read().await.site_uuid.clone() {
            return Ok(uuid);
        }

        let site = self.state.read().await.site.clone();
        let sites = self.get_integration("/integration/v1/sites").await?;
        let found = sites
            .pointer("/data")
            .and_then(Value::as_array)
            .and_then(|entries| {
                entries.iter().find(|s| {
                    s.get("internalReference").and_then(Value::as_str) == Some(site.as_str())
                })
            })
            .and_then(|s| s.get("id").and_then(Value::as_str))
            .map(str::to_string);

        match found {
            Some(uuid) => {
                info!("Discovered site UUID: {uuid} for site '{site}'");
                self.state.write().await.site_uuid = Some(uuid.clone());
                Ok(uuid)
            }
            None => Err(UnifiError::SiteNotFound(site)),
        }
    }

    /// GET from the integration API under the site UUID prefix.
    pub(crate) async fn get_integration_site(&self, path: &str) -> UnifiResult<Value> {
        let uuid = self.discover_site_uuid().await?;
        let host = self.state.read().await.host.clone();
        let url = format!("{host}/proxy/network/integration/v1/sites/{uuid}{path}");
        let client = self.session().await?;
        let response = client.get(&url).send().await?;
        Self::check_integration_permissions(response.status())?;
        if !response.status().is_success() {
            return Err(UnifiError::Status {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }

    /// PATCH to the integration API under the site UUID prefix.
    pub(crate) async fn patch_integration_site(&self, path: &str, body: &Value) -> UnifiResult<Value> {
        let uuid = self.discover_site_uuid().await?;
        let host = self.state.read().await.host.clone();
        let url = format!("{host}/proxy/network/integration/v1/sites/{uuid}{path}");
        let client = self.session().await?;
        let response = client.patch(&url).json(body).send().await?;
        Self::check_integration_permissions(response.status())?;
        if !response.status().is_success() {
            return Err(UnifiError::Status {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }

    // ── Test connection ───────────────────────────────────────────────

    /// Probe a controller with the given credentials, never touching the
    /// persistent session or stored settings.
    #[allow(clippy::too_many_arguments)]
    pub async fn test_connection(
        &self,
        host: &str,
        site: &str,
        verify_ssl: bool,
        controller_type: ControllerType,
        api_key: Option<&str>,
        username: Option<&str>,
        password: Option<&str>,
    ) -> TestOutcome {
        let host = host.trim_end_matches('/');
        let result = match controller_type {
            ControllerType::SelfHosted => {
                self.test_legacy(host, site, verify_ssl, username.unwrap_or(""), password.unwrap_or(""))
                    .await
            }
            ControllerType::UnifiOs => {
                self.test_modern(host, site, verify_ssl, api_key.unwrap_or("")).await
            }
        };

        match result {
            Ok(outcome) => outcome,
            Err(UnifiError::Http(e)) if e.is_timeout() => TestOutcome::failure(
                "Connection timed out. The controller may be unreachable.",
                "timeout",
            ),
            Err(UnifiError::Http(e)) if e.is_connect() => {
                if e.to_string().contains("certificate") {
                    TestOutcome::failure(
                        "SSL certificate verification failed. Enable \"Skip SSL verification\" for self-signed certificates.",
                        "ssl_error",
                    )
                } else {
                    TestOutcome::failure(
                        "Could not connect to the controller. Check the URL and ensure it is reachable.",
                        "connection_error",
                    )
                }
            }
            Err(UnifiError::Status { status, .. }) if matches!(status, 401 | 403) => {
                let msg = match controller_type {
                    ControllerType::SelfHosted => "Authentication failed. Check your credentials.",
                    ControllerType::UnifiOs => "Authentication failed. Check your API key.",
                };
                TestOutcome::failure(msg, "auth_error")
            }
            Err(UnifiError::Status { status, .. }) => {
                TestOutcome::failure(format!("Controller returned error: {status}"), "invalid_response")
            }
            Err(UnifiError::SiteNotFound(site)) => TestOutcome::failure(
                format!("Site '{site}' not found on this controller."),
                "invalid_response",
            ),
            Err(e) => TestOutcome::failure(e.to_string(), "connection_error"),
        }
    }

    async fn test_modern(
        &self,
        host: &str,
        site: &str,
        verify_ssl: bool,
        api_key: &str,
    ) -> UnifiResult<TestOutcome> {
        let client = Self::build_http(verify_ssl, false, Some(api_key))?;

        let url = format!("{host}/proxy/network/api/s/{site}/stat/sysinfo");
        let response = client.get(&url).send().await?;
        match response.status().as_u16() {
            401 => {
                return Ok(TestOutcome::failure(
                    "Authentication failed. Check your API key.",
                    "auth_error",
                ))
            }
            403 => {
                return Ok(TestOutcome::failure(
                    "Insufficient permissions. Ensure your API key belongs to a Local Admin account.",
                    "auth_error",
                ))
            }
            status if !(200..300).contains(&status) => {
                return Err(UnifiError::Status { status, body: String::new() })
            }
            _ => {}
        }

        let body: Value = response.json().await?;
        let info = body
            .pointer("/data/0")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));
        let controller_name = info
            .get("name")
            .or_else(|| info.get("hostname"))
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string();
        let version = info
            .get("version")
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string();

        // Integration API reachability gates firewall management
        let sites_url = format!("{host}/proxy/network/integration/v1/sites");
        let sites_response = client.get(&sites_url).send().await?;
        match sites_response.status().as_u16() {
            401 => {
                return Ok(TestOutcome::failure(
                    "Authentication failed. Check your API key.",
                    "auth_error",
                ))
            }
            403 => {
                // Classic works but integration is denied — usable, limited
                return Ok(TestOutcome {
                    success: true,
                    controller_name: Some(controller_name),
                    version: Some(version),
                    site_name: Some(site.to_string()),
                    warning: Some(
                        "Insufficient permissions — a Local Admin API key with Network \
                         permissions is required for firewall logging management. You can \
                         continue to use the app but won't be able to toggle rule logging."
                            .to_string(),
                    ),
                    ..Default::default()
                });
            }
            status if !(200..300).contains(&status) => {
                return Err(UnifiError::Status { status, body: String::new() })
            }
            _ => {}
        }

        let sites_body: Value = sites_response.json().await?;
        let site_name = sites_body
            .pointer("/data")
            .and_then(Value::as_array)
            .and_then(|entries| {
                entries
                    .iter()
                    .find(|s| s.get("internalReference").and_then(Value::as_str) == Some(site))
            })
            .and_then(|s| s.get("name").and_then(Value::as_str))
            .map(str::to_string);

        match site_name {
            Some(site_name) => Ok(TestOutcome {
                success: true,
                controller_name: Some(controller_name),
                version: Some(version),
                site_name: Some(site_name),
                ..Default::default()
            }),
            None => Ok(TestOutcome::failure(
                format!("Site '{site}' not found on this controller."),
                "invalid_response",
            )),
        }
    }

    async fn test_legacy(
        &self,
        host: &str,
        site: &str,
        verify_ssl: bool,
        username: &str,
        password: &str,
    ) -> UnifiResult<TestOutcome> {
        let client = Self::build_http(verify_ssl, true, None)?;
        Self::login(&client, host, username, password).await.map_err(|e| match e {
            UnifiError::Status { .. } => UnifiError::Status { status: 401, body: "login failed".into() },
            other => other,
        })?;

        // Legacy endpoints want the unique `_id`, not the display name
        let site_id = Self::resolve_site_id(&client, host, site).await?;

        let url = format!("{host}/api/s/{site_id}/stat/sysinfo");
        let response = client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(UnifiError::Status {
                status: response.status().as_u16(),
                body: String::new(),
            });
        }
        let body: Value = response.json().await?;
        if Self::is_login_required(&body) {
            return Ok(TestOutcome::failure(
                "Authentication failed. Check your credentials.",
                "auth_error",
            ));
        }

        let info = body
            .pointer("/data/0")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));
        Ok(TestOutcome {
            success: true,
            controller_name: Some(
                info.get("name")
                    .or_else(|| info.get("hostname"))
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown")
                    .to_string(),
            ),
            version: Some(
                info.get("version")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown")
                    .to_string(),
            ),
            site_name: Some(site.to_string()),
            site_id: Some(site_id),
            ..Default::default()
        })
    }

    /// Resolve a legacy site name/description to its `_id`.
    pub(crate) async fn resolve_site_id(
        client: &reqwest::Client,
        host: &str,
        site: &str,
    ) -> UnifiResult<String> {
        let response = client.get(format!("{host}/api/self/sites")).send().await?;
        if !response.status().is_success() {
            return Err(UnifiError::Status {
                status: response.status().as_u16(),
                body: String::new(),
            });
        }
        let body: Value = response.json().await?;
        body.pointer("/data")
            .and_then(Value::as_array)
            .and_then(|sites| {
                sites.iter().find(|s| {
                    s.get("name").and_then(Value::as_str) == Some(site)
                        || s.get("desc").and_then(Value::as_str) == Some(site)
                })
            })
            .and_then(|s| s.get("_id").and_then(Value::as_str))
            .map(str::to_string)
            .ok_or_else(|| UnifiError::SiteNotFound(site.to_string()))
    }

    /// Resolve a device name from the in-memory maps: MAC first, then IP.
    pub async fn resolve_name(&self, ip: Option<&str>, mac: Option<&str>) -> Option<String> {
        if !self.state.read().await.features.client_names {
            return None;
        }
        let maps = self.names.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mac) = mac {
            if let Some(name) = maps.1.get(&mac.to_lowercase()) {
                return Some(name.clone());
            }
        }
        ip.and_then(|ip| maps.0.get(ip).cloned())
    }
}
