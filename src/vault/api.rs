//! HTTP key vault.
//!
//! Four wire formats are supported, picked by [`ApiMode`]:
//!
//! - `path`: keys live at `{uri}/{service}/{kid}`. `GET` reads and `POST`
//!   with `{"content_key": "<hex>"}` inserts. Replies carry a numeric `code`
//!   (0 is success); reads add `content_key`, writes may add
//!   `inserted: false` when the KID was already stored.
//! - `query`: every call is a `GET {uri}` with `service`, `username`,
//!   `password` and optionally `kid`/`key` query parameters. Replies carry
//!   `status_code` (200 is success) and a `keys` list.
//! - `json`: every call is a `POST {uri}` with `{method, params, token}`.
//!   The server may hand out a `session_id` that is echoed on later calls.
//! - `decrypt_labs`: read-only cached-key lookup. Such a vault never
//!   receives writes.
//!
//! Service names are always sent in their lowercased storage form.
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{storage_name, KeyVaultEntry, Vault};
use crate::config::{ApiMode, DEFAULT_TIMEOUT_SECS};
use crate::error::{Error, Result};
use crate::key::{kid_hex, parse_kid, ContentKey};

/// Connection details of an HTTP vault.
#[derive(Debug, Clone)]
pub struct Connection {
    pub uri: String,
    pub token: String,
    pub username: Option<String>,
    pub mode: ApiMode,
}

pub struct ApiVault {
    name: String,
    no_push: bool,
    uri: String,
    token: String,
    username: String,
    mode: ApiMode,
    client: reqwest::Client,
    /// Session handed out by a `json` mode server.
    session_id: Mutex<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct PathResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    content_key: Option<String>,
    #[serde(default)]
    inserted: Option<bool>,
}

impl ApiVault {
    pub fn new(name: &str, connection: Connection, no_push: bool) -> Result<Self> {
        if connection.token.is_empty() {
            return Err(Error::Config(format!("key vault '{}': token is required", name)));
        }
        let username = match (connection.mode, connection.username) {
            (ApiMode::Query, None) => {
                return Err(Error::Config(format!(
                    "key vault '{}': username is required for query mode",
                    name
                )))
            }
            (_, username) => username.unwrap_or_default(),
        };

        let mut headers = reqwest::header::HeaderMap::new();
        if connection.mode == ApiMode::DecryptLabs {
            let value = reqwest::header::HeaderValue::from_str(&connection.token)
                .map_err(|_| Error::Config(format!("key vault '{}': invalid API key", name)))?;
            headers.insert("decrypt-labs-api-key", value);
        }
        let client = reqwest::Client::builder()
            .user_agent(concat!("cdmroute/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| Error::Other(format!("Failed to build HTTP client: {}", e)))?;

        let no_push = no_push || connection.mode == ApiMode::DecryptLabs;
        Ok(Self {
            name: name.to_string(),
            no_push,
            uri: connection.uri.trim_end_matches('/').to_string(),
            token: connection.token,
            username,
            mode: connection.mode,
            client,
            session_id: Mutex::new(None),
        })
    }

    fn unavailable(&self, reason: impl Into<String>) -> Error {
        Error::VaultUnavailable {
            vault: self.name.clone(),
            reason: reason.into(),
        }
    }

    fn transport(&self, e: reqwest::Error) -> Error {
        self.unavailable(e.without_url().to_string())
    }

    fn entry(&self, service: &str, kid: &Uuid, key: &str) -> Result<KeyVaultEntry> {
        Ok(KeyVaultEntry {
            service: service.to_string(),
            key: ContentKey::new(*kid, hex::decode(key.trim())?),
            first_seen: None,
            source_vault: self.name.clone(),
        })
    }

    async fn json_body(&self, response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        if !status.is_success() {
            return Err(self.unavailable(format!("HTTP {}", status)));
        }
        response
            .json()
            .await
            .map_err(|_| self.unavailable("invalid response body"))
    }

    /// `status_code` envelope used by `query` and `json` servers.
    fn check_status(&self, body: &Value) -> Result<()> {
        match body.get("status_code").and_then(Value::as_i64) {
            Some(200) => Ok(()),
            code => Err(self.unavailable(format!(
                "{} ({})",
                body.get("message").and_then(Value::as_str).unwrap_or("error"),
                code.map_or_else(|| "no status".to_string(), |c| c.to_string())
            ))),
        }
    }

    // path mode

    fn path_url(&self, service: &str, kid: &Uuid) -> Result<String> {
        Ok(format!("{}/{}/{}", self.uri, storage_name(service)?, kid_hex(kid)))
    }

    async fn path_read(&self, response: reqwest::Response) -> Result<PathResponse> {
        let status = response.status();
        if !status.is_success() {
            return Err(self.unavailable(format!("HTTP {}", status)));
        }
        let body: PathResponse = response
            .json()
            .await
            .map_err(|_| self.unavailable("invalid response body"))?;
        if body.code != 0 {
            return Err(self.unavailable(format!(
                "{} ({})",
                body.message.as_deref().unwrap_or("error"),
                body.code
            )));
        }
        Ok(body)
    }

    async fn path_get(&self, service: &str, kid: &Uuid) -> Result<Option<KeyVaultEntry>> {
        let response = self
            .client
            .get(self.path_url(service, kid)?)
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| self.transport(e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = self.path_read(response).await?;
        match body.content_key.filter(|k| !k.is_empty()) {
            Some(key) => Ok(Some(self.entry(service, kid, &key)?)),
            None => Ok(None),
        }
    }

    async fn path_add(&self, service: &str, key: &ContentKey) -> Result<bool> {
        let response = self
            .client
            .post(self.path_url(service, &key.kid)?)
            .bearer_auth(&self.token)
            .json(&json!({ "content_key": key.key_hex() }))
            .send()
            .await
            .map_err(|e| self.transport(e))?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(false);
        }
        let body = self.path_read(response).await?;
        Ok(body.inserted.unwrap_or(true))
    }

    // query mode

    async fn query(&self, params: &[(&str, &str)]) -> Result<Option<Value>> {
        let mut query = vec![("username", self.username.as_str()), ("password", self.token.as_str())];
        query.extend_from_slice(params);
        let response = self
            .client
            .get(&self.uri)
            .query(&query)
            .send()
            .await
            .map_err(|e| self.transport(e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = self.json_body(response).await?;
        if body.get("status_code").and_then(Value::as_i64) == Some(404) {
            return Ok(None);
        }
        self.check_status(&body)?;
        Ok(Some(body))
    }

    // json mode

    async fn request(&self, method: &str, params: Value) -> Result<Option<Value>> {
        let mut params = match params {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        let session_id = self.session_id.lock().await.clone();
        params.insert("session_id".to_string(), session_id.map_or(Value::Null, Value::String));

        let response = self
            .client
            .post(&self.uri)
            .json(&json!({ "method": method, "params": params, "token": self.token }))
            .send()
            .await
            .map_err(|e| self.transport(e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = self.json_body(response).await?;
        self.check_status(&body)?;

        let message = match body.get("message") {
            Some(message) if message.is_object() => message.clone(),
            _ => body.clone(),
        };
        if let Some(session) = message.get("session_id").and_then(Value::as_str) {
            *self.session_id.lock().await = Some(session.to_string());
        }
        if message.get("status").and_then(Value::as_str) == Some("not_found") {
            return Ok(None);
        }
        Ok(Some(message))
    }

    // decrypt_labs mode

    async fn cached_key(&self, service: &str, kid: &Uuid) -> Result<Option<String>> {
        let response = self
            .client
            .post(&self.uri)
            .json(&json!({ "service": storage_name(service)?, "kid": kid_hex(kid) }))
            .send()
            .await
            .map_err(|e| self.transport(e))?;
        let body = self.json_body(response).await?;
        if body.get("message").and_then(Value::as_str) != Some("success") {
            return Ok(None);
        }
        Ok(body.get("cached_keys").and_then(|keys| find_key(keys, kid)))
    }
}

/// Find `kid` in a key listing: a list of `kid:key` strings or
/// `{kid, key}` objects, a `{kid: key}` map, a single `{kid, key}` object,
/// or any of those encoded as a JSON string.
fn find_key(keys: &Value, kid: &Uuid) -> Option<String> {
    let is_kid = |candidate: &str| parse_kid(candidate).is_ok_and(|k| k == *kid);
    match keys {
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(decoded) if !decoded.is_string() => find_key(&decoded, kid),
            _ => text
                .split_once(':')
                .filter(|(k, _)| is_kid(k))
                .map(|(_, key)| key.to_string()),
        },
        Value::Array(entries) => entries.iter().find_map(|entry| find_key(entry, kid)),
        Value::Object(map) => match (map.get("kid").and_then(Value::as_str), map.get("key")) {
            (Some(k), Some(Value::String(key))) if is_kid(k) => Some(key.clone()),
            (Some(_), _) => None,
            (None, _) => map
                .iter()
                .find(|(k, _)| is_kid(k))
                .and_then(|(_, key)| key.as_str().map(str::to_string)),
        },
        _ => None,
    }
}

#[async_trait]
impl Vault for ApiVault {
    fn name(&self) -> &str {
        &self.name
    }

    fn no_push(&self) -> bool {
        self.no_push
    }

    async fn get_key(&self, service: &str, kid: &Uuid) -> Result<Option<KeyVaultEntry>> {
        let key = match self.mode {
            ApiMode::Path => return self.path_get(service, kid).await,
            ApiMode::Query => {
                let service = storage_name(service)?;
                let kid_param = kid_hex(kid);
                self.query(&[("service", service.as_str()), ("kid", kid_param.as_str())])
                    .await?
                    .and_then(|body| body.get("keys").and_then(|keys| find_key(keys, kid)))
            }
            ApiMode::Json => self
                .request("GetKey", json!({ "kid": kid_hex(kid), "service": storage_name(service)? }))
                .await?
                .and_then(|body| body.get("keys").and_then(|keys| find_key(keys, kid))),
            ApiMode::DecryptLabs => self.cached_key(service, kid).await?,
        };
        match key.filter(|k| !k.is_empty()) {
            Some(key) => Ok(Some(self.entry(service, kid, &key)?)),
            None => Ok(None),
        }
    }

    async fn add_key(&self, service: &str, key: &ContentKey) -> Result<bool> {
        match self.mode {
            ApiMode::Path => self.path_add(service, key).await,
            ApiMode::Query => {
                let service = storage_name(service)?;
                let (kid, hex) = (key.kid_hex(), key.key_hex());
                let body = self
                    .query(&[
                        ("service", service.as_str()),
                        ("kid", kid.as_str()),
                        ("key", hex.as_str()),
                    ])
                    .await?
                    .ok_or_else(|| self.unavailable("endpoint not found"))?;
                Ok(body.get("inserted").and_then(Value::as_bool).unwrap_or(true))
            }
            ApiMode::Json => {
                let body = self
                    .request(
                        "InsertKey",
                        json!({
                            "kid": key.kid_hex(),
                            "key": key.key_hex(),
                            "service": storage_name(service)?,
                            "title": null,
                        }),
                    )
                    .await?
                    .ok_or_else(|| self.unavailable("endpoint not found"))?;
                Ok(body.get("inserted").and_then(Value::as_bool).unwrap_or(false))
            }
            ApiMode::DecryptLabs => {
                debug!(vault = %self.name, "read-only vault, write ignored");
                Ok(false)
            }
        }
    }

    async fn services(&self) -> Result<Vec<String>> {
        let body = match self.mode {
            ApiMode::Query => self.query(&[("list_services", "true")]).await?,
            ApiMode::Json => self.request("GetServices", json!({})).await?,
            ApiMode::Path | ApiMode::DecryptLabs => {
                return Err(self.unavailable("listing services is not supported"))
            }
        };
        Ok(body
            .and_then(|body| body.get("services").cloned())
            .and_then(|services| serde_json::from_value(services).ok())
            .unwrap_or_default())
    }

    async fn list_keys(&self, service: &str) -> Result<Vec<KeyVaultEntry>> {
        if self.mode != ApiMode::Query {
            return Err(self.unavailable("listing keys is not supported"));
        }
        let storage = storage_name(service)?;
        let Some(body) = self.query(&[("service", storage.as_str())]).await? else {
            return Ok(Vec::new());
        };
        let mut entries = Vec::new();
        for item in body.get("keys").and_then(Value::as_array).into_iter().flatten() {
            let (Some(kid), Some(key)) = (
                item.get("kid").and_then(Value::as_str),
                item.get("key").and_then(Value::as_str),
            ) else {
                continue;
            };
            entries.push(self.entry(service, &parse_kid(kid)?, key)?);
        }
        Ok(entries)
    }
}
