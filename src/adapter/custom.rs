//! Configurable remote CDM API.
//!
//! Same two-step flow as the managed dialect, but every request and response
//! shape comes from configuration (see [`super::mapping`]).
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::mapping::{self, ParsedResponse};
use super::{
    b64, covers, http_client, transport_error, Challenge, ChallengeRequest, LicenseChallenge,
    ProtocolAdapter, SessionState,
};
use crate::config::{
    AuthConfig, CustomRemoteConfig, EndpointConfig, RequestMapping, ResponseMapping,
};
use crate::drm::DrmType;
use crate::error::{Error, Result};
use crate::key::{merge_keys, ContentKey};
use crate::registry::CdmDescriptor;

/// How credentials are attached to each request.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthStrategy {
    None,
    Bearer(String),
    Header { name: String, value: String },
    Basic { username: String, password: String },
    /// Injected into the JSON body after request mapping.
    Body { field: String, value: String },
    Query { name: String, value: String },
}

impl std::fmt::Debug for AuthStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthStrategy::None => f.write_str("None"),
            AuthStrategy::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            AuthStrategy::Header { name, .. } => write!(f, "Header({})", name),
            AuthStrategy::Basic { username, .. } => write!(f, "Basic({})", username),
            AuthStrategy::Body { field, .. } => write!(f, "Body({})", field),
            AuthStrategy::Query { name, .. } => write!(f, "Query({})", name),
        }
    }
}

impl AuthStrategy {
    /// Compile an `auth` block. Missing credentials mean no auth.
    pub fn from_config(auth: &AuthConfig) -> Result<Self> {
        let key = auth.key.clone().filter(|k| !k.is_empty());
        let strategy = match auth.auth_type.to_ascii_lowercase().as_str() {
            "header" => key.map(|value| AuthStrategy::Header {
                name: auth
                    .header_name
                    .clone()
                    .unwrap_or_else(|| "Authorization".to_string()),
                value,
            }),
            "bearer" => auth
                .bearer_token
                .clone()
                .filter(|t| !t.is_empty())
                .or(key)
                .map(AuthStrategy::Bearer),
            "basic" => match (&auth.username, &auth.password) {
                (Some(username), Some(password)) if !username.is_empty() => {
                    Some(AuthStrategy::Basic {
                        username: username.clone(),
                        password: password.clone(),
                    })
                }
                _ => None,
            },
            "body" => key.map(|value| AuthStrategy::Body {
                field: auth.field.clone().unwrap_or_else(|| "api_key".to_string()),
                value,
            }),
            "query" => key.map(|value| AuthStrategy::Query {
                name: auth.field.clone().unwrap_or_else(|| "api_key".to_string()),
                value,
            }),
            other => {
                return Err(Error::Config(format!("unknown auth type '{}'", other)));
            }
        };
        Ok(strategy.unwrap_or(AuthStrategy::None))
    }

    fn apply(
        &self,
        request: reqwest::RequestBuilder,
        body: &mut Map<String, Value>,
    ) -> reqwest::RequestBuilder {
        match self {
            AuthStrategy::None => request,
            AuthStrategy::Bearer(token) => request.bearer_auth(token),
            AuthStrategy::Header { name, value } => request.header(name.as_str(), value.as_str()),
            AuthStrategy::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            AuthStrategy::Body { field, value } => {
                body.insert(field.clone(), json!(value));
                request
            }
            AuthStrategy::Query { name, value } => request.query(&[(name, value)]),
        }
    }
}

/// A resolved endpoint.
#[derive(Debug, Clone)]
struct Endpoint {
    path: String,
    method: Method,
    timeout: Duration,
}

impl Endpoint {
    fn new(config: &EndpointConfig, fallback_timeout: Duration) -> Result<Self> {
        let method = Method::from_bytes(config.method().to_ascii_uppercase().as_bytes())
            .map_err(|_| Error::Config(format!("invalid HTTP method '{}'", config.method())))?;
        Ok(Self {
            path: config.path().to_string(),
            method,
            timeout: config
                .timeout()
                .map(Duration::from_secs)
                .unwrap_or(fallback_timeout),
        })
    }
}

pub struct CustomAdapter {
    name: String,
    config: CustomRemoteConfig,
    drm_type: DrmType,
    auth: AuthStrategy,
    challenge_endpoint: Endpoint,
    decrypt_endpoint: Endpoint,
    client: reqwest::Client,
}

impl CustomAdapter {
    pub fn new(name: &str, config: CustomRemoteConfig, timeout: Duration) -> Result<Self> {
        let drm_type = CdmDescriptor::RemoteCustom(config.clone()).drm_type()?;
        let wrap = |e: Error| Error::Config(format!("remote_cdm '{}': {}", name, e));
        let auth = AuthStrategy::from_config(&config.auth).map_err(wrap)?;
        let challenge_endpoint = Endpoint::new(&config.endpoints.challenge, timeout).map_err(wrap)?;
        let decrypt_endpoint = Endpoint::new(&config.endpoints.decrypt, timeout).map_err(wrap)?;
        Ok(Self {
            name: name.to_string(),
            drm_type,
            auth,
            challenge_endpoint,
            decrypt_endpoint,
            client: http_client()?,
            config: CustomRemoteConfig {
                host: config.host.trim_end_matches('/').to_string(),
                ..config
            },
        })
    }

    /// Values conditional params may test.
    fn condition_context(&self, service: &str) -> Value {
        json!({
            "device_type": self.config.device.device_type,
            "device_name": self.config.device.name,
            "is_playready": self.drm_type == DrmType::PlayReady,
            "service": service,
        })
    }

    async fn send(
        &self,
        action: &str,
        endpoint: &Endpoint,
        request_mapping: &RequestMapping,
        response_mapping: &ResponseMapping,
        base: Map<String, Value>,
        context: &Value,
    ) -> Result<ParsedResponse> {
        let mut params = mapping::build_request_params(request_mapping, base, context)?;

        let url = format!("{}{}", self.config.host, endpoint.path);
        let mut request = self
            .client
            .request(endpoint.method.clone(), url)
            .timeout(endpoint.timeout);
        for (name, value) in &self.config.auth.custom_headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request = self.auth.apply(request, &mut params);
        request = if endpoint.method == Method::GET {
            request.query(&params)
        } else {
            request.json(&params)
        };

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(&self.name, action, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::RemoteApi(format!(
                "{}: {} failed with HTTP {}",
                self.name, action, status
            )));
        }
        let raw: Value = response.json().await.map_err(|_| {
            Error::RemoteApi(format!("{}: {} returned a non-JSON response", self.name, action))
        })?;
        mapping::parse_response(&self.name, response_mapping, &raw)
    }

    /// Compare any device identity the API reports with the configuration.
    fn verify_device(&self, parsed: &ParsedResponse) -> Result<()> {
        let device = &self.config.device;
        if let Some(reported) = parsed.get_str("device_type") {
            if !reported.eq_ignore_ascii_case(&device.device_type) {
                return Err(self.mismatch("device_type", reported, &device.device_type));
            }
        }
        let reported_number = |field: &str| parsed.get(field).and_then(Value::as_u64);
        if let (Some(reported), Some(expected)) = (reported_number("system_id"), device.system_id) {
            if reported != u64::from(expected) {
                return Err(self.mismatch("system_id", reported, expected));
            }
        }
        if let (Some(reported), Some(expected)) =
            (reported_number("security_level"), device.security_level)
        {
            if reported != u64::from(expected) {
                return Err(self.mismatch("security_level", reported, expected));
            }
        }
        Ok(())
    }

    fn mismatch(&self, field: &str, reported: impl std::fmt::Display, expected: impl std::fmt::Display) -> Error {
        Error::DeviceMismatch(format!(
            "{}: API reports {} {}, configured {}",
            self.name, field, reported, expected
        ))
    }
}

#[async_trait]
impl ProtocolAdapter for CustomAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn drm_type(&self) -> DrmType {
        self.drm_type
    }

    async fn challenge(&self, request: &ChallengeRequest<'_>) -> Result<Challenge> {
        let mut base = Map::new();
        base.insert("scheme".into(), json!(self.config.device.name));
        base.insert("init_data".into(), json!(request.init_data.to_base64()));
        base.insert("service".into(), json!(request.service));
        if let Some(certificate) = request.service_certificate {
            base.insert("service_certificate".into(), json!(b64(certificate)));
        }
        if self.config.caching.enabled && self.config.caching.check_cached_first {
            base.insert("get_cached_keys_if_exists".into(), json!(true));
        }

        let parsed = self
            .send(
                "challenge",
                &self.challenge_endpoint,
                &self.config.request_mapping.challenge,
                &self.config.response_mapping.challenge,
                base,
                &self.condition_context(request.service),
            )
            .await?;
        self.verify_device(&parsed)?;

        let cached = if self.config.caching.enabled && parsed.has_cached_keys() {
            let field = if parsed.get("cached_keys").is_some() {
                "cached_keys"
            } else {
                "keys"
            };
            mapping::extract_keys(&self.config.response_mapping.challenge, &parsed, field)?
        } else {
            Vec::new()
        };
        if covers(&cached, &request.init_data.key_ids) {
            debug!(cdm = %self.name, keys = cached.len(), "API returned every required key");
            return Ok(Challenge::Cached(cached));
        }

        let payload = parsed.get("challenge").and_then(mapping::value_bytes);
        let session_id = parsed.get("session_id").map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
        match (payload, session_id) {
            (Some(payload), Some(session_id)) => Ok(Challenge::License(LicenseChallenge {
                payload,
                session: SessionState::Remote { session_id },
                cached,
            })),
            _ if !cached.is_empty() => Ok(Challenge::Cached(cached)),
            _ => Err(Error::RemoteApi(format!(
                "{}: response did not contain a challenge or cached keys",
                self.name
            ))),
        }
    }

    async fn parse(&self, challenge: LicenseChallenge, license: &[u8]) -> Result<Vec<ContentKey>> {
        let SessionState::Remote { session_id } = &challenge.session else {
            return Err(Error::Other(format!("{}: foreign session state", self.name)));
        };
        let mut base = Map::new();
        base.insert("scheme".into(), json!(self.config.device.name));
        base.insert("session_id".into(), json!(session_id));
        base.insert("license_request".into(), json!(b64(&challenge.payload)));
        base.insert("license_response".into(), json!(b64(license)));

        let context = self.condition_context("");
        let parsed = self
            .send(
                "decrypt",
                &self.decrypt_endpoint,
                &self.config.request_mapping.decrypt,
                &self.config.response_mapping.decrypt,
                base,
                &context,
            )
            .await?;

        let mut keys = challenge.cached;
        merge_keys(
            &mut keys,
            mapping::extract_keys(&self.config.response_mapping.decrypt, &parsed, "keys")?,
        );
        Ok(keys)
    }
}
