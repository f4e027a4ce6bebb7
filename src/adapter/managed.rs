//! Client for the managed key-extraction API (DecryptLabs style).
//!
//! Two calls: `/get-request` yields a challenge (or keys the API already
//! holds), `/decrypt-response` turns the license into keys. Session state is
//! the remote `session_id`.
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::mapping::{self, ParsedResponse};
use super::{
    b64, covers, decode_challenge, http_client, transport_error, Challenge, ChallengeRequest,
    LicenseChallenge, ProtocolAdapter, SessionState,
};
use crate::config::{ManagedRemoteConfig, ResponseMapping};
use crate::drm::DrmType;
use crate::error::{Error, Result};
use crate::key::ContentKey;
use crate::registry::CdmDescriptor;

const API_KEY_HEADER: &str = "decrypt-labs-api-key";

pub struct ManagedAdapter {
    name: String,
    config: ManagedRemoteConfig,
    drm_type: DrmType,
    timeout: Duration,
    client: reqwest::Client,
    /// Fixed response shape, expressed with the custom dialect's defaults.
    response: ResponseMapping,
}

impl ManagedAdapter {
    pub fn new(name: &str, config: ManagedRemoteConfig, timeout: Duration) -> Result<Self> {
        let drm_type = CdmDescriptor::RemoteManaged(config.clone()).drm_type()?;
        Ok(Self {
            name: name.to_string(),
            drm_type,
            timeout,
            client: http_client()?,
            response: ResponseMapping {
                success_conditions: vec!["message == 'success'".to_string()],
                ..ResponseMapping::default()
            },
            config: ManagedRemoteConfig {
                host: config.host.trim_end_matches('/').to_string(),
                ..config
            },
        })
    }

    async fn post(&self, action: &str, path: &str, body: &Map<String, Value>) -> Result<ParsedResponse> {
        let response = self
            .client
            .post(format!("{}{}", self.config.host, path))
            .header(API_KEY_HEADER, &self.config.api_key)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(&self.name, action, e))?;
        let http_status = response.status();
        let raw: Value = response.json().await.map_err(|_| {
            Error::RemoteApi(format!(
                "{}: {} returned a non-JSON response ({})",
                self.name, action, http_status
            ))
        })?;
        mapping::parse_response(&self.name, &self.response, &raw)
    }

    /// The API echoes the scheme it served; anything else is a different
    /// device than configured.
    fn verify_scheme(&self, parsed: &ParsedResponse) -> Result<()> {
        match parsed.get_str("scheme") {
            Some(scheme) if !scheme.eq_ignore_ascii_case(&self.config.device_name) => {
                Err(Error::DeviceMismatch(format!(
                    "{}: API answered for scheme {}, configured {}",
                    self.name, scheme, self.config.device_name
                )))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ProtocolAdapter for ManagedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn drm_type(&self) -> DrmType {
        self.drm_type
    }

    async fn challenge(&self, request: &ChallengeRequest<'_>) -> Result<Challenge> {
        let mut body = Map::new();
        body.insert("scheme".into(), json!(self.config.device_name));
        body.insert("init_data".into(), json!(request.init_data.to_base64()));
        body.insert("service".into(), json!(request.service));
        body.insert(
            "get_cached_keys_if_exists".into(),
            json!(self.config.get_cached_keys),
        );
        if let Some(certificate) = request.service_certificate {
            body.insert("service_certificate".into(), json!(b64(certificate)));
        }

        let parsed = self.post("get-request", "/get-request", &body).await?;
        self.verify_scheme(&parsed)?;

        let cached = mapping::extract_keys(&self.response, &parsed, "cached_keys")?;
        if covers(&cached, &request.init_data.key_ids) {
            debug!(cdm = %self.name, keys = cached.len(), "API returned every required key");
            return Ok(Challenge::Cached(cached));
        }

        match (parsed.get_str("challenge"), parsed.get_str("session_id")) {
            (Some(challenge), Some(session_id)) => Ok(Challenge::License(LicenseChallenge {
                payload: decode_challenge(challenge),
                session: SessionState::Remote {
                    session_id: session_id.to_string(),
                },
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
        let mut body = Map::new();
        body.insert("scheme".into(), json!(self.config.device_name));
        body.insert("session_id".into(), json!(session_id));
        body.insert("license_request".into(), json!(b64(&challenge.payload)));
        body.insert("license_response".into(), json!(b64(license)));

        let parsed = self.post("decrypt-response", "/decrypt-response", &body).await?;
        let mut keys = challenge.cached;
        crate::key::merge_keys(&mut keys, mapping::extract_keys(&self.response, &parsed, "keys")?);
        Ok(keys)
    }
}
