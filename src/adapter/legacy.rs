//! Client for pywidevine serve compatible remote CDMs.
//!
//! The remote side holds the device; this adapter opens a session on it,
//! verifies the device identity it reports, and walks the
//! challenge/parse/get_keys sequence over JSON.
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::{
    b64, decode_challenge, http_client, transport_error, Challenge, ChallengeRequest,
    LicenseChallenge, ProtocolAdapter, SessionState,
};
use crate::config::LegacyRemoteConfig;
use crate::drm::{DeviceType, DrmType};
use crate::error::{Error, Result};
use crate::key::ContentKey;

const SERVER_MARKER: &str = "pywidevine serve v";
const MIN_SERVER_VERSION: &str = "1.4.3";

pub struct LegacyAdapter {
    name: String,
    config: LegacyRemoteConfig,
    drm_type: DrmType,
    timeout: Duration,
    client: reqwest::Client,
    server_checked: OnceCell<()>,
}

impl LegacyAdapter {
    pub fn new(name: &str, config: LegacyRemoteConfig, timeout: Duration) -> Result<Self> {
        let drm_type = config.device_type.parse::<DeviceType>()?.drm_type();
        Ok(Self {
            name: name.to_string(),
            drm_type,
            timeout,
            client: http_client()?,
            server_checked: OnceCell::new(),
            config: LegacyRemoteConfig {
                host: config.host.trim_end_matches('/').to_string(),
                ..config
            },
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.config.host, self.config.device_name, path)
    }

    /// Confirm once per adapter that the host speaks a supported version.
    async fn check_server(&self) -> Result<()> {
        self.server_checked
            .get_or_try_init(|| async {
                let response = self
                    .client
                    .head(&self.config.host)
                    .header("X-Secret-Key", &self.config.secret)
                    .timeout(self.timeout)
                    .send()
                    .await
                    .map_err(|e| transport_error(&self.name, "server check", e))?;

                if !response.status().is_success() {
                    return Err(Error::RemoteApi(format!(
                        "{}: server did not respond successfully: {}",
                        self.name,
                        response.status()
                    )));
                }

                let server = response
                    .headers()
                    .get(reqwest::header::SERVER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_lowercase)
                    .unwrap_or_default();
                let Some(version) = extract_version(&server, SERVER_MARKER) else {
                    return Err(Error::RemoteApi(format!(
                        "{}: remote API does not appear to be pywidevine serve",
                        self.name
                    )));
                };
                if !version_at_least(&version, MIN_SERVER_VERSION) {
                    return Err(Error::RemoteApi(format!(
                        "{}: remote API version {} is not supported, need >= {}",
                        self.name, version, MIN_SERVER_VERSION
                    )));
                }
                debug!(cdm = %self.name, version = %version, "remote server verified");
                Ok(())
            })
            .await
            .map(|_| ())
    }

    async fn call<T: DeserializeOwned>(
        &self,
        action: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        let response = request
            .header("X-Secret-Key", &self.config.secret)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| transport_error(&self.name, action, e))?;
        let http_status = response.status();
        let body: ApiResponse<T> = response.json().await.map_err(|_| {
            Error::RemoteApi(format!(
                "{}: {} returned a non-JSON response ({})",
                self.name, action, http_status
            ))
        })?;

        if body.status != 200 {
            return Err(Error::RemoteApi(format!(
                "{}: {} failed: {}",
                self.name, action, body.message
            )));
        }
        body.data.ok_or_else(|| {
            Error::RemoteApi(format!("{}: {} response is missing data", self.name, action))
        })
    }

    async fn open(&self) -> Result<Vec<u8>> {
        let data: OpenResponse = self.call("open", self.client.get(self.url("open"))).await?;
        let session_id = hex::decode(&data.session_id)
            .map_err(|e| Error::RemoteApi(format!("{}: invalid session id: {}", self.name, e)))?;

        if data.device.system_id != self.config.system_id
            || data.device.security_level != self.config.security_level
        {
            self.close(&session_id).await;
            return Err(Error::DeviceMismatch(format!(
                "{}: remote reports system id {} L{}, configured {} L{}",
                self.name,
                data.device.system_id,
                data.device.security_level,
                self.config.system_id,
                self.config.security_level
            )));
        }
        Ok(session_id)
    }

    /// Close errors are logged; the session expires server-side regardless.
    async fn close(&self, session_id: &[u8]) {
        let url = self.url(&format!("close/{}", hex::encode(session_id)));
        if let Err(e) = self
            .call::<serde_json::Value>("close", self.client.get(url))
            .await
        {
            warn!(cdm = %self.name, error = %e, "failed to close remote session");
        }
    }

    async fn license_challenge(
        &self,
        session_id: &[u8],
        request: &ChallengeRequest<'_>,
    ) -> Result<Vec<u8>> {
        if let Some(certificate) = request.service_certificate {
            let _: serde_json::Value = self
                .call(
                    "set_service_certificate",
                    self.client
                        .post(self.url("set_service_certificate"))
                        .json(&serde_json::json!({
                            "session_id": hex::encode(session_id),
                            "certificate": b64(certificate),
                        })),
                )
                .await?;
        }

        let data: ChallengeResponse = self
            .call(
                "get_license_challenge",
                self.client
                    .post(self.url("get_license_challenge/STREAMING"))
                    .json(&serde_json::json!({
                        "session_id": hex::encode(session_id),
                        "init_data": request.init_data.to_base64(),
                        "privacy_mode": true,
                    })),
            )
            .await?;
        Ok(decode_challenge(&data.challenge_b64))
    }

    async fn keys(&self, session_id: &[u8], license: &[u8]) -> Result<Vec<ContentKey>> {
        let _: serde_json::Value = self
            .call(
                "parse_license",
                self.client
                    .post(self.url("parse_license"))
                    .json(&serde_json::json!({
                        "session_id": hex::encode(session_id),
                        "license_message": b64(license),
                    })),
            )
            .await?;

        let data: KeysResponse = self
            .call(
                "get_keys",
                self.client
                    .post(self.url("get_keys/CONTENT"))
                    .json(&serde_json::json!({
                        "session_id": hex::encode(session_id),
                    })),
            )
            .await?;

        data.keys
            .into_iter()
            .map(|k| ContentKey::from_hex(&k.key_id, &k.key, Some(&k.r#type)))
            .collect()
    }
}

#[async_trait]
impl ProtocolAdapter for LegacyAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn drm_type(&self) -> DrmType {
        self.drm_type
    }

    async fn challenge(&self, request: &ChallengeRequest<'_>) -> Result<Challenge> {
        self.check_server().await?;
        let session_id = self.open().await?;
        match self.license_challenge(&session_id, request).await {
            Ok(payload) => Ok(Challenge::License(LicenseChallenge {
                payload,
                session: SessionState::Legacy { session_id },
                cached: Vec::new(),
            })),
            Err(e) => {
                self.close(&session_id).await;
                Err(e)
            }
        }
    }

    async fn parse(&self, challenge: LicenseChallenge, license: &[u8]) -> Result<Vec<ContentKey>> {
        let SessionState::Legacy { session_id } = challenge.session else {
            return Err(Error::Other(format!("{}: foreign session state", self.name)));
        };
        let keys = self.keys(&session_id, license).await;
        self.close(&session_id).await;
        keys
    }

    async fn abort(&self, challenge: LicenseChallenge) {
        if let SessionState::Legacy { session_id } = challenge.session {
            self.close(&session_id).await;
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    status: i32,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct OpenResponse {
    session_id: String,
    device: DeviceInfo,
}

#[derive(Debug, Deserialize)]
struct DeviceInfo {
    system_id: u32,
    security_level: u8,
}

#[derive(Debug, Deserialize)]
struct ChallengeResponse {
    challenge_b64: String,
}

#[derive(Debug, Deserialize)]
struct KeysResponse {
    keys: Vec<KeyResponse>,
}

#[derive(Debug, Deserialize)]
struct KeyResponse {
    key_id: String,
    key: String,
    r#type: String,
}

fn extract_version(server: &str, marker: &str) -> Option<String> {
    server
        .find(marker)
        .map(|idx| server[idx + marker.len()..].trim().to_string())
}

fn version_at_least(version: &str, minimum: &str) -> bool {
    let parse = |v: &str| {
        v.split('.')
            .map(|s| s.trim_end_matches(|c: char| !c.is_ascii_digit()))
            .filter_map(|s| s.parse::<u32>().ok())
            .collect::<Vec<_>>()
    };
    let v = parse(version);
    let m = parse(minimum);
    for i in 0..m.len().max(v.len()) {
        let a = *v.get(i).unwrap_or(&0);
        let b = *m.get(i).unwrap_or(&0);
        if a != b {
            return a > b;
        }
    }
    true
}
