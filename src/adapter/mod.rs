//! Protocol adapters: one implementation per [`CdmDescriptor`] variant.
//!
//! Every adapter turns init data into a license challenge and a license
//! response into content keys. Between the two calls the caller posts the
//! challenge to the service's [`LicenseServer`]. Adapters never retry; a
//! failure is reported once and the sequencer decides what happens next.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;

use crate::drm::DrmType;
use crate::error::{Error, Result};
use crate::key::ContentKey;
use crate::pssh::InitData;
use crate::registry::CdmDescriptor;

pub mod custom;
pub mod legacy;
pub mod local;
pub mod managed;
pub mod mapping;

pub use local::{LocalCdm, LocalCdms};

const USER_AGENT: &str = concat!("cdmroute/", env!("CARGO_PKG_VERSION"));

/// Input to [`ProtocolAdapter::challenge`].
#[derive(Debug, Clone, Copy)]
pub struct ChallengeRequest<'a> {
    pub service: &'a str,
    pub init_data: &'a InitData,
    /// Service privacy certificate, when the license server provides one.
    pub service_certificate: Option<&'a [u8]>,
}

/// Dialect-specific state carried from challenge to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Local { session_id: Vec<u8> },
    Legacy { session_id: Vec<u8> },
    Remote { session_id: String },
}

/// A license request ready to be posted to the license server.
#[derive(Debug, Clone)]
pub struct LicenseChallenge {
    pub payload: Vec<u8>,
    pub session: SessionState,
    /// Keys the CDM already returned alongside the challenge.
    pub cached: Vec<ContentKey>,
}

/// Result of asking a CDM for a challenge.
#[derive(Debug, Clone)]
pub enum Challenge {
    /// The CDM already holds every required key; no license round trip.
    Cached(Vec<ContentKey>),
    License(LicenseChallenge),
}

/// Wire-level capability shared by all dialects.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    /// Descriptor name, used in logs and error reports.
    fn name(&self) -> &str;

    fn drm_type(&self) -> DrmType;

    /// Build a license challenge for the content.
    async fn challenge(&self, request: &ChallengeRequest<'_>) -> Result<Challenge>;

    /// Turn the license server's response into content keys.
    async fn parse(&self, challenge: LicenseChallenge, license: &[u8]) -> Result<Vec<ContentKey>>;

    /// Release a session whose license exchange will not complete.
    async fn abort(&self, _challenge: LicenseChallenge) {}
}

/// The service's license endpoint, supplied by the caller.
#[async_trait]
pub trait LicenseServer: Send + Sync {
    /// Optional privacy certificate to hand to the CDM first.
    async fn service_certificate(&self, _drm_type: DrmType) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    /// Exchange a challenge for a license.
    async fn license(&self, drm_type: DrmType, challenge: &[u8]) -> Result<Vec<u8>>;
}

/// Build the adapter for a descriptor. Dispatch is on the configured dialect.
pub fn build_adapter(
    name: &str,
    descriptor: &CdmDescriptor,
    default_timeout: Duration,
    locals: &LocalCdms,
) -> Result<Arc<dyn ProtocolAdapter>> {
    let timeout = descriptor.timeout().unwrap_or(default_timeout);
    let adapter: Arc<dyn ProtocolAdapter> = match descriptor {
        CdmDescriptor::LocalDevice(device) => {
            let cdm = locals.get(device.drm_type).ok_or_else(|| {
                Error::Config(format!(
                    "No local {} CDM available for device '{}'",
                    device.drm_type, name
                ))
            })?;
            Arc::new(local::LocalAdapter::new(name, device.clone(), cdm))
        }
        CdmDescriptor::RemoteLegacy(config) => {
            Arc::new(legacy::LegacyAdapter::new(name, config.clone(), timeout)?)
        }
        CdmDescriptor::RemoteManaged(config) => {
            Arc::new(managed::ManagedAdapter::new(name, config.clone(), timeout)?)
        }
        CdmDescriptor::RemoteCustom(config) => {
            Arc::new(custom::CustomAdapter::new(name, config.clone(), timeout)?)
        }
    };
    Ok(adapter)
}

pub(crate) fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| Error::Other(format!("Failed to build HTTP client: {}", e)))
}

/// Transport failures are remote API failures from the sequencer's view.
pub(crate) fn transport_error(cdm: &str, action: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::RemoteApi(format!("{}: {} timed out", cdm, action))
    } else {
        Error::RemoteApi(format!("{}: {} failed: {}", cdm, action, e.without_url()))
    }
}

pub(crate) fn b64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// Decode a base64 challenge; some APIs return it as plain text instead.
pub(crate) fn decode_challenge(value: &str) -> Vec<u8> {
    base64::engine::general_purpose::STANDARD
        .decode(value.trim())
        .unwrap_or_else(|_| value.as_bytes().to_vec())
}

/// Whether `keys` hold a key for every KID in `required`.
pub(crate) fn covers(keys: &[ContentKey], required: &[uuid::Uuid]) -> bool {
    !required.is_empty() && required.iter().all(|kid| keys.iter().any(|k| &k.kid == kid))
}
