//! Local device files driven through a host-supplied CDM library.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Challenge, ChallengeRequest, LicenseChallenge, ProtocolAdapter, SessionState};
use crate::device::DeviceFile;
use crate::drm::DrmType;
use crate::error::{Error, Result};
use crate::key::ContentKey;
use crate::pssh::InitData;
use crate::registry::LocalDevice;

/// A CDM implementation able to load a device file and run license
/// exchanges with it.
///
/// The engine does not implement Widevine or PlayReady itself; hosts plug in
/// one implementation per DRM scheme.
#[async_trait]
pub trait LocalCdm: Send + Sync {
    /// Load the device and open a session, returning its id.
    async fn open(&self, device: &DeviceFile) -> Result<Vec<u8>>;

    /// Close a session. Must tolerate sessions that never produced a license.
    async fn close(&self, session_id: &[u8]) -> Result<()>;

    /// Install the service privacy certificate for a session.
    async fn set_service_certificate(&self, _session_id: &[u8], _certificate: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn get_license_challenge(&self, session_id: &[u8], init_data: &InitData) -> Result<Vec<u8>>;

    /// Parse a license and return the keys it carried.
    async fn parse_license(&self, session_id: &[u8], license: &[u8]) -> Result<Vec<ContentKey>>;
}

/// Host CDM implementations by scheme.
#[derive(Clone, Default)]
pub struct LocalCdms {
    cdms: HashMap<DrmType, Arc<dyn LocalCdm>>,
}

impl LocalCdms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, drm_type: DrmType, cdm: Arc<dyn LocalCdm>) {
        self.cdms.insert(drm_type, cdm);
    }

    pub fn with(mut self, drm_type: DrmType, cdm: Arc<dyn LocalCdm>) -> Self {
        self.insert(drm_type, cdm);
        self
    }

    pub fn get(&self, drm_type: DrmType) -> Option<Arc<dyn LocalCdm>> {
        self.cdms.get(&drm_type).cloned()
    }
}

impl std::fmt::Debug for LocalCdms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.cdms.keys()).finish()
    }
}

pub struct LocalAdapter {
    name: String,
    device: LocalDevice,
    cdm: Arc<dyn LocalCdm>,
}

impl LocalAdapter {
    pub fn new(name: &str, device: LocalDevice, cdm: Arc<dyn LocalCdm>) -> Self {
        Self {
            name: name.to_string(),
            device,
            cdm,
        }
    }

    async fn close_quietly(&self, session_id: &[u8]) {
        if let Err(e) = self.cdm.close(session_id).await {
            warn!(cdm = %self.name, error = %e, "failed to close local session");
        }
    }
}

#[async_trait]
impl ProtocolAdapter for LocalAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn drm_type(&self) -> DrmType {
        self.device.drm_type
    }

    async fn challenge(&self, request: &ChallengeRequest<'_>) -> Result<Challenge> {
        let device = DeviceFile::probe(&self.device.path)?;
        if device.drm_type != request.init_data.drm_type {
            return Err(Error::DeviceMismatch(format!(
                "{}: {} device cannot serve {} content",
                self.name, device.drm_type, request.init_data.drm_type
            )));
        }

        let session_id = self.cdm.open(&device).await?;
        debug!(cdm = %self.name, session = %hex::encode(&session_id), "opened local session");

        let payload = async {
            if let Some(certificate) = request.service_certificate {
                self.cdm.set_service_certificate(&session_id, certificate).await?;
            }
            self.cdm
                .get_license_challenge(&session_id, request.init_data)
                .await
        }
        .await;

        match payload {
            Ok(payload) => Ok(Challenge::License(LicenseChallenge {
                payload,
                session: SessionState::Local { session_id },
                cached: Vec::new(),
            })),
            Err(e) => {
                self.close_quietly(&session_id).await;
                Err(e)
            }
        }
    }

    async fn parse(&self, challenge: LicenseChallenge, license: &[u8]) -> Result<Vec<ContentKey>> {
        let SessionState::Local { session_id } = challenge.session else {
            return Err(Error::Other(format!("{}: foreign session state", self.name)));
        };
        let keys = self.cdm.parse_license(&session_id, license).await;
        self.close_quietly(&session_id).await;
        keys
    }

    async fn abort(&self, challenge: LicenseChallenge) {
        if let SessionState::Local { session_id } = challenge.session {
            self.close_quietly(&session_id).await;
        }
    }
}
