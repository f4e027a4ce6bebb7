#![allow(dead_code)]
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use cdmroute::device::DeviceFile;
use cdmroute::{ContentKey, DrmType, InitData, LicenseServer, LocalCdm, Result};

/// Build a PSSH box for `drm_type` carrying `key_ids` (v1) or none (v0).
pub fn pssh_box(drm_type: DrmType, key_ids: &[Uuid], payload: &[u8]) -> Vec<u8> {
    let version: u8 = if key_ids.is_empty() { 0 } else { 1 };
    let mut body = vec![version, 0, 0, 0];
    body.extend_from_slice(drm_type.system_id().as_bytes());
    if version == 1 {
        body.extend_from_slice(&(key_ids.len() as u32).to_be_bytes());
        for kid in key_ids {
            body.extend_from_slice(kid.as_bytes());
        }
    }
    body.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    body.extend_from_slice(payload);

    let mut out = ((body.len() + 8) as u32).to_be_bytes().to_vec();
    out.extend_from_slice(b"pssh");
    out.extend_from_slice(&body);
    out
}

pub fn content(drm_type: DrmType, key_ids: &[Uuid]) -> InitData {
    InitData::from_pssh_box(&pssh_box(drm_type, key_ids, b"payload")).unwrap()
}

/// Write `local_l3.wvd` and `local_sl2000.prd` headers into `dir`.
pub fn write_devices(dir: &Path) {
    std::fs::write(dir.join("local_l3.wvd"), b"WVD\x02\x01\x03").unwrap();
    std::fs::write(dir.join("local_sl2000.prd"), b"PRD\x03").unwrap();
}

/// Local CDM that answers a license with one key per KID of the session's
/// challenge, using the license bytes as the key.
#[derive(Default)]
pub struct EchoCdm {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    sessions: Mutex<HashMap<Vec<u8>, Vec<Uuid>>>,
}

#[async_trait]
impl LocalCdm for EchoCdm {
    async fn open(&self, _device: &DeviceFile) -> Result<Vec<u8>> {
        let n = self.opened.fetch_add(1, Ordering::SeqCst);
        Ok((n as u64).to_be_bytes().to_vec())
    }

    async fn close(&self, _session_id: &[u8]) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_license_challenge(&self, session_id: &[u8], init_data: &InitData) -> Result<Vec<u8>> {
        self.sessions
            .lock()
            .unwrap()
            .insert(session_id.to_vec(), init_data.key_ids.clone());
        Ok(b"local-challenge".to_vec())
    }

    async fn parse_license(&self, session_id: &[u8], license: &[u8]) -> Result<Vec<ContentKey>> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .get(session_id)
            .into_iter()
            .flatten()
            .map(|kid| ContentKey::new(*kid, license.to_vec()))
            .collect())
    }
}

/// License server returning a fixed license and counting calls.
pub struct FixedLicense {
    pub license: Vec<u8>,
    pub calls: AtomicUsize,
}

impl FixedLicense {
    pub fn new(license: &[u8]) -> Self {
        Self {
            license: license.to_vec(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LicenseServer for FixedLicense {
    async fn license(&self, _drm_type: DrmType, _challenge: &[u8]) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.license.clone())
    }
}
