//! Init data handed to CDMs.
//!
//! Only the PSSH box header is interpreted: the system id selects the DRM
//! scheme and v1 boxes contribute their KID list. Scheme-specific payloads
//! (Widevine CencHeader, PlayReady WRM header) are passed through opaquely.
use base64::Engine;
use uuid::Uuid;

use crate::drm::DrmType;
use crate::error::{Error, Result};

/// Content protection init data plus the KIDs that must be satisfied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitData {
    /// Scheme of the content.
    pub drm_type: DrmType,
    /// Raw bytes sent to the CDM (full PSSH box or WRM header).
    pub data: Vec<u8>,
    /// Key IDs the content needs.
    pub key_ids: Vec<Uuid>,
}

impl InitData {
    /// Wrap already-known init data.
    pub fn new(drm_type: DrmType, data: Vec<u8>, key_ids: Vec<Uuid>) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::InvalidInitData("Data must not be empty".to_string()));
        }
        Ok(Self {
            drm_type,
            data,
            key_ids,
        })
    }

    /// Parse a full PSSH box.
    ///
    /// The DRM type comes from the box's system id; unknown systems are
    /// rejected.
    pub fn from_pssh_box(data: &[u8]) -> Result<Self> {
        let header = parse_pssh_box(data)?;
        let drm_type = DrmType::from_system_id(&header.system_id).ok_or_else(|| {
            Error::InvalidInitData(format!("Unsupported DRM system {}", header.system_id))
        })?;
        Self::new(drm_type, data.to_vec(), header.key_ids)
    }

    /// Parse a base64 PSSH box.
    pub fn from_base64(data_b64: &str) -> Result<Self> {
        let data = base64::engine::general_purpose::STANDARD.decode(data_b64.trim())?;
        Self::from_pssh_box(&data)
    }

    /// Add KIDs discovered elsewhere (e.g. the manifest), skipping duplicates.
    pub fn with_key_ids(mut self, key_ids: impl IntoIterator<Item = Uuid>) -> Self {
        for kid in key_ids {
            if !self.key_ids.contains(&kid) {
                self.key_ids.push(kid);
            }
        }
        self
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.data)
    }
}

#[derive(Debug)]
struct PsshHeader {
    system_id: Uuid,
    key_ids: Vec<Uuid>,
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| Error::InvalidInitData("Data too short".to_string()))
}

fn parse_pssh_box(data: &[u8]) -> Result<PsshHeader> {
    if data.len() < 8 {
        return Err(Error::InvalidInitData("Data too short".to_string()));
    }

    let mut offset = 0;
    let size = read_u32(data, offset)? as usize;
    offset += 4;
    if &data[offset..offset + 4] != b"pssh" {
        return Err(Error::InvalidInitData("Not a PSSH box".to_string()));
    }
    offset += 4;

    let actual_size = match size {
        0 => data.len(),
        1 => {
            let hi = read_u32(data, offset)? as u64;
            let lo = read_u32(data, offset + 4)? as u64;
            offset += 8;
            ((hi << 32) | lo) as usize
        }
        n => n,
    };
    if actual_size > data.len() {
        return Err(Error::InvalidInitData("PSSH size exceeds data length".to_string()));
    }
    if data.len() < offset + 4 + 16 {
        return Err(Error::InvalidInitData("PSSH header incomplete".to_string()));
    }

    let version = data[offset];
    offset += 4;

    let system_id = Uuid::from_slice(&data[offset..offset + 16])
        .map_err(|_| Error::InvalidInitData("Invalid system ID".to_string()))?;
    offset += 16;

    let mut key_ids = Vec::new();
    if version == 1 {
        let kid_count = read_u32(data, offset)? as usize;
        offset += 4;
        let kids = data
            .get(offset..offset + kid_count * 16)
            .ok_or_else(|| Error::InvalidInitData("Missing KIDs".to_string()))?;
        for chunk in kids.chunks_exact(16) {
            key_ids.push(Uuid::from_slice(chunk).unwrap_or_else(|_| Uuid::nil()));
        }
    }

    Ok(PsshHeader { system_id, key_ids })
}

#[cfg(test)]
pub(crate) fn build_pssh_box(drm_type: DrmType, key_ids: &[Uuid], payload: &[u8]) -> Vec<u8> {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_box_yields_scheme_and_kids() {
        let kid = Uuid::new_v4();
        let data = build_pssh_box(DrmType::PlayReady, &[kid], b"<WRMHEADER/>");
        let init = InitData::from_pssh_box(&data).expect("parse pssh");
        assert_eq!(init.drm_type, DrmType::PlayReady);
        assert_eq!(init.key_ids, vec![kid]);
        assert_eq!(init.data, data);
    }

    #[test]
    fn v0_box_has_no_kids_until_supplied() {
        let kid = Uuid::new_v4();
        let data = build_pssh_box(DrmType::Widevine, &[], b"\x08\x01");
        let init = InitData::from_base64(
            &base64::engine::general_purpose::STANDARD.encode(&data),
        )
        .expect("parse base64");
        assert!(init.key_ids.is_empty());
        let init = init.with_key_ids([kid, kid]);
        assert_eq!(init.key_ids, vec![kid]);
    }

    #[test]
    fn unknown_system_and_garbage_are_rejected() {
        let mut data = build_pssh_box(DrmType::Widevine, &[], b"x");
        data[12..28].copy_from_slice(Uuid::nil().as_bytes());
        assert!(InitData::from_pssh_box(&data).is_err());
        assert!(InitData::from_pssh_box(b"nope").is_err());
        assert!(InitData::new(DrmType::Widevine, vec![], vec![]).is_err());
    }
}
