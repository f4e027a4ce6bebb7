//! Local device identity files (.wvd / .prd).
//!
//! Only the fixed header is read: enough to confirm the DRM scheme and the
//! security level before a device is handed to the host's CDM library. Key
//! material inside the files is never parsed here.

use std::path::{Path, PathBuf};

use crate::drm::{DeviceType, DrmType};
use crate::error::{Error, Result};

/// Magic bytes for WVD files.
const WVD_MAGIC: &[u8; 3] = b"WVD";
/// Magic bytes for PRD files.
const PRD_MAGIC: &[u8; 3] = b"PRD";

/// Header information of a local device file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFile {
    pub path: PathBuf,
    pub drm_type: DrmType,
    pub device_type: DeviceType,
    /// Format version stored in the header.
    pub version: u8,
    /// Widevine security level (1-3). PlayReady files do not carry one in the
    /// header.
    pub security_level: Option<u8>,
}

impl DeviceFile {
    /// Read and validate the header of a device file.
    pub fn probe<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        Self::from_bytes(path, &data)
    }

    /// Validate device header bytes.
    pub fn from_bytes(path: &Path, data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::InvalidDeviceFile(format!(
                "{}: data too short",
                path.display()
            )));
        }

        let magic = &data[0..3];
        let version = data[3];
        if magic == WVD_MAGIC {
            if version != 1 && version != 2 {
                return Err(Error::InvalidDeviceFile(format!(
                    "{}: unsupported WVD version {}",
                    path.display(),
                    version
                )));
            }
            if data.len() < 6 {
                return Err(Error::InvalidDeviceFile(format!(
                    "{}: WVD header incomplete",
                    path.display()
                )));
            }
            let device_type = match data[4] {
                1 => DeviceType::Chrome,
                2 => DeviceType::Android,
                other => {
                    return Err(Error::InvalidDeviceFile(format!(
                        "{}: invalid device type {}",
                        path.display(),
                        other
                    )))
                }
            };
            return Ok(Self {
                path: path.to_path_buf(),
                drm_type: DrmType::Widevine,
                device_type,
                version,
                security_level: Some(data[5]),
            });
        }

        if magic == PRD_MAGIC {
            if version != 2 && version != 3 {
                return Err(Error::InvalidDeviceFile(format!(
                    "{}: unsupported PRD version {}",
                    path.display(),
                    version
                )));
            }
            return Ok(Self {
                path: path.to_path_buf(),
                drm_type: DrmType::PlayReady,
                device_type: DeviceType::PlayReady,
                version,
                security_level: None,
            });
        }

        Err(Error::InvalidDeviceFile(format!(
            "{}: invalid magic bytes",
            path.display()
        )))
    }
}

/// DRM scheme implied by a device file's extension.
pub fn drm_type_for_path(path: &Path) -> Option<DrmType> {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("wvd") => Some(DrmType::Widevine),
        Some("prd") => Some(DrmType::PlayReady),
        _ => None,
    }
}
