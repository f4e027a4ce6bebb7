//! DRM scheme and device identity primitives shared by every module.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Widevine system UUID.
pub const WIDEVINE_UUID: Uuid = Uuid::from_u128(0xedef8ba979d64acea3c827dcd51d21ed);
/// PlayReady system UUID.
pub const PLAYREADY_UUID: Uuid = Uuid::from_u128(0x9a04f07998404286ab92e65be0885f95);

/// DRM schemes the engine can route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrmType {
    Widevine,
    PlayReady,
}

impl DrmType {
    /// Protection system id used in PSSH boxes.
    pub fn system_id(self) -> Uuid {
        match self {
            DrmType::Widevine => WIDEVINE_UUID,
            DrmType::PlayReady => PLAYREADY_UUID,
        }
    }

    /// Map a PSSH system id back to a scheme.
    pub fn from_system_id(system_id: &Uuid) -> Option<Self> {
        match *system_id {
            WIDEVINE_UUID => Some(DrmType::Widevine),
            PLAYREADY_UUID => Some(DrmType::PlayReady),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DrmType::Widevine => "widevine",
            DrmType::PlayReady => "playready",
        }
    }
}

impl fmt::Display for DrmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DrmType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "widevine" | "wv" => Ok(DrmType::Widevine),
            "playready" | "pr" => Ok(DrmType::PlayReady),
            other => Err(Error::Config(format!("Unknown DRM type '{}'", other))),
        }
    }
}

/// Device types a CDM can identify as.
///
/// Chrome and Android are Widevine device types; PlayReady devices only have
/// a single kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Chrome,
    Android,
    PlayReady,
}

impl DeviceType {
    /// The DRM scheme this device type speaks.
    pub fn drm_type(self) -> DrmType {
        match self {
            DeviceType::Chrome | DeviceType::Android => DrmType::Widevine,
            DeviceType::PlayReady => DrmType::PlayReady,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::Chrome => "CHROME",
            DeviceType::Android => "ANDROID",
            DeviceType::PlayReady => "PLAYREADY",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "CHROME" => Ok(DeviceType::Chrome),
            "ANDROID" => Ok(DeviceType::Android),
            "PLAYREADY" => Ok(DeviceType::PlayReady),
            _ => Err(Error::Config(format!("Invalid device type '{}'", s))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_ids_round_trip() {
        for drm in [DrmType::Widevine, DrmType::PlayReady] {
            assert_eq!(DrmType::from_system_id(&drm.system_id()), Some(drm));
        }
        assert_eq!(DrmType::from_system_id(&Uuid::nil()), None);
    }

    #[test]
    fn device_type_names_are_case_insensitive() {
        assert_eq!("android".parse::<DeviceType>().unwrap(), DeviceType::Android);
        assert_eq!(
            "PlayReady".parse::<DeviceType>().unwrap().drm_type(),
            DrmType::PlayReady
        );
        assert!("toaster".parse::<DeviceType>().is_err());
    }
}
