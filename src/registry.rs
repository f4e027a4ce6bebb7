//! Descriptor registry: every CDM the configuration can route to.
//!
//! Remote CDMs come from `remote_cdm`; any other name referenced by the `cdm`
//! rules is looked up as a local device file (`<wvds>/<name>.wvd`, then
//! `<prds>/<name>.prd`). The registry is built once and shared read-only.
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::{
    Config, CustomRemoteConfig, Directories, LegacyRemoteConfig, ManagedRemoteConfig,
    RemoteCdmConfig,
};
use crate::drm::{DeviceType, DrmType};
use crate::error::{Error, Result};
use crate::selection::SelectionRules;

/// A local device identity file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDevice {
    pub path: PathBuf,
    pub drm_type: DrmType,
}

/// A configured decryption target.
#[derive(Debug, Clone)]
pub enum CdmDescriptor {
    LocalDevice(LocalDevice),
    RemoteLegacy(LegacyRemoteConfig),
    RemoteManaged(ManagedRemoteConfig),
    RemoteCustom(CustomRemoteConfig),
}

impl CdmDescriptor {
    /// DRM scheme the descriptor can serve.
    pub fn drm_type(&self) -> Result<DrmType> {
        match self {
            CdmDescriptor::LocalDevice(d) => Ok(d.drm_type),
            CdmDescriptor::RemoteLegacy(c) => Ok(c.device_type.parse::<DeviceType>()?.drm_type()),
            CdmDescriptor::RemoteManaged(c) => Ok(managed_drm_type(&c.device_name, c.device_type.as_deref())),
            CdmDescriptor::RemoteCustom(c) => Ok(managed_drm_type(&c.device.name, Some(&c.device.device_type))),
        }
    }

    pub fn is_remote(&self) -> bool {
        !matches!(self, CdmDescriptor::LocalDevice(_))
    }

    /// Per-CDM timeout override.
    pub fn timeout(&self) -> Option<Duration> {
        let secs = match self {
            CdmDescriptor::LocalDevice(_) => None,
            CdmDescriptor::RemoteLegacy(c) => c.timeout,
            CdmDescriptor::RemoteManaged(c) => c.timeout,
            CdmDescriptor::RemoteCustom(c) => c.timeout,
        };
        secs.map(Duration::from_secs)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CdmDescriptor::LocalDevice(_) => "local",
            CdmDescriptor::RemoteLegacy(_) => "legacy",
            CdmDescriptor::RemoteManaged(_) => "decrypt_labs",
            CdmDescriptor::RemoteCustom(_) => "custom_api",
        }
    }
}

/// PlayReady remote schemes are named `SL2`/`SL3` or typed `PLAYREADY`.
fn managed_drm_type(device_name: &str, device_type: Option<&str>) -> DrmType {
    let is_playready = device_type.is_some_and(|t| t.eq_ignore_ascii_case("PLAYREADY"))
        || matches!(device_name.to_ascii_uppercase().as_str(), "SL2" | "SL3");
    if is_playready {
        DrmType::PlayReady
    } else {
        DrmType::Widevine
    }
}

/// Named, immutable descriptor catalog.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    descriptors: HashMap<String, Arc<CdmDescriptor>>,
    /// Names in declaration order (remote first, then locals by reference).
    order: Vec<String>,
    default_timeout: Duration,
}

impl Registry {
    /// Build the registry for a configuration and its compiled rules.
    ///
    /// Fails with [`Error::Config`] on duplicate remote names, remote entries
    /// missing required fields, or rule references that resolve to nothing.
    pub fn from_config(config: &Config, rules: &SelectionRules) -> Result<Self> {
        let mut registry = Self {
            default_timeout: config.timeouts.default_duration(),
            ..Self::default()
        };

        for remote in config.remote_cdms()? {
            let name = remote.name().to_string();
            let descriptor = match remote {
                RemoteCdmConfig::Legacy(c) => CdmDescriptor::RemoteLegacy(c),
                RemoteCdmConfig::Managed(c) => CdmDescriptor::RemoteManaged(c),
                RemoteCdmConfig::Custom(c) => CdmDescriptor::RemoteCustom(c),
            };
            // Surface bad device types at load rather than per acquisition.
            descriptor
                .drm_type()
                .map_err(|e| Error::Config(format!("remote_cdm '{}': {}", name, e)))?;
            registry.insert(name, descriptor)?;
        }

        for name in rules.referenced() {
            if registry.descriptors.contains_key(name) {
                continue;
            }
            let device = find_local_device(&config.directories, name).ok_or_else(|| {
                Error::Config(format!(
                    "CDM '{}' is neither a remote_cdm nor a device in {} / {}",
                    name,
                    config.directories.wvds.display(),
                    config.directories.prds.display()
                ))
            })?;
            debug!(cdm = name, path = %device.path.display(), "registered local device");
            registry.insert(name.to_string(), CdmDescriptor::LocalDevice(device))?;
        }

        Ok(registry)
    }

    /// Register a descriptor directly.
    pub fn insert(&mut self, name: String, descriptor: CdmDescriptor) -> Result<()> {
        if self.descriptors.contains_key(&name) {
            return Err(Error::Config(format!("Duplicate CDM name '{}'", name)));
        }
        self.order.push(name.clone());
        self.descriptors.insert(name, Arc::new(descriptor));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<CdmDescriptor>> {
        self.descriptors.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Engine default timeout for remote calls.
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

fn find_local_device(dirs: &Directories, name: &str) -> Option<LocalDevice> {
    let candidates = [
        (dirs.wvds.join(format!("{}.wvd", name)), DrmType::Widevine),
        (dirs.prds.join(format!("{}.prd", name)), DrmType::PlayReady),
    ];
    candidates
        .into_iter()
        .find(|(path, _)| path.is_file())
        .map(|(path, drm_type)| LocalDevice { path, drm_type })
}
