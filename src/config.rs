//! Configuration loaded from YAML.
//!
//! The `cdm` section is kept as a raw mapping here and compiled into typed
//! selection tables by [`crate::selection::SelectionRules::from_mapping`];
//! everything else deserializes directly.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Engine default network timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Root configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service → selection table mapping, plus the global `default`.
    #[serde(default)]
    pub cdm: serde_yaml::Mapping,
    /// Remote CDM definitions, in declaration order.
    #[serde(default)]
    pub remote_cdm: Vec<serde_yaml::Value>,
    /// Key vaults, in query order.
    #[serde(default)]
    pub key_vaults: Vec<VaultConfig>,
    #[serde(default)]
    pub directories: Directories,
    #[serde(default)]
    pub timeouts: Timeouts,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::Config(format!(
                "Config file path ({}) was not found",
                path.display()
            )));
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Load configuration from YAML text. An empty document is an empty
    /// configuration.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Parse every `remote_cdm` entry into its dialect.
    pub fn remote_cdms(&self) -> Result<Vec<RemoteCdmConfig>> {
        self.remote_cdm.iter().map(RemoteCdmConfig::from_value).collect()
    }
}

/// Local device lookup directories.
#[derive(Debug, Clone, Deserialize)]
pub struct Directories {
    #[serde(default = "default_wvds")]
    pub wvds: PathBuf,
    #[serde(default = "default_prds")]
    pub prds: PathBuf,
}

fn default_wvds() -> PathBuf {
    PathBuf::from("WVDs")
}

fn default_prds() -> PathBuf {
    PathBuf::from("PRDs")
}

impl Default for Directories {
    fn default() -> Self {
        Self {
            wvds: default_wvds(),
            prds: default_prds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Timeouts {
    /// Engine default timeout in seconds for remote calls.
    #[serde(default = "default_timeout")]
    pub default: u64,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            default: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl Timeouts {
    pub fn default_duration(&self) -> Duration {
        Duration::from_secs(self.default)
    }
}

/// A `remote_cdm` entry, by dialect.
#[derive(Debug, Clone)]
pub enum RemoteCdmConfig {
    Legacy(LegacyRemoteConfig),
    Managed(ManagedRemoteConfig),
    Custom(CustomRemoteConfig),
}

impl RemoteCdmConfig {
    /// Pick the dialect from the `type` field (absent ⇒ legacy).
    pub fn from_value(value: &serde_yaml::Value) -> Result<Self> {
        let name = value
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("<unnamed>")
            .to_string();
        let kind = value
            .get("type")
            .map(|v| {
                v.as_str()
                    .map(str::to_ascii_lowercase)
                    .ok_or_else(|| Error::Config(format!("remote_cdm '{}': type must be a string", name)))
            })
            .transpose()?;

        let wrap = |e: serde_yaml::Error| Error::Config(format!("remote_cdm '{}': {}", name, e));
        match kind.as_deref() {
            None | Some("legacy") | Some("pywidevine") => Ok(RemoteCdmConfig::Legacy(
                serde_yaml::from_value(value.clone()).map_err(wrap)?,
            )),
            Some("decrypt_labs") => Ok(RemoteCdmConfig::Managed(
                serde_yaml::from_value(value.clone()).map_err(wrap)?,
            )),
            Some("custom_api") => Ok(RemoteCdmConfig::Custom(
                serde_yaml::from_value(value.clone()).map_err(wrap)?,
            )),
            Some(other) => Err(Error::Config(format!(
                "remote_cdm '{}': unknown type '{}'",
                name, other
            ))),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            RemoteCdmConfig::Legacy(c) => &c.name,
            RemoteCdmConfig::Managed(c) => &c.name,
            RemoteCdmConfig::Custom(c) => &c.name,
        }
    }
}

/// pywidevine-serve compatible remote CDM.
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyRemoteConfig {
    pub name: String,
    pub host: String,
    pub secret: String,
    pub device_name: String,
    pub device_type: String,
    pub system_id: u32,
    pub security_level: u8,
    /// Per-CDM timeout override in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// Managed key-extraction API (DecryptLabs style).
#[derive(Debug, Clone, Deserialize)]
pub struct ManagedRemoteConfig {
    pub name: String,
    pub host: String,
    #[serde(alias = "secret")]
    pub api_key: String,
    /// Scheme requested from the API: `CHROME`, `L1`, `L2`, `SL2`, `SL3`.
    pub device_name: String,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Ask the API for keys it already holds before issuing a challenge.
    #[serde(default = "default_true")]
    pub get_cached_keys: bool,
}

fn default_true() -> bool {
    true
}

/// Fully configurable custom remote CDM API.
#[derive(Debug, Clone, Deserialize)]
pub struct CustomRemoteConfig {
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub device: CustomDeviceConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub endpoints: EndpointsConfig,
    #[serde(default)]
    pub request_mapping: RequestMappings,
    #[serde(default)]
    pub response_mapping: ResponseMappings,
    #[serde(default)]
    pub caching: CachingConfig,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustomDeviceConfig {
    #[serde(default = "default_custom_device_name")]
    pub name: String,
    #[serde(default = "default_custom_device_type", rename = "type")]
    pub device_type: String,
    #[serde(default)]
    pub system_id: Option<u32>,
    #[serde(default)]
    pub security_level: Option<u16>,
}

fn default_custom_device_name() -> String {
    "ChromeCDM".to_string()
}

fn default_custom_device_type() -> String {
    "CHROME".to_string()
}

impl Default for CustomDeviceConfig {
    fn default() -> Self {
        Self {
            name: default_custom_device_name(),
            device_type: default_custom_device_type(),
            system_id: None,
            security_level: None,
        }
    }
}

/// Raw `auth` block; compiled into [`crate::adapter::custom::AuthStrategy`].
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_auth_type", rename = "type")]
    pub auth_type: String,
    #[serde(default)]
    pub header_name: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Body field receiving the credential for `type: body`.
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,
}

fn default_auth_type() -> String {
    "header".to_string()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            auth_type: default_auth_type(),
            header_name: None,
            key: None,
            bearer_token: None,
            username: None,
            password: None,
            field: None,
            custom_headers: HashMap::new(),
        }
    }
}

/// An endpoint is either a bare path or a full definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EndpointConfig {
    Path(String),
    Full {
        path: String,
        #[serde(default)]
        method: Option<String>,
        #[serde(default)]
        timeout: Option<u64>,
    },
}

impl EndpointConfig {
    pub fn path(&self) -> &str {
        match self {
            EndpointConfig::Path(p) => p,
            EndpointConfig::Full { path, .. } => path,
        }
    }

    pub fn method(&self) -> &str {
        match self {
            EndpointConfig::Full {
                method: Some(m), ..
            } => m,
            _ => "POST",
        }
    }

    pub fn timeout(&self) -> Option<u64> {
        match self {
            EndpointConfig::Full { timeout, .. } => *timeout,
            EndpointConfig::Path(_) => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointsConfig {
    #[serde(default = "default_challenge_endpoint", alias = "get_request")]
    pub challenge: EndpointConfig,
    #[serde(default = "default_decrypt_endpoint", alias = "decrypt_response")]
    pub decrypt: EndpointConfig,
}

fn default_challenge_endpoint() -> EndpointConfig {
    EndpointConfig::Path("/get-challenge".to_string())
}

fn default_decrypt_endpoint() -> EndpointConfig {
    EndpointConfig::Path("/get-keys".to_string())
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            challenge: default_challenge_endpoint(),
            decrypt: default_decrypt_endpoint(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestMappings {
    #[serde(default, alias = "get_request")]
    pub challenge: RequestMapping,
    #[serde(default, alias = "decrypt_response")]
    pub decrypt: RequestMapping,
}

/// Request construction rules for one endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestMapping {
    /// Canonical name → provider name. Kept ordered.
    #[serde(default)]
    pub param_names: serde_yaml::Mapping,
    #[serde(default)]
    pub static_params: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub conditional_params: Vec<ConditionalParams>,
    #[serde(default)]
    pub transforms: Vec<ParamTransform>,
    #[serde(default)]
    pub nested_params: serde_yaml::Mapping,
    #[serde(default)]
    pub exclude_params: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConditionalParams {
    pub condition: String,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParamTransform {
    #[serde(alias = "field")]
    pub param: String,
    #[serde(rename = "type")]
    pub transform: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseMappings {
    #[serde(default, alias = "get_request")]
    pub challenge: ResponseMapping,
    #[serde(default, alias = "decrypt_response")]
    pub decrypt: ResponseMapping,
}

/// Response parsing rules for one endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseMapping {
    /// Canonical name → dot path into the response. Kept ordered.
    #[serde(default)]
    pub fields: serde_yaml::Mapping,
    #[serde(default)]
    pub transforms: Vec<ParamTransform>,
    #[serde(default)]
    pub response_types: Vec<ResponseType>,
    #[serde(default)]
    pub success_conditions: Vec<String>,
    #[serde(default)]
    pub error_fields: Option<Vec<String>>,
    /// Canonical key field → provider key field.
    #[serde(default)]
    pub key_fields: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseType {
    pub condition: String,
    #[serde(rename = "type")]
    pub response_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CachingConfig {
    /// Accept keys the API reports as already held.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Ask the API for held keys with the challenge request.
    #[serde(default = "default_true")]
    pub check_cached_first: bool,
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_cached_first: true,
        }
    }
}

/// A `key_vaults` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct VaultConfig {
    pub name: String,
    /// Never write keys to this vault.
    #[serde(default)]
    pub no_push: bool,
    #[serde(flatten)]
    pub backend: VaultBackend,
}

/// Backend-specific vault connection details, selected by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum VaultBackend {
    #[serde(rename = "SQLite", alias = "sqlite")]
    Sqlite { path: PathBuf },
    #[serde(rename = "MySQL", alias = "mysql")]
    Mysql {
        host: String,
        #[serde(default = "default_mysql_port")]
        port: u16,
        database: String,
        username: String,
        #[serde(default)]
        password: Option<String>,
    },
    #[serde(rename = "API", alias = "api")]
    Api {
        #[serde(alias = "host")]
        uri: String,
        /// Bearer token, query-mode password or DecryptLabs API key.
        #[serde(alias = "password", alias = "api_key")]
        token: String,
        /// Required by `query` mode.
        #[serde(default)]
        username: Option<String>,
        #[serde(default, alias = "api_mode")]
        mode: ApiMode,
    },
}

/// Wire format spoken by an HTTP key vault.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiMode {
    /// `GET`/`POST {uri}/{service}/{kid}` with a bearer token.
    #[default]
    Path,
    /// `GET {uri}?service=..&kid=..&username=..&password=..`.
    Query,
    /// `POST {uri}` with `{method, params, token}` and a server session id.
    Json,
    /// DecryptLabs cached-key lookup. Read only.
    DecryptLabs,
}

fn default_mysql_port() -> u16 {
    3306
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
cdm:
  default: local_l3
  NETFLIX:
    "<=1080": local_l3
    ">=1440": remote_l1
remote_cdm:
  - name: remote_l1
    host: https://cdm.example
    secret: s3cret
    device_name: pixel
    device_type: ANDROID
    system_id: 4464
    security_level: 1
  - name: labs
    type: decrypt_labs
    host: https://labs.example
    api_key: k
    device_name: L1
  - name: custom
    type: custom_api
    host: https://custom.example
    endpoints:
      challenge:
        path: /v1/challenge
        timeout: 5
      decrypt: /v1/keys
key_vaults:
  - type: SQLite
    name: Local
    path: keys.db
  - type: API
    name: Remote
    uri: https://vault.example/api
    token: t
    no_push: true
  - type: MySQL
    name: Shared
    host: db.example
    database: keys
    username: kv
"#;

    #[test]
    fn parses_all_sections() {
        let cfg = Config::from_yaml_str(SAMPLE).expect("config parses");
        let remotes = cfg.remote_cdms().expect("remote cdms parse");
        assert_eq!(remotes.len(), 3);
        assert!(matches!(remotes[0], RemoteCdmConfig::Legacy(_)));
        assert!(matches!(remotes[1], RemoteCdmConfig::Managed(_)));
        match &remotes[2] {
            RemoteCdmConfig::Custom(c) => {
                assert_eq!(c.endpoints.challenge.path(), "/v1/challenge");
                assert_eq!(c.endpoints.challenge.timeout(), Some(5));
                assert_eq!(c.endpoints.decrypt.path(), "/v1/keys");
                assert_eq!(c.endpoints.decrypt.method(), "POST");
            }
            other => panic!("unexpected dialect {:?}", other),
        }

        assert_eq!(cfg.key_vaults.len(), 3);
        assert!(!cfg.key_vaults[0].no_push);
        assert!(cfg.key_vaults[1].no_push);
        assert!(matches!(
            cfg.key_vaults[1].backend,
            VaultBackend::Api { mode: ApiMode::Path, .. }
        ));
        assert!(matches!(
            cfg.key_vaults[2].backend,
            VaultBackend::Mysql { port: 3306, .. }
        ));
        assert_eq!(cfg.timeouts.default, DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn unknown_remote_type_is_config_error() {
        let value: serde_yaml::Value =
            serde_yaml::from_str("{name: x, type: mystery, host: h}").unwrap();
        let err = RemoteCdmConfig::from_value(&value).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn legacy_missing_fields_is_config_error() {
        let value: serde_yaml::Value = serde_yaml::from_str("{name: x, host: h}").unwrap();
        let err = RemoteCdmConfig::from_value(&value).unwrap_err();
        assert!(err.to_string().contains("remote_cdm 'x'"));
    }

    #[test]
    fn api_vault_mode_and_aliases() {
        let cfg = Config::from_yaml_str(
            r#"
key_vaults:
  - {type: API, name: q, host: "https://kv.example", username: me, password: pw, api_mode: query}
  - {type: API, name: j, uri: "https://kv.example/api", token: t, mode: json}
"#,
        )
        .unwrap();
        match &cfg.key_vaults[0].backend {
            VaultBackend::Api {
                uri,
                token,
                username,
                mode,
            } => {
                assert_eq!(uri, "https://kv.example");
                assert_eq!(token, "pw");
                assert_eq!(username.as_deref(), Some("me"));
                assert_eq!(*mode, ApiMode::Query);
            }
            other => panic!("unexpected backend {:?}", other),
        }
        assert!(matches!(
            cfg.key_vaults[1].backend,
            VaultBackend::Api { mode: ApiMode::Json, .. }
        ));
    }

    #[test]
    fn empty_document_is_empty_config() {
        let cfg = Config::from_yaml_str("").unwrap();
        assert!(cfg.cdm.is_empty());
        assert!(cfg.key_vaults.is_empty());
    }
}
