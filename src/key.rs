//! Content keys and the key material returned by an acquisition.
//!
//! KIDs are carried as [`Uuid`] values; CEKs as raw bytes. Neither the
//! `Debug` output of [`ContentKey`] nor any error message exposes the CEK.

use std::fmt;

use uuid::Uuid;

use crate::error::{Error, Result};

/// Key type used for content decryption keys.
pub const CONTENT: &str = "CONTENT";

/// A decrypted content key.
#[derive(Clone, PartialEq, Eq)]
pub struct ContentKey {
    /// Key type (e.g., CONTENT, SIGNING, etc.).
    pub key_type: String,
    /// Key ID as UUID.
    pub kid: Uuid,
    /// Key bytes.
    pub key: Vec<u8>,
}

impl ContentKey {
    /// Create a new CONTENT key.
    pub fn new(kid: Uuid, key: Vec<u8>) -> Self {
        Self {
            key_type: CONTENT.to_string(),
            kid,
            key,
        }
    }

    /// Create a key from the hex strings remote APIs and vaults exchange.
    pub fn from_hex(kid: &str, key: &str, key_type: Option<&str>) -> Result<Self> {
        Ok(Self {
            key_type: key_type.unwrap_or(CONTENT).to_uppercase(),
            kid: parse_kid(kid)?,
            key: hex::decode(key.trim())?,
        })
    }

    pub fn is_content(&self) -> bool {
        self.key_type == CONTENT
    }

    /// All-zero keys are placeholders some services hand out and must never
    /// be cached.
    pub fn is_null(&self) -> bool {
        self.key.iter().all(|b| *b == 0)
    }

    pub fn key_hex(&self) -> String {
        hex::encode(&self.key)
    }

    pub fn kid_hex(&self) -> String {
        kid_hex(&self.kid)
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentKey")
            .field("key_type", &self.key_type)
            .field("kid", &self.kid)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Parse a KID from the textual forms seen in configs, vaults and APIs.
///
/// Accepts hex with or without dashes. Shorter hex strings are right-padded
/// with `0` to 32 characters.
pub fn parse_kid(kid: &str) -> Result<Uuid> {
    let clean: String = kid.trim().chars().filter(|c| *c != '-').collect();
    if clean.is_empty() || clean.len() > 32 {
        return Err(Error::InvalidInitData(format!("Invalid key ID '{}'", kid)));
    }
    let padded = format!("{:0<32}", clean.to_ascii_lowercase());
    Uuid::parse_str(&padded).map_err(|_| Error::InvalidInitData(format!("Invalid key ID '{}'", kid)))
}

/// Canonical lowercase, dash-less KID representation used as the vault key.
pub fn kid_hex(kid: &Uuid) -> String {
    kid.as_simple().to_string()
}

/// Where an acquisition's keys came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Every required key was already cached in the named vault(s).
    Vault(Vec<String>),
    /// Keys were obtained live through the named CDM candidate.
    Cdm(String),
}

/// Keys resulting from one acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub keys: Vec<ContentKey>,
    pub source: KeySource,
}

impl KeyMaterial {
    /// Look up the key for a KID.
    pub fn get(&self, kid: &Uuid) -> Option<&ContentKey> {
        self.keys.iter().find(|k| &k.kid == kid)
    }

    /// Whether every KID in `required` has a key.
    pub fn covers(&self, required: &[Uuid]) -> bool {
        required.iter().all(|kid| self.get(kid).is_some())
    }
}

/// Merge `extra` into `keys`, keeping whichever key was recorded first for a
/// KID.
pub fn merge_keys(keys: &mut Vec<ContentKey>, extra: impl IntoIterator<Item = ContentKey>) {
    for key in extra {
        if !keys.iter().any(|k| k.kid == key.kid) {
            keys.push(key);
        }
    }
}
