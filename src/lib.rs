//! cdmroute - CDM selection, license acquisition fallback and key caching.
//!
//! This crate provides:
//! - Per-service selection rules (profile, DRM, quality, defaults) that pick
//!   the primary CDM for a piece of content.
//! - A fallback sequencer that tries the primary, then local PlayReady and
//!   Widevine devices, until one yields keys.
//! - Protocol adapters for pywidevine-serve, DecryptLabs-style managed APIs,
//!   fully mapped custom APIs and host-supplied local CDMs.
//! - Key vaults (SQLite, MySQL, HTTP API) with short-circuit lookup and
//!   fan-out write-through.
//!
//! Feature flags:
//! - `cli`: enable the diagnostic CLI binary.
#![allow(clippy::result_large_err)]

/// Protocol adapters and the collaborator traits they rely on.
pub mod adapter;
/// YAML configuration.
pub mod config;
/// Local device identity file probing.
pub mod device;
/// DRM schemes and device types.
pub mod drm;
/// Engine façade.
pub mod engine;
/// Common error types and Result alias.
pub mod error;
/// Content key representation.
pub mod key;
/// PSSH / init data parsing.
pub mod pssh;
/// Descriptor registry.
pub mod registry;
/// Selection rules.
pub mod selection;
/// Fallback sequencer.
pub mod sequencer;
/// Key vaults.
pub mod vault;

pub use adapter::{LicenseServer, LocalCdm, LocalCdms};
pub use config::Config;
pub use drm::DrmType;
pub use engine::Engine;
pub use error::{Error, ErrorKind, Result};
pub use key::{ContentKey, KeyMaterial, KeySource};
pub use pssh::InitData;
pub use selection::SelectionContext;
