//! The engine binds a loaded configuration to its compiled rules, descriptor
//! registry and vaults. It is immutable after construction and can be shared
//! across concurrent acquisitions.
use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::adapter::{LicenseServer, LocalCdms};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::key::KeyMaterial;
use crate::pssh::InitData;
use crate::registry::Registry;
use crate::selection::{Resolution, SelectionContext, SelectionRules};
use crate::sequencer::{Candidate, FallbackSequencer};
use crate::vault::KeyVaults;

pub struct Engine {
    rules: Arc<SelectionRules>,
    registry: Arc<Registry>,
    sequencer: FallbackSequencer,
}

impl Engine {
    /// Build an engine, opening every configured vault.
    pub fn new(config: &Config, locals: LocalCdms) -> Result<Self> {
        let vaults = KeyVaults::from_configs(&config.key_vaults)?;
        Self::with_vaults(config, vaults, locals)
    }

    /// Build an engine around vaults the host opened itself.
    pub fn with_vaults(config: &Config, vaults: KeyVaults, locals: LocalCdms) -> Result<Self> {
        let rules = Arc::new(SelectionRules::from_mapping(&config.cdm)?);
        let registry = Arc::new(Registry::from_config(config, &rules)?);
        let sequencer = FallbackSequencer::new(registry.clone(), rules.clone(), vaults, locals);
        Ok(Self {
            rules,
            registry,
            sequencer,
        })
    }

    pub fn from_path<P: AsRef<Path>>(path: P, locals: LocalCdms) -> Result<Self> {
        Self::new(&Config::from_path(path)?, locals)
    }

    pub fn rules(&self) -> &SelectionRules {
        &self.rules
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn vaults(&self) -> &KeyVaults {
        self.sequencer.vaults()
    }

    /// Pick the primary CDM for a context.
    pub fn resolve(&self, ctx: &SelectionContext) -> Result<Resolution> {
        self.rules.resolve(ctx)
    }

    /// Resolve the primary and expand it into the full fallback sequence.
    /// Without a DRM type in the context, the primary's own scheme is used.
    pub fn candidates(&self, ctx: &SelectionContext) -> Result<Vec<Candidate>> {
        let resolution = self.resolve(ctx)?;
        let drm_type = match ctx.drm_type {
            Some(drm) => drm,
            None => self
                .registry
                .get(&resolution.descriptor)
                .ok_or_else(|| Error::Config(format!("Unknown CDM '{}'", resolution.descriptor)))?
                .drm_type()?,
        };
        self.sequencer.plan(&resolution.descriptor, &ctx.service, drm_type)
    }

    /// Acquire keys for content. The content's scheme always overrides any
    /// DRM type in `ctx`.
    pub async fn acquire(
        &self,
        ctx: &SelectionContext,
        init_data: &InitData,
        server: &dyn LicenseServer,
        cancel: &CancellationToken,
    ) -> Result<KeyMaterial> {
        let ctx = ctx.clone().drm(init_data.drm_type);
        let resolution = self.resolve(&ctx)?;
        info!(
            service = %ctx.service,
            cdm = %resolution.descriptor,
            level = ?resolution.level,
            "selected CDM"
        );
        self.sequencer
            .acquire(&resolution.descriptor, &ctx.service, init_data, server, cancel)
            .await
    }
}
