//! Fallback sequencer: one acquisition, candidates tried strictly in order.
//!
//! The sequence is `[primary, local PlayReady, local Widevine]` for the
//! service, de-duplicated. Candidates whose scheme cannot serve the content
//! are skipped and reported, never used. Vaults are consulted before any
//! candidate and written after a live success; a cancelled acquisition
//! writes nothing.
use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{
    build_adapter, Challenge, ChallengeRequest, LicenseChallenge, LicenseServer, LocalCdms,
};
use crate::drm::DrmType;
use crate::error::{Attempt, Error, Result};
use crate::key::{merge_keys, ContentKey, KeyMaterial, KeySource};
use crate::pssh::InitData;
use crate::registry::{CdmDescriptor, Registry};
use crate::selection::{SelectionRules, SelectionTable};
use crate::vault::{KeyVaultEntry, KeyVaults, VaultLookup};

/// One entry of the fallback sequence.
#[derive(Clone)]
pub struct Candidate {
    pub name: String,
    pub descriptor: Arc<CdmDescriptor>,
    /// Set when the candidate cannot serve the content and will be skipped.
    pub skip_reason: Option<String>,
}

impl Candidate {
    pub fn is_runnable(&self) -> bool {
        self.skip_reason.is_none()
    }
}

pub struct FallbackSequencer {
    registry: Arc<Registry>,
    rules: Arc<SelectionRules>,
    vaults: KeyVaults,
    locals: LocalCdms,
}

impl FallbackSequencer {
    pub fn new(
        registry: Arc<Registry>,
        rules: Arc<SelectionRules>,
        vaults: KeyVaults,
        locals: LocalCdms,
    ) -> Self {
        Self {
            registry,
            rules,
            vaults,
            locals,
        }
    }

    pub fn vaults(&self) -> &KeyVaults {
        &self.vaults
    }

    /// First local device of `drm_type` the service's table references, in
    /// declaration order, else the global default if it is one.
    fn local_for_service(&self, service: &str, drm_type: DrmType) -> Option<&str> {
        self.rules
            .table(service)
            .map(SelectionTable::referenced)
            .unwrap_or_default()
            .into_iter()
            .chain(self.rules.global_default())
            .find(|name| {
                matches!(
                    self.registry.get(name).as_deref(),
                    Some(CdmDescriptor::LocalDevice(d)) if d.drm_type == drm_type
                )
            })
    }

    /// Build the candidate sequence for content of `drm_type`.
    pub fn plan(&self, primary: &str, service: &str, drm_type: DrmType) -> Result<Vec<Candidate>> {
        let mut names = vec![primary];
        names.extend(self.local_for_service(service, DrmType::PlayReady));
        names.extend(self.local_for_service(service, DrmType::Widevine));

        let mut seen = HashSet::new();
        let mut plan = Vec::with_capacity(names.len());
        for name in names {
            if !seen.insert(name) {
                continue;
            }
            let descriptor = self
                .registry
                .get(name)
                .ok_or_else(|| Error::Config(format!("Unknown CDM '{}'", name)))?;
            let skip_reason = match descriptor.drm_type() {
                Ok(drm) if drm == drm_type => None,
                Ok(drm) => Some(format!("{} CDM cannot serve {} content", drm, drm_type)),
                Err(e) => Some(e.to_string()),
            };
            plan.push(Candidate {
                name: name.to_string(),
                descriptor,
                skip_reason,
            });
        }
        Ok(plan)
    }

    /// Obtain keys for the content, from vaults if every required KID is
    /// cached, otherwise through the first candidate that succeeds.
    pub async fn acquire(
        &self,
        primary: &str,
        service: &str,
        init_data: &InitData,
        server: &dyn LicenseServer,
        cancel: &CancellationToken,
    ) -> Result<KeyMaterial> {
        let required = &init_data.key_ids;
        let cached = if required.is_empty() || self.vaults.is_empty() {
            VaultLookup::default()
        } else {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                lookup = self.vaults.lookup_many(service, required) => lookup,
            }
        };

        if !required.is_empty() && cached.missing.is_empty() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            info!(service, keys = cached.found.len(), "every key found in vaults");
            self.backfill(service, &cached.found).await;
            let mut sources: Vec<String> = Vec::new();
            for entry in &cached.found {
                if !sources.contains(&entry.source_vault) {
                    sources.push(entry.source_vault.clone());
                }
            }
            return Ok(KeyMaterial {
                keys: cached.found.into_iter().map(|e| e.key).collect(),
                source: KeySource::Vault(sources),
            });
        }

        let plan = self.plan(primary, service, init_data.drm_type)?;
        let (candidate, keys) = self.run(&plan, service, init_data, server, cancel).await?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.vaults.store_all(service, &keys, None).await;

        let mut all = keys;
        merge_keys(&mut all, cached.found.into_iter().map(|e| e.key));
        let material = KeyMaterial {
            keys: all,
            source: KeySource::Cdm(candidate),
        };
        if !material.covers(required) {
            warn!(service, "acquired keys do not cover every required KID");
        }
        Ok(material)
    }

    /// Copy keys found in one vault into the other push-enabled vaults.
    async fn backfill(&self, service: &str, found: &[KeyVaultEntry]) {
        for entry in found {
            self.vaults
                .store_all(service, std::slice::from_ref(&entry.key), Some(&entry.source_vault))
                .await;
        }
    }

    async fn run(
        &self,
        plan: &[Candidate],
        service: &str,
        init_data: &InitData,
        server: &dyn LicenseServer,
        cancel: &CancellationToken,
    ) -> Result<(String, Vec<ContentKey>)> {
        let mut attempts = Vec::with_capacity(plan.len());
        for candidate in plan {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if let Some(reason) = &candidate.skip_reason {
                debug!(service, candidate = %candidate.name, reason = %reason, "skipping CDM");
                attempts.push(Attempt {
                    candidate: candidate.name.clone(),
                    reason: reason.clone(),
                });
                continue;
            }

            info!(service, candidate = %candidate.name, kind = candidate.descriptor.kind(), "trying CDM");
            let reason = match self.attempt(candidate, service, init_data, server, cancel).await {
                Ok(keys) if keys.iter().any(ContentKey::is_content) => {
                    info!(service, candidate = %candidate.name, keys = keys.len(), "obtained keys");
                    return Ok((candidate.name.clone(), keys));
                }
                Ok(_) => "no content keys returned".to_string(),
                Err(e) if !e.is_candidate_recoverable() => return Err(e),
                Err(e) => e.to_string(),
            };
            warn!(service, candidate = %candidate.name, reason = %reason, "CDM failed");
            attempts.push(Attempt {
                candidate: candidate.name.clone(),
                reason,
            });
        }
        Err(Error::FallbackExhausted {
            service: service.to_string(),
            attempts,
        })
    }

    async fn attempt(
        &self,
        candidate: &Candidate,
        service: &str,
        init_data: &InitData,
        server: &dyn LicenseServer,
        cancel: &CancellationToken,
    ) -> Result<Vec<ContentKey>> {
        let adapter = build_adapter(
            &candidate.name,
            &candidate.descriptor,
            self.registry.default_timeout(),
            &self.locals,
        )?;
        let drm_type = init_data.drm_type;
        let certificate = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            certificate = server.service_certificate(drm_type) => certificate?,
        };
        let request = ChallengeRequest {
            service,
            init_data,
            service_certificate: certificate.as_deref(),
        };

        let challenge = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            challenge = adapter.challenge(&request) => challenge?,
        };
        let challenge = match challenge {
            Challenge::Cached(keys) => {
                debug!(service, candidate = %candidate.name, "CDM answered from its cache");
                return Ok(keys);
            }
            Challenge::License(challenge) => challenge,
        };

        // From here a session may be open; cancellation releases it.
        let license = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            license = server.license(drm_type, &challenge.payload) => Some(license),
        };
        let license = match license {
            Some(Ok(license)) => license,
            Some(Err(e)) => {
                adapter.abort(challenge).await;
                return Err(e);
            }
            None => {
                debug!(service, candidate = %candidate.name, "cancelled, closing session");
                adapter.abort(challenge).await;
                return Err(Error::Cancelled);
            }
        };

        let session = LicenseChallenge {
            payload: Vec::new(),
            session: challenge.session.clone(),
            cached: Vec::new(),
        };
        let keys = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            keys = adapter.parse(challenge, &license) => Some(keys),
        };
        match keys {
            Some(keys) => keys,
            None => {
                adapter.abort(session).await;
                Err(Error::Cancelled)
            }
        }
    }
}
