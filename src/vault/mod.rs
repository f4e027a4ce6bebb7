//! Key vaults: persistent KID → content key caches.
//!
//! [`KeyVaults`] queries vaults in declaration order and stops at the first
//! hit. Writes fan out concurrently to every vault not flagged `no_push`;
//! one vault failing never blocks or rolls back the others. Entries are
//! immutable: writing a KID that is already stored keeps the first value.
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{VaultBackend, VaultConfig};
use crate::error::{Error, Result};
use crate::key::{kid_hex, ContentKey};

pub mod api;
pub mod mysql;
pub mod sqlite;

pub use api::ApiVault;
pub use mysql::MySqlVault;
pub use sqlite::SqliteVault;

/// A stored key and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyVaultEntry {
    pub service: String,
    pub key: ContentKey,
    /// When the vault first recorded the key, if the backend tracks it.
    pub first_seen: Option<DateTime<Utc>>,
    pub source_vault: String,
}

/// A single key store backend.
#[async_trait]
pub trait Vault: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this vault is read-only for the engine.
    fn no_push(&self) -> bool;

    async fn get_key(&self, service: &str, kid: &Uuid) -> Result<Option<KeyVaultEntry>>;

    /// Insert a key. Returns `false` when the KID was already stored, in
    /// which case the stored value is left untouched.
    async fn add_key(&self, service: &str, key: &ContentKey) -> Result<bool>;

    /// Services that have at least one stored key.
    async fn services(&self) -> Result<Vec<String>> {
        Err(unsupported(self.name(), "listing services"))
    }

    /// Every key stored for a service.
    async fn list_keys(&self, _service: &str) -> Result<Vec<KeyVaultEntry>> {
        Err(unsupported(self.name(), "listing keys"))
    }
}

fn unsupported(vault: &str, what: &str) -> Error {
    Error::VaultUnavailable {
        vault: vault.to_string(),
        reason: format!("{} is not supported", what),
    }
}

/// Build a vault from its configuration entry.
pub fn open_vault(config: &VaultConfig) -> Result<Arc<dyn Vault>> {
    let vault: Arc<dyn Vault> = match &config.backend {
        VaultBackend::Sqlite { path } => {
            Arc::new(SqliteVault::open(&config.name, path, config.no_push)?)
        }
        VaultBackend::Mysql {
            host,
            port,
            database,
            username,
            password,
        } => Arc::new(MySqlVault::new(
            &config.name,
            mysql::Connection {
                host: host.clone(),
                port: *port,
                database: database.clone(),
                username: username.clone(),
                password: password.clone(),
            },
            config.no_push,
        )?),
        VaultBackend::Api {
            uri,
            token,
            username,
            mode,
        } => Arc::new(ApiVault::new(
            &config.name,
            api::Connection {
                uri: uri.clone(),
                token: token.clone(),
                username: username.clone(),
                mode: *mode,
            },
            config.no_push,
        )?),
    };
    Ok(vault)
}

/// Table-safe form of a service tag. Tags are case-sensitive elsewhere but
/// vault storage has always been keyed case-insensitively.
pub(crate) fn storage_name(service: &str) -> Result<String> {
    let name: String = service
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    if name.is_empty() {
        return Err(Error::Config("Service tag must not be empty".to_string()));
    }
    Ok(name)
}

fn reject_null(key: &ContentKey) -> Result<()> {
    if key.is_null() {
        return Err(Error::Other(format!(
            "Refusing to store a null content key for KID {}",
            key.kid_hex()
        )));
    }
    Ok(())
}

/// Outcome of a fan-out write. Only identifiers are recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreReport {
    /// (vault, KID) pairs newly written.
    pub inserted: Vec<(String, String)>,
    /// (vault, KID) pairs already present.
    pub existing: Vec<(String, String)>,
    /// (vault, reason) for writes that failed.
    pub failed: Vec<(String, String)>,
    /// Null keys that were not written anywhere.
    pub rejected: Vec<String>,
}

impl StoreReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.rejected.is_empty()
    }
}

/// Result of looking up several KIDs at once.
#[derive(Debug, Clone, Default)]
pub struct VaultLookup {
    pub found: Vec<KeyVaultEntry>,
    pub missing: Vec<Uuid>,
}

/// Ordered set of vaults.
#[derive(Clone, Default)]
pub struct KeyVaults {
    vaults: Vec<Arc<dyn Vault>>,
}

impl std::fmt::Debug for KeyVaults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl KeyVaults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open every configured vault, in order. Duplicate names are rejected.
    pub fn from_configs(configs: &[VaultConfig]) -> Result<Self> {
        let mut vaults = Self::new();
        for config in configs {
            if vaults.get(&config.name).is_some() {
                return Err(Error::Config(format!("Duplicate vault name '{}'", config.name)));
            }
            vaults.push(open_vault(config)?);
        }
        Ok(vaults)
    }

    pub fn push(&mut self, vault: Arc<dyn Vault>) {
        self.vaults.push(vault);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Vault>> {
        self.vaults.iter().find(|v| v.name() == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.vaults.iter().map(|v| v.name())
    }

    pub fn len(&self) -> usize {
        self.vaults.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vaults.is_empty()
    }

    /// Find a key, asking vaults in order until one has it.
    ///
    /// Vault errors are logged and skipped; if every vault fails the result
    /// is simply `None`.
    pub async fn lookup(&self, service: &str, kid: &Uuid) -> Option<KeyVaultEntry> {
        let mut failures = 0;
        for vault in &self.vaults {
            match vault.get_key(service, kid).await {
                Ok(Some(entry)) => {
                    debug!(vault = vault.name(), service, kid = %kid_hex(kid), "vault hit");
                    return Some(entry);
                }
                Ok(None) => {}
                Err(e) => {
                    failures += 1;
                    warn!(vault = vault.name(), service, error = %e, "vault lookup failed");
                }
            }
        }
        if failures > 0 && failures == self.vaults.len() {
            warn!(service, kid = %kid_hex(kid), "every vault failed, treating as a miss");
        }
        None
    }

    /// Look up each KID in turn.
    pub async fn lookup_many(&self, service: &str, kids: &[Uuid]) -> VaultLookup {
        let mut result = VaultLookup::default();
        for kid in kids {
            match self.lookup(service, kid).await {
                Some(entry) => result.found.push(entry),
                None => result.missing.push(*kid),
            }
        }
        result
    }

    /// Write one key to every push-enabled vault.
    pub async fn store(&self, service: &str, key: &ContentKey) -> StoreReport {
        self.store_all(service, std::slice::from_ref(key), None).await
    }

    /// Write keys to every push-enabled vault except `skip`, concurrently
    /// across vaults. Every outcome is collected before returning.
    pub async fn store_all(
        &self,
        service: &str,
        keys: &[ContentKey],
        skip: Option<&str>,
    ) -> StoreReport {
        let mut report = StoreReport::default();
        let mut storable = Vec::with_capacity(keys.len());
        for key in keys.iter().filter(|k| k.is_content()) {
            match reject_null(key) {
                Ok(()) => storable.push(key),
                Err(e) => {
                    warn!(service, error = %e, "skipping key");
                    report.rejected.push(key.kid_hex());
                }
            }
        }
        if storable.is_empty() {
            return report;
        }

        let targets = self
            .vaults
            .iter()
            .filter(|v| !v.no_push() && Some(v.name()) != skip);
        let writes = targets.map(|vault| {
            let storable = &storable;
            async move {
                let mut outcomes = Vec::with_capacity(storable.len());
                for key in storable {
                    outcomes.push((key.kid_hex(), vault.add_key(service, key).await));
                }
                (vault.name().to_string(), outcomes)
            }
        });

        for (vault, outcomes) in join_all(writes).await {
            for (kid, outcome) in outcomes {
                match outcome {
                    Ok(true) => report.inserted.push((vault.clone(), kid)),
                    Ok(false) => report.existing.push((vault.clone(), kid)),
                    Err(e) => {
                        warn!(vault = %vault, service, kid = %kid, error = %e, "vault write failed");
                        report.failed.push((vault.clone(), e.to_string()));
                    }
                }
            }
        }
        if !report.inserted.is_empty() {
            info!(service, inserted = report.inserted.len(), "cached new keys");
        }
        report
    }

    /// Copy every key of `from` into the other push-enabled vaults.
    pub async fn copy_from(&self, from: &str) -> Result<StoreReport> {
        let source = self
            .get(from)
            .ok_or_else(|| Error::Config(format!("Unknown vault '{}'", from)))?;
        let mut report = StoreReport::default();
        for service in source.services().await? {
            let keys: Vec<ContentKey> = source
                .list_keys(&service)
                .await?
                .into_iter()
                .map(|e| e.key)
                .collect();
            let part = self.store_all(&service, &keys, Some(from)).await;
            report.inserted.extend(part.inserted);
            report.existing.extend(part.existing);
            report.failed.extend(part.failed);
            report.rejected.extend(part.rejected);
        }
        Ok(report)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::key::parse_kid;

    /// In-memory vault with an optional forced failure.
    pub(crate) struct MemoryVault {
        name: String,
        no_push: bool,
        broken: bool,
        pub(crate) keys: Mutex<HashMap<(String, Uuid), ContentKey>>,
        pub(crate) reads: Mutex<usize>,
    }

    impl MemoryVault {
        pub(crate) fn new(name: &str, no_push: bool) -> Self {
            Self {
                name: name.to_string(),
                no_push,
                broken: false,
                keys: Mutex::new(HashMap::new()),
                reads: Mutex::new(0),
            }
        }

        pub(crate) fn broken(name: &str) -> Self {
            Self {
                broken: true,
                ..Self::new(name, false)
            }
        }

        pub(crate) fn contains(&self, service: &str, kid: &Uuid) -> bool {
            self.keys
                .lock()
                .unwrap()
                .contains_key(&(service.to_string(), *kid))
        }
    }

    #[async_trait]
    impl Vault for MemoryVault {
        fn name(&self) -> &str {
            &self.name
        }

        fn no_push(&self) -> bool {
            self.no_push
        }

        async fn get_key(&self, service: &str, kid: &Uuid) -> Result<Option<KeyVaultEntry>> {
            *self.reads.lock().unwrap() += 1;
            if self.broken {
                return Err(Error::VaultUnavailable {
                    vault: self.name.clone(),
                    reason: "down".to_string(),
                });
            }
            Ok(self
                .keys
                .lock()
                .unwrap()
                .get(&(service.to_string(), *kid))
                .map(|key| KeyVaultEntry {
                    service: service.to_string(),
                    key: key.clone(),
                    first_seen: None,
                    source_vault: self.name.clone(),
                }))
        }

        async fn add_key(&self, service: &str, key: &ContentKey) -> Result<bool> {
            if self.broken {
                return Err(Error::VaultUnavailable {
                    vault: self.name.clone(),
                    reason: "down".to_string(),
                });
            }
            let mut keys = self.keys.lock().unwrap();
            let slot = (service.to_string(), key.kid);
            if keys.contains_key(&slot) {
                return Ok(false);
            }
            keys.insert(slot, key.clone());
            Ok(true)
        }
    }

    fn key(kid: &str, byte: u8) -> ContentKey {
        ContentKey::new(parse_kid(kid).unwrap(), vec![byte; 16])
    }

    #[tokio::test]
    async fn lookup_short_circuits_on_first_hit() {
        let a = Arc::new(MemoryVault::new("a", false));
        let b = Arc::new(MemoryVault::new("b", false));
        let k = key("01", 1);
        a.add_key("NF", &k).await.unwrap();

        let mut vaults = KeyVaults::new();
        vaults.push(a.clone());
        vaults.push(b.clone());

        let entry = vaults.lookup("NF", &k.kid).await.unwrap();
        assert_eq!(entry.source_vault, "a");
        assert_eq!(*b.reads.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn broken_vaults_are_skipped() {
        let good = Arc::new(MemoryVault::new("good", false));
        let k = key("02", 2);
        good.add_key("NF", &k).await.unwrap();

        let mut vaults = KeyVaults::new();
        vaults.push(Arc::new(MemoryVault::broken("down")));
        vaults.push(good);
        assert!(vaults.lookup("NF", &k.kid).await.is_some());

        let mut all_down = KeyVaults::new();
        all_down.push(Arc::new(MemoryVault::broken("x")));
        all_down.push(Arc::new(MemoryVault::broken("y")));
        assert!(all_down.lookup("NF", &k.kid).await.is_none());
    }

    #[tokio::test]
    async fn store_respects_no_push_and_tolerates_failures() {
        let a = Arc::new(MemoryVault::new("a", false));
        let b = Arc::new(MemoryVault::new("b", true));
        let mut vaults = KeyVaults::new();
        vaults.push(a.clone());
        vaults.push(b.clone());
        vaults.push(Arc::new(MemoryVault::broken("c")));

        let k = key("03", 3);
        let report = vaults.store("NF", &k).await;
        assert!(a.contains("NF", &k.kid));
        assert!(!b.contains("NF", &k.kid));
        assert_eq!(report.inserted, vec![("a".to_string(), k.kid_hex())]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(vaults.lookup("NF", &k.kid).await.unwrap().source_vault, "a");
    }

    #[tokio::test]
    async fn second_write_keeps_first_value() {
        let a = Arc::new(MemoryVault::new("a", false));
        let mut vaults = KeyVaults::new();
        vaults.push(a.clone());

        let first = key("04", 4);
        let second = key("04", 5);
        assert_eq!(vaults.store("NF", &first).await.inserted.len(), 1);
        let report = vaults.store("NF", &second).await;
        assert!(report.is_clean());
        assert_eq!(report.existing.len(), 1);
        assert_eq!(a.keys.lock().unwrap().len(), 1);
        assert_eq!(vaults.lookup("NF", &first.kid).await.unwrap().key, first);
    }

    #[tokio::test]
    async fn null_keys_are_never_written() {
        let a = Arc::new(MemoryVault::new("a", false));
        let mut vaults = KeyVaults::new();
        vaults.push(a.clone());

        let null = ContentKey::new(parse_kid("05").unwrap(), vec![0; 16]);
        let report = vaults.store("NF", &null).await;
        assert_eq!(report.rejected, vec![null.kid_hex()]);
        assert!(!a.contains("NF", &null.kid));
    }

    #[test]
    fn storage_names_are_table_safe() {
        assert_eq!(storage_name("NETFLIX").unwrap(), "netflix");
        assert_eq!(storage_name("DSNP-US").unwrap(), "dsnp_us");
        assert!(storage_name("  ").is_err());
    }
}
