//! SQLite vault: one table per service in a single database file.
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{storage_name, KeyVaultEntry, Vault};
use crate::error::{Error, Result};
use crate::key::{kid_hex, ContentKey};

#[derive(Clone)]
pub struct SqliteVault {
    name: String,
    no_push: bool,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteVault {
    /// Open (creating if needed) a file-backed vault.
    pub fn open(name: &str, path: &Path, no_push: bool) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::from_connection(name, Connection::open(path)?, no_push)
    }

    /// In-memory vault, for tests and dry runs.
    pub fn memory(name: &str, no_push: bool) -> Result<Self> {
        Self::from_connection(name, Connection::open_in_memory()?, no_push)
    }

    fn from_connection(name: &str, conn: Connection, no_push: bool) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self {
            name: name.to_string(),
            no_push,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run blocking database work off the async runtime.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        let vault = self.name.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| Error::VaultUnavailable {
                vault,
                reason: "connection lock poisoned".to_string(),
            })?;
            f(&conn)
        })
        .await
        .map_err(|e| Error::Other(format!("SQLite task failed: {}", e)))?
    }
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

fn create_table(conn: &Connection, table: &str) -> Result<()> {
    conn.execute_batch(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS "{table}" (
            kid TEXT PRIMARY KEY NOT NULL COLLATE NOCASE,
            key_ TEXT NOT NULL COLLATE NOCASE,
            first_seen TEXT NOT NULL
        );
        "#
    ))?;
    Ok(())
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[async_trait]
impl Vault for SqliteVault {
    fn name(&self) -> &str {
        &self.name
    }

    fn no_push(&self) -> bool {
        self.no_push
    }

    async fn get_key(&self, service: &str, kid: &Uuid) -> Result<Option<KeyVaultEntry>> {
        let table = storage_name(service)?;
        let kid = *kid;
        let service = service.to_string();
        let vault = self.name.clone();
        self.with_conn(move |conn| {
            if !table_exists(conn, &table)? {
                return Ok(None);
            }
            let row: Option<(String, String)> = conn
                .query_row(
                    &format!(r#"SELECT key_, first_seen FROM "{table}" WHERE kid = ?1"#),
                    [kid_hex(&kid)],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            row.map(|(key, first_seen)| -> Result<KeyVaultEntry> {
                Ok(KeyVaultEntry {
                    service,
                    key: ContentKey::new(kid, hex::decode(key)?),
                    first_seen: parse_time(&first_seen),
                    source_vault: vault,
                })
            })
            .transpose()
        })
        .await
    }

    async fn add_key(&self, service: &str, key: &ContentKey) -> Result<bool> {
        let table = storage_name(service)?;
        let kid = key.kid_hex();
        let value = key.key_hex();
        self.with_conn(move |conn| {
            create_table(conn, &table)?;
            let changed = conn.execute(
                &format!(
                    r#"INSERT INTO "{table}" (kid, key_, first_seen) VALUES (?1, ?2, ?3)
                       ON CONFLICT(kid) DO NOTHING"#
                ),
                params![kid, value, Utc::now().to_rfc3339()],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn services(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(names)
        })
        .await
    }

    async fn list_keys(&self, service: &str) -> Result<Vec<KeyVaultEntry>> {
        let table = storage_name(service)?;
        let service = service.to_string();
        let vault = self.name.clone();
        self.with_conn(move |conn| {
            if !table_exists(conn, &table)? {
                return Ok(Vec::new());
            }
            let mut stmt = conn.prepare(&format!(
                r#"SELECT kid, key_, first_seen FROM "{table}" ORDER BY first_seen, kid"#
            ))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(kid, key, first_seen)| -> Result<KeyVaultEntry> {
                    Ok(KeyVaultEntry {
                        service: service.clone(),
                        key: ContentKey::from_hex(&kid, &key, None)?,
                        first_seen: parse_time(&first_seen),
                        source_vault: vault.clone(),
                    })
                })
                .collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::parse_kid;

    #[tokio::test]
    async fn first_write_creates_schema_and_second_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let vault = SqliteVault::open("local", &dir.path().join("nested/keys.db"), false).unwrap();
        let kid = parse_kid("0123456789abcdef0123456789abcdef").unwrap();

        assert!(vault.get_key("NETFLIX", &kid).await.unwrap().is_none());
        assert!(vault.add_key("NETFLIX", &ContentKey::new(kid, vec![1; 16])).await.unwrap());
        assert!(!vault.add_key("NETFLIX", &ContentKey::new(kid, vec![2; 16])).await.unwrap());

        let entry = vault.get_key("NETFLIX", &kid).await.unwrap().unwrap();
        assert_eq!(entry.key.key, vec![1; 16]);
        assert_eq!(entry.source_vault, "local");
        assert!(entry.first_seen.is_some());
    }

    #[tokio::test]
    async fn services_are_isolated_and_listable() {
        let vault = SqliteVault::memory("mem", false).unwrap();
        let kid = parse_kid("01").unwrap();
        vault.add_key("NF", &ContentKey::new(kid, vec![3; 16])).await.unwrap();
        vault.add_key("AMZN", &ContentKey::new(kid, vec![4; 16])).await.unwrap();

        assert_eq!(vault.services().await.unwrap(), vec!["amzn", "nf"]);
        let nf = vault.list_keys("NF").await.unwrap();
        assert_eq!(nf.len(), 1);
        assert_eq!(nf[0].key.key, vec![3; 16]);
        assert!(vault.list_keys("DSNP").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.db");
        let kid = parse_kid("02").unwrap();
        {
            let vault = SqliteVault::open("a", &path, false).unwrap();
            vault.add_key("NF", &ContentKey::new(kid, vec![9; 16])).await.unwrap();
        }
        let reopened = SqliteVault::open("a", &path, false).unwrap();
        assert!(reopened.get_key("nf", &kid).await.unwrap().is_some());
    }
}
