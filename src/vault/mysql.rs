//! MySQL vault: one table per service, shared connection pool.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mysql_async::prelude::Queryable;
use mysql_async::{OptsBuilder, Pool};
use uuid::Uuid;

use super::{storage_name, KeyVaultEntry, Vault};
use crate::error::Result;
use crate::key::{kid_hex, ContentKey};

/// Connection details of a MySQL vault.
#[derive(Clone)]
pub struct Connection {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: Option<String>,
}

pub struct MySqlVault {
    name: String,
    no_push: bool,
    pool: Pool,
}

impl MySqlVault {
    /// Create the vault. Connections are opened lazily on first use.
    pub fn new(name: &str, connection: Connection, no_push: bool) -> Result<Self> {
        let opts = OptsBuilder::default()
            .ip_or_hostname(connection.host)
            .tcp_port(connection.port)
            .db_name(Some(connection.database))
            .user(Some(connection.username))
            .pass(connection.password);
        Ok(Self {
            name: name.to_string(),
            no_push,
            pool: Pool::new(opts),
        })
    }
}

const TABLE_EXISTS_SQL: &str = "SELECT table_name FROM information_schema.tables \
     WHERE table_schema = DATABASE() AND table_name = ?";

const LIST_TABLES_SQL: &str = "SELECT table_name FROM information_schema.tables \
     WHERE table_schema = DATABASE() ORDER BY table_name";

fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS `{table}` (\
         kid VARCHAR(32) NOT NULL PRIMARY KEY, \
         key_ VARCHAR(255) NOT NULL, \
         first_seen VARCHAR(40) NOT NULL\
         ) CHARACTER SET ascii COLLATE ascii_general_ci"
    )
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[async_trait]
impl Vault for MySqlVault {
    fn name(&self) -> &str {
        &self.name
    }

    fn no_push(&self) -> bool {
        self.no_push
    }

    async fn get_key(&self, service: &str, kid: &Uuid) -> Result<Option<KeyVaultEntry>> {
        let table = storage_name(service)?;
        let mut conn = self.pool.get_conn().await?;
        let exists: Option<String> = conn.exec_first(TABLE_EXISTS_SQL, (table.clone(),)).await?;
        if exists.is_none() {
            return Ok(None);
        }
        let row: Option<(String, String)> = conn
            .exec_first(
                format!("SELECT key_, first_seen FROM `{table}` WHERE kid = ?"),
                (kid_hex(kid),),
            )
            .await?;
        row.map(|(key, first_seen)| -> Result<KeyVaultEntry> {
            Ok(KeyVaultEntry {
                service: service.to_string(),
                key: ContentKey::new(*kid, hex::decode(key)?),
                first_seen: parse_time(&first_seen),
                source_vault: self.name.clone(),
            })
        })
        .transpose()
    }

    async fn add_key(&self, service: &str, key: &ContentKey) -> Result<bool> {
        let table = storage_name(service)?;
        let mut conn = self.pool.get_conn().await?;
        conn.query_drop(create_table_sql(&table)).await?;
        conn.exec_drop(
            format!("INSERT IGNORE INTO `{table}` (kid, key_, first_seen) VALUES (?, ?, ?)"),
            (key.kid_hex(), key.key_hex(), Utc::now().to_rfc3339()),
        )
        .await?;
        Ok(conn.affected_rows() == 1)
    }

    async fn services(&self) -> Result<Vec<String>> {
        let mut conn = self.pool.get_conn().await?;
        let tables: Vec<String> = conn.query(LIST_TABLES_SQL).await?;
        Ok(tables)
    }

    async fn list_keys(&self, service: &str) -> Result<Vec<KeyVaultEntry>> {
        let table = storage_name(service)?;
        let mut conn = self.pool.get_conn().await?;
        let exists: Option<String> = conn.exec_first(TABLE_EXISTS_SQL, (table.clone(),)).await?;
        if exists.is_none() {
            return Ok(Vec::new());
        }
        let rows: Vec<(String, String, String)> = conn
            .query(format!(
                "SELECT kid, key_, first_seen FROM `{table}` ORDER BY first_seen, kid"
            ))
            .await?;
        rows.into_iter()
            .map(|(kid, key, first_seen)| -> Result<KeyVaultEntry> {
                Ok(KeyVaultEntry {
                    service: service.to_string(),
                    key: ContentKey::from_hex(&kid, &key, None)?,
                    first_seen: parse_time(&first_seen),
                    source_vault: self.name.clone(),
                })
            })
            .collect()
    }
}
