//! SQLite persistence for supervisor state
//!
//! One database file holds the `macconn` mirror, the append-only
//! `fingerprint` log, the capture workers' `pcap` metadata table and the
//! credential store's `store`/`secrets` pair. All tables are created on
//! first start; a missing row is never an error.

use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info};

use crate::state::{MacAddr, MacConn};

const CREATE_MACCONN: &str = r#"
    CREATE TABLE IF NOT EXISTS macconn (
        mac TEXT NOT NULL,
        allow INTEGER NOT NULL,
        vlan_id INTEGER NOT NULL,
        nat INTEGER NOT NULL,
        ip TEXT,
        ifname TEXT,
        psk_cipher TEXT,
        label TEXT,
        join_ts INTEGER NOT NULL,
        id TEXT NOT NULL,
        PRIMARY KEY (mac)
    )
"#;

const CREATE_FINGERPRINT: &str = r#"
    CREATE TABLE IF NOT EXISTS fingerprint (
        mac TEXT NOT NULL,
        protocol TEXT,
        fingerprint TEXT,
        timestamp INTEGER NOT NULL,
        query TEXT
    )
"#;

const CREATE_PCAP: &str = r#"
    CREATE TABLE IF NOT EXISTS pcap (
        timestamp INTEGER NOT NULL,
        caplen INTEGER NOT NULL,
        length INTEGER NOT NULL,
        name TEXT NOT NULL,
        interface TEXT,
        filter TEXT
    )
"#;

const CREATE_STORE: &str = r#"
    CREATE TABLE IF NOT EXISTS store (
        key TEXT NOT NULL,
        value TEXT,
        id TEXT,
        iv TEXT,
        PRIMARY KEY (key)
    )
"#;

const CREATE_SECRETS: &str = r#"
    CREATE TABLE IF NOT EXISTS secrets (
        id TEXT NOT NULL,
        value TEXT,
        salt TEXT,
        iv TEXT,
        PRIMARY KEY (id)
    )
"#;

/// Comparison operator accepted by the fingerprint query language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeOp {
    Eq,
    Lt,
    Gt,
    Le,
    Ge,
}

impl TimeOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            TimeOp::Eq => "=",
            TimeOp::Lt => "<",
            TimeOp::Gt => ">",
            TimeOp::Le => "<=",
            TimeOp::Ge => ">=",
        }
    }
}

impl FromStr for TimeOp {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "=" => Ok(TimeOp::Eq),
            "<" => Ok(TimeOp::Lt),
            ">" => Ok(TimeOp::Gt),
            "<=" => Ok(TimeOp::Le),
            ">=" => Ok(TimeOp::Ge),
            _ => Err(()),
        }
    }
}

/// One fingerprint log entry.
#[derive(Debug, Clone)]
pub struct FingerprintRow {
    pub mac: String,
    pub protocol: String,
    pub fingerprint: String,
    pub timestamp: i64,
    pub query: String,
}

impl FingerprintRow {
    /// CSV row in the reply format of `QUERY_FINGERPRINT`.
    pub fn to_csv(&self) -> String {
        format!(
            "{},{},{},{},{}",
            self.mac, self.protocol, self.fingerprint, self.timestamp, self.query
        )
    }
}

/// Encrypted key/value record as stored at rest.
#[derive(Debug, Clone)]
pub struct StoreRow {
    pub key: String,
    pub value: String,
    pub id: String,
    pub iv: String,
}

/// Key material record as stored at rest.
#[derive(Debug, Clone)]
pub struct SecretsRow {
    pub id: String,
    pub value: String,
    pub salt: String,
    pub iv: String,
}

/// Database handle (single serialized connection)
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) the supervisor database file.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database {:?}", path.as_ref()))?;

        let db = Self { pool };
        db.create_tables().await?;

        info!("Opened database {:?}", path.as_ref());
        Ok(db)
    }

    /// In-memory database for tests and dry runs.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.create_tables().await?;
        Ok(db)
    }

    async fn create_tables(&self) -> Result<()> {
        for sql in [
            CREATE_MACCONN,
            CREATE_FINGERPRINT,
            CREATE_PCAP,
            CREATE_STORE,
            CREATE_SECRETS,
        ] {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .context("Failed to create table")?;
        }
        Ok(())
    }

    /// Upsert a device record. `psk_cipher` is the at-rest form produced by
    /// the credential store (empty when no PSK or no master secret).
    pub async fn save_mac_conn(&self, conn: &MacConn, psk_cipher: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO macconn (mac, allow, vlan_id, nat, ip, ifname, psk_cipher, label, join_ts, id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT (mac) DO UPDATE SET
                allow = excluded.allow,
                vlan_id = excluded.vlan_id,
                nat = excluded.nat,
                ip = excluded.ip,
                ifname = excluded.ifname,
                psk_cipher = excluded.psk_cipher,
                label = excluded.label,
                join_ts = excluded.join_ts,
                id = excluded.id
            "#,
        )
        .bind(conn.mac.to_string())
        .bind(conn.allow_connection)
        .bind(conn.vlan_id as i64)
        .bind(conn.nat)
        .bind(conn.ip_addr.map(|ip| ip.to_string()))
        .bind(&conn.ifname)
        .bind(psk_cipher)
        .bind(&conn.label)
        .bind(conn.join_timestamp)
        .bind(&conn.key_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to upsert macconn {}", conn.mac))?;

        debug!("Upserted macconn {}", conn.mac);
        Ok(())
    }

    /// Reload all persisted device records. PSKs are not restored here; the
    /// credential store resolves them by key id.
    pub async fn load_mac_conns(&self) -> Result<Vec<MacConn>> {
        let rows = sqlx::query(
            "SELECT mac, allow, vlan_id, nat, ip, ifname, label, join_ts, id FROM macconn",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to load macconn table")?;

        let mut conns = Vec::with_capacity(rows.len());
        for row in rows {
            let mac_str: String = row.get("mac");
            let mac: MacAddr = match mac_str.parse() {
                Ok(mac) => mac,
                Err(_) => {
                    debug!("Skipping malformed macconn row mac={}", mac_str);
                    continue;
                }
            };
            let ip: Option<String> = row.get("ip");
            conns.push(MacConn {
                mac,
                allow_connection: row.get("allow"),
                vlan_id: row.get::<i64, _>("vlan_id") as u16,
                nat: row.get("nat"),
                ip_addr: ip.and_then(|s| s.parse::<Ipv4Addr>().ok()),
                ifname: row.get::<Option<String>, _>("ifname").unwrap_or_default(),
                psk: Vec::new(),
                label: row.get::<Option<String>, _>("label").unwrap_or_default(),
                join_timestamp: row.get("join_ts"),
                key_id: row.get("id"),
            });
        }
        Ok(conns)
    }

    /// Append one fingerprint log entry.
    pub async fn save_fingerprint(&self, row: &FingerprintRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO fingerprint (mac, protocol, fingerprint, timestamp, query) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&row.mac)
        .bind(&row.protocol)
        .bind(&row.fingerprint)
        .bind(row.timestamp)
        .bind(&row.query)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to insert fingerprint for {}", row.mac))?;

        Ok(())
    }

    /// Fingerprint query: rows for `mac` whose timestamp satisfies
    /// `timestamp <op> bound`, optionally restricted to one protocol
    /// (`None` is the wildcard).
    pub async fn query_fingerprints(
        &self,
        mac: &str,
        op: TimeOp,
        timestamp: i64,
        protocol: Option<&str>,
    ) -> Result<Vec<FingerprintRow>> {
        // The operator is a closed enum, never caller text.
        let sql = match protocol {
            Some(_) => format!(
                "SELECT mac, protocol, fingerprint, timestamp, query FROM fingerprint \
                 WHERE mac = ?1 AND timestamp {} ?2 AND protocol = ?3 ORDER BY timestamp",
                op.as_sql()
            ),
            None => format!(
                "SELECT mac, protocol, fingerprint, timestamp, query FROM fingerprint \
                 WHERE mac = ?1 AND timestamp {} ?2 ORDER BY timestamp",
                op.as_sql()
            ),
        };

        let mut query = sqlx::query(&sql).bind(mac).bind(timestamp);
        if let Some(protocol) = protocol {
            query = query.bind(protocol);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .context("Fingerprint query failed")?;

        Ok(rows
            .into_iter()
            .map(|row| FingerprintRow {
                mac: row.get("mac"),
                protocol: row.get::<Option<String>, _>("protocol").unwrap_or_default(),
                fingerprint: row
                    .get::<Option<String>, _>("fingerprint")
                    .unwrap_or_default(),
                timestamp: row.get("timestamp"),
                query: row.get::<Option<String>, _>("query").unwrap_or_default(),
            })
            .collect())
    }

    pub async fn save_store_row(&self, row: &StoreRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO store (key, value, id, iv) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT (key) DO UPDATE SET value = excluded.value, id = excluded.id, iv = excluded.iv",
        )
        .bind(&row.key)
        .bind(&row.value)
        .bind(&row.id)
        .bind(&row.iv)
        .execute(&self.pool)
        .await
        .context("Failed to upsert store row")?;
        Ok(())
    }

    pub async fn get_store_row(&self, key: &str) -> Result<Option<StoreRow>> {
        let row = sqlx::query("SELECT value, id, iv FROM store WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context("Store lookup failed")?;

        Ok(row.map(|r| StoreRow {
            key: key.to_string(),
            value: r.get::<Option<String>, _>("value").unwrap_or_default(),
            id: r.get::<Option<String>, _>("id").unwrap_or_default(),
            iv: r.get::<Option<String>, _>("iv").unwrap_or_default(),
        }))
    }

    pub async fn save_secrets_row(&self, row: &SecretsRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO secrets (id, value, salt, iv) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT (id) DO UPDATE SET value = excluded.value, salt = excluded.salt, iv = excluded.iv",
        )
        .bind(&row.id)
        .bind(&row.value)
        .bind(&row.salt)
        .bind(&row.iv)
        .execute(&self.pool)
        .await
        .context("Failed to upsert secrets row")?;
        Ok(())
    }

    pub async fn get_secrets_row(&self, id: &str) -> Result<Option<SecretsRow>> {
        let row = sqlx::query("SELECT value, salt, iv FROM secrets WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Secrets lookup failed")?;

        Ok(row.map(|r| SecretsRow {
            id: id.to_string(),
            value: r.get::<Option<String>, _>("value").unwrap_or_default(),
            salt: r.get::<Option<String>, _>("salt").unwrap_or_default(),
            iv: r.get::<Option<String>, _>("iv").unwrap_or_default(),
        }))
    }
}
