//! Packet metadata persistence
//!
//! Appends one row per captured packet to the shared SQLite `pcap` table:
//! `(timestamp, caplen, length, name, interface, filter)`. Rows are
//! flushed in batches inside a transaction.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::debug;

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

/// One metadata row.
#[derive(Debug, Clone)]
pub struct PacketRecord {
    /// Capture time, microseconds since epoch.
    pub timestamp: i64,
    /// Bytes captured (bounded by the snap length).
    pub caplen: u32,
    /// Original wire length.
    pub length: u32,
    /// Per-packet identifier.
    pub name: String,
    pub interface: String,
    pub filter: String,
}

/// Batched writer over the `pcap` table.
pub struct MetaWriter {
    pool: SqlitePool,
}

impl MetaWriter {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open pcap database {:?}", path.as_ref()))?;

        sqlx::query(CREATE_PCAP)
            .execute(&pool)
            .await
            .context("Failed to create pcap table")?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::query(CREATE_PCAP).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Write a batch of rows in one transaction.
    pub async fn write_batch(&self, records: &[PacketRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.context("Failed to begin batch")?;
        for record in records {
            sqlx::query(
                "INSERT INTO pcap (timestamp, caplen, length, name, interface, filter) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(record.timestamp)
            .bind(record.caplen as i64)
            .bind(record.length as i64)
            .bind(&record.name)
            .bind(&record.interface)
            .bind(&record.filter)
            .execute(&mut *tx)
            .await
            .context("Failed to insert pcap row")?;
        }
        tx.commit().await.context("Failed to commit batch")?;

        debug!("Flushed {} pcap rows", records.len());
        Ok(())
    }

    pub async fn row_count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pcap")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ts: i64) -> PacketRecord {
        PacketRecord {
            timestamp: ts,
            caplen: 64,
            length: 128,
            name: format!("{}-0", ts),
            interface: "wlan0.3".to_string(),
            filter: "".to_string(),
        }
    }

    #[tokio::test]
    async fn test_write_batch_and_count() {
        let writer = MetaWriter::open_in_memory().await.unwrap();

        writer.write_batch(&[record(1), record(2), record(3)]).await.unwrap();
        assert_eq!(writer.row_count().await.unwrap(), 3);

        writer.write_batch(&[]).await.unwrap();
        assert_eq!(writer.row_count().await.unwrap(), 3);

        writer.write_batch(&[record(4)]).await.unwrap();
        assert_eq!(writer.row_count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_row_fields_survive() {
        let writer = MetaWriter::open_in_memory().await.unwrap();
        writer
            .write_batch(&[PacketRecord {
                timestamp: 1_700_000_000_000_000,
                caplen: 96,
                length: 1500,
                name: "1700000000000000-7".to_string(),
                interface: "wlan0.7".to_string(),
                filter: "ether host aa:bb:cc:dd:ee:ff".to_string(),
            }])
            .await
            .unwrap();

        let row: (i64, i64, i64, String, String, String) = sqlx::query_as(
            "SELECT timestamp, caplen, length, name, interface, filter FROM pcap",
        )
        .fetch_one(&writer.pool)
        .await
        .unwrap();

        assert_eq!(row.0, 1_700_000_000_000_000);
        assert_eq!(row.1, 96);
        assert_eq!(row.2, 1500);
        assert_eq!(row.3, "1700000000000000-7");
        assert_eq!(row.4, "wlan0.7");
        assert_eq!(row.5, "ether host aa:bb:cc:dd:ee:ff");
    }
}
