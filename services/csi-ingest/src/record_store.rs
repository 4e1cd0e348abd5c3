use crate::config::DatabaseConfig;
use crate::metadata::MetadataRecord;
use crate::store::RecordStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use tracing::{debug, info, instrument};

/// Bind parameters used per inserted row
const BINDS_PER_ROW: usize = 16;

/// PostgreSQL allows at most 65535 bind parameters per statement
const MAX_ROWS_PER_INSERT: usize = u16::MAX as usize / BINDS_PER_ROW;

/// Metadata store for CSI messages in PostgreSQL
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    /// Create a new record store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    /// Insert the whole batch in one transaction
    #[instrument(skip(self, records), fields(record_count = records.len()))]
    async fn put_batch(&self, records: &[MetadataRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        for chunk in records.chunks(MAX_ROWS_PER_INSERT) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO csi_metadata (
                    device_name, timestamp_ms, mac_address, offset_in_file,
                    message_size, message_id, access_point, channel_number,
                    matrix_rows, matrix_columns, bandwidth, spatial_channels,
                    rssi, fc, sequence_number, location, created_at
                ) ",
            );

            let mut missing_location = None;
            builder.push_values(chunk, |mut row, record| {
                if record.location.is_none() {
                    missing_location = Some(record.message_id);
                }
                row.push_bind(&record.device_name)
                    .push_bind(record.timestamp_ms)
                    .push_bind(&record.mac_address)
                    .push_bind(record.offset_in_file)
                    .push_bind(record.message_size)
                    .push_bind(record.message_id)
                    .push_bind(record.access_point)
                    .push_bind(record.channel_number)
                    .push_bind(record.matrix_rows)
                    .push_bind(record.matrix_columns)
                    .push_bind(record.bandwidth)
                    .push_bind(record.spatial_channels)
                    .push_bind(record.rssi)
                    .push_bind(record.fc)
                    .push_bind(record.sequence_number)
                    .push_bind(record.location.as_deref().unwrap_or_default())
                    .push("NOW()");
            });

            if let Some(message_id) = missing_location {
                anyhow::bail!("Record for message {} has no storage location", message_id);
            }

            builder
                .build()
                .execute(&mut *tx)
                .await
                .context("Failed to insert CSI metadata")?;
        }

        tx.commit().await.context("Failed to commit transaction")?;

        debug!(record_count = records.len(), "Metadata batch written");
        metrics::counter!("ingest.records.written").increment(records.len() as u64);

        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("PostgreSQL is not reachable")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_chunk_fits_bind_limit() {
        assert!(MAX_ROWS_PER_INSERT * BINDS_PER_ROW <= u16::MAX as usize);
        assert!(MAX_ROWS_PER_INSERT >= 1000);
    }
}
