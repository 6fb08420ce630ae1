//! PostgreSQL adapter.
//!
//! The schema's stored functions do the upserts; this side only binds
//! parameters. The pool connects lazily so a consumer can start while the
//! database is down and wait on the health gate instead.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::debug;

use super::{IntensityStore, Save};
use crate::config::DatabaseConfig;
use crate::error::StoreError;
use crate::health::Probe;
use crate::msg::{HeartBeat, Intensity, Quake};

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_lazy(&config.url)?;

        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl Probe for PgStore {
    async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl Save<Quake> for PgStore {
    async fn save(&self, q: &Quake) -> Result<(), StoreError> {
        sqlx::query(
            "SELECT qrt.add_event($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(&q.public_id)
        .bind(&q.agency_id)
        .bind(q.latitude)
        .bind(q.longitude)
        .bind(q.time)
        .bind(q.modification_time)
        .bind(q.depth)
        .bind(q.used_phase_count)
        .bind(q.magnitude)
        .bind(&q.magnitude_type)
        .bind(q.status())
        .bind(&q.kind)
        .execute(&self.pool)
        .await?;

        debug!(public_id = %q.public_id, "quake_saved");
        Ok(())
    }
}

#[async_trait]
impl Save<HeartBeat> for PgStore {
    /// Replace the service's state-of-health row.
    async fn save(&self, h: &HeartBeat) -> Result<(), StoreError> {
        // Rolled back on drop if either statement fails.
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM haz.soh WHERE serverID = $1")
            .bind(&h.service_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT INTO haz.soh(serverID, timeReceived) VALUES($1, $2)")
            .bind(&h.service_id)
            .bind(h.sent_time)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl Save<Intensity> for PgStore {
    async fn save(&self, i: &Intensity) -> Result<(), StoreError> {
        if i.is_measured() {
            sqlx::query("SELECT impact.add_intensity_measured($1, $2, $3, $4, $5)")
                .bind(&i.source)
                .bind(i.longitude)
                .bind(i.latitude)
                .bind(i.time)
                .bind(i.mmi)
                .execute(&self.pool)
                .await?;
        } else if i.is_reported() {
            sqlx::query("SELECT impact.add_intensity_reported($1, $2, $3, $4, $5, $6)")
                .bind(&i.source)
                .bind(i.longitude)
                .bind(i.latitude)
                .bind(i.time)
                .bind(i.mmi)
                .bind(&i.comment)
                .execute(&self.pool)
                .await?;
        } else {
            return Err(StoreError::Quality(i.quality.clone()));
        }

        Ok(())
    }
}

#[async_trait]
impl IntensityStore for PgStore {
    async fn expire_measured(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM impact.intensity_measured WHERE time < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> DatabaseConfig {
        DatabaseConfig {
            url: url.to_string(),
            max_connections: 1,
        }
    }

    #[tokio::test]
    async fn test_rejects_bad_url() {
        assert!(matches!(
            PgStore::new(&config("not a url")),
            Err(StoreError::Database(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_quality_never_reaches_the_database() {
        let store = PgStore::new(&config("postgres://localhost:1/haz")).unwrap();
        let intensity = crate::msg::intensity::tests::intensity("ios.abc", "felt", Utc::now());

        assert!(matches!(
            store.save(&intensity).await,
            Err(StoreError::Quality(q)) if q == "felt"
        ));
    }
}
