//! Postgres-backed opportunity store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use govcon_core::{CanonicalOpportunity, OpportunityFields};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use uuid::Uuid;

use crate::store::{OpportunityStore, StoreError};

const SELECT_COLUMNS: &str = "id, natural_key, source_name, fields, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgOpportunityStore {
    pool: PgPool,
}

impl PgOpportunityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn row_to_record(row: &PgRow) -> Result<CanonicalOpportunity, StoreError> {
    let fields: Json<OpportunityFields> = row.try_get("fields")?;
    Ok(CanonicalOpportunity {
        id: row.try_get::<Uuid, _>("id")?,
        natural_key: row.try_get("natural_key")?,
        source_name: row.try_get("source_name")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        fields: fields.0,
    })
}

#[async_trait]
impl OpportunityStore for PgOpportunityStore {
    async fn find_by_natural_key(
        &self,
        natural_key: &str,
    ) -> Result<Option<CanonicalOpportunity>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM opportunities WHERE natural_key = $1"
        ))
        .bind(natural_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    /// Upserts on the natural-key constraint. When another writer created the
    /// key first, its id is kept and only non-null fields from `record` are
    /// merged over the stored ones.
    async fn save(&self, record: CanonicalOpportunity) -> Result<CanonicalOpportunity, StoreError> {
        let fields = serde_json::to_value(&record.fields)?;
        let row = sqlx::query(&format!(
            "INSERT INTO opportunities (id, natural_key, source_name, fields, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (natural_key) DO UPDATE SET \
               source_name = EXCLUDED.source_name, \
               fields = opportunities.fields || jsonb_strip_nulls(EXCLUDED.fields), \
               updated_at = EXCLUDED.updated_at \
             RETURNING {SELECT_COLUMNS}"
        ))
        .bind(record.id)
        .bind(&record.natural_key)
        .bind(&record.source_name)
        .bind(Json(fields))
        .bind(record.created_at)
        .bind(record.updated_at)
        .fetch_one(&self.pool)
        .await?;

        let stored = row_to_record(&row)?;
        if stored.id != record.id {
            tracing::debug!(
                natural_key = %stored.natural_key,
                kept_id = %stored.id,
                "natural key created concurrently; merged into existing row"
            );
        }
        Ok(stored)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM opportunities")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}
