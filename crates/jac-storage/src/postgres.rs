use async_trait::async_trait;
use jac_core::{ConsolidatedRecord, MatchingKey};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::{ConsolidatedStore, StoreError, UpsertOutcome};

/// Postgres-backed store. The full record lives in a JSONB column; sale date,
/// court, confidence and pending count are lifted out for indexing.
#[derive(Debug, Clone)]
pub struct PgConsolidatedStore {
    pool: PgPool,
}

impl PgConsolidatedStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS consolidated_records (
                id                UUID PRIMARY KEY,
                matching_key      TEXT NOT NULL UNIQUE,
                sale_date         DATE,
                court             TEXT,
                confidence_score  DOUBLE PRECISION NOT NULL,
                pending_count     INTEGER NOT NULL,
                record            JSONB NOT NULL,
                last_consolidated TIMESTAMPTZ NOT NULL,
                revision          BIGINT NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "ALTER TABLE consolidated_records \
             ADD COLUMN IF NOT EXISTS revision BIGINT NOT NULL DEFAULT 0",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_consolidated_sale_date \
             ON consolidated_records (sale_date)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn decode_rows(
        rows: Vec<sqlx::postgres::PgRow>,
    ) -> Result<Vec<ConsolidatedRecord>, StoreError> {
        rows.into_iter()
            .map(|row| -> Result<ConsolidatedRecord, StoreError> {
                let Json(record): Json<ConsolidatedRecord> = row.try_get("record")?;
                Ok(record)
            })
            .collect()
    }
}

fn db_revision(revision: u64) -> i64 {
    i64::try_from(revision).unwrap_or(i64::MAX)
}

fn pending_count(record: &ConsolidatedRecord) -> i32 {
    i32::try_from(record.pending_validation.len()).unwrap_or(i32::MAX)
}

#[async_trait]
impl ConsolidatedStore for PgConsolidatedStore {
    async fn upsert_consolidated(&self, record: &ConsolidatedRecord) -> Result<Uuid, StoreError> {
        let mut first = record.clone();
        first.revision = 1;
        let row = sqlx::query(
            r#"
            INSERT INTO consolidated_records
                (id, matching_key, sale_date, court, confidence_score,
                 pending_count, record, last_consolidated, revision)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 1)
            ON CONFLICT (matching_key) DO UPDATE
               SET sale_date = EXCLUDED.sale_date,
                   court = EXCLUDED.court,
                   confidence_score = EXCLUDED.confidence_score,
                   pending_count = EXCLUDED.pending_count,
                   record = jsonb_set(
                       jsonb_set(EXCLUDED.record, '{id}', to_jsonb(consolidated_records.id::text)),
                       '{revision}',
                       to_jsonb(consolidated_records.revision + 1)
                   ),
                   last_consolidated = EXCLUDED.last_consolidated,
                   revision = consolidated_records.revision + 1
            RETURNING id
            "#,
        )
        .bind(first.id)
        .bind(first.matching_key.as_str())
        .bind(first.sale_date)
        .bind(first.court.as_deref())
        .bind(first.confidence_score)
        .bind(pending_count(&first))
        .bind(Json(&first))
        .bind(first.last_consolidated)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<Uuid, _>("id")?)
    }

    async fn upsert_if_current(
        &self,
        record: &ConsolidatedRecord,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut next = record.clone();
        next.revision = record.revision + 1;

        let row = if record.revision == 0 {
            sqlx::query(
                r#"
                INSERT INTO consolidated_records
                    (id, matching_key, sale_date, court, confidence_score,
                     pending_count, record, last_consolidated, revision)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 1)
                ON CONFLICT (matching_key) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(next.id)
            .bind(next.matching_key.as_str())
            .bind(next.sale_date)
            .bind(next.court.as_deref())
            .bind(next.confidence_score)
            .bind(pending_count(&next))
            .bind(Json(&next))
            .bind(next.last_consolidated)
            .fetch_optional(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE consolidated_records
                   SET sale_date = $2,
                       court = $3,
                       confidence_score = $4,
                       pending_count = $5,
                       record = jsonb_set($6, '{id}', to_jsonb(id::text)),
                       last_consolidated = $7,
                       revision = $8 + 1
                 WHERE matching_key = $1
                   AND revision = $8
                RETURNING id
                "#,
            )
            .bind(next.matching_key.as_str())
            .bind(next.sale_date)
            .bind(next.court.as_deref())
            .bind(next.confidence_score)
            .bind(pending_count(&next))
            .bind(Json(&next))
            .bind(next.last_consolidated)
            .bind(db_revision(record.revision))
            .fetch_optional(&self.pool)
            .await?
        };

        match row {
            Some(row) => Ok(UpsertOutcome::Written {
                id: row.try_get::<Uuid, _>("id")?,
                revision: next.revision,
            }),
            None => Ok(UpsertOutcome::Stale),
        }
    }

    async fn get_by_key(
        &self,
        key: &MatchingKey,
    ) -> Result<Option<ConsolidatedRecord>, StoreError> {
        let rows = sqlx::query("SELECT record FROM consolidated_records WHERE matching_key = $1")
            .bind(key.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(Self::decode_rows(rows)?.into_iter().next())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<ConsolidatedRecord>, StoreError> {
        let rows = sqlx::query("SELECT record FROM consolidated_records WHERE id = $1")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        Ok(Self::decode_rows(rows)?.into_iter().next())
    }

    async fn list_pending_conflicts(&self) -> Result<Vec<ConsolidatedRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT record
              FROM consolidated_records
             WHERE pending_count > 0
             ORDER BY sale_date NULLS LAST, matching_key
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Self::decode_rows(rows)
    }

    async fn list_all(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ConsolidatedRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT record
              FROM consolidated_records
             ORDER BY sale_date NULLS LAST, matching_key
             LIMIT $1 OFFSET $2
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Self::decode_rows(rows)
    }
}
