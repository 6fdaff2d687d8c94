use crate::cache::CompanyStore;
use crate::errors::AppError;
use crate::models::{CompanyRecord, RefreshStrategy, SearchLogEntry};
use crate::providers::ProviderKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;

const COLUMNS: &str = "id, cache_key, siret, siren, company_name, legal_name, payloads, \
     quality_score, risk_flags, payload_checksum, fetched_at, next_refresh_at, fetch_count, \
     refresh_strategy, created_at, updated_at";

/// Postgres-backed company record store (`company_data_cache` table).
pub struct PgCompanyStore {
    pool: PgPool,
}

impl PgCompanyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the cache table and its refresh indexes if missing.
    pub async fn ensure_schema(&self) -> Result<(), AppError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS company_data_cache (
                id UUID PRIMARY KEY,
                cache_key TEXT NOT NULL UNIQUE,
                siret TEXT,
                siren TEXT,
                company_name TEXT,
                legal_name TEXT,
                payloads JSONB NOT NULL DEFAULT '{}'::jsonb,
                quality_score SMALLINT NOT NULL DEFAULT 0,
                risk_flags JSONB NOT NULL DEFAULT '[]'::jsonb,
                payload_checksum TEXT NOT NULL,
                fetched_at TIMESTAMPTZ NOT NULL,
                next_refresh_at TIMESTAMPTZ NOT NULL,
                fetch_count BIGINT NOT NULL DEFAULT 0,
                refresh_strategy TEXT NOT NULL DEFAULT 'fresh',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_company_data_cache_next_refresh \
             ON company_data_cache (next_refresh_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_company_data_cache_strategy \
             ON company_data_cache (refresh_strategy)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS company_search_history (
                id BIGSERIAL PRIMARY KEY,
                cache_key TEXT,
                siret TEXT,
                siren TEXT,
                search_query TEXT,
                search_type TEXT NOT NULL,
                found BOOLEAN NOT NULL,
                cache_hit BOOLEAN NOT NULL,
                api_calls_made JSONB NOT NULL DEFAULT '[]'::jsonb,
                response_time_ms BIGINT NOT NULL,
                error_message TEXT,
                searched_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        tracing::info!("✓ company_data_cache schema ready");
        Ok(())
    }
}

fn record_from_row(row: &PgRow) -> Result<CompanyRecord, AppError> {
    let payloads: Json<BTreeMap<ProviderKind, Value>> = row.try_get("payloads")?;
    let risk_flags: Json<Vec<String>> = row.try_get("risk_flags")?;
    let quality_score: i16 = row.try_get("quality_score")?;
    let strategy: String = row.try_get("refresh_strategy")?;
    let refresh_strategy = strategy
        .parse::<RefreshStrategy>()
        .map_err(AppError::InternalError)?;

    Ok(CompanyRecord {
        id: row.try_get("id")?,
        cache_key: row.try_get("cache_key")?,
        siret: row.try_get("siret")?,
        siren: row.try_get("siren")?,
        company_name: row.try_get("company_name")?,
        legal_name: row.try_get("legal_name")?,
        payloads: payloads.0,
        quality_score: quality_score.clamp(0, 100) as u8,
        risk_flags: risk_flags.0,
        payload_checksum: row.try_get("payload_checksum")?,
        fetched_at: row.try_get("fetched_at")?,
        next_refresh_at: row.try_get("next_refresh_at")?,
        fetch_count: row.try_get("fetch_count")?,
        refresh_strategy,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn records_from_rows(rows: &[PgRow]) -> Result<Vec<CompanyRecord>, AppError> {
    rows.iter().map(record_from_row).collect()
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl CompanyStore for PgCompanyStore {
    async fn get(&self, key: &str) -> Result<Option<CompanyRecord>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM company_data_cache WHERE cache_key = $1",
            COLUMNS
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn upsert(&self, record: &CompanyRecord) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO company_data_cache (
                id, cache_key, siret, siren, company_name, legal_name, payloads,
                quality_score, risk_flags, payload_checksum, fetched_at, next_refresh_at,
                fetch_count, refresh_strategy, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (cache_key) DO UPDATE SET
                siret = EXCLUDED.siret,
                siren = EXCLUDED.siren,
                company_name = EXCLUDED.company_name,
                legal_name = EXCLUDED.legal_name,
                payloads = EXCLUDED.payloads,
                quality_score = EXCLUDED.quality_score,
                risk_flags = EXCLUDED.risk_flags,
                payload_checksum = EXCLUDED.payload_checksum,
                fetched_at = EXCLUDED.fetched_at,
                next_refresh_at = EXCLUDED.next_refresh_at,
                fetch_count = EXCLUDED.fetch_count,
                refresh_strategy = EXCLUDED.refresh_strategy,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(record.id)
        .bind(&record.cache_key)
        .bind(&record.siret)
        .bind(&record.siren)
        .bind(&record.company_name)
        .bind(&record.legal_name)
        .bind(Json(&record.payloads))
        .bind(i16::from(record.quality_score))
        .bind(Json(&record.risk_flags))
        .bind(&record.payload_checksum)
        .bind(record.fetched_at)
        .bind(record.next_refresh_at)
        .bind(record.fetch_count)
        .bind(record.refresh_strategy.as_str())
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!("Upserted company record {}", record.cache_key);
        Ok(())
    }

    async fn mark_stale(&self, key: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE company_data_cache SET refresh_strategy = $2, updated_at = NOW() \
             WHERE cache_key = $1",
        )
        .bind(key)
        .bind(RefreshStrategy::Expired.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_by_strategy(
        &self,
        strategy: RefreshStrategy,
        limit: usize,
    ) -> Result<Vec<CompanyRecord>, AppError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM company_data_cache WHERE refresh_strategy = $1 \
             ORDER BY updated_at ASC, cache_key ASC LIMIT $2",
            COLUMNS
        ))
        .bind(strategy.as_str())
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        records_from_rows(&rows)
    }

    async fn list_due(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CompanyRecord>, AppError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM company_data_cache WHERE next_refresh_at <= $1 \
             ORDER BY next_refresh_at ASC, cache_key ASC LIMIT $2",
            COLUMNS
        ))
        .bind(before)
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        records_from_rows(&rows)
    }

    async fn list_high_traffic(
        &self,
        min_fetches: i64,
        fetched_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CompanyRecord>, AppError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM company_data_cache WHERE fetch_count > $1 AND fetched_at < $2 \
             ORDER BY fetched_at ASC, cache_key ASC LIMIT $3",
            COLUMNS
        ))
        .bind(min_fetches)
        .bind(fetched_before)
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        records_from_rows(&rows)
    }

    async fn log_search(&self, entry: &SearchLogEntry) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO company_search_history \
             (cache_key, siret, siren, search_query, search_type, found, cache_hit, \
              api_calls_made, response_time_ms, error_message, searched_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(&entry.cache_key)
        .bind(&entry.siret)
        .bind(&entry.siren)
        .bind(&entry.search_query)
        .bind(entry.search_type.as_str())
        .bind(entry.found)
        .bind(entry.cache_hit)
        .bind(Json(&entry.api_calls))
        .bind(i64::try_from(entry.response_time_ms).unwrap_or(i64::MAX))
        .bind(&entry.error_message)
        .bind(entry.searched_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
