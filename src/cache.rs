//! Company cache and refresh manager.
//!
//! Owns the `CompanyRecord` lifecycle: decides between cache reuse and a live
//! fetch, persists resolved records and runs the background batch refresh.

use crate::aggregator::{CompanySnapshot, DataSourceAggregator};
use crate::cache_validator::{is_record_valid, payload_checksum};
use crate::config::RefreshPolicy;
use crate::errors::AppError;
use crate::models::{CompanyRecord, RefreshStrategy, SearchLogEntry, SearchType};
use crate::providers::CompanyQuery;
use crate::scorer::{self, QualitySignals};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use moka::future::Cache;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Persistence for company records.
///
/// `upsert` is idempotent per `cache_key` and keeps the original `id` and
/// `created_at`. Concurrent writers are last-write-wins.
#[async_trait]
pub trait CompanyStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CompanyRecord>, AppError>;

    async fn upsert(&self, record: &CompanyRecord) -> Result<(), AppError>;

    /// Flags a record `expired`. Returns false when the key is unknown.
    async fn mark_stale(&self, key: &str) -> Result<bool, AppError>;

    async fn list_by_strategy(
        &self,
        strategy: RefreshStrategy,
        limit: usize,
    ) -> Result<Vec<CompanyRecord>, AppError>;

    /// Records whose `next_refresh_at` is at or before `before`, oldest first.
    async fn list_due(&self, before: DateTime<Utc>, limit: usize)
        -> Result<Vec<CompanyRecord>, AppError>;

    /// Records with `fetch_count > min_fetches` fetched before `fetched_before`.
    async fn list_high_traffic(
        &self,
        min_fetches: i64,
        fetched_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CompanyRecord>, AppError>;

    /// Appends one entry to the search history.
    async fn log_search(&self, entry: &SearchLogEntry) -> Result<(), AppError>;
}

/// In-process store used by tests and when no database is configured.
#[derive(Default)]
pub struct MemoryCompanyStore {
    records: RwLock<HashMap<String, CompanyRecord>>,
    searches: RwLock<Vec<SearchLogEntry>>,
}

impl MemoryCompanyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Search history, oldest first.
    pub async fn search_log(&self) -> Vec<SearchLogEntry> {
        self.searches.read().await.clone()
    }

    async fn filtered<F>(&self, limit: usize, keep: F, order_by: fn(&CompanyRecord) -> DateTime<Utc>) -> Vec<CompanyRecord>
    where
        F: Fn(&CompanyRecord) -> bool,
    {
        let records = self.records.read().await;
        let mut matching: Vec<CompanyRecord> = records.values().filter(|r| keep(r)).cloned().collect();
        matching.sort_by(|a, b| order_by(a).cmp(&order_by(b)).then_with(|| a.cache_key.cmp(&b.cache_key)));
        matching.truncate(limit);
        matching
    }
}

#[async_trait]
impl CompanyStore for MemoryCompanyStore {
    async fn get(&self, key: &str) -> Result<Option<CompanyRecord>, AppError> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn upsert(&self, record: &CompanyRecord) -> Result<(), AppError> {
        let mut records = self.records.write().await;
        let mut stored = record.clone();
        if let Some(existing) = records.get(&record.cache_key) {
            stored.id = existing.id;
            stored.created_at = existing.created_at;
        }
        records.insert(record.cache_key.clone(), stored);
        Ok(())
    }

    async fn mark_stale(&self, key: &str) -> Result<bool, AppError> {
        let mut records = self.records.write().await;
        match records.get_mut(key) {
            Some(record) => {
                record.refresh_strategy = RefreshStrategy::Expired;
                record.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_by_strategy(
        &self,
        strategy: RefreshStrategy,
        limit: usize,
    ) -> Result<Vec<CompanyRecord>, AppError> {
        Ok(self
            .filtered(limit, |r| r.refresh_strategy == strategy, |r| r.updated_at)
            .await)
    }

    async fn list_due(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CompanyRecord>, AppError> {
        Ok(self
            .filtered(limit, |r| r.next_refresh_at <= before, |r| r.next_refresh_at)
            .await)
    }

    async fn list_high_traffic(
        &self,
        min_fetches: i64,
        fetched_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CompanyRecord>, AppError> {
        Ok(self
            .filtered(
                limit,
                |r| r.fetch_count > min_fetches && r.fetched_at < fetched_before,
                |r| r.fetched_at,
            )
            .await)
    }

    async fn log_search(&self, entry: &SearchLogEntry) -> Result<(), AppError> {
        self.searches.write().await.push(entry.clone());
        Ok(())
    }
}

/// Result of a cache-wrapped company resolution.
#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub snapshot: CompanySnapshot,
    pub record: Option<CompanyRecord>,
    pub cached: bool,
    pub cache_age_seconds: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshFailure {
    pub key: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRefreshReport {
    pub selected: usize,
    pub refreshed: usize,
    pub failures: Vec<RefreshFailure>,
    pub duration_ms: u64,
}

pub struct CacheManager {
    store: Arc<dyn CompanyStore>,
    aggregator: Arc<DataSourceAggregator>,
    hot: Cache<String, CompanyRecord>,
    policy: RefreshPolicy,
}

impl CacheManager {
    pub fn new(
        store: Arc<dyn CompanyStore>,
        aggregator: Arc<DataSourceAggregator>,
        policy: RefreshPolicy,
    ) -> Self {
        let hot = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(Duration::from_secs(policy.hot_cache_ttl_secs))
            .build();
        Self {
            store,
            aggregator,
            hot,
            policy,
        }
    }

    pub fn policy(&self) -> &RefreshPolicy {
        &self.policy
    }

    pub fn aggregator(&self) -> &DataSourceAggregator {
        &self.aggregator
    }

    /// Reads a record through the hot layer. Records failing checksum
    /// validation are treated as absent.
    pub async fn get(&self, key: &str) -> Result<Option<CompanyRecord>, AppError> {
        if let Some(record) = self.hot.get(key).await {
            return Ok(Some(record));
        }
        match self.store.get(key).await? {
            Some(record) if is_record_valid(&record) => {
                self.hot.insert(key.to_string(), record.clone()).await;
                Ok(Some(record))
            }
            Some(_) => Ok(None),
            None => Ok(None),
        }
    }

    async fn save(&self, record: &CompanyRecord) {
        self.hot.insert(record.cache_key.clone(), record.clone()).await;
        if let Err(e) = self.store.upsert(record).await {
            tracing::warn!("Failed to persist company record {}: {}", record.cache_key, e);
        }
    }

    /// Flags a record for refresh. Returns false when the key is unknown.
    pub async fn mark_stale(&self, key: &str) -> Result<bool, AppError> {
        self.hot.invalidate(key).await;
        let found = self.store.mark_stale(key).await?;
        if found {
            tracing::info!("Company record {} marked stale", key);
        }
        Ok(found)
    }

    fn build_record(
        &self,
        key: &str,
        snapshot: &CompanySnapshot,
        existing: Option<&CompanyRecord>,
        now: DateTime<Utc>,
        fetch_count: i64,
    ) -> CompanyRecord {
        let today = now.date_naive();
        let quality_score = scorer::score(&QualitySignals::from_snapshot(snapshot, today));
        let risk_flags = scorer::risk_flags(snapshot.alerts(today, &[]));
        let payloads = snapshot.payloads();

        CompanyRecord {
            id: existing.map(|r| r.id).unwrap_or_else(Uuid::new_v4),
            cache_key: key.to_string(),
            siret: snapshot
                .identifier
                .as_ref()
                .and_then(|i| i.siret().map(str::to_string)),
            siren: snapshot.identifier.as_ref().map(|i| i.siren().to_string()),
            company_name: snapshot.company_name(),
            legal_name: snapshot.legal_name(),
            payload_checksum: payload_checksum(&payloads),
            payloads,
            quality_score,
            risk_flags,
            fetched_at: now,
            next_refresh_at: now + self.policy.ttl_for(quality_score),
            fetch_count,
            refresh_strategy: RefreshStrategy::Fresh,
            created_at: existing.map(|r| r.created_at).unwrap_or(now),
            updated_at: now,
        }
    }

    /// Records one more read of a cached record.
    fn touched(&self, record: &CompanyRecord, now: DateTime<Utc>) -> CompanyRecord {
        let mut touched = record.clone();
        touched.fetch_count += 1;
        touched.updated_at = now;
        touched.refresh_strategy = match record.refresh_strategy {
            RefreshStrategy::Expired => RefreshStrategy::Expired,
            _ if touched.fetch_count > self.policy.high_traffic_min_fetches => {
                RefreshStrategy::HighTraffic
            }
            _ => RefreshStrategy::Scheduled,
        };
        touched
    }

    /// Identity-keyed fan-out, retried on the premium registry when the free
    /// sources score below `premium_upgrade_below`.
    async fn fetch_live(&self, query: &CompanyQuery) -> CompanySnapshot {
        let mut snapshot = self.aggregator.fetch_company(query).await;
        if !self.aggregator.has_premium_registry() || snapshot.identifier.is_none() {
            return snapshot;
        }
        let today = Utc::now().date_naive();
        let score = scorer::score(&QualitySignals::from_snapshot(&snapshot, today));
        if score < self.policy.premium_upgrade_below {
            tracing::info!(
                "Free registry data scores {} (< {}), upgrading to premium registry",
                score,
                self.policy.premium_upgrade_below
            );
            self.aggregator.upgrade_registry(&mut snapshot).await;
        }
        snapshot
    }

    /// Cache-wrapped company resolution.
    ///
    /// An unexpired record is served without any provider call unless
    /// `force_refresh` is set. Otherwise the providers are queried and the
    /// record upserted. When they return nothing, a stale record is served if
    /// one exists. Every call is appended to the search history.
    pub async fn resolve(&self, query: &CompanyQuery, force_refresh: bool) -> CacheLookup {
        let started = Instant::now();
        let lookup = self.lookup(query, force_refresh).await;
        let entry = search_log_entry(query, &lookup, started.elapsed());
        if let Err(e) = self.store.log_search(&entry).await {
            tracing::warn!("Failed to log company search: {}", e);
        }
        lookup
    }

    async fn lookup(&self, query: &CompanyQuery, force_refresh: bool) -> CacheLookup {
        let Some(key) = query.cache_key() else {
            return CacheLookup {
                snapshot: self.fetch_live(query).await,
                record: None,
                cached: false,
                cache_age_seconds: None,
            };
        };
        let now = Utc::now();

        let existing = match self.get(&key).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Cache read failed for {}: {}", key, e);
                None
            }
        };

        if let Some(record) = &existing {
            if !force_refresh && !record.is_expired(now) {
                tracing::debug!("Cache hit for {}", key);
                let touched = self.touched(record, now);
                self.save(&touched).await;
                return CacheLookup {
                    snapshot: CompanySnapshot::from_record(&touched),
                    cache_age_seconds: Some(touched.age_seconds(now)),
                    record: Some(touched),
                    cached: true,
                };
            }
            if record.is_expired(now) && record.refresh_strategy != RefreshStrategy::Expired {
                if let Err(e) = self.mark_stale(&key).await {
                    tracing::warn!("Failed to mark {} stale: {}", key, e);
                }
            }
        }

        tracing::info!("Fetching live company data for {}", key);
        let snapshot = self.fetch_live(query).await;

        if snapshot.has_identity_data() {
            let fetch_count = existing.as_ref().map(|r| r.fetch_count + 1).unwrap_or(1);
            let record = self.build_record(&key, &snapshot, existing.as_ref(), now, fetch_count);
            self.save(&record).await;
            return CacheLookup {
                snapshot,
                record: Some(record),
                cached: false,
                cache_age_seconds: None,
            };
        }

        if let Some(stale) = existing {
            let mut touched = self.touched(&stale, now);
            touched.refresh_strategy = RefreshStrategy::Expired;
            self.save(&touched).await;

            let age = touched.age_seconds(now);
            let mut served = CompanySnapshot::from_record(&touched);
            served.notes.push(format!(
                "WARNING: serving stale record ({} days old), live providers returned no data",
                age / 86_400
            ));
            served.notes.extend(snapshot.ledger.alerts());
            return CacheLookup {
                snapshot: served,
                record: Some(touched),
                cached: true,
                cache_age_seconds: Some(age),
            };
        }

        CacheLookup {
            snapshot,
            record: None,
            cached: false,
            cache_age_seconds: None,
        }
    }

    /// Re-fetches one record, keeping its read count.
    pub async fn refresh_record(&self, record: &CompanyRecord) -> Result<CompanyRecord, AppError> {
        let query = CompanyQuery::new(record.identifier(), record.company_name.clone());
        let snapshot = self.fetch_live(&query).await;
        if !snapshot.has_identity_data() {
            let alerts = snapshot.ledger.alerts();
            return Err(AppError::ExternalApiError(format!(
                "no provider returned data for {}{}",
                record.cache_key,
                if alerts.is_empty() {
                    String::new()
                } else {
                    format!(": {}", alerts.join("; "))
                }
            )));
        }

        let refreshed = self.build_record(
            &record.cache_key,
            &snapshot,
            Some(record),
            Utc::now(),
            record.fetch_count,
        );
        self.store.upsert(&refreshed).await?;
        self.hot
            .insert(refreshed.cache_key.clone(), refreshed.clone())
            .await;
        Ok(refreshed)
    }

    /// Greedy selection bounded by `max`: expired records first, then
    /// records past their refresh date, then high-traffic records.
    pub async fn select_refresh_candidates(
        &self,
        now: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<CompanyRecord>, AppError> {
        let mut selected: Vec<CompanyRecord> = Vec::new();
        if max == 0 {
            return Ok(selected);
        }
        let mut seen: HashSet<String> = HashSet::new();

        let mut take = |tier: Vec<CompanyRecord>, selected: &mut Vec<CompanyRecord>| {
            for record in tier {
                if selected.len() >= max {
                    break;
                }
                if seen.insert(record.cache_key.clone()) {
                    selected.push(record);
                }
            }
        };

        let expired = self
            .store
            .list_by_strategy(RefreshStrategy::Expired, max)
            .await?;
        take(expired, &mut selected);

        if selected.len() < max {
            let due = self.store.list_due(now, max + selected.len()).await?;
            take(due, &mut selected);
        }

        if selected.len() < max {
            let fetched_before = now - ChronoDuration::days(self.policy.high_traffic_age_days);
            let busy = self
                .store
                .list_high_traffic(
                    self.policy.high_traffic_min_fetches,
                    fetched_before,
                    max + selected.len(),
                )
                .await?;
            take(busy, &mut selected);
        }

        Ok(selected)
    }

    /// Sequential refresh of up to `max` records with a fixed delay between
    /// items. Per-item failures are reported, never fatal.
    pub async fn refresh_batch(&self, max: usize) -> Result<BatchRefreshReport, AppError> {
        let started = Instant::now();
        let candidates = self.select_refresh_candidates(Utc::now(), max).await?;
        tracing::info!("🔄 Batch refresh: {} candidates (max {})", candidates.len(), max);

        let mut report = BatchRefreshReport {
            selected: candidates.len(),
            ..Default::default()
        };

        for (i, record) in candidates.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.policy.batch_delay()).await;
            }
            match self.refresh_record(record).await {
                Ok(refreshed) => {
                    report.refreshed += 1;
                    tracing::info!(
                        "✅ Refreshed {} ({}/{}), quality {}",
                        refreshed.cache_key,
                        i + 1,
                        candidates.len(),
                        refreshed.quality_score
                    );
                }
                Err(e) => {
                    tracing::warn!("❌ Refresh failed for {}: {}", record.cache_key, e);
                    report.failures.push(RefreshFailure {
                        key: record.cache_key.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            "Batch refresh done: {} refreshed, {} failed in {} ms",
            report.refreshed,
            report.failures.len(),
            report.duration_ms
        );
        Ok(report)
    }
}

fn search_log_entry(query: &CompanyQuery, lookup: &CacheLookup, elapsed: Duration) -> SearchLogEntry {
    let identifier = lookup.snapshot.identifier.as_ref().or(query.identifier.as_ref());
    let search_type = match &query.identifier {
        Some(id) if id.siret().is_some() => SearchType::Siret,
        Some(_) => SearchType::Siren,
        None => SearchType::Name,
    };
    let api_calls = if lookup.cached {
        Vec::new()
    } else {
        lookup
            .snapshot
            .ledger
            .called()
            .into_iter()
            .map(|kind| kind.as_str().to_string())
            .collect()
    };
    let failures: Vec<String> = lookup
        .snapshot
        .ledger
        .alerts()
        .into_iter()
        .chain(lookup.snapshot.notes.iter().cloned())
        .filter(|a| a.starts_with("WARNING"))
        .collect();

    SearchLogEntry {
        cache_key: query.cache_key(),
        siret: identifier.and_then(|i| i.siret().map(str::to_string)),
        siren: identifier.map(|i| i.siren().to_string()),
        search_query: query.company_name.clone(),
        search_type,
        found: lookup.record.is_some() || lookup.snapshot.has_identity_data(),
        cache_hit: lookup.cached,
        api_calls,
        response_time_ms: elapsed.as_millis() as u64,
        error_message: Some(failures.join("; ")).filter(|m| !m.is_empty()),
        searched_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn record(key: &str, strategy: RefreshStrategy, fetch_count: i64, fetched_days_ago: i64, due_in_days: i64) -> CompanyRecord {
        let now = Utc::now();
        let payloads = BTreeMap::new();
        CompanyRecord {
            id: Uuid::new_v4(),
            cache_key: key.to_string(),
            siret: None,
            siren: None,
            company_name: Some(key.to_string()),
            legal_name: None,
            payload_checksum: payload_checksum(&payloads),
            payloads,
            quality_score: 50,
            risk_flags: vec![],
            fetched_at: now - ChronoDuration::days(fetched_days_ago),
            next_refresh_at: now + ChronoDuration::days(due_in_days),
            fetch_count,
            refresh_strategy: strategy,
            created_at: now,
            updated_at: now,
        }
    }

    fn manager(store: Arc<MemoryCompanyStore>) -> CacheManager {
        CacheManager::new(
            store,
            Arc::new(DataSourceAggregator::new(Duration::from_millis(100))),
            RefreshPolicy::default(),
        )
    }

    #[tokio::test]
    async fn test_upsert_keeps_identity() {
        let store = MemoryCompanyStore::new();
        let first = record("a", RefreshStrategy::Fresh, 1, 0, 10);
        store.upsert(&first).await.unwrap();
        let mut second = record("a", RefreshStrategy::Fresh, 2, 0, 10);
        second.id = Uuid::new_v4();
        store.upsert(&second).await.unwrap();

        let stored = store.get("a").await.unwrap().unwrap();
        assert_eq!(stored.id, first.id);
        assert_eq!(stored.fetch_count, 2);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_selection_priority_and_bound() {
        let store = Arc::new(MemoryCompanyStore::new());
        store.upsert(&record("busy", RefreshStrategy::HighTraffic, 11, 40, 50)).await.unwrap();
        store.upsert(&record("due", RefreshStrategy::Scheduled, 1, 10, -1)).await.unwrap();
        store.upsert(&record("flagged", RefreshStrategy::Expired, 1, 1, 30)).await.unwrap();
        store.upsert(&record("quiet", RefreshStrategy::Scheduled, 5, 40, 50)).await.unwrap();

        let cache = manager(store);
        let now = Utc::now();

        let all = cache.select_refresh_candidates(now, 10).await.unwrap();
        let keys: Vec<&str> = all.iter().map(|r| r.cache_key.as_str()).collect();
        assert_eq!(keys, vec!["flagged", "due", "busy"]);

        let two = cache.select_refresh_candidates(now, 2).await.unwrap();
        assert_eq!(two.len(), 2);
        assert_eq!(two[0].cache_key, "flagged");

        assert!(cache.select_refresh_candidates(now, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_and_due_record_selected_once() {
        let store = Arc::new(MemoryCompanyStore::new());
        store.upsert(&record("x", RefreshStrategy::Expired, 20, 60, -5)).await.unwrap();
        let cache = manager(store);
        let selected = cache.select_refresh_candidates(Utc::now(), 5).await.unwrap();
        assert_eq!(selected.len(), 1);
    }

    #[tokio::test]
    async fn test_tampered_record_is_a_miss() {
        let store = Arc::new(MemoryCompanyStore::new());
        let mut tampered = record("t", RefreshStrategy::Fresh, 1, 0, 10);
        tampered.payload_checksum = "0".repeat(64);
        store.upsert(&tampered).await.unwrap();

        let cache = manager(store);
        assert!(cache.get("t").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_stale_unknown_key() {
        let cache = manager(Arc::new(MemoryCompanyStore::new()));
        assert!(!cache.mark_stale("missing").await.unwrap());
    }
}
