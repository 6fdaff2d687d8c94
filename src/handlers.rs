use crate::aggregator::DataSourceAggregator;
use crate::ai_client::ClaudeClient;
use crate::cache::{BatchRefreshReport, CacheManager, CompanyStore, MemoryCompanyStore};
use crate::config::Config;
use crate::db::Database;
use crate::db_storage::PgCompanyStore;
use crate::errors::AppError;
use crate::extractor::IdentifierExtractor;
use crate::models::{CompanyRecord, RefreshRequest, ResolveRequest, ResolveResponse};
use crate::reference_data::{
    ReferenceTables, TablePriceReference, TableSubsidyRules, TableTechnicalReferences,
};
use crate::resolution::CompanyResolutionService;
use crate::services::{
    ApiEntrepriseClient, BodaccClient, KnowledgeSearchClient, PappersClient,
    RechercheEntreprisesClient, RgeClient,
};
use crate::siret::BusinessIdentifier;
use crate::synthesizer::ContextSynthesizer;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    /// Extraction, cached aggregation and synthesis.
    pub resolver: Arc<CompanyResolutionService>,
}

impl AppState {
    pub fn new(config: Config, resolver: Arc<CompanyResolutionService>) -> Self {
        Self { config, resolver }
    }

    /// Wires every configured provider, the record store and the text
    /// generator from configuration.
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        let tables = Arc::new(ReferenceTables::from_path(
            config.reference_tables_path.as_deref(),
        )?);

        let store: Arc<dyn CompanyStore> = match config.database_url.as_deref() {
            Some(url) => {
                let db = Database::new(url).await?;
                let store = PgCompanyStore::new(db.pool.clone());
                store.ensure_schema().await?;
                tracing::info!("Database connection pool established");
                Arc::new(store)
            }
            None => Arc::new(MemoryCompanyStore::new()),
        };

        let aggregator = Arc::new(build_aggregator(&config, tables.clone()));
        tracing::info!(
            "Providers configured: {:?}",
            aggregator
                .configured()
                .iter()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
        );

        let cache = Arc::new(CacheManager::new(store, aggregator, config.refresh.clone()));

        let extractor = match ClaudeClient::from_config(&config) {
            Some(client) => {
                tracing::info!("✓ Text generation fallback enabled ({})", config.claude_model);
                IdentifierExtractor::with_generator(Arc::new(client))
            }
            None => IdentifierExtractor::new(),
        };

        let resolver = CompanyResolutionService::new(
            extractor,
            cache,
            tables,
            ContextSynthesizer::new(config.ai_score_weight),
        );

        Ok(Self::new(config, Arc::new(resolver)))
    }

    pub fn cache(&self) -> &CacheManager {
        self.resolver.cache()
    }
}

/// Aggregator over the public registries, the optional keyed providers and
/// the reference tables.
pub fn build_aggregator(config: &Config, tables: Arc<ReferenceTables>) -> DataSourceAggregator {
    let mut aggregator = DataSourceAggregator::new(config.provider_timeout())
        .with_registry(Arc::new(RechercheEntreprisesClient::from_config(config)))
        .with_certification(Arc::new(RgeClient::from_config(config)))
        .with_legal_announcements(Arc::new(BodaccClient::from_config(config)))
        .with_price_reference(Arc::new(TablePriceReference::new(tables.clone())))
        .with_subsidies(Arc::new(TableSubsidyRules::new(tables.clone())));

    if let Some(client) = ApiEntrepriseClient::from_config(config) {
        aggregator = aggregator.with_attestations(Arc::new(client));
    }

    if let Some(client) = PappersClient::from_config(config) {
        aggregator = aggregator.with_premium_registry(Arc::new(client));
    }

    aggregator = match KnowledgeSearchClient::from_config(config) {
        Some(client) => aggregator.with_knowledge(Arc::new(client)),
        None => aggregator.with_knowledge(Arc::new(TableTechnicalReferences::new(tables))),
    };

    aggregator
}

/// Routes behind the rate limiter.
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/v1/company/resolve", post(resolve_company))
        .route("/api/v1/company/refresh", post(refresh_companies))
        .route("/api/v1/company/:key", get(get_company))
        .route("/api/v1/company/:key/stale", post(mark_company_stale))
}

/// Health check endpoint.
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "company-context-api",
            "version": env!("CARGO_PKG_VERSION"),
            "referenceVersion": state.resolver.tables().version,
        })),
    )
}

/// POST /api/v1/company/resolve
///
/// Resolves a company from a document, an identifier or a name and returns
/// its aggregated context.
pub async fn resolve_company(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<ResolveResponse>, AppError> {
    tracing::info!(
        "POST /company/resolve - document: {}, identifier: {:?}, forceRefresh: {}",
        request.document.is_some(),
        request.identifier,
        request.force_refresh
    );
    let response = state.resolver.resolve(request).await?;
    Ok(Json(response))
}

/// Accepts a SIRET, a SIREN or a raw cache key.
fn normalize_key(raw: &str) -> String {
    BusinessIdentifier::parse(raw)
        .map(|id| id.cache_key())
        .unwrap_or_else(|_| raw.trim().to_string())
}

/// GET /api/v1/company/:key
pub async fn get_company(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<CompanyRecord>, AppError> {
    let key = normalize_key(&key);
    match state.cache().get(&key).await? {
        Some(record) => Ok(Json(record)),
        None => Err(AppError::NotFound(format!("No cached record for {}", key))),
    }
}

/// POST /api/v1/company/:key/stale
pub async fn mark_company_stale(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let key = normalize_key(&key);
    if !state.cache().mark_stale(&key).await? {
        return Err(AppError::NotFound(format!("No cached record for {}", key)));
    }
    Ok(Json(json!({ "key": key, "refreshStrategy": "expired" })))
}

/// POST /api/v1/company/refresh
///
/// Runs one bounded batch refresh. The body is optional.
pub async fn refresh_companies(
    State(state): State<Arc<AppState>>,
    body: Option<Json<RefreshRequest>>,
) -> Result<Json<BatchRefreshReport>, AppError> {
    let limit = state.cache().policy().max_companies;
    let max = batch_size(body.and_then(|Json(r)| r.max_companies), limit);
    tracing::info!("POST /company/refresh - maxCompanies: {}", max);
    let report = state.cache().refresh_batch(max).await?;
    Ok(Json(report))
}

/// Requested batch size, capped at the configured maximum.
fn batch_size(requested: Option<usize>, limit: usize) -> usize {
    requested.map(|n| n.min(limit)).unwrap_or(limit)
}
