//! Request-level orchestration: extraction, cached company lookup and
//! reference lookup, then synthesis.

use crate::cache::CacheManager;
use crate::errors::AppError;
use crate::extractor::IdentifierExtractor;
use crate::models::{ExtractionResult, ResolveRequest, ResolveResponse};
use crate::providers::{CompanyQuery, ReferenceQuery};
use crate::reference_data::ReferenceTables;
use crate::scorer::QualitySignals;
use crate::siret::BusinessIdentifier;
use crate::synthesizer::{ContextSynthesizer, SynthesisInput};
use chrono::Utc;
use std::sync::Arc;

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

pub struct CompanyResolutionService {
    extractor: IdentifierExtractor,
    cache: Arc<CacheManager>,
    tables: Arc<ReferenceTables>,
    synthesizer: ContextSynthesizer,
}

impl CompanyResolutionService {
    pub fn new(
        extractor: IdentifierExtractor,
        cache: Arc<CacheManager>,
        tables: Arc<ReferenceTables>,
        synthesizer: ContextSynthesizer,
    ) -> Self {
        Self {
            extractor,
            cache,
            tables,
            synthesizer,
        }
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn tables(&self) -> &ReferenceTables {
        &self.tables
    }

    /// Resolves a company and builds its context.
    ///
    /// An explicit identifier must be valid; a document goes through the
    /// extractor, whose failure is soft. The company half (cache-wrapped) and
    /// the reference half run concurrently.
    pub async fn resolve(&self, request: ResolveRequest) -> Result<ResolveResponse, AppError> {
        let document = non_blank(request.document.as_deref());
        let explicit_identifier = non_blank(request.identifier.as_deref());
        let explicit_name = non_blank(request.company_name.as_deref()).map(str::to_string);

        if document.is_none() && explicit_identifier.is_none() && explicit_name.is_none() {
            return Err(AppError::BadRequest(
                "one of document, identifier or companyName is required".to_string(),
            ));
        }

        let extraction: Option<ExtractionResult> = match (explicit_identifier, document) {
            (Some(raw), _) => {
                let identifier = BusinessIdentifier::parse(raw)?;
                Some(ExtractionResult::explicit(identifier, explicit_name.clone()))
            }
            (None, Some(text)) => Some(self.extractor.resolve(text).await),
            (None, None) => None,
        };

        if let Some(e) = extraction.as_ref().filter(|e| !e.success) {
            tracing::info!(
                "Extraction found no identifier ({} diagnostics), continuing with name-independent sources",
                e.diagnostics.len()
            );
        }

        let query = CompanyQuery::new(
            extraction.as_ref().and_then(|e| e.identifier.clone()),
            explicit_name.or_else(|| extraction.as_ref().and_then(|e| e.company_name.clone())),
        );

        let work_categories = self.tables.detect_categories(document, &request.work_items);
        let required_certifications = self.tables.required_certifications(&work_categories);
        let reference_query = ReferenceQuery {
            categories: work_categories.clone(),
            work_items: request.work_items.clone(),
            declared_total: request.declared_total,
        };

        let aggregator = self.cache.aggregator();
        let (company, reference) = tokio::join!(
            self.cache.resolve(&query, request.force_refresh),
            aggregator.fetch_reference(&reference_query)
        );

        let now = Utc::now();
        let signals = QualitySignals::from_snapshot(&company.snapshot, now.date_naive())
            .with_lots(&request.work_items, request.declared_total);
        let configured = aggregator.configured();

        let context = self.synthesizer.synthesize(SynthesisInput {
            extraction: extraction.as_ref(),
            company: &company,
            reference: &reference,
            work_categories,
            required_certifications,
            signals,
            ai_score: request.ai_score,
            configured: &configured,
            reference_version: &self.tables.version,
            now,
        });

        let success = context.entreprise.siren.is_some() || company.snapshot.registry.is_some();
        tracing::info!(
            "Resolved company {} (cached: {}, sources: {}, fiability: {})",
            query.cache_key().unwrap_or_else(|| "-".to_string()),
            company.cached,
            context.sources.len(),
            context.fiability
        );

        Ok(ResolveResponse {
            success,
            extraction,
            cached: company.cached,
            cache_age_seconds: company.cache_age_seconds,
            sources: context.sources.clone(),
            context: Some(context),
        })
    }
}
