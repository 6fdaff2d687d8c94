/// End-to-end resolution tests over provider doubles: partial failure,
/// timeouts, name-only queries and request validation
mod common;

use common::*;
use company_context_api::aggregator::DataSourceAggregator;
use company_context_api::cache::{CacheManager, MemoryCompanyStore};
use company_context_api::errors::AppError;
use company_context_api::extractor::IdentifierExtractor;
use company_context_api::models::{ResolveRequest, RiskLevel};
use company_context_api::providers::{CompanyQuery, LegalAnnouncement, ProviderKind};
use company_context_api::reference_data::{
    ReferenceTables, TablePriceReference, TableSubsidyRules, TableTechnicalReferences,
};
use company_context_api::resolution::CompanyResolutionService;
use company_context_api::synthesizer::ContextSynthesizer;
use std::sync::Arc;
use std::time::Duration;

fn tables() -> Arc<ReferenceTables> {
    Arc::new(ReferenceTables::embedded().expect("embedded tables parse"))
}

fn service(aggregator: DataSourceAggregator) -> CompanyResolutionService {
    let cache = CacheManager::new(
        Arc::new(MemoryCompanyStore::new()),
        Arc::new(aggregator),
        fast_policy(),
    );
    CompanyResolutionService::new(
        IdentifierExtractor::new(),
        Arc::new(cache),
        tables(),
        ContextSynthesizer::default(),
    )
}

fn request_for(identifier: &str) -> ResolveRequest {
    ResolveRequest {
        identifier: Some(identifier.to_string()),
        work_items: isolation_items(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_one_timed_out_provider_of_five() {
    let tables = tables();
    let aggregator = DataSourceAggregator::new(Duration::from_millis(150))
        .with_registry(CountingRegistry::returning(registry_record(SIRET, "Isolation Dupont")))
        .with_certification(StaticCertifications::new(vec![rge_certification(
            "Qualibat RGE isolation thermique",
        )]))
        .with_legal_announcements(Arc::new(SlowAnnouncements {
            delay: Duration::from_secs(5),
            announcements: vec![],
        }))
        .with_price_reference(Arc::new(TablePriceReference::new(tables.clone())))
        .with_knowledge(Arc::new(TableTechnicalReferences::new(tables)));
    assert_eq!(aggregator.configured().len(), 5);

    let started = std::time::Instant::now();
    let response = service(aggregator).resolve(request_for(SIRET)).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));

    assert!(response.success);
    assert_eq!(response.sources.len(), 4);
    let context = response.context.expect("context");
    assert!(context
        .entreprise
        .alerts
        .iter()
        .any(|a| a.contains("source unavailable") && a.contains("Legal announcements")));
    assert!(context.fiability > 0.0 && context.fiability < 1.0);
    assert_eq!(context.price_comparison.len(), 2);
    assert!(!context.knowledge_references.is_empty());
    assert_eq!(context.work_categories, vec!["isolation".to_string()]);
}

#[tokio::test]
async fn test_all_providers_failing_gives_zero_fiability() {
    let aggregator = DataSourceAggregator::new(Duration::from_millis(100))
        .with_registry(CountingRegistry::failing("HTTP 500"))
        .with_certification(Arc::new(FailingCertifications))
        .with_legal_announcements(Arc::new(FailingAnnouncements))
        .with_attestations(Arc::new(PanickingAttestations));

    let response = service(aggregator)
        .resolve(ResolveRequest {
            identifier: Some(SIRET.to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

    let context = response.context.unwrap();
    assert!(response.sources.is_empty());
    assert_eq!(context.fiability, 0.0);
    assert_eq!(
        context
            .entreprise
            .alerts
            .iter()
            .filter(|a| a.contains("source unavailable"))
            .count(),
        4
    );
    assert!(!response.cached);
}

#[tokio::test]
async fn test_scores_and_flags_from_company_data() {
    let aggregator = DataSourceAggregator::new(Duration::from_millis(200))
        .with_registry(CountingRegistry::returning(registry_record(SIRET, "Isolation Dupont")))
        .with_certification(StaticCertifications::new(vec![rge_certification(
            "Qualibat RGE isolation",
        )]))
        .with_legal_announcements(Arc::new(SlowAnnouncements {
            delay: Duration::from_millis(1),
            announcements: vec![LegalAnnouncement {
                id: "A-2024-1".to_string(),
                published_at: None,
                kind: "Jugement d'ouverture de redressement judiciaire".to_string(),
                family: Some("Procédures collectives".to_string()),
                court: Some("Tribunal de commerce de Paris".to_string()),
            }],
        }));

    let mut request = request_for(SIRET);
    request.declared_total = Some(5160.0);
    request.ai_score = Some(90.0);
    let context = service(aggregator).resolve(request).await.unwrap().context.unwrap();

    // certification 25 + legal structure 15 + age 25 + consistent lots 15
    assert_eq!(context.entreprise.quality_score, 80);
    assert_eq!(context.entreprise.entreprise_score, 84.0);
    assert_eq!(context.entreprise.risk_level, RiskLevel::Critical);
    assert!(context
        .entreprise
        .alerts
        .iter()
        .any(|a| a.starts_with("CRITICAL: collective proceeding")));
}

#[tokio::test]
async fn test_name_only_query_resolves_identifier_first() {
    let registry = CountingRegistry::returning(registry_record(SIRET, "Isolation Dupont"));
    let certifications = StaticCertifications::new(vec![]);
    let aggregator = DataSourceAggregator::new(Duration::from_millis(200))
        .with_registry(registry.clone())
        .with_certification(certifications.clone());

    let snapshot = aggregator
        .fetch_company(&CompanyQuery::new(None, Some("Isolation Dupont".to_string())))
        .await;

    assert_eq!(registry.calls(), 1);
    assert_eq!(snapshot.identifier.map(|i| i.cache_key()), Some(SIRET.to_string()));
    assert_eq!(certifications.seen(), vec![SIRET.to_string()]);
}

#[tokio::test]
async fn test_failed_extraction_still_runs_reference_providers() {
    let tables = tables();
    let registry = CountingRegistry::returning(registry_record(SIRET, "Isolation Dupont"));
    let aggregator = DataSourceAggregator::new(Duration::from_millis(200))
        .with_registry(registry.clone())
        .with_subsidies(Arc::new(TableSubsidyRules::new(tables.clone())))
        .with_knowledge(Arc::new(TableTechnicalReferences::new(tables)));

    let response = service(aggregator)
        .resolve(ResolveRequest {
            document: Some("devis pour isolation des combles perdus, 80 m2".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(!response.success);
    assert_eq!(registry.calls(), 0);
    let extraction = response.extraction.unwrap();
    assert!(!extraction.success);

    let context = response.context.unwrap();
    assert!(context.sources.contains(&ProviderKind::KnowledgeBase.label().to_string()));
    assert!(context.sources.contains(&ProviderKind::Subsidies.label().to_string()));
    assert!(!context.eligible_subsidies.eligible.is_empty());
    assert!(context
        .entreprise
        .alerts
        .iter()
        .any(|a| a.starts_with("INFO: Company registry")));
}

#[tokio::test]
async fn test_request_validation() {
    let svc = service(DataSourceAggregator::new(Duration::from_millis(100)));

    let empty = svc.resolve(ResolveRequest::default()).await;
    assert!(matches!(empty, Err(AppError::BadRequest(_))));

    let invalid = svc
        .resolve(ResolveRequest {
            identifier: Some("12345678900012".to_string()),
            ..Default::default()
        })
        .await;
    assert!(matches!(invalid, Err(AppError::Validation(_))));
}

#[tokio::test]
async fn test_cached_resolution_keeps_the_same_alerts() {
    let aggregator = DataSourceAggregator::new(Duration::from_millis(200))
        .with_registry(CountingRegistry::returning(registry_record(SIRET, "Isolation Dupont")))
        .with_certification(StaticCertifications::new(vec![]))
        .with_attestations(Arc::new(EmptyAttestations));
    let svc = service(aggregator);

    let live = svc.resolve(request_for(SIRET)).await.unwrap();
    let cached = svc.resolve(request_for(SIRET)).await.unwrap();
    assert!(!live.cached);
    assert!(cached.cached);

    let live = live.context.unwrap().entreprise;
    let cached = cached.context.unwrap().entreprise;
    assert!(live
        .alerts
        .iter()
        .any(|a| a == "WARNING: no tax-compliance attestation found"));
    assert_eq!(cached.alerts, live.alerts);
    assert_eq!(cached.risk_level, live.risk_level);
    assert_eq!(cached.quality_score, live.quality_score);
}
