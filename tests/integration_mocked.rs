/// Integration tests with mocked external APIs
/// Exercises the HTTP provider clients and the HTTP routes without hitting
/// real external services
use axum::{routing::get, Router};
use company_context_api::config::{Config, RefreshPolicy};
use company_context_api::api::handlers::{self, AppState};
use company_context_api::providers::*;
use company_context_api::integrations::services::{
    ApiEntrepriseClient, BodaccClient, KnowledgeSearchClient, PappersClient,
    RechercheEntreprisesClient, RgeClient,
};
use company_context_api::siret::BusinessIdentifier;
use serde_json::{json, Value};
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SIRET: &str = "73282932000074";
const SIREN: &str = "732829320";

fn registry_body() -> Value {
    json!({
        "results": [
            {
                "siren": "552100554",
                "nom_complet": "AUTRE SOCIETE",
                "siege": {"siret": "55210055400013", "etat_administratif": "A"}
            },
            {
                "siren": SIREN,
                "nom_complet": "ISOLATION DUPONT",
                "nom_raison_sociale": "ISOLATION DUPONT SAS",
                "nature_juridique": "5710",
                "activite_principale": "43.29A",
                "date_creation": "2012-03-01",
                "etat_administratif": "A",
                "tranche_effectif_salarie": "11",
                "categorie_entreprise": "PME",
                "siege": {
                    "siret": SIRET,
                    "adresse": "12 RUE DES LILAS 75011 PARIS",
                    "etat_administratif": "A"
                },
                "matching_etablissements": [{"siret": SIRET}]
            }
        ],
        "total_results": 2
    })
}

fn rge_body() -> Value {
    json!({
        "total": 1,
        "results": [
            {
                "siret": SIRET,
                "nom_qualification": "Qualibat RGE isolation thermique",
                "organisme": "Qualibat",
                "domaine": "Isolation des murs et planchers bas",
                "date_debut": "2024-01-01",
                "date_fin": "2099-12-31"
            }
        ]
    })
}

/// Helper function to create test config
fn create_test_config(base_url: &str) -> Config {
    Config {
        database_url: None,
        port: 0,
        claude_api_key: None,
        claude_model: "claude-3-5-sonnet-20241022".to_string(),
        claude_base_url: base_url.to_string(),
        api_entreprise_token: None,
        api_entreprise_base_url: base_url.to_string(),
        pappers_api_key: None,
        pappers_base_url: base_url.to_string(),
        knowledge_search_url: None,
        registry_base_url: base_url.to_string(),
        rge_base_url: base_url.to_string(),
        bodacc_base_url: base_url.to_string(),
        provider_timeout_ms: 2_000,
        ai_score_weight: 0.4,
        reference_tables_path: None,
        refresh: RefreshPolicy {
            batch_delay_ms: 0,
            ..Default::default()
        },
    }
}

async fn mount_company_providers(mock_server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(registry_body()))
        .mount(mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/lines"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rge_body()))
        .mount(mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/catalog/datasets/annonces-commerciales/records"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"total_count": 0, "records": []})))
        .mount(mock_server)
        .await;
}

/// Serves the application router on an ephemeral port.
async fn spawn_app(config: Config) -> String {
    let state = Arc::new(AppState::from_config(config).await.expect("state builds"));
    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(handlers::api_routes())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_registry_lookup_prefers_matching_establishment() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("q", SIRET))
        .and(query_param("per_page", "10"))
        .respond_with(ResponseTemplate::new(200).set_body_json(registry_body()))
        .mount(&mock_server)
        .await;

    let client = RechercheEntreprisesClient::new(mock_server.uri());
    let query = CompanyQuery::new(Some(BusinessIdentifier::from_siret(SIRET).unwrap()), None);

    match client.lookup(&query).await {
        ProviderOutcome::Success(record) => {
            assert_eq!(record.siren, SIREN);
            assert_eq!(record.siret.as_deref(), Some(SIRET));
            assert_eq!(record.name, "ISOLATION DUPONT");
            assert!(record.active);
            assert!(record.is_construction_trade());
        }
        other => panic!("expected success, got {:?}", other),
    }
}

#[tokio::test]
async fn test_registry_statuses_map_to_outcomes() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("q", "inconnue"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("q", "panne"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("q", "vide"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
        .mount(&mock_server)
        .await;

    let client = RechercheEntreprisesClient::new(mock_server.uri());
    let by_name = |name: &str| CompanyQuery::new(None, Some(name.to_string()));

    assert_eq!(client.lookup(&by_name("inconnue")).await, ProviderOutcome::Empty);
    assert_eq!(client.lookup(&by_name("vide")).await, ProviderOutcome::Empty);
    match client.lookup(&by_name("panne")).await {
        ProviderOutcome::Error(reason) => assert!(reason.contains("503")),
        other => panic!("expected error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_circuit_breaker_fails_fast_after_repeated_errors() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(500))
        .expect(5)
        .mount(&mock_server)
        .await;

    let client = RechercheEntreprisesClient::new(mock_server.uri());
    let query = CompanyQuery::new(None, Some("Isolation Dupont".to_string()));

    let mut last = ProviderOutcome::Empty;
    for _ in 0..7 {
        last = client.lookup(&query).await;
    }
    match last {
        ProviderOutcome::Error(reason) => assert!(reason.contains("circuit breaker is open")),
        other => panic!("expected fail-fast error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_premium_registry_sends_token_and_siret() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/etablissement"))
        .and(query_param("api_token", "pappers-key"))
        .and(query_param("siret", SIRET))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "siret": SIRET,
            "adresse_ligne_1": "12 RUE DES LILAS",
            "code_postal": "75011",
            "ville": "PARIS",
            "entreprise": {
                "siren": SIREN,
                "nom_entreprise": "ISOLATION DUPONT",
                "forme_juridique_code": "5710",
                "code_naf": "43.29A",
                "date_creation": "2012-03-01",
                "entreprise_cessee": false
            }
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = PappersClient::new(mock_server.uri(), "pappers-key");
    let query = CompanyQuery::new(Some(BusinessIdentifier::from_siret(SIRET).unwrap()), None);

    match client.lookup(&query).await {
        ProviderOutcome::Success(record) => {
            assert_eq!(record.siren, SIREN);
            assert_eq!(record.siret.as_deref(), Some(SIRET));
            assert_eq!(record.legal_form.as_deref(), Some("5710"));
            assert!(record.active);
        }
        other => panic!("expected success, got {:?}", other),
    }
}

#[tokio::test]
async fn test_rge_certifications_by_siret() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/lines"))
        .and(query_param("q", format!("siret:\"{}\"", SIRET).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(rge_body()))
        .mount(&mock_server)
        .await;

    let client = RgeClient::new(mock_server.uri());
    let outcome = client
        .lookup(&BusinessIdentifier::from_siret(SIRET).unwrap())
        .await;

    let certifications = outcome.success().expect("certifications");
    assert_eq!(certifications.len(), 1);
    assert_eq!(certifications[0].organism.as_deref(), Some("Qualibat"));
    assert!(certifications[0].valid_until.is_some());
}

#[tokio::test]
async fn test_bodacc_announcements_decode() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/catalog/datasets/annonces-commerciales/records"))
        .and(query_param("where", format!("registre LIKE \"{}%\"", SIREN).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "total_count": 1,
            "records": [{
                "record": {
                    "id": "rec-1",
                    "fields": {
                        "typeavis": "Jugement de liquidation judiciaire",
                        "familleavis_lib": "Procédures collectives",
                        "dateparution": "2024-05-02",
                        "tribunal": "Tribunal de commerce de Paris"
                    }
                }
            }]
        })))
        .mount(&mock_server)
        .await;

    let client = BodaccClient::new(mock_server.uri());
    let announcements = client.lookup(SIREN).await.success().expect("announcements");
    assert_eq!(announcements.len(), 1);
    assert_eq!(announcements[0].id, "rec-1");
    assert!(announcements[0].is_collective_proceeding());
}

#[tokio::test]
async fn test_attestations_use_bearer_token_and_tolerate_missing_document() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/v4/dgfip/unites_legales/{}/attestation_fiscale", SIREN)))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "entity_status": {"code": "ok"},
                "date_fin_validite": "2099-06-30"
            }
        })))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v4/urssaf/unites_legales/{}/attestation_vigilance", SIREN)))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let client = ApiEntrepriseClient::new(mock_server.uri(), "test-token");
    let attestations = client.lookup(SIREN).await.success().expect("attestations");
    assert_eq!(attestations.len(), 1);
    assert_eq!(attestations[0].kind, AttestationKind::Tax);
    assert!(attestations[0].valid);
}

#[tokio::test]
async fn test_knowledge_search_posts_categories() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/search"))
        .and(body_partial_json(json!({"categories": ["isolation"]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                {"title": "Isolation des combles", "code_reference": "DTU 45.11", "similarity": 0.87, "content": "Les isolants en vrac..."}
            ]
        })))
        .mount(&mock_server)
        .await;

    let client = KnowledgeSearchClient::new(format!("{}/search", mock_server.uri()));
    let query = ReferenceQuery {
        categories: vec!["isolation".to_string()],
        ..Default::default()
    };
    let references = client.search(&query).await.success().expect("references");
    assert_eq!(references[0].code_reference.as_deref(), Some("DTU 45.11"));
    assert!(references[0].excerpt.starts_with("Les isolants"));
}

#[tokio::test]
async fn test_http_resolve_then_read_cached_record() {
    let mock_server = MockServer::start().await;
    mount_company_providers(&mock_server).await;
    let base = spawn_app(create_test_config(&mock_server.uri())).await;
    let http = reqwest::Client::new();

    let health: Value = http.get(format!("{}/health", base)).send().await.unwrap().json().await.unwrap();
    assert_eq!(health["status"], "healthy");

    let response = http
        .post(format!("{}/api/v1/company/resolve", base))
        .json(&json!({
            "document": "DEVIS N° 42\nISOLATION DUPONT\nSIRET: 732 829 320 00074\nIsolation des combles perdus",
            "workItems": [
                {"description": "Isolation des combles perdus", "category": "isolation", "quantity": 80, "unit": "m²", "unitPrice": 32, "totalPrice": 2560}
            ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["cached"], false);
    assert_eq!(body["extraction"]["identifier"]["siret"], SIRET);
    assert_eq!(body["context"]["entreprise"]["siren"], SIREN);
    assert!(body["sources"]
        .as_array()
        .unwrap()
        .iter()
        .any(|s| s == ProviderKind::Registry.label()));

    let again: Value = http
        .post(format!("{}/api/v1/company/resolve", base))
        .json(&json!({"identifier": "732 829 320 00074"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(again["cached"], true);

    let record = http
        .get(format!("{}/api/v1/company/{}", base, SIRET))
        .send()
        .await
        .unwrap();
    assert_eq!(record.status(), 200);
    let record: Value = record.json().await.unwrap();
    assert_eq!(record["fetchCount"], 2);

    let missing = http
        .get(format!("{}/api/v1/company/{}", base, "55210055400013"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
}

#[tokio::test]
async fn test_http_stale_and_refresh() {
    let mock_server = MockServer::start().await;
    mount_company_providers(&mock_server).await;
    let base = spawn_app(create_test_config(&mock_server.uri())).await;
    let http = reqwest::Client::new();

    let resolved = http
        .post(format!("{}/api/v1/company/resolve", base))
        .json(&json!({"identifier": SIRET}))
        .send()
        .await
        .unwrap();
    assert_eq!(resolved.status(), 200);

    let stale = http
        .post(format!("{}/api/v1/company/{}/stale", base, SIRET))
        .send()
        .await
        .unwrap();
    assert_eq!(stale.status(), 200);

    let report: Value = http
        .post(format!("{}/api/v1/company/refresh", base))
        .json(&json!({"maxCompanies": 5}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(report["selected"], 1);
    assert_eq!(report["refreshed"], 1);
    assert_eq!(report["failures"].as_array().unwrap().len(), 0);

    let unknown = http
        .post(format!("{}/api/v1/company/{}/stale", base, "55210055400013"))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), 404);
}

#[tokio::test]
async fn test_http_rejects_invalid_identifier() {
    let mock_server = MockServer::start().await;
    let base = spawn_app(create_test_config(&mock_server.uri())).await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/v1/company/resolve", base))
        .json(&json!({"identifier": "123 456 789 00012"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}
