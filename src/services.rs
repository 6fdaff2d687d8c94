//! HTTP clients for the external data providers.
//!
//! Each client owns exactly one decoder (`decode_*`), and nothing outside this
//! module depends on a provider's wire format.

use crate::circuit_breaker::{call_guarded, create_provider_circuit_breaker, ProviderBreaker};
use crate::config::Config;
use crate::errors::AppError;
use crate::providers::*;
use crate::siret::{is_valid_siret, BusinessIdentifier};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{json, Value};

/// Sends a request and returns the JSON body.
///
/// `404 Not Found` means "nothing for this key" and yields `Ok(None)`; any
/// other non-success status is an `ExternalApiError`.
async fn fetch_json(request: RequestBuilder, provider: &str) -> Result<Option<Value>, AppError> {
    let response = request
        .send()
        .await
        .map_err(|e| AppError::ExternalApiError(format!("{} request failed: {}", provider, e)))?;

    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        tracing::debug!("{} returned 404", provider);
        return Ok(None);
    }
    if !status.is_success() {
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(AppError::ExternalApiError(format!(
            "{} returned status {}: {}",
            provider,
            status,
            error_text.chars().take(200).collect::<String>()
        )));
    }

    let body: Value = response.json().await.map_err(|e| {
        AppError::ExternalApiError(format!("Failed to parse {} response: {}", provider, e))
    })?;
    Ok(Some(body))
}

fn build_url(base: &str, path: &str, params: &[(&str, &str)]) -> Result<reqwest::Url, AppError> {
    reqwest::Url::parse_with_params(&format!("{}{}", base, path), params)
        .map_err(|e| AppError::ExternalApiError(format!("Failed to build URL: {}", e)))
}

fn into_outcome<T>(
    result: Result<Option<Value>, AppError>,
    decode: impl FnOnce(&Value) -> ProviderOutcome<T>,
) -> ProviderOutcome<T> {
    match result {
        Ok(Some(body)) => decode(&body),
        Ok(None) => ProviderOutcome::Empty,
        Err(e) => ProviderOutcome::Error(e.to_string()),
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Accepts `YYYY-MM-DD` optionally followed by a time part.
fn date_field(value: &Value, key: &str) -> Option<NaiveDate> {
    let raw = str_field(value, key)?;
    let day: String = raw.chars().take(10).collect();
    NaiveDate::parse_from_str(&day, "%Y-%m-%d").ok()
}

// ============ Company registry (recherche-entreprises) ============

pub struct RechercheEntreprisesClient {
    client: Client,
    base_url: String,
    breaker: ProviderBreaker,
}

impl RechercheEntreprisesClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            breaker: create_provider_circuit_breaker(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.registry_base_url.clone())
    }

    async fn search(&self, q: &str) -> Result<Option<Value>, AppError> {
        let url = build_url(&self.base_url, "/search", &[("q", q), ("per_page", "10")])?;
        tracing::info!("Searching company registry for: {}", q);
        call_guarded(
            &self.breaker,
            "registry",
            fetch_json(self.client.get(url), "registry"),
        )
        .await
    }
}

/// Decodes a `/search` response into the best matching registry record.
///
/// When `siret` is given, the result containing that establishment is
/// preferred and the record carries that SIRET.
pub fn decode_registry(body: &Value, siret: Option<&str>) -> ProviderOutcome<RegistryRecord> {
    let Some(results) = body.get("results").and_then(Value::as_array) else {
        return ProviderOutcome::Error("registry payload has no results array".to_string());
    };
    if results.is_empty() {
        return ProviderOutcome::Empty;
    }

    let establishment_matches = |company: &Value, siret: &str| {
        let in_siege = company
            .get("siege")
            .and_then(|s| str_field(s, "siret"))
            .map(|s| s == siret)
            .unwrap_or(false);
        let in_matching = company
            .get("matching_etablissements")
            .and_then(Value::as_array)
            .map(|list| list.iter().any(|e| str_field(e, "siret").as_deref() == Some(siret)))
            .unwrap_or(false);
        in_siege || in_matching
    };

    // A SIRET query never falls back to another company's result.
    let company = match siret {
        Some(s) => match results.iter().find(|c| establishment_matches(*c, s)) {
            Some(company) => company,
            None => return ProviderOutcome::Empty,
        },
        None => &results[0],
    };

    let Some(siren) = str_field(company, "siren") else {
        return ProviderOutcome::Error("registry result missing siren".to_string());
    };
    let siege = company.get("siege").cloned().unwrap_or(Value::Null);
    let name = str_field(company, "nom_complet")
        .or_else(|| str_field(company, "nom_raison_sociale"))
        .unwrap_or_else(|| siren.clone());

    let record_siret = siret
        .filter(|s| establishment_matches(company, *s))
        .map(str::to_string)
        .or_else(|| str_field(&siege, "siret"))
        .filter(|s| is_valid_siret(s));

    let state = str_field(company, "etat_administratif")
        .or_else(|| str_field(&siege, "etat_administratif"))
        .unwrap_or_default();

    ProviderOutcome::Success(RegistryRecord {
        siren,
        siret: record_siret,
        name,
        legal_name: str_field(company, "nom_raison_sociale"),
        address: str_field(&siege, "adresse"),
        legal_form: str_field(company, "nature_juridique"),
        activity_code: str_field(company, "activite_principale")
            .or_else(|| str_field(&siege, "activite_principale")),
        creation_date: date_field(company, "date_creation"),
        active: matches!(state.as_str(), "A" | "Actif" | "Active"),
        headcount_band: str_field(company, "tranche_effectif_salarie"),
        category: str_field(company, "categorie_entreprise"),
    })
}

#[async_trait]
impl RegistryLookup for RechercheEntreprisesClient {
    async fn lookup(&self, query: &CompanyQuery) -> ProviderOutcome<RegistryRecord> {
        let (q, siret) = match (&query.identifier, &query.company_name) {
            (Some(id), _) => (
                id.siret().unwrap_or(id.siren()).to_string(),
                id.siret().map(str::to_string),
            ),
            (None, Some(name)) => (name.clone(), None),
            (None, None) => return ProviderOutcome::Empty,
        };
        into_outcome(self.search(&q).await, |body| {
            decode_registry(body, siret.as_deref())
        })
    }
}

// ============ Premium company registry (Pappers) ============

/// Key-gated registry used to upgrade low-quality free registry data.
pub struct PappersClient {
    client: Client,
    base_url: String,
    api_key: String,
    breaker: ProviderBreaker,
}

impl PappersClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            breaker: create_provider_circuit_breaker(),
        }
    }

    /// `None` when no API key is configured.
    pub fn from_config(config: &Config) -> Option<Self> {
        config
            .pappers_api_key
            .as_ref()
            .map(|key| Self::new(config.pappers_base_url.clone(), key.clone()))
    }
}

/// Decodes an `/entreprise`, `/etablissement` or `/recherche` response.
///
/// `/etablissement` nests the company under `entreprise` and `/recherche`
/// lists it under `resultats`.
pub fn decode_pappers(body: &Value) -> ProviderOutcome<RegistryRecord> {
    let company = match body.get("resultats") {
        Some(Value::Array(results)) => match results.first() {
            Some(first) => first,
            None => return ProviderOutcome::Empty,
        },
        _ => body.get("entreprise").unwrap_or(body),
    };
    let Some(siren) = str_field(company, "siren") else {
        return ProviderOutcome::Error("Pappers payload missing siren".to_string());
    };
    let siege = company
        .get("siege")
        .or_else(|| body.get("etablissement"))
        .cloned()
        .unwrap_or(Value::Null);

    let address = [
        str_field(&siege, "adresse_ligne_1"),
        str_field(&siege, "code_postal"),
        str_field(&siege, "ville"),
    ]
    .into_iter()
    .flatten()
    .collect::<Vec<_>>()
    .join(" ");

    let name = str_field(company, "nom_entreprise")
        .or_else(|| str_field(company, "denomination"))
        .unwrap_or_else(|| siren.clone());
    let ceased = company
        .get("entreprise_cessee")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    ProviderOutcome::Success(RegistryRecord {
        siren,
        siret: str_field(body, "siret")
            .or_else(|| str_field(&siege, "siret"))
            .filter(|s| is_valid_siret(s)),
        name,
        legal_name: str_field(company, "denomination"),
        address: Some(address).filter(|a| !a.is_empty()),
        legal_form: str_field(company, "forme_juridique_code")
            .or_else(|| str_field(company, "forme_juridique")),
        activity_code: str_field(company, "code_naf"),
        creation_date: date_field(company, "date_creation"),
        active: !ceased && str_field(company, "date_radiation").is_none(),
        headcount_band: str_field(company, "tranche_effectif_salarie"),
        category: str_field(company, "categorie_juridique"),
    })
}

#[async_trait]
impl RegistryLookup for PappersClient {
    async fn lookup(&self, query: &CompanyQuery) -> ProviderOutcome<RegistryRecord> {
        let (path, param, value) = match (&query.identifier, &query.company_name) {
            (Some(id), _) => match id.siret() {
                Some(siret) => ("/etablissement", "siret", siret.to_string()),
                None => ("/entreprise", "siren", id.siren().to_string()),
            },
            (None, Some(name)) => ("/recherche", "q", name.clone()),
            (None, None) => return ProviderOutcome::Empty,
        };
        let url = match build_url(
            &self.base_url,
            path,
            &[("api_token", self.api_key.as_str()), (param, value.as_str())],
        ) {
            Ok(url) => url,
            Err(e) => return ProviderOutcome::Error(e.to_string()),
        };
        tracing::info!("Querying premium registry {} for {}", path, value);
        let result = call_guarded(
            &self.breaker,
            "premium_registry",
            fetch_json(self.client.get(url), "premium_registry"),
        )
        .await;
        into_outcome(result, decode_pappers)
    }
}

// ============ RGE certifications (ADEME open data) ============

pub struct RgeClient {
    client: Client,
    base_url: String,
    breaker: ProviderBreaker,
}

impl RgeClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            breaker: create_provider_circuit_breaker(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.rge_base_url.clone())
    }
}

pub fn decode_certifications(body: &Value) -> ProviderOutcome<Vec<Certification>> {
    let Some(results) = body.get("results").and_then(Value::as_array) else {
        return ProviderOutcome::Error("RGE payload has no results array".to_string());
    };
    let certifications = results
        .iter()
        .filter_map(|line| {
            let name = str_field(line, "nom_qualification")?;
            Some(Certification {
                name,
                organism: str_field(line, "organisme"),
                domain: str_field(line, "domaine"),
                valid_from: date_field(line, "date_debut"),
                valid_until: date_field(line, "date_fin"),
            })
        })
        .collect();
    ProviderOutcome::from_list(certifications)
}

#[async_trait]
impl CertificationLookup for RgeClient {
    async fn lookup(&self, identifier: &BusinessIdentifier) -> ProviderOutcome<Vec<Certification>> {
        let q = match identifier.siret() {
            Some(siret) => format!("siret:\"{}\"", siret),
            None => format!("siret:{}*", identifier.siren()),
        };
        let url = match build_url(&self.base_url, "/lines", &[("size", "100"), ("q", &q)]) {
            Ok(url) => url,
            Err(e) => return ProviderOutcome::Error(e.to_string()),
        };
        let result = call_guarded(
            &self.breaker,
            "certification",
            fetch_json(self.client.get(url), "certification"),
        )
        .await;
        into_outcome(result, decode_certifications)
    }
}

// ============ Legal announcements (BODACC) ============

pub struct BodaccClient {
    client: Client,
    base_url: String,
    breaker: ProviderBreaker,
}

impl BodaccClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            breaker: create_provider_circuit_breaker(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.bodacc_base_url.clone())
    }
}

pub fn decode_announcements(body: &Value) -> ProviderOutcome<Vec<LegalAnnouncement>> {
    let Some(records) = body.get("records").and_then(Value::as_array) else {
        return ProviderOutcome::Error("BODACC payload has no records array".to_string());
    };
    let announcements = records
        .iter()
        .enumerate()
        .filter_map(|(i, r)| {
            let fields = r
                .pointer("/record/fields")
                .or_else(|| r.get("fields"))?;
            let kind = str_field(fields, "typeavis")
                .or_else(|| str_field(fields, "typeavis_lib"))
                .unwrap_or_else(|| "annonce".to_string());
            Some(LegalAnnouncement {
                id: str_field(fields, "id")
                    .or_else(|| r.pointer("/record/id").and_then(|v| v.as_str()).map(str::to_string))
                    .unwrap_or_else(|| format!("bodacc-{}", i)),
                published_at: date_field(fields, "dateparution"),
                kind,
                family: str_field(fields, "familleavis")
                    .or_else(|| str_field(fields, "familleavis_lib")),
                court: str_field(fields, "tribunal"),
            })
        })
        .collect();
    ProviderOutcome::from_list(announcements)
}

#[async_trait]
impl LegalAnnouncementLookup for BodaccClient {
    async fn lookup(&self, siren: &str) -> ProviderOutcome<Vec<LegalAnnouncement>> {
        let filter = format!("registre LIKE \"{}%\"", siren);
        let url = match build_url(
            &self.base_url,
            "/catalog/datasets/annonces-commerciales/records",
            &[("where", filter.as_str()), ("limit", "20")],
        ) {
            Ok(url) => url,
            Err(e) => return ProviderOutcome::Error(e.to_string()),
        };
        let result = call_guarded(
            &self.breaker,
            "legal_announcements",
            fetch_json(self.client.get(url), "legal_announcements"),
        )
        .await;
        into_outcome(result, decode_announcements)
    }
}

// ============ Compliance attestations (API Entreprise) ============

pub struct ApiEntrepriseClient {
    client: Client,
    base_url: String,
    token: String,
    breaker: ProviderBreaker,
}

impl ApiEntrepriseClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            token: token.into(),
            breaker: create_provider_circuit_breaker(),
        }
    }

    /// `None` when no token is configured.
    pub fn from_config(config: &Config) -> Option<Self> {
        config
            .api_entreprise_token
            .as_ref()
            .map(|token| Self::new(config.api_entreprise_base_url.clone(), token.clone()))
    }

    async fn fetch_attestation(
        &self,
        path: String,
        kind: AttestationKind,
    ) -> Result<Option<Attestation>, AppError> {
        let url = build_url(
            &self.base_url,
            &path,
            &[
                ("context", "Verification entreprise"),
                ("object", "Controle conformite"),
                ("recipient", "00000000000000"),
            ],
        )?;
        let request = self.client.get(url).bearer_auth(&self.token);
        let body = call_guarded(&self.breaker, "attestations", fetch_json(request, "attestations"))
            .await?;
        Ok(body.and_then(|b| decode_attestation(&b, kind)))
    }
}

/// Decodes one attestation document (`{"data": {...}}`).
pub fn decode_attestation(body: &Value, kind: AttestationKind) -> Option<Attestation> {
    let data = body.get("data")?;
    let status_ok = data
        .pointer("/entity_status/code")
        .and_then(Value::as_str)
        .map(|code| code == "ok")
        .unwrap_or(true);
    Some(Attestation {
        kind,
        valid: status_ok,
        valid_until: date_field(data, "date_fin_validite"),
    })
}

#[async_trait]
impl AttestationLookup for ApiEntrepriseClient {
    async fn lookup(&self, siren: &str) -> ProviderOutcome<Vec<Attestation>> {
        let (social, tax) = tokio::join!(
            self.fetch_attestation(
                format!("/v4/urssaf/unites_legales/{}/attestation_vigilance", siren),
                AttestationKind::SocialSecurity,
            ),
            self.fetch_attestation(
                format!("/v4/dgfip/unites_legales/{}/attestation_fiscale", siren),
                AttestationKind::Tax,
            ),
        );

        match (social, tax) {
            (Err(a), Err(b)) => ProviderOutcome::Error(format!("{}; {}", a, b)),
            (social, tax) => {
                let attestations: Vec<Attestation> = [social, tax]
                    .into_iter()
                    .filter_map(|r| r.ok().flatten())
                    .collect();
                ProviderOutcome::from_list(attestations)
            }
        }
    }
}

// ============ Knowledge base search ============

pub struct KnowledgeSearchClient {
    client: Client,
    url: String,
    breaker: ProviderBreaker,
}

impl KnowledgeSearchClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            breaker: create_provider_circuit_breaker(),
        }
    }

    pub fn from_config(config: &Config) -> Option<Self> {
        config.knowledge_search_url.as_ref().map(|url| Self::new(url.clone()))
    }
}

pub fn decode_knowledge(body: &Value) -> ProviderOutcome<Vec<KnowledgeReference>> {
    let Some(results) = body.get("results").and_then(Value::as_array) else {
        return ProviderOutcome::Error("knowledge payload has no results array".to_string());
    };
    let references = results
        .iter()
        .filter_map(|r| {
            let title = str_field(r, "title")?;
            let excerpt = str_field(r, "excerpt")
                .or_else(|| str_field(r, "content"))
                .unwrap_or_default();
            Some(KnowledgeReference {
                title,
                code_reference: str_field(r, "code_reference"),
                category: str_field(r, "category"),
                similarity: r.get("similarity").and_then(Value::as_f64).unwrap_or(0.0),
                excerpt: excerpt.chars().take(500).collect(),
            })
        })
        .collect();
    ProviderOutcome::from_list(references)
}

#[async_trait]
impl KnowledgeSearch for KnowledgeSearchClient {
    async fn search(&self, query: &ReferenceQuery) -> ProviderOutcome<Vec<KnowledgeReference>> {
        if query.categories.is_empty() && query.work_items.is_empty() {
            return ProviderOutcome::Empty;
        }
        let text = query
            .work_items
            .iter()
            .map(|item| item.description.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let payload = json!({
            "categories": query.categories,
            "query": text,
            "limit": 5,
        });
        let result = call_guarded(
            &self.breaker,
            "knowledge_base",
            fetch_json(self.client.post(&self.url).json(&payload), "knowledge_base"),
        )
        .await;
        into_outcome(result, decode_knowledge)
    }
}
