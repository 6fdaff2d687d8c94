use crate::providers::{
    Attestation, Certification, KnowledgeReference, LegalAnnouncement, PriceComparison,
    ProviderKind, RegistryRecord, SubsidySummary,
};
use crate::siret::BusinessIdentifier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============ Extraction ============

/// How the identifier of an [`ExtractionResult`] was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMethod {
    /// Regex patterns (possibly only a name, when `success` is false).
    Pattern,
    /// Text-generation fallback.
    Generated,
    /// Pattern identifier combined with a heuristically extracted name.
    Merged,
    Failed,
}

/// Outcome of running the identifier extractor over a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    pub success: bool,
    pub identifier: Option<BusinessIdentifier>,
    pub company_name: Option<String>,
    pub legal_name: Option<String>,
    pub address: Option<String>,
    pub extraction_method: ExtractionMethod,
    /// 0-100.
    pub confidence: u8,
    pub diagnostics: Vec<String>,
}

impl ExtractionResult {
    pub fn failed(diagnostics: Vec<String>) -> Self {
        Self {
            success: false,
            identifier: None,
            company_name: None,
            legal_name: None,
            address: None,
            extraction_method: ExtractionMethod::Failed,
            confidence: 0,
            diagnostics,
        }
    }

    /// The caller supplied the identifier; nothing was extracted.
    pub fn explicit(identifier: BusinessIdentifier, company_name: Option<String>) -> Self {
        Self {
            success: true,
            identifier: Some(identifier),
            company_name,
            legal_name: None,
            address: None,
            extraction_method: ExtractionMethod::Pattern,
            confidence: 100,
            diagnostics: vec!["identifier supplied by caller".to_string()],
        }
    }
}

// ============ Cache records ============

/// Lifecycle state of a cached company record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefreshStrategy {
    /// Just fetched from the providers.
    Fresh,
    /// Served from cache, waiting for its next refresh date.
    Scheduled,
    /// Explicitly flagged for refresh.
    Expired,
    /// Frequently read (more than 10 reads).
    HighTraffic,
}

impl RefreshStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            RefreshStrategy::Fresh => "fresh",
            RefreshStrategy::Scheduled => "scheduled",
            RefreshStrategy::Expired => "expired",
            RefreshStrategy::HighTraffic => "high-traffic",
        }
    }
}

impl fmt::Display for RefreshStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RefreshStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fresh" => Ok(RefreshStrategy::Fresh),
            "scheduled" => Ok(RefreshStrategy::Scheduled),
            "expired" => Ok(RefreshStrategy::Expired),
            "high-traffic" => Ok(RefreshStrategy::HighTraffic),
            other => Err(format!("unknown refresh strategy '{}'", other)),
        }
    }
}

/// A resolved company as persisted in `company_data_cache`.
///
/// Created on the first successful resolution and updated in place on every
/// refresh. Records are never deleted, only flagged `expired`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyRecord {
    /// Unique identifier for the record.
    pub id: Uuid,
    /// Normalized identifier or `name:` key.
    pub cache_key: String,
    pub siret: Option<String>,
    pub siren: Option<String>,
    pub company_name: Option<String>,
    pub legal_name: Option<String>,
    /// Decoded payload of every identity-keyed provider that contributed.
    pub payloads: BTreeMap<ProviderKind, Value>,
    /// 0-100, computed when the record was fetched.
    pub quality_score: u8,
    pub risk_flags: Vec<String>,
    /// Hex SHA-256 over `payloads`.
    pub payload_checksum: String,
    pub fetched_at: DateTime<Utc>,
    pub next_refresh_at: DateTime<Utc>,
    pub fetch_count: i64,
    pub refresh_strategy: RefreshStrategy,
    /// Timestamp of creation.
    pub created_at: DateTime<Utc>,
    /// Timestamp of last update.
    pub updated_at: DateTime<Utc>,
}

impl CompanyRecord {
    /// Flagged `expired`, or past its refresh date.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.refresh_strategy == RefreshStrategy::Expired || self.next_refresh_at <= now
    }

    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.fetched_at).num_seconds().max(0)
    }

    pub fn identifier(&self) -> Option<BusinessIdentifier> {
        if let Some(siret) = &self.siret {
            if let Ok(id) = BusinessIdentifier::from_siret(siret) {
                return Some(id);
            }
        }
        self.siren
            .as_deref()
            .and_then(|siren| BusinessIdentifier::from_siren(siren).ok())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    Siret,
    Siren,
    Name,
}

impl SearchType {
    pub fn as_str(self) -> &'static str {
        match self {
            SearchType::Siret => "siret",
            SearchType::Siren => "siren",
            SearchType::Name => "name",
        }
    }
}

/// One company lookup, kept for search analytics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchLogEntry {
    pub cache_key: Option<String>,
    pub siret: Option<String>,
    pub siren: Option<String>,
    /// Company name searched, when the query carried one.
    pub search_query: Option<String>,
    pub search_type: SearchType,
    pub found: bool,
    pub cache_hit: bool,
    /// Providers actually called, by `ProviderKind` name.
    pub api_calls: Vec<String>,
    pub response_time_ms: u64,
    pub error_message: Option<String>,
    pub searched_at: DateTime<Utc>,
}

// ============ Request inputs ============

/// A quote line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub unit_price: Option<f64>,
    #[serde(default)]
    pub total_price: Option<f64>,
}

impl WorkItem {
    /// Explicit total, else quantity times unit price.
    pub fn line_total(&self) -> Option<f64> {
        self.total_price.or(match (self.quantity, self.unit_price) {
            (Some(quantity), Some(unit_price)) => Some(quantity * unit_price),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    #[serde(default)]
    pub document: Option<String>,
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub force_refresh: bool,
    #[serde(default)]
    pub work_items: Vec<WorkItem>,
    #[serde(default)]
    pub declared_total: Option<f64>,
    /// Externally estimated entreprise sub-score (0-100).
    #[serde(default)]
    pub ai_score: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    #[serde(default)]
    pub max_companies: Option<usize>,
}

// ============ Synthesized output ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Company half of the synthesized context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntrepriseContext {
    pub siret: Option<String>,
    pub siren: Option<String>,
    pub company_name: Option<String>,
    pub legal_name: Option<String>,
    pub identity: Option<RegistryRecord>,
    pub certifications: Vec<Certification>,
    pub legal_announcements: Vec<LegalAnnouncement>,
    pub attestations: Vec<Attestation>,
    pub quality_score: u8,
    /// Quality score blended with the externally supplied estimate.
    pub entreprise_score: f64,
    pub risk_level: RiskLevel,
    pub alerts: Vec<String>,
    pub cached: bool,
    pub cache_age_seconds: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedContext {
    pub entreprise: EntrepriseContext,
    pub work_categories: Vec<String>,
    pub price_comparison: Vec<PriceComparison>,
    pub eligible_subsidies: SubsidySummary,
    pub knowledge_references: Vec<KnowledgeReference>,
    pub sources: Vec<String>,
    /// 0-1.
    pub fiability: f64,
    pub reference_version: String,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveResponse {
    pub success: bool,
    pub extraction: Option<ExtractionResult>,
    pub context: Option<AggregatedContext>,
    pub cached: bool,
    pub cache_age_seconds: Option<i64>,
    pub sources: Vec<String>,
}
