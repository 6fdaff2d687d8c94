//! Provider capabilities consumed by the aggregator.
//!
//! Every external data source is reached through one of the lookup traits in
//! this module and answers with a [`ProviderOutcome`]. Concrete HTTP clients
//! live in `services`; reference-table providers live in `reference_data`.

use crate::models::WorkItem;
use crate::siret::BusinessIdentifier;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of data sources the aggregator knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Registry,
    Certification,
    LegalAnnouncements,
    Attestations,
    PriceReference,
    Subsidies,
    KnowledgeBase,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 7] = [
        ProviderKind::Registry,
        ProviderKind::Certification,
        ProviderKind::LegalAnnouncements,
        ProviderKind::Attestations,
        ProviderKind::PriceReference,
        ProviderKind::Subsidies,
        ProviderKind::KnowledgeBase,
    ];

    /// Weight in the fiability score. Authoritative sources weigh more.
    pub fn weight(self) -> f64 {
        match self {
            ProviderKind::Registry => 0.30,
            ProviderKind::LegalAnnouncements => 0.20,
            ProviderKind::Attestations => 0.15,
            ProviderKind::Certification => 0.15,
            ProviderKind::KnowledgeBase => 0.10,
            ProviderKind::PriceReference => 0.05,
            ProviderKind::Subsidies => 0.05,
        }
    }

    /// Keyed on the company identity (part of the cached record), as opposed
    /// to per-request reference data.
    pub fn is_identity_keyed(self) -> bool {
        match self {
            ProviderKind::Registry
            | ProviderKind::Certification
            | ProviderKind::LegalAnnouncements
            | ProviderKind::Attestations => true,
            ProviderKind::PriceReference
            | ProviderKind::Subsidies
            | ProviderKind::KnowledgeBase => false,
        }
    }

    /// Human-readable source label used in `sources[]`.
    pub fn label(self) -> &'static str {
        match self {
            ProviderKind::Registry => "Company registry (recherche-entreprises)",
            ProviderKind::Certification => "RGE certifications (ADEME)",
            ProviderKind::LegalAnnouncements => "Legal announcements (BODACC)",
            ProviderKind::Attestations => "Compliance attestations (API Entreprise)",
            ProviderKind::PriceReference => "Market price references",
            ProviderKind::Subsidies => "Subsidy eligibility rules",
            ProviderKind::KnowledgeBase => "Technical knowledge base",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Registry => "registry",
            ProviderKind::Certification => "certification",
            ProviderKind::LegalAnnouncements => "legal_announcements",
            ProviderKind::Attestations => "attestations",
            ProviderKind::PriceReference => "price_reference",
            ProviderKind::Subsidies => "subsidies",
            ProviderKind::KnowledgeBase => "knowledge_base",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a single provider call.
///
/// `Empty` means the provider answered but had nothing for this query;
/// `Error` covers transport failures, timeouts, open circuits and payloads the
/// decoder could not make sense of.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderOutcome<T> {
    Success(T),
    Empty,
    Error(String),
}

impl<T> ProviderOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, ProviderOutcome::Success(_))
    }

    pub fn success(self) -> Option<T> {
        match self {
            ProviderOutcome::Success(value) => Some(value),
            ProviderOutcome::Empty | ProviderOutcome::Error(_) => None,
        }
    }

    pub fn as_success(&self) -> Option<&T> {
        match self {
            ProviderOutcome::Success(value) => Some(value),
            ProviderOutcome::Empty | ProviderOutcome::Error(_) => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ProviderOutcome<U> {
        match self {
            ProviderOutcome::Success(value) => ProviderOutcome::Success(f(value)),
            ProviderOutcome::Empty => ProviderOutcome::Empty,
            ProviderOutcome::Error(reason) => ProviderOutcome::Error(reason),
        }
    }
}

impl<T> ProviderOutcome<Vec<T>> {
    /// An empty list is reported as `Empty` rather than `Success(vec![])`.
    pub fn from_list(items: Vec<T>) -> Self {
        if items.is_empty() {
            ProviderOutcome::Empty
        } else {
            ProviderOutcome::Success(items)
        }
    }
}

// ============ Decoded provider payloads ============

/// Official registry entry for a legal entity / establishment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryRecord {
    pub siren: String,
    pub siret: Option<String>,
    pub name: String,
    pub legal_name: Option<String>,
    pub address: Option<String>,
    /// Legal form code (nature juridique).
    pub legal_form: Option<String>,
    /// NAF activity code.
    pub activity_code: Option<String>,
    pub creation_date: Option<NaiveDate>,
    pub active: bool,
    pub headcount_band: Option<String>,
    pub category: Option<String>,
}

impl RegistryRecord {
    /// Construction trades (NAF division 43) are expected to hold RGE labels.
    pub fn is_construction_trade(&self) -> bool {
        self.activity_code
            .as_deref()
            .map(|code| code.starts_with("43"))
            .unwrap_or(false)
    }

    /// Age in (fractional) years at `today`.
    pub fn age_years(&self, today: NaiveDate) -> Option<f64> {
        let created = self.creation_date?;
        let days = (today - created).num_days();
        Some((days.max(0) as f64) / 365.25)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Certification {
    pub name: String,
    pub organism: Option<String>,
    pub domain: Option<String>,
    pub valid_from: Option<NaiveDate>,
    pub valid_until: Option<NaiveDate>,
}

impl Certification {
    pub fn is_valid_at(&self, today: NaiveDate) -> bool {
        let started = self.valid_from.map(|d| d <= today).unwrap_or(true);
        let not_expired = self.valid_until.map(|d| d >= today).unwrap_or(true);
        started && not_expired
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegalAnnouncement {
    pub id: String,
    pub published_at: Option<NaiveDate>,
    pub kind: String,
    pub family: Option<String>,
    pub court: Option<String>,
}

impl LegalAnnouncement {
    pub fn is_collective_proceeding(&self) -> bool {
        let kind = self.kind.to_lowercase();
        let family = self.family.as_deref().unwrap_or_default().to_lowercase();
        ["liquidation", "redressement", "sauvegarde"]
            .iter()
            .any(|kw| kind.contains(kw) || family.contains(kw))
            || family.contains("collective")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttestationKind {
    Tax,
    SocialSecurity,
    Insurance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attestation {
    pub kind: AttestationKind,
    pub valid: bool,
    pub valid_until: Option<NaiveDate>,
}

impl Attestation {
    pub fn is_valid_at(&self, today: NaiveDate) -> bool {
        self.valid && self.valid_until.map(|d| d >= today).unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceComparison {
    pub item: String,
    pub category: Option<String>,
    pub quoted_price: f64,
    pub market_min: f64,
    pub market_max: f64,
    pub market_avg: f64,
    pub unit: Option<String>,
    /// Signed deviation from the market average, in percent.
    pub deviation_pct: i64,
    pub assessment: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubsidyEligibility {
    pub name: String,
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubsidySummary {
    pub eligible: Vec<SubsidyEligibility>,
    pub conditions: Vec<String>,
    /// Rough amount of aid for the declared total, when one was given.
    pub estimated_amount: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeReference {
    pub title: String,
    pub code_reference: Option<String>,
    pub category: Option<String>,
    pub similarity: f64,
    pub excerpt: String,
}

// ============ Queries ============

/// What the identity-keyed providers are asked about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompanyQuery {
    pub identifier: Option<BusinessIdentifier>,
    pub company_name: Option<String>,
}

impl CompanyQuery {
    pub fn new(identifier: Option<BusinessIdentifier>, company_name: Option<String>) -> Self {
        Self {
            identifier,
            company_name: company_name
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty()),
        }
    }

    /// Normalized identifier, falling back to the normalized company name.
    pub fn cache_key(&self) -> Option<String> {
        if let Some(identifier) = &self.identifier {
            return Some(identifier.cache_key());
        }
        self.company_name
            .as_deref()
            .map(normalize_name)
            .filter(|n| !n.is_empty())
            .map(|n| format!("name:{}", n))
    }

    pub fn is_empty(&self) -> bool {
        self.identifier.is_none() && self.company_name.is_none()
    }
}

/// Lowercased alphanumeric words joined by single spaces.
pub fn normalize_name(name: &str) -> String {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// What the name-independent providers are asked about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceQuery {
    pub categories: Vec<String>,
    pub work_items: Vec<WorkItem>,
    pub declared_total: Option<f64>,
}

// ============ Capability traits ============

#[async_trait]
pub trait RegistryLookup: Send + Sync {
    async fn lookup(&self, query: &CompanyQuery) -> ProviderOutcome<RegistryRecord>;
}

#[async_trait]
pub trait CertificationLookup: Send + Sync {
    async fn lookup(&self, identifier: &BusinessIdentifier) -> ProviderOutcome<Vec<Certification>>;
}

#[async_trait]
pub trait LegalAnnouncementLookup: Send + Sync {
    async fn lookup(&self, siren: &str) -> ProviderOutcome<Vec<LegalAnnouncement>>;
}

#[async_trait]
pub trait AttestationLookup: Send + Sync {
    async fn lookup(&self, siren: &str) -> ProviderOutcome<Vec<Attestation>>;
}

#[async_trait]
pub trait PriceReferenceLookup: Send + Sync {
    async fn lookup(&self, query: &ReferenceQuery) -> ProviderOutcome<Vec<PriceComparison>>;
}

#[async_trait]
pub trait SubsidyLookup: Send + Sync {
    async fn lookup(&self, query: &ReferenceQuery) -> ProviderOutcome<SubsidySummary>;
}

#[async_trait]
pub trait KnowledgeSearch: Send + Sync {
    async fn search(&self, query: &ReferenceQuery) -> ProviderOutcome<Vec<KnowledgeReference>>;
}

// ============ Source ledger ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderReport {
    pub kind: ProviderKind,
    pub contributed: bool,
    pub alert: Option<String>,
    /// Not called at all.
    #[serde(default)]
    pub skipped: bool,
}

/// Per-provider record of who contributed data, used for `sources[]`,
/// provider alerts and the fiability score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceLedger {
    reports: Vec<ProviderReport>,
}

impl SourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an outcome, replacing any earlier report for the same provider.
    pub fn record<T>(&mut self, kind: ProviderKind, outcome: &ProviderOutcome<T>) {
        let report = match outcome {
            ProviderOutcome::Success(_) => ProviderReport {
                kind,
                contributed: true,
                alert: None,
                skipped: false,
            },
            ProviderOutcome::Empty => ProviderReport {
                kind,
                contributed: false,
                alert: None,
                skipped: false,
            },
            ProviderOutcome::Error(reason) => ProviderReport {
                kind,
                contributed: false,
                alert: Some(format!("WARNING: source unavailable: {} ({})", kind.label(), reason)),
                skipped: false,
            },
        };
        self.push(report);
    }

    /// Records a provider that was not called because its key was missing.
    pub fn skip(&mut self, kind: ProviderKind, reason: &str) {
        self.push(ProviderReport {
            kind,
            contributed: false,
            alert: Some(format!("INFO: {} skipped: {}", kind.label(), reason)),
            skipped: true,
        });
    }

    pub fn mark_contributed(&mut self, kind: ProviderKind) {
        self.push(ProviderReport {
            kind,
            contributed: true,
            alert: None,
            skipped: false,
        });
    }

    fn push(&mut self, report: ProviderReport) {
        self.reports.retain(|r| r.kind != report.kind);
        self.reports.push(report);
    }

    pub fn merge(&mut self, other: &SourceLedger) {
        for report in &other.reports {
            self.push(report.clone());
        }
    }

    pub fn reports(&self) -> &[ProviderReport] {
        &self.reports
    }

    /// Providers that were called, whatever their outcome.
    pub fn called(&self) -> Vec<ProviderKind> {
        self.reports
            .iter()
            .filter(|r| !r.skipped)
            .map(|r| r.kind)
            .collect()
    }

    /// The provider was called and answered, with or without data.
    pub fn answered(&self, kind: ProviderKind) -> bool {
        self.reports
            .iter()
            .any(|r| r.kind == kind && (r.contributed || r.alert.is_none()))
    }

    pub fn contributed(&self, kind: ProviderKind) -> bool {
        self.reports.iter().any(|r| r.kind == kind && r.contributed)
    }

    pub fn any_contributed(&self) -> bool {
        self.reports.iter().any(|r| r.contributed)
    }

    /// Labels of every contributing provider, in `ProviderKind` order.
    pub fn sources(&self) -> Vec<String> {
        ProviderKind::ALL
            .iter()
            .filter(|kind| self.contributed(**kind))
            .map(|kind| kind.label().to_string())
            .collect()
    }

    pub fn alerts(&self) -> Vec<String> {
        self.reports.iter().filter_map(|r| r.alert.clone()).collect()
    }

    /// Weighted fraction of the configured providers that contributed.
    ///
    /// 0 when nothing contributed (or nothing is configured); monotonic in the
    /// set of contributing providers for a fixed configuration.
    pub fn fiability(&self, configured: &[ProviderKind]) -> f64 {
        let total: f64 = configured.iter().map(|k| k.weight()).sum();
        if total <= 0.0 {
            return 0.0;
        }
        let earned: f64 = configured
            .iter()
            .filter(|k| self.contributed(**k))
            .map(|k| k.weight())
            .sum();
        ((earned / total) * 1000.0).round() / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weights_sum_to_one() {
        let total: f64 = ProviderKind::ALL.iter().map(|k| k.weight()).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_authoritative_sources_weigh_more() {
        assert!(ProviderKind::Registry.weight() > ProviderKind::PriceReference.weight());
        assert!(ProviderKind::LegalAnnouncements.weight() > ProviderKind::Subsidies.weight());
    }

    #[test]
    fn test_fiability_zero_when_all_fail() {
        let mut ledger = SourceLedger::new();
        for kind in ProviderKind::ALL {
            ledger.record::<()>(kind, &ProviderOutcome::Error("down".into()));
        }
        assert_eq!(ledger.fiability(&ProviderKind::ALL), 0.0);
        assert!(ledger.sources().is_empty());
        assert_eq!(ledger.alerts().len(), ProviderKind::ALL.len());
    }

    #[test]
    fn test_fiability_increases_with_each_success() {
        let mut ledger = SourceLedger::new();
        let mut previous = ledger.fiability(&ProviderKind::ALL);
        for kind in ProviderKind::ALL {
            ledger.record(kind, &ProviderOutcome::Success(()));
            let current = ledger.fiability(&ProviderKind::ALL);
            assert!(current > previous, "{} did not raise fiability", kind);
            previous = current;
        }
        assert_eq!(previous, 1.0);
    }

    #[test]
    fn test_record_replaces_previous_report() {
        let mut ledger = SourceLedger::new();
        ledger.record::<()>(ProviderKind::Registry, &ProviderOutcome::Error("x".into()));
        ledger.record(ProviderKind::Registry, &ProviderOutcome::Success(()));
        assert!(ledger.alerts().is_empty());
        assert_eq!(ledger.reports().len(), 1);
    }

    #[test]
    fn test_answered_includes_empty_outcomes() {
        let mut ledger = SourceLedger::new();
        ledger.record::<()>(ProviderKind::Attestations, &ProviderOutcome::Empty);
        ledger.record::<()>(ProviderKind::Certification, &ProviderOutcome::Error("down".into()));
        ledger.skip(ProviderKind::LegalAnnouncements, "no identifier");

        assert!(ledger.answered(ProviderKind::Attestations));
        assert!(!ledger.contributed(ProviderKind::Attestations));
        assert!(!ledger.answered(ProviderKind::Certification));
        assert!(!ledger.answered(ProviderKind::LegalAnnouncements));
        assert!(!ledger.answered(ProviderKind::Registry));
        assert_eq!(
            ledger.called(),
            vec![ProviderKind::Attestations, ProviderKind::Certification]
        );
    }

    #[test]
    fn test_cache_key_normalization() {
        let query = CompanyQuery::new(None, Some("  Rénov'  Habitat  SARL ".into()));
        assert_eq!(query.cache_key().as_deref(), Some("name:rénov habitat sarl"));

        let id = BusinessIdentifier::from_siret("73282932000074").unwrap();
        let query = CompanyQuery::new(Some(id), Some("ignored".into()));
        assert_eq!(query.cache_key().as_deref(), Some("73282932000074"));

        assert_eq!(CompanyQuery::new(None, Some("   ".into())).cache_key(), None);
    }

    #[test]
    fn test_collective_proceeding_detection() {
        let announcement = LegalAnnouncement {
            id: "1".into(),
            published_at: None,
            kind: "Jugement de liquidation judiciaire".into(),
            family: None,
            court: None,
        };
        assert!(announcement.is_collective_proceeding());

        let sale = LegalAnnouncement {
            id: "2".into(),
            published_at: None,
            kind: "Vente et cession".into(),
            family: Some("Ventes".into()),
            court: None,
        };
        assert!(!sale.is_collective_proceeding());
    }
}
