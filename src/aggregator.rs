//! Concurrent fan-out to the data providers.
//!
//! Every branch goes through [`guarded`], so a slow or failing provider only
//! removes its own contribution and adds an alert.

use crate::models::CompanyRecord;
use crate::providers::*;
use crate::scatter::guarded;
use crate::siret::BusinessIdentifier;
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Certifications expiring within this many days raise an alert.
const CERTIFICATION_EXPIRY_WARNING_DAYS: i64 = 60;
const RECENT_ENTITY_YEARS: f64 = 2.0;

/// Identity-keyed data for one company.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompanySnapshot {
    /// Identifier used for the fan-out (explicit or resolved by name).
    pub identifier: Option<BusinessIdentifier>,
    pub registry: Option<RegistryRecord>,
    pub certifications: Vec<Certification>,
    pub announcements: Vec<LegalAnnouncement>,
    pub attestations: Vec<Attestation>,
    pub ledger: SourceLedger,
    /// Notes added by the cache layer (stale record served, ...).
    pub notes: Vec<String>,
}

fn insert_payload<T: Serialize>(payloads: &mut BTreeMap<ProviderKind, Value>, kind: ProviderKind, data: &T) {
    match serde_json::to_value(data) {
        Ok(value) => {
            payloads.insert(kind, value);
        }
        Err(e) => tracing::warn!("Cannot serialize {} payload: {}", kind, e),
    }
}

fn read_payload<T: DeserializeOwned>(payloads: &BTreeMap<ProviderKind, Value>, kind: ProviderKind) -> Option<T> {
    let value = payloads.get(&kind)?;
    match serde_json::from_value(value.clone()) {
        Ok(data) => Some(data),
        Err(e) => {
            tracing::warn!("Cached {} payload does not decode: {}", kind, e);
            None
        }
    }
}

impl CompanySnapshot {
    /// At least one identity-keyed provider contributed.
    pub fn has_identity_data(&self) -> bool {
        ProviderKind::ALL
            .iter()
            .filter(|k| k.is_identity_keyed())
            .any(|k| self.ledger.contributed(*k))
    }

    pub fn company_name(&self) -> Option<String> {
        self.registry.as_ref().map(|r| r.name.clone())
    }

    pub fn legal_name(&self) -> Option<String> {
        self.registry.as_ref().and_then(|r| r.legal_name.clone())
    }

    /// Decoded payloads as persisted in the cache.
    ///
    /// A list provider that answered without data is stored as an empty list,
    /// so a cached record remembers which providers were consulted.
    pub fn payloads(&self) -> BTreeMap<ProviderKind, Value> {
        let mut payloads = BTreeMap::new();
        if let Some(registry) = &self.registry {
            insert_payload(&mut payloads, ProviderKind::Registry, registry);
        }
        if self.ledger.answered(ProviderKind::Certification) {
            insert_payload(&mut payloads, ProviderKind::Certification, &self.certifications);
        }
        if self.ledger.answered(ProviderKind::LegalAnnouncements) {
            insert_payload(&mut payloads, ProviderKind::LegalAnnouncements, &self.announcements);
        }
        if self.ledger.answered(ProviderKind::Attestations) {
            insert_payload(&mut payloads, ProviderKind::Attestations, &self.attestations);
        }
        payloads
    }

    /// Rebuilds a snapshot from a cached record. A stored empty list replays
    /// as an empty answer, any other payload as a contribution.
    pub fn from_record(record: &CompanyRecord) -> Self {
        let mut ledger = SourceLedger::new();
        for (kind, payload) in &record.payloads {
            match payload {
                Value::Array(items) if items.is_empty() => {
                    ledger.record::<()>(*kind, &ProviderOutcome::Empty)
                }
                _ => ledger.mark_contributed(*kind),
            }
        }
        Self {
            identifier: record.identifier(),
            registry: read_payload(&record.payloads, ProviderKind::Registry),
            certifications: read_payload(&record.payloads, ProviderKind::Certification)
                .unwrap_or_default(),
            announcements: read_payload(&record.payloads, ProviderKind::LegalAnnouncements)
                .unwrap_or_default(),
            attestations: read_payload(&record.payloads, ProviderKind::Attestations)
                .unwrap_or_default(),
            ledger,
            notes: Vec::new(),
        }
    }

    pub fn has_valid_certification(&self, today: NaiveDate) -> bool {
        self.certifications.iter().any(|c| c.is_valid_at(today))
    }

    pub fn has_valid_attestation(&self, today: NaiveDate) -> bool {
        self.attestations.iter().any(|a| a.is_valid_at(today))
    }

    pub fn has_valid_tax_attestation(&self, today: NaiveDate) -> bool {
        self.attestations
            .iter()
            .any(|a| a.kind == AttestationKind::Tax && a.is_valid_at(today))
    }

    /// Provider alerts, cache notes and domain alerts, in that order.
    ///
    /// `required_certifications` are lowercase fragments expected in the name
    /// of at least one valid certification.
    pub fn alerts(&self, today: NaiveDate, required_certifications: &[String]) -> Vec<String> {
        let mut alerts = self.ledger.alerts();
        alerts.extend(self.notes.iter().cloned());

        if let Some(registry) = &self.registry {
            if !registry.active {
                alerts.push("CRITICAL: entity not active in the company registry".to_string());
            }
            if let Some(age) = registry.age_years(today) {
                if age < RECENT_ENTITY_YEARS {
                    alerts.push(format!(
                        "WARNING: entity created very recently ({} months ago)",
                        (age * 12.0).floor() as i64
                    ));
                }
            }
        }

        let valid: Vec<&Certification> = self
            .certifications
            .iter()
            .filter(|c| c.is_valid_at(today))
            .collect();
        let expects_certification = !required_certifications.is_empty()
            || self
                .registry
                .as_ref()
                .map(|r| r.is_construction_trade())
                .unwrap_or(false);
        if valid.is_empty() && expects_certification && self.identifier.is_some() {
            alerts.push("WARNING: no valid certification found".to_string());
        } else if !valid.is_empty() && !required_certifications.is_empty() {
            let matches_required = valid.iter().any(|c| {
                let name = c.name.to_lowercase();
                required_certifications.iter().any(|req| name.contains(req.as_str()))
            });
            if !matches_required {
                alerts.push(format!(
                    "WARNING: no certification covers the planned work ({})",
                    required_certifications.join(", ")
                ));
            }
        }

        for cert in &self.certifications {
            let Some(until) = cert.valid_until else {
                continue;
            };
            let days_left = (until - today).num_days();
            if days_left < 0 {
                alerts.push(format!("WARNING: certification \"{}\" expired", cert.name));
            } else if days_left < CERTIFICATION_EXPIRY_WARNING_DAYS {
                alerts.push(format!(
                    "INFO: certification \"{}\" expires in {} days",
                    cert.name, days_left
                ));
            }
        }

        if let Some(proceeding) = self.announcements.iter().find(|a| a.is_collective_proceeding()) {
            alerts.push(format!(
                "CRITICAL: collective proceeding detected ({})",
                proceeding.kind
            ));
        }

        let attestations_called = self
            .ledger
            .reports()
            .iter()
            .any(|r| r.kind == ProviderKind::Attestations);
        if self.registry.is_some() && attestations_called && !self.has_valid_tax_attestation(today) {
            alerts.push("WARNING: no tax-compliance attestation found".to_string());
        }

        alerts
    }
}

/// Name-independent reference data for one request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceSnapshot {
    pub prices: Vec<PriceComparison>,
    pub subsidies: SubsidySummary,
    pub knowledge: Vec<KnowledgeReference>,
    pub ledger: SourceLedger,
}

async fn branch<T, Fut>(kind: ProviderKind, timeout: Duration, fut: Option<Fut>) -> Option<ProviderOutcome<T>>
where
    T: Send + 'static,
    Fut: Future<Output = ProviderOutcome<T>> + Send + 'static,
{
    match fut {
        Some(f) => Some(guarded(kind, timeout, f).await),
        None => None,
    }
}

/// Fans a query out to every configured provider.
#[derive(Clone)]
pub struct DataSourceAggregator {
    registry: Option<Arc<dyn RegistryLookup>>,
    premium_registry: Option<Arc<dyn RegistryLookup>>,
    certification: Option<Arc<dyn CertificationLookup>>,
    legal: Option<Arc<dyn LegalAnnouncementLookup>>,
    attestations: Option<Arc<dyn AttestationLookup>>,
    prices: Option<Arc<dyn PriceReferenceLookup>>,
    subsidies: Option<Arc<dyn SubsidyLookup>>,
    knowledge: Option<Arc<dyn KnowledgeSearch>>,
    timeout: Duration,
}

impl DataSourceAggregator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            registry: None,
            premium_registry: None,
            certification: None,
            legal: None,
            attestations: None,
            prices: None,
            subsidies: None,
            knowledge: None,
            timeout,
        }
    }

    pub fn with_registry(mut self, provider: Arc<dyn RegistryLookup>) -> Self {
        self.registry = Some(provider);
        self
    }

    /// Registry consulted only by [`Self::upgrade_registry`].
    pub fn with_premium_registry(mut self, provider: Arc<dyn RegistryLookup>) -> Self {
        self.premium_registry = Some(provider);
        self
    }

    pub fn has_premium_registry(&self) -> bool {
        self.premium_registry.is_some()
    }

    pub fn with_certification(mut self, provider: Arc<dyn CertificationLookup>) -> Self {
        self.certification = Some(provider);
        self
    }

    pub fn with_legal_announcements(mut self, provider: Arc<dyn LegalAnnouncementLookup>) -> Self {
        self.legal = Some(provider);
        self
    }

    pub fn with_attestations(mut self, provider: Arc<dyn AttestationLookup>) -> Self {
        self.attestations = Some(provider);
        self
    }

    pub fn with_price_reference(mut self, provider: Arc<dyn PriceReferenceLookup>) -> Self {
        self.prices = Some(provider);
        self
    }

    pub fn with_subsidies(mut self, provider: Arc<dyn SubsidyLookup>) -> Self {
        self.subsidies = Some(provider);
        self
    }

    pub fn with_knowledge(mut self, provider: Arc<dyn KnowledgeSearch>) -> Self {
        self.knowledge = Some(provider);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Providers taking part in the fiability score.
    pub fn configured(&self) -> Vec<ProviderKind> {
        let flags = [
            (ProviderKind::Registry, self.registry.is_some()),
            (ProviderKind::Certification, self.certification.is_some()),
            (ProviderKind::LegalAnnouncements, self.legal.is_some()),
            (ProviderKind::Attestations, self.attestations.is_some()),
            (ProviderKind::PriceReference, self.prices.is_some()),
            (ProviderKind::Subsidies, self.subsidies.is_some()),
            (ProviderKind::KnowledgeBase, self.knowledge.is_some()),
        ];
        flags
            .into_iter()
            .filter(|(_, configured)| *configured)
            .map(|(kind, _)| kind)
            .collect()
    }

    fn skip_identity_providers(&self, ledger: &mut SourceLedger, reason: &str, include_registry: bool) {
        for kind in self.configured() {
            if kind.is_identity_keyed() && (include_registry || kind != ProviderKind::Registry) {
                ledger.skip(kind, reason);
            }
        }
    }

    /// Queries the identity-keyed providers for one company.
    ///
    /// With only a name, the registry is searched first and the best match's
    /// identifier feeds the other providers.
    pub async fn fetch_company(&self, query: &CompanyQuery) -> CompanySnapshot {
        let mut snapshot = CompanySnapshot {
            identifier: query.identifier.clone(),
            ..Default::default()
        };

        if query.is_empty() {
            self.skip_identity_providers(&mut snapshot.ledger, "no identifier or company name", true);
            return snapshot;
        }

        if snapshot.identifier.is_none() {
            let registry_fut = self.registry.clone().map(|provider| {
                let q = query.clone();
                async move { provider.lookup(&q).await }
            });
            if let Some(outcome) = branch(ProviderKind::Registry, self.timeout, registry_fut).await {
                snapshot.ledger.record(ProviderKind::Registry, &outcome);
                if let Some(record) = outcome.success() {
                    snapshot.identifier = record
                        .siret
                        .as_deref()
                        .and_then(|s| BusinessIdentifier::from_siret(s).ok())
                        .or_else(|| BusinessIdentifier::from_siren(&record.siren).ok());
                    snapshot.registry = Some(record);
                }
            }

            let Some(identifier) = snapshot.identifier.clone() else {
                self.skip_identity_providers(&mut snapshot.ledger, "company could not be identified", false);
                return snapshot;
            };
            self.fan_out(&identifier, None, &mut snapshot).await;
            return snapshot;
        }

        let identifier = snapshot.identifier.clone();
        if let Some(identifier) = identifier {
            self.fan_out(&identifier, Some(query), &mut snapshot).await;
        }
        snapshot
    }

    /// Replaces the registry entry with the premium registry's one.
    ///
    /// Returns true when the premium registry answered with data. On any
    /// other outcome the snapshot is left untouched.
    pub async fn upgrade_registry(&self, snapshot: &mut CompanySnapshot) -> bool {
        let (Some(provider), Some(identifier)) =
            (self.premium_registry.clone(), snapshot.identifier.clone())
        else {
            return false;
        };
        let query = CompanyQuery::new(Some(identifier), snapshot.company_name());
        let outcome = guarded(ProviderKind::Registry, self.timeout, async move {
            provider.lookup(&query).await
        })
        .await;
        match outcome {
            ProviderOutcome::Success(record) => {
                snapshot.ledger.record(ProviderKind::Registry, &ProviderOutcome::Success(()));
                snapshot.registry = Some(record);
                true
            }
            other => {
                let reason = match other {
                    ProviderOutcome::Error(reason) => reason,
                    _ => "no data".to_string(),
                };
                tracing::warn!("Premium registry upgrade failed: {}", reason);
                false
            }
        }
    }

    /// Concurrent branch per provider. The registry runs only when
    /// `registry_query` is given.
    async fn fan_out(
        &self,
        identifier: &BusinessIdentifier,
        registry_query: Option<&CompanyQuery>,
        snapshot: &mut CompanySnapshot,
    ) {
        let registry_fut = registry_query.and_then(|q| {
            self.registry.clone().map(|provider| {
                let q = q.clone();
                async move { provider.lookup(&q).await }
            })
        });
        let certification_fut = self.certification.clone().map(|provider| {
            let id = identifier.clone();
            async move { provider.lookup(&id).await }
        });
        let legal_fut = self.legal.clone().map(|provider| {
            let siren = identifier.siren().to_string();
            async move { provider.lookup(&siren).await }
        });
        let attestations_fut = self.attestations.clone().map(|provider| {
            let siren = identifier.siren().to_string();
            async move { provider.lookup(&siren).await }
        });

        let (registry, certifications, announcements, attestations) = tokio::join!(
            branch(ProviderKind::Registry, self.timeout, registry_fut),
            branch(ProviderKind::Certification, self.timeout, certification_fut),
            branch(ProviderKind::LegalAnnouncements, self.timeout, legal_fut),
            branch(ProviderKind::Attestations, self.timeout, attestations_fut),
        );

        if let Some(outcome) = registry {
            snapshot.ledger.record(ProviderKind::Registry, &outcome);
            snapshot.registry = outcome.success();
        }
        if let Some(outcome) = certifications {
            snapshot.ledger.record(ProviderKind::Certification, &outcome);
            snapshot.certifications = outcome.success().unwrap_or_default();
        }
        if let Some(outcome) = announcements {
            snapshot.ledger.record(ProviderKind::LegalAnnouncements, &outcome);
            snapshot.announcements = outcome.success().unwrap_or_default();
        }
        if let Some(outcome) = attestations {
            snapshot.ledger.record(ProviderKind::Attestations, &outcome);
            snapshot.attestations = outcome.success().unwrap_or_default();
        }
    }

    /// Queries the name-independent providers.
    pub async fn fetch_reference(&self, query: &ReferenceQuery) -> ReferenceSnapshot {
        let prices_fut = self.prices.clone().map(|provider| {
            let q = query.clone();
            async move { provider.lookup(&q).await }
        });
        let subsidies_fut = self.subsidies.clone().map(|provider| {
            let q = query.clone();
            async move { provider.lookup(&q).await }
        });
        let knowledge_fut = self.knowledge.clone().map(|provider| {
            let q = query.clone();
            async move { provider.search(&q).await }
        });

        let (prices, subsidies, knowledge) = tokio::join!(
            branch(ProviderKind::PriceReference, self.timeout, prices_fut),
            branch(ProviderKind::Subsidies, self.timeout, subsidies_fut),
            branch(ProviderKind::KnowledgeBase, self.timeout, knowledge_fut),
        );

        let mut snapshot = ReferenceSnapshot::default();
        if let Some(outcome) = prices {
            snapshot.ledger.record(ProviderKind::PriceReference, &outcome);
            snapshot.prices = outcome.success().unwrap_or_default();
        }
        if let Some(outcome) = subsidies {
            snapshot.ledger.record(ProviderKind::Subsidies, &outcome);
            snapshot.subsidies = outcome.success().unwrap_or_default();
        }
        if let Some(outcome) = knowledge {
            snapshot.ledger.record(ProviderKind::KnowledgeBase, &outcome);
            snapshot.knowledge = outcome.success().unwrap_or_default();
        }
        snapshot
    }
}
