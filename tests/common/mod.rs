//! Shared provider doubles and fixtures for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use company_context_api::config::RefreshPolicy;
use company_context_api::models::WorkItem;
use company_context_api::providers::*;
use company_context_api::siret::BusinessIdentifier;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const SIRET: &str = "73282932000074";
pub const SIREN: &str = "732829320";
pub const OTHER_SIRET: &str = "55210055400013";

pub fn registry_record(siret: &str, name: &str) -> RegistryRecord {
    RegistryRecord {
        siren: siret[..9].to_string(),
        siret: Some(siret.to_string()),
        name: name.to_string(),
        legal_name: Some(format!("{} SAS", name)),
        address: Some("12 rue des Lilas 75011 Paris".to_string()),
        legal_form: Some("5710".to_string()),
        activity_code: Some("43.29A".to_string()),
        creation_date: NaiveDate::from_ymd_opt(2012, 3, 1),
        active: true,
        headcount_band: Some("11".to_string()),
        category: Some("PME".to_string()),
    }
}

pub fn rge_certification(name: &str) -> Certification {
    let today = Utc::now().date_naive();
    Certification {
        name: name.to_string(),
        organism: Some("Qualibat".to_string()),
        domain: Some("Isolation des murs et planchers bas".to_string()),
        valid_from: Some(today - ChronoDuration::days(200)),
        valid_until: Some(today + ChronoDuration::days(400)),
    }
}

pub fn isolation_items() -> Vec<WorkItem> {
    vec![
        WorkItem {
            description: "Isolation des combles perdus".to_string(),
            category: Some("isolation".to_string()),
            quantity: Some(80.0),
            unit: Some("m²".to_string()),
            unit_price: Some(32.0),
            total_price: Some(2560.0),
        },
        WorkItem {
            description: "Isolation thermique par l'intérieur des murs".to_string(),
            category: Some("isolation".to_string()),
            quantity: Some(40.0),
            unit: Some("m²".to_string()),
            unit_price: Some(65.0),
            total_price: Some(2600.0),
        },
    ]
}

/// Policy without inter-item delay.
pub fn fast_policy() -> RefreshPolicy {
    RefreshPolicy {
        batch_delay_ms: 0,
        ..Default::default()
    }
}

pub fn identifier(siret: &str) -> BusinessIdentifier {
    BusinessIdentifier::from_siret(siret).expect("valid fixture SIRET")
}

/// Registry double: answers with a fixed record (or an error) and counts calls.
pub struct CountingRegistry {
    record: Option<RegistryRecord>,
    failure: Option<String>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl CountingRegistry {
    pub fn returning(record: RegistryRecord) -> Arc<Self> {
        Arc::new(Self {
            record: Some(record),
            failure: None,
            delay: None,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing(reason: &str) -> Arc<Self> {
        Arc::new(Self {
            record: None,
            failure: Some(reason.to_string()),
            delay: None,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegistryLookup for CountingRegistry {
    async fn lookup(&self, _query: &CompanyQuery) -> ProviderOutcome<RegistryRecord> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = &self.failure {
            return ProviderOutcome::Error(reason.clone());
        }
        match &self.record {
            Some(record) => ProviderOutcome::Success(record.clone()),
            None => ProviderOutcome::Empty,
        }
    }
}

/// Certification double recording the identifiers it was asked about.
pub struct StaticCertifications {
    certifications: Vec<Certification>,
    seen: std::sync::Mutex<Vec<String>>,
}

impl StaticCertifications {
    pub fn new(certifications: Vec<Certification>) -> Arc<Self> {
        Arc::new(Self {
            certifications,
            seen: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CertificationLookup for StaticCertifications {
    async fn lookup(&self, identifier: &BusinessIdentifier) -> ProviderOutcome<Vec<Certification>> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(identifier.cache_key());
        }
        ProviderOutcome::from_list(self.certifications.clone())
    }
}

/// Legal-announcement double that answers after `delay`.
pub struct SlowAnnouncements {
    pub delay: Duration,
    pub announcements: Vec<LegalAnnouncement>,
}

#[async_trait]
impl LegalAnnouncementLookup for SlowAnnouncements {
    async fn lookup(&self, _siren: &str) -> ProviderOutcome<Vec<LegalAnnouncement>> {
        tokio::time::sleep(self.delay).await;
        ProviderOutcome::from_list(self.announcements.clone())
    }
}

pub struct FailingCertifications;

#[async_trait]
impl CertificationLookup for FailingCertifications {
    async fn lookup(&self, _identifier: &BusinessIdentifier) -> ProviderOutcome<Vec<Certification>> {
        ProviderOutcome::Error("HTTP 503".to_string())
    }
}

pub struct FailingAnnouncements;

#[async_trait]
impl LegalAnnouncementLookup for FailingAnnouncements {
    async fn lookup(&self, _siren: &str) -> ProviderOutcome<Vec<LegalAnnouncement>> {
        ProviderOutcome::Error("connection refused".to_string())
    }
}

pub struct PanickingAttestations;

#[async_trait]
impl AttestationLookup for PanickingAttestations {
    async fn lookup(&self, _siren: &str) -> ProviderOutcome<Vec<Attestation>> {
        panic!("decoder bug");
    }
}

/// Attestation provider that answers without any document.
pub struct EmptyAttestations;

#[async_trait]
impl AttestationLookup for EmptyAttestations {
    async fn lookup(&self, _siren: &str) -> ProviderOutcome<Vec<Attestation>> {
        ProviderOutcome::Empty
    }
}

/// Registry entry with only a name: scores low on quality.
pub fn sparse_registry_record(siret: &str, name: &str) -> RegistryRecord {
    RegistryRecord {
        legal_name: None,
        address: None,
        legal_form: None,
        creation_date: None,
        headcount_band: None,
        category: None,
        ..registry_record(siret, name)
    }
}
