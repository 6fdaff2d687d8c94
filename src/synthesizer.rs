//! Final assembly of the per-request context.

use crate::aggregator::ReferenceSnapshot;
use crate::cache::CacheLookup;
use crate::models::{AggregatedContext, EntrepriseContext, ExtractionMethod, ExtractionResult};
use crate::providers::ProviderKind;
use crate::scorer::{self, QualitySignals};
use chrono::{DateTime, Utc};

pub const TEXT_GENERATION_SOURCE: &str = "Text generation (Claude)";
pub const DEFAULT_AI_SCORE_WEIGHT: f64 = 0.4;

/// Everything the synthesizer reads for one request.
pub struct SynthesisInput<'a> {
    pub extraction: Option<&'a ExtractionResult>,
    pub company: &'a CacheLookup,
    pub reference: &'a ReferenceSnapshot,
    pub work_categories: Vec<String>,
    pub required_certifications: Vec<String>,
    pub signals: QualitySignals,
    pub ai_score: Option<f64>,
    pub configured: &'a [ProviderKind],
    pub reference_version: &'a str,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct ContextSynthesizer {
    ai_weight: f64,
}

impl Default for ContextSynthesizer {
    fn default() -> Self {
        Self::new(DEFAULT_AI_SCORE_WEIGHT)
    }
}

impl ContextSynthesizer {
    pub fn new(ai_weight: f64) -> Self {
        Self {
            ai_weight: ai_weight.clamp(0.0, 1.0),
        }
    }

    pub fn ai_weight(&self) -> f64 {
        self.ai_weight
    }

    /// `ai * w + derived * (1 - w)`, rounded to one decimal. The derived
    /// score is returned unchanged when no estimate is supplied.
    pub fn blend(&self, ai_score: Option<f64>, derived: f64) -> f64 {
        match ai_score.filter(|s| s.is_finite()) {
            Some(ai) => {
                let ai = ai.clamp(0.0, 100.0);
                let blended = ai * self.ai_weight + derived * (1.0 - self.ai_weight);
                (blended * 10.0).round() / 10.0
            }
            None => derived,
        }
    }

    pub fn synthesize(&self, input: SynthesisInput<'_>) -> AggregatedContext {
        let snapshot = &input.company.snapshot;
        let today = input.now.date_naive();

        let mut ledger = snapshot.ledger.clone();
        ledger.merge(&input.reference.ledger);

        let mut sources = ledger.sources();
        if input
            .extraction
            .map(|e| e.success && e.extraction_method == ExtractionMethod::Generated)
            .unwrap_or(false)
        {
            sources.push(TEXT_GENERATION_SOURCE.to_string());
        }

        let alerts = scorer::risk_flags(
            snapshot
                .alerts(today, &input.required_certifications)
                .into_iter()
                .chain(input.reference.ledger.alerts()),
        );
        let quality_score = scorer::score(&input.signals);
        let risk_level = scorer::risk_level(&alerts);

        let extraction_name = input.extraction.and_then(|e| e.company_name.clone());
        let identifier = snapshot
            .identifier
            .clone()
            .or_else(|| input.extraction.and_then(|e| e.identifier.clone()));

        let entreprise = EntrepriseContext {
            siret: identifier
                .as_ref()
                .and_then(|i| i.siret().map(str::to_string)),
            siren: identifier.as_ref().map(|i| i.siren().to_string()),
            company_name: snapshot.company_name().or(extraction_name),
            legal_name: snapshot
                .legal_name()
                .or_else(|| input.extraction.and_then(|e| e.legal_name.clone())),
            identity: snapshot.registry.clone(),
            certifications: snapshot.certifications.clone(),
            legal_announcements: snapshot.announcements.clone(),
            attestations: snapshot.attestations.clone(),
            quality_score,
            entreprise_score: self.blend(input.ai_score, f64::from(quality_score)),
            risk_level,
            alerts,
            cached: input.company.cached,
            cache_age_seconds: input.company.cache_age_seconds,
        };

        AggregatedContext {
            entreprise,
            work_categories: input.work_categories,
            price_comparison: input.reference.prices.clone(),
            eligible_subsidies: input.reference.subsidies.clone(),
            knowledge_references: input.reference.knowledge.clone(),
            sources,
            fiability: ledger.fiability(input.configured),
            reference_version: input.reference_version.to_string(),
            generated_at: input.now,
        }
    }
}
