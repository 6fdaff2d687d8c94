//! Quality score and risk tags derived from aggregated signals. Pure functions.

use crate::aggregator::CompanySnapshot;
use crate::models::{RiskLevel, WorkItem};
use chrono::NaiveDate;

pub const CERTIFICATION_POINTS: f64 = 25.0;
pub const ATTESTATION_POINTS: f64 = 20.0;
pub const LEGAL_STRUCTURE_POINTS: f64 = 15.0;
pub const MAX_AGE_POINTS: f64 = 25.0;
pub const AGE_POINTS_PER_YEAR: f64 = 2.5;
pub const LOTS_POINTS: f64 = 15.0;

/// No single lot may weigh more than this share of the total.
const MAX_LOT_SHARE: f64 = 0.8;
/// Allowed gap between the declared total and the sum of lots.
const DECLARED_TOTAL_TOLERANCE: f64 = 0.05;

/// Positive signals feeding the quality score.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QualitySignals {
    pub valid_certification: bool,
    pub valid_attestation: bool,
    pub legal_structure: bool,
    pub age_years: Option<f64>,
    pub lots_consistent: bool,
}

impl QualitySignals {
    /// Company signals only. Lot consistency is request-specific.
    pub fn from_snapshot(snapshot: &CompanySnapshot, today: NaiveDate) -> Self {
        Self {
            valid_certification: snapshot.has_valid_certification(today),
            valid_attestation: snapshot.has_valid_attestation(today),
            legal_structure: snapshot
                .registry
                .as_ref()
                .map(|r| r.legal_form.is_some())
                .unwrap_or(false),
            age_years: snapshot.registry.as_ref().and_then(|r| r.age_years(today)),
            lots_consistent: false,
        }
    }

    pub fn with_lots(mut self, items: &[WorkItem], declared_total: Option<f64>) -> Self {
        self.lots_consistent = lots_consistent(items, declared_total);
        self
    }
}

/// Weighted sum of the signals, 0-100.
///
/// Every contribution is non-negative, so adding a signal never lowers the
/// score.
pub fn score(signals: &QualitySignals) -> u8 {
    let mut total = 0.0;
    if signals.valid_certification {
        total += CERTIFICATION_POINTS;
    }
    if signals.valid_attestation {
        total += ATTESTATION_POINTS;
    }
    if signals.legal_structure {
        total += LEGAL_STRUCTURE_POINTS;
    }
    if let Some(years) = signals.age_years {
        total += (years.max(0.0) * AGE_POINTS_PER_YEAR).min(MAX_AGE_POINTS);
    }
    if signals.lots_consistent {
        total += LOTS_POINTS;
    }
    total.clamp(0.0, 100.0).round() as u8
}

/// All lot totals positive, no lot above 80% of the sum, and the declared
/// total (when present) within 5% of the sum.
pub fn lots_consistent(items: &[WorkItem], declared_total: Option<f64>) -> bool {
    if items.is_empty() {
        return false;
    }
    let totals: Option<Vec<f64>> = items.iter().map(|i| i.line_total()).collect();
    let Some(totals) = totals else {
        return false;
    };
    if totals.iter().any(|t| !(*t > 0.0)) {
        return false;
    }
    let sum: f64 = totals.iter().sum();
    if totals.iter().any(|t| t / sum > MAX_LOT_SHARE) {
        return false;
    }
    match declared_total {
        Some(declared) => declared > 0.0 && ((declared - sum).abs() / sum) <= DECLARED_TOTAL_TOLERANCE,
        None => true,
    }
}

/// Deduplicated alert strings, first occurrence kept.
pub fn risk_flags<I>(alerts: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut flags: Vec<String> = Vec::new();
    for alert in alerts {
        if !flags.contains(&alert) {
            flags.push(alert);
        }
    }
    flags
}

fn is_critical(flag: &str) -> bool {
    flag.starts_with("CRITICAL") || flag.starts_with("CRITIQUE")
}

fn is_warning(flag: &str) -> bool {
    flag.starts_with("WARNING") || flag.starts_with("ATTENTION")
}

/// Any critical flag is critical; three or more warnings are high.
pub fn risk_level(flags: &[String]) -> RiskLevel {
    if flags.iter().any(|f| is_critical(f)) {
        return RiskLevel::Critical;
    }
    match flags.iter().filter(|f| is_warning(f)).count() {
        0 => RiskLevel::Low,
        1 | 2 => RiskLevel::Medium,
        _ => RiskLevel::High,
    }
}
