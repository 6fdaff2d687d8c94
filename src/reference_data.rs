//! Versioned reference tables: work categories, market price bands, subsidy
//! rules, required certifications and technical references.
//!
//! Loaded once at startup (from `REFERENCE_TABLES_PATH` or the embedded
//! default) and shared read-only afterwards.

use crate::errors::AppError;
use crate::models::WorkItem;
use crate::providers::{
    normalize_name, KnowledgeReference, KnowledgeSearch, PriceComparison, PriceReferenceLookup,
    ProviderOutcome, ReferenceQuery, SubsidyEligibility, SubsidyLookup, SubsidySummary,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

const EMBEDDED_TABLES: &str = include_str!("../data/reference_tables.json");

/// Share of the declared total typically covered by aid.
const AID_BASE_RATE: f64 = 0.25;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceBand {
    pub label: String,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub unit: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryReference {
    pub keywords: Vec<String>,
    #[serde(default)]
    pub price_bands: Vec<PriceBand>,
    #[serde(default)]
    pub subsidies: Vec<String>,
    #[serde(default)]
    pub subsidy_conditions: Vec<String>,
    /// Lowercase fragments, one of which a certification name must contain.
    #[serde(default)]
    pub required_certifications: Vec<String>,
    #[serde(default)]
    pub technical_references: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceTables {
    pub version: String,
    pub effective_date: NaiveDate,
    #[serde(default)]
    pub general_subsidy_conditions: Vec<String>,
    pub categories: BTreeMap<String, CategoryReference>,
}

impl ReferenceTables {
    /// Tables compiled into the binary.
    pub fn embedded() -> Result<Self, AppError> {
        Self::parse(EMBEDDED_TABLES)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Configuration(format!(
                "cannot read reference tables {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&raw)
    }

    /// Loads `path` when given, the embedded tables otherwise.
    pub fn from_path(path: Option<&str>) -> Result<Self, AppError> {
        let tables = match path {
            Some(p) => Self::load(p)?,
            None => Self::embedded()?,
        };
        tracing::info!(
            "Reference tables {} (effective {}) loaded: {} categories",
            tables.version,
            tables.effective_date,
            tables.categories.len()
        );
        Ok(tables)
    }

    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let tables: ReferenceTables = serde_json::from_str(raw)
            .map_err(|e| AppError::Configuration(format!("invalid reference tables: {}", e)))?;
        tables.validate()?;
        Ok(tables)
    }

    fn validate(&self) -> Result<(), AppError> {
        for (name, category) in &self.categories {
            for band in &category.price_bands {
                if !(band.min > 0.0 && band.min <= band.avg && band.avg <= band.max) {
                    return Err(AppError::Configuration(format!(
                        "price band '{}' of '{}' must satisfy 0 < min <= avg <= max",
                        band.label, name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn category(&self, name: &str) -> Option<&CategoryReference> {
        self.categories.get(&name.to_lowercase())
    }

    /// Categories whose keywords appear as whole words in the document or in
    /// the work items. Explicit item categories are always included.
    pub fn detect_categories(&self, document: Option<&str>, items: &[WorkItem]) -> Vec<String> {
        let mut text = String::new();
        if let Some(doc) = document {
            text.push_str(doc);
        }
        for item in items {
            text.push(' ');
            text.push_str(&item.description);
        }
        let haystack = format!(" {} ", normalize_name(&text));

        let mut found: Vec<String> = Vec::new();
        for category in items
            .iter()
            .filter_map(|item| item.category.as_deref())
            .map(str::to_lowercase)
        {
            if self.categories.contains_key(&category) && !found.contains(&category) {
                found.push(category);
            }
        }

        for (name, category) in &self.categories {
            let matched = category.keywords.iter().any(|kw| {
                let needle = normalize_name(kw);
                !needle.is_empty() && haystack.contains(&format!(" {} ", needle))
            });
            if matched && !found.contains(name) {
                found.push(name.clone());
            }
        }
        found
    }

    pub fn required_certifications(&self, categories: &[String]) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for cert in categories
            .iter()
            .filter_map(|c| self.category(c))
            .flat_map(|c| c.required_certifications.iter())
        {
            if !out.contains(cert) {
                out.push(cert.clone());
            }
        }
        out
    }

    /// Compares a quote line to the closest price band of its category.
    ///
    /// Returns `None` when the line has no unit price or the category has no
    /// bands.
    pub fn compare_price(&self, item: &WorkItem, categories: &[String]) -> Option<PriceComparison> {
        let quoted = item.unit_price?;
        let category_name = item
            .category
            .as_deref()
            .map(str::to_lowercase)
            .filter(|c| self.categories.contains_key(c))
            .or_else(|| {
                self.detect_categories(None, std::slice::from_ref(item))
                    .into_iter()
                    .next()
            })
            .or_else(|| {
                categories
                    .iter()
                    .find(|c| self.category(c).map(|r| !r.price_bands.is_empty()).unwrap_or(false))
                    .cloned()
            })?;
        let category = self.category(&category_name)?;

        let same_unit: Vec<&PriceBand> = match item.unit.as_deref() {
            Some(unit) => category
                .price_bands
                .iter()
                .filter(|b| units_match(&b.unit, unit))
                .collect(),
            None => Vec::new(),
        };
        let candidates: Vec<&PriceBand> = if same_unit.is_empty() {
            category.price_bands.iter().collect()
        } else {
            same_unit
        };
        let band = candidates.into_iter().min_by(|a, b| {
            (a.avg - quoted)
                .abs()
                .partial_cmp(&(b.avg - quoted).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;

        Some(PriceComparison {
            item: item.description.clone(),
            category: Some(category_name),
            quoted_price: quoted,
            market_min: band.min,
            market_max: band.max,
            market_avg: band.avg,
            unit: Some(band.unit.clone()),
            deviation_pct: ((quoted - band.avg) / band.avg * 100.0).round() as i64,
            assessment: assess_price(quoted, band).to_string(),
        })
    }
}

fn units_match(band_unit: &str, item_unit: &str) -> bool {
    let canon = |u: &str| match u.trim().to_lowercase().as_str() {
        "m2" | "m²" | "metre carre" | "mètre carré" => "m2".to_string(),
        "u" | "un" | "unite" | "unité" | "pce" | "pièce" | "piece" => "unit".to_string(),
        other => other.to_string(),
    };
    canon(band_unit) == canon(item_unit)
}

/// Positions a unit price relative to a market band.
pub fn assess_price(price: f64, band: &PriceBand) -> &'static str {
    if price < band.min * 0.8 {
        "very low - check scope and quality"
    } else if price < band.min {
        "attractive"
    } else if price > band.max * 1.2 {
        "high - negotiation recommended"
    } else if price > band.max {
        "slightly high"
    } else {
        "in line with market"
    }
}

/// Price-reference provider backed by the reference tables.
pub struct TablePriceReference {
    tables: Arc<ReferenceTables>,
}

impl TablePriceReference {
    pub fn new(tables: Arc<ReferenceTables>) -> Self {
        Self { tables }
    }
}

#[async_trait]
impl PriceReferenceLookup for TablePriceReference {
    async fn lookup(&self, query: &ReferenceQuery) -> ProviderOutcome<Vec<PriceComparison>> {
        let comparisons = query
            .work_items
            .iter()
            .filter_map(|item| self.tables.compare_price(item, &query.categories))
            .collect();
        ProviderOutcome::from_list(comparisons)
    }
}

/// Subsidy-eligibility provider backed by the reference tables.
pub struct TableSubsidyRules {
    tables: Arc<ReferenceTables>,
}

impl TableSubsidyRules {
    pub fn new(tables: Arc<ReferenceTables>) -> Self {
        Self { tables }
    }
}

#[async_trait]
impl SubsidyLookup for TableSubsidyRules {
    async fn lookup(&self, query: &ReferenceQuery) -> ProviderOutcome<SubsidySummary> {
        let mut by_name: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut conditions: Vec<String> = Vec::new();

        for name in &query.categories {
            let Some(category) = self.tables.category(name) else {
                continue;
            };
            for subsidy in &category.subsidies {
                by_name.entry(subsidy.clone()).or_default().push(name.clone());
            }
            if !category.subsidies.is_empty() {
                for condition in &category.subsidy_conditions {
                    if !conditions.contains(condition) {
                        conditions.push(condition.clone());
                    }
                }
            }
        }

        if by_name.is_empty() {
            return ProviderOutcome::Empty;
        }

        let mut all_conditions = self.tables.general_subsidy_conditions.clone();
        all_conditions.extend(conditions);

        ProviderOutcome::Success(SubsidySummary {
            eligible: by_name
                .into_iter()
                .map(|(name, categories)| SubsidyEligibility { name, categories })
                .collect(),
            conditions: all_conditions,
            estimated_amount: query
                .declared_total
                .filter(|t| *t > 0.0)
                .map(|t| (t * AID_BASE_RATE).round()),
        })
    }
}

/// Technical references (DTU, standards) applicable to the detected
/// categories. Used when no knowledge-search endpoint is configured.
pub struct TableTechnicalReferences {
    tables: Arc<ReferenceTables>,
}

impl TableTechnicalReferences {
    pub fn new(tables: Arc<ReferenceTables>) -> Self {
        Self { tables }
    }
}

#[async_trait]
impl KnowledgeSearch for TableTechnicalReferences {
    async fn search(&self, query: &ReferenceQuery) -> ProviderOutcome<Vec<KnowledgeReference>> {
        let references = query
            .categories
            .iter()
            .filter_map(|name| self.tables.category(name).map(|c| (name, c)))
            .flat_map(|(name, category)| {
                category.technical_references.iter().map(move |reference| {
                    let (code, title) = match reference.split_once(" - ") {
                        Some((code, title)) => (Some(code.to_string()), title.to_string()),
                        None => (None, reference.clone()),
                    };
                    KnowledgeReference {
                        title,
                        code_reference: code,
                        category: Some(name.clone()),
                        similarity: 1.0,
                        excerpt: String::new(),
                    }
                })
            })
            .collect();
        ProviderOutcome::from_list(references)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> ReferenceTables {
        ReferenceTables::embedded().expect("embedded tables parse")
    }

    fn item(description: &str, unit_price: Option<f64>, unit: Option<&str>) -> WorkItem {
        WorkItem {
            description: description.to_string(),
            unit_price,
            unit: unit.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_embedded_tables_are_valid() {
        let tables = tables();
        assert!(!tables.version.is_empty());
        assert!(tables.categories.contains_key("isolation"));
    }

    #[test]
    fn test_invalid_band_rejected() {
        let raw = r#"{"version":"x","effectiveDate":"2024-01-01","categories":{
            "a":{"keywords":["a"],"priceBands":[{"label":"b","min":50,"max":10,"avg":20,"unit":"m²"}]}}}"#;
        assert!(matches!(
            ReferenceTables::parse(raw),
            Err(AppError::Configuration(_))
        ));
    }

    #[test]
    fn test_detect_categories_whole_words() {
        let tables = tables();
        let found = tables.detect_categories(
            Some("Installation d'une pompe à chaleur air/eau"),
            &[item("Isolation des combles perdus", None, None)],
        );
        assert!(found.contains(&"chauffage".to_string()));
        assert!(found.contains(&"isolation".to_string()));
        // "ite" must not match inside "quantité"
        let found = tables.detect_categories(Some("quantité totale"), &[]);
        assert!(found.is_empty());
    }

    #[test]
    fn test_detect_categories_lists_each_category_once() {
        let tables = tables();
        let mut first = item("Isolation des combles perdus", Some(32.0), Some("m²"));
        first.category = Some("isolation".into());
        let mut second = item("Isolation thermique des murs", Some(65.0), Some("m²"));
        second.category = Some("Isolation".into());

        let found = tables.detect_categories(None, &[first, second]);
        assert_eq!(found, vec!["isolation".to_string()]);
    }

    #[test]
    fn test_price_assessment_thresholds() {
        let band = PriceBand {
            label: "x".into(),
            min: 100.0,
            max: 200.0,
            avg: 150.0,
            unit: "m²".into(),
        };
        assert_eq!(assess_price(70.0, &band), "very low - check scope and quality");
        assert_eq!(assess_price(90.0, &band), "attractive");
        assert_eq!(assess_price(150.0, &band), "in line with market");
        assert_eq!(assess_price(220.0, &band), "slightly high");
        assert_eq!(assess_price(250.0, &band), "high - negotiation recommended");
    }

    #[test]
    fn test_compare_price_picks_closest_band() {
        let tables = tables();
        let comparison = tables
            .compare_price(&item("PAC air/air", Some(5500.0), Some("unité")), &["chauffage".into()])
            .unwrap();
        assert_eq!(comparison.market_avg, 5000.0);
        assert_eq!(comparison.deviation_pct, 10);
        assert!(tables
            .compare_price(&item("Peinture", None, None), &["chauffage".into()])
            .is_none());
    }

    #[tokio::test]
    async fn test_subsidies_union_and_estimate() {
        let provider = TableSubsidyRules::new(Arc::new(tables()));
        let query = ReferenceQuery {
            categories: vec!["isolation".into(), "chauffage".into()],
            work_items: vec![],
            declared_total: Some(20000.0),
        };
        let summary = provider.lookup(&query).await.success().unwrap();
        let cee = summary.eligible.iter().find(|s| s.name == "CEE").unwrap();
        assert_eq!(cee.categories.len(), 2);
        assert_eq!(summary.estimated_amount, Some(5000.0));
        assert!(summary.conditions.iter().any(|c| c.contains("RGE")));

        let none = ReferenceQuery {
            categories: vec!["plomberie".into()],
            ..Default::default()
        };
        assert_eq!(provider.lookup(&none).await, ProviderOutcome::Empty);
    }
}
