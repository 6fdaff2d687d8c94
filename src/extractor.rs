//! Identifier extraction from free-text documents.
//!
//! Layered strategies, cheapest first: regex patterns validated by checksum,
//! then an optional text-generation fallback, then a name-only heuristic.

use crate::ai_client::TextGeneration;
use crate::models::{ExtractionMethod, ExtractionResult};
use crate::siret::{unformat, BusinessIdentifier};
use regex::Regex;
use serde::Deserialize;
use std::sync::{Arc, LazyLock};

/// Generation prompts only see the start of the document.
pub const MAX_GENERATION_CHARS: usize = 3000;

const CONFIDENCE_MERGED: u8 = 90;
const CONFIDENCE_PATTERN: u8 = 85;
const CONFIDENCE_GENERATED_DEFAULT: u8 = 70;
const CONFIDENCE_NAME_ONLY: u8 = 40;

const GROUPED: &str = r"[0-9]{3}[ \t-]?[0-9]{3}[ \t-]?[0-9]{3}[ \t-]?[0-9]{5}";

static LABELLED_GROUPED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)SIRET[ \t:.]*({})(?:[^0-9]|$)", GROUPED)).expect("valid regex")
});

static BARE_GROUPED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?m)(?:^|\s)({})(?:\s|$)", GROUPED)).expect("valid regex")
});

static LABELLED_COMPACT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)SIRET[ \t:.]*([0-9]{14})(?:[^0-9]|$)").expect("valid regex")
});

static BARE_COMPACT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^0-9])([0-9]{14})(?:[^0-9]|$)").expect("valid regex"));

static SIREN_NIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)SIREN[ \t:.]*([0-9]{3}[ \t-]?[0-9]{3}[ \t-]?[0-9]{3})(?:[^0-9]).{0,50}?NIC[ \t:.]*([0-9]{5})",
    )
    .expect("valid regex")
});

const NAME_START: &str = "[A-ZÀ-ÖØ-Þ]";
const NAME_BODY: &str = r"[A-Za-zÀ-ÖØ-öø-ÿ&'. \t-]";

static NAME_LABELLED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i:Raison sociale|Entreprise|Société|Societe|Company)[ \t]*:?[ \t]*({}{}{{2,80}})",
        NAME_START, NAME_BODY
    ))
    .expect("valid regex")
});

static NAME_BEFORE_SIRET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"({}{}{{2,80}})[ \t]*(?:\r?\n|,|-)?[ \t]*(?i:SIRET)",
        NAME_START, NAME_BODY
    ))
    .expect("valid regex")
});

static NAME_LEGAL_FORM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"({}{}{{2,60}}?[ \t](?:SELARL|SELAFA|SELAS|SASU|SARL|EURL|EIRL|SAS|SCI|SA|EI))\b",
        NAME_START, NAME_BODY
    ))
    .expect("valid regex")
});

static NAME_STOPLIST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(Monsieur|Madame|Mme|Client|Devis|Date|Total|Montant|Page|Facture)\b")
        .expect("valid regex")
});

static IDENTIFIER_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(SIRET|SIREN|TVA)\b").expect("valid regex"));

const GENERATION_SYSTEM_PROMPT: &str = "You extract the issuing company of French business \
documents (quotes, invoices). A SIRET has exactly 14 digits and passes the Luhn check; the SIREN \
is its first 9 digits. Reply ONLY with a JSON object, no additional text.";

/// Identifier candidates found by the regex layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatternExtraction {
    pub identifier: Option<BusinessIdentifier>,
    pub diagnostics: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeneratedFields {
    siret: Option<String>,
    company_name: Option<String>,
    legal_name: Option<String>,
    address: Option<String>,
    confidence: Option<f64>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Trims a captured name and cuts it before any trailing identifier label.
fn clean_name(raw: &str) -> Option<String> {
    let line = raw.lines().next().unwrap_or_default();
    let cut = match IDENTIFIER_WORD.find(line) {
        Some(m) => &line[..m.start()],
        None => line,
    };
    let name = cut
        .trim()
        .trim_end_matches(|c: char| c == '-' || c == ',' || c == ':' || c.is_whitespace())
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if name.chars().count() < 3 || NAME_STOPLIST.is_match(&name) {
        return None;
    }
    Some(name)
}

pub struct IdentifierExtractor {
    generator: Option<Arc<dyn TextGeneration>>,
}

impl IdentifierExtractor {
    /// Pattern and name heuristics only.
    pub fn new() -> Self {
        Self { generator: None }
    }

    pub fn with_generator(generator: Arc<dyn TextGeneration>) -> Self {
        Self {
            generator: Some(generator),
        }
    }

    pub fn has_generator(&self) -> bool {
        self.generator.is_some()
    }

    /// Runs every pattern in order and keeps the first checksum-valid SIRET.
    pub fn extract_by_pattern(text: &str) -> PatternExtraction {
        let mut candidates: Vec<String> = Vec::new();

        for regex in [
            &*LABELLED_GROUPED,
            &*BARE_GROUPED,
            &*LABELLED_COMPACT,
            &*BARE_COMPACT,
        ] {
            for caps in regex.captures_iter(text) {
                if let Some(m) = caps.get(1) {
                    candidates.push(unformat(m.as_str()));
                }
            }
        }
        for caps in SIREN_NIC.captures_iter(text) {
            if let (Some(siren), Some(nic)) = (caps.get(1), caps.get(2)) {
                candidates.push(format!("{}{}", unformat(siren.as_str()), nic.as_str()));
            }
        }

        let mut diagnostics = Vec::new();
        let mut valid: Vec<BusinessIdentifier> = Vec::new();
        for candidate in candidates {
            match BusinessIdentifier::from_siret(&candidate) {
                Ok(id) => {
                    if !valid.contains(&id) {
                        valid.push(id);
                    }
                }
                Err(e) => {
                    let note = format!("rejected candidate {}: {}", candidate, e);
                    if !diagnostics.contains(&note) {
                        diagnostics.push(note);
                    }
                }
            }
        }

        if valid.len() > 1 {
            diagnostics.push(format!(
                "ambiguous: {} distinct valid identifiers found, kept the first",
                valid.len()
            ));
        }

        PatternExtraction {
            identifier: valid.into_iter().next(),
            diagnostics,
        }
    }

    /// Company-name heuristics, in priority order.
    pub fn extract_name(text: &str) -> Option<String> {
        [&*NAME_LABELLED, &*NAME_BEFORE_SIRET, &*NAME_LEGAL_FORM]
            .into_iter()
            .find_map(|regex| {
                regex
                    .captures_iter(text)
                    .filter_map(|caps| caps.get(1))
                    .find_map(|m| clean_name(m.as_str()))
            })
    }

    /// Labelled patterns only: the first valid SIRET after a `SIRET` label.
    pub fn quick_extract(text: &str) -> Option<BusinessIdentifier> {
        [&*LABELLED_GROUPED, &*LABELLED_COMPACT]
            .into_iter()
            .flat_map(|regex| regex.captures_iter(text))
            .filter_map(|caps| caps.get(1))
            .find_map(|m| BusinessIdentifier::from_siret(m.as_str()).ok())
    }

    /// Generative fallback. Any returned identifier is re-validated.
    ///
    /// Returns a result with `method=failed` when no generator is configured,
    /// when the call fails, or when the identifier is missing or invalid.
    pub async fn extract_by_generation(&self, text: &str) -> ExtractionResult {
        let Some(generator) = &self.generator else {
            return ExtractionResult::failed(vec!["no text generation configured".to_string()]);
        };

        let excerpt: String = text.chars().take(MAX_GENERATION_CHARS).collect();
        let prompt = format!(
            "Extract the issuing company from the following document:\n\n{}\n\n\
             Return a JSON object with this structure:\n\
             {{\"siret\": \"12345678900012\", \"companyName\": \"Trade name\", \
             \"legalName\": \"Full legal name\", \"address\": \"Full address\", \"confidence\": 90}}\n\
             Use null for any field you cannot find and lower the confidence.",
            excerpt
        );

        let response = match generator.generate(&prompt, GENERATION_SYSTEM_PROMPT).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("Generative extraction failed: {}", e);
                return ExtractionResult::failed(vec![format!("generation failed: {}", e)]);
            }
        };

        let fields = match parse_generated(&response) {
            Some(fields) => fields,
            None => {
                return ExtractionResult::failed(vec![
                    "generation returned no parsable JSON object".to_string()
                ])
            }
        };

        let Some(raw_siret) = non_empty(fields.siret) else {
            return ExtractionResult::failed(vec!["generation returned no identifier".to_string()]);
        };

        match BusinessIdentifier::from_siret(&raw_siret) {
            Ok(identifier) => ExtractionResult {
                success: true,
                identifier: Some(identifier),
                company_name: non_empty(fields.company_name),
                legal_name: non_empty(fields.legal_name),
                address: non_empty(fields.address),
                extraction_method: ExtractionMethod::Generated,
                confidence: fields
                    .confidence
                    .map(|c| c.clamp(0.0, 100.0).round() as u8)
                    .unwrap_or(CONFIDENCE_GENERATED_DEFAULT),
                diagnostics: vec![],
            },
            Err(e) => ExtractionResult::failed(vec![format!(
                "generation returned an invalid identifier: {}",
                e
            )]),
        }
    }

    /// Full resolution policy: pattern, then generation, then name only.
    pub async fn resolve(&self, text: &str) -> ExtractionResult {
        let pattern = Self::extract_by_pattern(text);
        let mut diagnostics = pattern.diagnostics;

        if let Some(identifier) = pattern.identifier {
            let company_name = Self::extract_name(text);
            let (method, confidence) = if company_name.is_some() {
                (ExtractionMethod::Merged, CONFIDENCE_MERGED)
            } else {
                (ExtractionMethod::Pattern, CONFIDENCE_PATTERN)
            };
            return ExtractionResult {
                success: true,
                identifier: Some(identifier),
                company_name,
                legal_name: None,
                address: None,
                extraction_method: method,
                confidence,
                diagnostics,
            };
        }

        if self.generator.is_some() {
            let generated = self.extract_by_generation(text).await;
            if generated.success {
                diagnostics.extend(generated.diagnostics);
                return ExtractionResult {
                    diagnostics,
                    ..generated
                };
            }
            diagnostics.extend(generated.diagnostics);
        }

        if let Some(name) = Self::extract_name(text) {
            diagnostics.push("identifier missing: only a company name was found".to_string());
            return ExtractionResult {
                success: false,
                identifier: None,
                company_name: Some(name),
                legal_name: None,
                address: None,
                extraction_method: ExtractionMethod::Pattern,
                confidence: CONFIDENCE_NAME_ONLY,
                diagnostics,
            };
        }

        diagnostics.push("no identifier or company name found".to_string());
        ExtractionResult::failed(diagnostics)
    }
}

impl Default for IdentifierExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses the JSON object between the first `{` and the last `}`.
fn parse_generated(response: &str) -> Option<GeneratedFields> {
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&response[start..=end]).ok()
}
