//! SIRET / SIREN validation and formatting.
//!
//! A SIRET is the 14-digit establishment identifier: the 9-digit SIREN of the
//! legal entity followed by a 5-digit NIC. Both numbers carry a Luhn checksum
//! and are validated independently.

use crate::errors::AppError;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const SIRET_LEN: usize = 14;
pub const SIREN_LEN: usize = 9;

/// Luhn checksum over an all-digit string.
///
/// Returns false for empty input or any non-digit character.
pub fn validate_checksum(digits: &str) -> bool {
    if digits.is_empty() {
        return false;
    }

    let mut sum = 0u32;
    for (i, c) in digits.chars().rev().enumerate() {
        let Some(mut digit) = c.to_digit(10) else {
            return false;
        };
        if i % 2 == 1 {
            digit *= 2;
            if digit > 9 {
                digit -= 9;
            }
        }
        sum += digit;
    }

    sum % 10 == 0
}

/// Strips the separators allowed in printed identifiers (spaces and dashes).
pub fn unformat(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect()
}

fn is_valid_of_len(raw: &str, len: usize) -> bool {
    let cleaned = unformat(raw);
    cleaned.len() == len
        && cleaned.chars().all(|c| c.is_ascii_digit())
        && validate_checksum(&cleaned)
}

/// 14 digits (after removing spaces/dashes) with a valid Luhn checksum.
pub fn is_valid_siret(raw: &str) -> bool {
    is_valid_of_len(raw, SIRET_LEN)
}

/// 9 digits (after removing spaces/dashes) with a valid Luhn checksum.
pub fn is_valid_siren(raw: &str) -> bool {
    is_valid_of_len(raw, SIREN_LEN)
}

/// First nine digits of a SIRET.
pub fn extract_siren_from_siret(siret: &str) -> String {
    unformat(siret).chars().take(SIREN_LEN).collect()
}

/// `123 456 789 00012`. Input that is not 14 digits is returned unchanged.
pub fn format_siret(siret: &str) -> String {
    let cleaned = unformat(siret);
    if cleaned.len() != SIRET_LEN || !cleaned.is_ascii() {
        return siret.to_string();
    }
    format!(
        "{} {} {} {}",
        &cleaned[0..3],
        &cleaned[3..6],
        &cleaned[6..9],
        &cleaned[9..14]
    )
}

/// `123 456 789`. Input that is not 9 digits is returned unchanged.
pub fn format_siren(siren: &str) -> String {
    let cleaned = unformat(siren);
    if cleaned.len() != SIREN_LEN || !cleaned.is_ascii() {
        return siren.to_string();
    }
    format!("{} {} {}", &cleaned[0..3], &cleaned[3..6], &cleaned[6..9])
}

/// A validated national business identifier.
///
/// Invariant: `siren` is Luhn-valid and, when `siret` is present, `siret` is
/// Luhn-valid and starts with `siren`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BusinessIdentifier {
    siret: Option<String>,
    siren: String,
}

impl BusinessIdentifier {
    /// Builds an identifier from a SIRET, checking both checksums.
    pub fn from_siret(raw: &str) -> Result<Self, AppError> {
        let siret = unformat(raw);
        if siret.len() != SIRET_LEN || !siret.chars().all(|c| c.is_ascii_digit()) {
            return Err(AppError::Validation(format!(
                "SIRET must be {} digits, got '{}'",
                SIRET_LEN, raw
            )));
        }
        if !validate_checksum(&siret) {
            return Err(AppError::Validation(format!(
                "SIRET checksum invalid: {}",
                siret
            )));
        }
        let siren = extract_siren_from_siret(&siret);
        if !validate_checksum(&siren) {
            return Err(AppError::Validation(format!(
                "SIREN checksum invalid for SIRET {}",
                siret
            )));
        }
        Ok(Self {
            siret: Some(siret),
            siren,
        })
    }

    /// Builds an entity-level identifier from a SIREN alone.
    pub fn from_siren(raw: &str) -> Result<Self, AppError> {
        let siren = unformat(raw);
        if !is_valid_siren(&siren) {
            return Err(AppError::Validation(format!("invalid SIREN: '{}'", raw)));
        }
        Ok(Self { siret: None, siren })
    }

    /// Accepts either a 14-digit SIRET or a 9-digit SIREN.
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        match unformat(raw).len() {
            SIRET_LEN => Self::from_siret(raw),
            SIREN_LEN => Self::from_siren(raw),
            _ => Err(AppError::Validation(format!(
                "identifier must be a 14-digit SIRET or 9-digit SIREN, got '{}'",
                raw
            ))),
        }
    }

    pub fn siret(&self) -> Option<&str> {
        self.siret.as_deref()
    }

    pub fn siren(&self) -> &str {
        &self.siren
    }

    /// Normalized cache key: the SIRET digits, else `siren:<digits>`.
    pub fn cache_key(&self) -> String {
        match &self.siret {
            Some(siret) => siret.clone(),
            None => format!("siren:{}", self.siren),
        }
    }
}

impl fmt::Display for BusinessIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.siret {
            Some(siret) => write!(f, "{}", format_siret(siret)),
            None => write!(f, "{}", format_siren(&self.siren)),
        }
    }
}
