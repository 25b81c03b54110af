// src/normalize.rs

use serde::de::DeserializeOwned;

use crate::error::GatewayError;
use crate::models::{ExtractedContractRules, ExtractedInvoice};

/// Strip markdown code fences the model adds despite instructions, and trim.
pub fn strip_fences(text: &str) -> String {
    let cleaned = text
        .replace("```json", "")
        .replace("```JSON", "")
        .replace("```", "");
    cleaned.trim().to_string()
}

/// Extract the outermost JSON object from a string that may contain
/// surrounding text (e.g. reasoning the model prepended).
fn extract_json_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&s[start..=end])
}

/// Fence-strip and parse a completion. Failure keeps the raw text for diagnostics.
pub fn parse_completion<T: DeserializeOwned>(raw: &str) -> Result<T, GatewayError> {
    let cleaned = strip_fences(raw);
    let err = match serde_json::from_str(&cleaned) {
        Ok(parsed) => return Ok(parsed),
        Err(e) => e,
    };

    // retry on the outermost object when the model wrapped it in prose
    match extract_json_object(&cleaned) {
        Some(candidate) if candidate.len() < cleaned.len() => serde_json::from_str(candidate),
        _ => Err(err),
    }
    .map_err(|e| GatewayError::Parse {
        message: e.to_string(),
        raw: raw.to_string(),
    })
}

pub fn parse_invoice(raw: &str) -> Result<ExtractedInvoice, GatewayError> {
    parse_completion::<ExtractedInvoice>(raw).map(ExtractedInvoice::normalized)
}

pub fn parse_contract(raw: &str) -> Result<ExtractedContractRules, GatewayError> {
    parse_completion::<ExtractedContractRules>(raw).map(ExtractedContractRules::normalized)
}
