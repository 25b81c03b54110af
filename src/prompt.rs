// src/prompt.rs

use serde::Serialize;

use crate::models::{ContractRecord, ContractRule, DocumentType};

/// The prompt template that instructs the model to extract structured invoice data.
pub const INVOICE_PROMPT: &str = r#"You are a freight invoice data extraction assistant.
Analyze the attached invoice document and extract all data.

Return ONLY valid JSON in this exact format:
{
  "vendor": "Company Name",
  "invoice_date": "YYYY-MM-DD",
  "total_amount": 0.00,
  "currency": "USD",
  "confidence": 0.95,
  "line_items": [
    {
      "description": "Item",
      "qty": 1,
      "unit_price": 0.00,
      "total": 0.00
    }
  ],
  "audit_flags": []
}

Notes:
- "total_amount", "qty", "unit_price" and "total" are numbers, not strings.
- "currency" is a 3-letter ISO code.
- "confidence" is your confidence in the extraction, between 0 and 1."#;

/// The prompt template for carrier contracts and rate cards.
pub const CONTRACT_PROMPT: &str = r#"You are a freight contract analysis assistant.
Analyze the attached "master agreement" or "rate card" document.
Extract the vendor name and the pricing rules.

Return ONLY valid JSON in this exact format:
{
  "vendor_name": "Vendor Name found in contract",
  "rules": [
    {
      "item_description": "Description of item/service (e.g. Shipping 0-5kg)",
      "agreed_price": "Price or Rate (e.g. $5.00/kg or $100 flat)",
      "condition": "Any conditions (optional)"
    }
  ]
}"#;

const NO_AUDIT_CONTEXT: &str =
    r#""audit_flags" must be an empty array since no contract context was provided."#;

const JSON_ONLY: &str =
    "Only return the JSON object. Do not include markdown formatting like ```json or any explanation.";

#[derive(Serialize)]
struct RuleContext<'a> {
    vendor_name: &'a str,
    rules: &'a [ContractRule],
}

/// Build the instruction text for one extraction call.
pub fn build(document_type: DocumentType, known_contracts: &[ContractRecord]) -> String {
    match document_type {
        DocumentType::Contract => format!("{CONTRACT_PROMPT}\n\n{JSON_ONLY}"),
        DocumentType::Invoice => invoice_prompt(known_contracts),
    }
}

/// Invoice template, extended with an audit instruction when rules are known.
///
/// The rate comparison itself is left to the model; the rules are embedded as
/// JSON context.
pub fn invoice_prompt(known_contracts: &[ContractRecord]) -> String {
    let context: Vec<RuleContext<'_>> = known_contracts
        .iter()
        .filter(|c| !c.extracted_rules.is_empty())
        .map(|c| RuleContext {
            vendor_name: &c.vendor_name,
            rules: &c.extracted_rules,
        })
        .collect();

    let audit = if context.is_empty() {
        NO_AUDIT_CONTEXT.to_string()
    } else {
        // serializing plain strings cannot fail
        let rules_json = serde_json::to_string(&context).unwrap_or_else(|_| "[]".to_string());
        format!(
            r#"AUDIT INSTRUCTION:
Here is a list of known "Contract Rules" for various vendors:
{rules_json}

1. Identify the vendor of this invoice.
2. Check if that vendor exists in the "Contract Rules" list above.
3. If a match is found, compare each invoice line item's unit price against the agreed contract rate.
4. If a unit price is higher than the agreed rate, or if there is an unknown fee, add an entry to "audit_flags".

Format for audit_flags: {{ "item": "Item Name", "issue": "Detected Discrepancy (e.g. Invoice price $12 > Contract rate $10)", "severity": "high" }}"#
        )
    };

    format!("{INVOICE_PROMPT}\n\n{audit}\n\n{JSON_ONLY}")
}
