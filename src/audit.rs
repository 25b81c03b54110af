// src/audit.rs
//
// Deterministic checks run after the model has answered. These never rewrite
// what the model extracted; they only append advisory `audit_flags`.

use regex::Regex;

use crate::models::{AuditFlag, ContractRecord, ExtractedInvoice, LineItem};

/// Tolerance for comparing money amounts.
const CENT: f64 = 0.01;

/// Parse the first amount in a free-text price such as "$1,200.50", "USD 85"
/// or "5.00/kg". Returns `None` when no number is present or the number is a
/// percentage ("12% of base" is not a rate we can compare).
pub fn parse_amount(text: &str) -> Option<f64> {
    let re = Regex::new(r"-?\d[\d,]*(?:\.\d+)?").ok()?;
    let m = re.find(text)?;
    if text[m.end()..].trim_start().starts_with('%') {
        return None;
    }
    m.as_str().replace(',', "").parse::<f64>().ok()
}

/// Flag an invoice whose line items do not add up to its total.
pub fn reconcile_totals(invoice: &ExtractedInvoice) -> Option<AuditFlag> {
    if invoice.line_items.is_empty() {
        return None;
    }
    let sum: f64 = invoice.line_items.iter().map(line_amount).sum();
    // nothing priced at line level, so nothing to reconcile
    if sum.abs() <= CENT || (sum - invoice.total_amount).abs() <= CENT {
        return None;
    }
    Some(AuditFlag {
        item: "Invoice total".to_string(),
        issue: format!(
            "Line items sum to {sum:.2} but invoice total is {:.2}",
            invoice.total_amount
        ),
        severity: "low".to_string(),
    })
}

/// The line total, or `qty * unit_price` when the model left the total out.
fn line_amount(item: &LineItem) -> f64 {
    if item.total != 0.0 {
        item.total
    } else if item.qty != 0.0 {
        item.qty * item.unit_price
    } else {
        item.unit_price
    }
}

/// Compare line items against numeric rates from the vendor's stored contracts.
///
/// A rule applies when its vendor matches the invoice vendor and its item
/// description overlaps the line description (case-insensitive). Rules whose
/// `agreed_price` has no number are left to the model's own audit.
pub fn check_contract_rates(
    invoice: &ExtractedInvoice,
    contracts: &[ContractRecord],
) -> Vec<AuditFlag> {
    let vendor = invoice.vendor.to_lowercase();
    let matching = contracts
        .iter()
        .filter(|c| vendor_matches(&vendor, &c.vendor_name.to_lowercase()));

    let mut flags = Vec::new();
    for contract in matching {
        for rule in &contract.extracted_rules {
            let Some(rate) = parse_amount(&rule.agreed_price) else {
                continue;
            };
            let rule_desc = rule.item_description.to_lowercase();
            if rule_desc.trim().is_empty() {
                continue;
            }
            for item in &invoice.line_items {
                let item_desc = item.description.to_lowercase();
                if !descriptions_overlap(&item_desc, &rule_desc) {
                    continue;
                }
                if item.unit_price > rate + CENT {
                    flags.push(AuditFlag {
                        item: item.description.clone(),
                        issue: format!(
                            "Invoice price {:.2} > Contract rate {:.2}",
                            item.unit_price, rate
                        ),
                        severity: "high".to_string(),
                    });
                }
            }
        }
    }
    flags
}

/// Append local flags, skipping items the model already flagged.
pub fn apply(invoice: &mut ExtractedInvoice, contracts: &[ContractRecord]) -> usize {
    let mut added = 0;
    let mut candidates = check_contract_rates(invoice, contracts);
    candidates.extend(reconcile_totals(invoice));

    for flag in candidates {
        let already = invoice
            .audit_flags
            .iter()
            .any(|f| f.item.eq_ignore_ascii_case(&flag.item));
        if !already {
            invoice.audit_flags.push(flag);
            added += 1;
        }
    }
    added
}

fn vendor_matches(a: &str, b: &str) -> bool {
    let (a, b) = (a.trim(), b.trim());
    !a.is_empty() && !b.is_empty() && (a.contains(b) || b.contains(a))
}

fn descriptions_overlap(a: &str, b: &str) -> bool {
    let (a, b) = (a.trim(), b.trim());
    !a.is_empty() && (a.contains(b) || b.contains(a))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContractRule;
    use serde_json::json;

    fn invoice(vendor: &str, total: f64, items: &[(&str, f64, f64)]) -> ExtractedInvoice {
        ExtractedInvoice {
            vendor: vendor.to_string(),
            invoice_date: "2025-03-01".to_string(),
            total_amount: total,
            currency: "USD".to_string(),
            confidence: 0.9,
            line_items: items
                .iter()
                .map(|(d, unit, line)| LineItem {
                    description: d.to_string(),
                    qty: 1.0,
                    unit_price: *unit,
                    total: *line,
                })
                .collect(),
            audit_flags: Vec::new(),
        }
    }

    fn contract(vendor: &str, rules: &[(&str, &str)]) -> ContractRecord {
        ContractRecord {
            id: "c1".to_string(),
            user_id: "u1".to_string(),
            vendor_name: vendor.to_string(),
            extracted_rules: rules
                .iter()
                .map(|(d, p)| ContractRule {
                    item_description: d.to_string(),
                    agreed_price: p.to_string(),
                    condition: None,
                })
                .collect(),
            file_url: "u1/contract.pdf".to_string(),
            filename: None,
            created_at: "2025-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn test_parse_amount_variants() {
        assert_eq!(parse_amount("$1,200.50"), Some(1200.5));
        assert_eq!(parse_amount("USD 85"), Some(85.0));
        assert_eq!(parse_amount("5.00/kg"), Some(5.0));
        assert_eq!(parse_amount("flat rate"), None);
        assert_eq!(parse_amount("12% of base"), None);
    }

    #[test]
    fn test_matching_totals_are_not_flagged() {
        let inv = invoice("Acme Co", 250.0, &[("Freight", 250.0, 250.0)]);
        assert!(reconcile_totals(&inv).is_none());
    }

    #[test]
    fn test_total_mismatch_is_flagged_low() {
        let inv = invoice("Acme Co", 300.0, &[("Freight", 250.0, 250.0)]);
        let flag = reconcile_totals(&inv).unwrap();
        assert_eq!(flag.severity, "low");
        assert!(flag.issue.contains("250.00"));
    }

    #[test]
    fn test_missing_line_totals_fall_back_to_unit_price() {
        let raw = json!({
            "vendor": "Acme Co",
            "total_amount": 500.0,
            "line_items": [
                { "description": "Pallet", "qty": 4, "unit_price": 100.0 },
                { "description": "Fuel", "unit_price": 100.0 }
            ]
        });
        let inv: ExtractedInvoice = serde_json::from_value(raw).unwrap();
        assert!(reconcile_totals(&inv).is_none());

        let short = ExtractedInvoice {
            total_amount: 650.0,
            ..inv.clone()
        };
        let flag = reconcile_totals(&short).unwrap();
        assert!(flag.issue.contains("500.00"));
    }

    #[test]
    fn test_unpriced_lines_are_not_reconciled() {
        let inv = invoice("Acme Co", 250.0, &[("Freight", 0.0, 0.0), ("Fuel", 0.0, 0.0)]);
        assert!(reconcile_totals(&inv).is_none());
    }

    #[test]
    fn test_price_above_rate_is_flagged_high() {
        let inv = invoice(
            "Blue Line Freight Inc",
            112.0,
            &[("Pallet handling", 12.0, 12.0), ("Linehaul", 100.0, 100.0)],
        );
        let rules = vec![contract(
            "Blue Line Freight",
            &[("pallet handling", "$10.00 per pallet"), ("Linehaul", "market rate")],
        )];

        let flags = check_contract_rates(&inv, &rules);
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].item, "Pallet handling");
        assert_eq!(flags[0].severity, "high");
    }

    #[test]
    fn test_other_vendor_rules_ignored() {
        let inv = invoice("Acme Co", 12.0, &[("Pallet handling", 12.0, 12.0)]);
        let rules = vec![contract("Blue Line Freight", &[("Pallet handling", "10")])];
        assert!(check_contract_rates(&inv, &rules).is_empty());
    }

    #[test]
    fn test_apply_skips_items_model_already_flagged() {
        let mut inv = invoice("Blue Line Freight", 12.0, &[("Pallet handling", 12.0, 12.0)]);
        inv.audit_flags = serde_json::from_value(json!([
            {"item": "pallet handling", "issue": "Invoice price $12 > Contract rate $10", "severity": "high"}
        ]))
        .unwrap();
        let rules = vec![contract("Blue Line Freight", &[("Pallet handling", "10")])];

        assert_eq!(apply(&mut inv, &rules), 0);
        assert_eq!(inv.audit_flags.len(), 1);
    }
}
