// src/models.rs

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::audit::parse_amount;

/// Which extraction template a document goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    #[default]
    Invoice,
    Contract,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Invoice => "invoice",
            DocumentType::Contract => "contract",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "invoice" => Ok(DocumentType::Invoice),
            "contract" => Ok(DocumentType::Contract),
            other => Err(format!("Unknown document type: {other}")),
        }
    }
}

/// Where the gateway should read the document from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentRef {
    /// Directly fetchable URL.
    Url(String),
    /// Object path inside the blob store; needs a signed URL first.
    StoragePath(String),
}

impl DocumentRef {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            None
        } else if raw.starts_with("http://") || raw.starts_with("https://") {
            Some(DocumentRef::Url(raw.to_string()))
        } else {
            Some(DocumentRef::StoragePath(raw.trim_start_matches('/').to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            DocumentRef::Url(s) | DocumentRef::StoragePath(s) => s,
        }
    }
}

/// One extraction call. Lives only for the duration of the request.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub document: DocumentRef,
    pub document_type: DocumentType,
    pub filename: Option<String>,
    pub bearer: Option<String>,
}

/// Caller resolved from a bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// A single invoice line item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    #[serde(default, deserialize_with = "lenient_string")]
    pub description: String,
    #[serde(default, alias = "quantity", deserialize_with = "lenient_f64")]
    pub qty: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub unit_price: f64,
    #[serde(
        default,
        alias = "amount",
        alias = "line_total",
        deserialize_with = "lenient_f64"
    )]
    pub total: f64,
}

/// A discrepancy between an invoice line and an agreed contract rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditFlag {
    #[serde(default, deserialize_with = "lenient_string")]
    pub item: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub issue: String,
    #[serde(default = "default_severity", deserialize_with = "lenient_string")]
    pub severity: String,
}

fn default_severity() -> String {
    "medium".to_string()
}

/// Structured data the model extracts from an invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedInvoice {
    #[serde(default, alias = "vendor_name", deserialize_with = "lenient_string")]
    pub vendor: String,
    #[serde(default, alias = "date", deserialize_with = "lenient_string")]
    pub invoice_date: String,
    #[serde(default, alias = "total", deserialize_with = "lenient_f64")]
    pub total_amount: f64,
    #[serde(default, deserialize_with = "lenient_string")]
    pub currency: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub confidence: f64,
    #[serde(default, deserialize_with = "lenient_vec")]
    pub line_items: Vec<LineItem>,
    #[serde(default, deserialize_with = "lenient_vec")]
    pub audit_flags: Vec<AuditFlag>,
}

impl ExtractedInvoice {
    /// Fill blanks and clamp values the model is known to get wrong.
    pub fn normalized(mut self) -> Self {
        self.vendor = self.vendor.trim().to_string();
        if self.vendor.is_empty() {
            self.vendor = "Unknown".to_string();
        }
        self.invoice_date = self.invoice_date.trim().to_string();
        self.currency = self.currency.trim().to_ascii_uppercase();
        if self.currency.is_empty() {
            self.currency = "USD".to_string();
        }
        self.confidence = if self.confidence.is_finite() {
            self.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if !self.total_amount.is_finite() {
            self.total_amount = 0.0;
        }
        self
    }

    /// How many scalar fields carry real data.
    pub fn coverage(&self) -> (usize, usize) {
        let total = 4;
        let filled = [
            self.vendor != "Unknown" && !self.vendor.is_empty(),
            !self.invoice_date.is_empty(),
            self.total_amount != 0.0,
            !self.currency.is_empty(),
        ]
        .iter()
        .filter(|&&v| v)
        .count();
        (filled, total)
    }
}

/// A single pricing rule from a carrier contract or rate card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractRule {
    #[serde(default, deserialize_with = "lenient_string")]
    pub item_description: String,
    /// Free text, e.g. "$5.00/kg" or "$100 flat".
    #[serde(default, deserialize_with = "lenient_string")]
    pub agreed_price: String,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedContractRules {
    #[serde(default, alias = "vendor", deserialize_with = "lenient_string")]
    pub vendor_name: String,
    #[serde(default, deserialize_with = "lenient_vec")]
    pub rules: Vec<ContractRule>,
}

impl ExtractedContractRules {
    pub fn normalized(mut self) -> Self {
        self.vendor_name = self.vendor_name.trim().to_string();
        if self.vendor_name.is_empty() {
            self.vendor_name = "Unknown Vendor".to_string();
        }
        self
    }
}

/// Normalized result of one extraction call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Extraction {
    Invoice(ExtractedInvoice),
    Contract(ExtractedContractRules),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceStatus {
    Review,
    Approved,
    Processing,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Review => "Review",
            InvoiceStatus::Approved => "Approved",
            InvoiceStatus::Processing => "Processing",
        }
    }

    /// Auto-approve only when the model is confident enough.
    pub fn for_confidence(confidence: f64, threshold: f64) -> Self {
        if confidence > threshold {
            InvoiceStatus::Approved
        } else {
            InvoiceStatus::Review
        }
    }
}

impl FromStr for InvoiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Review" => Ok(InvoiceStatus::Review),
            "Approved" => Ok(InvoiceStatus::Approved),
            "Processing" => Ok(InvoiceStatus::Processing),
            other => Err(format!("Unknown invoice status: {other}")),
        }
    }
}

/// Row in the `invoices` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub id: String,
    pub user_id: String,
    pub vendor: String,
    pub invoice_date: String,
    pub total_amount: f64,
    pub currency: String,
    pub status: InvoiceStatus,
    pub confidence: f64,
    /// Opaque JSON holding `line_items` and `audit_flags`.
    pub extracted_data: Value,
    pub file_url: String,
    pub filename: Option<String>,
    pub created_at: String,
}

/// Row in the `contracts` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractRecord {
    pub id: String,
    pub user_id: String,
    pub vendor_name: String,
    pub extracted_rules: Vec<ContractRule>,
    pub file_url: String,
    pub filename: Option<String>,
    pub created_at: String,
}

/// Row in the `ai_usage_logs` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub user_id: String,
    pub model: String,
    pub action: String,
    /// Unix milliseconds.
    pub created_at: i64,
}

/// What the gateway hands back to the caller on success.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ExtractionOutcome {
    Invoice(InvoiceRecord),
    Contract(ContractRecord),
    /// Anonymous caller, or the insert failed after a good extraction.
    Unsaved(Extraction),
}

// ---------------------------------------------------------------------------
// Lenient field decoders: the model is trusted, not strict.
// ---------------------------------------------------------------------------

fn number_from_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_amount(s),
        _ => None,
    }
}

fn string_from_value(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn lenient_f64<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    let value = Option::<Value>::deserialize(d)?;
    Ok(value.as_ref().and_then(number_from_value).unwrap_or(0.0))
}

fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    let value = Option::<Value>::deserialize(d)?;
    Ok(value.and_then(string_from_value).unwrap_or_default())
}

fn lenient_opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(d)?;
    Ok(value
        .and_then(string_from_value)
        .filter(|s| !s.trim().is_empty()))
}

/// `null` or a non-array becomes empty; entries that fail to decode are dropped.
fn lenient_vec<'de, D, T>(d: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: serde::de::DeserializeOwned,
{
    let value = Option::<Value>::deserialize(d)?;
    Ok(match value {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect(),
        _ => Vec::new(),
    })
}
