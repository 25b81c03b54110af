use rusqlite::{Connection, OptionalExtension, Result as SqliteResult, Row, params};
use rusqlite::types::Type;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};
use tracing::{info, warn};

use crate::models::{
    ContractRecord, ExtractedContractRules, ExtractedInvoice, Identity, InvoiceRecord,
    InvoiceStatus, UsageRecord,
};
use crate::quota::unix_millis;

/// SQLite-backed store for invoices, contracts and the usage ledger.
///
/// The connection is guarded by a mutex that is only held for the duration of
/// a single statement, never across an `.await`.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database file and ensure the schema exists.
    pub fn open<P: AsRef<Path>>(db_path: P) -> SqliteResult<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    warn!(dir = %parent.display(), error = %e, "Could not create database directory");
                }
            }
        }
        Self::init(Connection::open(db_path)?)
    }

    pub fn open_in_memory() -> SqliteResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> SqliteResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS invoices (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                vendor TEXT NOT NULL,
                invoice_date TEXT NOT NULL,
                total_amount REAL NOT NULL DEFAULT 0,
                currency TEXT NOT NULL DEFAULT 'USD',
                status TEXT NOT NULL DEFAULT 'Review',
                confidence REAL NOT NULL DEFAULT 0,
                extracted_data TEXT NOT NULL DEFAULT '{}',
                file_url TEXT NOT NULL,
                filename TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS contracts (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                vendor_name TEXT NOT NULL,
                extracted_rules TEXT NOT NULL DEFAULT '[]',
                file_url TEXT NOT NULL,
                filename TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ai_usage_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                model TEXT NOT NULL,
                action TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_invoices_user ON invoices(user_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_contracts_user ON contracts(user_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_usage_user_time ON ai_usage_logs(user_id, created_at);",
        )?;

        info!("Database initialized successfully");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // a panic mid-statement leaves SQLite itself consistent
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Generate a unique row ID from owner, document reference and creation instant
    pub fn generate_uid(user_id: &str, file_ref: &str, created_at: &OffsetDateTime) -> String {
        let mut hasher = Sha256::new();
        hasher.update(user_id.as_bytes());
        hasher.update(file_ref.as_bytes());
        hasher.update(created_at.unix_timestamp_nanos().to_le_bytes());
        format!("{:x}", hasher.finalize())
    }

    // -----------------------------------------------------------------------
    // Usage ledger
    // -----------------------------------------------------------------------

    /// Append one usage record. The ledger is never updated or pruned here.
    pub fn record_usage(&self, record: &UsageRecord) -> SqliteResult<()> {
        self.conn().execute(
            "INSERT INTO ai_usage_logs (user_id, model, action, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![record.user_id, record.model, record.action, record.created_at],
        )?;
        Ok(())
    }

    /// Count usage records for `user_id` at or after `since`.
    pub fn count_usage_since(&self, user_id: &str, since: OffsetDateTime) -> SqliteResult<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM ai_usage_logs WHERE user_id = ?1 AND created_at >= ?2",
            params![user_id, unix_millis(since)],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    // -----------------------------------------------------------------------
    // Invoices
    // -----------------------------------------------------------------------

    pub fn insert_invoice(&self, invoice: &InvoiceRecord) -> SqliteResult<()> {
        self.conn().execute(
            "INSERT INTO invoices
                (id, user_id, vendor, invoice_date, total_amount, currency, status,
                 confidence, extracted_data, file_url, filename, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                invoice.id,
                invoice.user_id,
                invoice.vendor,
                invoice.invoice_date,
                invoice.total_amount,
                invoice.currency,
                invoice.status.as_str(),
                invoice.confidence,
                invoice.extracted_data.to_string(),
                invoice.file_url,
                invoice.filename,
                invoice.created_at,
            ],
        )?;
        info!(id = %invoice.id, status = invoice.status.as_str(), "Invoice stored");
        Ok(())
    }

    pub fn get_invoice(&self, id: &str) -> SqliteResult<Option<InvoiceRecord>> {
        self.conn()
            .query_row(
                "SELECT id, user_id, vendor, invoice_date, total_amount, currency, status,
                        confidence, extracted_data, file_url, filename, created_at
                 FROM invoices
                 WHERE id = ?1",
                params![id],
                Self::row_to_invoice,
            )
            .optional()
    }

    /// All invoices owned by `user_id`, newest first.
    pub fn list_invoices(&self, user_id: &str) -> SqliteResult<Vec<InvoiceRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, vendor, invoice_date, total_amount, currency, status,
                    confidence, extracted_data, file_url, filename, created_at
             FROM invoices
             WHERE user_id = ?1
             ORDER BY created_at DESC, rowid DESC",
        )?;
        let rows = stmt.query_map(params![user_id], Self::row_to_invoice)?;
        rows.collect()
    }

    /// Helper: map a row with the 12-column invoice projection to `InvoiceRecord`.
    fn row_to_invoice(row: &Row<'_>) -> SqliteResult<InvoiceRecord> {
        let status: String = row.get(6)?;
        let extracted: String = row.get(8)?;
        Ok(InvoiceRecord {
            id: row.get(0)?,
            user_id: row.get(1)?,
            vendor: row.get(2)?,
            invoice_date: row.get(3)?,
            total_amount: row.get(4)?,
            currency: row.get(5)?,
            status: status
                .parse()
                .map_err(|e: String| conversion_error(6, e.into()))?,
            confidence: row.get(7)?,
            extracted_data: serde_json::from_str(&extracted)
                .map_err(|e| conversion_error(8, Box::new(e)))?,
            file_url: row.get(9)?,
            filename: row.get(10)?,
            created_at: row.get(11)?,
        })
    }

    // -----------------------------------------------------------------------
    // Contracts
    // -----------------------------------------------------------------------

    pub fn insert_contract(&self, contract: &ContractRecord) -> SqliteResult<()> {
        let rules = serde_json::to_string(&contract.extracted_rules)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        self.conn().execute(
            "INSERT INTO contracts
                (id, user_id, vendor_name, extracted_rules, file_url, filename, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                contract.id,
                contract.user_id,
                contract.vendor_name,
                rules,
                contract.file_url,
                contract.filename,
                contract.created_at,
            ],
        )?;
        info!(
            id = %contract.id,
            vendor = %contract.vendor_name,
            rules = contract.extracted_rules.len(),
            "Contract stored"
        );
        Ok(())
    }

    /// All contracts owned by `user_id`, newest first.
    pub fn list_contracts(&self, user_id: &str) -> SqliteResult<Vec<ContractRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, vendor_name, extracted_rules, file_url, filename, created_at
             FROM contracts
             WHERE user_id = ?1
             ORDER BY created_at DESC, rowid DESC",
        )?;
        let rows = stmt.query_map(params![user_id], Self::row_to_contract)?;
        rows.collect()
    }

    /// Contracts that carry at least one rule, used as invoice audit context.
    pub fn contract_rules_for(&self, user_id: &str) -> SqliteResult<Vec<ContractRecord>> {
        Ok(self
            .list_contracts(user_id)?
            .into_iter()
            .filter(|c| !c.extracted_rules.is_empty())
            .collect())
    }

    fn row_to_contract(row: &Row<'_>) -> SqliteResult<ContractRecord> {
        let rules: String = row.get(3)?;
        Ok(ContractRecord {
            id: row.get(0)?,
            user_id: row.get(1)?,
            vendor_name: row.get(2)?,
            extracted_rules: serde_json::from_str(&rules)
                .map_err(|e| conversion_error(3, Box::new(e)))?,
            file_url: row.get(4)?,
            filename: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    /// Get row counts for (invoices, contracts, usage records)
    pub fn get_counts(&self) -> SqliteResult<(usize, usize, usize)> {
        let conn = self.conn();
        let invoices: usize = conn.query_row("SELECT COUNT(*) FROM invoices", [], |row| row.get(0))?;
        let contracts: usize =
            conn.query_row("SELECT COUNT(*) FROM contracts", [], |row| row.get(0))?;
        let usage: usize =
            conn.query_row("SELECT COUNT(*) FROM ai_usage_logs", [], |row| row.get(0))?;
        Ok((invoices, contracts, usage))
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> SqliteResult<()> {
        self.conn().execute_batch(sql)
    }
}

fn conversion_error(
    column: usize,
    err: Box<dyn std::error::Error + Send + Sync + 'static>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, err)
}

/// UTC with fixed millisecond precision, so text order is chronological order.
const TIMESTAMP: &[BorrowedFormatItem<'_>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z");

fn timestamp(at: &OffsetDateTime) -> String {
    at.to_offset(UtcOffset::UTC)
        .format(TIMESTAMP)
        .unwrap_or_else(|_| unix_millis(*at).to_string())
}

fn calendar_date(at: &OffsetDateTime) -> String {
    let date = at.date();
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

// ---------------------------------------------------------------------------
// Extraction → row mapping. Field-name translation lives only here.
// ---------------------------------------------------------------------------

/// Map a normalized invoice extraction onto the canonical `invoices` row.
pub fn invoice_row(
    owner: &Identity,
    invoice: &ExtractedInvoice,
    file_url: &str,
    filename: Option<&str>,
    auto_approve_threshold: f64,
    now: OffsetDateTime,
) -> InvoiceRecord {
    let invoice_date = if invoice.invoice_date.is_empty() {
        calendar_date(&now)
    } else {
        invoice.invoice_date.clone()
    };

    InvoiceRecord {
        id: Store::generate_uid(&owner.id, file_url, &now),
        user_id: owner.id.clone(),
        vendor: invoice.vendor.clone(),
        invoice_date,
        total_amount: invoice.total_amount,
        currency: invoice.currency.clone(),
        status: InvoiceStatus::for_confidence(invoice.confidence, auto_approve_threshold),
        confidence: invoice.confidence,
        extracted_data: serde_json::json!({
            "line_items": invoice.line_items,
            "audit_flags": invoice.audit_flags,
        }),
        file_url: file_url.to_string(),
        filename: filename.map(str::to_string),
        created_at: timestamp(&now),
    }
}

/// Minimal row recorded when extraction fails, so the upload stays visible.
pub fn placeholder_invoice_row(
    owner: &Identity,
    file_url: &str,
    filename: Option<&str>,
    now: OffsetDateTime,
) -> InvoiceRecord {
    InvoiceRecord {
        id: Store::generate_uid(&owner.id, file_url, &now),
        user_id: owner.id.clone(),
        vendor: "Unknown".to_string(),
        invoice_date: calendar_date(&now),
        total_amount: 0.0,
        currency: "USD".to_string(),
        status: InvoiceStatus::Review,
        confidence: 0.0,
        extracted_data: serde_json::json!({}),
        file_url: file_url.to_string(),
        filename: filename.map(str::to_string),
        created_at: timestamp(&now),
    }
}

pub fn contract_row(
    owner: &Identity,
    contract: &ExtractedContractRules,
    file_url: &str,
    filename: Option<&str>,
    now: OffsetDateTime,
) -> ContractRecord {
    ContractRecord {
        id: Store::generate_uid(&owner.id, file_url, &now),
        user_id: owner.id.clone(),
        vendor_name: contract.vendor_name.clone(),
        extracted_rules: contract.rules.clone(),
        file_url: file_url.to_string(),
        filename: filename.map(str::to_string),
        created_at: timestamp(&now),
    }
}
