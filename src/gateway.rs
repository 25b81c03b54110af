//! The extraction gateway: identity → quota → document → model → parse → row.
//!
//! Every call is independent. The only shared effect between concurrent calls
//! is the usage ledger, and the quota check against it is best-effort.

use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::audit;
use crate::auth::{IdentityProvider, SupabaseAuth};
use crate::config::{Config, Secrets};
use crate::db::{self, Store};
use crate::document::Document;
use crate::error::{ExtractionFailure, GatewayError};
use crate::inference::{self, InferenceProvider, RetryPolicy};
use crate::models::{
    ContractRecord, DocumentRef, DocumentType, Extraction, ExtractionOutcome, ExtractionRequest,
    Identity, InvoiceRecord,
};
use crate::normalize;
use crate::prompt;
use crate::quota::{QuotaPolicy, unix_millis};
use crate::storage::{BlobStore, DocumentFetcher, HttpFetcher, SupabaseStorage};

/// Behavioural knobs, resolved from [`Config`] once at startup.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub require_authenticated_caller: bool,
    pub quota: QuotaPolicy,
    pub retry: RetryPolicy,
    pub invoice_bucket: String,
    pub contract_bucket: String,
    pub signed_url_ttl: Duration,
    pub auto_approve_threshold: f64,
    pub local_audit: bool,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for GatewaySettings {
    fn from(cfg: &Config) -> Self {
        Self {
            require_authenticated_caller: cfg.auth.require_authenticated_caller,
            quota: QuotaPolicy::from(&cfg.quota),
            retry: RetryPolicy::from(&cfg.inference),
            invoice_bucket: cfg.storage.invoice_bucket.clone(),
            contract_bucket: cfg.storage.contract_bucket.clone(),
            signed_url_ttl: Duration::from_secs(cfg.storage.signed_url_ttl_secs),
            auto_approve_threshold: cfg.review.auto_approve_threshold,
            local_audit: cfg.review.local_audit,
        }
    }
}

/// A file received directly by the gateway rather than referenced by path.
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
    pub document_type: DocumentType,
    pub bearer: Option<String>,
}

pub struct Gateway {
    store: Arc<Store>,
    identity: Arc<dyn IdentityProvider>,
    blobs: Arc<dyn BlobStore>,
    fetcher: Arc<dyn DocumentFetcher>,
    provider: Arc<dyn InferenceProvider>,
    settings: GatewaySettings,
}

impl Gateway {
    pub fn new(
        store: Arc<Store>,
        identity: Arc<dyn IdentityProvider>,
        blobs: Arc<dyn BlobStore>,
        fetcher: Arc<dyn DocumentFetcher>,
        provider: Arc<dyn InferenceProvider>,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            store,
            identity,
            blobs,
            fetcher,
            provider,
            settings,
        }
    }

    /// Wire up the HTTP-backed collaborators described by `cfg`.
    pub fn from_config(
        cfg: &Config,
        secrets: &Secrets,
        store: Arc<Store>,
    ) -> Result<Self, reqwest::Error> {
        let supabase = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.supabase.request_timeout_secs))
            .build()?;

        let identity = Arc::new(SupabaseAuth::new(
            supabase.clone(),
            &cfg.supabase.url,
            &secrets.service_role_key,
        ));
        let blobs = Arc::new(SupabaseStorage::new(
            supabase,
            &cfg.supabase.url,
            &secrets.service_role_key,
        ));
        let fetcher = Arc::new(HttpFetcher::new(Duration::from_secs(
            cfg.storage.fetch_timeout_secs,
        ))?);
        let provider = inference::build_provider(&cfg.inference, &secrets.inference_api_key)?;

        Ok(Self::new(
            store,
            identity,
            blobs,
            fetcher,
            provider,
            GatewaySettings::from(cfg),
        ))
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    /// Resolve the caller under the configured auth policy.
    ///
    /// Soft-auth turns a missing or unverifiable token into an anonymous
    /// caller; hard-auth rejects it.
    pub async fn identify(&self, bearer: Option<&str>) -> Result<Option<Identity>, GatewayError> {
        let resolved = match bearer {
            Some(token) => self.identity.resolve(token).await,
            None => None,
        };

        match resolved {
            Some(identity) => Ok(Some(identity)),
            None if self.settings.require_authenticated_caller => Err(GatewayError::Unauthorized),
            None => {
                debug!(token_present = bearer.is_some(), "Proceeding as anonymous caller");
                Ok(None)
            }
        }
    }

    /// Like [`identify`](Self::identify) but an identity is mandatory.
    pub async fn require_identity(&self, bearer: Option<&str>) -> Result<Identity, GatewayError> {
        let resolved = match bearer {
            Some(token) => self.identity.resolve(token).await,
            None => None,
        };
        resolved.ok_or(GatewayError::Unauthorized)
    }

    /// Extract a previously uploaded document.
    pub async fn process(
        &self,
        request: ExtractionRequest,
    ) -> Result<ExtractionOutcome, ExtractionFailure> {
        let span = info_span!(
            "extract",
            document_type = %request.document_type,
            reference = %request.document.as_str()
        );

        async move {
            let caller = self.identify(request.bearer.as_deref()).await?;
            self.charge(caller.as_ref(), request.document_type)?;
            self.run(
                caller,
                request.document,
                request.document_type,
                request.filename.as_deref(),
            )
            .await
        }
        .instrument(span)
        .await
    }

    /// Store an uploaded file in the blob store, then extract it.
    pub async fn upload_and_process(
        &self,
        upload: Upload,
    ) -> Result<ExtractionOutcome, ExtractionFailure> {
        let span = info_span!(
            "upload",
            document_type = %upload.document_type,
            filename = %upload.filename
        );

        async move {
            let caller = self.identify(upload.bearer.as_deref()).await?;
            self.charge(caller.as_ref(), upload.document_type)?;

            let owner = caller.as_ref().map(|c| c.id.as_str()).unwrap_or("anonymous");
            let path = format!(
                "{owner}/{}_{}",
                unix_millis(OffsetDateTime::now_utc()),
                safe_filename(&upload.filename)
            );
            let document = Document::new(upload.bytes, upload.content_type.as_deref());
            self.blobs
                .upload(
                    self.bucket_for(upload.document_type),
                    &path,
                    document.bytes,
                    &document.mime_type,
                )
                .await?;

            self.run(
                caller,
                DocumentRef::StoragePath(path),
                upload.document_type,
                Some(&upload.filename),
            )
            .await
        }
        .instrument(span)
        .await
    }

    pub async fn list_invoices(&self, bearer: Option<&str>) -> Result<Vec<InvoiceRecord>, GatewayError> {
        let owner = self.require_identity(bearer).await?;
        Ok(self.store.list_invoices(&owner.id)?)
    }

    pub async fn list_contracts(
        &self,
        bearer: Option<&str>,
    ) -> Result<Vec<ContractRecord>, GatewayError> {
        let owner = self.require_identity(bearer).await?;
        Ok(self.store.list_contracts(&owner.id)?)
    }

    /// Charge the caller one usage record, or reject on quota. Anonymous callers are free.
    fn charge(&self, caller: Option<&Identity>, document_type: DocumentType) -> Result<(), GatewayError> {
        let Some(user) = caller else {
            return Ok(());
        };
        self.settings.quota.charge(
            &self.store,
            &user.id,
            self.provider.model(),
            document_type.as_str(),
            OffsetDateTime::now_utc(),
        )
    }

    async fn run(
        &self,
        caller: Option<Identity>,
        document: DocumentRef,
        document_type: DocumentType,
        filename: Option<&str>,
    ) -> Result<ExtractionOutcome, ExtractionFailure> {
        info!(user = caller.as_ref().map(|c| c.id.as_str()).unwrap_or("anonymous"), "Processing document");

        let url = self.resolve_url(&document, document_type).await?;
        let file = self.fetcher.fetch(&url).await?;

        let contracts = match (&caller, document_type) {
            (Some(owner), DocumentType::Invoice) => self
                .store
                .contract_rules_for(&owner.id)
                .unwrap_or_else(|e| {
                    warn!(error = %e, "Could not load contract rules, auditing without them");
                    Vec::new()
                }),
            _ => Vec::new(),
        };

        let extraction = match self.extract(document_type, &file, &contracts).await {
            Ok(extraction) => extraction,
            Err(err) => {
                return Err(self.fallback(caller.as_ref(), document_type, &document, filename, err));
            }
        };

        Ok(self.persist(caller.as_ref(), extraction, &document, filename))
    }

    /// Storage paths are exchanged for a short-lived signed URL.
    async fn resolve_url(
        &self,
        document: &DocumentRef,
        document_type: DocumentType,
    ) -> Result<String, GatewayError> {
        match document {
            DocumentRef::Url(url) => Ok(url.clone()),
            DocumentRef::StoragePath(path) => {
                self.blobs
                    .create_signed_url(
                        self.bucket_for(document_type),
                        path,
                        self.settings.signed_url_ttl,
                    )
                    .await
            }
        }
    }

    async fn extract(
        &self,
        document_type: DocumentType,
        file: &Document,
        contracts: &[ContractRecord],
    ) -> Result<Extraction, GatewayError> {
        let prompt = prompt::build(document_type, contracts);
        info!(
            model = self.provider.model(),
            mime = %file.mime_type,
            known_contracts = contracts.len(),
            "Calling inference provider"
        );
        let raw =
            inference::generate_with_retry(self.provider.as_ref(), &self.settings.retry, &prompt, file)
                .await?;

        match document_type {
            DocumentType::Invoice => {
                let mut invoice = normalize::parse_invoice(&raw)?;
                if self.settings.local_audit {
                    let added = audit::apply(&mut invoice, contracts);
                    if added > 0 {
                        info!(added, "Local audit flags appended");
                    }
                }
                let (filled, total) = invoice.coverage();
                info!(
                    filled, total,
                    vendor = %invoice.vendor,
                    total_amount = invoice.total_amount,
                    confidence = invoice.confidence,
                    line_items = invoice.line_items.len(),
                    audit_flags = invoice.audit_flags.len(),
                    "Invoice extracted"
                );
                Ok(Extraction::Invoice(invoice))
            }
            DocumentType::Contract => {
                let rules = normalize::parse_contract(&raw)?;
                info!(vendor = %rules.vendor_name, rules = rules.rules.len(), "Contract extracted");
                Ok(Extraction::Contract(rules))
            }
        }
    }

    /// Insert the row for an identified caller. A failed insert still returns the data.
    fn persist(
        &self,
        caller: Option<&Identity>,
        extraction: Extraction,
        document: &DocumentRef,
        filename: Option<&str>,
    ) -> ExtractionOutcome {
        let Some(owner) = caller else {
            return ExtractionOutcome::Unsaved(extraction);
        };
        let now = OffsetDateTime::now_utc();

        match extraction {
            Extraction::Invoice(invoice) => {
                let row = db::invoice_row(
                    owner,
                    &invoice,
                    document.as_str(),
                    filename,
                    self.settings.auto_approve_threshold,
                    now,
                );
                match self.store.insert_invoice(&row) {
                    Ok(()) => ExtractionOutcome::Invoice(row),
                    Err(e) => {
                        // the blob stays in storage without a row
                        error!(error = %e, "Invoice insert failed, returning unsaved extraction");
                        ExtractionOutcome::Unsaved(Extraction::Invoice(invoice))
                    }
                }
            }
            Extraction::Contract(rules) => {
                let row = db::contract_row(owner, &rules, document.as_str(), filename, now);
                match self.store.insert_contract(&row) {
                    Ok(()) => ExtractionOutcome::Contract(row),
                    Err(e) => {
                        error!(error = %e, "Contract insert failed, returning unsaved extraction");
                        ExtractionOutcome::Unsaved(Extraction::Contract(rules))
                    }
                }
            }
        }
    }

    /// Leave a visible `Review` placeholder when an identified caller's invoice
    /// could not be extracted.
    fn fallback(
        &self,
        caller: Option<&Identity>,
        document_type: DocumentType,
        document: &DocumentRef,
        filename: Option<&str>,
        err: GatewayError,
    ) -> ExtractionFailure {
        let (Some(owner), DocumentType::Invoice, true) =
            (caller, document_type, err.is_extraction_failure())
        else {
            return err.into();
        };

        let row = db::placeholder_invoice_row(
            owner,
            document.as_str(),
            filename,
            OffsetDateTime::now_utc(),
        );
        match self.store.insert_invoice(&row) {
            Ok(()) => {
                warn!(id = %row.id, error = %err, "Extraction failed, placeholder recorded");
                ExtractionFailure {
                    error: err,
                    record_id: Some(row.id),
                }
            }
            Err(e) => {
                error!(error = %e, "Placeholder insert failed");
                err.into()
            }
        }
    }

    fn bucket_for(&self, document_type: DocumentType) -> &str {
        match document_type {
            DocumentType::Invoice => &self.settings.invoice_bucket,
            DocumentType::Contract => &self.settings.contract_bucket,
        }
    }
}

/// Reduce a client-supplied filename to a safe final path segment.
fn safe_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches(['.', '_']).is_empty() {
        "document".to_string()
    } else {
        cleaned
    }
}
