//! In-memory collaborators for exercising the gateway without a network.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::auth::IdentityProvider;
use crate::db::Store;
use crate::document::Document;
use crate::error::GatewayError;
use crate::gateway::{Gateway, GatewaySettings};
use crate::inference::{InferenceProvider, ProviderError, RetryPolicy};
use crate::models::Identity;
use crate::storage::{BlobStore, DocumentFetcher};

pub const TEST_MODEL: &str = "gemini-2.5-flash";
pub const TEST_TOKEN: &str = "token-user-1";
pub const TEST_USER: &str = "user-1";

/// One scripted answer from the provider.
#[derive(Debug, Clone)]
pub enum Step {
    Reply(String),
    Overloaded,
    Status(u16, String),
}

/// Provider that plays back a fixed sequence of answers and counts calls.
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<Step>>,
    repeat: Option<Step>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            repeat: None,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Answer every call with the same step.
    pub fn always(step: Step) -> Self {
        Self {
            repeat: Some(step),
            ..Self::new(Vec::new())
        }
    }

    pub fn replying(text: &str) -> Self {
        Self::always(Step::Reply(text.to_string()))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl InferenceProvider for ScriptedProvider {
    fn model(&self) -> &str {
        TEST_MODEL
    }

    async fn generate(&self, prompt: &str, _document: &Document) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());

        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.repeat.clone())
            .unwrap_or_else(|| Step::Status(500, "script exhausted".to_string()));

        match step {
            Step::Reply(text) => Ok(text),
            Step::Overloaded => Err(ProviderError::from_status(503, "overloaded".to_string())),
            Step::Status(status, body) => Err(ProviderError::from_status(status, body)),
        }
    }
}

/// Blob store and fetcher in one: signed URLs point back into the same map.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, Document>>,
    fetches: AtomicUsize,
    signed: AtomicUsize,
    reject_uploads: AtomicBool,
    reject_signing: AtomicBool,
}

impl MemoryBlobStore {
    pub fn put(&self, bucket: &str, path: &str, document: Document) {
        self.objects
            .lock()
            .unwrap()
            .insert(format!("{bucket}/{path}"), document);
    }

    pub fn get(&self, bucket: &str, path: &str) -> Option<Document> {
        self.objects
            .lock()
            .unwrap()
            .get(&format!("{bucket}/{path}"))
            .cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    /// Make every later upload fail as if the storage service refused it.
    pub fn reject_uploads(&self) {
        self.reject_uploads.store(true, Ordering::SeqCst);
    }

    pub fn reject_signing(&self) {
        self.reject_signing.store(true, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn signed(&self) -> usize {
        self.signed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), GatewayError> {
        if self.reject_uploads.load(Ordering::SeqCst) {
            return Err(GatewayError::Storage(format!(
                "upload failed 503 Service Unavailable: {bucket}/{path}"
            )));
        }
        self.put(bucket, path, Document::new(bytes, Some(content_type)));
        Ok(())
    }

    async fn create_signed_url(
        &self,
        bucket: &str,
        path: &str,
        ttl: Duration,
    ) -> Result<String, GatewayError> {
        if self.reject_signing.load(Ordering::SeqCst) {
            return Err(GatewayError::Storage(format!(
                "could not sign {bucket}/{path}: 500 Internal Server Error"
            )));
        }
        if self.get(bucket, path).is_none() {
            return Err(GatewayError::Storage(format!("object not found: {bucket}/{path}")));
        }
        self.signed.fetch_add(1, Ordering::SeqCst);
        Ok(format!("memory://{bucket}/{path}?expires_in={}", ttl.as_secs()))
    }
}

#[async_trait]
impl DocumentFetcher for MemoryBlobStore {
    async fn fetch(&self, url: &str) -> Result<Document, GatewayError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        if let Some(rest) = url.strip_prefix("memory://") {
            let key = rest.split('?').next().unwrap_or(rest);
            return self
                .objects
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| GatewayError::Download("status 404".to_string()));
        }

        if url.contains("missing") {
            return Err(GatewayError::Download("status 404".to_string()));
        }
        Ok(Document::new(b"%PDF-1.7 external".to_vec(), None))
    }
}

/// Fixed token → identity table.
#[derive(Default)]
pub struct StaticIdentity {
    tokens: HashMap<String, Identity>,
}

impl StaticIdentity {
    pub fn with_user(mut self, token: &str, user_id: &str) -> Self {
        self.tokens.insert(
            token.to_string(),
            Identity {
                id: user_id.to_string(),
                email: Some(format!("{user_id}@example.com")),
            },
        );
        self
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn resolve(&self, token: &str) -> Option<Identity> {
        self.tokens.get(token).cloned()
    }
}

pub fn test_settings() -> GatewaySettings {
    GatewaySettings {
        retry: RetryPolicy {
            max_attempts: 3,
            overload_delay: Duration::from_millis(1),
        },
        ..GatewaySettings::default()
    }
}

/// A gateway over in-memory collaborators, with handles kept for assertions.
pub struct Harness {
    pub gateway: Arc<Gateway>,
    pub store: Arc<Store>,
    pub provider: Arc<ScriptedProvider>,
    pub blobs: Arc<MemoryBlobStore>,
}

impl Harness {
    pub fn new(provider: ScriptedProvider) -> Self {
        Self::with_settings(provider, test_settings())
    }

    pub fn with_settings(provider: ScriptedProvider, settings: GatewaySettings) -> Self {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let provider = Arc::new(provider);
        let blobs = Arc::new(MemoryBlobStore::default());
        let identity = Arc::new(StaticIdentity::default().with_user(TEST_TOKEN, TEST_USER));

        let gateway = Gateway::new(
            store.clone(),
            identity,
            blobs.clone(),
            blobs.clone(),
            provider.clone(),
            settings,
        );

        Self {
            gateway: Arc::new(gateway),
            store,
            provider,
            blobs,
        }
    }

    /// Place a PDF in the invoice bucket and return its path.
    pub fn stored_invoice(&self, path: &str) -> String {
        self.blobs
            .put("invoices", path, Document::new(b"%PDF-1.7 invoice".to_vec(), None));
        path.to_string()
    }

    pub fn stored_contract(&self, path: &str) -> String {
        self.blobs
            .put("contracts", path, Document::new(b"%PDF-1.7 contract".to_vec(), None));
        path.to_string()
    }
}

pub fn acme_invoice_json(confidence: f64) -> String {
    serde_json::json!({
        "vendor": "Acme Freight",
        "invoice_date": "2024-03-01",
        "total_amount": 1250.0,
        "currency": "USD",
        "confidence": confidence,
        "line_items": [
            { "description": "Linehaul", "qty": 1, "unit_price": 1000.0, "total": 1000.0 },
            { "description": "Fuel surcharge", "qty": 1, "unit_price": 250.0, "total": 250.0 }
        ],
        "audit_flags": []
    })
    .to_string()
}
