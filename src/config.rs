use serde::Deserialize;
use std::{fs, path::Path};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0} env var required")]
    MissingSecret(&'static str),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Gateway configuration, loaded once at startup and shared read-only.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub database: DatabaseSection,
    pub supabase: SupabaseSection,
    pub storage: StorageSection,
    pub inference: InferenceSection,
    pub auth: AuthSection,
    pub quota: QuotaSection,
    pub review: ReviewSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// Body cap for `POST /upload`.
    pub max_upload_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8787,
            max_upload_bytes: 20 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub path: String,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: "data/gateway.db".to_string(),
        }
    }
}

/// Project endpoint shared by the storage and auth clients.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupabaseSection {
    pub url: String,
    pub request_timeout_secs: u64,
}

impl Default for SupabaseSection {
    fn default() -> Self {
        Self {
            url: "http://localhost:54321".to_string(),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub invoice_bucket: String,
    pub contract_bucket: String,
    pub signed_url_ttl_secs: u64,
    pub fetch_timeout_secs: u64,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            invoice_bucket: "invoices".to_string(),
            contract_bucket: "contracts".to_string(),
            signed_url_ttl_secs: 300,
            fetch_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    /// Google generative-language API (`generateContent`).
    Gemini,
    /// Any OpenAI-compatible `/chat/completions` endpoint.
    OpenAi,
    /// Local Ollama server speaking the OpenAI dialect; no key needed.
    Ollama,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InferenceSection {
    pub backend: InferenceBackend,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub overload_delay_ms: u64,
}

impl Default for InferenceSection {
    fn default() -> Self {
        Self {
            backend: InferenceBackend::Gemini,
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            model: "gemini-2.5-flash".to_string(),
            timeout_secs: 60,
            max_attempts: 3,
            overload_delay_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    /// Hard-auth when true: calls without a verifiable bearer token are rejected.
    /// Soft-auth when false: such calls run anonymously, without quota or persistence.
    pub require_authenticated_caller: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuotaSection {
    pub daily_limit: u32,
    pub daily_window_secs: i64,
    pub burst_limit: u32,
    pub burst_window_secs: i64,
}

impl Default for QuotaSection {
    fn default() -> Self {
        Self {
            daily_limit: 50,
            daily_window_secs: 86_400,
            burst_limit: 10,
            burst_window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReviewSection {
    /// Invoices with confidence strictly above this are auto-approved.
    pub auto_approve_threshold: f64,
    /// Append local audit flags (line-item sum, numeric contract rates).
    pub local_audit: bool,
}

impl Default for ReviewSection {
    fn default() -> Self {
        Self {
            auto_approve_threshold: 0.8,
            local_audit: true,
        }
    }
}

/// Credentials pulled from the environment, never from the config file.
#[derive(Clone)]
pub struct Secrets {
    pub inference_api_key: String,
    pub service_role_key: String,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets").finish_non_exhaustive()
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(content)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load `path` if it exists, otherwise fall back to built-in defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            info!(path = %path.display(), "Loading config file");
            Self::load(path)
        } else {
            info!(path = %path.display(), "Config file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Environment overrides for deployment-specific values.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("SUPABASE_URL") {
            self.supabase.url = url;
        }
        if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Ok(path) = std::env::var("DATABASE_PATH") {
            self.database.path = path;
        }
    }

    pub fn secrets(&self) -> Result<Secrets, ConfigError> {
        let inference_api_key = match self.inference.backend {
            InferenceBackend::Gemini => std::env::var("GEMINI_API_KEY")
                .map_err(|_| ConfigError::MissingSecret("GEMINI_API_KEY"))?,
            InferenceBackend::OpenAi => std::env::var("LLM_API_KEY")
                .map_err(|_| ConfigError::MissingSecret("LLM_API_KEY"))?,
            // required by the API shape but ignored by the server
            InferenceBackend::Ollama => "ollama".to_string(),
        };
        let service_role_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .map_err(|_| ConfigError::MissingSecret("SUPABASE_SERVICE_ROLE_KEY"))?;

        Ok(Secrets {
            inference_api_key,
            service_role_key,
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.inference.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "inference.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.review.auto_approve_threshold) {
            return Err(ConfigError::Invalid(
                "review.auto_approve_threshold must be within [0, 1]".to_string(),
            ));
        }
        if self.quota.daily_window_secs <= 0 || self.quota.burst_window_secs <= 0 {
            return Err(ConfigError::Invalid(
                "quota windows must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
