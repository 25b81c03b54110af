//! Blob store and document acquisition.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::document::Document;
use crate::error::GatewayError;

/// Object storage holding uploaded documents under per-user paths.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), GatewayError>;

    /// Short-lived URL a plain GET can retrieve the object from.
    async fn create_signed_url(
        &self,
        bucket: &str,
        path: &str,
        ttl: Duration,
    ) -> Result<String, GatewayError>;
}

/// Retrieves the bytes behind a URL.
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Document, GatewayError>;
}

/// Supabase Storage REST client, authenticated with the service-role key.
pub struct SupabaseStorage {
    client: Client,
    base_url: String,
    service_key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignRequest {
    expires_in: u64,
}

#[derive(Deserialize)]
struct SignResponse {
    #[serde(rename = "signedURL", alias = "signedUrl")]
    signed_url: String,
}

impl SupabaseStorage {
    pub fn new(client: Client, base_url: &str, service_key: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key: service_key.to_string(),
        }
    }

    fn object_url(&self, prefix: &str, bucket: &str, path: &str) -> String {
        format!(
            "{}/storage/v1/{}/{}/{}",
            self.base_url,
            prefix,
            urlencoding::encode(bucket),
            encode_path(path)
        )
    }

    /// The sign endpoint answers with a path relative to `/storage/v1`.
    fn absolute_signed_url(&self, signed: &str) -> String {
        if signed.starts_with("http://") || signed.starts_with("https://") {
            signed.to_string()
        } else {
            format!(
                "{}/storage/v1/{}",
                self.base_url,
                signed.trim_start_matches('/')
            )
        }
    }
}

/// Percent-encode each path segment, keeping the separators.
fn encode_path(path: &str) -> String {
    path.trim_start_matches('/')
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[async_trait]
impl BlobStore for SupabaseStorage {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), GatewayError> {
        let size = bytes.len();
        let response = self
            .client
            .post(self.object_url("object", bucket, path))
            .header("Authorization", format!("Bearer {}", self.service_key))
            .header("apikey", &self.service_key)
            .header("Content-Type", content_type)
            .body(bytes)
            .send()
            .await
            .map_err(|e| GatewayError::Storage(format!("upload request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Storage(format!(
                "upload failed {status}: {body}"
            )));
        }

        info!(bucket, path, bytes = size, "Document uploaded");
        Ok(())
    }

    async fn create_signed_url(
        &self,
        bucket: &str,
        path: &str,
        ttl: Duration,
    ) -> Result<String, GatewayError> {
        let response = self
            .client
            .post(self.object_url("object/sign", bucket, path))
            .header("Authorization", format!("Bearer {}", self.service_key))
            .header("apikey", &self.service_key)
            .json(&SignRequest {
                expires_in: ttl.as_secs(),
            })
            .send()
            .await
            .map_err(|e| GatewayError::Storage(format!("sign request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Storage(format!(
                "could not sign {bucket}/{path}: {status}: {body}"
            )));
        }

        let signed: SignResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Storage(format!("invalid sign response: {e}")))?;
        Ok(self.absolute_signed_url(&signed.signed_url))
    }
}

/// Plain HTTP GET that buffers the whole body. No size cap is applied.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl DocumentFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Document, GatewayError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| GatewayError::Download(e.to_string()))?;

        if !response.status().is_success() {
            return Err(GatewayError::Download(format!(
                "status {}",
                response.status().as_u16()
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| GatewayError::Download(e.to_string()))?;

        let document = Document::new(bytes.to_vec(), content_type.as_deref());
        info!(mime = %document.mime_type, bytes = document.len(), "File downloaded");
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> SupabaseStorage {
        SupabaseStorage::new(Client::new(), "https://proj.supabase.co/", "service")
    }

    #[test]
    fn test_object_urls_encode_segments() {
        assert_eq!(
            storage().object_url("object/sign", "invoices", "user-1/1700000000000_my invoice.pdf"),
            "https://proj.supabase.co/storage/v1/object/sign/invoices/user-1/1700000000000_my%20invoice.pdf"
        );
    }

    #[test]
    fn test_relative_signed_url_is_made_absolute() {
        assert_eq!(
            storage().absolute_signed_url("/object/sign/invoices/u/a.pdf?token=abc"),
            "https://proj.supabase.co/storage/v1/object/sign/invoices/u/a.pdf?token=abc"
        );
        assert_eq!(
            storage().absolute_signed_url("https://cdn.example.com/a.pdf?token=abc"),
            "https://cdn.example.com/a.pdf?token=abc"
        );
    }

    #[test]
    fn test_sign_response_field_name() {
        let parsed: SignResponse =
            serde_json::from_str(r#"{"signedURL":"/object/sign/invoices/a.pdf?token=t"}"#).unwrap();
        assert_eq!(parsed.signed_url, "/object/sign/invoices/a.pdf?token=t");
    }
}
