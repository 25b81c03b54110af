// src/inference/openai.rs

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{InferenceProvider, ProviderError};
use crate::document::Document;

const SYSTEM_PROMPT: &str = "You are a document data extraction assistant. \
Return ONLY valid JSON, no markdown fences, no commentary.";

/// Client for OpenAI-compatible `/chat/completions` endpoints (hosted or local).
pub struct OpenAiCompatibleClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
    response_format: Value,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

impl OpenAiCompatibleClient {
    pub fn new(client: Client, base_url: &str, model: &str, api_key: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn build_request(&self, prompt: &str, document: &Document) -> ChatRequest {
        let data_url = format!(
            "data:{};base64,{}",
            document.mime_type,
            BASE64.encode(&document.bytes)
        );

        ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: Value::String(SYSTEM_PROMPT.to_string()),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: json!([
                        { "type": "text", "text": prompt },
                        { "type": "image_url", "image_url": { "url": data_url } }
                    ]),
                },
            ],
            temperature: 0.0,
            response_format: json!({ "type": "json_object" }),
        }
    }
}

#[async_trait]
impl InferenceProvider for OpenAiCompatibleClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, document: &Document) -> Result<String, ProviderError> {
        let request = self.build_request(prompt, document);
        let url = format!("{}/chat/completions", self.base_url);

        debug!(url = %url, model = %self.model, bytes = document.len(), "Calling chat completions");
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            if status == 404 {
                warn!(url = %url, "Endpoint not found; is the server running this model?");
            }
            return Err(ProviderError::from_status(status, body));
        }

        let chat_response: ChatResponse = response.json().await?;
        let content = chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(ProviderError::EmptyResponse)?;

        if content.trim().is_empty() {
            return Err(ProviderError::EmptyResponse);
        }
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_is_inlined_as_data_url() {
        let client = OpenAiCompatibleClient::new(
            Client::new(),
            "http://localhost:11434/v1/",
            "qwen2.5vl",
            "ollama",
        );
        let doc = Document::new(vec![0xFF, 0xD8, 0xFF, 0xE0], None);
        let request = serde_json::to_value(client.build_request("extract", &doc)).unwrap();

        assert_eq!(request["model"], "qwen2.5vl");
        assert_eq!(request["messages"][0]["role"], "system");
        assert_eq!(request["messages"][1]["content"][0]["text"], "extract");
        assert_eq!(
            request["messages"][1]["content"][1]["image_url"]["url"],
            "data:image/jpeg;base64,/9j/4A=="
        );
        assert_eq!(request["response_format"]["type"], "json_object");
        assert_eq!(client.base_url, "http://localhost:11434/v1");
    }

    #[test]
    fn test_missing_content_decodes() {
        let body: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"role":"assistant","content":null}}]}"#)
                .unwrap();
        assert!(body.choices[0].message.content.is_none());
    }
}
