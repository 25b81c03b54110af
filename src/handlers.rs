//! HTTP surface of the gateway.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, State, multipart::MultipartError},
    http::{
        HeaderMap, HeaderName, Method, StatusCode,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::bearer_token;
use crate::error::{ExtractionFailure, GatewayError};
use crate::gateway::{Gateway, Upload};
use crate::models::{
    ContractRecord, DocumentRef, DocumentType, ExtractionOutcome, ExtractionRequest, InvoiceRecord,
};

pub const SERVICE_NAME: &str = "freight-gateway";

type SharedGateway = State<Arc<Gateway>>;

/// Body of `POST /process-invoice`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcessBody {
    #[serde(default)]
    file_url: Option<String>,
    #[serde(default, rename = "type")]
    document_type: Option<String>,
    #[serde(default)]
    filename: Option<String>,
}

pub fn router(gateway: Arc<Gateway>, upload_limit: usize) -> Router {
    // preflight requests are answered here and never reach a handler
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            AUTHORIZATION,
            CONTENT_TYPE,
            HeaderName::from_static("x-client-info"),
            HeaderName::from_static("apikey"),
        ]);

    Router::new()
        .route("/health", get(health))
        .route("/process-invoice", post(process_invoice))
        .route(
            "/upload",
            post(upload).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/invoices", get(list_invoices))
        .route("/contracts", get(list_contracts))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(gateway)
}

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
    }))
}

async fn process_invoice(
    State(gateway): SharedGateway,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ExtractionOutcome>, ExtractionFailure> {
    let body: ProcessBody = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::InvalidRequest(format!("Invalid JSON body: {e}")))?;

    let document = body
        .file_url
        .as_deref()
        .and_then(DocumentRef::parse)
        .ok_or_else(|| GatewayError::InvalidRequest("Missing fileUrl".to_string()))?;
    let document_type = parse_type(body.document_type.as_deref())?;

    let outcome = gateway
        .process(ExtractionRequest {
            document,
            document_type,
            filename: body.filename,
            bearer: bearer_token(&headers),
        })
        .await?;
    Ok(Json(outcome))
}

/// Multipart form with a `file` part and an optional `type` part.
async fn upload(
    State(gateway): SharedGateway,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<ExtractionOutcome>, ExtractionFailure> {
    let mut file = None;
    let mut document_type = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        match field.name() {
            Some("file") => {
                let filename = field.file_name().unwrap_or("document").to_string();
                let content_type = field.content_type().map(str::to_string);
                let bytes = field.bytes().await.map_err(multipart_error)?;
                file = Some((filename, content_type, bytes.to_vec()));
            }
            Some("type") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| GatewayError::InvalidRequest(format!("Invalid type field: {e}")))?;
                document_type = Some(text);
            }
            _ => {}
        }
    }

    let (filename, content_type, bytes) =
        file.ok_or_else(|| GatewayError::InvalidRequest("Missing file".to_string()))?;
    if bytes.is_empty() {
        return Err(GatewayError::InvalidRequest("Empty file".to_string()).into());
    }

    let outcome = gateway
        .upload_and_process(Upload {
            filename,
            content_type,
            bytes,
            document_type: parse_type(document_type.as_deref())?,
            bearer: bearer_token(&headers),
        })
        .await?;
    Ok(Json(outcome))
}

async fn list_invoices(
    State(gateway): SharedGateway,
    headers: HeaderMap,
) -> Result<Json<Vec<InvoiceRecord>>, GatewayError> {
    let rows = gateway.list_invoices(bearer_token(&headers).as_deref()).await?;
    Ok(Json(rows))
}

async fn list_contracts(
    State(gateway): SharedGateway,
    headers: HeaderMap,
) -> Result<Json<Vec<ContractRecord>>, GatewayError> {
    let rows = gateway.list_contracts(bearer_token(&headers).as_deref()).await?;
    Ok(Json(rows))
}

/// Oversized bodies keep their 413; anything else is a malformed form.
fn multipart_error(err: MultipartError) -> GatewayError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        GatewayError::PayloadTooLarge(err.body_text())
    } else {
        GatewayError::InvalidRequest(format!("Invalid multipart body: {err}"))
    }
}

fn parse_type(raw: Option<&str>) -> Result<DocumentType, GatewayError> {
    raw.unwrap_or_default()
        .parse()
        .map_err(GatewayError::InvalidRequest)
}
