use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::IntoResponse,
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use serde_json::json;

use crate::error::IngestError;
use crate::gateway::GatewayClient;
use crate::types::{AppState, GatewayCredentials, MessageKey};

/// Object storage for downloaded attachments.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `bytes` at `path` (overwriting) and returns its public URL.
    async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, IngestError>;
}

/// Writes blobs below `root` and hands out URLs served by [`serve_stored_media`].
pub struct LocalBlobStore {
    root: PathBuf,
    public_base_url: String,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: &str) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<String, IngestError> {
        let segments: Vec<&str> = path.split('/').collect();
        if segments.is_empty() || !segments.iter().all(|s| is_safe_media_file_name(s)) {
            return Err(IngestError::payload(format!("unsafe blob path {path}")));
        }

        let target = segments.iter().fold(self.root.clone(), |acc, s| acc.join(s));
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &bytes).await?;

        Ok(format!("{}/api/media/{}", self.public_base_url, path))
    }
}

/// `image/jpeg` -> `jpeg`, `audio/ogg; codecs=opus` -> `ogg`. Falls back to
/// `bin` for missing or wildcard subtypes.
pub fn extension_from_mimetype(mimetype: &str) -> String {
    let subtype = mimetype
        .split('/')
        .nth(1)
        .unwrap_or("")
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    if subtype.is_empty() || !is_safe_media_file_name(&subtype) {
        "bin".to_string()
    } else {
        subtype
    }
}

/// Accepts raw base64 or a `data:<mime>;base64,<payload>` URL.
pub fn decode_base64_payload(raw: &str) -> Result<Vec<u8>, IngestError> {
    let payload = match raw.split_once(',') {
        Some((_, rest)) => rest,
        None => raw,
    };
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| IngestError::Decode(format!("invalid base64 media: {e}")))
}

/// `{instance}/{epochMillis}-{providerId}.{ext}` with unsafe characters replaced.
pub fn media_object_path(instance: &str, provider_id: &str, extension: &str, millis: i64) -> String {
    format!(
        "{}/{}-{}.{}",
        sanitize_segment(instance),
        millis,
        sanitize_segment(provider_id),
        extension
    )
}

fn sanitize_segment(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

fn is_safe_media_file_name(value: &str) -> bool {
    !value.is_empty()
        && !value.contains("..")
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

fn media_content_type_from_extension(ext: &str) -> &'static str {
    match ext {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "mp3" | "mpeg" => "audio/mpeg",
        "ogg" | "oga" | "opus" => "audio/ogg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mov" | "quicktime" => "video/quicktime",
        "pdf" => "application/pdf",
        "txt" | "plain" => "text/plain; charset=utf-8",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

async fn download_and_store(
    gateway: &GatewayClient,
    blobs: &dyn BlobStore,
    creds: &GatewayCredentials,
    key: &MessageKey,
    mimetype: &str,
) -> Result<String, IngestError> {
    let media = gateway.fetch_media_base64(creds, key).await?;
    let bytes = decode_base64_payload(&media.base64)?;

    // A wildcard recorded at classification time defers to what the gateway reports.
    let mimetype = match media.mimetype {
        Some(reported) if mimetype.ends_with("/*") => reported,
        _ => mimetype.to_string(),
    };
    let path = media_object_path(
        &creds.instance,
        &key.id,
        &extension_from_mimetype(&mimetype),
        Utc::now().timestamp_millis(),
    );
    blobs.upload(&path, bytes, &mimetype).await
}

/// Downloads the attachment of `key` through the gateway and uploads it.
/// Every failure is logged and collapses to `None`.
pub async fn fetch_and_store(
    gateway: &GatewayClient,
    blobs: &dyn BlobStore,
    creds: &GatewayCredentials,
    key: &MessageKey,
    mimetype: &str,
) -> Option<String> {
    match download_and_store(gateway, blobs, creds, key, mimetype).await {
        Ok(url) => {
            tracing::debug!(message_id = %key.id, url = %url, "media stored");
            Some(url)
        }
        Err(err) => {
            tracing::warn!(
                instance = %creds.instance,
                message_id = %key.id,
                error = %err,
                "media download failed"
            );
            None
        }
    }
}

pub async fn serve_stored_media(
    Path((instance, file_name)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    if !is_safe_media_file_name(&instance) || !is_safe_media_file_name(&file_name) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid media file name" })),
        )
            .into_response();
    }
    let path = state.media_storage_dir.join(&instance).join(&file_name);
    let Ok(bytes) = tokio::fs::read(&path).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "media file not found" })),
        )
            .into_response();
    };

    let ext = file_name
        .rsplit('.')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    let content_type = media_content_type_from_extension(&ext);

    let mut response = axum::response::Response::new(axum::body::Body::from(bytes));
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=31536000, immutable"),
    );
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response.into_response()
}
