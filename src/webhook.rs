use std::sync::Arc;

use axum::{body::Bytes, extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::{json, Value};

use crate::error::IngestError;
use crate::ingest;
use crate::types::{AppState, WebhookPayload};

/// Gateways send either `messages.upsert` or `MESSAGES_UPSERT`.
fn normalize_event(event: &str) -> String {
    event.trim().to_ascii_lowercase().replace('_', ".")
}

async fn dispatch(state: &Arc<AppState>, payload: &WebhookPayload) -> Result<(), IngestError> {
    match normalize_event(&payload.event).as_str() {
        "messages.upsert" => {
            let outcome = ingest::handle_upsert(state, payload).await?;
            tracing::debug!(instance = %payload.instance, ?outcome, "upsert handled");
        }
        "messages.update" => {
            ingest::handle_status_update(state, payload).await?;
        }
        "connection.update" => {
            ingest::handle_connection_update(state, payload).await?;
        }
        other => {
            tracing::debug!(event = %other, instance = %payload.instance, "event ignored");
        }
    }
    Ok(())
}

/// Always answers 200 so the gateway never retries; failures only reach the logs.
pub async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> impl IntoResponse {
    let payload = match serde_json::from_slice::<WebhookPayload>(&body) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(error = %err, bytes = body.len(), "unparseable webhook body");
            return (
                StatusCode::OK,
                Json(json!({ "success": false, "event": Value::Null, "error": "invalid payload" })),
            );
        }
    };

    if let Err(err) = dispatch(&state, &payload).await {
        tracing::error!(
            event = %payload.event,
            instance = %payload.instance,
            error = %err,
            "webhook event failed"
        );
    }

    (
        StatusCode::OK,
        Json(json!({ "success": true, "event": payload.event })),
    )
}
