//! Per-event handlers behind the webhook router. Each returns a `Result` and
//! leaves logging of failures to the caller.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::automation;
use crate::classify::{self, InboundContent};
use crate::contacts::{self, ContactHint};
use crate::conversations;
use crate::error::IngestError;
use crate::identity::normalize_remote_jid;
use crate::media;
use crate::messages;
use crate::store::Store;
use crate::types::{
    AppState, DeliveryStatus, GatewayCredentials, Instance, InstanceStatus, MessageKey,
    MessageKind, NewMessage, UpsertData, WebhookPayload,
};

/// What a `messages.upsert` event turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Stored { message_row_id: String },
    Duplicate,
    Edited,
    Reacted(messages::ReactionOutcome),
    Skipped(&'static str),
}

pub async fn handle_upsert(
    state: &Arc<AppState>,
    payload: &WebhookPayload,
) -> Result<UpsertOutcome, IngestError> {
    let data: UpsertData = serde_json::from_value(payload.data.clone())
        .map_err(|e| IngestError::payload(format!("messages.upsert data: {e}")))?;
    if data.key.id.is_empty() {
        return Err(IngestError::payload("messages.upsert without key.id"));
    }

    let instance = connected_instance(state.store.as_ref(), &payload.instance).await?;

    if classify::is_edit(&data.message) {
        let Some(edit) = classify::extract_edit(&data.message, &data.key.id) else {
            return Ok(UpsertOutcome::Skipped("edit without target"));
        };
        return Ok(
            if messages::apply_edit(state.store.as_ref(), &instance.id, &edit, Utc::now()).await? {
                UpsertOutcome::Edited
            } else {
                UpsertOutcome::Skipped("edit target missing")
            },
        );
    }

    let content = classify::classify(&data.message);
    if let InboundContent::Reaction { target_id, emoji } = &content {
        let Some(target_id) = target_id else {
            return Ok(UpsertOutcome::Skipped("reaction without target"));
        };
        let outcome = messages::apply_reaction(
            state.store.as_ref(),
            &instance.id,
            target_id,
            emoji,
            &data.key.remote_jid,
            data.key.from_me,
        )
        .await?;
        return Ok(UpsertOutcome::Reacted(outcome));
    }

    store_new_message(state, &instance, &data, &content).await
}

/// Resolves the instance an event belongs to and marks it connected, since it
/// is evidently delivering messages.
async fn connected_instance(store: &dyn Store, gateway_name: &str) -> Result<Instance, IngestError> {
    let Some(instance) = store.find_instance(gateway_name).await? else {
        return Err(IngestError::NotFound("instance", gateway_name.to_string()));
    };
    if instance.status != InstanceStatus::Connected {
        store
            .set_instance_status(&instance.id, InstanceStatus::Connected)
            .await?;
        tracing::info!(
            instance = %instance.instance_name,
            provider = instance.provider.as_str(),
            "instance marked connected"
        );
    }
    Ok(instance)
}

async fn store_new_message(
    state: &Arc<AppState>,
    instance: &Instance,
    data: &UpsertData,
    content: &InboundContent,
) -> Result<UpsertOutcome, IngestError> {
    let store = state.store.as_ref();
    let Some(secrets) = store.instance_secrets(&instance.id).await? else {
        return Err(IngestError::NotFound("instance secrets", instance.id.clone()));
    };
    let creds = GatewayCredentials::new(instance, secrets);

    let jid = normalize_remote_jid(&data.key.remote_jid);
    let hint = ContactHint {
        phone: &jid.phone,
        display_name: data.push_name.as_deref(),
        is_group: jid.is_group,
        from_me: data.key.from_me,
    };
    let contact_id = contacts::resolve(state, &creds, &instance.id, &hint).await?;
    let (conversation_id, _) = conversations::resolve(store, &instance.id, &contact_id).await?;

    let timestamp = data.timestamp();
    let draft = NewMessage {
        conversation_id: conversation_id.clone(),
        message_id: data.key.id.clone(),
        remote_jid: data.key.remote_jid.clone(),
        content: content.display_content(),
        kind: content.kind(),
        media_mimetype: content.media_mimetype(),
        is_from_me: data.key.from_me,
        quoted_message_id: classify::quoted_message_id(&data.message),
        timestamp,
    };
    let Some(message_row_id) = messages::persist(store, &draft).await? else {
        return Ok(UpsertOutcome::Duplicate);
    };
    tracing::info!(
        instance = %instance.instance_name,
        message_id = %draft.message_id,
        kind = draft.kind.as_str(),
        "message stored"
    );

    if let Some(mimetype) = draft.media_mimetype.clone().filter(|_| draft.kind.has_media()) {
        spawn_media_fetch(state, creds, data.key.clone(), mimetype, draft.kind, message_row_id.clone());
    }

    if !draft.is_from_me {
        let task_state = state.clone();
        state.background.spawn("automation", async move {
            automation::maybe_trigger(&task_state, &conversation_id, timestamp)
                .await
                .map(|_| ())
        });
    }

    Ok(UpsertOutcome::Stored { message_row_id })
}

fn spawn_media_fetch(
    state: &Arc<AppState>,
    creds: GatewayCredentials,
    key: MessageKey,
    mimetype: String,
    kind: MessageKind,
    message_row_id: String,
) {
    let task_state = state.clone();
    state.background.spawn("media", async move {
        let state = task_state;
        let Some(url) = media::fetch_and_store(
            &state.gateway,
            state.blobs.as_ref(),
            &creds,
            &key,
            &mimetype,
        )
        .await
        else {
            return Ok(());
        };
        state.store.set_message_media(&message_row_id, &url).await?;
        if kind == MessageKind::Audio {
            automation::request_transcription(&state, &message_row_id).await?;
        }
        Ok(())
    });
}

/// Individual status changes carried by a `messages.update` event. The update
/// may sit under `data.update` or be `data` itself, singly or as an array.
fn status_changes(data: &Value) -> Vec<(String, Value)> {
    let root = data.get("update").filter(|v| !v.is_null()).unwrap_or(data);
    let items: Vec<&Value> = match root {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };

    items
        .into_iter()
        .filter_map(|item| {
            let id = item
                .pointer("/key/id")
                .or_else(|| item.get("keyId"))
                .or_else(|| data.pointer("/key/id"))
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())?;
            let status = item
                .get("status")
                .or_else(|| item.pointer("/update/status"))
                .cloned()?;
            Some((id.to_string(), status))
        })
        .collect()
}

pub async fn handle_status_update(
    state: &AppState,
    payload: &WebhookPayload,
) -> Result<u64, IngestError> {
    let mut updated = 0;
    for (message_id, raw_status) in status_changes(&payload.data) {
        let Some(status) = DeliveryStatus::from_gateway(&raw_status) else {
            tracing::warn!(message_id = %message_id, status = %raw_status, "unrecognised delivery status");
            continue;
        };
        updated += messages::update_status(state.store.as_ref(), &message_id, status).await?;
    }
    Ok(updated)
}

pub async fn handle_connection_update(
    state: &AppState,
    payload: &WebhookPayload,
) -> Result<InstanceStatus, IngestError> {
    let raw = payload
        .data
        .get("state")
        .or_else(|| payload.data.get("connection"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let status = InstanceStatus::from_gateway_state(raw);
    let updated = state
        .store
        .set_instance_status_by_gateway_name(&payload.instance, status)
        .await?;
    if updated == 0 {
        tracing::warn!(instance = %payload.instance, "connection update for unknown instance");
    } else {
        tracing::info!(instance = %payload.instance, status = status.as_str(), "instance status updated");
    }
    Ok(status)
}
