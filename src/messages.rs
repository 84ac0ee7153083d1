use chrono::{DateTime, Utc};

use crate::classify::Edit;
use crate::error::IngestError;
use crate::store::Store;
use crate::types::{DeliveryStatus, NewMessage, Reaction};

const PREVIEW_CHARS: usize = 100;

pub fn preview(content: &str) -> String {
    content.chars().take(PREVIEW_CHARS).collect()
}

/// Stores `message` and refreshes the conversation summary. Returns the new
/// row id, or `None` for a redelivered provider id, in which case nothing else
/// is touched.
pub async fn persist(store: &dyn Store, message: &NewMessage) -> Result<Option<String>, IngestError> {
    let Some(row_id) = store.insert_message(message).await? else {
        tracing::info!(message_id = %message.message_id, "duplicate delivery ignored");
        return Ok(None);
    };

    store
        .record_activity(
            &message.conversation_id,
            message.timestamp,
            &preview(&message.content),
            !message.is_from_me,
        )
        .await?;
    Ok(Some(row_id))
}

pub async fn update_status(
    store: &dyn Store,
    provider_message_id: &str,
    status: DeliveryStatus,
) -> Result<u64, IngestError> {
    let updated = store
        .update_message_status(provider_message_id, status)
        .await?;
    if updated == 0 {
        tracing::debug!(message_id = %provider_message_id, "status update for unknown message");
    } else {
        tracing::debug!(message_id = %provider_message_id, status = status.as_str(), updated, "message status updated");
    }
    Ok(updated)
}

/// Records the current text in the edit history, then replaces it. The first
/// edit freezes `original_content`. Only messages of `instance_id` are edited.
pub async fn apply_edit(
    store: &dyn Store,
    instance_id: &str,
    edit: &Edit,
    edited_at: DateTime<Utc>,
) -> Result<bool, IngestError> {
    let Some(current) = store.find_message(instance_id, &edit.target_id).await? else {
        tracing::info!(message_id = %edit.target_id, "edit for unknown message ignored");
        return Ok(false);
    };

    store.insert_edit_history(&current, edited_at).await?;
    store
        .update_message_content(
            &current.conversation_id,
            &edit.target_id,
            &edit.new_content,
            edited_at,
            &current.content,
        )
        .await?;
    tracing::info!(message_id = %edit.target_id, "message edited");
    Ok(true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionOutcome {
    Stored,
    Removed,
    TargetMissing,
}

pub async fn apply_reaction(
    store: &dyn Store,
    instance_id: &str,
    target_message_id: &str,
    emoji: &str,
    reactor_jid: &str,
    is_from_me: bool,
) -> Result<ReactionOutcome, IngestError> {
    let Some(target) = store.find_message(instance_id, target_message_id).await? else {
        tracing::info!(message_id = %target_message_id, "reaction to unknown message ignored");
        return Ok(ReactionOutcome::TargetMissing);
    };

    if emoji.is_empty() {
        store
            .delete_reaction(&target.conversation_id, target_message_id, reactor_jid)
            .await?;
        return Ok(ReactionOutcome::Removed);
    }

    store
        .upsert_reaction(&Reaction {
            message_id: target_message_id.to_string(),
            conversation_id: target.conversation_id,
            emoji: emoji.to_string(),
            reactor_jid: reactor_jid.to_string(),
            is_from_me,
        })
        .await?;
    Ok(ReactionOutcome::Stored)
}
