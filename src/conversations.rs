use crate::assignment;
use crate::error::IngestError;
use crate::store::Store;

/// Conversation for (instance, contact). Returns its id and whether this call
/// created it; only the creating call runs auto-assignment.
pub async fn resolve(
    store: &dyn Store,
    instance_id: &str,
    contact_id: &str,
) -> Result<(String, bool), IngestError> {
    if let Some(existing) = store.find_conversation(instance_id, contact_id).await? {
        return Ok((existing.id, false));
    }

    match store.insert_conversation(instance_id, contact_id).await? {
        Some(created) => {
            tracing::info!(conversation_id = %created.id, contact_id = %contact_id, "conversation created");
            if let Err(err) = assignment::apply(store, instance_id, &created.id).await {
                tracing::error!(
                    conversation_id = %created.id,
                    error = %err,
                    "auto-assignment failed"
                );
            }
            Ok((created.id, true))
        }
        None => {
            let winner = store
                .find_conversation(instance_id, contact_id)
                .await?
                .ok_or_else(|| IngestError::NotFound("conversation", contact_id.to_string()))?;
            Ok((winner.id, false))
        }
    }
}
