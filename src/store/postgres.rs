use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    postgres::{PgConnection, PgPool, PgRow},
    Row,
};
use uuid::Uuid;

use super::Store;
use crate::assignment::next_index;
use crate::error::IngestError;
use crate::types::{
    AssignmentRule, Contact, Conversation, ConversationStatus, DeliveryStatus, Instance,
    InstanceSecrets, InstanceStatus, Message, MessageKind, NewContact, NewMessage, ProviderKind,
    Reaction, RuleType,
};

const INSTANCE_SELECT: &str = "SELECT id, name, instance_name, instance_id_external, provider_type, status \
     FROM whatsapp_instances";

const CONTACT_COLUMNS: &str =
    "id, instance_id, phone_number, name, is_group, profile_picture_url, notes";

const CONVERSATION_COLUMNS: &str = "id, instance_id, contact_id, status, assigned_to, last_message_at, \
     last_message_preview, unread_count, metadata";

const MESSAGE_COLUMNS: &str = "id, conversation_id, message_id, remote_jid, content, message_type, \
     media_url, media_mimetype, is_from_me, status, quoted_message_id, edited_at, original_content, \
     message_timestamp";

/// Postgres-backed [`Store`]. Uniqueness is enforced by the indexes created in
/// `migrations/`; inserts use `ON CONFLICT DO NOTHING` so a lost race surfaces
/// as `None` instead of an error.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_instance_row(row: &PgRow) -> Result<Instance, sqlx::Error> {
    let provider: String = row.try_get("provider_type")?;
    let status: Option<String> = row.try_get("status")?;
    Ok(Instance {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        instance_name: row.try_get("instance_name")?,
        instance_id_external: row.try_get("instance_id_external")?,
        provider: ProviderKind::parse(&provider),
        status: InstanceStatus::parse(status.as_deref().unwrap_or("")),
    })
}

fn parse_contact_row(row: &PgRow) -> Result<Contact, sqlx::Error> {
    Ok(Contact {
        id: row.try_get("id")?,
        instance_id: row.try_get("instance_id")?,
        phone_number: row.try_get("phone_number")?,
        name: row.try_get("name")?,
        is_group: row.try_get("is_group")?,
        profile_picture_url: row.try_get("profile_picture_url")?,
        notes: row.try_get("notes")?,
    })
}

fn parse_conversation_row(row: &PgRow) -> Result<Conversation, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(Conversation {
        id: row.try_get("id")?,
        instance_id: row.try_get("instance_id")?,
        contact_id: row.try_get("contact_id")?,
        status: ConversationStatus::parse(&status),
        assigned_to: row.try_get("assigned_to")?,
        last_message_at: row.try_get("last_message_at")?,
        last_message_preview: row.try_get("last_message_preview")?,
        unread_count: row.try_get("unread_count")?,
        metadata: row.try_get("metadata")?,
    })
}

fn parse_message_row(row: &PgRow) -> Result<Message, sqlx::Error> {
    let kind: String = row.try_get("message_type")?;
    let status: String = row.try_get("status")?;
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        message_id: row.try_get("message_id")?,
        remote_jid: row.try_get("remote_jid")?,
        content: row.try_get("content")?,
        kind: MessageKind::parse(&kind),
        media_url: row.try_get("media_url")?,
        media_mimetype: row.try_get("media_mimetype")?,
        is_from_me: row.try_get("is_from_me")?,
        status: DeliveryStatus::parse(&status),
        quoted_message_id: row.try_get("quoted_message_id")?,
        edited_at: row.try_get("edited_at")?,
        original_content: row.try_get("original_content")?,
        timestamp: row.try_get("message_timestamp")?,
    })
}

fn parse_rule_row(row: &PgRow) -> Result<AssignmentRule, sqlx::Error> {
    let raw_type: String = row.try_get("rule_type")?;
    let rule_type = RuleType::parse(&raw_type)
        .ok_or_else(|| sqlx::Error::Decode(format!("unknown rule_type {raw_type}").into()))?;
    Ok(AssignmentRule {
        id: row.try_get("id")?,
        instance_id: row.try_get("instance_id")?,
        name: row.try_get("name")?,
        rule_type,
        fixed_agent_id: row.try_get("fixed_agent_id")?,
        round_robin_agents: row.try_get("round_robin_agents")?,
        round_robin_last_index: row.try_get("round_robin_last_index")?,
        is_active: row.try_get("is_active")?,
    })
}

/// Sets the assignee and writes the audit row on an open transaction.
async fn assign_in(
    conn: &mut PgConnection,
    conversation_id: &str,
    agent_id: &str,
    reason: &str,
) -> Result<Option<String>, IngestError> {
    let previous = sqlx::query_scalar::<_, Option<String>>(
        "SELECT assigned_to FROM whatsapp_conversations WHERE id = $1 FOR UPDATE",
    )
    .bind(conversation_id)
    .fetch_optional(&mut *conn)
    .await?;
    let Some(previous) = previous else {
        return Err(IngestError::NotFound(
            "conversation",
            conversation_id.to_string(),
        ));
    };

    sqlx::query(
        "UPDATE whatsapp_conversations SET assigned_to = $1, updated_at = now() WHERE id = $2",
    )
    .bind(agent_id)
    .bind(conversation_id)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        "INSERT INTO conversation_assignments (id, conversation_id, assigned_to, assigned_from, reason) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(conversation_id)
    .bind(agent_id)
    .bind(&previous)
    .bind(reason)
    .execute(&mut *conn)
    .await?;

    Ok(previous)
}

#[async_trait]
impl Store for PgStore {
    async fn find_instance(&self, gateway_name: &str) -> Result<Option<Instance>, IngestError> {
        let by_name = sqlx::query(&format!("{INSTANCE_SELECT} WHERE instance_name = $1 LIMIT 1"))
            .bind(gateway_name)
            .fetch_optional(&self.pool)
            .await?;
        let row = match by_name {
            Some(row) => Some(row),
            None => {
                sqlx::query(&format!(
                    "{INSTANCE_SELECT} WHERE instance_id_external = $1 LIMIT 1"
                ))
                .bind(gateway_name)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        Ok(row.as_ref().map(parse_instance_row).transpose()?)
    }

    async fn set_instance_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
    ) -> Result<(), IngestError> {
        sqlx::query("UPDATE whatsapp_instances SET status = $1, updated_at = now() WHERE id = $2")
            .bind(status.as_str())
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_instance_status_by_gateway_name(
        &self,
        gateway_name: &str,
        status: InstanceStatus,
    ) -> Result<u64, IngestError> {
        let result = sqlx::query(
            "UPDATE whatsapp_instances SET status = $1, updated_at = now() \
             WHERE instance_name = $2 OR instance_id_external = $2",
        )
        .bind(status.as_str())
        .bind(gateway_name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn instance_secrets(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceSecrets>, IngestError> {
        let row = sqlx::query(
            "SELECT api_url, api_key FROM whatsapp_instance_secrets WHERE instance_id = $1",
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(InstanceSecrets {
            api_url: row.try_get("api_url")?,
            api_key: row.try_get("api_key")?,
        }))
    }

    async fn find_contact_by_phones(
        &self,
        instance_id: &str,
        phones: &[String],
    ) -> Result<Option<Contact>, IngestError> {
        let Some(canonical) = phones.first() else {
            return Ok(None);
        };
        let row = sqlx::query(&format!(
            "SELECT {CONTACT_COLUMNS} FROM whatsapp_contacts \
             WHERE instance_id = $1 AND phone_number = ANY($2) \
             ORDER BY (phone_number = $3) DESC, created_at ASC LIMIT 1"
        ))
        .bind(instance_id)
        .bind(phones.to_vec())
        .bind(canonical)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(parse_contact_row).transpose()?)
    }

    async fn insert_contact(&self, contact: &NewContact) -> Result<Option<Contact>, IngestError> {
        let row = sqlx::query(&format!(
            "INSERT INTO whatsapp_contacts (id, instance_id, phone_number, name, is_group) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (instance_id, phone_number) DO NOTHING \
             RETURNING {CONTACT_COLUMNS}"
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(&contact.instance_id)
        .bind(&contact.phone_number)
        .bind(&contact.name)
        .bind(contact.is_group)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(parse_contact_row).transpose()?)
    }

    async fn update_contact_phone(&self, contact_id: &str, phone: &str) -> Result<(), IngestError> {
        let result = sqlx::query(
            "UPDATE whatsapp_contacts SET phone_number = $1, updated_at = now() WHERE id = $2",
        )
        .bind(phone)
        .bind(contact_id)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(IngestError::Conflict(
                format!("phone {phone} already belongs to another contact"),
            )),
            Err(err) => Err(err.into()),
        }
    }

    async fn update_contact_name(&self, contact_id: &str, name: &str) -> Result<(), IngestError> {
        sqlx::query("UPDATE whatsapp_contacts SET name = $1, updated_at = now() WHERE id = $2")
            .bind(name)
            .bind(contact_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_contact_picture(&self, contact_id: &str, url: &str) -> Result<(), IngestError> {
        sqlx::query(
            "UPDATE whatsapp_contacts SET profile_picture_url = $1, updated_at = now() WHERE id = $2",
        )
        .bind(url)
        .bind(contact_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_conversation(
        &self,
        instance_id: &str,
        contact_id: &str,
    ) -> Result<Option<Conversation>, IngestError> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM whatsapp_conversations \
             WHERE instance_id = $1 AND contact_id = $2"
        ))
        .bind(instance_id)
        .bind(contact_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(parse_conversation_row).transpose()?)
    }

    async fn insert_conversation(
        &self,
        instance_id: &str,
        contact_id: &str,
    ) -> Result<Option<Conversation>, IngestError> {
        let row = sqlx::query(&format!(
            "INSERT INTO whatsapp_conversations (id, instance_id, contact_id, status) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (instance_id, contact_id) DO NOTHING \
             RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(instance_id)
        .bind(contact_id)
        .bind(ConversationStatus::Active.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(parse_conversation_row).transpose()?)
    }

    async fn conversation(&self, conversation_id: &str) -> Result<Option<Conversation>, IngestError> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM whatsapp_conversations WHERE id = $1"
        ))
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(parse_conversation_row).transpose()?)
    }

    async fn record_activity(
        &self,
        conversation_id: &str,
        at: DateTime<Utc>,
        preview: &str,
        increment_unread: bool,
    ) -> Result<(), IngestError> {
        sqlx::query(
            "UPDATE whatsapp_conversations SET \
                 last_message_at = $1, \
                 last_message_preview = $2, \
                 unread_count = unread_count + CASE WHEN $3 THEN 1 ELSE 0 END, \
                 updated_at = now() \
             WHERE id = $4",
        )
        .bind(at)
        .bind(preview)
        .bind(increment_unread)
        .bind(conversation_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn swap_metadata_marker(
        &self,
        conversation_id: &str,
        key: &str,
        expected: Option<&str>,
        value: Option<&str>,
    ) -> Result<bool, IngestError> {
        let result = sqlx::query(
            "UPDATE whatsapp_conversations SET \
                 metadata = CASE \
                     WHEN $4::text IS NULL THEN COALESCE(metadata, '{}'::jsonb) - $2::text \
                     ELSE COALESCE(metadata, '{}'::jsonb) || jsonb_build_object($2::text, $4::text) \
                 END, \
                 updated_at = now() \
             WHERE id = $1 AND (metadata ->> $2::text) IS NOT DISTINCT FROM $3::text",
        )
        .bind(conversation_id)
        .bind(key)
        .bind(expected)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn active_rule(&self, instance_id: &str) -> Result<Option<AssignmentRule>, IngestError> {
        let row = sqlx::query(
            "SELECT id, instance_id, name, rule_type, fixed_agent_id, round_robin_agents, \
                    round_robin_last_index, is_active \
             FROM assignment_rules \
             WHERE instance_id = $1 AND is_active = true \
             ORDER BY created_at ASC LIMIT 1",
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(parse_rule_row).transpose()?)
    }

    async fn assign_round_robin(
        &self,
        rule_id: &str,
        conversation_id: &str,
        reason: &str,
    ) -> Result<Option<(String, Option<String>)>, IngestError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT round_robin_agents, round_robin_last_index FROM assignment_rules \
             WHERE id = $1 AND is_active = true AND rule_type = 'round_robin' \
             FOR UPDATE",
        )
        .bind(rule_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let agents: Vec<String> = row.try_get("round_robin_agents")?;
        let last: i32 = row.try_get("round_robin_last_index")?;
        if agents.is_empty() {
            return Ok(None);
        }
        let next = next_index(last, agents.len());
        let Some(agent_id) = agents.get(next as usize).cloned() else {
            return Ok(None);
        };

        sqlx::query(
            "UPDATE assignment_rules SET round_robin_last_index = $1, updated_at = now() WHERE id = $2",
        )
        .bind(next)
        .bind(rule_id)
        .execute(&mut *tx)
        .await?;

        let previous = assign_in(&mut tx, conversation_id, &agent_id, reason).await?;
        tx.commit().await?;
        Ok(Some((agent_id, previous)))
    }

    async fn assign_conversation(
        &self,
        conversation_id: &str,
        agent_id: &str,
        reason: &str,
    ) -> Result<Option<String>, IngestError> {
        let mut tx = self.pool.begin().await?;
        let previous = assign_in(&mut tx, conversation_id, agent_id, reason).await?;
        tx.commit().await?;
        Ok(previous)
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<Option<String>, IngestError> {
        let id = sqlx::query_scalar::<_, String>(
            "INSERT INTO whatsapp_messages \
             (id, conversation_id, message_id, remote_jid, content, message_type, media_mimetype, \
              is_from_me, status, quoted_message_id, message_timestamp) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'sent', $9, $10) \
             ON CONFLICT (conversation_id, message_id) DO NOTHING \
             RETURNING id",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&message.conversation_id)
        .bind(&message.message_id)
        .bind(&message.remote_jid)
        .bind(&message.content)
        .bind(message.kind.as_str())
        .bind(&message.media_mimetype)
        .bind(message.is_from_me)
        .bind(&message.quoted_message_id)
        .bind(message.timestamp)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn set_message_media(&self, message_row_id: &str, url: &str) -> Result<(), IngestError> {
        sqlx::query("UPDATE whatsapp_messages SET media_url = $1 WHERE id = $2")
            .bind(url)
            .bind(message_row_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_message_status(
        &self,
        provider_message_id: &str,
        status: DeliveryStatus,
    ) -> Result<u64, IngestError> {
        let result = sqlx::query("UPDATE whatsapp_messages SET status = $1 WHERE message_id = $2")
            .bind(status.as_str())
            .bind(provider_message_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn find_message(
        &self,
        instance_id: &str,
        provider_message_id: &str,
    ) -> Result<Option<Message>, IngestError> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM whatsapp_messages \
             WHERE message_id = $1 \
               AND conversation_id IN (SELECT id FROM whatsapp_conversations WHERE instance_id = $2) \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(provider_message_id)
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(parse_message_row).transpose()?)
    }

    async fn insert_edit_history(
        &self,
        current: &Message,
        edited_at: DateTime<Utc>,
    ) -> Result<(), IngestError> {
        sqlx::query(
            "INSERT INTO whatsapp_message_edit_history \
             (id, message_id, conversation_id, previous_content, edited_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&current.message_id)
        .bind(&current.conversation_id)
        .bind(&current.content)
        .bind(edited_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_message_content(
        &self,
        conversation_id: &str,
        provider_message_id: &str,
        content: &str,
        edited_at: DateTime<Utc>,
        original_content: &str,
    ) -> Result<(), IngestError> {
        sqlx::query(
            "UPDATE whatsapp_messages SET \
                 content = $1, \
                 edited_at = $2, \
                 original_content = COALESCE(original_content, $3) \
             WHERE conversation_id = $4 AND message_id = $5",
        )
        .bind(content)
        .bind(edited_at)
        .bind(original_content)
        .bind(conversation_id)
        .bind(provider_message_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_reaction(&self, reaction: &Reaction) -> Result<(), IngestError> {
        sqlx::query(
            "INSERT INTO whatsapp_reactions (id, message_id, conversation_id, emoji, reactor_jid, is_from_me) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (conversation_id, message_id, reactor_jid) DO UPDATE SET \
                 emoji = EXCLUDED.emoji, \
                 is_from_me = EXCLUDED.is_from_me, \
                 updated_at = now()",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&reaction.message_id)
        .bind(&reaction.conversation_id)
        .bind(&reaction.emoji)
        .bind(&reaction.reactor_jid)
        .bind(reaction.is_from_me)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_reaction(
        &self,
        conversation_id: &str,
        target_message_id: &str,
        reactor_jid: &str,
    ) -> Result<u64, IngestError> {
        let result = sqlx::query(
            "DELETE FROM whatsapp_reactions \
             WHERE conversation_id = $1 AND message_id = $2 AND reactor_jid = $3",
        )
        .bind(conversation_id)
        .bind(target_message_id)
        .bind(reactor_jid)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn latest_sentiment_at(
        &self,
        conversation_id: &str,
    ) -> Result<Option<DateTime<Utc>>, IngestError> {
        let latest = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT MAX(created_at) FROM whatsapp_sentiment_analysis WHERE conversation_id = $1",
        )
        .bind(conversation_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(latest)
    }

    async fn count_inbound_since(
        &self,
        conversation_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<i64, IngestError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM whatsapp_messages \
             WHERE conversation_id = $1 AND is_from_me = false \
               AND ($2::timestamptz IS NULL OR message_timestamp > $2)",
        )
        .bind(conversation_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
