//! Persistence seam for the ingestion pipeline.
//!
//! Find-or-create callers rely on the `insert_*` methods returning `None` when
//! a uniqueness constraint rejected the row, meaning a concurrent delivery
//! already created it and the caller should re-fetch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::IngestError;
use crate::types::{
    AssignmentRule, Contact, Conversation, DeliveryStatus, Instance, InstanceSecrets,
    InstanceStatus, Message, NewContact, NewMessage, Reaction,
};

pub mod postgres;

#[cfg(test)]
pub mod memory;

pub use postgres::PgStore;

#[async_trait]
pub trait Store: Send + Sync {
    // --- Instances ---

    /// Looks an instance up by gateway name, falling back to its external id.
    async fn find_instance(&self, gateway_name: &str) -> Result<Option<Instance>, IngestError>;

    async fn set_instance_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
    ) -> Result<(), IngestError>;

    /// Returns the number of instances updated.
    async fn set_instance_status_by_gateway_name(
        &self,
        gateway_name: &str,
        status: InstanceStatus,
    ) -> Result<u64, IngestError>;

    async fn instance_secrets(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceSecrets>, IngestError>;

    // --- Contacts ---

    /// `phones[0]` is the canonical form and wins when several variants match.
    async fn find_contact_by_phones(
        &self,
        instance_id: &str,
        phones: &[String],
    ) -> Result<Option<Contact>, IngestError>;

    async fn insert_contact(&self, contact: &NewContact) -> Result<Option<Contact>, IngestError>;

    async fn update_contact_phone(&self, contact_id: &str, phone: &str) -> Result<(), IngestError>;

    async fn update_contact_name(&self, contact_id: &str, name: &str) -> Result<(), IngestError>;

    async fn update_contact_picture(&self, contact_id: &str, url: &str) -> Result<(), IngestError>;

    // --- Conversations ---

    async fn find_conversation(
        &self,
        instance_id: &str,
        contact_id: &str,
    ) -> Result<Option<Conversation>, IngestError>;

    async fn insert_conversation(
        &self,
        instance_id: &str,
        contact_id: &str,
    ) -> Result<Option<Conversation>, IngestError>;

    async fn conversation(&self, conversation_id: &str) -> Result<Option<Conversation>, IngestError>;

    /// Overwrites last-activity fields and, when asked, bumps the unread counter
    /// atomically.
    async fn record_activity(
        &self,
        conversation_id: &str,
        at: DateTime<Utc>,
        preview: &str,
        increment_unread: bool,
    ) -> Result<(), IngestError>;

    /// Sets metadata `key` to `value`, or removes it when `value` is `None`, only
    /// while its current string value is `expected`. Returns whether it swapped.
    async fn swap_metadata_marker(
        &self,
        conversation_id: &str,
        key: &str,
        expected: Option<&str>,
        value: Option<&str>,
    ) -> Result<bool, IngestError>;

    // --- Assignment ---

    async fn active_rule(&self, instance_id: &str) -> Result<Option<AssignmentRule>, IngestError>;

    /// Locks the rule, moves its round-robin cursor to the next agent and assigns
    /// the conversation to that agent, all in one transaction. `None` when the
    /// rule is no longer an active round-robin rule or has no agents. Returns the
    /// picked agent and the previous assignee.
    async fn assign_round_robin(
        &self,
        rule_id: &str,
        conversation_id: &str,
        reason: &str,
    ) -> Result<Option<(String, Option<String>)>, IngestError>;

    /// Sets the assignee and appends an audit row; returns the previous assignee.
    async fn assign_conversation(
        &self,
        conversation_id: &str,
        agent_id: &str,
        reason: &str,
    ) -> Result<Option<String>, IngestError>;

    // --- Messages ---

    /// Returns the new row id, or `None` when the provider id was already stored
    /// for this conversation.
    async fn insert_message(&self, message: &NewMessage) -> Result<Option<String>, IngestError>;

    async fn set_message_media(&self, message_row_id: &str, url: &str) -> Result<(), IngestError>;

    async fn update_message_status(
        &self,
        provider_message_id: &str,
        status: DeliveryStatus,
    ) -> Result<u64, IngestError>;

    /// Latest message with this provider id among the conversations of `instance_id`.
    async fn find_message(
        &self,
        instance_id: &str,
        provider_message_id: &str,
    ) -> Result<Option<Message>, IngestError>;

    async fn insert_edit_history(
        &self,
        current: &Message,
        edited_at: DateTime<Utc>,
    ) -> Result<(), IngestError>;

    /// Replaces content; `original_content` is only written while it is still null.
    async fn update_message_content(
        &self,
        conversation_id: &str,
        provider_message_id: &str,
        content: &str,
        edited_at: DateTime<Utc>,
        original_content: &str,
    ) -> Result<(), IngestError>;

    // --- Reactions ---

    async fn upsert_reaction(&self, reaction: &Reaction) -> Result<(), IngestError>;

    async fn delete_reaction(
        &self,
        conversation_id: &str,
        target_message_id: &str,
        reactor_jid: &str,
    ) -> Result<u64, IngestError>;

    // --- Automation ---

    async fn latest_sentiment_at(
        &self,
        conversation_id: &str,
    ) -> Result<Option<DateTime<Utc>>, IngestError>;

    /// Inbound (not self-sent) messages strictly after `since`, or all of them.
    async fn count_inbound_since(
        &self,
        conversation_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<i64, IngestError>;
}
