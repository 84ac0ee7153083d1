//! In-process [`Store`] used by the unit tests. Mirrors the uniqueness rules of
//! the Postgres schema so the find-or-create paths behave the same way.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::Store;
use crate::assignment::next_index;
use crate::error::IngestError;
use crate::types::{
    AssignmentRule, Contact, Conversation, ConversationStatus, DeliveryStatus, Instance,
    InstanceSecrets, InstanceStatus, Message, NewContact, NewMessage, Reaction, RuleType,
};

#[derive(Debug, Clone)]
pub struct AssignmentRecord {
    pub conversation_id: String,
    pub assigned_to: String,
    pub assigned_from: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct EditRecord {
    pub message_id: String,
    pub previous_content: String,
    pub edited_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    instances: Vec<Instance>,
    secrets: Vec<(String, InstanceSecrets)>,
    contacts: Vec<Contact>,
    conversations: Vec<Conversation>,
    rules: Vec<AssignmentRule>,
    assignments: Vec<AssignmentRecord>,
    messages: Vec<Message>,
    edits: Vec<EditRecord>,
    reactions: Vec<Reaction>,
    sentiment: Vec<(String, DateTime<Utc>)>,
}

impl State {
    fn assign(
        &mut self,
        conversation_id: &str,
        agent_id: &str,
        reason: &str,
    ) -> Result<Option<String>, IngestError> {
        let conversation = self
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
            .ok_or_else(|| IngestError::NotFound("conversation", conversation_id.to_string()))?;
        let previous = conversation.assigned_to.replace(agent_id.to_string());
        self.assignments.push(AssignmentRecord {
            conversation_id: conversation_id.to_string(),
            assigned_to: agent_id.to_string(),
            assigned_from: previous.clone(),
            reason: reason.to_string(),
        });
        Ok(previous)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut guard = self.state.lock().unwrap();
        f(&mut guard)
    }

    pub fn add_instance(&self, instance: Instance) {
        self.with(|s| s.instances.push(instance));
    }

    pub fn add_secrets(&self, instance_id: &str, secrets: InstanceSecrets) {
        self.with(|s| s.secrets.push((instance_id.to_string(), secrets)));
    }

    pub fn add_contact(&self, contact: Contact) {
        self.with(|s| s.contacts.push(contact));
    }

    pub fn add_rule(&self, rule: AssignmentRule) {
        self.with(|s| s.rules.push(rule));
    }

    pub fn add_sentiment(&self, conversation_id: &str, at: DateTime<Utc>) {
        self.with(|s| s.sentiment.push((conversation_id.to_string(), at)));
    }

    pub fn instances(&self) -> Vec<Instance> {
        self.with(|s| s.instances.clone())
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.with(|s| s.contacts.clone())
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.with(|s| s.conversations.clone())
    }

    pub fn messages(&self) -> Vec<Message> {
        self.with(|s| s.messages.clone())
    }

    pub fn reactions(&self) -> Vec<Reaction> {
        self.with(|s| s.reactions.clone())
    }

    pub fn assignments(&self) -> Vec<AssignmentRecord> {
        self.with(|s| s.assignments.clone())
    }

    pub fn edits(&self) -> Vec<EditRecord> {
        self.with(|s| s.edits.clone())
    }

    pub fn rule(&self, rule_id: &str) -> Option<AssignmentRule> {
        self.with(|s| s.rules.iter().find(|r| r.id == rule_id).cloned())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_instance(&self, gateway_name: &str) -> Result<Option<Instance>, IngestError> {
        Ok(self.with(|s| {
            s.instances
                .iter()
                .find(|i| i.instance_name == gateway_name)
                .or_else(|| {
                    s.instances
                        .iter()
                        .find(|i| i.instance_id_external.as_deref() == Some(gateway_name))
                })
                .cloned()
        }))
    }

    async fn set_instance_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
    ) -> Result<(), IngestError> {
        self.with(|s| {
            for instance in s.instances.iter_mut().filter(|i| i.id == instance_id) {
                instance.status = status;
            }
        });
        Ok(())
    }

    async fn set_instance_status_by_gateway_name(
        &self,
        gateway_name: &str,
        status: InstanceStatus,
    ) -> Result<u64, IngestError> {
        Ok(self.with(|s| {
            let mut updated = 0;
            for instance in s.instances.iter_mut().filter(|i| {
                i.instance_name == gateway_name
                    || i.instance_id_external.as_deref() == Some(gateway_name)
            }) {
                instance.status = status;
                updated += 1;
            }
            updated
        }))
    }

    async fn instance_secrets(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceSecrets>, IngestError> {
        Ok(self.with(|s| {
            s.secrets
                .iter()
                .find(|(id, _)| id == instance_id)
                .map(|(_, secrets)| secrets.clone())
        }))
    }

    async fn find_contact_by_phones(
        &self,
        instance_id: &str,
        phones: &[String],
    ) -> Result<Option<Contact>, IngestError> {
        Ok(self.with(|s| {
            phones.iter().find_map(|phone| {
                s.contacts
                    .iter()
                    .find(|c| c.instance_id == instance_id && &c.phone_number == phone)
                    .cloned()
            })
        }))
    }

    async fn insert_contact(&self, contact: &NewContact) -> Result<Option<Contact>, IngestError> {
        Ok(self.with(|s| {
            let taken = s.contacts.iter().any(|c| {
                c.instance_id == contact.instance_id && c.phone_number == contact.phone_number
            });
            if taken {
                return None;
            }
            let row = Contact {
                id: Uuid::new_v4().to_string(),
                instance_id: contact.instance_id.clone(),
                phone_number: contact.phone_number.clone(),
                name: contact.name.clone(),
                is_group: contact.is_group,
                profile_picture_url: None,
                notes: None,
            };
            s.contacts.push(row.clone());
            Some(row)
        }))
    }

    async fn update_contact_phone(&self, contact_id: &str, phone: &str) -> Result<(), IngestError> {
        self.with(|s| {
            let Some(target) = s.contacts.iter().find(|c| c.id == contact_id).cloned() else {
                return Ok(());
            };
            let clash = s.contacts.iter().any(|c| {
                c.id != contact_id && c.instance_id == target.instance_id && c.phone_number == phone
            });
            if clash {
                return Err(IngestError::Conflict(format!(
                    "phone {phone} already belongs to another contact"
                )));
            }
            if let Some(c) = s.contacts.iter_mut().find(|c| c.id == contact_id) {
                c.phone_number = phone.to_string();
            }
            Ok(())
        })
    }

    async fn update_contact_name(&self, contact_id: &str, name: &str) -> Result<(), IngestError> {
        self.with(|s| {
            if let Some(c) = s.contacts.iter_mut().find(|c| c.id == contact_id) {
                c.name = name.to_string();
            }
        });
        Ok(())
    }

    async fn update_contact_picture(&self, contact_id: &str, url: &str) -> Result<(), IngestError> {
        self.with(|s| {
            if let Some(c) = s.contacts.iter_mut().find(|c| c.id == contact_id) {
                c.profile_picture_url = Some(url.to_string());
            }
        });
        Ok(())
    }

    async fn find_conversation(
        &self,
        instance_id: &str,
        contact_id: &str,
    ) -> Result<Option<Conversation>, IngestError> {
        Ok(self.with(|s| {
            s.conversations
                .iter()
                .find(|c| c.instance_id == instance_id && c.contact_id == contact_id)
                .cloned()
        }))
    }

    async fn insert_conversation(
        &self,
        instance_id: &str,
        contact_id: &str,
    ) -> Result<Option<Conversation>, IngestError> {
        Ok(self.with(|s| {
            let taken = s
                .conversations
                .iter()
                .any(|c| c.instance_id == instance_id && c.contact_id == contact_id);
            if taken {
                return None;
            }
            let row = Conversation {
                id: Uuid::new_v4().to_string(),
                instance_id: instance_id.to_string(),
                contact_id: contact_id.to_string(),
                status: ConversationStatus::Active,
                assigned_to: None,
                last_message_at: None,
                last_message_preview: None,
                unread_count: 0,
                metadata: Value::Object(Map::new()),
            };
            s.conversations.push(row.clone());
            Some(row)
        }))
    }

    async fn conversation(&self, conversation_id: &str) -> Result<Option<Conversation>, IngestError> {
        Ok(self.with(|s| {
            s.conversations
                .iter()
                .find(|c| c.id == conversation_id)
                .cloned()
        }))
    }

    async fn record_activity(
        &self,
        conversation_id: &str,
        at: DateTime<Utc>,
        preview: &str,
        increment_unread: bool,
    ) -> Result<(), IngestError> {
        self.with(|s| {
            if let Some(c) = s.conversations.iter_mut().find(|c| c.id == conversation_id) {
                c.last_message_at = Some(at);
                c.last_message_preview = Some(preview.to_string());
                if increment_unread {
                    c.unread_count += 1;
                }
            }
        });
        Ok(())
    }

    async fn swap_metadata_marker(
        &self,
        conversation_id: &str,
        key: &str,
        expected: Option<&str>,
        value: Option<&str>,
    ) -> Result<bool, IngestError> {
        Ok(self.with(|s| {
            let Some(c) = s.conversations.iter_mut().find(|c| c.id == conversation_id) else {
                return false;
            };
            if !c.metadata.is_object() {
                c.metadata = Value::Object(Map::new());
            }
            let Value::Object(metadata) = &mut c.metadata else {
                return false;
            };
            if metadata.get(key).and_then(Value::as_str) != expected {
                return false;
            }
            match value {
                Some(value) => {
                    metadata.insert(key.to_string(), Value::String(value.to_string()));
                }
                None => {
                    metadata.remove(key);
                }
            }
            true
        }))
    }

    async fn active_rule(&self, instance_id: &str) -> Result<Option<AssignmentRule>, IngestError> {
        Ok(self.with(|s| {
            s.rules
                .iter()
                .find(|r| r.instance_id == instance_id && r.is_active)
                .cloned()
        }))
    }

    async fn assign_round_robin(
        &self,
        rule_id: &str,
        conversation_id: &str,
        reason: &str,
    ) -> Result<Option<(String, Option<String>)>, IngestError> {
        self.with(|s| {
            if !s.conversations.iter().any(|c| c.id == conversation_id) {
                return Err(IngestError::NotFound("conversation", conversation_id.to_string()));
            }
            let Some(rule) = s.rules.iter_mut().find(|r| {
                r.id == rule_id && r.is_active && r.rule_type == RuleType::RoundRobin
            }) else {
                return Ok(None);
            };
            if rule.round_robin_agents.is_empty() {
                return Ok(None);
            }
            let next = next_index(rule.round_robin_last_index, rule.round_robin_agents.len());
            let Some(agent_id) = rule.round_robin_agents.get(next as usize).cloned() else {
                return Ok(None);
            };
            rule.round_robin_last_index = next;
            let previous = s.assign(conversation_id, &agent_id, reason)?;
            Ok(Some((agent_id, previous)))
        })
    }

    async fn assign_conversation(
        &self,
        conversation_id: &str,
        agent_id: &str,
        reason: &str,
    ) -> Result<Option<String>, IngestError> {
        self.with(|s| s.assign(conversation_id, agent_id, reason))
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<Option<String>, IngestError> {
        Ok(self.with(|s| {
            let duplicate = s.messages.iter().any(|m| {
                m.conversation_id == message.conversation_id && m.message_id == message.message_id
            });
            if duplicate {
                return None;
            }
            let id = Uuid::new_v4().to_string();
            s.messages.push(Message {
                id: id.clone(),
                conversation_id: message.conversation_id.clone(),
                message_id: message.message_id.clone(),
                remote_jid: message.remote_jid.clone(),
                content: message.content.clone(),
                kind: message.kind,
                media_url: None,
                media_mimetype: message.media_mimetype.clone(),
                is_from_me: message.is_from_me,
                status: DeliveryStatus::Sent,
                quoted_message_id: message.quoted_message_id.clone(),
                edited_at: None,
                original_content: None,
                timestamp: message.timestamp,
            });
            Some(id)
        }))
    }

    async fn set_message_media(&self, message_row_id: &str, url: &str) -> Result<(), IngestError> {
        self.with(|s| {
            if let Some(m) = s.messages.iter_mut().find(|m| m.id == message_row_id) {
                m.media_url = Some(url.to_string());
            }
        });
        Ok(())
    }

    async fn update_message_status(
        &self,
        provider_message_id: &str,
        status: DeliveryStatus,
    ) -> Result<u64, IngestError> {
        Ok(self.with(|s| {
            let mut updated = 0;
            for m in s
                .messages
                .iter_mut()
                .filter(|m| m.message_id == provider_message_id)
            {
                m.status = status;
                updated += 1;
            }
            updated
        }))
    }

    async fn find_message(
        &self,
        instance_id: &str,
        provider_message_id: &str,
    ) -> Result<Option<Message>, IngestError> {
        Ok(self.with(|s| {
            s.messages
                .iter()
                .rev()
                .filter(|m| m.message_id == provider_message_id)
                .find(|m| {
                    s.conversations
                        .iter()
                        .any(|c| c.id == m.conversation_id && c.instance_id == instance_id)
                })
                .cloned()
        }))
    }

    async fn insert_edit_history(
        &self,
        current: &Message,
        edited_at: DateTime<Utc>,
    ) -> Result<(), IngestError> {
        self.with(|s| {
            s.edits.push(EditRecord {
                message_id: current.message_id.clone(),
                previous_content: current.content.clone(),
                edited_at,
            })
        });
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
        self.with(|s| {
            for m in s.messages.iter_mut().filter(|m| {
                m.conversation_id == conversation_id && m.message_id == provider_message_id
            }) {
                m.content = content.to_string();
                m.edited_at = Some(edited_at);
                if m.original_content.is_none() {
                    m.original_content = Some(original_content.to_string());
                }
            }
        });
        Ok(())
    }

    async fn upsert_reaction(&self, reaction: &Reaction) -> Result<(), IngestError> {
        self.with(|s| {
            match s.reactions.iter_mut().find(|r| {
                r.conversation_id == reaction.conversation_id
                    && r.message_id == reaction.message_id
                    && r.reactor_jid == reaction.reactor_jid
            }) {
                Some(existing) => *existing = reaction.clone(),
                None => s.reactions.push(reaction.clone()),
            }
        });
        Ok(())
    }

    async fn delete_reaction(
        &self,
        conversation_id: &str,
        target_message_id: &str,
        reactor_jid: &str,
    ) -> Result<u64, IngestError> {
        Ok(self.with(|s| {
            let before = s.reactions.len();
            s.reactions.retain(|r| {
                !(r.conversation_id == conversation_id
                    && r.message_id == target_message_id
                    && r.reactor_jid == reactor_jid)
            });
            (before - s.reactions.len()) as u64
        }))
    }

    async fn latest_sentiment_at(
        &self,
        conversation_id: &str,
    ) -> Result<Option<DateTime<Utc>>, IngestError> {
        Ok(self.with(|s| {
            s.sentiment
                .iter()
                .filter(|(id, _)| id == conversation_id)
                .map(|(_, at)| *at)
                .max()
        }))
    }

    async fn count_inbound_since(
        &self,
        conversation_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<i64, IngestError> {
        Ok(self.with(|s| {
            s.messages
                .iter()
                .filter(|m| m.conversation_id == conversation_id && !m.is_from_me)
                .filter(|m| since.is_none_or(|since| m.timestamp > since))
                .count() as i64
        }))
    }
}
