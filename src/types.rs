use std::{path::PathBuf, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::{
    automation::AnalysisClient, background::Background, gateway::GatewayClient,
    media::BlobStore, store::Store,
};

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub gateway: GatewayClient,
    pub blobs: Arc<dyn BlobStore>,
    pub analysis: AnalysisClient,
    pub background: Background,
    pub automation_threshold: i64,
    pub media_storage_dir: PathBuf,
}

/// Envelope posted by the gateway for every event.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub instance: String,
    #[serde(default)]
    pub data: Value,
}

/// `data` of a `messages.upsert` event.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertData {
    pub key: MessageKey,
    #[serde(default)]
    pub push_name: Option<String>,
    #[serde(default)]
    pub message: Value,
    #[serde(default)]
    pub message_timestamp: Option<Value>,
}

/// Provider message key. Unknown fields (participant, etc.) are kept so the key
/// can be echoed back to the gateway verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    #[serde(default, deserialize_with = "null_as_default")]
    pub remote_jid: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub from_me: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Gateways send `null` for key fields they do not know.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl UpsertData {
    /// Gateway-supplied send time in epoch seconds; receipt time when absent.
    pub fn timestamp(&self) -> DateTime<Utc> {
        let seconds = match &self.message_timestamp {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
            Some(Value::Object(obj)) => obj.get("low").and_then(Value::as_i64),
            _ => None,
        };
        seconds
            .and_then(|s| DateTime::<Utc>::from_timestamp(s, 0))
            .unwrap_or_else(Utc::now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    SelfHosted,
    Cloud,
    Mock,
    Aggregator,
}

impl ProviderKind {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cloud" => ProviderKind::Cloud,
            "mock" => ProviderKind::Mock,
            "aggregator" | "uazapi" => ProviderKind::Aggregator,
            _ => ProviderKind::SelfHosted,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::SelfHosted => "self_hosted",
            ProviderKind::Cloud => "cloud",
            ProviderKind::Mock => "mock",
            ProviderKind::Aggregator => "aggregator",
        }
    }

    /// Cloud and aggregator gateways take a bearer token; self-hosted ones an `apikey` header.
    pub fn uses_bearer_auth(&self) -> bool {
        matches!(self, ProviderKind::Cloud | ProviderKind::Aggregator)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Connected,
    Connecting,
    Disconnected,
}

impl InstanceStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "connected" => InstanceStatus::Connected,
            "connecting" => InstanceStatus::Connecting,
            _ => InstanceStatus::Disconnected,
        }
    }

    /// Maps a gateway connection state (`open`, `close`, ...) to our status.
    pub fn from_gateway_state(state: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "open" | "connected" => InstanceStatus::Connected,
            "connecting" => InstanceStatus::Connecting,
            _ => InstanceStatus::Disconnected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Connected => "connected",
            InstanceStatus::Connecting => "connecting",
            InstanceStatus::Disconnected => "disconnected",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub instance_name: String,
    pub instance_id_external: Option<String>,
    pub provider: ProviderKind,
    pub status: InstanceStatus,
}

impl Instance {
    /// Identifier used when addressing the gateway. Cloud gateways know the
    /// instance by its external UUID, everything else by name.
    pub fn gateway_name(&self) -> &str {
        match (&self.provider, self.instance_id_external.as_deref()) {
            (ProviderKind::Cloud, Some(external)) if !external.is_empty() => external,
            _ => &self.instance_name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstanceSecrets {
    pub api_url: String,
    pub api_key: String,
}

/// Everything needed to call the gateway on behalf of one instance.
#[derive(Debug, Clone)]
pub struct GatewayCredentials {
    pub api_url: String,
    pub api_key: String,
    pub provider: ProviderKind,
    pub instance: String,
}

impl GatewayCredentials {
    pub fn new(instance: &Instance, secrets: InstanceSecrets) -> Self {
        Self {
            api_url: secrets.api_url.trim_end_matches('/').to_string(),
            api_key: secrets.api_key,
            provider: instance.provider,
            instance: instance.gateway_name().to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Contact {
    pub id: String,
    pub instance_id: String,
    pub phone_number: String,
    pub name: String,
    pub is_group: bool,
    pub profile_picture_url: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewContact {
    pub instance_id: String,
    pub phone_number: String,
    pub name: String,
    pub is_group: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationStatus {
    Active,
    Closed,
    Archived,
}

impl ConversationStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "closed" => ConversationStatus::Closed,
            "archived" => ConversationStatus::Archived,
            _ => ConversationStatus::Active,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Closed => "closed",
            ConversationStatus::Archived => "archived",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    pub instance_id: String,
    pub contact_id: String,
    pub status: ConversationStatus,
    pub assigned_to: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_message_preview: Option<String>,
    pub unread_count: i32,
    pub metadata: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Image,
    Audio,
    Video,
    Document,
    Sticker,
    Contact,
    Contacts,
    Reaction,
}

impl MessageKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "image" => MessageKind::Image,
            "audio" => MessageKind::Audio,
            "video" => MessageKind::Video,
            "document" => MessageKind::Document,
            "sticker" => MessageKind::Sticker,
            "contact" => MessageKind::Contact,
            "contacts" => MessageKind::Contacts,
            "reaction" => MessageKind::Reaction,
            _ => MessageKind::Text,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Audio => "audio",
            MessageKind::Video => "video",
            MessageKind::Document => "document",
            MessageKind::Sticker => "sticker",
            MessageKind::Contact => "contact",
            MessageKind::Contacts => "contacts",
            MessageKind::Reaction => "reaction",
        }
    }

    /// Whether messages of this kind carry a downloadable attachment.
    pub fn has_media(&self) -> bool {
        matches!(
            self,
            MessageKind::Image
                | MessageKind::Audio
                | MessageKind::Video
                | MessageKind::Document
                | MessageKind::Sticker
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeliveryStatus {
    Failed,
    Sent,
    Delivered,
    Read,
}

impl DeliveryStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "delivered" => DeliveryStatus::Delivered,
            "read" => DeliveryStatus::Read,
            "failed" => DeliveryStatus::Failed,
            _ => DeliveryStatus::Sent,
        }
    }

    /// Gateway status codes arrive either numerically or as ack names.
    pub fn from_gateway(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => match n.as_i64()? {
                0 => Some(DeliveryStatus::Failed),
                1 => Some(DeliveryStatus::Sent),
                2 => Some(DeliveryStatus::Delivered),
                3 | 4 => Some(DeliveryStatus::Read),
                _ => None,
            },
            Value::String(s) => match s.trim().to_ascii_uppercase().as_str() {
                "ERROR" | "FAILED" => Some(DeliveryStatus::Failed),
                "PENDING" | "SERVER_ACK" | "SENT" => Some(DeliveryStatus::Sent),
                "DELIVERY_ACK" | "DELIVERED" => Some(DeliveryStatus::Delivered),
                "READ" | "PLAYED" => Some(DeliveryStatus::Read),
                other => other.parse::<i64>().ok().and_then(|code| {
                    DeliveryStatus::from_gateway(&Value::Number(code.into()))
                }),
            },
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub message_id: String,
    pub remote_jid: String,
    pub content: String,
    pub kind: MessageKind,
    pub media_url: Option<String>,
    pub media_mimetype: Option<String>,
    pub is_from_me: bool,
    pub status: DeliveryStatus,
    pub quoted_message_id: Option<String>,
    pub edited_at: Option<DateTime<Utc>>,
    pub original_content: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub message_id: String,
    pub remote_jid: String,
    pub content: String,
    pub kind: MessageKind,
    pub media_mimetype: Option<String>,
    pub is_from_me: bool,
    pub quoted_message_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reaction {
    pub message_id: String,
    pub conversation_id: String,
    pub emoji: String,
    pub reactor_jid: String,
    pub is_from_me: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleType {
    Fixed,
    RoundRobin,
}

impl RuleType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "fixed" => Some(RuleType::Fixed),
            "round_robin" => Some(RuleType::RoundRobin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::Fixed => "fixed",
            RuleType::RoundRobin => "round_robin",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssignmentRule {
    pub id: String,
    pub instance_id: String,
    pub name: String,
    pub rule_type: RuleType,
    pub fixed_agent_id: Option<String>,
    pub round_robin_agents: Vec<String>,
    pub round_robin_last_index: i32,
    pub is_active: bool,
}
