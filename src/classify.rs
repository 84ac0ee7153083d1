//! Maps the provider's `message` object onto a tagged union keyed by kind.
//!
//! The gateway payload carries exactly one of many optional sub-objects
//! (`conversation`, `imageMessage`, `reactionMessage`, ...). Probing happens
//! here, once, in precedence order; the rest of the pipeline matches on
//! [`InboundContent`].

use serde_json::Value;

use crate::types::MessageKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundContent {
    Text {
        body: String,
    },
    Media {
        kind: MessageKind,
        caption: Option<String>,
        mimetype: Option<String>,
    },
    Contact {
        display_name: Option<String>,
    },
    Contacts {
        count: usize,
    },
    Reaction {
        target_id: Option<String>,
        emoji: String,
    },
}

const MEDIA_FIELDS: [(MessageKind, &str); 5] = [
    (MessageKind::Image, "imageMessage"),
    (MessageKind::Audio, "audioMessage"),
    (MessageKind::Video, "videoMessage"),
    (MessageKind::Document, "documentMessage"),
    (MessageKind::Sticker, "stickerMessage"),
];

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn present<'a>(message: &'a Value, field: &str) -> Option<&'a Value> {
    message.get(field).filter(|v| !v.is_null())
}

/// Precedence: reaction > text > image > audio > video > document > sticker >
/// contact > contact list. Anything else is treated as text.
pub fn classify(message: &Value) -> InboundContent {
    if let Some(reaction) = present(message, "reactionMessage") {
        return InboundContent::Reaction {
            target_id: non_empty_str(reaction.get("key").and_then(|k| k.get("id"))),
            emoji: reaction
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
        };
    }

    let conversation = non_empty_str(message.get("conversation"));
    if conversation.is_some() || present(message, "extendedTextMessage").is_some() {
        let body = conversation
            .or_else(|| non_empty_str(message.pointer("/extendedTextMessage/text")))
            .unwrap_or_default();
        return InboundContent::Text { body };
    }

    for (kind, field) in MEDIA_FIELDS {
        if let Some(media) = present(message, field) {
            return InboundContent::Media {
                kind,
                caption: non_empty_str(media.get("caption")),
                mimetype: non_empty_str(media.get("mimetype")),
            };
        }
    }

    if let Some(contact) = present(message, "contactMessage") {
        return InboundContent::Contact {
            display_name: non_empty_str(contact.get("displayName")),
        };
    }

    if let Some(list) = present(message, "contactsArrayMessage") {
        let count = list
            .get("contacts")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);
        return InboundContent::Contacts { count };
    }

    InboundContent::Text {
        body: String::new(),
    }
}

impl InboundContent {
    pub fn kind(&self) -> MessageKind {
        match self {
            InboundContent::Text { .. } => MessageKind::Text,
            InboundContent::Media { kind, .. } => *kind,
            InboundContent::Contact { .. } => MessageKind::Contact,
            InboundContent::Contacts { .. } => MessageKind::Contacts,
            InboundContent::Reaction { .. } => MessageKind::Reaction,
        }
    }

    /// Text shown in the inbox: the literal text, the media caption, or a
    /// kind-specific placeholder.
    pub fn display_content(&self) -> String {
        match self {
            InboundContent::Text { body } if !body.is_empty() => body.clone(),
            InboundContent::Text { .. } => "Mensagem".to_string(),
            InboundContent::Media {
                caption: Some(caption),
                ..
            } => caption.clone(),
            InboundContent::Media { kind, .. } => media_placeholder(*kind).to_string(),
            InboundContent::Contact { display_name } => display_name
                .clone()
                .unwrap_or_else(|| "📇 Contato".to_string()),
            InboundContent::Contacts { count } => {
                format!("📇 {count} contato{}", if *count == 1 { "" } else { "s" })
            }
            InboundContent::Reaction { emoji, .. } => emoji.clone(),
        }
    }

    /// Mimetype recorded for attachments; `<kind>/*` when the gateway sent none.
    pub fn media_mimetype(&self) -> Option<String> {
        match self {
            InboundContent::Media { kind, mimetype, .. } => Some(
                mimetype
                    .clone()
                    .unwrap_or_else(|| format!("{}/*", kind.as_str())),
            ),
            _ => None,
        }
    }
}

fn media_placeholder(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Image => "📷 Imagem",
        MessageKind::Audio => "🎵 Áudio",
        MessageKind::Video => "🎥 Vídeo",
        MessageKind::Document => "📄 Documento",
        MessageKind::Sticker => "🎨 Sticker",
        _ => "Mensagem",
    }
}

/// Provider id of the message being replied to, if any.
pub fn quoted_message_id(message: &Value) -> Option<String> {
    if let Some(id) = non_empty_str(message.pointer("/extendedTextMessage/contextInfo/stanzaId")) {
        return Some(id);
    }
    MEDIA_FIELDS.iter().find_map(|(_, field)| {
        non_empty_str(
            message
                .get(*field)
                .and_then(|m| m.pointer("/contextInfo/stanzaId")),
        )
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edit {
    pub target_id: String,
    pub new_content: String,
}

fn edited_wrapper(message: &Value) -> Option<&Value> {
    present(message, "editedMessage")
        .or_else(|| message.pointer("/protocolMessage/editedMessage").filter(|v| !v.is_null()))
}

/// True when the payload is an edit of an earlier message rather than a new one.
pub fn is_edit(message: &Value) -> bool {
    edited_wrapper(message).is_some()
}

/// Extracts the edit target and replacement text. `fallback_id` is the id on
/// the envelope key, used when the wrapper does not name its target.
pub fn extract_edit(message: &Value, fallback_id: &str) -> Option<Edit> {
    let edited = edited_wrapper(message)?;
    // Some gateways nest the replacement one level deeper under `message`.
    let body = edited.get("message").filter(|v| v.is_object()).unwrap_or(edited);

    let target_id = non_empty_str(edited.pointer("/key/id"))
        .or_else(|| non_empty_str(message.pointer("/protocolMessage/key/id")))
        .or_else(|| non_empty_str(body.pointer("/protocolMessage/key/id")))
        .or_else(|| Some(fallback_id.to_string()).filter(|id| !id.is_empty()))?;

    let new_content = non_empty_str(body.get("conversation"))
        .or_else(|| non_empty_str(body.pointer("/extendedTextMessage/text")))
        .or_else(|| {
            MEDIA_FIELDS
                .iter()
                .find_map(|(_, field)| non_empty_str(body.get(*field).and_then(|m| m.get("caption"))))
        })
        .unwrap_or_default();

    Some(Edit {
        target_id,
        new_content,
    })
}
