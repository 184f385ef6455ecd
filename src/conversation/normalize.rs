//! Inbound event types and normalization of media into text.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ConversationError;

/// What kind of WhatsApp message arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Audio,
    Image,
    Document,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Text { body: String },
    Media { url: String, mime_type: String },
}

/// A single inbound message, as delivered by the webhook layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Sender phone number.
    pub identity: String,
    pub kind: MessageKind,
    pub payload: Payload,
}

impl InboundEvent {
    pub fn text(identity: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            kind: MessageKind::Text,
            payload: Payload::Text { body: body.into() },
        }
    }

    pub fn media(
        identity: impl Into<String>,
        kind: MessageKind,
        url: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> Self {
        Self {
            identity: identity.into(),
            kind,
            payload: Payload::Media {
                url: url.into(),
                mime_type: mime_type.into(),
            },
        }
    }
}

/// Output of a media extractor (transcription, OCR, bill parsing).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub text: String,
    /// Fields recognized in the media, e.g. the amount on an energy bill.
    pub structured_data: HashMap<String, serde_json::Value>,
    /// Set when extraction failed; the adapter is told about it.
    pub error: Option<String>,
}

/// Turns audio, images and documents into text.
#[async_trait]
pub trait MediaExtractor: Send + Sync {
    async fn extract(&self, kind: MessageKind, url: &str, mime_type: &str) -> Extraction;
}

/// An event reduced to text plus anything recognized along the way.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedInput {
    pub text: String,
    pub from_attachment: bool,
    /// String-valued structured data, ready to merge into known fields.
    pub field_updates: HashMap<String, String>,
    /// Extraction failure to surface as adapter context.
    pub extraction_error: Option<String>,
}

/// Normalize an inbound event. Media without an extractor, or whose
/// extraction yields nothing, is described by a placeholder text.
pub async fn normalize(
    event: &InboundEvent,
    extractor: Option<&dyn MediaExtractor>,
) -> Result<NormalizedInput, ConversationError> {
    if event.identity.trim().is_empty() {
        return Err(ConversationError::InvalidEvent("empty identity".into()));
    }

    match &event.payload {
        Payload::Text { body } => {
            if event.kind != MessageKind::Text {
                return Err(ConversationError::InvalidEvent(format!(
                    "{:?} message with a text payload",
                    event.kind
                )));
            }
            Ok(NormalizedInput {
                text: body.trim().to_string(),
                ..Default::default()
            })
        }
        Payload::Media { url, mime_type } => {
            let placeholder = format!("[{} received]", kind_label(event.kind));
            let Some(extractor) = extractor else {
                debug!(identity = %event.identity, kind = ?event.kind, "No media extractor configured");
                return Ok(NormalizedInput {
                    text: placeholder,
                    from_attachment: true,
                    ..Default::default()
                });
            };

            let extraction = extractor.extract(event.kind, url, mime_type).await;
            if let Some(ref err) = extraction.error {
                warn!(identity = %event.identity, kind = ?event.kind, error = %err, "Media extraction failed");
            }

            let field_updates = extraction
                .structured_data
                .into_iter()
                .filter_map(|(k, v)| match v {
                    serde_json::Value::String(s) => Some((k, s)),
                    serde_json::Value::Number(n) => Some((k, n.to_string())),
                    _ => None,
                })
                .collect();

            let text = if extraction.text.trim().is_empty() {
                placeholder
            } else {
                extraction.text.trim().to_string()
            };

            Ok(NormalizedInput {
                text,
                from_attachment: true,
                field_updates,
                extraction_error: extraction.error,
            })
        }
    }
}

fn kind_label(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Text => "text",
        MessageKind::Audio => "audio",
        MessageKind::Image => "image",
        MessageKind::Document => "document",
    }
}
