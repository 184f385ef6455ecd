//! WhatsApp Cloud API sender (Graph API `/messages`).

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::campaign::sender::{MessageSender, SendReceipt};
use crate::config::WhatsAppConfig;
use crate::error::ChannelError;

const GRAPH_API_BASE: &str = "https://graph.facebook.com/v20.0";
const CHANNEL: &str = "whatsapp";

pub struct WhatsAppCloudSender {
    http: reqwest::Client,
    access_token: SecretString,
    messages_url: String,
}

impl WhatsAppCloudSender {
    pub fn new(config: &WhatsAppConfig) -> Result<Self, ChannelError> {
        let phone_number_id = config.phone_number_id.trim();
        if phone_number_id.is_empty() {
            return Err(send_failed("phone number id is required"));
        }
        if config.access_token.expose_secret().trim().is_empty() {
            return Err(send_failed("access token is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(config.send_timeout)
            .build()
            .map_err(|e| ChannelError::Http(e.to_string()))?;

        Ok(Self {
            http,
            access_token: config.access_token.clone(),
            messages_url: format!("{GRAPH_API_BASE}/{phone_number_id}/messages"),
        })
    }
}

fn send_failed(reason: impl Into<String>) -> ChannelError {
    ChannelError::SendFailed {
        name: CHANNEL.to_string(),
        reason: reason.into(),
    }
}

#[derive(Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SentMessage>,
}

#[derive(Deserialize)]
struct SentMessage {
    id: String,
}

/// Request body for a plain text message.
fn text_payload(to: &str, body: &str) -> serde_json::Value {
    serde_json::json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
        "type": "text",
        "text": {
            "preview_url": false,
            "body": body,
        }
    })
}

#[async_trait]
impl MessageSender for WhatsAppCloudSender {
    fn name(&self) -> &str {
        CHANNEL
    }

    async fn send(&self, identity: &str, text: &str) -> Result<SendReceipt, ChannelError> {
        let to = identity.trim().trim_start_matches('+');
        if to.is_empty() {
            return Err(send_failed("recipient phone number is required"));
        }
        let body = text.trim();
        if body.is_empty() {
            return Err(send_failed("message body is empty"));
        }

        let response = self
            .http
            .post(&self.messages_url)
            .bearer_auth(self.access_token.expose_secret())
            .json(&text_payload(to, body))
            .send()
            .await
            .map_err(|e| ChannelError::Http(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ChannelError::RateLimited {
                name: CHANNEL.to_string(),
            });
        }
        let raw = response
            .text()
            .await
            .map_err(|e| ChannelError::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(send_failed(format!("status={status} body={raw}")));
        }

        let parsed: SendResponse =
            serde_json::from_str(&raw).map_err(|e| send_failed(format!("unexpected response: {e}")))?;
        let provider_message_id = parsed
            .messages
            .into_iter()
            .next()
            .map(|m| m.id)
            .ok_or_else(|| send_failed("response carried no message id"))?;

        debug!(to, message_id = %provider_message_id, "WhatsApp message accepted");
        Ok(SendReceipt {
            provider_message_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(phone_number_id: &str) -> WhatsAppConfig {
        WhatsAppConfig {
            access_token: SecretString::from("EAAG-test"),
            phone_number_id: phone_number_id.to_string(),
            admin_numbers: vec![],
            min_send_interval: Duration::from_millis(250),
            send_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn builds_messages_url() {
        let sender = WhatsAppCloudSender::new(&config(" 1234567890 ")).unwrap();
        assert_eq!(sender.messages_url, "https://graph.facebook.com/v20.0/1234567890/messages");
    }

    #[test]
    fn requires_phone_number_id() {
        assert!(WhatsAppCloudSender::new(&config("")).is_err());
    }

    #[test]
    fn payload_shape() {
        let payload = text_payload("5581988887777", "Oi Ana!");
        assert_eq!(payload["messaging_product"], "whatsapp");
        assert_eq!(payload["to"], "5581988887777");
        assert_eq!(payload["type"], "text");
        assert_eq!(payload["text"]["body"], "Oi Ana!");
        assert_eq!(payload["text"]["preview_url"], false);
    }

    #[tokio::test]
    async fn rejects_empty_body_without_network() {
        let sender = WhatsAppCloudSender::new(&config("1234567890")).unwrap();
        let err = sender.send("5581988887777", "   ").await.unwrap_err();
        assert!(matches!(err, ChannelError::SendFailed { .. }));
    }

    #[test]
    fn parses_send_response() {
        let raw = r#"{"messaging_product":"whatsapp","contacts":[{"input":"5581","wa_id":"5581"}],"messages":[{"id":"wamid.HBgM"}]}"#;
        let parsed: SendResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.messages[0].id, "wamid.HBgM");
    }
}
