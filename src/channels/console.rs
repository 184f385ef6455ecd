//! Console channel: stdin commands and stdout replies for local runs.
//!
//! Each stdin line is either an inbound event as JSON or an operator
//! command (`/campaign <json>`, `/start <id>`, `/pause <id>`,
//! `/resume <id>`, `/cancel <id>`, `/status`).

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::campaign::model::Campaign;
use crate::campaign::sender::{MessageSender, SendReceipt};
use crate::conversation::normalize::InboundEvent;
use crate::error::ChannelError;

/// A parsed stdin line.
#[derive(Debug)]
pub enum ConsoleInput {
    Event(InboundEvent),
    CreateCampaign(Box<Campaign>),
    Start(Uuid),
    Pause(Uuid),
    Resume(Uuid),
    Cancel(Uuid),
    Status,
}

/// Parse one line of console input.
pub fn parse_line(line: &str) -> Result<ConsoleInput, String> {
    let line = line.trim();
    let Some(command) = line.strip_prefix('/') else {
        return serde_json::from_str(line)
            .map(ConsoleInput::Event)
            .map_err(|e| format!("invalid inbound event: {e}"));
    };

    let (name, arg) = command.split_once(' ').unwrap_or((command, ""));
    let arg = arg.trim();
    let id = || Uuid::parse_str(arg).map_err(|e| format!("invalid campaign id '{arg}': {e}"));
    match name {
        "campaign" => serde_json::from_str(arg)
            .map(|c| ConsoleInput::CreateCampaign(Box::new(c)))
            .map_err(|e| format!("invalid campaign: {e}")),
        "start" => id().map(ConsoleInput::Start),
        "pause" => id().map(ConsoleInput::Pause),
        "resume" => id().map(ConsoleInput::Resume),
        "cancel" => id().map(ConsoleInput::Cancel),
        "status" => Ok(ConsoleInput::Status),
        other => Err(format!("unknown command /{other}")),
    }
}

/// Read stdin lines until EOF, forwarding parsed input.
pub fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<ConsoleInput> {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match parse_line(&line) {
                        Ok(input) => {
                            if tx.send(input).is_err() {
                                break;
                            }
                        }
                        Err(e) => eprintln!("   {e}"),
                    }
                }
                Ok(None) => break, // EOF
                Err(e) => {
                    tracing::error!("Error reading stdin: {}", e);
                    break;
                }
            }
        }
    });

    rx
}

/// Prints outbound messages instead of sending them.
#[derive(Default)]
pub struct ConsoleSender {
    counter: AtomicU64,
}

impl ConsoleSender {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageSender for ConsoleSender {
    fn name(&self) -> &str {
        "console"
    }

    async fn send(&self, identity: &str, text: &str) -> Result<SendReceipt, ChannelError> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        println!("→ {identity}: {text}");
        Ok(SendReceipt {
            provider_message_id: format!("console-{n}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_inbound_event() {
        let line = r#"{"identity":"5581988887777","kind":"text","payload":{"type":"text","body":"oi"}}"#;
        match parse_line(line).unwrap() {
            ConsoleInput::Event(event) => assert_eq!(event.identity, "5581988887777"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_commands() {
        let id = Uuid::new_v4();
        assert!(matches!(parse_line(&format!("/pause {id}")).unwrap(), ConsoleInput::Pause(p) if p == id));
        assert!(matches!(parse_line("/status").unwrap(), ConsoleInput::Status));
        assert!(parse_line("/pause nope").is_err());
        assert!(parse_line("/launch").is_err());
        assert!(parse_line("not json").is_err());
    }

    #[test]
    fn parses_campaign_definition() {
        let campaign = Campaign::new("winback", "Oi {{name}}!");
        let line = format!("/campaign {}", serde_json::to_string(&campaign).unwrap());
        match parse_line(&line).unwrap() {
            ConsoleInput::CreateCampaign(parsed) => assert_eq!(parsed.name, "winback"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn console_sender_numbers_messages() {
        let sender = ConsoleSender::new();
        let first = sender.send("5581", "a").await.unwrap();
        let second = sender.send("5581", "b").await.unwrap();
        assert_ne!(first.provider_message_id, second.provider_message_id);
    }
}
