//! Notification trigger: compares a conversation before and after
//! processing and emits admin alerts.
//!
//! `evaluate` is pure. Delivery goes through `Notifier`, which spawns each
//! sink call so a slow or failing sink never holds up inbound processing.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use crate::campaign::sender::MessageSender;
use crate::conversation::model::{Conversation, InterestLevel};
use crate::conversation::stage::Stage;
use crate::error::ChannelError;

/// Why an admin is being notified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// First message from a contact with no prior record.
    NewLead,
    /// The conversation crossed the close threshold.
    QualifiedLead,
    /// Interest changed to high or hot.
    HighInterest,
    /// Interest changed to needs-human.
    HumanInterventionRequested,
}

impl NotificationKind {
    pub fn title(&self) -> &'static str {
        match self {
            Self::NewLead => "New lead",
            Self::QualifiedLead => "Qualified lead",
            Self::HighInterest => "High interest",
            Self::HumanInterventionRequested => "Human intervention requested",
        }
    }
}

/// A single admin alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationEvent {
    pub kind: NotificationKind,
    pub identity: String,
    pub name: Option<String>,
    pub summary: Option<String>,
    pub stage: Stage,
    pub interest_level: InterestLevel,
}

impl NotificationEvent {
    fn from_conversation(kind: NotificationKind, conv: &Conversation) -> Self {
        Self {
            kind,
            identity: conv.identity.clone(),
            name: conv.display_name().map(str::to_string),
            summary: conv.summary.clone(),
            stage: conv.stage,
            interest_level: conv.interest_level,
        }
    }

    /// Plain-text rendering for chat delivery.
    pub fn render(&self) -> String {
        let mut text = format!("{}: {}", self.kind.title(), self.identity);
        if let Some(ref name) = self.name {
            text.push_str(&format!(" ({name})"));
        }
        text.push_str(&format!("\nStage: {}\nInterest: {}", self.stage, self.interest_level));
        if let Some(ref summary) = self.summary {
            text.push_str(&format!("\n{summary}"));
        }
        text
    }
}

/// Compute the notifications a processing step should emit.
///
/// Each rule is evaluated independently, so one step may emit several
/// events. `previous` is `None` for a contact seen for the first time.
pub fn evaluate(
    previous: Option<&Conversation>,
    updated: &Conversation,
    close_threshold: Stage,
) -> Vec<NotificationEvent> {
    let mut events = Vec::new();

    let prev_stage = previous.map(|p| p.stage).unwrap_or_default();
    let prev_interest = previous.map(|p| p.interest_level).unwrap_or_default();

    if previous.is_none() {
        events.push(NotificationEvent::from_conversation(NotificationKind::NewLead, updated));
    }

    if updated.stage >= close_threshold && prev_stage < close_threshold {
        events.push(NotificationEvent::from_conversation(
            NotificationKind::QualifiedLead,
            updated,
        ));
    }

    if updated.interest_level.is_high() && updated.interest_level != prev_interest {
        events.push(NotificationEvent::from_conversation(
            NotificationKind::HighInterest,
            updated,
        ));
    }

    if updated.interest_level == InterestLevel::NeedsHuman && prev_interest != InterestLevel::NeedsHuman {
        events.push(NotificationEvent::from_conversation(
            NotificationKind::HumanInterventionRequested,
            updated,
        ));
    }

    events
}

/// A destination for admin notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, event: &NotificationEvent) -> Result<(), ChannelError>;
}

/// Writes notifications to the log.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, event: &NotificationEvent) -> Result<(), ChannelError> {
        info!(
            kind = ?event.kind,
            identity = %event.identity,
            stage = %event.stage,
            interest = %event.interest_level,
            "Admin notification"
        );
        Ok(())
    }
}

/// Sends rendered notifications to admin WhatsApp numbers.
pub struct WhatsAppAdminSink {
    sender: Arc<dyn MessageSender>,
    admin_numbers: Vec<String>,
}

impl WhatsAppAdminSink {
    pub fn new(sender: Arc<dyn MessageSender>, admin_numbers: Vec<String>) -> Self {
        Self {
            sender,
            admin_numbers,
        }
    }
}

#[async_trait]
impl NotificationSink for WhatsAppAdminSink {
    fn name(&self) -> &str {
        "whatsapp_admin"
    }

    async fn notify(&self, event: &NotificationEvent) -> Result<(), ChannelError> {
        let text = event.render();
        let results = join_all(
            self.admin_numbers
                .iter()
                .map(|number| self.sender.send(number, &text)),
        )
        .await;

        let mut last_err = None;
        for (number, result) in self.admin_numbers.iter().zip(results) {
            if let Err(e) = result {
                warn!(admin = %number, error = %e, "Failed to notify admin");
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Fans notifications out to every sink without awaiting delivery.
#[derive(Clone, Default)]
pub struct Notifier {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Spawn one delivery per (event, sink). Failures are logged only.
    pub fn dispatch(&self, events: Vec<NotificationEvent>) {
        for event in events {
            let event = Arc::new(event);
            for sink in &self.sinks {
                let sink = Arc::clone(sink);
                let event = Arc::clone(&event);
                tokio::spawn(async move {
                    if let Err(e) = sink.notify(&event).await {
                        warn!(
                            sink = sink.name(),
                            kind = ?event.kind,
                            identity = %event.identity,
                            error = %e,
                            "Notification delivery failed"
                        );
                    }
                });
            }
        }
    }
}
