//! Stage engine: asks the language adapter for a decision and bounds it.
//!
//! The engine never fails: adapter errors and timeouts degrade to the
//! fallback message with the stage held. Applying a transition to a
//! conversation is a separate, pure step.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::FunnelConfig;
use crate::conversation::classifier::ClassifiedInput;
use crate::conversation::model::{Conversation, ConversationStatus, InterestLevel, Role};
use crate::conversation::stage::{Stage, StageTable};
use crate::error::LlmError;
use crate::llm::adapter::{AdapterDecision, AdapterRequest, LanguageAdapter, OutboundMessage};

/// Result of running one inbound message through the stage engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The conversation is at or beyond the ceiling; nothing was done.
    Closed,
    /// The adapter was consulted (or failed and the fallback was used).
    Advance(StageChange),
}

/// A bounded stage change plus everything the adapter asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct StageChange {
    pub previous_stage: Stage,
    pub next_stage: Stage,
    pub field_updates: HashMap<String, String>,
    pub outbound: Vec<OutboundMessage>,
    pub interest_level: Option<InterestLevel>,
    pub summary: Option<String>,
    /// The adapter's own proposal after clamping, before the regression
    /// guard. `None` when the fallback was used.
    pub proposed_stage: Option<Stage>,
    /// The adapter failed or timed out and the fallback was used.
    pub adapter_failed: bool,
    /// The raw decision, recorded in history as the agent's turn.
    pub decision: Option<AdapterDecision>,
}

impl StageChange {
    /// Whether the adapter moved the conversation into `stage`, either
    /// forward or back from a later stage. Staying put is not a request.
    pub fn requested(&self, stage: Stage) -> bool {
        self.proposed_stage == Some(stage) && self.next_stage == stage && self.previous_stage != stage
    }
}

pub struct StageEngine {
    adapter: Arc<dyn LanguageAdapter>,
    table: StageTable,
    adapter_timeout: Duration,
    fallback_message: String,
    history_window: usize,
    max_reply_delay: Duration,
}

impl StageEngine {
    pub fn new(adapter: Arc<dyn LanguageAdapter>, config: &FunnelConfig) -> Self {
        Self {
            adapter,
            table: config.stage_table.clone(),
            adapter_timeout: config.adapter_timeout,
            fallback_message: config.fallback_message.clone(),
            history_window: config.history_window,
            max_reply_delay: config.max_reply_delay,
        }
    }

    pub fn table(&self) -> &StageTable {
        &self.table
    }

    /// Decide the next stage for `conversation` given a classified input.
    ///
    /// `conversation.pending_context` is passed as extra context; the caller
    /// clears it once the transition is applied.
    pub async fn transition(
        &self,
        conversation: &Conversation,
        classified: &ClassifiedInput,
        extra_context: Option<String>,
    ) -> Transition {
        let current = conversation.stage;
        if self.table.is_closed(current) {
            info!(
                identity = %conversation.identity,
                stage = %current,
                "Conversation is closed, dropping inbound message"
            );
            return Transition::Closed;
        }

        let request = AdapterRequest {
            history: conversation.recent_history(self.history_window).to_vec(),
            stage: current,
            known_fields: conversation.known_fields.clone(),
            classified: classified.clone(),
            extra_context,
        };

        let result = match tokio::time::timeout(self.adapter_timeout, self.adapter.decide(&request)).await {
            Ok(inner) => inner,
            Err(_) => Err(LlmError::Timeout(self.adapter_timeout)),
        };

        match result {
            Ok(decision) => {
                let next_stage = self.table.resolve(current, decision.next_stage);
                debug!(
                    identity = %conversation.identity,
                    from = %current,
                    to = %next_stage,
                    proposed = decision.next_stage,
                    "Stage decision"
                );
                let max_delay_ms = self.max_reply_delay.as_millis() as u64;
                let outbound = decision
                    .messages
                    .iter()
                    .map(|m| OutboundMessage {
                        text: m.text.clone(),
                        delay_before_ms: m.delay_before_ms.min(max_delay_ms),
                    })
                    .collect();
                Transition::Advance(StageChange {
                    previous_stage: current,
                    next_stage,
                    field_updates: decision.field_updates.clone(),
                    outbound,
                    interest_level: decision.interest_level,
                    summary: decision.summary.clone(),
                    proposed_stage: Some(self.table.clamp(decision.next_stage)),
                    adapter_failed: false,
                    decision: Some(decision),
                })
            }
            Err(e) => {
                warn!(
                    identity = %conversation.identity,
                    stage = %current,
                    error = %e,
                    "Language adapter failed, sending fallback"
                );
                Transition::Advance(self.fallback(current))
            }
        }
    }

    fn fallback(&self, current: Stage) -> StageChange {
        StageChange {
            previous_stage: current,
            next_stage: current,
            field_updates: HashMap::new(),
            outbound: vec![OutboundMessage::text(self.fallback_message.clone())],
            interest_level: None,
            summary: None,
            proposed_stage: None,
            adapter_failed: true,
            decision: None,
        }
    }

    /// Apply a stage change to the conversation. The customer turn must
    /// already be in the history.
    pub fn apply(&self, conversation: &mut Conversation, change: &StageChange) {
        let agent_turn = match &change.decision {
            Some(decision) => serde_json::to_string(decision).unwrap_or_else(|_| joined_text(&change.outbound)),
            None => joined_text(&change.outbound),
        };
        conversation.push_turn(Role::Agent, agent_turn);

        conversation.stage = change.next_stage;
        let changed = conversation.known_fields.merge(&change.field_updates);
        if changed > 0 {
            debug!(identity = %conversation.identity, changed, "Merged known fields");
        }
        if let Some(level) = change.interest_level {
            conversation.interest_level = level;
        }
        if let Some(ref summary) = change.summary {
            conversation.summary = Some(summary.clone());
        }

        if !change.adapter_failed {
            conversation.status = ConversationStatus::Active;
            conversation.error_reason = None;
        }
        if self.table.is_closed(conversation.stage) {
            conversation.status = ConversationStatus::Completed;
        }
    }
}

fn joined_text(messages: &[OutboundMessage]) -> String {
    messages
        .iter()
        .map(|m| m.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}
