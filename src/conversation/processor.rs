//! Inbound processor: runs one webhook event through the funnel.
//!
//! gate → load → normalize → classify → stage engine → proposal →
//! notifications → save → outbound sends
//!
//! Everything up to the save runs under `processing_timeout`. Replies are
//! sent afterwards, still under the gate so bubbles keep their order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::campaign::sender::MessageSender;
use crate::config::FunnelConfig;
use crate::conversation::classifier::{Classifier, InputClass};
use crate::conversation::engine::{StageEngine, Transition};
use crate::conversation::gate::InboundGate;
use crate::conversation::model::{Conversation, Role};
use crate::conversation::normalize::{InboundEvent, MediaExtractor, normalize};
use crate::conversation::notify::{Notifier, evaluate};
use crate::conversation::stage::Stage;
use crate::error::ConversationError;
use crate::llm::adapter::{LanguageAdapter, OutboundMessage};
use crate::store::traits::Database;

/// Produces the deliverable (a proposal) for a lead entering the
/// deliverable stage.
#[async_trait]
pub trait ProposalGenerator: Send + Sync {
    /// Returns a short description of what was generated, or why not.
    async fn generate(&self, conversation: &Conversation) -> Result<String, String>;
}

/// What happened to an inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Another event for the same identity was in flight.
    Dropped,
    /// The conversation is closed; nothing was done.
    Closed,
    /// The contact opted out; the confirmation was sent.
    OptedOut,
    Processed {
        stage: Stage,
        adapter_failed: bool,
        messages_sent: usize,
    },
}

/// A saved turn whose replies have not been sent yet.
struct Prepared {
    outcome: ProcessOutcome,
    outbound: Vec<OutboundMessage>,
}

impl Prepared {
    fn silent(outcome: ProcessOutcome) -> Self {
        Self {
            outcome,
            outbound: Vec::new(),
        }
    }
}

pub struct InboundProcessor {
    gate: Arc<InboundGate>,
    db: Arc<dyn Database>,
    engine: StageEngine,
    classifier: Classifier,
    notifier: Notifier,
    sender: Arc<dyn MessageSender>,
    extractor: Option<Arc<dyn MediaExtractor>>,
    proposals: Option<Arc<dyn ProposalGenerator>>,
    config: FunnelConfig,
}

impl InboundProcessor {
    pub fn new(
        db: Arc<dyn Database>,
        adapter: Arc<dyn LanguageAdapter>,
        sender: Arc<dyn MessageSender>,
        config: FunnelConfig,
    ) -> Self {
        Self {
            gate: InboundGate::new(),
            db,
            engine: StageEngine::new(adapter, &config),
            classifier: Classifier::default_rules(),
            notifier: Notifier::new(),
            sender,
            extractor: None,
            proposals: None,
            config,
        }
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn MediaExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn with_proposal_generator(mut self, generator: Arc<dyn ProposalGenerator>) -> Self {
        self.proposals = Some(generator);
        self
    }

    pub fn gate(&self) -> &Arc<InboundGate> {
        &self.gate
    }

    /// Handle one inbound event. Events for an identity that is already
    /// being processed are dropped, not queued.
    pub async fn handle(&self, event: InboundEvent) -> Result<ProcessOutcome, ConversationError> {
        let Some(_guard) = self.gate.try_enter(&event.identity) else {
            debug!(identity = %event.identity, "Processing already in flight, dropping event");
            return Ok(ProcessOutcome::Dropped);
        };

        let timeout = self.config.processing_timeout;
        let result = match tokio::time::timeout(timeout, self.process(&event)).await {
            Ok(result) => result,
            Err(_) => Err(ConversationError::Timeout {
                identity: event.identity.clone(),
                timeout,
            }),
        };

        let prepared = match result {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(identity = %event.identity, error = %e, "Inbound processing failed");
                self.record_error(&event.identity, &e.to_string()).await;
                return Err(e);
            }
        };

        // The turn is already saved: send failures are logged, never recorded.
        let sent = self.send_all(&event.identity, &prepared.outbound).await;
        Ok(match prepared.outcome {
            ProcessOutcome::Processed {
                stage,
                adapter_failed,
                ..
            } => ProcessOutcome::Processed {
                stage,
                adapter_failed,
                messages_sent: sent,
            },
            other => other,
        })
    }

    /// Explicitly reset a conversation to the entry stage.
    pub async fn reset(&self, identity: &str) -> Result<bool, ConversationError> {
        let Some(_guard) = self.gate.try_enter(identity) else {
            return Err(ConversationError::InvalidEvent(format!(
                "conversation {identity} is being processed"
            )));
        };
        let Some(mut conv) = self.db.load_conversation(identity).await? else {
            return Ok(false);
        };
        conv.reset();
        self.db.save_conversation(&conv).await?;
        info!(identity, "Conversation reset");
        Ok(true)
    }

    async fn process(&self, event: &InboundEvent) -> Result<Prepared, ConversationError> {
        let table = self.engine.table();
        let previous = self.db.load_conversation(&event.identity).await?;
        let mut conv = previous
            .clone()
            .unwrap_or_else(|| Conversation::new(event.identity.clone()));

        if table.is_closed(conv.stage) {
            info!(identity = %conv.identity, stage = %conv.stage, "Conversation is closed, dropping event");
            return Ok(Prepared::silent(ProcessOutcome::Closed));
        }

        let input = normalize(event, self.extractor.as_deref()).await?;
        conv.known_fields.merge(&input.field_updates);
        let classified = self.classifier.classify(&input.text, input.from_attachment);
        debug!(identity = %conv.identity, class = classified.class.label(), "Classified inbound message");

        if classified.class == InputClass::OptOut {
            conv.push_turn(Role::Customer, input.text.clone());
            conv.opted_out = true;
            conv.push_turn(Role::Agent, self.config.opt_out_reply.clone());
            info!(identity = %conv.identity, "Contact opted out");

            self.notifier
                .dispatch(evaluate(previous.as_ref(), &conv, table.close_threshold()));
            self.db.save_conversation(&conv).await?;
            return Ok(Prepared {
                outcome: ProcessOutcome::OptedOut,
                outbound: vec![OutboundMessage::text(self.config.opt_out_reply.clone())],
            });
        }

        if conv.opted_out {
            conv.opted_out = false;
            info!(identity = %conv.identity, "Contact wrote again after opting out, opting back in");
        }

        let pending = conv.pending_context.take();
        let extra_context = join_context(
            pending.clone(),
            input
                .extraction_error
                .as_ref()
                .map(|e| format!("The customer's attachment could not be read: {e}")),
        );

        let change = match self.engine.transition(&conv, &classified, extra_context).await {
            Transition::Closed => return Ok(Prepared::silent(ProcessOutcome::Closed)),
            Transition::Advance(change) => change,
        };

        conv.push_turn(Role::Customer, input.text.clone());
        self.engine.apply(&mut conv, &change);

        if change.adapter_failed {
            // Not consumed: report it on the next successful call.
            conv.pending_context = pending;
        } else if change.requested(table.deliverable()) {
            self.generate_proposal(&mut conv).await;
        }

        if change.next_stage != change.previous_stage {
            info!(
                identity = %conv.identity,
                from = %change.previous_stage,
                to = %change.next_stage,
                "Stage transition"
            );
        }

        self.notifier
            .dispatch(evaluate(previous.as_ref(), &conv, table.close_threshold()));
        self.db.save_conversation(&conv).await?;

        Ok(Prepared {
            outcome: ProcessOutcome::Processed {
                stage: conv.stage,
                adapter_failed: change.adapter_failed,
                messages_sent: 0,
            },
            outbound: change.outbound,
        })
    }

    async fn generate_proposal(&self, conv: &mut Conversation) {
        let Some(ref generator) = self.proposals else {
            debug!(identity = %conv.identity, "No proposal generator configured");
            return;
        };
        let context = match generator.generate(conv).await {
            Ok(description) => {
                info!(identity = %conv.identity, "Proposal generated");
                format!("Proposal generated and sent to the customer: {description}")
            }
            Err(reason) => {
                warn!(identity = %conv.identity, error = %reason, "Proposal generation failed");
                format!("Proposal generation failed: {reason}")
            }
        };
        conv.pending_context = Some(context);
    }

    /// Send outbound messages in order, honoring each message's delay.
    /// Returns how many were delivered.
    async fn send_all(&self, identity: &str, messages: &[OutboundMessage]) -> usize {
        let mut sent = 0;
        for message in messages {
            if message.delay_before_ms > 0 {
                tokio::time::sleep(Duration::from_millis(message.delay_before_ms)).await;
            }
            match self.sender.send(identity, &message.text).await {
                Ok(receipt) => {
                    debug!(identity, message_id = %receipt.provider_message_id, "Reply sent");
                    sent += 1;
                }
                Err(e) => warn!(identity, error = %e, "Failed to send reply"),
            }
        }
        sent
    }

    /// Mark the stored conversation as errored. Best effort.
    async fn record_error(&self, identity: &str, reason: &str) {
        let conv = match self.db.load_conversation(identity).await {
            Ok(conv) => conv,
            Err(e) => {
                warn!(identity, error = %e, "Could not load conversation to record error");
                return;
            }
        };
        let mut conv = conv.unwrap_or_else(|| Conversation::new(identity));
        conv.mark_error(reason);
        if let Err(e) = self.db.save_conversation(&conv).await {
            warn!(identity, error = %e, "Could not record conversation error");
        }
    }
}

fn join_context(a: Option<String>, b: Option<String>) -> Option<String> {
    match (a, b) {
        (Some(a), Some(b)) => Some(format!("{a}\n{b}")),
        (a, b) => a.or(b),
    }
}
