//! Language adapter: turns conversation state into a structured decision.
//!
//! The adapter is untrusted: malformed output is an `LlmError` the stage
//! engine recovers from, never a crash.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::conversation::classifier::ClassifiedInput;
use crate::conversation::model::{HistoryEntry, InterestLevel, KnownFields, Role};
use crate::conversation::stage::{Stage, StageTable};
use crate::error::LlmError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};

/// Max tokens for a funnel decision.
const DECISION_MAX_TOKENS: u32 = 1024;

/// Longest pause a parsed reply bubble may ask for.
pub const MAX_DELAY_BEFORE_MS: u64 = 60_000;

/// Temperature for decisions (some variety in wording, stable structure).
const DECISION_TEMPERATURE: f32 = 0.4;

/// Everything the adapter sees for one inbound message.
#[derive(Debug, Clone, Serialize)]
pub struct AdapterRequest {
    pub history: Vec<HistoryEntry>,
    pub stage: Stage,
    pub known_fields: KnownFields,
    pub classified: ClassifiedInput,
    /// Out-of-band context, e.g. the result of proposal generation.
    pub extra_context: Option<String>,
}

/// One outbound chat bubble with the pause to take before sending it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub text: String,
    #[serde(default, alias = "delayBeforeMs")]
    pub delay_before_ms: u64,
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            delay_before_ms: 0,
        }
    }
}

/// The adapter's structured decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdapterDecision {
    /// Proposed stage; the engine clamps it.
    pub next_stage: i64,
    pub messages: Vec<OutboundMessage>,
    pub field_updates: HashMap<String, String>,
    pub interest_level: Option<InterestLevel>,
    pub summary: Option<String>,
}

impl AdapterDecision {
    /// A decision that moves to `next_stage` and says `messages`.
    pub fn new(next_stage: i64, messages: &[&str]) -> Self {
        Self {
            next_stage,
            messages: messages.iter().map(|m| OutboundMessage::text(*m)).collect(),
            field_updates: HashMap::new(),
            interest_level: None,
            summary: None,
        }
    }

    pub fn with_field(mut self, key: &str, value: &str) -> Self {
        self.field_updates.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_interest(mut self, level: InterestLevel) -> Self {
        self.interest_level = Some(level);
        self
    }

    pub fn with_summary(mut self, summary: &str) -> Self {
        self.summary = Some(summary.to_string());
        self
    }
}

/// Given conversation state, decide the next stage and what to say.
#[async_trait]
pub trait LanguageAdapter: Send + Sync {
    async fn decide(&self, request: &AdapterRequest) -> Result<AdapterDecision, LlmError>;
}

/// `LanguageAdapter` backed by a text-completion `LlmProvider`.
pub struct LlmLanguageAdapter {
    llm: Arc<dyn LlmProvider>,
    table: StageTable,
}

impl LlmLanguageAdapter {
    pub fn new(llm: Arc<dyn LlmProvider>, table: StageTable) -> Self {
        Self { llm, table }
    }
}

#[async_trait]
impl LanguageAdapter for LlmLanguageAdapter {
    async fn decide(&self, request: &AdapterRequest) -> Result<AdapterDecision, LlmError> {
        let mut messages = vec![ChatMessage::system(build_system_prompt(&self.table))];
        for entry in &request.history {
            messages.push(match entry.role {
                Role::Customer => ChatMessage::user(&entry.text),
                Role::Agent => ChatMessage::assistant(&entry.text),
            });
        }
        messages.push(ChatMessage::user(build_turn_prompt(request)));

        let completion = CompletionRequest::new(messages)
            .with_temperature(DECISION_TEMPERATURE)
            .with_max_tokens(DECISION_MAX_TOKENS);

        let response = self.llm.complete(completion).await?;
        debug!(
            model = self.llm.model_name(),
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "Adapter completion received"
        );

        parse_decision(&response.content).map_err(|reason| {
            warn!(raw_response = %response.content, error = %reason, "Failed to parse adapter decision");
            LlmError::InvalidResponse {
                provider: self.llm.model_name().to_string(),
                reason,
            }
        })
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_system_prompt(table: &StageTable) -> String {
    let mut stages = String::new();
    for stage in Stage::ALL.iter().filter(|s| **s <= table.ceiling()) {
        stages.push_str(&format!("  {} = {}\n", stage.index(), stage.name()));
    }

    format!(
        "You are a sales assistant qualifying leads over WhatsApp.\n\n\
         Funnel stages:\n{stages}\n\
         Respond with ONLY a JSON object:\n\
         {{\"next_stage\": 0, \"messages\": [{{\"text\": \"...\", \"delay_before_ms\": 0}}], \
         \"field_updates\": {{\"name\": \"...\"}}, \"interest_level\": \"...\", \"summary\": \"...\"}}\n\n\
         Rules:\n\
         - next_stage may stay the same when you need clarification\n\
         - an explicit price question may jump straight to stage {fast_track}\n\
         - messages are short chat bubbles; use delay_before_ms to pace them\n\
         - field_updates only contains fields the customer actually gave you\n\
         - interest_level is one of: unknown, low, medium, high, hot, needs_human\n\
         - summary is one sentence describing the lead so far",
        fast_track = table.fast_track().index(),
    )
}

fn build_turn_prompt(request: &AdapterRequest) -> String {
    let mut prompt = String::with_capacity(512);
    prompt.push_str(&format!("Current stage: {}\n", request.stage));
    prompt.push_str(&format!("Input class: {}\n", request.classified.class.label()));

    if !request.known_fields.is_empty() {
        prompt.push_str("Known fields:\n");
        for (k, v) in request.known_fields.iter() {
            prompt.push_str(&format!("  {k}: {v}\n"));
        }
    }

    if let Some(ref extra) = request.extra_context {
        prompt.push_str(&format!("Context: {extra}\n"));
    }

    let content: String = request.classified.text.chars().take(2000).collect();
    prompt.push_str(&format!("\nCustomer message:\n{content}"));
    prompt
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(untagged)]
enum RawMessage {
    Text(String),
    Structured(OutboundMessage),
}

#[derive(Deserialize)]
struct RawDecision {
    #[serde(alias = "nextStage")]
    next_stage: Option<serde_json::Value>,
    #[serde(default)]
    messages: Vec<RawMessage>,
    #[serde(default, alias = "fieldUpdates")]
    field_updates: Option<HashMap<String, serde_json::Value>>,
    #[serde(default, alias = "interestLevel")]
    interest_level: Option<String>,
    #[serde(default)]
    summary: Option<String>,
}

/// Parse raw model output into a decision.
pub fn parse_decision(raw: &str) -> Result<AdapterDecision, String> {
    let json_str = extract_json_object(raw);
    let decision: RawDecision =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;

    let next_stage = match decision.next_stage {
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64))
            .ok_or("next_stage is not an integer")?,
        Some(serde_json::Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| format!("next_stage '{s}' is not an integer"))?,
        Some(_) => return Err("next_stage has the wrong type".into()),
        None => return Err("missing next_stage".into()),
    };

    let messages = decision
        .messages
        .into_iter()
        .map(|m| match m {
            RawMessage::Text(text) => OutboundMessage::text(text),
            RawMessage::Structured(msg) => OutboundMessage {
                delay_before_ms: msg.delay_before_ms.min(MAX_DELAY_BEFORE_MS),
                ..msg
            },
        })
        .filter(|m| !m.text.trim().is_empty())
        .collect();

    let field_updates = decision
        .field_updates
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(k, v)| match v {
            serde_json::Value::String(s) => Some((k, s)),
            serde_json::Value::Number(n) => Some((k, n.to_string())),
            serde_json::Value::Bool(b) => Some((k, b.to_string())),
            _ => None,
        })
        .collect();

    let interest_level = decision.interest_level.and_then(|s| match s.parse() {
        Ok(level) => Some(level),
        Err(e) => {
            warn!(error = %e, "Ignoring unrecognized interest level");
            None
        }
    });

    let summary = decision.summary.filter(|s| !s.trim().is_empty());

    Ok(AdapterDecision {
        next_stage,
        messages,
        field_updates,
        interest_level,
        summary,
    })
}

/// Extract a JSON object from model output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::classifier::InputClass;
    use crate::llm::provider::CompletionResponse;

    #[test]
    fn parse_full_decision() {
        let raw = r#"{"next_stage": 4, "messages": ["Great!", {"text": "What is your name?", "delay_before_ms": 1500}], "field_updates": {"city": "Recife", "bill": 420.5}, "interest_level": "high", "summary": "Wants solar for home"}"#;
        let decision = parse_decision(raw).unwrap();
        assert_eq!(decision.next_stage, 4);
        assert_eq!(decision.messages.len(), 2);
        assert_eq!(decision.messages[0].delay_before_ms, 0);
        assert_eq!(decision.messages[1].delay_before_ms, 1500);
        assert_eq!(decision.field_updates["city"], "Recife");
        assert_eq!(decision.field_updates["bill"], "420.5");
        assert_eq!(decision.interest_level, Some(InterestLevel::High));
        assert_eq!(decision.summary.as_deref(), Some("Wants solar for home"));
    }

    #[test]
    fn parse_camel_case_and_string_stage() {
        let raw = r#"{"nextStage": "3", "messages": [{"text": "ok", "delayBeforeMs": 200}]}"#;
        let decision = parse_decision(raw).unwrap();
        assert_eq!(decision.next_stage, 3);
        assert_eq!(decision.messages[0].delay_before_ms, 200);
        assert!(decision.field_updates.is_empty());
    }

    #[test]
    fn parse_missing_stage_fails() {
        assert!(parse_decision(r#"{"messages": ["hi"]}"#).is_err());
        assert!(parse_decision(r#"{"next_stage": [1], "messages": []}"#).is_err());
        assert!(parse_decision("I think we should move to stage 3").is_err());
    }

    #[test]
    fn parse_drops_null_fields_and_blank_messages() {
        let raw = r#"{"next_stage": 2, "messages": ["", "hello"], "field_updates": {"email": null, "name": "Ana"}}"#;
        let decision = parse_decision(raw).unwrap();
        assert_eq!(decision.messages, vec![OutboundMessage::text("hello")]);
        assert_eq!(decision.field_updates.len(), 1);
    }

    #[test]
    fn parse_unknown_interest_is_ignored() {
        let raw = r#"{"next_stage": 1, "messages": [], "interest_level": "lukewarm"}"#;
        let decision = parse_decision(raw).unwrap();
        assert!(decision.interest_level.is_none());
    }

    #[test]
    fn parse_caps_message_delay() {
        let raw = r#"{"next_stage": 1, "messages": [{"text": "oi", "delayBeforeMs": 600000}]}"#;
        let decision = parse_decision(raw).unwrap();
        assert_eq!(decision.messages[0].delay_before_ms, MAX_DELAY_BEFORE_MS);
    }

    #[test]
    fn parse_markdown_wrapped() {
        let raw = "Here you go:\n```json\n{\"next_stage\": 1, \"messages\": [\"Oi!\"]}\n```";
        let decision = parse_decision(raw).unwrap();
        assert_eq!(decision.next_stage, 1);
    }

    #[test]
    fn system_prompt_lists_stages_up_to_ceiling() {
        let table = StageTable::new(Stage::Proposal, Stage::Education, Stage::DataCollection, Stage::BillAnalysis).unwrap();
        let prompt = build_system_prompt(&table);
        assert!(prompt.contains("7 = proposal"));
        assert!(!prompt.contains("closed"));
        assert!(prompt.contains("jump straight to stage 4"));
    }

    #[test]
    fn turn_prompt_includes_state() {
        let mut fields = KnownFields::new();
        fields.set("name", "Ana");
        let request = AdapterRequest {
            history: vec![],
            stage: Stage::Qualification,
            known_fields: fields,
            classified: ClassifiedInput {
                class: InputClass::PriceInquiry,
                text: "quanto custa?".into(),
            },
            extra_context: Some("Proposal generated successfully".into()),
        };
        let prompt = build_turn_prompt(&request);
        assert!(prompt.contains("2:qualification"));
        assert!(prompt.contains("price_inquiry"));
        assert!(prompt.contains("name: Ana"));
        assert!(prompt.contains("Proposal generated successfully"));
        assert!(prompt.contains("quanto custa?"));
    }

    struct FixedLlm(String);

    #[async_trait]
    impl LlmProvider for FixedLlm {
        fn model_name(&self) -> &str {
            "fixed"
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            // system + one history turn + current turn
            assert_eq!(request.messages.len(), 3);
            Ok(CompletionResponse {
                content: self.0.clone(),
                input_tokens: 10,
                output_tokens: 10,
            })
        }
    }

    fn request_with_history() -> AdapterRequest {
        AdapterRequest {
            history: vec![HistoryEntry {
                role: Role::Customer,
                text: "oi".into(),
                timestamp: chrono::Utc::now(),
            }],
            stage: Stage::Greeting,
            known_fields: KnownFields::new(),
            classified: ClassifiedInput {
                class: InputClass::General,
                text: "tenho interesse".into(),
            },
            extra_context: None,
        }
    }

    #[tokio::test]
    async fn llm_adapter_parses_completion() {
        let adapter = LlmLanguageAdapter::new(
            Arc::new(FixedLlm(r#"{"next_stage": 1, "messages": ["Que bom!"]}"#.into())),
            StageTable::default(),
        );
        let decision = adapter.decide(&request_with_history()).await.unwrap();
        assert_eq!(decision.next_stage, 1);
        assert_eq!(decision.messages[0].text, "Que bom!");
    }

    #[tokio::test]
    async fn llm_adapter_malformed_is_invalid_response() {
        let adapter = LlmLanguageAdapter::new(Arc::new(FixedLlm("not json".into())), StageTable::default());
        let err = adapter.decide(&request_with_history()).await.unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse { .. }));
    }
}
