//! Rule-based input classifier.
//!
//! Runs before the language adapter. The classification is passed to the
//! adapter as a hint; only `OptOut` changes the pipeline (the adapter is
//! skipped and the lead is flagged).

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Coarse intent of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputClass {
    /// Explicit question about price, cost or quote.
    PriceInquiry,
    /// Asks to stop receiving messages.
    OptOut,
    /// Asks to talk to a person.
    HumanRequest,
    Greeting,
    /// Audio, image or document content.
    Attachment,
    General,
}

impl InputClass {
    pub fn label(&self) -> &'static str {
        match self {
            Self::PriceInquiry => "price_inquiry",
            Self::OptOut => "opt_out",
            Self::HumanRequest => "human_request",
            Self::Greeting => "greeting",
            Self::Attachment => "attachment",
            Self::General => "general",
        }
    }
}

/// A normalized inbound message with its classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedInput {
    pub class: InputClass,
    pub text: String,
}

/// A single classification rule with a compiled regex.
#[derive(Debug, Clone)]
pub struct ClassRule {
    pub regex: Regex,
    pub class: InputClass,
    /// Why this rule triggers.
    pub reason: String,
}

/// Ordered rule list; the first match wins.
pub struct Classifier {
    rules: Vec<ClassRule>,
}

impl Classifier {
    /// Rules for Portuguese and English WhatsApp traffic.
    pub fn default_rules() -> Self {
        let rules = vec![
            ClassRule {
                regex: Regex::new(
                    r"(?i)^\s*(por favor,?\s*)?(stop|sair|parar|pare|cancelar|descadastrar|unsubscribe|n[aã]o (quero|desejo) (mais )?receber( mais)?( (mensagens?|nada|isso))?( de voc[eê]s)?( mais)?|remove me( from (this|your) list)?|remova meu (n[uú]mero|contato)( da lista)?)\s*[.!]*\s*$",
                )
                .unwrap(),
                class: InputClass::OptOut,
                reason: "opt-out keyword".into(),
            },
            ClassRule {
                regex: Regex::new(
                    r"(?i)(falar|conversar) com (um|uma|algu[eé]m|atendente|humano|pessoa|vendedor)|atendente|human (agent|being)|talk to (a|someone|a person|an agent)|real person",
                )
                .unwrap(),
                class: InputClass::HumanRequest,
                reason: "asks for a human".into(),
            },
            ClassRule {
                regex: Regex::new(
                    r"(?i)\b(pre[cç]o|valor|quanto (custa|fica|sai)|or[cç]amento|price|cost|how much|quote)\b",
                )
                .unwrap(),
                class: InputClass::PriceInquiry,
                reason: "price question".into(),
            },
            ClassRule {
                regex: Regex::new(
                    r"(?i)^\s*(oi+|ol[aá]|bom dia|boa tarde|boa noite|hello|hi|hey|good (morning|afternoon|evening))\b[\s!.,]*$",
                )
                .unwrap(),
                class: InputClass::Greeting,
                reason: "greeting".into(),
            },
        ];

        Self { rules }
    }

    /// Classify normalized text. `from_attachment` marks content that came
    /// from an audio, image or document.
    pub fn classify(&self, text: &str, from_attachment: bool) -> ClassifiedInput {
        for rule in &self.rules {
            if rule.regex.is_match(text) {
                debug!(class = rule.class.label(), reason = %rule.reason, "Classifier rule matched");
                return ClassifiedInput {
                    class: rule.class,
                    text: text.to_string(),
                };
            }
        }

        let class = if from_attachment {
            InputClass::Attachment
        } else {
            InputClass::General
        };
        ClassifiedInput {
            class,
            text: text.to_string(),
        }
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::default_rules()
    }
}
