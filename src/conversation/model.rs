//! Conversation records: one per contact identity.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::stage::Stage;

/// How interested a lead appears to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterestLevel {
    #[default]
    Unknown,
    Low,
    Medium,
    High,
    Hot,
    /// The lead asked for, or needs, a human salesperson.
    NeedsHuman,
}

impl InterestLevel {
    /// High or hot interest: worth an admin alert.
    pub fn is_high(self) -> bool {
        matches!(self, Self::High | Self::Hot)
    }
}

impl std::fmt::Display for InterestLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Hot => "hot",
            Self::NeedsHuman => "needs_human",
        };
        write!(f, "{s}")
    }
}

impl FromStr for InterestLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "unknown" => Ok(Self::Unknown),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "hot" => Ok(Self::Hot),
            "needs_human" | "human" => Ok(Self::NeedsHuman),
            other => Err(format!("unknown interest level: '{other}'")),
        }
    }
}

/// Lifecycle status of a conversation, orthogonal to its stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    #[default]
    Active,
    Completed,
    Error,
}

/// Who authored a history turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Customer,
    Agent,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Agent => "agent",
        }
    }
}

/// One turn of conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Fields collected from a lead (name, document id, email, bill, ...).
///
/// Values are only ever added or replaced by non-empty values; a field is
/// never removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KnownFields(BTreeMap<String, String>);

impl KnownFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Set a single field. Blank values are ignored.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if key.trim().is_empty() || value.trim().is_empty() {
            return;
        }
        self.0.insert(key, value.trim().to_string());
    }

    /// Merge updates into the known fields. Returns the number of fields
    /// that changed.
    pub fn merge(&mut self, updates: &HashMap<String, String>) -> usize {
        let mut changed = 0;
        for (key, value) in updates {
            let before = self.0.get(key).cloned();
            self.set(key.clone(), value.clone());
            if self.0.get(key) != before.as_ref() {
                changed += 1;
            }
        }
        changed
    }

    /// Parse a money-like field ("R$ 1.250,90", "350.5", "$ 1,200").
    pub fn decimal(&self, key: &str) -> Option<Decimal> {
        parse_amount(self.get(key)?)
    }
}

impl FromIterator<(String, String)> for KnownFields {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut fields = KnownFields::new();
        for (k, v) in iter {
            fields.set(k, v);
        }
        fields
    }
}

/// Parse an amount written with either decimal convention.
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let normalized = match (cleaned.rfind(','), cleaned.rfind('.')) {
        // "1.250,90": dot thousands, comma decimals
        (Some(comma), Some(dot)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        // "1,250.90": comma thousands, dot decimals
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        // "350,50": comma decimals
        (Some(comma), None) if cleaned.len() - comma - 1 != 3 => cleaned.replace(',', "."),
        // "1,200": comma thousands
        (Some(_), None) => cleaned.replace(',', ""),
        _ => cleaned,
    };

    Decimal::from_str(&normalized).ok()
}

/// A lead's conversation with the funnel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Phone number of the contact.
    pub identity: String,
    pub stage: Stage,
    pub known_fields: KnownFields,
    pub interest_level: InterestLevel,
    pub history: Vec<HistoryEntry>,
    pub status: ConversationStatus,
    /// Reason for the last processing error, cleared on the next success.
    pub error_reason: Option<String>,
    /// Adapter-provided one-line summary of the lead.
    pub summary: Option<String>,
    /// Lead source (ad campaign, referral, organic...).
    pub source: Option<String>,
    pub tags: Vec<String>,
    /// The lead asked not to be contacted by campaigns.
    pub opted_out: bool,
    /// Result of a side-effecting action to report on the next adapter call.
    pub pending_context: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// A fresh conversation at the entry stage.
    pub fn new(identity: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            identity: identity.into(),
            stage: Stage::Greeting,
            known_fields: KnownFields::new(),
            interest_level: InterestLevel::Unknown,
            history: Vec::new(),
            status: ConversationStatus::Active,
            error_reason: None,
            summary: None,
            source: None,
            tags: Vec::new(),
            opted_out: false,
            pending_context: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    /// The lead's name, if collected.
    pub fn display_name(&self) -> Option<&str> {
        self.known_fields.get("name")
    }

    /// Append a turn to the history.
    pub fn push_turn(&mut self, role: Role, text: impl Into<String>) {
        self.history.push(HistoryEntry {
            role,
            text: text.into(),
            timestamp: Utc::now(),
        });
        self.updated_at = Utc::now();
    }

    /// The most recent `n` history turns.
    pub fn recent_history(&self, n: usize) -> &[HistoryEntry] {
        let start = self.history.len().saturating_sub(n);
        &self.history[start..]
    }

    /// Record a processing failure.
    pub fn mark_error(&mut self, reason: impl Into<String>) {
        self.status = ConversationStatus::Error;
        self.error_reason = Some(reason.into());
        self.updated_at = Utc::now();
    }

    /// Explicit reset back to the entry stage. History and fields are kept.
    pub fn reset(&mut self) {
        self.stage = Stage::Greeting;
        self.status = ConversationStatus::Active;
        self.error_reason = None;
        self.pending_context = None;
        self.updated_at = Utc::now();
    }
}
