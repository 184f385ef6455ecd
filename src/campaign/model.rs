//! Campaign records, audience criteria and outcome records.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conversation::model::{Conversation, KnownFields};
use crate::conversation::stage::Stage;
use crate::error::CampaignError;

/// Largest batch a campaign may request.
pub const MAX_BATCH_SIZE: usize = 500;

/// Most retries a campaign may request per recipient.
pub const MAX_RETRIES: u32 = 10;

/// Longest configurable pause between messages or batches.
pub const MAX_DELAY: Duration = Duration::from_secs(3600);

/// Lifecycle state of a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    /// Created, waiting for an explicit start.
    Draft,
    /// Waiting for its scheduled time.
    Scheduled,
    /// A dispatcher is (or is about to be) sending.
    Running,
    /// Stopped by an operator; resumable.
    Paused,
    Completed,
    Cancelled,
    /// The dispatcher failed; see `Execution::failure_reason`.
    Error,
}

impl CampaignStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: CampaignStatus) -> bool {
        use CampaignStatus::*;

        matches!(
            (self, target),
            // From Draft
            (Draft, Scheduled) | (Draft, Running) | (Draft, Cancelled) |
            // From Scheduled
            (Scheduled, Running) | (Scheduled, Cancelled) |
            // From Running (Scheduled only when a recurring run re-arms)
            (Running, Paused) | (Running, Completed) | (Running, Cancelled) |
            (Running, Error) | (Running, Scheduled) |
            // From Paused
            (Paused, Running) | (Paused, Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Error)
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Which leads a campaign targets. Empty criteria match every lead that
/// has not opted out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudienceCriteria {
    #[serde(default)]
    pub min_stage: Option<Stage>,
    #[serde(default)]
    pub max_stage: Option<Stage>,
    #[serde(default)]
    pub source: Option<String>,
    /// Match leads carrying any of these tags.
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub min_bill: Option<Decimal>,
    #[serde(default)]
    pub max_bill: Option<Decimal>,
    /// Skip leads a campaign message reached within this many days.
    #[serde(default)]
    pub exclude_recent_days: Option<u32>,
    #[serde(default = "default_true")]
    pub exclude_opted_out: bool,
}

fn default_true() -> bool {
    true
}

impl Default for AudienceCriteria {
    fn default() -> Self {
        Self {
            min_stage: None,
            max_stage: None,
            source: None,
            tags: Vec::new(),
            min_bill: None,
            max_bill: None,
            exclude_recent_days: None,
            exclude_opted_out: true,
        }
    }
}

impl AudienceCriteria {
    /// Whether `conv` belongs to the audience. `last_sent` is the last time
    /// any campaign message was delivered to this lead.
    pub fn matches(
        &self,
        conv: &Conversation,
        last_sent: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.exclude_opted_out && conv.opted_out {
            return false;
        }
        if self.min_stage.is_some_and(|min| conv.stage < min) {
            return false;
        }
        if self.max_stage.is_some_and(|max| conv.stage > max) {
            return false;
        }
        if let Some(ref source) = self.source
            && conv.source.as_deref() != Some(source.as_str())
        {
            return false;
        }
        if !self.tags.is_empty() && !self.tags.iter().any(|t| conv.tags.contains(t)) {
            return false;
        }
        if self.min_bill.is_some() || self.max_bill.is_some() {
            let Some(bill) = conv.known_fields.decimal("bill") else {
                return false;
            };
            if self.min_bill.is_some_and(|min| bill < min) || self.max_bill.is_some_and(|max| bill > max) {
                return false;
            }
        }
        if let (Some(days), Some(sent)) = (self.exclude_recent_days, last_sent)
            && now - sent < chrono::Duration::days(i64::from(days))
        {
            return false;
        }
        true
    }
}

/// Pacing and retry limits for a campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendingConfig {
    pub batch_size: usize,
    pub delay_between_messages: Duration,
    pub delay_between_batches: Duration,
    /// Retries per recipient after the first attempt.
    pub max_retries: u32,
}

impl Default for SendingConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            delay_between_messages: Duration::from_secs(2),
            delay_between_batches: Duration::from_secs(60),
            max_retries: 2,
        }
    }
}

impl SendingConfig {
    pub fn validate(&self) -> Result<(), CampaignError> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(CampaignError::Validation(format!(
                "batch_size must be in 1..={MAX_BATCH_SIZE}, got {}",
                self.batch_size
            )));
        }
        if self.max_retries > MAX_RETRIES {
            return Err(CampaignError::Validation(format!(
                "max_retries must be at most {MAX_RETRIES}, got {}",
                self.max_retries
            )));
        }
        if self.delay_between_messages > MAX_DELAY || self.delay_between_batches > MAX_DELAY {
            return Err(CampaignError::Validation(format!(
                "delays must not exceed {MAX_DELAY:?}"
            )));
        }
        Ok(())
    }
}

/// When a campaign runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Runs when explicitly started.
    Immediate,
    /// Runs once at a fixed time.
    At { at: DateTime<Utc> },
    /// Runs on every fire of a cron expression (seconds field first).
    Recurring { pattern: String },
}

impl Schedule {
    pub fn validate(&self) -> Result<(), CampaignError> {
        if let Self::Recurring { pattern } = self {
            parse_cron(pattern)?;
        }
        Ok(())
    }

    /// The first fire strictly after `after`, if any.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, CampaignError> {
        match self {
            Self::Immediate => Ok(None),
            Self::At { at } => Ok(Some(*at)),
            Self::Recurring { pattern } => Ok(parse_cron(pattern)?.after(&after).next()),
        }
    }

    pub fn is_recurring(&self) -> bool {
        matches!(self, Self::Recurring { .. })
    }
}

fn parse_cron(pattern: &str) -> Result<cron::Schedule, CampaignError> {
    cron::Schedule::from_str(pattern)
        .map_err(|e| CampaignError::Validation(format!("invalid cron '{pattern}': {e}")))
}

/// Progress and counters of the current (or last) run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Recipients terminally resolved (sent, failed or skipped).
    pub processed_count: usize,
    pub sent_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    /// Extra attempts made across all recipients.
    pub retried_count: usize,
    pub current_batch_index: usize,
    pub total_batches: usize,
    pub audience_size: usize,
    pub failure_reason: Option<String>,
}

/// One member of a campaign's audience snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub identity: String,
    pub fields: KnownFields,
}

impl Recipient {
    pub fn from_conversation(conv: &Conversation) -> Self {
        Self {
            identity: conv.identity.clone(),
            fields: conv.known_fields.clone(),
        }
    }

    /// Value for a template placeholder.
    pub fn lookup(&self, key: &str) -> Option<&str> {
        match key {
            "phone" | "identity" => Some(self.identity.as_str()),
            other => self.fields.get(other),
        }
    }
}

/// A status change, kept for auditing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: CampaignStatus,
    pub to: CampaignStatus,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// An outbound re-engagement campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    /// Message body with `{{field}}` placeholders.
    pub message_template: String,
    pub status: CampaignStatus,
    pub audience_criteria: AudienceCriteria,
    pub sending_config: SendingConfig,
    pub schedule: Schedule,
    /// Next due time for a scheduled campaign.
    pub next_run_at: Option<DateTime<Utc>>,
    pub execution: Execution,
    pub transitions: Vec<StatusChange>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    pub fn new(name: impl Into<String>, message_template: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            message_template: message_template.into(),
            status: CampaignStatus::Draft,
            audience_criteria: AudienceCriteria::default(),
            sending_config: SendingConfig::default(),
            schedule: Schedule::Immediate,
            next_run_at: None,
            execution: Execution::default(),
            transitions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_criteria(mut self, criteria: AudienceCriteria) -> Self {
        self.audience_criteria = criteria;
        self
    }

    pub fn with_sending(mut self, sending: SendingConfig) -> Self {
        self.sending_config = sending;
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Check everything that must hold before the campaign is accepted.
    pub fn validate(&self) -> Result<(), CampaignError> {
        if self.name.trim().is_empty() {
            return Err(CampaignError::Validation("name must not be empty".into()));
        }
        if self.message_template.trim().is_empty() {
            return Err(CampaignError::Validation(
                "message_template must not be empty".into(),
            ));
        }
        if let (Some(min), Some(max)) = (self.audience_criteria.min_stage, self.audience_criteria.max_stage)
            && min > max
        {
            return Err(CampaignError::Validation(format!(
                "min_stage {min} is above max_stage {max}"
            )));
        }
        self.sending_config.validate()?;
        self.schedule.validate()
    }

    /// Move to a new status along an allowed edge.
    pub fn transition_to(
        &mut self,
        target: CampaignStatus,
        reason: Option<String>,
    ) -> Result<(), CampaignError> {
        if !self.status.can_transition_to(target) {
            return Err(CampaignError::InvalidTransition {
                id: self.id,
                state: self.status,
                target,
            });
        }

        let now = Utc::now();
        self.transitions.push(StatusChange {
            from: self.status,
            to: target,
            timestamp: now,
            reason,
        });

        const MAX_TRANSITIONS: usize = 100;
        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        self.status = target;
        self.updated_at = now;

        match target {
            CampaignStatus::Running if self.execution.started_at.is_none() => {
                self.execution.started_at = Some(now);
            }
            CampaignStatus::Completed | CampaignStatus::Cancelled | CampaignStatus::Error => {
                self.execution.completed_at = Some(now);
            }
            _ => {}
        }

        Ok(())
    }

    /// Clear run state so a recurring campaign starts fresh next time.
    /// The audience snapshot lives in the store and is cleared there.
    pub fn reset_run(&mut self) {
        self.execution = Execution::default();
    }
}

/// Final result for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Sent { provider_message_id: String },
    Failed { reason: String },
    Skipped { reason: String },
}

impl Outcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent { .. })
    }
}

/// Immutable record of how a recipient was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub campaign_id: Uuid,
    pub recipient: String,
    /// Attempt on which the recipient was resolved, starting at 1.
    pub attempt_number: u32,
    #[serde(flatten)]
    pub outcome: Outcome,
    pub timestamp: DateTime<Utc>,
}
