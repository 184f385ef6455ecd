//! Configuration types.
//!
//! Every config reads its values from the environment with sensible
//! defaults; only credentials are mandatory.

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::conversation::stage::{Stage, StageTable};
use crate::error::ConfigError;

/// Message sent when the language adapter fails or times out.
pub const DEFAULT_FALLBACK_MESSAGE: &str =
    "Sorry, I had a problem processing your message. Could you send it again in a moment?";

/// Message sent when a customer opts out of further contact.
pub const DEFAULT_OPT_OUT_REPLY: &str =
    "Understood, you will not receive any more messages from us. Reply anytime if you change your mind.";

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_stage(key: &str, default: Stage) -> Result<Stage, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => {
            let index: u8 = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{raw}' is not a stage number"),
            })?;
            Stage::try_from(index).map_err(|message| ConfigError::InvalidValue {
                key: key.to_string(),
                message,
            })
        }
        Err(_) => Ok(default),
    }
}

/// Inbound conversation pipeline configuration.
#[derive(Debug, Clone)]
pub struct FunnelConfig {
    /// Named stage constants (ceiling, close threshold, jump targets).
    pub stage_table: StageTable,
    /// Upper bound on a single language adapter call.
    pub adapter_timeout: Duration,
    /// Upper bound on processing one inbound event end to end.
    pub processing_timeout: Duration,
    /// Sent in place of the adapter's messages when the adapter fails.
    pub fallback_message: String,
    /// Sent after an opt-out request.
    pub opt_out_reply: String,
    /// Number of history turns passed to the adapter.
    pub history_window: usize,
    /// Cap on the pause the adapter may request before a reply bubble.
    pub max_reply_delay: Duration,
}

impl Default for FunnelConfig {
    fn default() -> Self {
        Self {
            stage_table: StageTable::default(),
            adapter_timeout: Duration::from_secs(30),
            processing_timeout: Duration::from_secs(120),
            fallback_message: DEFAULT_FALLBACK_MESSAGE.to_string(),
            opt_out_reply: DEFAULT_OPT_OUT_REPLY.to_string(),
            history_window: 20,
            max_reply_delay: Duration::from_secs(15),
        }
    }
}

impl FunnelConfig {
    /// Load from `FUNNEL_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = StageTable::default();
        let stage_table = StageTable::new(
            env_stage("FUNNEL_STAGE_CEILING", defaults.ceiling())?,
            env_stage("FUNNEL_CLOSE_THRESHOLD", defaults.close_threshold())?,
            env_stage("FUNNEL_FAST_TRACK_STAGE", defaults.fast_track())?,
            env_stage("FUNNEL_DELIVERABLE_STAGE", defaults.deliverable())?,
        )?
        .with_regression(env_or("FUNNEL_ALLOW_STAGE_REGRESSION", false));

        let fallback_message = std::env::var("FUNNEL_FALLBACK_MESSAGE")
            .unwrap_or_else(|_| DEFAULT_FALLBACK_MESSAGE.to_string());
        let opt_out_reply = std::env::var("FUNNEL_OPT_OUT_REPLY")
            .unwrap_or_else(|_| DEFAULT_OPT_OUT_REPLY.to_string());

        Ok(Self {
            stage_table,
            adapter_timeout: Duration::from_secs(env_or("FUNNEL_ADAPTER_TIMEOUT_SECS", 30)),
            processing_timeout: Duration::from_secs(env_or("FUNNEL_PROCESSING_TIMEOUT_SECS", 120)),
            fallback_message,
            opt_out_reply,
            history_window: env_or("FUNNEL_HISTORY_WINDOW", 20),
            max_reply_delay: Duration::from_millis(env_or("FUNNEL_MAX_REPLY_DELAY_MS", 15_000)),
        })
    }
}

/// Campaign scheduler and dispatcher configuration.
#[derive(Debug, Clone)]
pub struct CampaignConfig {
    /// Maximum number of campaigns dispatching at the same time.
    pub max_concurrent_campaigns: usize,
    /// How often the queue drains pending campaign ids.
    pub queue_tick_interval: Duration,
    /// How often scheduled campaigns are scanned for due runs.
    pub schedule_tick_interval: Duration,
    /// First retry delay for a failed send; doubles on each attempt.
    pub retry_base_delay: Duration,
    /// Cap for the doubling retry delay.
    pub retry_max_delay: Duration,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            max_concurrent_campaigns: 3,
            queue_tick_interval: Duration::from_secs(5),
            schedule_tick_interval: Duration::from_secs(60),
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
        }
    }
}

impl CampaignConfig {
    /// Load from `CAMPAIGN_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let max_concurrent_campaigns = env_or("CAMPAIGN_MAX_CONCURRENT", 3usize);
        if max_concurrent_campaigns == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CAMPAIGN_MAX_CONCURRENT".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            max_concurrent_campaigns,
            queue_tick_interval: Duration::from_secs(env_or("CAMPAIGN_QUEUE_TICK_SECS", 5)),
            schedule_tick_interval: Duration::from_secs(env_or("CAMPAIGN_SCHEDULE_TICK_SECS", 60)),
            retry_base_delay: Duration::from_millis(env_or("CAMPAIGN_RETRY_BASE_MS", 1_000)),
            retry_max_delay: Duration::from_millis(env_or("CAMPAIGN_RETRY_MAX_MS", 30_000)),
        })
    }
}

/// WhatsApp Cloud API credentials and send pacing.
#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    pub access_token: SecretString,
    pub phone_number_id: String,
    /// Numbers that receive admin notifications.
    pub admin_numbers: Vec<String>,
    /// Minimum spacing between any two sends (provider rate limit).
    pub min_send_interval: Duration,
    /// Upper bound on a single send call.
    pub send_timeout: Duration,
}

impl WhatsAppConfig {
    /// Load from `WHATSAPP_*` environment variables.
    ///
    /// Returns `None` when no access token is configured.
    pub fn from_env() -> Option<Self> {
        let access_token = std::env::var("WHATSAPP_ACCESS_TOKEN").ok()?;
        let phone_number_id = std::env::var("WHATSAPP_PHONE_NUMBER_ID").unwrap_or_default();

        let admin_numbers: Vec<String> = std::env::var("WHATSAPP_ADMIN_NUMBERS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Some(Self {
            access_token: SecretString::from(access_token),
            phone_number_id,
            admin_numbers,
            min_send_interval: Duration::from_millis(env_or("WHATSAPP_MIN_SEND_INTERVAL_MS", 250)),
            send_timeout: Duration::from_secs(env_or("WHATSAPP_SEND_TIMEOUT_SECS", 30)),
        })
    }
}
