//! `Database` trait: the single async persistence interface.
//!
//! The core only reads and writes the fields it owns; any backend that
//! can round-trip `Conversation`, `Campaign`, audience snapshots and
//! `BatchOutcome` works.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::campaign::model::{AudienceCriteria, BatchOutcome, Campaign, CampaignStatus, Recipient};
use crate::conversation::model::Conversation;
use crate::error::DatabaseError;

/// Backend-agnostic store for conversations, campaigns and outcomes.
#[async_trait]
pub trait Database: Send + Sync {
    // ── Conversations ───────────────────────────────────────────────

    /// Load a conversation by contact identity.
    async fn load_conversation(&self, identity: &str) -> Result<Option<Conversation>, DatabaseError>;

    /// Insert or replace a conversation.
    async fn save_conversation(&self, conversation: &Conversation) -> Result<(), DatabaseError>;

    // ── Campaigns ───────────────────────────────────────────────────

    async fn load_campaign(&self, id: Uuid) -> Result<Option<Campaign>, DatabaseError>;

    /// Insert or replace a campaign.
    async fn save_campaign(&self, campaign: &Campaign) -> Result<(), DatabaseError>;

    async fn list_campaigns_by_status(
        &self,
        status: CampaignStatus,
    ) -> Result<Vec<Campaign>, DatabaseError>;

    // ── Audience ────────────────────────────────────────────────────

    /// Leads matching `criteria` as of `now`, in a stable order.
    async fn query_audience(
        &self,
        criteria: &AudienceCriteria,
        now: DateTime<Utc>,
    ) -> Result<Vec<Recipient>, DatabaseError>;

    // ── Audience snapshots ──────────────────────────────────────────

    /// Store the snapshot for a campaign's current run unless one exists.
    /// Returns whichever snapshot is stored afterwards.
    async fn save_audience(
        &self,
        campaign_id: Uuid,
        recipients: Vec<Recipient>,
    ) -> Result<Vec<Recipient>, DatabaseError>;

    async fn load_audience(&self, campaign_id: Uuid) -> Result<Option<Vec<Recipient>>, DatabaseError>;

    /// Drop the snapshot so the next run takes a fresh one.
    async fn clear_audience(&self, campaign_id: Uuid) -> Result<(), DatabaseError>;

    // ── Outcomes ────────────────────────────────────────────────────

    /// Append an outcome record. Records are never updated.
    async fn record_outcome(&self, outcome: &BatchOutcome) -> Result<(), DatabaseError>;

    async fn list_outcomes(&self, campaign_id: Uuid) -> Result<Vec<BatchOutcome>, DatabaseError>;
}
