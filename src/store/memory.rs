//! In-memory `Database` backend.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::campaign::model::{AudienceCriteria, BatchOutcome, Campaign, CampaignStatus, Recipient};
use crate::conversation::model::Conversation;
use crate::error::DatabaseError;
use crate::store::traits::Database;

/// Keeps everything in process memory. Conversations are keyed in a
/// `BTreeMap` so audience snapshots come out ordered by identity.
#[derive(Default)]
pub struct MemoryStore {
    conversations: RwLock<BTreeMap<String, Conversation>>,
    campaigns: RwLock<HashMap<Uuid, Campaign>>,
    audiences: RwLock<HashMap<Uuid, Vec<Recipient>>>,
    outcomes: RwLock<Vec<BatchOutcome>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last time a campaign message was delivered to each identity.
    async fn last_sent_by_identity(&self) -> HashMap<String, DateTime<Utc>> {
        let outcomes = self.outcomes.read().await;
        let mut last: HashMap<String, DateTime<Utc>> = HashMap::new();
        for record in outcomes.iter().filter(|o| o.outcome.is_sent()) {
            last.entry(record.recipient.clone())
                .and_modify(|t| *t = (*t).max(record.timestamp))
                .or_insert(record.timestamp);
        }
        last
    }
}

#[async_trait]
impl Database for MemoryStore {
    async fn load_conversation(&self, identity: &str) -> Result<Option<Conversation>, DatabaseError> {
        Ok(self.conversations.read().await.get(identity).cloned())
    }

    async fn save_conversation(&self, conversation: &Conversation) -> Result<(), DatabaseError> {
        if conversation.identity.is_empty() {
            return Err(DatabaseError::Query("conversation identity is empty".into()));
        }
        self.conversations
            .write()
            .await
            .insert(conversation.identity.clone(), conversation.clone());
        Ok(())
    }

    async fn load_campaign(&self, id: Uuid) -> Result<Option<Campaign>, DatabaseError> {
        Ok(self.campaigns.read().await.get(&id).cloned())
    }

    async fn save_campaign(&self, campaign: &Campaign) -> Result<(), DatabaseError> {
        self.campaigns.write().await.insert(campaign.id, campaign.clone());
        Ok(())
    }

    async fn list_campaigns_by_status(
        &self,
        status: CampaignStatus,
    ) -> Result<Vec<Campaign>, DatabaseError> {
        let mut campaigns: Vec<Campaign> = self
            .campaigns
            .read()
            .await
            .values()
            .filter(|c| c.status == status)
            .cloned()
            .collect();
        campaigns.sort_by_key(|c| c.created_at);
        Ok(campaigns)
    }

    async fn query_audience(
        &self,
        criteria: &AudienceCriteria,
        now: DateTime<Utc>,
    ) -> Result<Vec<Recipient>, DatabaseError> {
        let last_sent = if criteria.exclude_recent_days.is_some() {
            self.last_sent_by_identity().await
        } else {
            HashMap::new()
        };

        let conversations = self.conversations.read().await;
        Ok(conversations
            .values()
            .filter(|c| criteria.matches(c, last_sent.get(&c.identity).copied(), now))
            .map(Recipient::from_conversation)
            .collect())
    }

    async fn save_audience(
        &self,
        campaign_id: Uuid,
        recipients: Vec<Recipient>,
    ) -> Result<Vec<Recipient>, DatabaseError> {
        Ok(self
            .audiences
            .write()
            .await
            .entry(campaign_id)
            .or_insert(recipients)
            .clone())
    }

    async fn load_audience(&self, campaign_id: Uuid) -> Result<Option<Vec<Recipient>>, DatabaseError> {
        Ok(self.audiences.read().await.get(&campaign_id).cloned())
    }

    async fn clear_audience(&self, campaign_id: Uuid) -> Result<(), DatabaseError> {
        self.audiences.write().await.remove(&campaign_id);
        Ok(())
    }

    async fn record_outcome(&self, outcome: &BatchOutcome) -> Result<(), DatabaseError> {
        self.outcomes.write().await.push(outcome.clone());
        Ok(())
    }

    async fn list_outcomes(&self, campaign_id: Uuid) -> Result<Vec<BatchOutcome>, DatabaseError> {
        Ok(self
            .outcomes
            .read()
            .await
            .iter()
            .filter(|o| o.campaign_id == campaign_id)
            .cloned()
            .collect())
    }
}
