//! Serialized read-modify-write access to campaign records.
//!
//! The queue and every dispatcher go through `update`, so a status change
//! made by an operator can never be overwritten by a counter write.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::campaign::model::Campaign;
use crate::error::{CampaignError, Error};
use crate::store::traits::Database;

pub struct CampaignRecords {
    db: Arc<dyn Database>,
    lock: Mutex<()>,
}

impl CampaignRecords {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            lock: Mutex::new(()),
        }
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    /// Load a campaign, failing if it does not exist.
    pub async fn get(&self, id: Uuid) -> Result<Campaign, Error> {
        self.db
            .load_campaign(id)
            .await?
            .ok_or(CampaignError::NotFound { id }.into())
    }

    /// Store a new campaign.
    pub async fn insert(&self, campaign: &Campaign) -> Result<(), Error> {
        let _guard = self.lock.lock().await;
        self.db.save_campaign(campaign).await?;
        Ok(())
    }

    /// Apply `f` to the latest copy of the campaign and persist the result.
    ///
    /// Nothing is written when `f` fails.
    pub async fn update<T, F>(&self, id: Uuid, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut Campaign) -> Result<T, CampaignError>,
    {
        let _guard = self.lock.lock().await;
        let mut campaign = self
            .db
            .load_campaign(id)
            .await?
            .ok_or(CampaignError::NotFound { id })?;

        let value = f(&mut campaign)?;
        campaign.updated_at = Utc::now();
        self.db.save_campaign(&campaign).await?;
        Ok(value)
    }
}
