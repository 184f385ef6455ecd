//! Batch dispatcher: streams one campaign's audience through the sender.
//!
//! Batches are fixed windows of `batch_size` over the audience snapshot,
//! which is stored apart from the campaign record so per-recipient counter
//! updates never copy it.
//! A resumed run starts at `processed_count`, possibly mid-batch. Status is
//! re-checked before every recipient and after every inter-batch pause;
//! a send already in flight (including its retries) always completes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::campaign::model::{BatchOutcome, CampaignStatus, Outcome, Recipient};
use crate::campaign::records::CampaignRecords;
use crate::campaign::retry::RetryConfig;
use crate::campaign::sender::MessageSender;
use crate::campaign::template::{is_valid_phone, personalize};
use crate::config::CampaignConfig;
use crate::error::Error;

/// How a dispatcher run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEnd {
    /// The campaign was not running when the dispatcher picked it up.
    NotRunning(CampaignStatus),
    /// Paused or cancelled while sending.
    Stopped(CampaignStatus),
    Completed,
    /// A recurring campaign finished this run and waits for its next fire.
    Rearmed { next_run_at: DateTime<Utc> },
}

pub struct BatchDispatcher {
    records: Arc<CampaignRecords>,
    sender: Arc<dyn MessageSender>,
    config: CampaignConfig,
}

impl BatchDispatcher {
    pub fn new(
        records: Arc<CampaignRecords>,
        sender: Arc<dyn MessageSender>,
        config: CampaignConfig,
    ) -> Self {
        Self {
            records,
            sender,
            config,
        }
    }

    /// Send the remaining audience of a running campaign.
    pub async fn run(&self, campaign_id: Uuid) -> Result<DispatchEnd, Error> {
        let campaign = self.records.get(campaign_id).await?;
        if campaign.status != CampaignStatus::Running {
            debug!(campaign_id = %campaign_id, status = %campaign.status, "Campaign not running, skipping dispatch");
            return Ok(DispatchEnd::NotRunning(campaign.status));
        }

        let audience = match self.records.db().load_audience(campaign_id).await? {
            Some(audience) => audience,
            None => self.snapshot_audience(campaign_id).await?,
        };

        let sending = campaign.sending_config.clone();
        let batch_size = sending.batch_size.max(1);
        let total = audience.len();
        let total_batches = total.div_ceil(batch_size);
        let offset = campaign.execution.processed_count.min(total);
        let first_batch = offset / batch_size;
        let retry = RetryConfig::new(
            sending.max_retries,
            self.config.retry_base_delay,
            self.config.retry_max_delay,
        );

        info!(
            campaign_id = %campaign_id,
            name = %campaign.name,
            audience = total,
            offset,
            batches = total_batches,
            "Dispatching campaign"
        );

        for batch_index in first_batch..total_batches {
            if batch_index > first_batch {
                tokio::time::sleep(sending.delay_between_batches).await;
            }

            let status = self
                .records
                .update(campaign_id, |c| {
                    if c.status == CampaignStatus::Running {
                        c.execution.current_batch_index = batch_index;
                    }
                    Ok(c.status)
                })
                .await?;
            if status != CampaignStatus::Running {
                info!(campaign_id = %campaign_id, status = %status, batch_index, "Campaign stopped at batch boundary");
                return Ok(DispatchEnd::Stopped(status));
            }

            let start = (batch_index * batch_size).max(offset);
            let end = ((batch_index + 1) * batch_size).min(total);
            debug!(campaign_id = %campaign_id, batch_index, start, end, "Sending batch");

            for (position, recipient) in audience[start..end].iter().enumerate() {
                if position > 0 {
                    tokio::time::sleep(sending.delay_between_messages).await;
                }

                let status = self.records.get(campaign_id).await?.status;
                if status != CampaignStatus::Running {
                    info!(campaign_id = %campaign_id, status = %status, "Campaign stopped mid-batch");
                    return Ok(DispatchEnd::Stopped(status));
                }

                let text = personalize(&campaign.message_template, recipient);
                let (outcome, attempts) = self.deliver(campaign_id, recipient, &text, retry).await;

                self.records
                    .db()
                    .record_outcome(&BatchOutcome {
                        campaign_id,
                        recipient: recipient.identity.clone(),
                        attempt_number: attempts,
                        outcome: outcome.clone(),
                        timestamp: Utc::now(),
                    })
                    .await?;

                self.records
                    .update(campaign_id, |c| {
                        let exec = &mut c.execution;
                        exec.processed_count += 1;
                        exec.retried_count += attempts.saturating_sub(1) as usize;
                        match outcome {
                            Outcome::Sent { .. } => exec.sent_count += 1,
                            Outcome::Failed { .. } => exec.failed_count += 1,
                            Outcome::Skipped { .. } => exec.skipped_count += 1,
                        }
                        Ok(())
                    })
                    .await?;
            }
        }

        self.finalize(campaign_id).await
    }

    /// Take the audience snapshot once for this run.
    async fn snapshot_audience(&self, campaign_id: Uuid) -> Result<Vec<Recipient>, Error> {
        let campaign = self.records.get(campaign_id).await?;
        let db = self.records.db();
        let recipients = db.query_audience(&campaign.audience_criteria, Utc::now()).await?;

        // First snapshot wins if a concurrent run stored one.
        let audience = db.save_audience(campaign_id, recipients).await?;
        let size = audience.len();
        self.records
            .update(campaign_id, |c| {
                c.execution.audience_size = size;
                c.execution.total_batches = size.div_ceil(c.sending_config.batch_size.max(1));
                Ok(())
            })
            .await?;
        debug!(campaign_id = %campaign_id, audience = size, "Audience snapshot taken");
        Ok(audience)
    }

    /// Send to one recipient, retrying failures with doubling backoff.
    /// Returns the outcome and the attempt number that resolved it.
    async fn deliver(
        &self,
        campaign_id: Uuid,
        recipient: &Recipient,
        text: &str,
        retry: RetryConfig,
    ) -> (Outcome, u32) {
        if !is_valid_phone(&recipient.identity) {
            debug!(campaign_id = %campaign_id, recipient = %recipient.identity, "Skipping invalid phone number");
            return (
                Outcome::Skipped {
                    reason: "invalid phone number".to_string(),
                },
                1,
            );
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.sender.send(&recipient.identity, text).await {
                Ok(receipt) => {
                    return (
                        Outcome::Sent {
                            provider_message_id: receipt.provider_message_id,
                        },
                        attempt,
                    );
                }
                Err(e) if attempt < retry.max_attempts() => {
                    let delay = retry.delay_for_attempt(attempt - 1);
                    warn!(
                        campaign_id = %campaign_id,
                        recipient = %recipient.identity,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Send failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(
                        campaign_id = %campaign_id,
                        recipient = %recipient.identity,
                        attempt,
                        error = %e,
                        "Send failed, giving up"
                    );
                    return (
                        Outcome::Failed {
                            reason: e.to_string(),
                        },
                        attempt,
                    );
                }
            }
        }
    }

    /// Close out a run whose audience is exhausted.
    async fn finalize(&self, campaign_id: Uuid) -> Result<DispatchEnd, Error> {
        let end = self
            .records
            .update(campaign_id, |c| {
                if c.status != CampaignStatus::Running {
                    return Ok(DispatchEnd::Stopped(c.status));
                }

                let exec = &c.execution;
                info!(
                    campaign_id = %c.id,
                    sent = exec.sent_count,
                    failed = exec.failed_count,
                    skipped = exec.skipped_count,
                    retried = exec.retried_count,
                    "Campaign run finished"
                );

                if c.schedule.is_recurring()
                    && let Some(next) = c.schedule.next_fire(Utc::now())?
                {
                    c.reset_run();
                    c.next_run_at = Some(next);
                    c.transition_to(CampaignStatus::Scheduled, Some("recurring run finished".into()))?;
                    return Ok(DispatchEnd::Rearmed { next_run_at: next });
                }

                c.transition_to(CampaignStatus::Completed, None)?;
                Ok(DispatchEnd::Completed)
            })
            .await?;

        if matches!(end, DispatchEnd::Rearmed { .. }) {
            self.records.db().clear_audience(campaign_id).await?;
        }
        Ok(end)
    }

    /// Mark a running campaign as failed. Used when `run` errors or panics.
    /// A campaign that cannot enter `Error` (paused mid-run, say) keeps its
    /// status and only records the reason.
    pub async fn fail(&self, campaign_id: Uuid, reason: &str) -> Result<(), Error> {
        self.records
            .update(campaign_id, |c| {
                if c.status.is_terminal() {
                    return Ok(());
                }
                c.execution.failure_reason = Some(reason.to_string());
                if !c.status.can_transition_to(CampaignStatus::Error) {
                    warn!(campaign_id = %c.id, status = %c.status, reason, "Run failed outside Running, keeping status");
                    c.updated_at = Utc::now();
                    return Ok(());
                }
                c.transition_to(CampaignStatus::Error, Some(reason.to_string()))
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::model::{Campaign, SendingConfig};
    use crate::campaign::sender::SendReceipt;
    use crate::conversation::model::Conversation;
    use crate::error::ChannelError;
    use crate::store::memory::MemoryStore;
    use crate::store::traits::Database;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Mutex;

    /// Fails every send to the listed numbers.
    struct ScriptedSender {
        always_fail: Vec<String>,
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageSender for ScriptedSender {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn send(&self, identity: &str, _text: &str) -> Result<SendReceipt, ChannelError> {
            if self.always_fail.iter().any(|f| f == identity) {
                return Err(ChannelError::SendFailed {
                    name: "scripted".into(),
                    reason: "number not on WhatsApp".into(),
                });
            }
            self.sent.lock().await.push(identity.to_string());
            Ok(SendReceipt {
                provider_message_id: format!("wamid.{identity}"),
            })
        }
    }

    async fn setup(
        identities: &[&str],
        always_fail: &[&str],
        sending: SendingConfig,
    ) -> (Arc<ScriptedSender>, BatchDispatcher, Arc<CampaignRecords>, Uuid) {
        let store = Arc::new(MemoryStore::new());
        for identity in identities {
            store.save_conversation(&Conversation::new(*identity)).await.unwrap();
        }
        let records = Arc::new(CampaignRecords::new(store));
        let mut campaign = Campaign::new("winback", "Oi {{name}}").with_sending(sending);
        campaign.transition_to(CampaignStatus::Running, None).unwrap();
        records.insert(&campaign).await.unwrap();

        let sender = Arc::new(ScriptedSender {
            always_fail: always_fail.iter().map(|s| s.to_string()).collect(),
            sent: Mutex::new(Vec::new()),
        });
        let config = CampaignConfig {
            retry_base_delay: Duration::from_millis(10),
            retry_max_delay: Duration::from_millis(40),
            ..Default::default()
        };
        let dispatcher = BatchDispatcher::new(records.clone(), sender.clone(), config);
        (sender, dispatcher, records, campaign.id)
    }

    fn fast(batch_size: usize, max_retries: u32) -> SendingConfig {
        SendingConfig {
            batch_size,
            delay_between_messages: Duration::ZERO,
            delay_between_batches: Duration::ZERO,
            max_retries,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failures_and_skips_are_counted() {
        let (sender, dispatcher, records, id) = setup(
            &["5581900000001", "5581900000002", "12345"],
            &["5581900000002"],
            fast(10, 2),
        )
        .await;

        assert_eq!(dispatcher.run(id).await.unwrap(), DispatchEnd::Completed);

        let campaign = records.get(id).await.unwrap();
        let exec = &campaign.execution;
        assert_eq!(campaign.status, CampaignStatus::Completed);
        assert_eq!(exec.audience_size, 3);
        assert_eq!(exec.processed_count, 3);
        assert_eq!((exec.sent_count, exec.failed_count, exec.skipped_count), (1, 1, 1));
        assert_eq!(exec.retried_count, 2);
        assert!(exec.completed_at.is_some());
        assert_eq!(*sender.sent.lock().await, vec!["5581900000001".to_string()]);

        let outcomes = records.db().list_outcomes(id).await.unwrap();
        assert_eq!(outcomes.len(), 3);
        let failed = outcomes
            .iter()
            .find(|o| o.recipient == "5581900000002")
            .unwrap();
        assert_eq!(failed.attempt_number, 3);
        assert!(matches!(failed.outcome, Outcome::Failed { .. }));
    }

    #[tokio::test]
    async fn not_running_is_skipped() {
        let (sender, dispatcher, records, id) = setup(&["5581900000001"], &[], fast(10, 0)).await;
        records
            .update(id, |c| c.transition_to(CampaignStatus::Paused, None))
            .await
            .unwrap();
        assert_eq!(
            dispatcher.run(id).await.unwrap(),
            DispatchEnd::NotRunning(CampaignStatus::Paused)
        );
        assert!(sender.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn empty_audience_completes() {
        let (_sender, dispatcher, records, id) = setup(&[], &[], fast(10, 0)).await;
        assert_eq!(dispatcher.run(id).await.unwrap(), DispatchEnd::Completed);
        let campaign = records.get(id).await.unwrap();
        assert_eq!(campaign.execution.total_batches, 0);
        assert_eq!(records.db().load_audience(id).await.unwrap(), Some(vec![]));
    }

    #[tokio::test]
    async fn snapshot_is_reused() {
        let (_sender, dispatcher, records, id) =
            setup(&["5581900000001", "5581900000002"], &[], fast(10, 0)).await;
        records.db().save_audience(id, vec![]).await.unwrap();
        dispatcher.run(id).await.unwrap();
        assert_eq!(records.get(id).await.unwrap().execution.sent_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn recurring_campaign_rearms() {
        let (_sender, dispatcher, records, id) = setup(&["5581900000001"], &[], fast(10, 0)).await;
        records
            .update(id, |c| {
                c.schedule = crate::campaign::model::Schedule::Recurring {
                    pattern: "0 0 9 * * *".into(),
                };
                Ok(())
            })
            .await
            .unwrap();

        let end = dispatcher.run(id).await.unwrap();
        assert!(matches!(end, DispatchEnd::Rearmed { .. }));

        let campaign = records.get(id).await.unwrap();
        assert_eq!(campaign.status, CampaignStatus::Scheduled);
        assert!(campaign.next_run_at.is_some());
        assert!(records.db().load_audience(id).await.unwrap().is_none());
        assert_eq!(campaign.execution.processed_count, 0);
        assert_eq!(records.db().list_outcomes(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fail_marks_error_with_reason() {
        let (_sender, dispatcher, records, id) = setup(&[], &[], fast(10, 0)).await;
        dispatcher.fail(id, "store unavailable").await.unwrap();
        let campaign = records.get(id).await.unwrap();
        assert_eq!(campaign.status, CampaignStatus::Error);
        assert_eq!(campaign.execution.failure_reason.as_deref(), Some("store unavailable"));
        assert!(campaign.execution.completed_at.is_some());
        // Already terminal: no-op
        dispatcher.fail(id, "again").await.unwrap();
        assert_eq!(
            records.get(id).await.unwrap().execution.failure_reason.as_deref(),
            Some("store unavailable")
        );
    }

    #[tokio::test]
    async fn fail_while_paused_keeps_reason() {
        let (_sender, dispatcher, records, id) = setup(&[], &[], fast(10, 0)).await;
        records
            .update(id, |c| c.transition_to(CampaignStatus::Paused, None))
            .await
            .unwrap();

        dispatcher.fail(id, "dispatcher panicked").await.unwrap();
        let campaign = records.get(id).await.unwrap();
        assert_eq!(campaign.status, CampaignStatus::Paused);
        assert_eq!(campaign.execution.failure_reason.as_deref(), Some("dispatcher panicked"));
        assert!(campaign.execution.completed_at.is_none());
    }
}
