//! Campaign queue and scheduler.
//!
//! Campaign ids wait in a FIFO pending list. A queue tick hands them to
//! dispatcher tasks while fewer than `max_concurrent_campaigns` are
//! running; a schedule tick promotes due `Scheduled` campaigns. Both ticks
//! run as `PeriodicTask`s.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::campaign::dispatcher::BatchDispatcher;
use crate::campaign::model::{Campaign, CampaignStatus, Schedule};
use crate::campaign::records::CampaignRecords;
use crate::config::CampaignConfig;
use crate::error::{CampaignError, Error};

/// A background loop that calls `f` on a fixed interval until stopped.
pub struct PeriodicTask {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    pub fn spawn<F, Fut>(name: &'static str, interval: Duration, mut f: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Skip immediate first tick
            ticker.tick().await;

            loop {
                ticker.tick().await;
                f().await;
            }
        });
        debug!(task = name, interval_ms = interval.as_millis() as u64, "Periodic task started");
        Self {
            name,
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!(task = self.name, "Periodic task stopped");
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Pending and running campaign ids at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub pending: Vec<Uuid>,
    pub running: Vec<Uuid>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Uuid>,
    running: HashMap<Uuid, JoinHandle<()>>,
}

impl QueueState {
    fn reap(&mut self) {
        self.running.retain(|_, handle| !handle.is_finished());
    }

    fn is_running(&self, id: &Uuid) -> bool {
        self.running.get(id).is_some_and(|h| !h.is_finished())
    }
}

pub struct CampaignQueue {
    records: Arc<CampaignRecords>,
    dispatcher: Arc<BatchDispatcher>,
    config: CampaignConfig,
    state: Mutex<QueueState>,
    tasks: std::sync::Mutex<Vec<PeriodicTask>>,
}

impl CampaignQueue {
    pub fn new(
        records: Arc<CampaignRecords>,
        dispatcher: Arc<BatchDispatcher>,
        config: CampaignConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            records,
            dispatcher,
            config,
            state: Mutex::new(QueueState::default()),
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn records(&self) -> &Arc<CampaignRecords> {
        &self.records
    }

    // ── Operator actions ────────────────────────────────────────────

    /// Validate and store a new campaign. Immediate campaigns stay in
    /// `Draft` until started; timed ones are armed as `Scheduled`.
    pub async fn create(&self, mut campaign: Campaign) -> Result<Uuid, Error> {
        campaign.validate()?;
        if campaign.status != CampaignStatus::Draft {
            return Err(CampaignError::Validation(format!(
                "new campaigns must be drafts, got {}",
                campaign.status
            ))
            .into());
        }

        if !matches!(campaign.schedule, Schedule::Immediate) {
            let next = campaign.schedule.next_fire(Utc::now())?.ok_or_else(|| {
                CampaignError::Validation("schedule never fires".to_string())
            })?;
            campaign.next_run_at = Some(next);
            campaign.transition_to(CampaignStatus::Scheduled, None)?;
        }

        self.records.insert(&campaign).await?;
        info!(
            campaign_id = %campaign.id,
            name = %campaign.name,
            status = %campaign.status,
            next_run_at = ?campaign.next_run_at,
            "Campaign created"
        );
        Ok(campaign.id)
    }

    /// Start a draft campaign now.
    pub async fn start(&self, id: Uuid) -> Result<(), Error> {
        self.records
            .update(id, |c| {
                if c.status != CampaignStatus::Draft {
                    return Err(CampaignError::InvalidTransition {
                        id,
                        state: c.status,
                        target: CampaignStatus::Running,
                    });
                }
                c.transition_to(CampaignStatus::Running, Some("started".into()))
            })
            .await?;
        info!(campaign_id = %id, "Campaign started");
        self.enqueue(id).await;
        Ok(())
    }

    /// Pause a running campaign. Its dispatcher stops at the next
    /// recipient or batch boundary.
    pub async fn pause(&self, id: Uuid) -> Result<(), Error> {
        self.records
            .update(id, |c| {
                if c.status != CampaignStatus::Running {
                    return Err(CampaignError::InvalidTransition {
                        id,
                        state: c.status,
                        target: CampaignStatus::Paused,
                    });
                }
                c.transition_to(CampaignStatus::Paused, Some("paused by operator".into()))
            })
            .await?;
        self.remove_pending(id).await;
        info!(campaign_id = %id, "Campaign paused");
        Ok(())
    }

    /// Resume a paused campaign from its `processed_count`.
    pub async fn resume(&self, id: Uuid) -> Result<(), Error> {
        self.records
            .update(id, |c| {
                if c.status != CampaignStatus::Paused {
                    return Err(CampaignError::InvalidTransition {
                        id,
                        state: c.status,
                        target: CampaignStatus::Running,
                    });
                }
                c.transition_to(CampaignStatus::Running, Some("resumed by operator".into()))
            })
            .await?;

        self.push_pending(id).await;
        info!(campaign_id = %id, "Campaign resumed");
        Ok(())
    }

    /// Cancel a campaign in any non-terminal state.
    pub async fn cancel(&self, id: Uuid) -> Result<(), Error> {
        self.records
            .update(id, |c| {
                c.transition_to(CampaignStatus::Cancelled, Some("cancelled by operator".into()))
            })
            .await?;
        self.remove_pending(id).await;
        info!(campaign_id = %id, "Campaign cancelled");
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Campaign, Error> {
        self.records.get(id).await
    }

    // ── Queue ───────────────────────────────────────────────────────

    /// Add a campaign id to the pending list. No-op when it is already
    /// pending or has a live dispatcher.
    pub async fn enqueue(&self, id: Uuid) {
        let mut state = self.state.lock().await;
        if state.pending.contains(&id) || state.is_running(&id) {
            debug!(campaign_id = %id, "Campaign already queued");
            return;
        }
        state.pending.push_back(id);
        debug!(campaign_id = %id, pending = state.pending.len(), "Campaign enqueued");
    }

    /// Add to pending even if a previous dispatcher is still winding
    /// down; the tick holds the id until that task has exited.
    async fn push_pending(&self, id: Uuid) {
        let mut state = self.state.lock().await;
        if !state.pending.contains(&id) {
            state.pending.push_back(id);
        }
    }

    async fn remove_pending(&self, id: Uuid) {
        self.state.lock().await.pending.retain(|p| *p != id);
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        let mut state = self.state.lock().await;
        state.reap();
        let mut running: Vec<Uuid> = state.running.keys().copied().collect();
        running.sort();
        QueueSnapshot {
            pending: state.pending.iter().copied().collect(),
            running,
        }
    }

    /// Hand pending campaigns to dispatchers while below the concurrency
    /// cap. Returns the number of dispatchers started.
    pub async fn tick(&self) -> usize {
        let mut state = self.state.lock().await;
        state.reap();

        let mut deferred = Vec::new();
        let mut started = 0;
        while state.running.len() < self.config.max_concurrent_campaigns {
            let Some(id) = state.pending.pop_front() else {
                break;
            };
            if state.is_running(&id) {
                deferred.push(id);
                continue;
            }
            let handle = self.spawn_dispatch(id);
            state.running.insert(id, handle);
            started += 1;
        }

        for id in deferred.into_iter().rev() {
            state.pending.push_front(id);
        }

        if started > 0 {
            debug!(
                started,
                running = state.running.len(),
                pending = state.pending.len(),
                "Queue tick"
            );
        }
        started
    }

    /// Run the dispatcher on its own task. Errors and panics mark the
    /// campaign as failed without affecting the queue.
    fn spawn_dispatch(&self, id: Uuid) -> JoinHandle<()> {
        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::spawn(async move {
            let run = {
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move { dispatcher.run(id).await })
            };

            let failure = match run.await {
                Ok(Ok(end)) => {
                    debug!(campaign_id = %id, end = ?end, "Dispatcher finished");
                    None
                }
                Ok(Err(e)) => Some(e.to_string()),
                Err(join_err) if join_err.is_panic() => Some("dispatcher panicked".to_string()),
                Err(join_err) => Some(format!("dispatcher task aborted: {join_err}")),
            };

            if let Some(reason) = failure {
                error!(campaign_id = %id, reason = %reason, "Campaign dispatch failed");
                if let Err(e) = dispatcher.fail(id, &reason).await {
                    warn!(campaign_id = %id, error = %e, "Could not record campaign failure");
                }
            }
        })
    }

    /// Promote due scheduled campaigns to `Running` and enqueue them.
    /// Returns the number of campaigns claimed.
    pub async fn scan_scheduled(&self, now: DateTime<Utc>) -> Result<usize, Error> {
        let scheduled = self
            .records
            .db()
            .list_campaigns_by_status(CampaignStatus::Scheduled)
            .await?;

        let mut claimed = 0;
        for campaign in scheduled {
            if !campaign.next_run_at.is_some_and(|at| at <= now) {
                continue;
            }

            // Re-check under the record lock so each fire is claimed once.
            let won = self
                .records
                .update(campaign.id, |c| {
                    let due = c.next_run_at.is_some_and(|at| at <= now);
                    if c.status != CampaignStatus::Scheduled || !due {
                        return Ok(false);
                    }
                    c.next_run_at = None;
                    c.transition_to(CampaignStatus::Running, Some("schedule due".into()))?;
                    Ok(true)
                })
                .await?;

            if won {
                info!(campaign_id = %campaign.id, name = %campaign.name, "Scheduled campaign due");
                self.push_pending(campaign.id).await;
                claimed += 1;
            }
        }
        Ok(claimed)
    }

    // ── Background loops ────────────────────────────────────────────

    /// Start the queue and schedule ticks.
    pub fn start_background(self: &Arc<Self>) {
        let queue = Arc::clone(self);
        let queue_tick = PeriodicTask::spawn("campaign_queue", self.config.queue_tick_interval, move || {
            let queue = Arc::clone(&queue);
            async move {
                queue.tick().await;
            }
        });

        let queue = Arc::clone(self);
        let schedule_tick =
            PeriodicTask::spawn("campaign_schedule", self.config.schedule_tick_interval, move || {
                let queue = Arc::clone(&queue);
                async move {
                    if let Err(e) = queue.scan_scheduled(Utc::now()).await {
                        error!(error = %e, "Schedule scan failed");
                    }
                }
            });

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(queue_tick);
        tasks.push(schedule_tick);
        info!(
            max_concurrent = self.config.max_concurrent_campaigns,
            "Campaign scheduler started"
        );
    }

    /// Stop both ticks. Dispatchers already running finish on their own.
    pub fn stop_background(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for task in tasks.iter_mut() {
            task.stop();
        }
        tasks.clear();
        info!("Campaign scheduler stopped");
    }

    /// Whether the background ticks are active.
    pub fn is_background_running(&self) -> bool {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        !tasks.is_empty() && tasks.iter().all(PeriodicTask::is_running)
    }
}
