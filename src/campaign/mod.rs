//! Campaign dispatch engine.
//!
//! - `model`: campaign records, status machine, audience criteria
//! - `records`: locked read-modify-write of campaign records
//! - `queue`: pending list, concurrency cap, periodic ticks
//! - `dispatcher`: batches, pacing, retry and finalization
//! - `sender` / `template` / `retry`: sending helpers

pub mod dispatcher;
pub mod model;
pub mod queue;
pub mod records;
pub mod retry;
pub mod sender;
pub mod template;

pub use dispatcher::{BatchDispatcher, DispatchEnd};
pub use model::{Campaign, CampaignStatus, Schedule, SendingConfig};
pub use queue::{CampaignQueue, PeriodicTask, QueueSnapshot};
pub use records::CampaignRecords;
pub use sender::{MessageSender, PacedSender, SendReceipt};
