//! Inbound conversation core.
//!
//! - `gate`: at most one in-flight event per contact
//! - `stage` / `engine`: bounded stage lattice driven by the language adapter
//! - `classifier` / `normalize`: input preparation
//! - `notify`: admin notifications from before/after diffs
//! - `processor`: the end-to-end inbound pipeline

pub mod classifier;
pub mod engine;
pub mod gate;
pub mod model;
pub mod normalize;
pub mod notify;
pub mod processor;
pub mod stage;

pub use gate::{GateGuard, InboundGate};
pub use model::{Conversation, ConversationStatus, InterestLevel, KnownFields};
pub use normalize::InboundEvent;
pub use processor::{InboundProcessor, ProcessOutcome, ProposalGenerator};
pub use stage::{Stage, StageTable};
