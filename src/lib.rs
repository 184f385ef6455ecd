//! Sales funnel: WhatsApp lead qualification and campaign dispatch.

pub mod campaign;
pub mod channels;
pub mod config;
pub mod conversation;
pub mod error;
pub mod llm;
pub mod store;
