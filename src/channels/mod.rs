//! Outbound channels and the local console.

pub mod console;
pub mod whatsapp;

pub use console::{ConsoleInput, ConsoleSender};
pub use whatsapp::WhatsAppCloudSender;
