//! Validation boundary for client and operator writes.

pub mod messages;
pub mod providers;

pub use messages::{MessageManager, MessageOptions, NewMail, NewText};
pub use providers::{NewProvider, ProviderManager};
