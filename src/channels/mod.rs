//! Outbound senders: the provider-specific delivery I/O.
//!
//! A sender is pure I/O: it turns a message plus decrypted provider
//! parameters into one delivery attempt. Provider choice, logging, and state
//! changes live in the dispatcher.

pub mod email;
pub mod registry;
pub mod text;

use async_trait::async_trait;

use crate::model::{DecryptedParameters, Message};

pub use email::SmtpSender;
pub use registry::SenderRegistry;
pub use text::HttpTextSender;

/// Provider acknowledgement of an accepted message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReceipt {
    /// Provider-assigned reference, when the provider returns one.
    pub reference: Option<String>,
}

impl SendReceipt {
    pub fn with_reference(reference: impl Into<String>) -> Self {
        Self {
            reference: Some(reference.into()),
        }
    }
}

/// A routine delivery failure. Recorded as a log row, never propagated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{diagnostic}")]
pub struct SendFailure {
    pub diagnostic: String,
}

impl SendFailure {
    pub fn new(diagnostic: impl Into<String>) -> Self {
        Self {
            diagnostic: diagnostic.into(),
        }
    }

    pub fn missing_parameter(name: &str) -> Self {
        Self::new(format!("missing provider parameter: {name}"))
    }
}

/// Trait for provider senders.
///
/// Registered by provider name in the `SenderRegistry`.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Sender name for logs (e.g. "smtp", "http-text").
    fn name(&self) -> &str;

    /// Attempt delivery of `message` using `params`.
    async fn send(
        &self,
        message: &Message,
        params: &DecryptedParameters,
    ) -> Result<SendReceipt, SendFailure>;
}
