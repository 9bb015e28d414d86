//! Provider name → sender lookup.

use std::collections::HashMap;
use std::sync::Arc;

use crate::channels::MessageSender;
use crate::model::MessageType;

/// Maps provider names (case-insensitive) to the sender that serves them.
///
/// A per-channel default covers providers with no explicit binding.
#[derive(Default, Clone)]
pub struct SenderRegistry {
    senders: HashMap<String, Arc<dyn MessageSender>>,
    defaults: HashMap<MessageType, Arc<dyn MessageSender>>,
}

impl SenderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `sender` for `provider_name`, replacing any earlier binding.
    pub fn register(&mut self, provider_name: &str, sender: Arc<dyn MessageSender>) {
        tracing::debug!(provider = provider_name, sender = sender.name(), "Sender registered");
        self.senders.insert(provider_name.trim().to_lowercase(), sender);
    }

    /// Builder-style `register`.
    pub fn with(mut self, provider_name: &str, sender: Arc<dyn MessageSender>) -> Self {
        self.register(provider_name, sender);
        self
    }

    /// Sender used for `channel` when a provider has no explicit binding.
    pub fn set_default(&mut self, channel: MessageType, sender: Arc<dyn MessageSender>) {
        tracing::debug!(%channel, sender = sender.name(), "Default sender registered");
        self.defaults.insert(channel, sender);
    }

    /// Builder-style `set_default`.
    pub fn with_default(mut self, channel: MessageType, sender: Arc<dyn MessageSender>) -> Self {
        self.set_default(channel, sender);
        self
    }

    /// Explicit binding for `provider_name` only.
    pub fn get(&self, provider_name: &str) -> Option<Arc<dyn MessageSender>> {
        self.senders
            .get(&provider_name.trim().to_lowercase())
            .cloned()
    }

    /// Explicit binding, else the default for `channel`.
    pub fn resolve(&self, provider_name: &str, channel: MessageType) -> Option<Arc<dyn MessageSender>> {
        self.get(provider_name)
            .or_else(|| self.defaults.get(&channel).cloned())
    }

    /// Number of explicit bindings.
    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty() && self.defaults.is_empty()
    }
}
