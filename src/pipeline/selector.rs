//! Provider selection: the ordered candidate list for a channel.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::cache::TtlCache;
use crate::error::DatabaseError;
use crate::model::{MessageType, ProviderType};
use crate::store::ProviderRegistry;

/// Chooses candidate providers for a channel, caching each list for a TTL.
pub struct ProviderSelector {
    registry: Arc<dyn ProviderRegistry>,
    cache: TtlCache<MessageType, Arc<Vec<ProviderType>>>,
}

impl ProviderSelector {
    pub fn new(registry: Arc<dyn ProviderRegistry>, cache_ttl: Duration) -> Self {
        Self {
            registry,
            cache: TtlCache::new(cache_ttl),
        }
    }

    /// Enabled providers capable of `channel`, highest priority first, ties
    /// broken by name. An empty list means no delivery is possible.
    pub async fn select_providers(
        &self,
        channel: MessageType,
    ) -> Result<Arc<Vec<ProviderType>>, DatabaseError> {
        self.cache
            .get_or_populate(channel, || async {
                let found = match channel {
                    MessageType::Mail => self.registry.find_for_emails().await?,
                    MessageType::Text => self.registry.find_for_texts().await?,
                };
                let mut candidates: Vec<ProviderType> = found
                    .into_iter()
                    .filter(|p| p.is_selectable_for(channel))
                    .collect();
                candidates.sort_by(|a, b| {
                    b.priority
                        .cmp(&a.priority)
                        .then_with(|| a.name.cmp(&b.name))
                });
                debug!(%channel, count = candidates.len(), "Provider list loaded");
                Ok(Arc::new(candidates))
            })
            .await
    }

    /// Drop cached lists so the next selection reads the registry.
    pub fn invalidate(&self) {
        self.cache.clear();
    }
}
