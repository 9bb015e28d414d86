//! Component wiring: builds the managers and the pipeline over one backend.

use std::sync::Arc;

use crate::channels::{HttpTextSender, SenderRegistry, SmtpSender};
use crate::config::{PipelineConfig, SchedulerConfig};
use crate::crypto::Cipher;
use crate::manager::{MessageManager, ProviderManager};
use crate::model::MessageType;
use crate::pipeline::{Director, Dispatcher, ProviderSelector, Scheduler};
use crate::store::{MessageStore, ProviderRegistry};

/// Senders for providers without an explicit binding: SMTP for mail, the
/// HTTP gateway for texts.
pub fn default_senders() -> SenderRegistry {
    SenderRegistry::new()
        .with_default(MessageType::Mail, Arc::new(SmtpSender::new()))
        .with_default(MessageType::Text, Arc::new(HttpTextSender::new()))
}

/// Everything a running relay needs, wired to a single store.
pub struct Relay {
    pub messages: Arc<MessageManager>,
    pub providers: Arc<ProviderManager>,
    pub selector: Arc<ProviderSelector>,
    pub director: Arc<Director>,
    pub scheduler: Arc<Scheduler>,
}

impl Relay {
    pub fn build<B>(
        backend: Arc<B>,
        cipher: Arc<dyn Cipher>,
        senders: SenderRegistry,
        pipeline: PipelineConfig,
        scheduler: SchedulerConfig,
    ) -> Self
    where
        B: MessageStore + ProviderRegistry + 'static,
    {
        let pipeline = pipeline.with_floors();

        let selector = Arc::new(ProviderSelector::new(
            backend.clone(),
            pipeline.provider_cache_ttl,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&selector),
            Arc::new(senders),
            Arc::clone(&cipher),
            backend.clone(),
            pipeline.system_user.clone(),
        ));
        let messages = Arc::new(MessageManager::new(
            backend.clone(),
            pipeline.max_days_to_live,
        ));
        let providers = Arc::new(ProviderManager::new(backend.clone(), cipher));
        let director = Arc::new(Director::new(backend, dispatcher, pipeline));
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&director), scheduler));

        Self {
            messages,
            providers,
            selector,
            director,
            scheduler,
        }
    }
}
