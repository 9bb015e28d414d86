//! Dispatcher: one delivery attempt for one message.
//!
//! Walks the selected providers in order until one accepts. Every provider
//! tried leaves exactly one log row; the log rows and the new message state
//! are written together, in one store transaction.

use std::sync::Arc;

use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channels::SenderRegistry;
use crate::crypto::Cipher;
use crate::error::{CryptoError, PipelineError};
use crate::model::{
    DecryptedParameters, Message, MessageState, ParameterValue, PipelineLog, ProviderType,
};
use crate::pipeline::selector::ProviderSelector;
use crate::pipeline::state;
use crate::store::MessageStore;

/// What happened to a message in one dispatch call.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    /// The message as persisted after the attempt.
    pub message: Message,
    /// Provider that accepted the message, if any.
    pub sent_via: Option<String>,
    /// Provider-assigned reference from the accepting provider.
    pub reference: Option<String>,
    /// Number of providers tried (one log row each).
    pub providers_tried: usize,
}

impl DispatchReport {
    pub fn is_sent(&self) -> bool {
        self.message.message_state == MessageState::Sent
    }
}

/// Outcome of trying a single provider.
enum Attempt {
    Accepted(Option<String>),
    Rejected(String),
}

pub struct Dispatcher {
    selector: Arc<ProviderSelector>,
    senders: Arc<SenderRegistry>,
    cipher: Arc<dyn Cipher>,
    messages: Arc<dyn MessageStore>,
    system_user: String,
}

impl Dispatcher {
    pub fn new(
        selector: Arc<ProviderSelector>,
        senders: Arc<SenderRegistry>,
        cipher: Arc<dyn Cipher>,
        messages: Arc<dyn MessageStore>,
        system_user: impl Into<String>,
    ) -> Self {
        Self {
            selector,
            senders,
            cipher,
            messages,
            system_user: system_user.into(),
        }
    }

    /// Attempt delivery of `message` and persist the outcome.
    ///
    /// Provider failures are recorded, never returned. Errors are store or
    /// state-machine failures, or `Cancelled` when `cancel` fired before the
    /// attempt began. Once begun, an attempt runs to completion.
    pub async fn dispatch(
        &self,
        message: &Message,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport, PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled {
                key: message.message_key.clone(),
            });
        }

        let mut working = message.clone();
        state::begin_attempt(&mut working)?;
        let message_id = working
            .id
            .ok_or_else(|| PipelineError::Unsaved(working.message_key.clone()))?;

        let providers = self
            .selector
            .select_providers(working.message_type())
            .await?;

        if providers.is_empty() {
            warn!(
                message_id,
                message_key = %working.message_key,
                channel = %working.message_type(),
                "No providers available"
            );
        }

        let mut sent_via = None;
        let mut reference = None;
        let mut logs = Vec::with_capacity(providers.len());

        for provider in providers.iter() {
            let log = match self.attempt(&working, provider).await {
                Attempt::Accepted(receipt_ref) => {
                    info!(
                        message_id,
                        message_key = %working.message_key,
                        provider = %provider.name,
                        "Message sent"
                    );
                    sent_via = Some(provider.name.clone());
                    reference = receipt_ref.clone();
                    PipelineLog::success(message_id, provider, receipt_ref)
                }
                Attempt::Rejected(diagnostic) => {
                    warn!(
                        message_id,
                        message_key = %working.message_key,
                        provider = %provider.name,
                        diagnostic = %diagnostic,
                        "Provider attempt failed"
                    );
                    PipelineLog::failure(message_id, provider, diagnostic)
                }
            };
            logs.push(PipelineLog {
                created_by: self.system_user.clone(),
                ..log
            });

            if sent_via.is_some() {
                break;
            }
        }

        if sent_via.is_some() {
            state::record_sent(&mut working)?;
        } else {
            state::record_failed(&mut working)?;
            warn!(
                message_id,
                message_key = %working.message_key,
                error_count = working.error_count,
                providers_tried = logs.len(),
                "Message delivery failed"
            );
        }

        let persisted = self
            .messages
            .record_outcome(&working, &logs, &self.system_user)
            .await?;
        Ok(DispatchReport {
            message: persisted,
            sent_via,
            reference,
            providers_tried: logs.len(),
        })
    }

    async fn attempt(&self, message: &Message, provider: &ProviderType) -> Attempt {
        let Some(sender) = self.senders.resolve(&provider.name, message.message_type()) else {
            return Attempt::Rejected(format!(
                "no sender registered for provider {}",
                provider.name
            ));
        };

        let params = match self.decrypt(provider).await {
            Ok(params) => params,
            Err(e) => return Attempt::Rejected(format!("parameter decryption failed: {e}")),
        };

        debug!(
            message_key = %message.message_key,
            provider = %provider.name,
            sender = sender.name(),
            "Attempting provider"
        );

        // `params` is dropped (and zeroized) when this returns.
        match sender.send(message, &params).await {
            Ok(receipt) => Attempt::Accepted(receipt.reference),
            Err(failure) => Attempt::Rejected(failure.diagnostic),
        }
    }

    async fn decrypt(&self, provider: &ProviderType) -> Result<DecryptedParameters, CryptoError> {
        decrypt_parameters(self.cipher.as_ref(), provider).await
    }
}

/// Decrypt every parameter of `provider` into a transient plaintext set.
pub async fn decrypt_parameters(
    cipher: &dyn Cipher,
    provider: &ProviderType,
) -> Result<DecryptedParameters, CryptoError> {
    let mut values = Vec::with_capacity(provider.parameters.len());
    for param in &provider.parameters {
        let value = match &param.value {
            ParameterValue::Encrypted(sealed) => SecretString::from(cipher.decrypt(sealed).await?),
            ParameterValue::Plain(plain) => plain.clone(),
        };
        values.push((param.name.clone(), value));
    }
    Ok(DecryptedParameters::new(values))
}
