//! Repository traits the pipeline depends on.
//!
//! The core only sees these; the libSQL backend implements all three.

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::model::{
    ArchivedMessage, Message, MessageId, PipelineLog, ProviderType,
};

/// Durable message records and the filtered "ready" queries.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Enabled messages that are neither `Failed` nor `Sent` and whose
    /// `process_after_utc` has passed. Newest first, then ascending priority.
    async fn find_ready_to_process(&self) -> Result<Vec<Message>, DatabaseError>;

    /// Enabled `Failed` messages with `error_count < max_error_count`.
    /// Same ordering as `find_ready_to_process`.
    async fn find_ready_to_retry(&self, max_error_count: u32)
    -> Result<Vec<Message>, DatabaseError>;

    /// Enabled messages in any state whose `archive_after_utc` has passed or
    /// that were created more than `max_days_to_live` days ago.
    async fn find_ready_to_archive(
        &self,
        max_days_to_live: u32,
    ) -> Result<Vec<Message>, DatabaseError>;

    /// Case-insensitive key lookup among active messages.
    async fn find_by_key(&self, key: &str) -> Result<Option<Message>, DatabaseError>;

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, DatabaseError>;

    /// Insert the message with its attachments and properties atomically.
    /// Returns the stored message with its assigned id and audit fields.
    async fn create(&self, message: &Message, user: &str) -> Result<Message, DatabaseError>;

    /// Update client-editable fields and replace child rows atomically.
    /// Read-only fields and the lifecycle fields (`message_state`,
    /// `error_count`) on `message` are ignored.
    async fn update(&self, message: &Message, user: &str) -> Result<Message, DatabaseError>;

    /// Persist a dispatch outcome: the message's state and error count plus
    /// its attempt logs, in one transaction. Refused once the stored message
    /// is `Sent`; nothing is written then.
    async fn record_outcome(
        &self,
        message: &Message,
        logs: &[PipelineLog],
        user: &str,
    ) -> Result<Message, DatabaseError>;

    /// Remove the message and its child rows.
    async fn delete(&self, message: &Message, user: &str) -> Result<(), DatabaseError>;

    /// Snapshot the message into the archive and remove it from the active set.
    async fn archive(&self, message: &Message, user: &str) -> Result<(), DatabaseError>;

    async fn find_archived_by_key(
        &self,
        key: &str,
    ) -> Result<Option<ArchivedMessage>, DatabaseError>;
}

/// Configured outbound providers. Parameter values are stored encrypted.
#[async_trait]
pub trait ProviderRegistry: Send + Sync {
    /// Enabled providers with `can_process_emails`.
    async fn find_for_emails(&self) -> Result<Vec<ProviderType>, DatabaseError>;

    /// Enabled providers with `can_process_texts`.
    async fn find_for_texts(&self) -> Result<Vec<ProviderType>, DatabaseError>;

    async fn find_by_name(&self, name: &str) -> Result<Option<ProviderType>, DatabaseError>;

    async fn find_all(&self) -> Result<Vec<ProviderType>, DatabaseError>;

    async fn create(&self, provider: &ProviderType, user: &str)
    -> Result<ProviderType, DatabaseError>;

    async fn update(&self, provider: &ProviderType, user: &str)
    -> Result<ProviderType, DatabaseError>;
}

/// Append-only attempt log.
#[async_trait]
pub trait PipelineLogStore: Send + Sync {
    async fn create(&self, log: &PipelineLog) -> Result<PipelineLog, DatabaseError>;

    /// Oldest first.
    async fn find_by_message(&self, message_id: MessageId)
    -> Result<Vec<PipelineLog>, DatabaseError>;
}
