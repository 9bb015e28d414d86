//! Canonical in-memory entities: messages, providers, and attempt logs.

pub mod log;
pub mod message;
pub mod provider;

pub use log::{ArchivedMessage, LogOutcome, PipelineLog, PipelineLogId};
pub use message::{
    Attachment, FileType, MailContent, Message, MessageContent, MessageId, MessageProperty,
    MessageState, MessageType, PropertyValue, TextContent, normalize_key,
};
pub use provider::{
    DecryptedParameters, ParameterValue, ProviderId, ProviderParameter, ProviderType,
};
