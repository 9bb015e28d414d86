//! Pipeline log rows and archived message snapshots.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Message, MessageId, MessageState, MessageType, ProviderId, ProviderType};

pub type PipelineLogId = i64;

/// Result of one provider attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogOutcome {
    Success,
    Failure,
}

impl LogOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

impl fmt::Display for LogOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            other => Err(format!("unknown log outcome: {other}")),
        }
    }
}

/// Append-only record of one dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineLog {
    pub id: Option<PipelineLogId>,
    pub message_id: MessageId,
    pub provider_type_id: Option<ProviderId>,
    pub provider_name: Option<String>,
    pub outcome: LogOutcome,
    pub detail: Option<String>,
    pub created_by: String,
    pub created_on_utc: DateTime<Utc>,
}

impl PipelineLog {
    pub fn success(message_id: MessageId, provider: &ProviderType, detail: Option<String>) -> Self {
        Self::attempt(message_id, Some(provider), LogOutcome::Success, detail)
    }

    pub fn failure(message_id: MessageId, provider: &ProviderType, detail: impl Into<String>) -> Self {
        Self::attempt(message_id, Some(provider), LogOutcome::Failure, Some(detail.into()))
    }

    fn attempt(
        message_id: MessageId,
        provider: Option<&ProviderType>,
        outcome: LogOutcome,
        detail: Option<String>,
    ) -> Self {
        Self {
            id: None,
            message_id,
            provider_type_id: provider.and_then(|p| p.id),
            provider_name: provider.map(|p| p.name.clone()),
            outcome,
            detail,
            created_by: String::new(),
            created_on_utc: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == LogOutcome::Success
    }
}

/// Snapshot of a message removed from the active working set.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedMessage {
    pub message_id: MessageId,
    pub message_key: String,
    pub message_type: MessageType,
    pub message_state: MessageState,
    pub error_count: u32,
    /// Full message as JSON at archive time.
    pub snapshot: serde_json::Value,
    pub archived_by: String,
    pub archived_on_utc: DateTime<Utc>,
}

impl ArchivedMessage {
    /// Restore the archived message body.
    pub fn message(&self) -> Result<Message, serde_json::Error> {
        serde_json::from_value(self.snapshot.clone())
    }
}
