//! Message entity: a Mail or Text unit of outbound communication.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store-assigned message identifier.
pub type MessageId = i64;

/// Channel discriminant. Fixed at creation; selects the provider pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Mail,
    Text,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mail => "mail",
            Self::Text => "text",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mail" => Ok(Self::Mail),
            "text" => Ok(Self::Text),
            other => Err(format!("unknown message type: {other}")),
        }
    }
}

/// Lifecycle state of a message. Transition rules live in `pipeline::state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    /// Created, never attempted.
    Pending,
    /// A dispatch attempt is underway.
    Processing,
    /// A provider accepted the message. Terminal.
    Sent,
    /// Every candidate provider rejected the last attempt.
    Failed,
}

impl MessageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown message state: {other}")),
        }
    }
}

/// Mail payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailContent {
    pub from: String,
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub is_html: bool,
}

/// Text (SMS-style) payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextContent {
    pub from: String,
    pub to: String,
    pub body: String,
}

/// Variant payload; the variant decides the message type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    Mail(MailContent),
    Text(TextContent),
}

impl MessageContent {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Mail(_) => MessageType::Mail,
            Self::Text(_) => MessageType::Text,
        }
    }
}

/// Coarse attachment classification derived from the MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Document,
    Image,
    Audio,
    Video,
    Archive,
    Other,
}

impl FileType {
    /// Classify a MIME type such as `image/png` or `application/pdf`.
    pub fn from_mime(mime: &str) -> Self {
        let mime = mime.trim().to_ascii_lowercase();
        let (top, sub) = mime.split_once('/').unwrap_or((mime.as_str(), ""));
        match top {
            "image" => Self::Image,
            "audio" => Self::Audio,
            "video" => Self::Video,
            "text" => Self::Document,
            "application" => match sub {
                "zip" | "gzip" | "x-tar" | "x-7z-compressed" | "x-rar-compressed" => Self::Archive,
                "pdf" | "msword" | "rtf" | "json" | "xml" => Self::Document,
                s if s.starts_with("vnd.openxmlformats") || s.starts_with("vnd.ms-") => {
                    Self::Document
                }
                _ => Self::Other,
            },
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Archive => "archive",
            Self::Other => "other",
        }
    }
}

impl FromStr for FileType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "document" => Ok(Self::Document),
            "image" => Ok(Self::Image),
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            "archive" => Ok(Self::Archive),
            "other" => Ok(Self::Other),
            other => Err(format!("unknown file type: {other}")),
        }
    }
}

/// Binary attachment owned by a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub file_type: FileType,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
}

impl Attachment {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, content: Vec<u8>) -> Self {
        let mime_type = mime_type.into();
        Self {
            name: name.into(),
            file_type: FileType::from_mime(&mime_type),
            mime_type,
            content,
        }
    }
}

/// Typed metadata value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    Text(String),
    Integer(i64),
    Boolean(bool),
    DateTime(DateTime<Utc>),
}

impl PropertyValue {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Integer(_) => "integer",
            Self::Boolean(_) => "boolean",
            Self::DateTime(_) => "datetime",
        }
    }

    /// Storage text form; `parse` is its inverse.
    pub fn to_storage(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Integer(i) => i.to_string(),
            Self::Boolean(b) => b.to_string(),
            Self::DateTime(dt) => dt.to_rfc3339(),
        }
    }

    pub fn parse(kind: &str, raw: &str) -> Result<Self, String> {
        match kind {
            "text" => Ok(Self::Text(raw.to_string())),
            "integer" => raw
                .parse()
                .map(Self::Integer)
                .map_err(|e| format!("bad integer property {raw:?}: {e}")),
            "boolean" => raw
                .parse()
                .map(Self::Boolean)
                .map_err(|e| format!("bad boolean property {raw:?}: {e}")),
            "datetime" => DateTime::parse_from_rfc3339(raw)
                .map(|dt| Self::DateTime(dt.with_timezone(&Utc)))
                .map_err(|e| format!("bad datetime property {raw:?}: {e}")),
            other => Err(format!("unknown property kind: {other}")),
        }
    }
}

/// Key/value metadata owned by a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProperty {
    pub name: String,
    pub value: PropertyValue,
}

impl MessageProperty {
    pub fn new(name: impl Into<String>, value: PropertyValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// A message tracked through the dispatch lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// `None` until the store assigns one.
    pub id: Option<MessageId>,
    /// Upper-cased unique key.
    pub message_key: String,
    pub message_state: MessageState,
    /// Rank: lower values are dispatched first.
    pub priority: i32,
    pub is_disabled: bool,
    pub error_count: u32,
    pub process_after_utc: DateTime<Utc>,
    pub archive_after_utc: DateTime<Utc>,
    pub content: MessageContent,
    pub attachments: Vec<Attachment>,
    pub properties: Vec<MessageProperty>,
    pub created_by: String,
    pub created_on_utc: DateTime<Utc>,
    pub last_updated_by: String,
    pub last_updated_on_utc: DateTime<Utc>,
}

impl Message {
    /// Create an unsaved Pending message.
    ///
    /// The key is normalized; scheduling bounds default to "now" and are
    /// normally overwritten by the manager.
    pub fn new(key: &str, content: MessageContent) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            message_key: normalize_key(key),
            message_state: MessageState::Pending,
            priority: 0,
            is_disabled: false,
            error_count: 0,
            process_after_utc: now,
            archive_after_utc: now,
            content,
            attachments: Vec::new(),
            properties: Vec::new(),
            created_by: String::new(),
            created_on_utc: now,
            last_updated_by: String::new(),
            last_updated_on_utc: now,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.content.message_type()
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties
            .iter()
            .find(|p| p.name == name)
            .map(|p| &p.value)
    }
}

/// Canonical key form: trimmed and upper-cased.
pub fn normalize_key(key: &str) -> String {
    key.trim().to_uppercase()
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text() -> MessageContent {
        MessageContent::Text(TextContent {
            from: "+15550001".into(),
            to: "+15550002".into(),
            body: "hi".into(),
        })
    }

    #[test]
    fn new_message_is_pending_with_normalized_key() {
        let msg = Message::new("  order-42 ", text());
        assert_eq!(msg.message_key, "ORDER-42");
        assert_eq!(msg.message_state, MessageState::Pending);
        assert_eq!(msg.error_count, 0);
        assert_eq!(msg.message_type(), MessageType::Text);
        assert!(msg.id.is_none());
    }

    #[test]
    fn file_type_classification() {
        assert_eq!(FileType::from_mime("image/png"), FileType::Image);
        assert_eq!(FileType::from_mime("application/pdf"), FileType::Document);
        assert_eq!(FileType::from_mime("application/zip"), FileType::Archive);
        assert_eq!(FileType::from_mime("text/csv"), FileType::Document);
        assert_eq!(FileType::from_mime("audio/mpeg"), FileType::Audio);
        assert_eq!(
            FileType::from_mime(
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            ),
            FileType::Document
        );
        assert_eq!(FileType::from_mime("application/octet-stream"), FileType::Other);
        assert_eq!(FileType::from_mime("garbage"), FileType::Other);
    }

    #[test]
    fn property_storage_form_parses_back() {
        let now = Utc::now();
        for value in [
            PropertyValue::Text("abc".into()),
            PropertyValue::Integer(-7),
            PropertyValue::Boolean(true),
            PropertyValue::DateTime(now),
        ] {
            let parsed = PropertyValue::parse(value.kind(), &value.to_storage()).unwrap();
            assert_eq!(parsed, value);
        }
        assert!(PropertyValue::parse("integer", "seven").is_err());
        assert!(PropertyValue::parse("blob", "x").is_err());
    }

    #[test]
    fn state_and_type_strings() {
        assert_eq!("failed".parse::<MessageState>().unwrap(), MessageState::Failed);
        assert_eq!(MessageState::Processing.to_string(), "processing");
        assert_eq!("mail".parse::<MessageType>().unwrap(), MessageType::Mail);
        assert!("fax".parse::<MessageType>().is_err());
    }

    #[test]
    fn attachment_snapshot_encodes_content_as_base64() {
        let att = Attachment::new("a.txt", "text/plain", b"hello".to_vec());
        let json = serde_json::to_value(&att).unwrap();
        assert_eq!(json["content"], "aGVsbG8=");
        let back: Attachment = serde_json::from_value(json).unwrap();
        assert_eq!(back, att);
    }
}
