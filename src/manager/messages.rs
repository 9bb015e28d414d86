//! Message manager: the validated entry point for client writes.
//!
//! Everything the pipeline later relies on (addresses, keys, scheduling
//! bounds) is checked here, so invalid input never reaches a sweep.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use regex::Regex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, Result, ValidationError};
use crate::model::{
    Attachment, MailContent, Message, MessageContent, MessageId, MessageProperty, TextContent,
    normalize_key,
};
use crate::store::MessageStore;

/// Longest accepted message key.
pub const MAX_KEY_LEN: usize = 64;

/// Digits with an optional leading `+`, once separators are stripped.
static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?[0-9]{3,15}$").expect("valid phone regex"));

/// Settings shared by every new message regardless of channel.
#[derive(Debug, Clone, Default)]
pub struct MessageOptions {
    /// Client-chosen key. Generated when absent.
    pub key: Option<String>,
    /// Lower values dispatch first.
    pub priority: i32,
    /// Defaults to now.
    pub process_after_utc: Option<DateTime<Utc>>,
    /// Defaults to now plus the configured days to live.
    pub archive_after_utc: Option<DateTime<Utc>>,
    pub attachments: Vec<Attachment>,
    pub properties: Vec<MessageProperty>,
}

/// A Mail message as submitted by a client.
#[derive(Debug, Clone, Default)]
pub struct NewMail {
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub is_html: bool,
    pub options: MessageOptions,
}

/// A Text message as submitted by a client.
#[derive(Debug, Clone, Default)]
pub struct NewText {
    pub from: String,
    pub to: String,
    pub body: String,
    pub options: MessageOptions,
}

pub struct MessageManager {
    store: Arc<dyn MessageStore>,
    max_days_to_live: u32,
}

impl MessageManager {
    pub fn new(store: Arc<dyn MessageStore>, max_days_to_live: u32) -> Self {
        Self {
            store,
            max_days_to_live,
        }
    }

    pub async fn create_mail(&self, new: NewMail, user: &str) -> Result<Message> {
        let content = MessageContent::Mail(MailContent {
            from: new.from.trim().to_string(),
            to: trimmed(new.to),
            cc: trimmed(new.cc),
            bcc: trimmed(new.bcc),
            subject: new.subject,
            body: new.body,
            is_html: new.is_html,
        });
        self.create(content, new.options, user).await
    }

    pub async fn create_text(&self, new: NewText, user: &str) -> Result<Message> {
        let content = MessageContent::Text(TextContent {
            from: new.from.trim().to_string(),
            to: new.to.trim().to_string(),
            body: new.body,
        });
        self.create(content, new.options, user).await
    }

    async fn create(
        &self,
        content: MessageContent,
        options: MessageOptions,
        user: &str,
    ) -> Result<Message> {
        require_user(user)?;
        validate_content(&content)?;
        validate_attachments(&options.attachments)?;
        validate_properties(&options.properties)?;

        let key = resolve_key(options.key.as_deref())?;
        if self.store.find_by_key(&key).await?.is_some() {
            return Err(ValidationError::DuplicateKey(key).into());
        }

        let now = Utc::now();
        let process_after = options.process_after_utc.unwrap_or(now);
        let archive_after = options
            .archive_after_utc
            .unwrap_or_else(|| now + ChronoDuration::days(i64::from(self.max_days_to_live)));
        if archive_after < process_after {
            return Err(ValidationError::InvalidField {
                field: "archive_after_utc",
                reason: "must not precede process_after_utc".into(),
            }
            .into());
        }

        let mut message = Message::new(&key, content);
        message.priority = options.priority;
        message.process_after_utc = process_after;
        message.archive_after_utc = archive_after;
        message.attachments = options.attachments;
        message.properties = options.properties;

        let stored = match self.store.create(&message, user).await {
            Ok(stored) => stored,
            // Lost a race with a concurrent create of the same key.
            Err(DatabaseError::Constraint(_)) => {
                return Err(ValidationError::DuplicateKey(key).into());
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            message_id = ?stored.id,
            message_key = %stored.message_key,
            channel = %stored.message_type(),
            user,
            "Message created"
        );
        Ok(stored)
    }

    /// Case-insensitive key lookup.
    pub async fn find_by_key(&self, key: &str) -> Result<Option<Message>> {
        Ok(self.store.find_by_key(key).await?)
    }

    pub async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>> {
        Ok(self.store.find_by_id(id).await?)
    }

    /// Apply the client-editable fields of `message` (priority, disabled
    /// flag, content, attachments, properties) to the stored row. State and
    /// error count belong to the pipeline and are kept as stored.
    pub async fn update(&self, message: &Message, user: &str) -> Result<Message> {
        require_user(user)?;
        let id = message.id.ok_or(ValidationError::MissingField("id"))?;
        validate_content(&message.content)?;
        validate_attachments(&message.attachments)?;
        validate_properties(&message.properties)?;

        let mut stored = self
            .store
            .find_by_id(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "message".into(),
                id: id.to_string(),
            })?;
        if stored.message_state != message.message_state {
            warn!(
                message_key = %stored.message_key,
                stored = %stored.message_state,
                requested = %message.message_state,
                "Ignoring client change to message state"
            );
        }
        stored.priority = message.priority;
        stored.is_disabled = message.is_disabled;
        stored.content = message.content.clone();
        stored.attachments = message.attachments.clone();
        stored.properties = message.properties.clone();
        Ok(self.store.update(&stored, user).await?)
    }

    pub async fn delete(&self, message: &Message, user: &str) -> Result<()> {
        require_user(user)?;
        self.store.delete(message, user).await?;
        info!(message_key = %message.message_key, user, "Message deleted");
        Ok(())
    }

    /// Exclude a message from every sweep without deleting it.
    pub async fn disable(&self, key: &str, user: &str) -> Result<Message> {
        require_user(user)?;
        let mut message =
            self.store
                .find_by_key(key)
                .await?
                .ok_or_else(|| DatabaseError::NotFound {
                    entity: "message".into(),
                    id: normalize_key(key),
                })?;
        message.is_disabled = true;
        let stored = self.store.update(&message, user).await?;
        info!(message_key = %stored.message_key, user, "Message disabled");
        Ok(stored)
    }
}

fn trimmed(values: Vec<String>) -> Vec<String> {
    values.into_iter().map(|v| v.trim().to_string()).collect()
}

fn require_user(user: &str) -> std::result::Result<(), ValidationError> {
    if user.trim().is_empty() {
        return Err(ValidationError::MissingField("user"));
    }
    Ok(())
}

/// Normalized client key, or a generated one when none was given.
fn resolve_key(key: Option<&str>) -> std::result::Result<String, ValidationError> {
    let key = match key.map(str::trim).filter(|k| !k.is_empty()) {
        Some(k) => normalize_key(k),
        None => Uuid::new_v4().simple().to_string().to_uppercase(),
    };
    if key.chars().count() > MAX_KEY_LEN {
        return Err(ValidationError::InvalidField {
            field: "message_key",
            reason: format!("longer than {MAX_KEY_LEN} characters"),
        });
    }
    Ok(key)
}

fn validate_address(field: &'static str, raw: &str) -> std::result::Result<(), ValidationError> {
    raw.parse::<lettre::Address>()
        .map(|_| ())
        .map_err(|e| ValidationError::InvalidField {
            field,
            reason: format!("{raw:?}: {e}"),
        })
}

fn validate_phone(field: &'static str, raw: &str) -> std::result::Result<(), ValidationError> {
    let compact: String = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect();
    if PHONE_RE.is_match(&compact) {
        Ok(())
    } else {
        Err(ValidationError::InvalidField {
            field,
            reason: format!("{raw:?} is not a phone number"),
        })
    }
}

fn validate_content(content: &MessageContent) -> std::result::Result<(), ValidationError> {
    match content {
        MessageContent::Mail(mail) => {
            if mail.from.is_empty() {
                return Err(ValidationError::MissingField("from"));
            }
            validate_address("from", &mail.from)?;
            if mail.to.is_empty() {
                return Err(ValidationError::MissingField("to"));
            }
            for to in &mail.to {
                validate_address("to", to)?;
            }
            for cc in &mail.cc {
                validate_address("cc", cc)?;
            }
            for bcc in &mail.bcc {
                validate_address("bcc", bcc)?;
            }
        }
        MessageContent::Text(text) => {
            if text.from.is_empty() {
                return Err(ValidationError::MissingField("from"));
            }
            if text.to.is_empty() {
                return Err(ValidationError::MissingField("to"));
            }
            validate_phone("to", &text.to)?;
            if text.body.trim().is_empty() {
                return Err(ValidationError::MissingField("body"));
            }
        }
    }
    Ok(())
}

fn validate_attachments(attachments: &[Attachment]) -> std::result::Result<(), ValidationError> {
    for att in attachments {
        if att.name.trim().is_empty() {
            return Err(ValidationError::MissingField("attachment name"));
        }
        if att.content.is_empty() {
            return Err(ValidationError::InvalidField {
                field: "attachment content",
                reason: format!("{} is empty", att.name),
            });
        }
    }
    Ok(())
}

fn validate_properties(properties: &[MessageProperty]) -> std::result::Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for prop in properties {
        let name = prop.name.trim();
        if name.is_empty() {
            return Err(ValidationError::MissingField("property name"));
        }
        if !seen.insert(name) {
            return Err(ValidationError::DuplicateName {
                kind: "property",
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::model::{MessageState, MessageType, PropertyValue};
    use crate::store::LibSqlBackend;

    async fn manager() -> MessageManager {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        MessageManager::new(db, 30)
    }

    fn mail() -> NewMail {
        NewMail {
            from: "noreply@example.com".into(),
            to: vec!["alice@example.com".into()],
            subject: "Hi".into(),
            body: "Hello".into(),
            ..NewMail::default()
        }
    }

    fn text() -> NewText {
        NewText {
            from: "ACME".into(),
            to: "+1 (555) 010-0002".into(),
            body: "Your code is 1234".into(),
            ..NewText::default()
        }
    }

    fn with_key(mut new: NewMail, key: &str) -> NewMail {
        new.options.key = Some(key.into());
        new
    }

    #[tokio::test]
    async fn creates_mail_with_defaults() {
        let mgr = manager().await;
        let before = Utc::now();
        let msg = mgr.create_mail(mail(), "alice").await.unwrap();

        assert!(msg.id.is_some());
        assert_eq!(msg.message_type(), MessageType::Mail);
        assert_eq!(msg.message_state, MessageState::Pending);
        assert_eq!(msg.message_key.len(), 32);
        assert_eq!(msg.message_key, msg.message_key.to_uppercase());
        assert!(msg.process_after_utc >= before);
        assert!(msg.archive_after_utc >= before + ChronoDuration::days(29));
        assert_eq!(msg.created_by, "alice");
    }

    #[tokio::test]
    async fn creates_text_and_finds_by_key() {
        let mgr = manager().await;
        let mut new = text();
        new.options.key = Some(" otp-77 ".into());
        let msg = mgr.create_text(new, "svc").await.unwrap();
        assert_eq!(msg.message_key, "OTP-77");

        let found = mgr.find_by_key("otp-77").await.unwrap().unwrap();
        assert_eq!(found.id, msg.id);
        let by_id = mgr.find_by_id(msg.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(by_id.message_key, "OTP-77");
    }

    #[tokio::test]
    async fn duplicate_key_is_rejected_case_insensitively() {
        let mgr = manager().await;
        mgr.create_mail(with_key(mail(), "Order-1"), "u").await.unwrap();
        let err = mgr
            .create_mail(with_key(mail(), "ORDER-1"), "u")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::DuplicateKey(k)) if k == "ORDER-1"
        ));
    }

    #[tokio::test]
    async fn rejects_bad_input() {
        let mgr = manager().await;

        let err = mgr.create_mail(mail(), " ").await.unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::MissingField("user"))));

        let mut bad = mail();
        bad.to.clear();
        assert!(matches!(
            mgr.create_mail(bad, "u").await.unwrap_err(),
            Error::Validation(ValidationError::MissingField("to"))
        ));

        let mut bad = mail();
        bad.cc = vec!["nope".into()];
        assert!(matches!(
            mgr.create_mail(bad, "u").await.unwrap_err(),
            Error::Validation(ValidationError::InvalidField { field: "cc", .. })
        ));

        let mut bad = text();
        bad.to = "call me".into();
        assert!(matches!(
            mgr.create_text(bad, "u").await.unwrap_err(),
            Error::Validation(ValidationError::InvalidField { field: "to", .. })
        ));

        let mut bad = text();
        bad.body = "  ".into();
        assert!(matches!(
            mgr.create_text(bad, "u").await.unwrap_err(),
            Error::Validation(ValidationError::MissingField("body"))
        ));

        let long = "K".repeat(MAX_KEY_LEN + 1);
        assert!(matches!(
            mgr.create_mail(with_key(mail(), &long), "u").await.unwrap_err(),
            Error::Validation(ValidationError::InvalidField { field: "message_key", .. })
        ));
    }

    #[tokio::test]
    async fn archive_bound_must_not_precede_processing() {
        let mgr = manager().await;
        let mut new = mail();
        new.options.process_after_utc = Some(Utc::now() + ChronoDuration::days(2));
        new.options.archive_after_utc = Some(Utc::now() + ChronoDuration::days(1));
        assert!(matches!(
            mgr.create_mail(new, "u").await.unwrap_err(),
            Error::Validation(ValidationError::InvalidField { field: "archive_after_utc", .. })
        ));
    }

    #[tokio::test]
    async fn attachments_and_properties_are_checked() {
        let mgr = manager().await;

        let mut new = mail();
        new.options
            .attachments
            .push(Attachment::new("empty.txt", "text/plain", vec![]));
        assert!(mgr.create_mail(new, "u").await.is_err());

        let mut new = mail();
        new.options.properties = vec![
            MessageProperty::new("tenant", PropertyValue::Integer(1)),
            MessageProperty::new("tenant", PropertyValue::Integer(2)),
        ];
        assert!(matches!(
            mgr.create_mail(new, "u").await.unwrap_err(),
            Error::Validation(ValidationError::DuplicateName { kind: "property", .. })
        ));
    }

    #[tokio::test]
    async fn disable_marks_message_and_missing_key_is_not_found() {
        let mgr = manager().await;
        mgr.create_mail(with_key(mail(), "d-1"), "u").await.unwrap();

        let disabled = mgr.disable("D-1", "ops").await.unwrap();
        assert!(disabled.is_disabled);
        assert_eq!(disabled.last_updated_by, "ops");

        assert!(matches!(
            mgr.disable("missing", "ops").await.unwrap_err(),
            Error::Database(DatabaseError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn update_keeps_pipeline_state() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let mgr = MessageManager::new(db.clone(), 30);
        let created = mgr.create_mail(mail(), "u").await.unwrap();

        let mut sent = created.clone();
        sent.message_state = MessageState::Sent;
        db.record_outcome(&sent, &[], "pipeline").await.unwrap();

        let mut edited = created.clone();
        edited.message_state = MessageState::Pending;
        edited.error_count = 0;
        edited.priority = 2;
        let updated = mgr.update(&edited, "editor").await.unwrap();

        assert_eq!(updated.message_state, MessageState::Sent);
        assert_eq!(updated.priority, 2);
        assert_eq!(updated.last_updated_by, "editor");
        assert!(db.find_ready_to_process().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_of_missing_message_is_not_found() {
        let mgr = manager().await;
        let mut ghost = mgr.create_mail(mail(), "u").await.unwrap();
        mgr.delete(&ghost, "u").await.unwrap();
        ghost.priority = 1;

        assert!(matches!(
            mgr.update(&ghost, "editor").await.unwrap_err(),
            Error::Database(DatabaseError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn update_validates_and_delete_removes() {
        let mgr = manager().await;
        let mut msg = mgr.create_mail(mail(), "u").await.unwrap();

        msg.priority = 3;
        let updated = mgr.update(&msg, "editor").await.unwrap();
        assert_eq!(updated.priority, 3);

        if let MessageContent::Mail(m) = &mut msg.content {
            m.to = vec!["broken".into()];
        }
        assert!(mgr.update(&msg, "editor").await.is_err());

        mgr.delete(&updated, "u").await.unwrap();
        assert!(mgr.find_by_key(&updated.message_key).await.unwrap().is_none());
    }
}
