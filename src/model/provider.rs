//! Provider definitions: configured outbound delivery endpoints.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};

use crate::model::MessageType;

/// Store-assigned provider identifier.
pub type ProviderId = i64;

/// A parameter value as it travels between manager, store, and dispatcher.
///
/// The store only ever holds `Encrypted`. `Plain` exists transiently on the
/// write path before the manager seals it.
#[derive(Debug)]
pub enum ParameterValue {
    Encrypted(String),
    Plain(SecretString),
}

impl Clone for ParameterValue {
    fn clone(&self) -> Self {
        match self {
            Self::Encrypted(s) => Self::Encrypted(s.clone()),
            Self::Plain(s) => Self::Plain(SecretString::from(s.expose_secret().to_owned())),
        }
    }
}

/// Named connection parameter (host, api key, ...).
#[derive(Debug, Clone)]
pub struct ProviderParameter {
    pub name: String,
    pub value: ParameterValue,
}

impl ProviderParameter {
    pub fn plain(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: ParameterValue::Plain(SecretString::from(value.into())),
        }
    }
}

/// A configured outbound channel endpoint.
#[derive(Debug, Clone)]
pub struct ProviderType {
    pub id: Option<ProviderId>,
    pub name: String,
    /// Higher values are dispatched first.
    pub priority: i32,
    pub is_disabled: bool,
    pub can_process_emails: bool,
    pub can_process_texts: bool,
    /// Ordered; order is preserved through the store.
    pub parameters: Vec<ProviderParameter>,
    pub created_by: String,
    pub created_on_utc: DateTime<Utc>,
    pub last_updated_by: String,
    pub last_updated_on_utc: DateTime<Utc>,
}

impl ProviderType {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            name: name.into(),
            priority: 0,
            is_disabled: false,
            can_process_emails: false,
            can_process_texts: false,
            parameters: Vec::new(),
            created_by: String::new(),
            created_on_utc: now,
            last_updated_by: String::new(),
            last_updated_on_utc: now,
        }
    }

    /// Whether the capability flag for `channel` is set.
    pub fn supports(&self, channel: MessageType) -> bool {
        match channel {
            MessageType::Mail => self.can_process_emails,
            MessageType::Text => self.can_process_texts,
        }
    }

    /// Enabled and capable of `channel`.
    pub fn is_selectable_for(&self, channel: MessageType) -> bool {
        !self.is_disabled && self.supports(channel)
    }
}

/// Plaintext parameters for the duration of one send call.
///
/// Values are zeroized when this is dropped.
#[derive(Debug, Default)]
pub struct DecryptedParameters {
    values: Vec<(String, SecretString)>,
}

impl DecryptedParameters {
    pub fn new(values: Vec<(String, SecretString)>) -> Self {
        Self { values }
    }

    /// Case-insensitive lookup by parameter name.
    pub fn get(&self, name: &str) -> Option<&SecretString> {
        self.values
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Exposed string value, if present and non-empty.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name)
            .map(|v| v.expose_secret())
            .filter(|v| !v.is_empty())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_requires_capability_and_enabled() {
        let mut p = ProviderType::new("smtp-main");
        assert!(!p.is_selectable_for(MessageType::Mail));
        assert!(!p.is_selectable_for(MessageType::Text));

        p.can_process_emails = true;
        assert!(p.is_selectable_for(MessageType::Mail));
        assert!(!p.is_selectable_for(MessageType::Text));

        p.is_disabled = true;
        assert!(!p.is_selectable_for(MessageType::Mail));
    }

    #[test]
    fn decrypted_lookup_is_case_insensitive() {
        let params = DecryptedParameters::new(vec![
            ("Host".into(), SecretString::from("smtp.example.com".to_string())),
            ("Password".into(), SecretString::from(String::new())),
        ]);
        assert_eq!(params.get_str("host"), Some("smtp.example.com"));
        assert_eq!(params.get_str("password"), None);
        assert!(params.get("missing").is_none());
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn plain_parameter_clone_keeps_value() {
        let p = ProviderParameter::plain("api_key", "s3cret");
        let cloned = p.clone();
        match cloned.value {
            ParameterValue::Plain(s) => assert_eq!(s.expose_secret(), "s3cret"),
            ParameterValue::Encrypted(_) => panic!("expected plain"),
        }
    }
}
