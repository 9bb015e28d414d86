//! Provider manager: validated provider writes with sealed parameters.
//!
//! Plaintext parameter values exist only on the way in; they are encrypted
//! here before the registry sees them.

use std::collections::HashSet;
use std::sync::Arc;

use secrecy::ExposeSecret;
use tracing::info;

use crate::crypto::Cipher;
use crate::error::{DatabaseError, Result, ValidationError};
use crate::model::{DecryptedParameters, ParameterValue, ProviderParameter, ProviderType};
use crate::pipeline::decrypt_parameters;
use crate::store::ProviderRegistry;

/// A provider definition as submitted by an operator.
#[derive(Debug, Clone, Default)]
pub struct NewProvider {
    pub name: String,
    /// Higher values are tried first.
    pub priority: i32,
    pub is_disabled: bool,
    pub can_process_emails: bool,
    pub can_process_texts: bool,
    /// Usually `ProviderParameter::plain` values.
    pub parameters: Vec<ProviderParameter>,
}

pub struct ProviderManager {
    registry: Arc<dyn ProviderRegistry>,
    cipher: Arc<dyn Cipher>,
}

impl ProviderManager {
    pub fn new(registry: Arc<dyn ProviderRegistry>, cipher: Arc<dyn Cipher>) -> Self {
        Self { registry, cipher }
    }

    pub async fn create(&self, new: NewProvider, user: &str) -> Result<ProviderType> {
        require_user(user)?;
        let name = validate_name(&new.name)?;
        validate_parameter_names(&new.parameters)?;
        if self.registry.find_by_name(&name).await?.is_some() {
            return Err(ValidationError::DuplicateProvider(name).into());
        }

        let mut provider = ProviderType::new(name.clone());
        provider.priority = new.priority;
        provider.is_disabled = new.is_disabled;
        provider.can_process_emails = new.can_process_emails;
        provider.can_process_texts = new.can_process_texts;
        provider.parameters = self.seal(new.parameters).await?;

        let stored = match self.registry.create(&provider, user).await {
            Ok(stored) => stored,
            Err(DatabaseError::Constraint(_)) => {
                return Err(ValidationError::DuplicateProvider(name).into());
            }
            Err(e) => return Err(e.into()),
        };
        info!(
            provider_id = ?stored.id,
            provider = %stored.name,
            parameters = stored.parameters.len(),
            user,
            "Provider created"
        );
        Ok(stored)
    }

    /// Persist changes. Any `Plain` parameter value is encrypted first.
    pub async fn update(&self, provider: &ProviderType, user: &str) -> Result<ProviderType> {
        require_user(user)?;
        let id = provider.id.ok_or(ValidationError::MissingField("id"))?;
        let name = validate_name(&provider.name)?;
        validate_parameter_names(&provider.parameters)?;
        let existing = self.registry.find_by_name(&name).await?;
        if existing.is_some_and(|other| other.id != Some(id)) {
            return Err(ValidationError::DuplicateProvider(name).into());
        }

        let mut sealed = provider.clone();
        sealed.name = name;
        sealed.parameters = self.seal(provider.parameters.clone()).await?;
        let stored = self.registry.update(&sealed, user).await?;
        info!(provider_id = id, provider = %stored.name, user, "Provider updated");
        Ok(stored)
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<ProviderType>> {
        Ok(self.registry.find_by_name(name).await?)
    }

    pub async fn find_all(&self) -> Result<Vec<ProviderType>> {
        Ok(self.registry.find_all().await?)
    }

    /// Plaintext parameters for operator inspection or a manual send.
    pub async fn decrypt_parameters(&self, provider: &ProviderType) -> Result<DecryptedParameters> {
        Ok(decrypt_parameters(self.cipher.as_ref(), provider).await?)
    }

    async fn seal(&self, parameters: Vec<ProviderParameter>) -> Result<Vec<ProviderParameter>> {
        let mut sealed = Vec::with_capacity(parameters.len());
        for param in parameters {
            let value = match param.value {
                ParameterValue::Plain(plain) => {
                    ParameterValue::Encrypted(self.cipher.encrypt(plain.expose_secret()).await?)
                }
                encrypted @ ParameterValue::Encrypted(_) => encrypted,
            };
            sealed.push(ProviderParameter {
                name: param.name.trim().to_string(),
                value,
            });
        }
        Ok(sealed)
    }
}

fn require_user(user: &str) -> std::result::Result<(), ValidationError> {
    if user.trim().is_empty() {
        return Err(ValidationError::MissingField("user"));
    }
    Ok(())
}

fn validate_name(name: &str) -> std::result::Result<String, ValidationError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ValidationError::MissingField("name"));
    }
    Ok(name.to_string())
}

/// Names must be present and unique ignoring case, matching parameter lookup.
fn validate_parameter_names(
    parameters: &[ProviderParameter],
) -> std::result::Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for param in parameters {
        let name = param.name.trim();
        if name.is_empty() {
            return Err(ValidationError::MissingField("parameter name"));
        }
        if !seen.insert(name.to_lowercase()) {
            return Err(ValidationError::DuplicateName {
                kind: "parameter",
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AesGcmCipher;
    use crate::error::Error;
    use crate::store::LibSqlBackend;

    async fn manager() -> ProviderManager {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let cipher = Arc::new(AesGcmCipher::new(&[5u8; 32]).unwrap());
        ProviderManager::new(db, cipher)
    }

    fn smtp() -> NewProvider {
        NewProvider {
            name: "primary-smtp".into(),
            priority: 10,
            can_process_emails: true,
            parameters: vec![
                ProviderParameter::plain("host", "smtp.example.com"),
                ProviderParameter::plain("password", "hunter2"),
            ],
            ..NewProvider::default()
        }
    }

    #[tokio::test]
    async fn create_seals_parameters() {
        let mgr = manager().await;
        let stored = mgr.create(smtp(), "admin").await.unwrap();

        assert_eq!(stored.parameters.len(), 2);
        for param in &stored.parameters {
            match &param.value {
                ParameterValue::Encrypted(sealed) => assert!(!sealed.contains("hunter2")),
                ParameterValue::Plain(_) => panic!("stored plaintext"),
            }
        }

        let params = mgr.decrypt_parameters(&stored).await.unwrap();
        assert_eq!(params.get_str("host"), Some("smtp.example.com"));
        assert_eq!(params.get_str("password"), Some("hunter2"));
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let mgr = manager().await;
        mgr.create(smtp(), "admin").await.unwrap();

        let mut again = smtp();
        again.name = "PRIMARY-SMTP".into();
        assert!(matches!(
            mgr.create(again, "admin").await.unwrap_err(),
            Error::Validation(ValidationError::DuplicateProvider(_))
        ));

        let mut dup_param = smtp();
        dup_param.name = "other".into();
        dup_param
            .parameters
            .push(ProviderParameter::plain("HOST", "x"));
        assert!(matches!(
            mgr.create(dup_param, "admin").await.unwrap_err(),
            Error::Validation(ValidationError::DuplicateName { kind: "parameter", .. })
        ));
    }

    #[tokio::test]
    async fn blank_name_or_user_is_rejected() {
        let mgr = manager().await;
        let mut blank = smtp();
        blank.name = "  ".into();
        assert!(matches!(
            mgr.create(blank, "admin").await.unwrap_err(),
            Error::Validation(ValidationError::MissingField("name"))
        ));
        assert!(matches!(
            mgr.create(smtp(), "").await.unwrap_err(),
            Error::Validation(ValidationError::MissingField("user"))
        ));
    }

    #[tokio::test]
    async fn update_reseals_plain_values_and_keeps_sealed_ones() {
        let mgr = manager().await;
        let mut stored = mgr.create(smtp(), "admin").await.unwrap();
        let sealed_host = stored.parameters[0].clone();

        stored.parameters[1] = ProviderParameter::plain("password", "correct-horse");
        stored.priority = 1;
        let updated = mgr.update(&stored, "ops").await.unwrap();
        assert_eq!(updated.priority, 1);
        assert_eq!(updated.last_updated_by, "ops");

        match (&updated.parameters[0].value, &sealed_host.value) {
            (ParameterValue::Encrypted(a), ParameterValue::Encrypted(b)) => assert_eq!(a, b),
            _ => panic!("host parameter should stay sealed"),
        }
        let params = mgr.decrypt_parameters(&updated).await.unwrap();
        assert_eq!(params.get_str("password"), Some("correct-horse"));
    }

    #[tokio::test]
    async fn update_cannot_take_another_providers_name() {
        let mgr = manager().await;
        mgr.create(smtp(), "admin").await.unwrap();
        let mut second = mgr
            .create(
                NewProvider {
                    name: "backup".into(),
                    can_process_emails: true,
                    ..NewProvider::default()
                },
                "admin",
            )
            .await
            .unwrap();

        second.name = "primary-smtp".into();
        assert!(matches!(
            mgr.update(&second, "admin").await.unwrap_err(),
            Error::Validation(ValidationError::DuplicateProvider(_))
        ));

        assert_eq!(mgr.find_all().await.unwrap().len(), 2);
        assert!(mgr.find_by_name("backup").await.unwrap().is_some());
    }
}
