//! SMTP sender: delivers Mail messages via lettre.
//!
//! Provider parameters: `host`, `port` (default 587), `username`, `password`,
//! and an optional `from_override` that replaces the message's sender.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment as MailAttachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{SmtpTransport, Transport};
use tracing::{debug, info};

use crate::channels::{MessageSender, SendFailure, SendReceipt};
use crate::model::{DecryptedParameters, MailContent, Message, MessageContent};

const DEFAULT_SMTP_PORT: u16 = 587;
/// Implicit-TLS submission port; everything else uses STARTTLS.
const IMPLICIT_TLS_PORT: u16 = 465;
const SMTP_TIMEOUT: Duration = Duration::from_secs(30);

// ── Configuration ───────────────────────────────────────────────────

/// SMTP settings resolved from decrypted provider parameters.
#[derive(Debug, Clone)]
struct SmtpSettings {
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    from_override: Option<String>,
}

impl SmtpSettings {
    fn from_params(params: &DecryptedParameters) -> Result<Self, SendFailure> {
        let host = params
            .get_str("host")
            .ok_or_else(|| SendFailure::missing_parameter("host"))?
            .to_string();

        let port = match params.get_str("port") {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e| SendFailure::new(format!("invalid SMTP port {raw:?}: {e}")))?,
            None => DEFAULT_SMTP_PORT,
        };

        Ok(Self {
            host,
            port,
            username: params.get_str("username").map(str::to_string),
            password: params.get_str("password").map(str::to_string),
            from_override: params.get_str("from_override").map(str::to_string),
        })
    }

    fn transport(&self) -> Result<SmtpTransport, SendFailure> {
        let builder = if self.port == IMPLICIT_TLS_PORT {
            SmtpTransport::relay(&self.host)
        } else {
            SmtpTransport::starttls_relay(&self.host)
        }
        .map_err(|e| SendFailure::new(format!("SMTP relay error: {e}")))?;

        let mut builder = builder.port(self.port).timeout(Some(SMTP_TIMEOUT));
        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }
        Ok(builder.build())
    }
}

// ── Message building ────────────────────────────────────────────────

fn mailbox(field: &str, raw: &str) -> Result<Mailbox, SendFailure> {
    raw.trim()
        .parse()
        .map_err(|e| SendFailure::new(format!("invalid {field} address {raw:?}: {e}")))
}

/// Build the MIME message for a Mail message.
fn build_email(
    message: &Message,
    mail: &MailContent,
    from_override: Option<&str>,
) -> Result<lettre::Message, SendFailure> {
    let from = mailbox("from", from_override.unwrap_or(&mail.from))?;
    let mut builder = lettre::Message::builder().from(from).subject(mail.subject.clone());
    for to in &mail.to {
        builder = builder.to(mailbox("to", to)?);
    }
    for cc in &mail.cc {
        builder = builder.cc(mailbox("cc", cc)?);
    }
    for bcc in &mail.bcc {
        builder = builder.bcc(mailbox("bcc", bcc)?);
    }

    let body = if mail.is_html {
        SinglePart::html(mail.body.clone())
    } else {
        SinglePart::plain(mail.body.clone())
    };

    let built = if message.attachments.is_empty() {
        builder.singlepart(body)
    } else {
        let mut parts = MultiPart::mixed().singlepart(body);
        for att in &message.attachments {
            let content_type = ContentType::parse(&att.mime_type).map_err(|e| {
                SendFailure::new(format!(
                    "invalid content type {:?} for attachment {}: {e}",
                    att.mime_type, att.name
                ))
            })?;
            parts = parts
                .singlepart(MailAttachment::new(att.name.clone()).body(att.content.clone(), content_type));
        }
        builder.multipart(parts)
    };

    built.map_err(|e| SendFailure::new(format!("Failed to build email: {e}")))
}

// ── Sender ──────────────────────────────────────────────────────────

/// Delivers Mail messages through an SMTP relay.
#[derive(Debug, Default)]
pub struct SmtpSender;

impl SmtpSender {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MessageSender for SmtpSender {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(
        &self,
        message: &Message,
        params: &DecryptedParameters,
    ) -> Result<SendReceipt, SendFailure> {
        let MessageContent::Mail(mail) = &message.content else {
            return Err(SendFailure::new(format!(
                "SMTP sender cannot deliver {} messages",
                message.message_type()
            )));
        };

        let settings = SmtpSettings::from_params(params)?;
        let email = build_email(message, mail, settings.from_override.as_deref())?;
        let transport = settings.transport()?;

        debug!(
            message_key = %message.message_key,
            host = %settings.host,
            port = settings.port,
            "Submitting email over SMTP"
        );

        // lettre's SmtpTransport is blocking.
        let response = tokio::task::spawn_blocking(move || transport.send(&email))
            .await
            .map_err(|e| SendFailure::new(format!("SMTP task failed: {e}")))?
            .map_err(|e| SendFailure::new(format!("SMTP send failed: {e}")))?;

        info!(
            message_key = %message.message_key,
            recipients = mail.to.len(),
            "Email accepted by SMTP relay"
        );
        Ok(SendReceipt {
            reference: response.first_line().map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;
    use crate::model::{Attachment, TextContent};

    fn params(pairs: &[(&str, &str)]) -> DecryptedParameters {
        DecryptedParameters::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), SecretString::from(v.to_string())))
                .collect(),
        )
    }

    fn mail_message() -> Message {
        Message::new(
            "m-1",
            MessageContent::Mail(MailContent {
                from: "noreply@example.com".into(),
                to: vec!["alice@example.com".into(), "bob@example.com".into()],
                cc: vec!["carol@example.com".into()],
                bcc: vec![],
                subject: "Quarterly report".into(),
                body: "See attached.".into(),
                is_html: false,
            }),
        )
    }

    fn content(msg: &Message) -> &MailContent {
        match &msg.content {
            MessageContent::Mail(m) => m,
            MessageContent::Text(_) => unreachable!(),
        }
    }

    #[test]
    fn settings_default_port_and_optional_credentials() {
        let s = SmtpSettings::from_params(&params(&[("host", "smtp.example.com")])).unwrap();
        assert_eq!(s.port, 587);
        assert!(s.username.is_none());
        assert!(s.from_override.is_none());

        let s = SmtpSettings::from_params(&params(&[
            ("HOST", "smtp.example.com"),
            ("port", "465"),
            ("username", "u"),
            ("password", "p"),
        ]))
        .unwrap();
        assert_eq!(s.port, 465);
        assert_eq!(s.username.as_deref(), Some("u"));
    }

    #[test]
    fn settings_require_host_and_numeric_port() {
        let err = SmtpSettings::from_params(&params(&[("port", "25")])).unwrap_err();
        assert!(err.diagnostic.contains("host"));

        let err =
            SmtpSettings::from_params(&params(&[("host", "h"), ("port", "smtp")])).unwrap_err();
        assert!(err.diagnostic.contains("port"));
    }

    #[test]
    fn builds_plain_email_with_all_recipients() {
        let msg = mail_message();
        let email = build_email(&msg, content(&msg), None).unwrap();
        let raw = String::from_utf8(email.formatted()).unwrap();
        assert!(raw.contains("Subject: Quarterly report"));
        assert!(raw.contains("alice@example.com"));
        assert!(raw.contains("bob@example.com"));
        assert!(raw.contains("Cc: carol@example.com"));
        assert!(raw.contains("From: noreply@example.com"));
    }

    #[test]
    fn from_override_replaces_sender() {
        let msg = mail_message();
        let email = build_email(&msg, content(&msg), Some("relay@corp.example")).unwrap();
        let raw = String::from_utf8(email.formatted()).unwrap();
        assert!(raw.contains("From: relay@corp.example"));
    }

    #[test]
    fn attachments_become_multipart() {
        let mut msg = mail_message();
        msg.attachments
            .push(Attachment::new("report.pdf", "application/pdf", b"%PDF-1.4".to_vec()));
        let email = build_email(&msg, content(&msg), None).unwrap();
        let raw = String::from_utf8(email.formatted()).unwrap();
        assert!(raw.contains("multipart/mixed"));
        assert!(raw.contains("report.pdf"));
    }

    #[test]
    fn invalid_recipient_is_a_send_failure() {
        let mut msg = mail_message();
        if let MessageContent::Mail(m) = &mut msg.content {
            m.to = vec!["not-an-address".into()];
        }
        let err = build_email(&msg, content(&msg), None).unwrap_err();
        assert!(err.diagnostic.contains("invalid to address"));
    }

    #[tokio::test]
    async fn refuses_text_messages() {
        let msg = Message::new(
            "t",
            MessageContent::Text(TextContent {
                from: "a".into(),
                to: "b".into(),
                body: "c".into(),
            }),
        );
        let err = SmtpSender::new()
            .send(&msg, &params(&[("host", "h")]))
            .await
            .unwrap_err();
        assert!(err.diagnostic.contains("text"));
    }

    #[tokio::test]
    async fn missing_host_fails_before_network() {
        let msg = mail_message();
        let err = SmtpSender::new().send(&msg, &params(&[])).await.unwrap_err();
        assert_eq!(err, SendFailure::missing_parameter("host"));
    }
}
