mod smtp;
pub mod templates;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use smtp::SmtpTransport;

use crate::config::EmailConfig;
use crate::errors::EmailError;
use templates::{verification_body, EmailBody, VerificationData};

/// Sends the one-time code to the mailbox derived from a login.
#[async_trait]
pub trait VerificationMailer: Send + Sync {
    async fn send(
        &self,
        local_part: &str,
        subject: &str,
        code: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), EmailError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: EmailBody,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn deliver(&self, email: &OutgoingEmail) -> Result<(), EmailError>;
}

/// Writes the message to the log instead of delivering it.
pub struct LogTransport;

#[async_trait]
impl MailTransport for LogTransport {
    async fn deliver(&self, email: &OutgoingEmail) -> Result<(), EmailError> {
        let preview = match &email.body {
            EmailBody::Html { text: Some(text), .. } => text.as_str(),
            EmailBody::Html { html, .. } => html.as_str(),
            EmailBody::Plain(text) => text.as_str(),
        };
        tracing::info!(
            from = %email.from,
            to = %email.to,
            subject = %email.subject,
            "Debug mode, email not delivered:\n{preview}"
        );
        Ok(())
    }
}

pub struct EmailService {
    config: EmailConfig,
    transport: Box<dyn MailTransport>,
}

impl EmailService {
    pub fn new(config: EmailConfig, transport: Box<dyn MailTransport>) -> Self {
        Self { config, transport }
    }

    /// SMTP delivery, or [`LogTransport`] when `debug` is set.
    pub fn from_config(config: EmailConfig) -> Result<Self, EmailError> {
        let transport: Box<dyn MailTransport> = if config.debug {
            tracing::warn!("Email debug mode is on, verification codes will only be logged");
            Box::new(LogTransport)
        } else {
            Box::new(SmtpTransport::new(&config)?)
        };
        Ok(Self::new(config, transport))
    }

    /// `{address_prefix}{local}@{domain}` with everything outside
    /// `[A-Za-z0-9._-]` stripped from `local`.
    pub fn format_address(&self, local: &str) -> Result<String, EmailError> {
        let sanitized: String = local
            .trim()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
            .collect();
        if sanitized.is_empty() {
            return Err(EmailError::InvalidAddress(format!("empty local part in {local:?}")));
        }
        Ok(format!(
            "{}{}@{}",
            self.config.address_prefix, sanitized, self.config.domain
        ))
    }

    fn format_from(&self) -> String {
        match &self.config.from_name {
            Some(name) if !name.is_empty() => format!("{name} <{}>", self.config.from_email),
            _ => self.config.from_email.clone(),
        }
    }
}

#[async_trait]
impl VerificationMailer for EmailService {
    #[tracing::instrument(skip(self, code, expires_at))]
    async fn send(
        &self,
        local_part: &str,
        subject: &str,
        code: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), EmailError> {
        let to = self.format_address(local_part)?;
        let data = VerificationData::new(local_part, code, expires_at);
        let body = verification_body(&self.config.template_dir, &data, &to);
        let email = OutgoingEmail {
            from: self.format_from(),
            to,
            subject: subject.to_owned(),
            body,
        };

        tokio::time::timeout(self.config.timeout(), self.transport.deliver(&email))
            .await
            .map_err(|_| EmailError::Timeout(self.config.timeout_secs))??;

        tracing::info!(to = %email.to, "Verification email sent");
        Ok(())
    }
}
