use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use super::templates::EmailBody;
use super::{MailTransport, OutgoingEmail};
use crate::config::EmailConfig;
use crate::errors::EmailError;

/// Delivers mail through an SMTP relay. TLS is always required: implicit on
/// port 465, STARTTLS everywhere else.
pub struct SmtpTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpTransport {
    pub fn new(config: &EmailConfig) -> Result<Self, EmailError> {
        let tls = TlsParameters::new(config.host.clone())
            .map_err(|e| EmailError::Transport(format!("TLS configuration error: {e}")))?;

        let builder = if config.port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| EmailError::Transport(format!("SMTP relay error: {e}")))?
                .port(config.port)
                .tls(Tls::Wrapper(tls))
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| EmailError::Transport(format!("SMTP relay error: {e}")))?
                .port(config.port)
                .tls(Tls::Required(tls))
        };

        let builder = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => builder.credentials(Credentials::new(user.clone(), pass.clone())),
            _ => builder,
        };

        Ok(Self {
            transport: builder.timeout(Some(config.timeout())).build(),
        })
    }
}

pub(crate) fn build_message(email: &OutgoingEmail) -> Result<Message, EmailError> {
    let from: Mailbox = email
        .from
        .parse()
        .map_err(|e| EmailError::InvalidAddress(format!("{}: {e}", email.from)))?;
    let to: Mailbox = email
        .to
        .parse()
        .map_err(|e| EmailError::InvalidAddress(format!("{}: {e}", email.to)))?;

    let builder = Message::builder().from(from).to(to).subject(email.subject.clone());

    let message = match &email.body {
        EmailBody::Plain(text) => builder
            .header(ContentType::TEXT_PLAIN)
            .body(text.clone()),
        EmailBody::Html { html, text: Some(text) } => builder.multipart(
            MultiPart::alternative()
                .singlepart(
                    SinglePart::builder()
                        .header(ContentType::TEXT_PLAIN)
                        .body(text.clone()),
                )
                .singlepart(
                    SinglePart::builder()
                        .header(ContentType::TEXT_HTML)
                        .body(html.clone()),
                ),
        ),
        EmailBody::Html { html, text: None } => builder
            .header(ContentType::TEXT_HTML)
            .body(html.clone()),
    };

    message.map_err(|e| EmailError::Build(e.to_string()))
}

#[async_trait]
impl MailTransport for SmtpTransport {
    async fn deliver(&self, email: &OutgoingEmail) -> Result<(), EmailError> {
        let message = build_message(email)?;
        self.transport
            .send(message)
            .await
            .map_err(|e| EmailError::Transport(e.to_string()))?;
        Ok(())
    }
}
