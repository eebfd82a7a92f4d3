//! Verification email bodies.
//!
//! Templates live in `{template_dir}/verification.html` (required) and
//! `verification.txt` (optional) and use `{{Name}}` placeholders.

use std::path::Path;

use chrono::{DateTime, Datelike, Utc};

use crate::errors::EmailError;

pub const VERIFICATION_TEMPLATE: &str = "verification";

/// Values substituted into the verification templates.
#[derive(Debug, Clone)]
pub struct VerificationData {
    pub login: String,
    pub code: String,
    pub expires_at: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

impl VerificationData {
    pub fn new(login: impl Into<String>, code: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            login: login.into(),
            code: code.into(),
            expires_at,
            now: Utc::now(),
        }
    }

    /// Remaining validity in whole minutes, e.g. "30 minutes".
    pub fn expires_in(&self) -> String {
        let seconds = (self.expires_at - self.now).num_seconds().max(0);
        let minutes = (seconds as f64 / 60.0).round() as i64;
        format!("{minutes} minutes")
    }

    fn placeholders(&self) -> [(&'static str, String); 5] {
        [
            ("{{Login}}", self.login.clone()),
            ("{{Code}}", self.code.clone()),
            ("{{ExpiresIn}}", self.expires_in()),
            ("{{ExpiresAt}}", self.expires_at.format("%Y-%m-%d %H:%M:%S UTC").to_string()),
            ("{{CurrentYear}}", self.now.year().to_string()),
        ]
    }

    pub fn render(&self, template: &str) -> String {
        self.placeholders()
            .iter()
            .fold(template.to_owned(), |body, (placeholder, value)| body.replace(placeholder, value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmailBody {
    Html { html: String, text: Option<String> },
    Plain(String),
}

/// Renders the named templates from `dir`.
pub fn render_template(dir: &Path, name: &str, data: &VerificationData) -> Result<EmailBody, EmailError> {
    let html_path = dir.join(format!("{name}.html"));
    let html = std::fs::read_to_string(&html_path)
        .map_err(|e| EmailError::Template(format!("{}: {e}", html_path.display())))?;

    // The text alternative is optional.
    let text = std::fs::read_to_string(dir.join(format!("{name}.txt")))
        .ok()
        .map(|template| data.render(&template));

    Ok(EmailBody::Html {
        html: data.render(&html),
        text,
    })
}

/// Plain-text body used when the templates cannot be rendered.
pub fn fallback_text(data: &VerificationData, recipient: &str) -> String {
    format!(
        "Hello {login},

Your verification code is:

📋 {code} 📋
(copy and paste this code)

This code will expire in {expires_in}.

Best regards,
The Quiz Team

This email was sent to {recipient}",
        login = data.login,
        code = data.code,
        expires_in = data.expires_in(),
    )
}

/// Template body, or the fallback text when rendering fails.
pub fn verification_body(dir: &Path, data: &VerificationData, recipient: &str) -> EmailBody {
    match render_template(dir, VERIFICATION_TEMPLATE, data) {
        Ok(body) => body,
        Err(e) => {
            log::warn!("Falling back to plain text verification email: {e}");
            EmailBody::Plain(fallback_text(data, recipient))
        }
    }
}
