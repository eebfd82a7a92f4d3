//! The registration dialog.
//!
//! ```text
//! Start --/register--> AwaitingLogin --login--> AwaitingOtp --code--> Registered
//! ```
//!
//! A wrong or malformed code keeps the dialog in `AwaitingOtp`. An expired
//! code, or one replaced by a newer code from another chat, sends it back to
//! `AwaitingLogin`.

use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::config::{Config, EmailFailurePolicy};
use crate::database::connection::{UserDirectory, VerificationCodes};
use crate::database::user::{NewUser, Role};
use crate::email::VerificationMailer;
use crate::errors::DialogError;
use crate::fsm::{FsmContext, IncomingMessage, Router};
use crate::messenger::Messenger;
use crate::otp::CodeGenerator;
use crate::state::{DataField, RegistrationState};

pub const EMAIL_SUBJECT: &str = "Your Verification Code";
pub const WRONG_CODE: &str = "Wrong verification code. Please enter the code again:";
pub const CODE_EXPIRED: &str =
    "This verification code has expired. Please send your login again to get a new one:";
pub const CODE_SUPERSEDED: &str =
    "A newer verification code was requested for your account. Please send your login again:";
pub const EMAIL_FAILED: &str =
    "We could not send the verification email. Please send your login again:";
pub const ACCOUNT_BLOCKED: &str = "Your account is blocked. Please contact an administrator.";
pub const DEFAULT_REPLY: &str = "I'm not sure how to respond. Try using the /start command.";

#[derive(Debug, Clone)]
pub struct Settings {
    pub login_prefixes: Vec<String>,
    pub code_length: usize,
    pub code_ttl: Duration,
    pub webmail_url: String,
    pub failure_policy: EmailFailurePolicy,
}

impl Settings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            login_prefixes: config.registration.login_prefixes.clone(),
            code_length: config.registration.code_length,
            code_ttl: Duration::seconds(config.registration.code_ttl_secs as i64),
            webmail_url: config.registration.webmail_url.clone(),
            failure_policy: config.email.failure_policy,
        }
    }

    /// Matches `text` against the configured prefixes. The rest of the login
    /// becomes the mailbox name.
    pub fn parse_login(&self, text: &str) -> Option<Login> {
        let text = text.trim();
        self.login_prefixes.iter().find_map(|prefix| {
            let local = text.strip_prefix(prefix.as_str())?;
            let valid = !local.is_empty()
                && local
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
            valid.then(|| Login {
                full: text.to_owned(),
                local: local.to_owned(),
            })
        })
    }

    fn login_prompt(&self) -> String {
        format!(
            "Please enter your university login (it starts with {}):",
            self.login_prefixes.join(" or ")
        )
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub full: String,
    pub local: String,
}

pub struct Registration {
    users: Arc<dyn UserDirectory>,
    codes: Arc<dyn VerificationCodes>,
    mailer: Arc<dyn VerificationMailer>,
    otp: Arc<dyn CodeGenerator>,
    settings: Settings,
}

impl Registration {
    pub fn new(
        users: Arc<dyn UserDirectory>,
        codes: Arc<dyn VerificationCodes>,
        mailer: Arc<dyn VerificationMailer>,
        otp: Arc<dyn CodeGenerator>,
        settings: Settings,
    ) -> Self {
        Self {
            users,
            codes,
            mailer,
            otp,
            settings,
        }
    }

    pub fn install(self: &Arc<Self>, router: &mut Router) {
        let (login, otp, registered) = (self.clone(), self.clone(), self.clone());
        router
            .register(RegistrationState::AwaitingLogin, move |ctx, msg, messenger| {
                login.clone().handle_login(ctx, msg, messenger)
            })
            .register(RegistrationState::AwaitingOtp, move |ctx, msg, messenger| {
                otp.clone().handle_otp(ctx, msg, messenger)
            })
            .register(RegistrationState::Registered, move |ctx, msg, messenger| {
                registered.clone().handle_registered(ctx, msg, messenger)
            })
            .default_message(handle_default);
    }

    /// Entry point of `/register`.
    pub async fn begin(
        &self,
        ctx: &FsmContext,
        chat_id: i64,
        messenger: &dyn Messenger,
    ) -> Result<(), DialogError> {
        if ctx.current().await? == RegistrationState::Registered {
            let login = ctx.get_data(DataField::Login).await?.unwrap_or_default();
            messenger
                .send_text(chat_id, &format!("Hi {login}! You are already registered."))
                .await?;
            return Ok(());
        }

        ctx.clear_data().await?;
        ctx.set(RegistrationState::AwaitingLogin).await?;
        messenger.send_text(chat_id, &self.settings.login_prompt()).await?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(key = %ctx.key()))]
    async fn handle_login(
        self: Arc<Self>,
        ctx: FsmContext,
        msg: IncomingMessage,
        messenger: Arc<dyn Messenger>,
    ) -> Result<(), DialogError> {
        let text = msg.text.as_deref().unwrap_or_default();
        let Some(login) = self.settings.parse_login(text) else {
            log::info!("{}: rejected login {:?}", ctx.key(), text);
            messenger
                .send_text(msg.chat_id, &format!("That login is not valid. {}", self.settings.login_prompt()))
                .await?;
            return Ok(());
        };

        let code = self.otp.generate()?;
        ctx.set_data(DataField::Login, login.full.as_str()).await?;
        ctx.set_data(DataField::Code, code.as_str()).await?;

        let expires_at = Utc::now() + self.settings.code_ttl;
        self.codes
            .update_or_create(msg.user_id, &code, expires_at)
            .await?;

        let sent = tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => return Err(DialogError::Cancelled),
            sent = self.mailer.send(&login.local, EMAIL_SUBJECT, &code, expires_at) => sent,
        };

        if let Err(e) = sent {
            log::warn!("{}: verification email for {} failed: {e}", ctx.key(), login.full);
            if self.settings.failure_policy == EmailFailurePolicy::Abort {
                ctx.clear_data().await?;
                self.codes.delete(msg.user_id, &code).await?;
                messenger.send_text(msg.chat_id, EMAIL_FAILED).await?;
                return Ok(());
            }
        }

        ctx.set(RegistrationState::AwaitingOtp).await?;
        log::info!("{}: verification code issued for {}", ctx.key(), login.full);
        messenger
            .send_html(
                msg.chat_id,
                &format!(
                    "Thank you! A verification code has been sent to your <a href=\"{}\">email</a>.\nPlease enter it:",
                    self.settings.webmail_url
                ),
            )
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(key = %ctx.key()))]
    async fn handle_otp(
        self: Arc<Self>,
        ctx: FsmContext,
        msg: IncomingMessage,
        messenger: Arc<dyn Messenger>,
    ) -> Result<(), DialogError> {
        let data = ctx.data().await?;
        let login = data.login.ok_or(DialogError::MissingData("login"))?;
        let code = data.code.ok_or(DialogError::MissingData("code"))?;

        let candidate = msg.text.as_deref().unwrap_or_default().trim();
        let well_formed = candidate.len() == self.settings.code_length
            && candidate.chars().all(|c| c.is_ascii_digit());
        if !well_formed {
            messenger
                .send_text(
                    msg.chat_id,
                    &format!(
                        "The code consists of {} digits. Please enter the code again:",
                        self.settings.code_length
                    ),
                )
                .await?;
            return Ok(());
        }

        if candidate != code {
            log::info!("{}: wrong verification code", ctx.key());
            messenger.send_text(msg.chat_id, WRONG_CODE).await?;
            return Ok(());
        }

        let stale_reply = match self.codes.find_by_user_id(msg.user_id).await {
            Ok(record) if record.code != code => Some(CODE_SUPERSEDED),
            Ok(record) if record.is_expired(Utc::now()) => {
                self.codes.delete(msg.user_id, &code).await?;
                Some(CODE_EXPIRED)
            }
            Ok(_) => None,
            Err(e) if e.is_not_found() => Some(CODE_EXPIRED),
            Err(e) => return Err(e.into()),
        };
        if let Some(reply) = stale_reply {
            log::info!("{}: verification code for {} is no longer valid", ctx.key(), login);
            ctx.clear_data().await?;
            ctx.set(RegistrationState::AwaitingLogin).await?;
            messenger.send_text(msg.chat_id, reply).await?;
            return Ok(());
        }

        let user = self
            .users
            .update_or_create(NewUser {
                telegram_id: msg.user_id,
                login: login.clone(),
                role: Role::USER,
            })
            .await?;
        self.codes.delete(msg.user_id, &code).await?;

        ctx.clear_data().await?;
        ctx.set_data(DataField::Login, login.as_str()).await?;
        ctx.set(RegistrationState::Registered).await?;
        log::info!("{}: registered {}", ctx.key(), user);

        messenger
            .send_text(
                msg.chat_id,
                &format!("Registration complete! Welcome, {login}!"),
            )
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(key = %ctx.key()))]
    async fn handle_registered(
        self: Arc<Self>,
        ctx: FsmContext,
        msg: IncomingMessage,
        messenger: Arc<dyn Messenger>,
    ) -> Result<(), DialogError> {
        let login = ctx
            .get_data(DataField::Login)
            .await?
            .ok_or(DialogError::MissingData("login"))?;

        let user = self
            .users
            .update_or_create(NewUser {
                telegram_id: msg.user_id,
                login: login.clone(),
                role: Role::USER,
            })
            .await?;

        if user.role.is_blocked() {
            messenger.send_text(msg.chat_id, ACCOUNT_BLOCKED).await?;
        } else {
            messenger
                .send_text(msg.chat_id, &format!("Hi {login}! You are already registered."))
                .await?;
        }
        Ok(())
    }
}

async fn handle_default(
    _ctx: FsmContext,
    msg: IncomingMessage,
    messenger: Arc<dyn Messenger>,
) -> Result<(), DialogError> {
    messenger.send_text(msg.chat_id, DEFAULT_REPLY).await?;
    Ok(())
}
