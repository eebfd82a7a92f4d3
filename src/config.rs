//! Layered configuration.
//!
//! Merge order, later wins: built-in defaults, the YAML file, `QUIZBOT_*`
//! variables (nested with `__`, e.g. `QUIZBOT_EMAIL__HOST`), then the plain
//! `TELOXIDE_TOKEN` and `DATABASE_URL` variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "./config/prod.yml";
const MAX_CODE_TTL_SECS: u64 = 7 * 24 * 60 * 60;
// Width of `verification_codes.code`.
const MAX_CODE_LENGTH: usize = 16;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Local,
    Dev,
    #[default]
    Prod,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub env: Environment,
    pub bot: BotConfig,
    pub database: DatabaseConfig,
    pub state_store: StateStoreConfig,
    pub email: EmailConfig,
    pub registration: RegistrationConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub token: String,
    /// Public URL Telegram should post updates to. Long polling when unset.
    pub webhook_url: Option<url::Url>,
    pub webhook_addr: Option<std::net::SocketAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateStoreConfig {
    pub backend: StateBackend,
    pub cleanup_interval_secs: u64,
    pub redis_url: Option<String>,
    pub key_prefix: String,
    pub expiry_secs: u64,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            backend: StateBackend::Memory,
            cleanup_interval_secs: 60,
            redis_url: None,
            key_prefix: "fsm:".into(),
            expiry_secs: 24 * 60 * 60,
        }
    }
}

impl StateStoreConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_secs)
    }
}

/// What happens to the dialog when the verification email cannot be sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailFailurePolicy {
    /// Log the failure and move on to the code prompt anyway.
    #[default]
    Continue,
    /// Stay on the login step and ask the user to try again.
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from_email: String,
    pub from_name: Option<String>,
    pub domain: String,
    pub address_prefix: String,
    pub template_dir: PathBuf,
    /// Log emails instead of delivering them.
    pub debug: bool,
    pub timeout_secs: u64,
    pub failure_policy: EmailFailurePolicy,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 587,
            username: None,
            password: None,
            from_email: "noreply@bsu.by".into(),
            from_name: Some("Quiz Platform".into()),
            domain: "bsu.by".into(),
            address_prefix: "rct.".into(),
            template_dir: PathBuf::from("templates/email"),
            debug: false,
            timeout_secs: 15,
            failure_policy: EmailFailurePolicy::Continue,
        }
    }
}

impl EmailConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    pub login_prefixes: Vec<String>,
    pub code_length: usize,
    pub code_ttl_secs: u64,
    pub webmail_url: String,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            login_prefixes: vec!["rct.".into(), "bio.".into()],
            code_length: crate::otp::DEFAULT_CODE_LENGTH,
            code_ttl_secs: 30 * 60,
            webmail_url: "https://webmail.bsu.by/owa/#path=/mail".into(),
        }
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let config: Config = base()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("QUIZBOT_").split("__"))
            .merge(Env::raw().only(&["TELOXIDE_TOKEN"]).map(|_| "bot.token".into()))
            .merge(Env::raw().only(&["DATABASE_URL"]).map(|_| "database.url".into()))
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults merged with a YAML document, without environment overrides.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = base().merge(Yaml::string(yaml)).extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bot.token.trim().is_empty() {
            return Err(ConfigError::Invalid("bot.token (TELOXIDE_TOKEN) must be set".into()));
        }
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::Invalid("database.url (DATABASE_URL) must be set".into()));
        }
        if !(1..=MAX_CODE_LENGTH).contains(&self.registration.code_length) {
            return Err(ConfigError::Invalid(format!(
                "registration.code_length must be between 1 and {MAX_CODE_LENGTH}"
            )));
        }
        if self.email.timeout_secs == 0 {
            return Err(ConfigError::Invalid("email.timeout_secs must be positive".into()));
        }
        if !(1..=MAX_CODE_TTL_SECS).contains(&self.registration.code_ttl_secs) {
            return Err(ConfigError::Invalid(format!(
                "registration.code_ttl_secs must be between 1 and {MAX_CODE_TTL_SECS}"
            )));
        }
        if self.registration.login_prefixes.is_empty() {
            return Err(ConfigError::Invalid("registration.login_prefixes must not be empty".into()));
        }
        if self.state_store.backend == StateBackend::Redis && self.state_store.redis_url.is_none() {
            return Err(ConfigError::Invalid(
                "state_store.redis_url is required for the redis backend".into(),
            ));
        }
        if self.bot.webhook_url.is_some() != self.bot.webhook_addr.is_some() {
            return Err(ConfigError::Invalid(
                "bot.webhook_url and bot.webhook_addr must be set together".into(),
            ));
        }
        Ok(())
    }
}

fn base() -> Figment {
    Figment::from(Serialized::defaults(Config::default()))
}
